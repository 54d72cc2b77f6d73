//! Test helper utilities for vimarsh-core integration tests
//!
//! This module provides reusable fixtures shared across the integration
//! test files.
//!
//! IMPORTANT: These helpers are test-only and should NEVER be used in production code.

// Allow dead code in test utilities - functions are used across different test files
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use std::sync::Arc;
use vimarsh_core::error::ProviderError;
use vimarsh_core::llm::{GenerationBackend, GenerationOutcome};
use vimarsh_core::records::Chunk;
use vimarsh_core::retrieval::{FlatVectorIndex, HashingEmbedder};
use vimarsh_core::GuidanceCore;

/// Dimension the development core's query embedder uses.
pub const EMBED_DIM: usize = 128;

/// Backend that always answers with one fixed text.
#[derive(Debug)]
pub struct StaticBackend {
    text: String,
}

impl StaticBackend {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl GenerationBackend for StaticBackend {
    async fn generate(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<GenerationOutcome, ProviderError> {
        Ok(GenerationOutcome {
            content: self.text.clone(),
            input_tokens: 100,
            output_tokens: 40,
            model: "gemini-2.5-flash".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        "gemini-2.5-flash"
    }
}

/// A chunk embedded with the development core's own embedder.
pub fn embedded_chunk(id: &str, partition: &str, text: &str, source: &str) -> Chunk {
    let embedder = HashingEmbedder::new(EMBED_DIM);
    Chunk {
        id: id.to_string(),
        text: text.to_string(),
        source: source.to_string(),
        section: None,
        key_terms: Vec::new(),
        citations: vec![source.to_string()],
        quality_score: 1.0,
        embedding: embedder.embed_sync(text),
        partition: partition.to_string(),
        created_at: Utc::now(),
    }
}

/// Build a development router over a static backend and optional corpus.
pub async fn dev_router(
    dir: &std::path::Path,
    backend_text: &str,
    corpus: Vec<Chunk>,
) -> (Router, Arc<GuidanceCore>) {
    let index = Arc::new(FlatVectorIndex::new());
    for chunk in corpus {
        index.add(chunk).await.expect("seed chunk");
    }
    let core = GuidanceCore::development_with_backend(
        dir,
        index,
        Arc::new(StaticBackend::new(backend_text)),
    )
    .expect("development core");
    (vimarsh_core::http::router(core.clone()), core)
}
