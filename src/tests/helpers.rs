//! Shared fixtures for pipeline-level tests.
//!
//! IMPORTANT: These helpers are test-only and should NEVER be used in
//! production code.

// Allow dead code in test utilities - functions are used across different test files
#![allow(dead_code)]

use crate::error::ProviderError;
use crate::llm::provider::{GenerationBackend, GenerationOutcome};
use crate::records::Chunk;
use crate::retrieval::embed::HashingEmbedder;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// The embedding dimension the development core uses.
pub const TEST_EMBED_DIM: usize = 128;

/// A corpus chunk embedded with the same hashing embedder the development
/// core queries with, so retrieval tests are deterministic.
pub fn embedded_chunk(id: &str, partition: &str, text: &str, source: &str) -> Chunk {
    let embedder = HashingEmbedder::new(TEST_EMBED_DIM);
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

/// Backend that records every prompt and pops scripted outcomes, failing
/// with `Empty` once the script runs out.
#[derive(Debug)]
pub struct RecordingBackend {
    script: Mutex<Vec<Result<GenerationOutcome, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicU32,
    hang: bool,
}

impl RecordingBackend {
    /// Script outcomes; the LAST element is served FIRST (pop order).
    pub fn scripted(script: Vec<Result<GenerationOutcome, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            hang: false,
        }
    }

    /// A backend that never answers (timeout path).
    pub fn hanging() -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            hang: true,
        }
    }

    /// A successful outcome with plausible token counts.
    pub fn outcome(text: &str) -> Result<GenerationOutcome, ProviderError> {
        Ok(GenerationOutcome {
            content: text.to_string(),
            input_tokens: 120,
            output_tokens: 60,
            model: "gemini-2.5-flash".to_string(),
        })
    }

    /// Provider calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every prompt the pipeline submitted, in order.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl GenerationBackend for RecordingBackend {
    async fn generate(
        &self,
        prompt: &str,
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<GenerationOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().await.push(prompt.to_string());
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.script
            .lock()
            .await
            .pop()
            .unwrap_or(Err(ProviderError::Empty))
    }

    fn model_name(&self) -> &str {
        "gemini-2.5-flash"
    }
}
