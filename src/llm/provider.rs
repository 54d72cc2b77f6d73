//! LLM provider backends.
//!
//! The dispatcher is the only component that calls out to the provider;
//! everything else treats generation as an opaque function behind
//! [`GenerationBackend`]. The HTTP backend speaks the Gemini generateContent
//! shape; the canned backend stands in when no credentials are configured.

use crate::error::ProviderError;
use crate::logging::log_debug;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    /// Generated text.
    pub content: String,
    /// Prompt-side token count reported by the provider.
    pub input_tokens: u32,
    /// Completion-side token count reported by the provider.
    pub output_tokens: u32,
    /// Model that generated the text.
    pub model: String,
}

/// Contract between the dispatcher and the LLM provider.
#[async_trait]
pub trait GenerationBackend: Send + Sync + std::fmt::Debug {
    /// Submit one prompt. The dispatcher wraps this in its own deadline.
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<GenerationOutcome, ProviderError>;

    /// The model name requests run against.
    fn model_name(&self) -> &str;

    /// Whether the backend can serve live generations at all. A backend
    /// without credentials reports false and the dispatcher goes straight
    /// to the canned fallback.
    fn is_available(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Gemini HTTP backend
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

/// HTTP backend for the Gemini generateContent API.
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    /// Create a backend for the given key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the backend at a different endpoint (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<GenerationOutcome, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: max_tokens,
                temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                ProviderError::transport(format!("provider request failed: {e}"), Some(Box::new(e)))
            })?;

        if !response.status().is_success() {
            return Err(ProviderError::transport(
                format!("provider returned {}", response.status()),
                None,
            ));
        }

        let body: GeminiResponse = response.json().await.map_err(|e| {
            ProviderError::transport(format!("provider response undecodable: {e}"), Some(Box::new(e)))
        })?;

        let content: String = body
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ProviderError::Empty);
        }

        let usage = body.usage_metadata.unwrap_or(GeminiUsage {
            prompt_token_count: 0,
            candidates_token_count: 0,
        });
        log_debug!(
            model = %self.model,
            input_tokens = usage.prompt_token_count,
            output_tokens = usage.candidates_token_count,
            "Provider generation succeeded"
        );

        Ok(GenerationOutcome {
            content,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Canned backend (no credentials)
// ---------------------------------------------------------------------------

/// Backend used when no LLM credentials are configured. Never generates;
/// the dispatcher serves the personality's canned fallback instead.
#[derive(Debug, Clone)]
pub struct CannedBackend {
    model: String,
}

impl CannedBackend {
    /// Create a canned backend that reports the given model name.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for CannedBackend {
    async fn generate(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<GenerationOutcome, ProviderError> {
        Err(ProviderError::transport("no provider configured", None))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn is_available(&self) -> bool {
        false
    }
}
