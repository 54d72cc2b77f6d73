//! Concurrent LLM dispatch with timeout, retry, and fallback.
//!
//! Each attempt runs under the personality's hard deadline; up to
//! `max_retries + 1` attempts are made with progressive backoff of
//! `1 * attempt` seconds (plus jitter to avoid thundering herds). An empty
//! provider response counts as a failed attempt. When the final attempt
//! fails, the dispatcher returns a canned fallback beginning with the
//! personality's greeting, tagged `quality=fallback`. The character budget
//! is enforced on every outcome: content over `max_chars` truncates to
//! `max_chars - 3` plus `"..."`.

use crate::error::ProviderError;
use crate::llm::provider::{GenerationBackend, GenerationOutcome};
use crate::logging::{log_debug, log_warn};
use crate::personality::registry::Personality;
use crate::records::QualityClass;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// A generation with its serving metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedResponse {
    /// Final text, within the personality's character budget.
    pub content: String,
    /// Quality class of the outcome.
    pub quality: QualityClass,
    /// Attempts consumed (0 when the backend was unavailable).
    pub attempts: u32,
    /// Model name.
    pub model: String,
    /// Wall-clock serving time.
    pub response_time_ms: u64,
    /// Prompt-side tokens (0 on fallback).
    pub input_tokens: u32,
    /// Completion-side tokens (0 on fallback).
    pub output_tokens: u32,
    /// Whether the personality expects citations.
    pub citations_expected: bool,
}

/// The only component that calls the LLM provider.
#[derive(Debug, Clone)]
pub struct LlmDispatcher {
    backend: Arc<dyn GenerationBackend>,
    max_tokens: u32,
    temperature: f64,
    backoff_base: Duration,
}

impl LlmDispatcher {
    /// Create a dispatcher over a backend with the configured generation
    /// parameters.
    pub fn new(backend: Arc<dyn GenerationBackend>, max_tokens: u32, temperature: f64) -> Self {
        Self {
            backend,
            max_tokens,
            temperature,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Shrink the backoff base (tests).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Generate a response for the personality, honoring its timeout,
    /// retry, and character-budget contract.
    pub async fn generate(&self, personality: &Personality, prompt: &str) -> DispatchedResponse {
        let start = Instant::now();

        if !self.backend.is_available() {
            log_debug!(
                personality = %personality.id,
                "Backend unavailable, serving canned fallback"
            );
            return self.fallback(personality, 0, start);
        }

        let max_attempts = personality.max_retries + 1;
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=max_attempts {
            let result = tokio::time::timeout(
                personality.timeout(),
                self.backend
                    .generate(prompt, self.max_tokens, self.temperature),
            )
            .await;

            match result {
                Ok(Ok(outcome)) if !outcome.content.trim().is_empty() => {
                    return self.shape(personality, outcome, attempt, start);
                }
                Ok(Ok(_)) => {
                    log_warn!(
                        personality = %personality.id,
                        attempt = attempt,
                        "Provider returned empty content"
                    );
                    last_error = Some(ProviderError::Empty);
                }
                Ok(Err(error)) => {
                    last_error = Some(error);
                }
                Err(_elapsed) => {
                    log_warn!(
                        personality = %personality.id,
                        attempt = attempt,
                        timeout_seconds = personality.timeout_seconds,
                        "Provider attempt timed out"
                    );
                    last_error = Some(ProviderError::Timeout {
                        timeout_seconds: personality.timeout_seconds,
                    });
                }
            }

            if attempt < max_attempts {
                sleep(self.backoff_delay(attempt)).await;
            }
        }

        log_warn!(
            personality = %personality.id,
            attempts = max_attempts,
            error = ?last_error,
            "All provider attempts failed, serving canned fallback"
        );
        self.fallback(personality, max_attempts, start)
    }

    /// Progressive backoff: `base * attempt`, with up to 10% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_secs_f64() * f64::from(attempt);
        let jitter = fastrand::f64() * 0.1;
        Duration::from_secs_f64(base * (1.0 + jitter))
    }

    fn shape(
        &self,
        personality: &Personality,
        outcome: GenerationOutcome,
        attempts: u32,
        start: Instant,
    ) -> DispatchedResponse {
        let (content, truncated) = enforce_char_budget(&outcome.content, personality.max_chars);
        DispatchedResponse {
            content,
            quality: if truncated {
                QualityClass::Medium
            } else {
                QualityClass::High
            },
            attempts,
            model: outcome.model,
            response_time_ms: start.elapsed().as_millis() as u64,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            citations_expected: personality.citations_required,
        }
    }

    fn fallback(
        &self,
        personality: &Personality,
        attempts: u32,
        start: Instant,
    ) -> DispatchedResponse {
        let (content, _) = enforce_char_budget(
            &personality.fallback_response(),
            personality.max_chars,
        );
        DispatchedResponse {
            content,
            quality: QualityClass::Fallback,
            attempts,
            model: self.backend.model_name().to_string(),
            response_time_ms: start.elapsed().as_millis() as u64,
            input_tokens: 0,
            output_tokens: 0,
            citations_expected: personality.citations_required,
        }
    }
}

/// Truncate `content` to `max_chars - 3` plus `"..."` when it exceeds the
/// budget. Content at exactly the budget passes unchanged.
pub fn enforce_char_budget(content: &str, max_chars: usize) -> (String, bool) {
    let count = content.chars().count();
    if count <= max_chars {
        return (content.to_string(), false);
    }
    let kept: String = content.chars().take(max_chars.saturating_sub(3)).collect();
    (format!("{kept}..."), true)
}
