//! LLM invocation: the provider seam and the retrying dispatcher.

pub mod dispatcher;
pub mod provider;

pub use dispatcher::{DispatchedResponse, LlmDispatcher};
pub use provider::{CannedBackend, GeminiBackend, GenerationBackend, GenerationOutcome};
