//! Request security: rate limiting, input sanitization, and response
//! redaction, composed by the pipeline and the HTTP middleware.

pub mod rate_limiter;
pub mod redactor;
pub mod sanitizer;

pub use rate_limiter::{RateLimitScope, RateLimiter};
pub use redactor::Redactor;
pub use sanitizer::Sanitizer;
