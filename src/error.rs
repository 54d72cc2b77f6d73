//! Error types for the guidance pipeline.
//!
//! This module provides structured error handling for vimarsh-core operations,
//! including categorization, severity levels, retry guidance, and the single
//! mapping from internal errors to HTTP status codes.
//!
//! # Error Families
//!
//! Each concern owns its own error enum:
//! - [`AuthError`]: token extraction and validation failures
//! - [`AuthzError`]: role and scope failures
//! - [`RateError`]: rate limiting and block-list rejections
//! - [`InputError`]: sanitization failures
//! - [`BudgetError`]: budget cap and block-list denials
//! - [`ProviderError`]: LLM provider failures (recovered internally)
//! - [`StorageError`]: dual-store read/write failures
//! - [`ConfigError`]: startup configuration failures
//!
//! All families roll up into [`CoreError`], which is what the pipeline
//! returns and what the HTTP edge translates exactly once.
//!
//! # Error Handling Example
//!
//! ```rust,no_run
//! use vimarsh_core::error::{CoreError, ErrorCategory};
//!
//! fn handle_error(err: CoreError) {
//!     if err.is_retryable() {
//!         println!("Retryable error: {}", err);
//!     }
//!
//!     // Get the message safe to show callers
//!     let user_msg = err.user_message(false);
//!     println!("Tell user: {}", user_msg);
//!
//!     match err.category() {
//!         ErrorCategory::Transient => println!("Temporary issue, try again later"),
//!         ErrorCategory::Client => println!("Fix the request and try again"),
//!         _ => println!("System issue, contact support"),
//!     }
//! }
//! ```
//!
//! # Result Type
//!
//! Use [`CoreResult<T>`] as a convenient alias for `Result<T, CoreError>`.

use crate::logging::{log_error, log_warn};
use thiserror::Error;

// ============================================================================
// Error categorization types
// ============================================================================

/// High-level categorization of errors for routing and handling decisions.
///
/// Use [`CoreError::category()`] to get the category for any error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// External service failures (LLM provider, remote store, JWKS endpoint).
    External,

    /// Internal system errors (bugs, invariant violations, storage faults).
    Internal,

    /// Client errors (bad token, invalid input, exceeded budget).
    Client,

    /// Temporary failures that should be retried with backoff.
    Transient,
}

/// Severity level for logging and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// System is unusable or data integrity is at risk.
    Critical,

    /// Action failed but system is stable.
    Error,

    /// Unexpected but recoverable situation.
    Warning,

    /// Expected failure (e.g., budget denial, validation error).
    Info,
}

/// Convenient result type for pipeline operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

// ============================================================================
// Per-concern error families
// ============================================================================

/// Authentication failures. Mapped to HTTP 401 at the edge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization: Bearer` header was present on the request.
    #[error("No bearer token provided")]
    NoToken,

    /// The token's `exp` claim is in the past.
    #[error("Token expired at {expired_at}")]
    TokenExpired {
        /// Unix timestamp the token expired at.
        expired_at: i64,
    },

    /// The token failed signature verification or structural decoding.
    #[error("Token invalid: {message}")]
    TokenInvalid {
        /// Details about the validation failure.
        message: String,
    },

    /// No signing key with the token's `kid` exists in the provider's JWKS.
    #[error("Signing key not found: {key_id}")]
    KeyNotFound {
        /// The key id the token named.
        key_id: String,
    },

    /// The token's `iss` claim does not match the expected issuer pattern.
    #[error("Issuer invalid: {issuer}")]
    IssuerInvalid {
        /// The issuer the token carried.
        issuer: String,
    },

    /// The token's `aud` claim matched none of the accepted audiences.
    #[error("Audience invalid: {audience}")]
    AudienceInvalid {
        /// The audience the token carried.
        audience: String,
    },

    /// A claim the profile requires was absent from the token.
    #[error("Required claim missing: {claim}")]
    ClaimsMissing {
        /// Name of the missing claim.
        claim: String,
    },
}

impl AuthError {
    /// Create a token-invalid error (logs at WARN level).
    pub fn token_invalid(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "token_invalid",
            message = %message,
            "Bearer token failed validation"
        );
        Self::TokenInvalid { message }
    }

    /// Create a key-not-found error (logs at WARN level).
    pub fn key_not_found(key_id: impl Into<String>) -> Self {
        let key_id = key_id.into();
        log_warn!(
            error_type = "key_not_found",
            key_id = %key_id,
            "No JWKS entry matches token key id"
        );
        Self::KeyNotFound { key_id }
    }
}

/// Authorization failures. Mapped to HTTP 403 at the edge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// The authenticated user's role is below the endpoint's requirement.
    #[error("Insufficient role: {required} required, {actual} held")]
    InsufficientRole {
        /// Role the endpoint requires.
        required: String,
        /// Role the caller holds.
        actual: String,
    },

    /// The authenticated user lacks a specific permission.
    #[error("Insufficient scope: {permission}")]
    InsufficientScope {
        /// The missing permission.
        permission: String,
    },
}

/// Rate limiting failures. Mapped to HTTP 403 at the edge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    /// The identifier is on the temporary block list.
    #[error("Identifier blocked for {remaining_seconds}s")]
    IpBlocked {
        /// Seconds until the block expires.
        remaining_seconds: u64,
    },

    /// The identifier exceeded its per-minute window.
    #[error("Rate limit exceeded: {limit} requests per minute")]
    RateLimitExceeded {
        /// The window limit that was exceeded.
        limit: u32,
    },
}

/// Input sanitization failures. Mapped to HTTP 400 at the edge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// A string exceeded its maximum length.
    #[error("Input too long: {actual} > {max}")]
    TooLong {
        /// Actual length observed.
        actual: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// A field failed its format rule (alphanumeric, parameter map, etc.).
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field that failed.
        field: String,
        /// Details about the failure.
        message: String,
    },

    /// An email failed the local@host pattern or length cap.
    #[error("Invalid email address")]
    InvalidEmail,

    /// A UUID failed the canonical 8-4-4-4-12 hex pattern.
    #[error("Invalid UUID")]
    InvalidUuid,
}

/// Budget denials. Mapped to HTTP 403 with a personality-flavored body.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    /// Estimated cost exceeds the per-request cap.
    #[error("Per-request budget exceeded: estimated ${estimated:.6} > ${limit:.2}")]
    PerRequestExceeded {
        /// Estimated request cost in USD.
        estimated: f64,
        /// Per-request cap in USD.
        limit: f64,
    },

    /// Today's usage plus the estimate exceeds the daily cap.
    #[error("Daily budget exceeded: ${used:.6} used of ${limit:.2}")]
    DailyExceeded {
        /// Cost already spent today in USD.
        used: f64,
        /// Daily cap in USD.
        limit: f64,
    },

    /// Month-to-date usage plus the estimate exceeds the monthly cap.
    #[error("Monthly budget exceeded: ${used:.6} used of ${limit:.2}")]
    MonthlyExceeded {
        /// Cost already spent this month in USD.
        used: f64,
        /// Monthly cap in USD.
        limit: f64,
    },

    /// The user is on the budget block list.
    #[error("User blocked: {reason}")]
    UserBlocked {
        /// Why the user was blocked.
        reason: String,
    },
}

/// LLM provider failures. Recovered internally by the dispatcher; the
/// terminal case becomes a fallback-quality response, still HTTP 200.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider did not answer within the personality's deadline.
    #[error("Provider timed out after {timeout_seconds}s")]
    Timeout {
        /// The deadline that was exceeded.
        timeout_seconds: u64,
    },

    /// The provider answered with empty content.
    #[error("Provider returned an empty response")]
    Empty,

    /// The HTTP exchange with the provider failed.
    #[error("Provider transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProviderError {
    /// Create a transport error (logs at WARN level; the dispatcher retries).
    pub fn transport(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "provider_transport",
            message = %message,
            has_source = source.is_some(),
            "LLM provider request failed"
        );
        Self::Transport { message, source }
    }
}

/// Dual-store failures. Reads map to HTTP 500; writes after a served
/// response trigger rollback plus a critical audit log instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A store write could not be completed.
    #[error("Storage unavailable: {message}")]
    Unavailable {
        /// Details about the failure.
        message: String,
    },

    /// A read missed the requested record.
    #[error("Record not found: {collection}/{id}")]
    NotFound {
        /// Collection that was read.
        collection: String,
        /// Id that missed.
        id: String,
    },

    /// Concurrent rewrite detected on the local store.
    #[error("Write conflict on collection {collection}")]
    Conflict {
        /// Collection the conflict occurred on.
        collection: String,
    },
}

impl StorageError {
    /// Create an unavailable error (logs at ERROR level).
    pub fn unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "storage_unavailable",
            message = %message,
            "Store operation failed"
        );
        Self::Unavailable { message }
    }
}

/// Configuration failures. The process refuses to start on critical
/// sections; non-critical ones degrade with a fallback flag.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("Missing configuration: {key}")]
    Missing {
        /// The missing key.
        key: String,
    },

    /// A setting is present but unusable.
    #[error("Invalid configuration for {key}: {message}")]
    Invalid {
        /// The offending key.
        key: String,
        /// Why it is invalid.
        message: String,
    },
}

// ============================================================================
// Top-level error
// ============================================================================

/// Unified error type returned by the guidance pipeline.
///
/// Every layer returns its own typed family upward; the pipeline wraps them
/// here, and the HTTP edge calls [`status_code()`](Self::status_code) exactly
/// once to build the response. Nothing below the edge constructs HTTP.
///
/// # Error Categories
///
/// | Variant | Category | HTTP |
/// |---------|----------|------|
/// | `Auth` | Client | 401 |
/// | `Authz` | Client | 403 |
/// | `Rate` | Client | 403 |
/// | `Input` | Client | 400 |
/// | `Budget` | Client | 403 |
/// | `Provider` | Transient | 200 (fallback) |
/// | `Storage` | Internal | 500 |
/// | `Config` | Internal | 500 |
#[derive(Error, Debug)]
pub enum CoreError {
    /// Authentication failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Authorization failure.
    #[error(transparent)]
    Authz(#[from] AuthzError),

    /// Rate limiting failure.
    #[error(transparent)]
    Rate(#[from] RateError),

    /// Input sanitization failure.
    #[error(transparent)]
    Input(#[from] InputError),

    /// Budget denial.
    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// Provider failure that escaped the dispatcher's recovery.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Get the error category for routing and handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(_) | Self::Authz(_) | Self::Rate(_) | Self::Input(_) | Self::Budget(_) => {
                ErrorCategory::Client
            }
            Self::Provider(ProviderError::Transport { .. }) => ErrorCategory::External,
            Self::Provider(_) => ErrorCategory::Transient,
            Self::Storage(_) | Self::Config(_) => ErrorCategory::Internal,
        }
    }

    /// Get the error severity for logging and alerting.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Auth(_) | Self::Authz(_) | Self::Rate(_) | Self::Input(_) => ErrorSeverity::Info,
            Self::Budget(BudgetError::UserBlocked { .. }) => ErrorSeverity::Warning,
            Self::Budget(_) => ErrorSeverity::Info,
            Self::Provider(_) => ErrorSeverity::Warning,
            Self::Storage(StorageError::NotFound { .. }) => ErrorSeverity::Info,
            Self::Storage(_) => ErrorSeverity::Critical,
            Self::Config(_) => ErrorSeverity::Error,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Timeout { .. })
                | Self::Provider(ProviderError::Empty)
                | Self::Provider(ProviderError::Transport { .. })
        )
    }

    /// The stable machine-readable code attached to every error response.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Auth(AuthError::NoToken) => "AUTH_NO_TOKEN",
            Self::Auth(AuthError::TokenExpired { .. }) => "AUTH_TOKEN_EXPIRED",
            Self::Auth(AuthError::TokenInvalid { .. }) => "AUTH_TOKEN_INVALID",
            Self::Auth(AuthError::KeyNotFound { .. }) => "AUTH_KEY_NOT_FOUND",
            Self::Auth(AuthError::IssuerInvalid { .. }) => "AUTH_ISSUER_INVALID",
            Self::Auth(AuthError::AudienceInvalid { .. }) => "AUTH_AUDIENCE_INVALID",
            Self::Auth(AuthError::ClaimsMissing { .. }) => "AUTH_CLAIMS_MISSING",
            Self::Authz(AuthzError::InsufficientRole { .. }) => "AUTHZ_ROLE",
            Self::Authz(AuthzError::InsufficientScope { .. }) => "AUTHZ_SCOPE",
            Self::Rate(RateError::IpBlocked { .. }) => "RATE_BLOCKED",
            Self::Rate(RateError::RateLimitExceeded { .. }) => "RATE_EXCEEDED",
            Self::Input(InputError::TooLong { .. }) => "INPUT_TOO_LONG",
            Self::Input(InputError::InvalidFormat { .. }) => "INPUT_FORMAT",
            Self::Input(InputError::InvalidEmail) => "INPUT_EMAIL",
            Self::Input(InputError::InvalidUuid) => "INPUT_UUID",
            Self::Budget(BudgetError::PerRequestExceeded { .. }) => "BUDGET_REQUEST",
            Self::Budget(BudgetError::DailyExceeded { .. }) => "BUDGET_DAILY",
            Self::Budget(BudgetError::MonthlyExceeded { .. }) => "BUDGET_MONTHLY",
            Self::Budget(BudgetError::UserBlocked { .. }) => "BUDGET_BLOCKED",
            Self::Provider(ProviderError::Timeout { .. }) => "PROVIDER_TIMEOUT",
            Self::Provider(ProviderError::Empty) => "PROVIDER_EMPTY",
            Self::Provider(ProviderError::Transport { .. }) => "PROVIDER_TRANSPORT",
            Self::Storage(StorageError::Unavailable { .. }) => "STORAGE_UNAVAILABLE",
            Self::Storage(StorageError::NotFound { .. }) => "STORAGE_NOT_FOUND",
            Self::Storage(StorageError::Conflict { .. }) => "STORAGE_CONFLICT",
            Self::Config(ConfigError::Missing { .. }) => "CONFIG_MISSING",
            Self::Config(ConfigError::Invalid { .. }) => "CONFIG_INVALID",
        }
    }

    /// The HTTP status code the edge maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth(_) => 401,
            Self::Authz(_) | Self::Rate(_) | Self::Budget(_) => 403,
            Self::Input(_) => 400,
            Self::Provider(_) | Self::Storage(_) | Self::Config(_) => 500,
        }
    }

    /// Convert to a message suitable for the caller.
    ///
    /// In development mode the detailed message is returned; otherwise
    /// the message collapses to `"Access denied"` / `"Internal error"`.
    pub fn user_message(&self, development_mode: bool) -> String {
        if development_mode {
            return self.to_string();
        }
        match self.status_code() {
            400 | 401 | 403 => "Access denied".to_string(),
            _ => "Internal error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_edge_contract() {
        assert_eq!(CoreError::from(AuthError::NoToken).status_code(), 401);
        assert_eq!(
            CoreError::from(AuthzError::InsufficientScope {
                permission: "can_access_admin_endpoints".to_string(),
            })
            .status_code(),
            403
        );
        assert_eq!(
            CoreError::from(RateError::RateLimitExceeded { limit: 100 }).status_code(),
            403
        );
        assert_eq!(
            CoreError::from(InputError::InvalidEmail).status_code(),
            400
        );
        assert_eq!(
            CoreError::from(BudgetError::UserBlocked {
                reason: "monthly budget exhausted".to_string(),
            })
            .status_code(),
            403
        );
        assert_eq!(
            CoreError::from(StorageError::unavailable("disk full")).status_code(),
            500
        );
    }

    #[test]
    fn test_production_messages_hide_detail() {
        let err = CoreError::from(AuthError::token_invalid("signature mismatch"));
        assert_eq!(err.user_message(false), "Access denied");
        assert!(err.user_message(true).contains("signature mismatch"));

        let err = CoreError::from(StorageError::unavailable("cosmos 503"));
        assert_eq!(err.user_message(false), "Internal error");
    }

    #[test]
    fn test_provider_errors_are_retryable() {
        assert!(CoreError::from(ProviderError::Empty).is_retryable());
        assert!(CoreError::from(ProviderError::Timeout { timeout_seconds: 20 }).is_retryable());
        assert!(!CoreError::from(AuthError::NoToken).is_retryable());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            CoreError::from(BudgetError::MonthlyExceeded {
                used: 49.80,
                limit: 50.0,
            })
            .error_code(),
            "BUDGET_MONTHLY"
        );
        assert_eq!(CoreError::from(ProviderError::Empty).error_code(), "PROVIDER_EMPTY");
    }

    #[test]
    fn test_storage_write_failures_are_critical() {
        let err = CoreError::from(StorageError::unavailable("remote upsert failed"));
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.category(), ErrorCategory::Internal);
    }
}
