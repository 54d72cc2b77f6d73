//! Configuration types for the guidance backend.
//!
//! This module resolves all settings from the process environment into typed
//! sections, validates each section independently, and auto-detects the
//! runtime mode. It is the ONLY module that reads environment variables.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use vimarsh_core::config::CoreConfig;
//!
//! let config = CoreConfig::from_env()?;
//! assert!(config.validation().critical_ok());
//! # Ok::<(), vimarsh_core::error::ConfigError>(())
//! ```
//!
//! # Degradation Rules
//!
//! | Section | Missing/invalid settings | Effect |
//! |---------|--------------------------|--------|
//! | LLM | no `GEMINI_API_KEY` | canned-fallback mode, flagged |
//! | Storage | no `COSMOS_DB_ENDPOINT` | local-only store mode, flagged |
//! | Auth | enabled without tenant/client | refuses to start |
//! | Budgets | unparseable numbers | refuses to start |
//!
//! # Mode Auto-Detection
//!
//! Auth is forced on when `ENVIRONMENT=production` OR the hosting platform
//! variable (`AZURE_FUNCTIONS_ENVIRONMENT=Production`) indicates production,
//! regardless of `ENABLE_AUTH`.

use crate::error::ConfigError;
use crate::logging::{log_debug, log_info, log_warn};
use serde::{Deserialize, Serialize};

/// Runtime mode, auto-detected from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: test tokens accepted, local-only store allowed.
    Development,
    /// Production: auth forced on, remote-primary store expected.
    Production,
}

impl Environment {
    /// Whether this is the development mode.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Storage endpoints for the dual store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the local JSON collections.
    pub local_dir: String,
    /// Remote document-store endpoint; absent means local-only mode.
    pub remote_endpoint: Option<String>,
    /// Remote document-store key.
    pub remote_key: Option<String>,
}

impl StorageConfig {
    /// Whether the remote store is configured and writes go remote-primary.
    pub fn remote_primary(&self) -> bool {
        self.remote_endpoint.is_some() && self.remote_key.is_some()
    }
}

/// LLM provider credentials and generation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider API key; absent means canned-fallback mode.
    pub api_key: Option<String>,
    /// Model name used for generation and pricing lookups.
    pub model: String,
    /// Maximum tokens requested per generation.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
}

/// Identity provider settings for the production auth path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Whether bearer-token validation is enforced.
    pub enabled: bool,
    /// Identity provider tenant id.
    pub tenant_id: Option<String>,
    /// Application (client) id; the primary accepted audience.
    pub client_id: Option<String>,
    /// Issuer authority base; derived from the tenant when absent.
    pub authority: Option<String>,
}

impl AuthConfig {
    /// The JWKS document URL for the configured tenant.
    pub fn jwks_url(&self) -> Option<String> {
        let authority = self.authority.clone().or_else(|| {
            self.tenant_id
                .as_ref()
                .map(|t| format!("https://login.microsoftonline.com/{t}"))
        })?;
        Some(format!("{authority}/discovery/v2.0/keys"))
    }

    /// The issuer pattern tokens must match.
    pub fn expected_issuer(&self) -> Option<String> {
        let tenant = self.tenant_id.as_ref()?;
        Some(format!("https://login.microsoftonline.com/{tenant}/v2.0"))
    }
}

/// Monitoring and diagnostics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Log level filter string (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: String,
}

/// Application-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Language used when a request does not name one.
    pub default_language: String,
    /// Languages responses may be requested in.
    pub supported_languages: Vec<String>,
}

/// Default budget caps materialized for users without explicit limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetDefaults {
    /// Monthly cap in USD.
    pub monthly_usd: f64,
    /// Daily cap in USD.
    pub daily_usd: f64,
    /// Per-request cap in USD.
    pub per_request_usd: f64,
}

impl Default for BudgetDefaults {
    fn default() -> Self {
        Self {
            monthly_usd: 50.0,
            daily_usd: 5.0,
            per_request_usd: 0.50,
        }
    }
}

/// Per-section validation outcome, reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionState {
    /// Fully configured.
    Valid,
    /// Usable but running degraded (e.g. canned-fallback LLM).
    Fallback,
    /// Unusable; only possible for non-critical sections after startup.
    Invalid,
}

/// Validation summary across sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigValidation {
    /// LLM section state.
    pub llm: SectionState,
    /// Storage section state.
    pub storage: SectionState,
    /// Auth section state.
    pub auth: SectionState,
    /// Budget section state.
    pub budgets: SectionState,
}

impl ConfigValidation {
    /// Whether every critical section permits startup.
    pub fn critical_ok(&self) -> bool {
        self.auth != SectionState::Invalid && self.budgets != SectionState::Invalid
    }
}

/// Complete resolved configuration for the guidance backend.
///
/// Build with [`from_env()`](Self::from_env); every other constructor is for
/// tests. Sections are immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Auto-detected runtime mode.
    pub environment: Environment,
    /// Dual-store endpoints.
    pub storage: StorageConfig,
    /// LLM provider settings.
    pub llm: LlmConfig,
    /// Identity provider settings.
    pub auth: AuthConfig,
    /// Monitoring settings.
    pub monitoring: MonitoringConfig,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Application defaults.
    pub app: AppConfig,
    /// Default budget caps.
    pub budget_defaults: BudgetDefaults,
    /// Admin email allow-list (lowercased).
    pub admin_emails: Vec<String>,
    /// Super-admin email allow-list (lowercased).
    pub super_admin_emails: Vec<String>,
    validation: ConfigValidation,
}

impl CoreConfig {
    /// Load configuration from environment variables.
    /// This is the ONLY method that should access environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a critical section cannot be
    /// validated (auth enabled without tenant/client, unparseable budget
    /// numbers). Non-critical sections degrade instead of failing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_name = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let hosting = std::env::var("AZURE_FUNCTIONS_ENVIRONMENT").unwrap_or_default();
        let environment = if env_name.eq_ignore_ascii_case("production")
            || hosting.eq_ignore_ascii_case("production")
        {
            Environment::Production
        } else {
            Environment::Development
        };

        let auth_flag = std::env::var("ENABLE_AUTH")
            .or_else(|_| std::env::var("AUTH_MODE"))
            .map(|v| {
                matches!(
                    v.to_lowercase().as_str(),
                    "1" | "true" | "enabled" | "production"
                )
            })
            .unwrap_or(false);

        let auth = AuthConfig {
            // Production forces auth on regardless of the flag.
            enabled: auth_flag || environment == Environment::Production,
            tenant_id: std::env::var("AZURE_TENANT_ID").ok(),
            client_id: std::env::var("ENTRA_CLIENT_ID").ok(),
            authority: std::env::var("ENTRA_AUTHORITY").ok(),
        };

        let storage = StorageConfig {
            local_dir: std::env::var("LOCAL_DB_DIR").unwrap_or_else(|_| "vimarsh-db".to_string()),
            remote_endpoint: std::env::var("COSMOS_DB_ENDPOINT").ok(),
            remote_key: std::env::var("COSMOS_DB_KEY").ok(),
        };

        let llm = LlmConfig {
            api_key: std::env::var("GEMINI_API_KEY").ok(),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            max_tokens: parse_env("MAX_TOKENS", 512)?,
            temperature: parse_env("LLM_TEMPERATURE", 0.7)?,
        };

        let budget_defaults = BudgetDefaults {
            monthly_usd: parse_env("DEFAULT_MONTHLY_BUDGET", 50.0)?,
            daily_usd: parse_env("DEFAULT_DAILY_BUDGET", 5.0)?,
            per_request_usd: parse_env("DEFAULT_REQUEST_BUDGET", 0.50)?,
        };

        let config = Self {
            environment,
            storage,
            llm,
            auth,
            monitoring: MonitoringConfig {
                log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
            cors_origins: split_list(
                &std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            ),
            app: AppConfig {
                default_language: "English".to_string(),
                supported_languages: vec!["English".to_string(), "Hindi".to_string()],
            },
            budget_defaults,
            admin_emails: split_emails(&std::env::var("ADMIN_EMAILS").unwrap_or_default()),
            super_admin_emails: split_emails(
                &std::env::var("SUPER_ADMIN_EMAILS").unwrap_or_default(),
            ),
            validation: ConfigValidation {
                llm: SectionState::Valid,
                storage: SectionState::Valid,
                auth: SectionState::Valid,
                budgets: SectionState::Valid,
            },
        };

        config.validate()
    }

    /// Validate all sections, recording fallback flags and refusing to
    /// proceed when a critical section is broken.
    fn validate(mut self) -> Result<Self, ConfigError> {
        if self.llm.api_key.is_none() {
            log_warn!(
                section = "llm",
                "No LLM API key configured, responses degrade to canned fallbacks"
            );
            self.validation.llm = SectionState::Fallback;
        }

        if !self.storage.remote_primary() {
            if self.environment == Environment::Production {
                log_warn!(
                    section = "storage",
                    "Remote store not configured in production, running local-only"
                );
            }
            self.validation.storage = SectionState::Fallback;
        }

        if self.auth.enabled
            && !self.environment.is_development()
            && (self.auth.tenant_id.is_none() || self.auth.client_id.is_none())
        {
            // Critical: production auth without an identity provider is unservable.
            return Err(ConfigError::Invalid {
                key: "AZURE_TENANT_ID/ENTRA_CLIENT_ID".to_string(),
                message: "auth is enabled but the identity provider is not configured".to_string(),
            });
        }

        let b = &self.budget_defaults;
        if b.monthly_usd <= 0.0 || b.daily_usd <= 0.0 || b.per_request_usd <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "DEFAULT_*_BUDGET".to_string(),
                message: "budget caps must be positive".to_string(),
            });
        }

        log_info!(
            environment = ?self.environment,
            auth_enabled = self.auth.enabled,
            remote_primary = self.storage.remote_primary(),
            llm_fallback = (self.validation.llm == SectionState::Fallback),
            "Configuration loaded and validated"
        );

        Ok(self)
    }

    /// Per-section validation summary.
    pub fn validation(&self) -> &ConfigValidation {
        &self.validation
    }

    /// Configuration suitable for tests: development mode, local-only store,
    /// canned-fallback LLM, auth disabled.
    pub fn for_development(local_dir: impl Into<String>) -> Self {
        Self {
            environment: Environment::Development,
            storage: StorageConfig {
                local_dir: local_dir.into(),
                remote_endpoint: None,
                remote_key: None,
            },
            llm: LlmConfig {
                api_key: None,
                model: "gemini-2.5-flash".to_string(),
                max_tokens: 512,
                temperature: 0.7,
            },
            auth: AuthConfig {
                enabled: false,
                tenant_id: None,
                client_id: None,
                authority: None,
            },
            monitoring: MonitoringConfig {
                log_level: "debug".to_string(),
            },
            cors_origins: vec!["*".to_string()],
            app: AppConfig {
                default_language: "English".to_string(),
                supported_languages: vec!["English".to_string(), "Hindi".to_string()],
            },
            budget_defaults: BudgetDefaults::default(),
            admin_emails: vec!["dev.admin@vimarsh.local".to_string()],
            super_admin_emails: vec!["dev.super@vimarsh.local".to_string()],
            validation: ConfigValidation {
                llm: SectionState::Fallback,
                storage: SectionState::Fallback,
                auth: SectionState::Valid,
                budgets: SectionState::Valid,
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            log_debug!(key = key, raw = %raw, "Environment value failed to parse");
            ConfigError::Invalid {
                key: key.to_string(),
                message: format!("cannot parse {raw:?}"),
            }
        }),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_emails(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}
