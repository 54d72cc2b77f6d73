//! # vimarsh-core
//!
//! Multi-personality conversational-guidance backend: a gated serving
//! pipeline that turns an authenticated request into a bounded, cited,
//! safety-validated generated answer grounded in a personality-specific
//! corpus.
//!
//! ## Key Features
//!
//! - **Gated serving**: bearer-token validation with JWKS caching, rate
//!   limiting, input sanitization, and response redaction
//! - **Cost governance**: per-request estimation, per-user budgets with
//!   tiered alerting and emergency blocking
//! - **Grounded generation**: partitioned vector retrieval, versioned
//!   prompt templates, per-personality timeouts and retries
//! - **Dual-store durability**: local JSON mirror plus remote document
//!   store, kept consistent by compensating transactions
//!
//! ## Example
//!
//! ```rust,no_run
//! use vimarsh_core::config::CoreConfig;
//! use vimarsh_core::pipeline::GuidanceCore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CoreConfig::from_env()?;
//! let core = GuidanceCore::from_config(config)?;
//! let app = vimarsh_core::http::router(core);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module declarations
// =============================================================================

// Public modules
pub mod auth;
pub mod budget;
pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod personality;
pub mod pipeline;
pub mod records;
pub mod retrieval;
pub mod safety;
pub mod security;
pub mod storage;

// Internal modules
pub(crate) mod logging;

#[cfg(test)]
pub mod tests;

// =============================================================================
// Public API re-exports
// =============================================================================

// Configuration
pub use config::{CoreConfig, Environment};

// Errors
pub use error::{CoreError, CoreResult};

// The dependency-injection root and orchestrator
pub use pipeline::{GuidanceCore, GuidancePipeline, GuidanceRequest, GuidanceResponse};

// Persisted data model
pub use records::{
    BudgetAlert, BudgetLimit, Chunk, Conversation, QualityClass, StoredRecord, UsageRecord,
    UserStats,
};

// Auth
pub use auth::{AuthService, AuthenticatedUser, Permissions, RoleManager, UserRole};

// Security
pub use security::{RateLimiter, Redactor, Sanitizer};

// Cost governance
pub use budget::{BudgetEnforcer, CostAccountant};

// Retrieval
pub use retrieval::{FlatVectorIndex, SearchHit, VectorSearcher};

// Personalities and prompts
pub use personality::{Personality, PersonalityRegistry, PromptRenderer};

// LLM dispatch
pub use llm::{GenerationBackend, LlmDispatcher};

// Storage
pub use storage::{TokenStore, TransactionManager};
