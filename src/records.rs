//! Persisted record types for the dual store.
//!
//! Every record that crosses a store boundary lives here, with the `type`
//! discriminator that keeps heterogeneous collections queryable. Records are
//! append-only on the serving path except [`UserStats`], which is overwritten
//! atomically, and [`BudgetLimit`], which is updated by admins only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse label indicating whether a response came from a full LLM call
/// or from a canned fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    /// Full LLM response within budget.
    High,
    /// LLM response that needed truncation or safety editing.
    Medium,
    /// LLM response of degraded usefulness.
    Low,
    /// Canned fallback; no billable generation succeeded.
    Fallback,
}

impl QualityClass {
    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Fallback => "fallback",
        }
    }
}

/// A short passage of source text with metadata and a pre-computed embedding.
///
/// Chunks are append-only in the serving path; corpus updates arrive as
/// batch swaps. The embedding dimensionality must match the partition's
/// declared dimensionality or ingest rejects the chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique chunk id.
    pub id: String,
    /// Text body.
    pub text: String,
    /// Source document identifier (e.g. `"Bhagavad Gita 2.47"`).
    pub source: String,
    /// Optional chapter/verse/section reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Domain-specific key terms extracted at ingest.
    #[serde(default)]
    pub key_terms: Vec<String>,
    /// Citations extracted from the text.
    #[serde(default)]
    pub citations: Vec<String>,
    /// Quality score in [0, ~2].
    pub quality_score: f32,
    /// Fixed-length embedding, uniform within a partition.
    pub embedding: Vec<f32>,
    /// Partition tag (personality or domain).
    pub partition: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One recorded LLM spend event. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Id derived from (user, timestamp).
    pub id: String,
    /// Subject id of the spender.
    pub user_id: String,
    /// Email of the spender (lowercased).
    pub user_email: String,
    /// Session the request belonged to.
    pub session_id: String,
    /// When the spend happened.
    pub timestamp: DateTime<Utc>,
    /// Model that served the request.
    pub model: String,
    /// Prompt-side tokens.
    pub input_tokens: u32,
    /// Completion-side tokens.
    pub output_tokens: u32,
    /// input + output.
    pub total_tokens: u32,
    /// Cost in USD, 6-decimal precision.
    pub cost_usd: f64,
    /// Request type tag (e.g. `"guidance"`).
    pub request_type: String,
    /// Quality class of the served response.
    pub quality: QualityClass,
    /// Personality that served the request.
    pub personality: String,
}

impl UsageRecord {
    /// Derive the record id from user and timestamp.
    pub fn derive_id(user_id: &str, timestamp: DateTime<Utc>) -> String {
        format!("{user_id}_{}", timestamp.timestamp_millis())
    }
}

/// Per-user aggregate, recomputed from the UsageRecord set and overwritten
/// atomically alongside each new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    /// Subject id. One stats record per user.
    pub user_id: String,
    /// Email (lowercased).
    pub user_email: String,
    /// Lifetime request count.
    pub total_requests: u64,
    /// Lifetime token count.
    pub total_tokens: u64,
    /// Lifetime cost in USD.
    pub total_cost_usd: f64,
    /// Tokens within the current calendar month (UTC).
    pub current_month_tokens: u64,
    /// Cost within the current calendar month (UTC).
    pub current_month_cost_usd: f64,
    /// Timestamp of the most recent request.
    pub last_request: Option<DateTime<Utc>>,
    /// Average tokens per request.
    pub avg_tokens_per_request: f64,
    /// Model with the most requests.
    pub favorite_model: Option<String>,
    /// Personality-use histogram.
    #[serde(default)]
    pub personality_usage: HashMap<String, u64>,
    /// Quality-class histogram.
    #[serde(default)]
    pub quality_breakdown: HashMap<String, u64>,
    /// Abuse risk score.
    pub risk_score: f64,
    /// Whether the user is blocked from spending.
    pub blocked: bool,
    /// Why the user is blocked, when they are.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

impl UserStats {
    /// An empty aggregate for a user with no persisted records.
    pub fn empty(user_id: impl Into<String>, user_email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: user_email.into(),
            total_requests: 0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            current_month_tokens: 0,
            current_month_cost_usd: 0.0,
            last_request: None,
            avg_tokens_per_request: 0.0,
            favorite_model: None,
            personality_usage: HashMap::new(),
            quality_breakdown: HashMap::new(),
            risk_score: 0.0,
            blocked: false,
            block_reason: None,
        }
    }
}

/// Per-user budget caps. A default limit is materialized on first use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimit {
    /// Subject id.
    pub user_id: String,
    /// Email (lowercased).
    pub user_email: String,
    /// Monthly cap in USD.
    pub monthly_limit_usd: f64,
    /// Daily cap in USD.
    pub daily_limit_usd: f64,
    /// Per-request cap in USD.
    pub per_request_limit_usd: f64,
    /// Whether caps are enforced for this user.
    pub enabled: bool,
    /// Admin-granted bypass of monthly/daily caps.
    pub emergency_override: bool,
    /// When the limit record was created.
    pub created_at: DateTime<Utc>,
    /// When the limit record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Budget alert level, keyed to utilization thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// 50% of the cap.
    Info,
    /// 75% of the cap.
    Warning,
    /// 90% of the cap.
    Critical,
    /// 100% of the cap.
    Emergency,
}

impl AlertLevel {
    /// Utilization threshold that triggers this level.
    pub fn threshold(self) -> f64 {
        match self {
            Self::Info => 0.50,
            Self::Warning => 0.75,
            Self::Critical => 0.90,
            Self::Emergency => 1.00,
        }
    }
}

/// Period an alert applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPeriod {
    /// Calendar day (UTC).
    Day,
    /// Calendar month (UTC).
    Month,
}

/// Action an alert triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    /// Logged only.
    None,
    /// Operator notified.
    Notify,
    /// Subsequent responses prefer canned replies.
    Fallback,
    /// User added to the block list.
    Block,
}

/// One emitted budget alert. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    /// Subject id.
    pub user_id: String,
    /// Email (lowercased).
    pub user_email: String,
    /// Level crossed.
    pub level: AlertLevel,
    /// Period the crossing applies to.
    pub period: AlertPeriod,
    /// Usage at alert time in USD.
    pub current_usage_usd: f64,
    /// The cap in USD.
    pub limit_usd: f64,
    /// Utilization percentage.
    pub percentage: f64,
    /// Action taken.
    pub action: AlertAction,
    /// Personality-flavored message for the user.
    pub message: String,
    /// When the alert fired.
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit record of one served exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Record id.
    pub id: String,
    /// Subject id.
    pub user_id: String,
    /// Session the exchange belonged to.
    pub session_id: String,
    /// When the exchange completed.
    pub timestamp: DateTime<Utc>,
    /// The sanitized user question.
    pub question: String,
    /// The redacted response text.
    pub response: String,
    /// Citations returned with the response.
    #[serde(default)]
    pub citations: Vec<String>,
    /// Personality that served the exchange.
    pub personality: String,
}

/// Discriminated union of every record the heterogeneous collections hold.
///
/// The `type` tag keeps mixed collections queryable in both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredRecord {
    /// A corpus chunk (`spiritual-texts` collection).
    SpiritualText(Chunk),
    /// A served exchange.
    Conversation(Conversation),
    /// A spend event.
    UsageTracking(UsageRecord),
    /// A per-user aggregate.
    UserStats(UserStats),
    /// Personality metadata mirrored to the store.
    PersonalityConfig(serde_json::Value),
    /// A prompt template mirrored to the store.
    PromptTemplate(serde_json::Value),
}

impl StoredRecord {
    /// The record's id within its collection.
    pub fn id(&self) -> &str {
        match self {
            Self::SpiritualText(c) => &c.id,
            Self::Conversation(c) => &c.id,
            Self::UsageTracking(u) => &u.id,
            Self::UserStats(s) => &s.user_id,
            Self::PersonalityConfig(v) | Self::PromptTemplate(v) => {
                v.get("id").and_then(|i| i.as_str()).unwrap_or("")
            }
        }
    }

    /// The partition key used by the remote store.
    pub fn partition_key(&self) -> &str {
        match self {
            Self::SpiritualText(c) => &c.partition,
            Self::Conversation(c) => &c.user_id,
            Self::UsageTracking(u) => &u.user_id,
            Self::UserStats(s) => &s.user_id,
            Self::PersonalityConfig(v) | Self::PromptTemplate(v) => {
                v.get("partition").and_then(|p| p.as_str()).unwrap_or("system")
            }
        }
    }
}
