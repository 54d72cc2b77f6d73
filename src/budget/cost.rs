//! Token counting, cost tables, and per-user aggregation.
//!
//! Pricing is per 1K tokens with a default fallback row for unknown models.
//! Token estimation uses cl100k_base with a 1.1x approximation factor since
//! the serving models' tokenizers are not publicly available; estimates are
//! conservative (slightly over-counting).
//!
//! UserStats are always recomputed from the persisted UsageRecord set, then
//! written atomically with the new record through the transaction manager.
//! The recompute path is the source of truth; in-memory session aggregates
//! are advisory only.

use crate::error::StorageError;
use crate::logging::{log_debug, log_warn};
use crate::records::{Conversation, QualityClass, StoredRecord, UsageRecord, UserStats};
use crate::storage::transaction::CONVERSATIONS_COLLECTION;
use crate::storage::TransactionManager;
use chrono::{Datelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tokio::sync::Mutex;

/// Cost rates per model (USD per 1K tokens).
const COST_RATES: &[(&str, f64, f64)] = &[
    ("gemini-2.5-flash", 0.000_15, 0.000_6),
    ("gemini-1.5-pro", 0.001_25, 0.005),
];

/// Unknown models fall back to these rates.
const DEFAULT_RATES: (f64, f64) = (0.000_15, 0.000_6);

/// Approximation factor applied over cl100k_base counts.
const APPROXIMATION_FACTOR: f32 = 1.1;

/// Token counter for the serving models.
///
/// Uses cl100k_base with a safety factor; exact tokenization is a provider
/// detail the core does not depend on.
pub struct GuidanceTokenCounter {
    tokenizer: CoreBPE,
}

impl std::fmt::Debug for GuidanceTokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuidanceTokenCounter").finish()
    }
}

impl GuidanceTokenCounter {
    /// Create a counter.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] if the tokenizer data cannot
    /// be initialized (embedded, so effectively infallible).
    pub fn new() -> Result<Self, StorageError> {
        let tokenizer = cl100k_base()
            .map_err(|e| StorageError::unavailable(format!("tokenizer init failed: {e}")))?;
        Ok(Self { tokenizer })
    }

    /// Count tokens in a text string, with the approximation factor.
    pub fn count_tokens(&self, text: &str) -> u32 {
        let tokens = self.tokenizer.encode_with_special_tokens(text);
        (tokens.len() as f32 * APPROXIMATION_FACTOR) as u32
    }
}

/// Per-session advisory aggregate.
#[derive(Debug, Clone, Default)]
struct SessionStats {
    requests: u64,
    total_tokens: u64,
    total_cost_usd: f64,
}

/// System-wide usage roll-up over a window of days.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SystemUsage {
    /// Requests within the window.
    pub total_requests: u64,
    /// Tokens within the window.
    pub total_tokens: u64,
    /// Cost within the window in USD.
    pub total_cost_usd: f64,
    /// Distinct users within the window.
    pub unique_users: usize,
    /// Average cost per user in USD.
    pub cost_per_user: f64,
}

/// Tracks spend, maintains aggregates, and persists atomically.
#[derive(Debug)]
pub struct CostAccountant {
    transactions: Arc<TransactionManager>,
    counter: GuidanceTokenCounter,
    session_stats: Mutex<HashMap<String, SessionStats>>,
    user_stats_cache: Mutex<HashMap<String, UserStats>>,
}

impl CostAccountant {
    /// Create an accountant over the given transaction manager.
    pub fn new(transactions: Arc<TransactionManager>) -> Result<Self, StorageError> {
        Ok(Self {
            transactions,
            counter: GuidanceTokenCounter::new()?,
            session_stats: Mutex::new(HashMap::new()),
            user_stats_cache: Mutex::new(HashMap::new()),
        })
    }

    /// The token counter used for estimation.
    pub fn counter(&self) -> &GuidanceTokenCounter {
        &self.counter
    }

    /// Cost in USD for a token pair under a model's rates.
    ///
    /// `cost = in/1000 * rateIn + out/1000 * rateOut`, rounded to 6 decimals.
    pub fn cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let (rate_in, rate_out) = COST_RATES
            .iter()
            .find(|(m, _, _)| *m == model)
            .map(|(_, i, o)| (*i, *o))
            .unwrap_or_else(|| {
                log_debug!(model = model, "Unknown model, using default cost rates");
                DEFAULT_RATES
            });
        let raw =
            (input_tokens as f64 / 1000.0) * rate_in + (output_tokens as f64 / 1000.0) * rate_out;
        (raw * 1_000_000.0).round() / 1_000_000.0
    }

    /// Conservative upper-bound estimate for a request: full prompt tokens
    /// plus `max_chars / 4` output tokens at the model's rates.
    pub fn estimate_cost(&self, model: &str, prompt: &str, max_chars: usize) -> f64 {
        let input = self.counter.count_tokens(prompt);
        let output = (max_chars / 4) as u32;
        self.cost(model, input, output)
    }

    /// Record one spend event: build the UsageRecord, recompute the user's
    /// stats from the persisted set, and write both in one transaction.
    /// When `conversation` is present it joins the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_usage(
        &self,
        user_id: &str,
        user_email: &str,
        session_id: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        quality: QualityClass,
        personality: &str,
        conversation: Option<Conversation>,
    ) -> Result<UsageRecord, StorageError> {
        let timestamp = Utc::now();
        let usage = UsageRecord {
            id: UsageRecord::derive_id(user_id, timestamp),
            user_id: user_id.to_string(),
            user_email: user_email.to_lowercase(),
            session_id: session_id.to_string(),
            timestamp,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost_usd: self.cost(model, input_tokens, output_tokens),
            request_type: "guidance".to_string(),
            quality,
            personality: personality.to_string(),
        };

        let stats = self.rebuild_user_stats(user_id, user_email, Some(&usage)).await?;

        match conversation {
            Some(conversation) => {
                self.transactions
                    .atomic_conversation_save(conversation, usage.clone(), stats.clone())
                    .await?
            }
            None => {
                self.transactions
                    .atomic_token_operation(usage.clone(), stats.clone())
                    .await?
            }
        }

        // Advisory caches only; the persisted recompute is authoritative.
        self.user_stats_cache
            .lock()
            .await
            .insert(user_id.to_string(), stats);
        self.bump_session(session_id, &usage).await;
        Ok(usage)
    }

    /// The last persisted aggregate for a user, from the advisory cache.
    pub async fn cached_user_stats(&self, user_id: &str) -> Option<UserStats> {
        self.user_stats_cache.lock().await.get(user_id).cloned()
    }

    /// Recompute a user's aggregate from every persisted UsageRecord,
    /// optionally folding in a record not yet persisted.
    ///
    /// Month-boundary values use the current UTC calendar month, so they
    /// reset lazily when the wall-clock month rolls.
    pub async fn rebuild_user_stats(
        &self,
        user_id: &str,
        user_email: &str,
        pending: Option<&UsageRecord>,
    ) -> Result<UserStats, StorageError> {
        let mut records = self.user_records(user_id).await?;
        if let Some(pending) = pending {
            records.push(pending.clone());
        }

        let now = Utc::now();
        let mut stats = UserStats::empty(user_id, user_email.to_lowercase());
        let mut model_counts: HashMap<String, u64> = HashMap::new();

        for record in &records {
            stats.total_requests += 1;
            stats.total_tokens += u64::from(record.total_tokens);
            stats.total_cost_usd += record.cost_usd;
            if record.timestamp.year() == now.year() && record.timestamp.month() == now.month() {
                stats.current_month_tokens += u64::from(record.total_tokens);
                stats.current_month_cost_usd += record.cost_usd;
            }
            if stats.last_request.map_or(true, |t| record.timestamp > t) {
                stats.last_request = Some(record.timestamp);
            }
            *model_counts.entry(record.model.clone()).or_default() += 1;
            *stats
                .personality_usage
                .entry(record.personality.clone())
                .or_default() += 1;
            *stats
                .quality_breakdown
                .entry(record.quality.as_str().to_string())
                .or_default() += 1;
        }

        if stats.total_requests > 0 {
            stats.avg_tokens_per_request = stats.total_tokens as f64 / stats.total_requests as f64;
        }
        stats.favorite_model = model_counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(model, _)| model);

        Ok(stats)
    }

    /// Month-to-date spend in USD for a user (UTC calendar month).
    pub async fn monthly_used(&self, user_id: &str) -> Result<f64, StorageError> {
        let now = Utc::now();
        Ok(self
            .user_records(user_id)
            .await?
            .iter()
            .filter(|r| r.timestamp.year() == now.year() && r.timestamp.month() == now.month())
            .map(|r| r.cost_usd)
            .sum())
    }

    /// Today's spend in USD for a user (UTC calendar day).
    pub async fn daily_used(&self, user_id: &str) -> Result<f64, StorageError> {
        let today = Utc::now().date_naive();
        Ok(self
            .user_records(user_id)
            .await?
            .iter()
            .filter(|r| r.timestamp.date_naive() == today)
            .map(|r| r.cost_usd)
            .sum())
    }

    /// System roll-up over the last `days` days.
    pub async fn system_usage(&self, days: i64) -> Result<SystemUsage, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut usage = SystemUsage {
            total_requests: 0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            unique_users: 0,
            cost_per_user: 0.0,
        };
        let mut users = std::collections::HashSet::new();

        for record in self.all_records().await? {
            if record.timestamp < cutoff {
                continue;
            }
            usage.total_requests += 1;
            usage.total_tokens += u64::from(record.total_tokens);
            usage.total_cost_usd += record.cost_usd;
            users.insert(record.user_id);
        }
        usage.unique_users = users.len();
        if usage.unique_users > 0 {
            usage.cost_per_user = usage.total_cost_usd / usage.unique_users as f64;
        }
        Ok(usage)
    }

    /// The `limit` highest-spending users, lifetime, highest first.
    pub async fn top_users(&self, limit: usize) -> Result<Vec<(String, f64)>, StorageError> {
        let mut spend: HashMap<String, f64> = HashMap::new();
        for record in self.all_records().await? {
            *spend.entry(record.user_id).or_default() += record.cost_usd;
        }
        let mut ranked: Vec<(String, f64)> = spend.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Advisory per-session aggregate (requests, tokens, cost).
    pub async fn session_usage(&self, session_id: &str) -> Option<(u64, u64, f64)> {
        self.session_stats
            .lock()
            .await
            .get(session_id)
            .map(|s| (s.requests, s.total_tokens, s.total_cost_usd))
    }

    async fn bump_session(&self, session_id: &str, usage: &UsageRecord) {
        let mut sessions = self.session_stats.lock().await;
        let stats = sessions.entry(session_id.to_string()).or_default();
        stats.requests += 1;
        stats.total_tokens += u64::from(usage.total_tokens);
        stats.total_cost_usd += usage.cost_usd;
    }

    async fn user_records(&self, user_id: &str) -> Result<Vec<UsageRecord>, StorageError> {
        Ok(self
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.user_id == user_id)
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<UsageRecord>, StorageError> {
        let records = self
            .transactions
            .store()
            .read_all(CONVERSATIONS_COLLECTION)
            .await
            .unwrap_or_else(|e| {
                log_warn!(error = %e, "Usage read failed, treating as empty");
                Vec::new()
            });
        Ok(records
            .into_iter()
            .filter_map(|r| match r {
                StoredRecord::UsageTracking(usage) => Some(usage),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStore, TokenStore};

    fn accountant(dir: &std::path::Path) -> CostAccountant {
        let store = TokenStore::local_only(LocalStore::new(dir).unwrap());
        let manager = Arc::new(TransactionManager::new(store, dir));
        CostAccountant::new(manager).unwrap()
    }

    #[test]
    fn test_cost_table_rates() {
        let dir = tempfile::tempdir().unwrap();
        let acc = accountant(dir.path());

        // 1000 in + 1000 out on flash: 0.00015 + 0.0006
        assert_eq!(acc.cost("gemini-2.5-flash", 1000, 1000), 0.000_75);
        // Pro rates
        assert_eq!(acc.cost("gemini-1.5-pro", 1000, 1000), 0.006_25);
        // Unknown model falls back to flash rates
        assert_eq!(acc.cost("mystery-model", 1000, 1000), 0.000_75);
    }

    #[test]
    fn test_cost_rounds_to_six_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let acc = accountant(dir.path());

        let cost = acc.cost("gemini-2.5-flash", 123, 77);
        assert_eq!(cost, (cost * 1_000_000.0).round() / 1_000_000.0);
    }

    #[test]
    fn test_token_estimation_over_counts() {
        let counter = GuidanceTokenCounter::new().unwrap();
        let exact = cl100k_base()
            .unwrap()
            .encode_with_special_tokens("What is my prescribed duty?")
            .len() as u32;
        assert!(counter.count_tokens("What is my prescribed duty?") >= exact);
    }

    #[tokio::test]
    async fn test_record_usage_persists_and_rebuilds_stats() {
        let dir = tempfile::tempdir().unwrap();
        let acc = accountant(dir.path());

        acc.record_usage(
            "u1",
            "U1@Example.com",
            "s1",
            "gemini-2.5-flash",
            100,
            50,
            QualityClass::High,
            "krishna",
            None,
        )
        .await
        .unwrap();
        acc.record_usage(
            "u1",
            "u1@example.com",
            "s1",
            "gemini-2.5-flash",
            200,
            100,
            QualityClass::Fallback,
            "newton",
            None,
        )
        .await
        .unwrap();

        let stats = acc.rebuild_user_stats("u1", "u1@example.com", None).await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_tokens, 450);
        assert_eq!(stats.current_month_tokens, 450);
        assert_eq!(stats.avg_tokens_per_request, 225.0);
        assert_eq!(stats.personality_usage["krishna"], 1);
        assert_eq!(stats.quality_breakdown["fallback"], 1);
        assert_eq!(stats.favorite_model.as_deref(), Some("gemini-2.5-flash"));
        assert_eq!(stats.user_email, "u1@example.com", "Email must lowercase");
    }

    #[tokio::test]
    async fn test_stats_total_equals_sum_of_records() {
        let dir = tempfile::tempdir().unwrap();
        let acc = accountant(dir.path());

        for i in 0..5u32 {
            acc.record_usage(
                "u1",
                "u1@example.com",
                "s1",
                "gemini-2.5-flash",
                10 * (i + 1),
                5,
                QualityClass::High,
                "krishna",
                None,
            )
            .await
            .unwrap();
        }

        let stats = acc.rebuild_user_stats("u1", "u1@example.com", None).await.unwrap();
        let records_total: u64 = acc
            .user_records("u1")
            .await
            .unwrap()
            .iter()
            .map(|r| u64::from(r.total_tokens))
            .sum();
        assert_eq!(stats.total_tokens, records_total);
    }

    #[tokio::test]
    async fn test_daily_and_monthly_used_track_spend() {
        let dir = tempfile::tempdir().unwrap();
        let acc = accountant(dir.path());

        let usage = acc
            .record_usage(
                "u1",
                "u1@example.com",
                "s1",
                "gemini-2.5-flash",
                1000,
                1000,
                QualityClass::High,
                "krishna",
                None,
            )
            .await
            .unwrap();

        assert_eq!(acc.daily_used("u1").await.unwrap(), usage.cost_usd);
        assert_eq!(acc.monthly_used("u1").await.unwrap(), usage.cost_usd);
        assert_eq!(acc.daily_used("other").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_system_usage_rolls_up_unique_users() {
        let dir = tempfile::tempdir().unwrap();
        let acc = accountant(dir.path());

        for user in ["u1", "u2"] {
            acc.record_usage(
                user,
                &format!("{user}@example.com"),
                "s1",
                "gemini-2.5-flash",
                100,
                100,
                QualityClass::High,
                "krishna",
                None,
            )
            .await
            .unwrap();
        }

        let usage = acc.system_usage(30).await.unwrap();
        assert_eq!(usage.total_requests, 2);
        assert_eq!(usage.unique_users, 2);
        assert!(usage.cost_per_user > 0.0);

        let top = acc.top_users(1).await.unwrap();
        assert_eq!(top.len(), 1);
    }
}
