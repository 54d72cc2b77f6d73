//! Per-user budget enforcement and tiered alerting.
//!
//! Validation order: block list, limit materialization, enabled flag,
//! per-request cap, monthly cap, daily cap. Alerts fire at 50/75/90/100
//! percent utilization per period; emergency blocks the user, critical
//! sets a fallback hint the pipeline reads, warning is notify-only.
//! Admin overrides and unblocks are audit-logged.

use crate::budget::cost::CostAccountant;
use crate::config::BudgetDefaults;
use crate::error::{BudgetError, StorageError};
use crate::logging::{log_info, log_warn};
use crate::records::{AlertAction, AlertLevel, AlertPeriod, BudgetAlert, BudgetLimit};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const ALERT_HISTORY_CAPACITY: usize = 1_000;

/// Outcome of a budget validation.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetCheck {
    /// The request may proceed.
    Allowed,
    /// The request is denied with the given reason.
    Denied(BudgetError),
}

impl BudgetCheck {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Default)]
struct AlertState {
    /// Highest level already alerted per (user, period) within the current
    /// period window; cleared lazily when utilization drops below it.
    emitted: HashMap<(String, AlertPeriod), AlertLevel>,
}

/// Enforces per-user budgets against the cost accountant's numbers.
#[derive(Debug)]
pub struct BudgetEnforcer {
    accountant: Arc<CostAccountant>,
    defaults: BudgetDefaults,
    limits: RwLock<HashMap<String, BudgetLimit>>,
    blocked: RwLock<HashMap<String, String>>,
    fallback_hints: RwLock<HashSet<String>>,
    alert_state: Mutex<AlertState>,
    alert_history: Mutex<Vec<BudgetAlert>>,
}

impl BudgetEnforcer {
    /// Create an enforcer with the configured default caps.
    pub fn new(accountant: Arc<CostAccountant>, defaults: BudgetDefaults) -> Self {
        Self {
            accountant,
            defaults,
            limits: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashMap::new()),
            fallback_hints: RwLock::new(HashSet::new()),
            alert_state: Mutex::new(AlertState::default()),
            alert_history: Mutex::new(Vec::new()),
        }
    }

    /// Validate one request's estimated cost against the user's caps.
    ///
    /// Runs before any LLM call; a denial must not produce a UsageRecord.
    pub async fn validate(
        &self,
        user_id: &str,
        user_email: &str,
        estimated_cost: f64,
    ) -> Result<BudgetCheck, StorageError> {
        if let Some(reason) = self.blocked.read().await.get(user_id) {
            return Ok(BudgetCheck::Denied(BudgetError::UserBlocked {
                reason: reason.clone(),
            }));
        }

        let limit = self.get_or_create_limit(user_id, user_email).await;

        if !limit.enabled {
            return Ok(BudgetCheck::Allowed);
        }

        if estimated_cost > limit.per_request_limit_usd {
            return Ok(BudgetCheck::Denied(BudgetError::PerRequestExceeded {
                estimated: estimated_cost,
                limit: limit.per_request_limit_usd,
            }));
        }

        let monthly_used = self.accountant.monthly_used(user_id).await?;
        if monthly_used + estimated_cost > limit.monthly_limit_usd && !limit.emergency_override {
            return Ok(BudgetCheck::Denied(BudgetError::MonthlyExceeded {
                used: monthly_used,
                limit: limit.monthly_limit_usd,
            }));
        }

        let daily_used = self.accountant.daily_used(user_id).await?;
        if daily_used + estimated_cost > limit.daily_limit_usd && !limit.emergency_override {
            return Ok(BudgetCheck::Denied(BudgetError::DailyExceeded {
                used: daily_used,
                limit: limit.daily_limit_usd,
            }));
        }

        Ok(BudgetCheck::Allowed)
    }

    /// Evaluate alert thresholds for a user after a spend, emitting one
    /// alert per newly crossed (period, level) pair and applying actions.
    pub async fn check_alerts(
        &self,
        user_id: &str,
        user_email: &str,
    ) -> Result<Vec<BudgetAlert>, StorageError> {
        let limit = self.get_or_create_limit(user_id, user_email).await;
        if !limit.enabled {
            return Ok(Vec::new());
        }

        let monthly_used = self.accountant.monthly_used(user_id).await?;
        let daily_used = self.accountant.daily_used(user_id).await?;

        let mut alerts = Vec::new();
        for (period, used, cap) in [
            (AlertPeriod::Month, monthly_used, limit.monthly_limit_usd),
            (AlertPeriod::Day, daily_used, limit.daily_limit_usd),
        ] {
            alerts.extend(
                self.alerts_for_period(user_id, user_email, period, used, cap)
                    .await,
            );
        }

        for alert in &alerts {
            self.apply_action(user_id, alert).await;
        }

        let mut history = self.alert_history.lock().await;
        for alert in &alerts {
            if history.len() >= ALERT_HISTORY_CAPACITY {
                history.remove(0);
            }
            history.push(alert.clone());
        }

        Ok(alerts)
    }

    async fn alerts_for_period(
        &self,
        user_id: &str,
        user_email: &str,
        period: AlertPeriod,
        used: f64,
        cap: f64,
    ) -> Vec<BudgetAlert> {
        if cap <= 0.0 {
            return Vec::new();
        }
        let utilization = used / cap;
        let mut state = self.alert_state.lock().await;
        let key = (user_id.to_string(), period);
        let already = state.emitted.get(&key).copied();

        // Utilization dropping below the recorded level means the period
        // rolled; reset so the next climb re-alerts.
        if let Some(level) = already {
            if utilization < level.threshold() {
                state.emitted.remove(&key);
            }
        }
        let already = state.emitted.get(&key).copied();

        let mut alerts = Vec::new();
        for level in [
            AlertLevel::Info,
            AlertLevel::Warning,
            AlertLevel::Critical,
            AlertLevel::Emergency,
        ] {
            if utilization >= level.threshold() && already.map_or(true, |a| level > a) {
                alerts.push(BudgetAlert {
                    user_id: user_id.to_string(),
                    user_email: user_email.to_lowercase(),
                    level,
                    period,
                    current_usage_usd: used,
                    limit_usd: cap,
                    percentage: utilization * 100.0,
                    action: action_for(level),
                    message: alert_message(level, period, utilization * 100.0),
                    timestamp: Utc::now(),
                });
            }
        }

        if let Some(highest) = alerts.last() {
            state.emitted.insert(key, highest.level);
        }
        alerts
    }

    async fn apply_action(&self, user_id: &str, alert: &BudgetAlert) {
        match alert.action {
            AlertAction::Block => {
                log_warn!(
                    user_id = user_id,
                    period = ?alert.period,
                    percentage = alert.percentage,
                    "Emergency budget threshold crossed, blocking user"
                );
                self.blocked.write().await.insert(
                    user_id.to_string(),
                    format!(
                        "budget exhausted: {:.1}% of {:?} cap",
                        alert.percentage, alert.period
                    ),
                );
            }
            AlertAction::Fallback => {
                self.fallback_hints.write().await.insert(user_id.to_string());
            }
            AlertAction::Notify => {
                log_info!(
                    user_id = user_id,
                    level = ?alert.level,
                    period = ?alert.period,
                    "Budget warning threshold crossed"
                );
            }
            AlertAction::None => {}
        }
    }

    /// Whether subsequent responses for this user should prefer canned
    /// replies (set by a critical alert).
    pub async fn fallback_hint(&self, user_id: &str) -> bool {
        self.fallback_hints.read().await.contains(user_id)
    }

    /// Whether the user is on the block list.
    pub async fn is_blocked(&self, user_id: &str) -> bool {
        self.blocked.read().await.contains_key(user_id)
    }

    /// Set explicit caps for a user. Idempotent: the same arguments yield
    /// the same limit.
    pub async fn set_user_budget(
        &self,
        user_id: &str,
        user_email: &str,
        monthly_usd: f64,
        daily_usd: f64,
        per_request_usd: f64,
    ) -> BudgetLimit {
        let mut limits = self.limits.write().await;
        let now = Utc::now();
        let created_at = limits.get(user_id).map_or(now, |l| l.created_at);
        let limit = BudgetLimit {
            user_id: user_id.to_string(),
            user_email: user_email.to_lowercase(),
            monthly_limit_usd: monthly_usd,
            daily_limit_usd: daily_usd,
            per_request_limit_usd: per_request_usd,
            enabled: true,
            emergency_override: limits
                .get(user_id)
                .map_or(false, |l| l.emergency_override),
            created_at,
            updated_at: now,
        };
        limits.insert(user_id.to_string(), limit.clone());
        log_info!(
            user_id = user_id,
            monthly = monthly_usd,
            daily = daily_usd,
            per_request = per_request_usd,
            "User budget caps updated"
        );
        limit
    }

    /// Grant the emergency override and clear the block (admin action).
    pub async fn override_budget(&self, user_id: &str, admin_email: &str) {
        if let Some(limit) = self.limits.write().await.get_mut(user_id) {
            limit.emergency_override = true;
            limit.updated_at = Utc::now();
        }
        self.blocked.write().await.remove(user_id);
        self.fallback_hints.write().await.remove(user_id);
        log_warn!(
            user_id = user_id,
            admin = admin_email,
            "Budget emergency override granted"
        );
    }

    /// Remove a user from the block list (admin action).
    pub async fn unblock(&self, user_id: &str, admin_email: &str) -> bool {
        let removed = self.blocked.write().await.remove(user_id).is_some();
        self.fallback_hints.write().await.remove(user_id);
        log_warn!(
            user_id = user_id,
            admin = admin_email,
            removed = removed,
            "Budget block cleared"
        );
        removed
    }

    /// Current caps and utilization for one user.
    pub async fn budget_status(
        &self,
        user_id: &str,
        user_email: &str,
    ) -> Result<serde_json::Value, StorageError> {
        let limit = self.get_or_create_limit(user_id, user_email).await;
        let monthly_used = self.accountant.monthly_used(user_id).await?;
        let daily_used = self.accountant.daily_used(user_id).await?;
        Ok(serde_json::json!({
            "user_id": user_id,
            "limits": {
                "monthly_usd": limit.monthly_limit_usd,
                "daily_usd": limit.daily_limit_usd,
                "per_request_usd": limit.per_request_limit_usd,
            },
            "usage": {
                "monthly_usd": monthly_used,
                "daily_usd": daily_used,
            },
            "utilization": {
                "monthly": percentage(monthly_used, limit.monthly_limit_usd),
                "daily": percentage(daily_used, limit.daily_limit_usd),
            },
            "blocked": self.is_blocked(user_id).await,
            "emergency_override": limit.emergency_override,
        }))
    }

    /// Summary across all known users (admin surface).
    pub async fn budget_summary(&self) -> serde_json::Value {
        let limits = self.limits.read().await;
        let blocked = self.blocked.read().await;
        serde_json::json!({
            "tracked_users": limits.len(),
            "blocked_users": blocked.len(),
            "defaults": {
                "monthly_usd": self.defaults.monthly_usd,
                "daily_usd": self.defaults.daily_usd,
                "per_request_usd": self.defaults.per_request_usd,
            },
        })
    }

    /// The limit for a user, materializing the default on first use.
    pub async fn get_or_create_limit(&self, user_id: &str, user_email: &str) -> BudgetLimit {
        if let Some(limit) = self.limits.read().await.get(user_id) {
            return limit.clone();
        }
        let now = Utc::now();
        let limit = BudgetLimit {
            user_id: user_id.to_string(),
            user_email: user_email.to_lowercase(),
            monthly_limit_usd: self.defaults.monthly_usd,
            daily_limit_usd: self.defaults.daily_usd,
            per_request_limit_usd: self.defaults.per_request_usd,
            enabled: true,
            emergency_override: false,
            created_at: now,
            updated_at: now,
        };
        self.limits
            .write()
            .await
            .entry(user_id.to_string())
            .or_insert_with(|| limit.clone());
        limit
    }
}

fn percentage(used: f64, cap: f64) -> f64 {
    if cap <= 0.0 {
        0.0
    } else {
        used / cap * 100.0
    }
}

fn action_for(level: AlertLevel) -> AlertAction {
    match level {
        AlertLevel::Info => AlertAction::None,
        AlertLevel::Warning => AlertAction::Notify,
        AlertLevel::Critical => AlertAction::Fallback,
        AlertLevel::Emergency => AlertAction::Block,
    }
}

fn alert_message(level: AlertLevel, period: AlertPeriod, percentage: f64) -> String {
    let period_name = match period {
        AlertPeriod::Day => "daily",
        AlertPeriod::Month => "monthly",
    };
    match level {
        AlertLevel::Info => format!(
            "Gentle awareness: {percentage:.0}% of your {period_name} guidance allowance has been used."
        ),
        AlertLevel::Warning => format!(
            "Mindful notice: {percentage:.0}% of your {period_name} guidance allowance has been used. Consider pacing your questions."
        ),
        AlertLevel::Critical => format!(
            "Important: {percentage:.0}% of your {period_name} guidance allowance has been used. Responses may become brief reflections."
        ),
        AlertLevel::Emergency => format!(
            "Your {period_name} guidance allowance is exhausted. Please return when the period renews, or seek an admin's blessing."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::QualityClass;
    use crate::storage::{LocalStore, TokenStore, TransactionManager};

    async fn setup(dir: &std::path::Path) -> (Arc<CostAccountant>, BudgetEnforcer) {
        let store = TokenStore::local_only(LocalStore::new(dir).unwrap());
        let manager = Arc::new(TransactionManager::new(store, dir));
        let accountant = Arc::new(CostAccountant::new(manager).unwrap());
        let enforcer = BudgetEnforcer::new(accountant.clone(), BudgetDefaults::default());
        (accountant, enforcer)
    }

    #[tokio::test]
    async fn test_default_limit_materialized_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let (_, enforcer) = setup(dir.path()).await;

        let limit = enforcer.get_or_create_limit("u1", "u1@example.com").await;
        assert_eq!(limit.monthly_limit_usd, 50.0);
        assert_eq!(limit.per_request_limit_usd, 0.50);
        assert!(limit.enabled);
    }

    #[tokio::test]
    async fn test_per_request_cap_denies() {
        let dir = tempfile::tempdir().unwrap();
        let (_, enforcer) = setup(dir.path()).await;

        let check = enforcer.validate("u1", "u1@example.com", 0.75).await.unwrap();
        assert!(matches!(
            check,
            BudgetCheck::Denied(BudgetError::PerRequestExceeded { .. })
        ));

        let check = enforcer.validate("u1", "u1@example.com", 0.10).await.unwrap();
        assert!(check.is_allowed());
    }

    #[tokio::test]
    async fn test_monthly_cap_denies_near_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let (_, enforcer) = setup(dir.path()).await;

        // Tight caps so the next estimate trips the monthly check.
        enforcer
            .set_user_budget("u1", "u1@example.com", 0.40, 5.0, 0.50)
            .await;

        let check = enforcer.validate("u1", "u1@example.com", 0.45).await.unwrap();
        assert!(matches!(
            check,
            BudgetCheck::Denied(BudgetError::MonthlyExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_blocked_user_denied_before_caps() {
        let dir = tempfile::tempdir().unwrap();
        let (_, enforcer) = setup(dir.path()).await;

        enforcer
            .blocked
            .write()
            .await
            .insert("u1".to_string(), "manual block".to_string());

        let check = enforcer.validate("u1", "u1@example.com", 0.01).await.unwrap();
        assert!(matches!(
            check,
            BudgetCheck::Denied(BudgetError::UserBlocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_emergency_alert_blocks_user() {
        let dir = tempfile::tempdir().unwrap();
        let (accountant, enforcer) = setup(dir.path()).await;

        // Daily cap of one cent; spend well past it.
        enforcer
            .set_user_budget("u1", "u1@example.com", 50.0, 0.001, 0.50)
            .await;
        accountant
            .record_usage(
                "u1",
                "u1@example.com",
                "s1",
                "gemini-2.5-flash",
                10_000,
                10_000,
                QualityClass::High,
                "krishna",
                None,
            )
            .await
            .unwrap();

        let alerts = enforcer.check_alerts("u1", "u1@example.com").await.unwrap();

        let emergency: Vec<_> = alerts
            .iter()
            .filter(|a| a.level == AlertLevel::Emergency)
            .collect();
        assert!(!emergency.is_empty(), "100% crossing must emit emergency");
        assert!(enforcer.is_blocked("u1").await);

        // A blocked user fails validation before any cap math.
        let check = enforcer.validate("u1", "u1@example.com", 0.0001).await.unwrap();
        assert!(matches!(
            check,
            BudgetCheck::Denied(BudgetError::UserBlocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_alerts_do_not_repeat_for_same_level() {
        let dir = tempfile::tempdir().unwrap();
        let (accountant, enforcer) = setup(dir.path()).await;

        enforcer
            .set_user_budget("u1", "u1@example.com", 0.001, 0.001, 0.50)
            .await;
        accountant
            .record_usage(
                "u1",
                "u1@example.com",
                "s1",
                "gemini-2.5-flash",
                10_000,
                10_000,
                QualityClass::High,
                "krishna",
                None,
            )
            .await
            .unwrap();

        let first = enforcer.check_alerts("u1", "u1@example.com").await.unwrap();
        assert!(!first.is_empty());

        let second = enforcer.check_alerts("u1", "u1@example.com").await.unwrap();
        assert!(second.is_empty(), "Already-crossed levels must not re-alert");
    }

    #[tokio::test]
    async fn test_override_clears_block_and_bypasses_caps() {
        let dir = tempfile::tempdir().unwrap();
        let (accountant, enforcer) = setup(dir.path()).await;

        enforcer
            .set_user_budget("u1", "u1@example.com", 0.001, 0.001, 0.50)
            .await;
        accountant
            .record_usage(
                "u1",
                "u1@example.com",
                "s1",
                "gemini-2.5-flash",
                10_000,
                10_000,
                QualityClass::High,
                "krishna",
                None,
            )
            .await
            .unwrap();
        enforcer.check_alerts("u1", "u1@example.com").await.unwrap();
        assert!(enforcer.is_blocked("u1").await);

        enforcer.override_budget("u1", "admin@example.com").await;

        assert!(!enforcer.is_blocked("u1").await);
        let check = enforcer.validate("u1", "u1@example.com", 0.10).await.unwrap();
        assert!(
            check.is_allowed(),
            "Override must bypass monthly and daily caps"
        );
    }

    #[tokio::test]
    async fn test_set_user_budget_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_, enforcer) = setup(dir.path()).await;

        let first = enforcer
            .set_user_budget("u1", "u1@example.com", 10.0, 2.0, 0.25)
            .await;
        let second = enforcer
            .set_user_budget("u1", "u1@example.com", 10.0, 2.0, 0.25)
            .await;

        assert_eq!(first.monthly_limit_usd, second.monthly_limit_usd);
        assert_eq!(first.daily_limit_usd, second.daily_limit_usd);
        assert_eq!(first.per_request_limit_usd, second.per_request_limit_usd);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_critical_sets_fallback_hint() {
        let dir = tempfile::tempdir().unwrap();
        let (accountant, enforcer) = setup(dir.path()).await;

        // Cap sized so spend lands between 90% and 100%.
        accountant
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
        let spent = accountant.monthly_used("u1").await.unwrap();
        enforcer
            .set_user_budget("u1", "u1@example.com", spent / 0.95, spent / 0.95, 0.50)
            .await;

        let alerts = enforcer.check_alerts("u1", "u1@example.com").await.unwrap();

        assert!(alerts.iter().any(|a| a.level == AlertLevel::Critical));
        assert!(!alerts.iter().any(|a| a.level == AlertLevel::Emergency));
        assert!(enforcer.fallback_hint("u1").await);
        assert!(!enforcer.is_blocked("u1").await);
    }
}
