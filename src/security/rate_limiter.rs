//! Per-identifier rate limiting with a temporary block list.
//!
//! Three keyed windows: 100 rpm for general endpoints, 50 rpm for admin
//! endpoints, 20 rpm for auth-heavy endpoints. A violation puts the
//! identifier on a 15-minute block list. Counters and the block list are
//! guarded by their own locks, never a global one, and are swept on access.

use crate::error::RateError;
use crate::logging::{log_debug, log_warn};
use crate::security::redactor::Redactor;
use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const GENERAL_RPM: u32 = 100;
const ADMIN_RPM: u32 = 50;
const AUTH_RPM: u32 = 20;
const BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);
const REQUEST_LOG_CAPACITY: usize = 1_000;
/// Idle per-identifier counters are dropped every this many checks.
const SWEEP_INTERVAL: u32 = 1_024;

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Which window a request counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// Guidance and other user-facing endpoints.
    General,
    /// Admin endpoints.
    Admin,
    /// Auth-heavy endpoints.
    Auth,
}

impl RateLimitScope {
    /// The per-minute limit for this scope.
    pub fn limit(self) -> u32 {
        match self {
            Self::General => GENERAL_RPM,
            Self::Admin => ADMIN_RPM,
            Self::Auth => AUTH_RPM,
        }
    }
}

/// One entry in the rolling in-memory request log.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    /// The identifier the request counted against.
    pub identifier: String,
    /// Window scope.
    pub scope: RateLimitScope,
    /// Whether the request was admitted.
    pub allowed: bool,
    /// When the decision was made.
    pub at: DateTime<Utc>,
}

/// Sliding-window rate limiter with a 15-minute block list.
pub struct RateLimiter {
    general: KeyedLimiter,
    admin: KeyedLimiter,
    auth: KeyedLimiter,
    blocked: Mutex<HashMap<String, Instant>>,
    request_log: Mutex<VecDeque<RequestLogEntry>>,
    checks: std::sync::atomic::AtomicU32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter with the production window sizes.
    pub fn new() -> Self {
        let quota = |rpm: u32| Quota::per_minute(NonZeroU32::new(rpm).expect("nonzero rpm"));
        Self {
            general: GovernorLimiter::keyed(quota(GENERAL_RPM)),
            admin: GovernorLimiter::keyed(quota(ADMIN_RPM)),
            auth: GovernorLimiter::keyed(quota(AUTH_RPM)),
            blocked: Mutex::new(HashMap::new()),
            request_log: Mutex::new(VecDeque::new()),
            checks: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Admit or reject one request for `identifier` in `scope`.
    ///
    /// # Errors
    ///
    /// - [`RateError::IpBlocked`] when the identifier is on the block list.
    /// - [`RateError::RateLimitExceeded`] on a window violation; the
    ///   identifier is then blocked for 15 minutes.
    pub fn check(&self, identifier: &str, scope: RateLimitScope) -> Result<(), RateError> {
        // Idle counters are swept on access, never by a background task.
        let checks = self
            .checks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if checks % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.general.retain_recent();
            self.admin.retain_recent();
            self.auth.retain_recent();
        }

        if let Some(remaining) = self.block_remaining(identifier) {
            self.log_request(identifier, scope, false);
            return Err(RateError::IpBlocked {
                remaining_seconds: remaining.as_secs(),
            });
        }

        let limiter = match scope {
            RateLimitScope::General => &self.general,
            RateLimitScope::Admin => &self.admin,
            RateLimitScope::Auth => &self.auth,
        };

        match limiter.check_key(&identifier.to_string()) {
            Ok(()) => {
                self.log_request(identifier, scope, true);
                Ok(())
            }
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                // Security events pass through the same redactor as responses.
                let event = Redactor::redact_value(&serde_json::json!({
                    "event": "rate_limit_violation",
                    "identifier": identifier,
                    "scope": format!("{scope:?}"),
                    "limit": scope.limit(),
                    "retry_after_ms": wait.as_millis() as u64,
                }));
                log_warn!(event = %event, "Rate limit violated, identifier blocked");
                self.block(identifier);
                self.log_request(identifier, scope, false);
                Err(RateError::RateLimitExceeded {
                    limit: scope.limit(),
                })
            }
        }
    }

    /// Whether the identifier is currently blocked.
    pub fn is_blocked(&self, identifier: &str) -> bool {
        self.block_remaining(identifier).is_some()
    }

    /// Remove an identifier from the block list (admin action).
    pub fn unblock(&self, identifier: &str) {
        let removed = self
            .blocked
            .lock()
            .expect("block list lock")
            .remove(identifier)
            .is_some();
        if removed {
            log_debug!(identifier = identifier, "Identifier unblocked");
        }
    }

    /// A copy of the rolling request log, oldest first.
    pub fn recent_requests(&self) -> Vec<RequestLogEntry> {
        self.request_log
            .lock()
            .expect("request log lock")
            .iter()
            .cloned()
            .collect()
    }

    fn block(&self, identifier: &str) {
        self.blocked
            .lock()
            .expect("block list lock")
            .insert(identifier.to_string(), Instant::now());
    }

    fn block_remaining(&self, identifier: &str) -> Option<Duration> {
        let mut blocked = self.blocked.lock().expect("block list lock");
        // Sweep expired entries on access.
        blocked.retain(|_, since| since.elapsed() < BLOCK_DURATION);
        blocked
            .get(identifier)
            .map(|since| BLOCK_DURATION - since.elapsed())
    }

    fn log_request(&self, identifier: &str, scope: RateLimitScope, allowed: bool) {
        let mut log = self.request_log.lock().expect("request log lock");
        if log.len() >= REQUEST_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(RequestLogEntry {
            identifier: identifier.to_string(),
            scope,
            allowed,
            at: Utc::now(),
        });
    }
}
