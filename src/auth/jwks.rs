//! JWKS document fetch and cache.
//!
//! One cache entry per JWKS URL (one per tenant), refreshed when older than
//! one hour or when a token names a key id the cached document lacks. The
//! fetch itself runs under a 10-second timeout; a failed fetch leaves the
//! cache entry absent. Key-id misses trigger at most one refetch per
//! cooldown window so an attacker cannot force a fetch per request.

use crate::error::AuthError;
use crate::logging::{log_debug, log_warn};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use tokio::sync::Mutex;

const FETCH_TIMEOUT_SECS: u64 = 10;

struct CacheEntry {
    jwks: JwkSet,
    fetched_at: DateTime<Utc>,
}

/// Cache of provider JWKS documents keyed by URL.
pub struct JwksCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    client: reqwest::Client,
    ttl: Duration,
    cooldown: Duration,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache").field("ttl", &self.ttl).finish()
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

impl JwksCache {
    /// Create a cache with the production TTLs (1 hour, 5 minute cooldown).
    pub fn new() -> Self {
        Self::with_ttls(Duration::hours(1), Duration::minutes(5))
    }

    /// Create a cache with explicit TTLs (tests shrink these).
    pub fn with_ttls(ttl: Duration, cooldown: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            ttl,
            cooldown,
        }
    }

    /// Resolve the RS256 decoding key for `kid`, fetching the JWKS document
    /// when the cache entry is absent, expired, or lacks the key id.
    ///
    /// # Errors
    ///
    /// - [`AuthError::KeyNotFound`] when the (possibly refreshed) document
    ///   has no matching key.
    /// - [`AuthError::TokenInvalid`] when the fetch or key decode fails.
    pub async fn decoding_key(&self, url: &str, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(key) = self.cached_key(url, kid).await? {
            return Ok(key);
        }

        // Miss or stale entry: refetch unless a recent miss already did.
        if self.in_cooldown(url).await {
            return Err(AuthError::key_not_found(kid));
        }
        self.refresh(url).await?;

        match self.cached_key(url, kid).await? {
            Some(key) => Ok(key),
            None => {
                self.start_cooldown(url).await;
                Err(AuthError::key_not_found(kid))
            }
        }
    }

    async fn cached_key(&self, url: &str, kid: &str) -> Result<Option<DecodingKey>, AuthError> {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(url) else {
            return Ok(None);
        };
        if Utc::now() - entry.fetched_at > self.ttl {
            log_debug!(url = url, "JWKS cache entry expired");
            return Ok(None);
        }
        match entry.jwks.find(kid) {
            Some(jwk) => DecodingKey::from_jwk(jwk)
                .map(Some)
                .map_err(|e| AuthError::token_invalid(format!("unusable JWK: {e}"))),
            None => Ok(None),
        }
    }

    async fn refresh(&self, url: &str) -> Result<(), AuthError> {
        log_debug!(url = url, "Fetching JWKS document");
        let response = self.client.get(url).send().await.map_err(|e| {
            log_warn!(url = url, error = %e, "JWKS fetch failed");
            AuthError::token_invalid(format!("JWKS fetch failed: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(AuthError::token_invalid(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::token_invalid(format!("JWKS decode failed: {e}")))?;

        self.entries.lock().await.insert(
            url.to_string(),
            CacheEntry {
                jwks,
                fetched_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn in_cooldown(&self, url: &str) -> bool {
        // Only applies when a fresh entry exists; expiry always refetches.
        let entries = self.entries.lock().await;
        let fresh = entries
            .get(url)
            .is_some_and(|e| Utc::now() - e.fetched_at <= self.ttl);
        drop(entries);
        if !fresh {
            return false;
        }
        self.cooldowns
            .lock()
            .await
            .get(url)
            .is_some_and(|since| Utc::now() - *since < self.cooldown)
    }

    async fn start_cooldown(&self, url: &str) {
        self.cooldowns
            .lock()
            .await
            .insert(url.to_string(), Utc::now());
    }
}
