//! Bearer-token validation.
//!
//! Two code paths selected by runtime mode. The development path accepts a
//! fixed set of well-known test tokens and otherwise decodes without
//! signature verification. The production path verifies RS256 signatures
//! against the tenant's JWKS document, checks expiry and issuer, and
//! tolerates a small set of audiences. Opaque tokens (no JWT structure)
//! are validated through the provider's user-info endpoint.
//!
//! Validated tokens are cached for up to 55 minutes so hot callers skip
//! signature work; the cache is swept on access.

use crate::auth::jwks::JwksCache;
use crate::auth::models::AuthenticatedUser;
use crate::auth::roles::RoleManager;
use crate::config::{AuthConfig, Environment};
use crate::error::AuthError;
use crate::logging::{log_debug, log_warn};
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Audience always accepted alongside the configured client id.
const GRAPH_AUDIENCE: &str = "00000003-0000-0000-c000-000000000000";
/// Fixed first-party service principal accepted as audience.
const SERVICE_PRINCIPAL_AUDIENCE: &str = "1950a258-227b-4e31-a9cf-717495945fc2";

const TOKEN_CACHE_TTL: Duration = Duration::from_secs(55 * 60);

/// Well-known development tokens and the synthetic users they map to.
const DEV_TOKENS: &[(&str, &str, &str)] = &[
    ("dev-token-user", "dev.user@vimarsh.local", "Dev User"),
    ("dev-token-admin", "dev.admin@vimarsh.local", "Dev Admin"),
    ("dev-token-super", "dev.super@vimarsh.local", "Dev Super Admin"),
];

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: Option<String>,
    oid: Option<String>,
    email: Option<String>,
    preferred_username: Option<String>,
    name: Option<String>,
    iss: Option<String>,
    aud: Option<serde_json::Value>,
    exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    sub: String,
    email: Option<String>,
    name: Option<String>,
}

/// Validates bearer tokens and derives the application user.
pub struct AuthService {
    config: AuthConfig,
    environment: Environment,
    roles: Arc<RoleManager>,
    jwks: JwksCache,
    userinfo_url: String,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, (AuthenticatedUser, Instant)>>,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("environment", &self.environment)
            .field("enabled", &self.config.enabled)
            .finish()
    }
}

impl AuthService {
    /// Build the service for the configured identity provider.
    pub fn new(config: AuthConfig, environment: Environment, roles: Arc<RoleManager>) -> Self {
        Self {
            config,
            environment,
            roles,
            jwks: JwksCache::new(),
            userinfo_url: "https://graph.microsoft.com/oidc/userinfo".to_string(),
            http: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Point the user-info validation at a different endpoint (tests).
    pub fn with_userinfo_url(mut self, url: impl Into<String>) -> Self {
        self.userinfo_url = url.into();
        self
    }

    /// Extract the bearer token from an `Authorization` header value.
    pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
        let header = header.ok_or(AuthError::NoToken)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError::NoToken)?;
        if token.is_empty() {
            return Err(AuthError::NoToken);
        }
        Ok(token)
    }

    /// Validate a bearer token and derive the application user.
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if let Some(user) = self.cached(token).await {
            return Ok(user);
        }

        let user = if self.environment.is_development() {
            self.authenticate_development(token)?
        } else {
            self.authenticate_production(token).await?
        };

        self.cache
            .lock()
            .await
            .insert(token.to_string(), (user.clone(), Instant::now()));
        Ok(user)
    }

    async fn cached(&self, token: &str) -> Option<AuthenticatedUser> {
        let mut cache = self.cache.lock().await;
        // Sweep expired entries while we hold the lock.
        cache.retain(|_, (_, at)| at.elapsed() < TOKEN_CACHE_TTL);
        cache.get(token).map(|(user, _)| user.clone())
    }

    // ------------------------------------------------------------------
    // Development path
    // ------------------------------------------------------------------

    fn authenticate_development(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if let Some((_, email, name)) = DEV_TOKENS.iter().find(|(t, _, _)| *t == token) {
            log_debug!(email = email, "Development test token accepted");
            return Ok(self.build_user(email, email, name));
        }

        // Any other token is decoded without signature verification.
        let header = decode_header(token)
            .map_err(|e| AuthError::token_invalid(format!("undecodable token: {e}")))?;
        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_aud = false;

        let data = decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| self.map_decode_error(token, e))?;
        self.user_from_claims(data.claims)
    }

    // ------------------------------------------------------------------
    // Production path
    // ------------------------------------------------------------------

    async fn authenticate_production(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let Ok(header) = decode_header(token) else {
            // No RS256 structure: opaque token, validate via user-info.
            return self.authenticate_opaque(token).await;
        };

        let kid = header
            .kid
            .ok_or_else(|| AuthError::token_invalid("token header carries no key id"))?;
        let jwks_url = self
            .config
            .jwks_url()
            .ok_or_else(|| AuthError::token_invalid("identity provider not configured"))?;
        let key = self.jwks.decoding_key(&jwks_url, &kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false; // tolerant audience check below

        let data = decode::<TokenClaims>(token, &key, &validation)
            .map_err(|e| self.map_decode_error(token, e))?;

        self.check_issuer(&data.claims)?;
        self.check_audience(&data.claims)?;
        self.user_from_claims(data.claims)
    }

    async fn authenticate_opaque(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        log_debug!("Validating opaque token via user-info endpoint");
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::token_invalid(format!("user-info call failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::token_invalid(format!(
                "user-info returned {}",
                response.status()
            )));
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .map_err(|e| AuthError::token_invalid(format!("user-info decode failed: {e}")))?;
        let email = info.email.ok_or(AuthError::ClaimsMissing {
            claim: "email".to_string(),
        })?;
        let name = info.name.unwrap_or_else(|| email.clone());
        Ok(self.build_user(&info.sub, &email, &name))
    }

    fn check_issuer(&self, claims: &TokenClaims) -> Result<(), AuthError> {
        let Some(expected) = self.config.expected_issuer() else {
            return Ok(());
        };
        let issuer = claims.iss.clone().unwrap_or_default();
        if issuer != expected {
            return Err(AuthError::IssuerInvalid { issuer });
        }
        Ok(())
    }

    /// Audience validation is tolerant: the token is accepted when its
    /// audience matches the client id, `api://{client id}`, the graph
    /// audience, or the fixed service-principal id.
    fn check_audience(&self, claims: &TokenClaims) -> Result<(), AuthError> {
        let client_id = self.config.client_id.clone().unwrap_or_default();
        let accepted = [
            client_id.clone(),
            format!("api://{client_id}"),
            GRAPH_AUDIENCE.to_string(),
            SERVICE_PRINCIPAL_AUDIENCE.to_string(),
        ];

        let audiences: Vec<String> = match &claims.aud {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        if audiences.iter().any(|a| accepted.contains(a)) {
            return Ok(());
        }
        Err(AuthError::AudienceInvalid {
            audience: audiences.join(","),
        })
    }

    fn user_from_claims(&self, claims: TokenClaims) -> Result<AuthenticatedUser, AuthError> {
        let subject = claims
            .oid
            .or(claims.sub)
            .ok_or(AuthError::ClaimsMissing {
                claim: "sub".to_string(),
            })?;
        let email = claims
            .email
            .or(claims.preferred_username)
            .ok_or(AuthError::ClaimsMissing {
                claim: "email".to_string(),
            })?;
        let name = claims.name.unwrap_or_else(|| email.clone());
        Ok(self.build_user(&subject, &email, &name))
    }

    fn build_user(&self, subject: &str, email: &str, name: &str) -> AuthenticatedUser {
        let email = email.to_lowercase();
        let role = self.roles.role(&email);
        AuthenticatedUser {
            subject: subject.to_string(),
            email: email.clone(),
            name: name.to_string(),
            permissions: self.roles.permissions(role),
            role,
            last_login: Utc::now(),
            active: true,
        }
    }

    fn map_decode_error(&self, token: &str, error: jsonwebtoken::errors::Error) -> AuthError {
        use jsonwebtoken::errors::ErrorKind;
        match error.kind() {
            ErrorKind::ExpiredSignature => {
                let expired_at = self.recover_exp(token).unwrap_or_default();
                log_warn!(expired_at = expired_at, "Expired bearer token rejected");
                AuthError::TokenExpired { expired_at }
            }
            _ => AuthError::token_invalid(error.to_string()),
        }
    }

    /// Best-effort read of `exp` from a token that already failed validation.
    fn recover_exp(&self, token: &str) -> Option<i64> {
        let header = decode_header(token).ok()?;
        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()?
            .claims
            .exp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::UserRole;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn dev_service() -> AuthService {
        let roles = Arc::new(RoleManager::new(
            &["dev.admin@vimarsh.local".to_string()],
            &["dev.super@vimarsh.local".to_string()],
        ));
        AuthService::new(
            AuthConfig {
                enabled: true,
                tenant_id: None,
                client_id: None,
                authority: None,
            },
            Environment::Development,
            roles,
        )
    }

    fn hs256_token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_extract_bearer_requires_scheme() {
        assert!(AuthService::extract_bearer(None).is_err());
        assert!(AuthService::extract_bearer(Some("Basic abc")).is_err());
        assert!(AuthService::extract_bearer(Some("Bearer ")).is_err());
        assert_eq!(
            AuthService::extract_bearer(Some("Bearer tok")).unwrap(),
            "tok"
        );
    }

    #[tokio::test]
    async fn test_dev_tokens_map_to_synthetic_users_with_roles() {
        let service = dev_service();

        let user = service.authenticate("dev-token-user").await.unwrap();
        assert_eq!(user.role, UserRole::User);

        let admin = service.authenticate("dev-token-admin").await.unwrap();
        assert_eq!(admin.role, UserRole::Admin);
        assert!(admin.permissions.can_access_admin_endpoints);

        let root = service.authenticate("dev-token-super").await.unwrap();
        assert_eq!(root.role, UserRole::SuperAdmin);
    }

    #[tokio::test]
    async fn test_dev_path_decodes_without_signature_check() {
        let service = dev_service();
        let exp = Utc::now().timestamp() + 3600;
        let token = hs256_token(json!({
            "sub": "subject-1",
            "email": "Someone@Example.com",
            "name": "Someone",
            "exp": exp,
        }));

        let user = service.authenticate(&token).await.unwrap();
        assert_eq!(user.subject, "subject-1");
        assert_eq!(user.email, "someone@example.com", "Email must lowercase");
        assert_eq!(user.role, UserRole::User);
    }

    #[tokio::test]
    async fn test_expired_token_maps_to_token_expired() {
        let service = dev_service();
        let exp = Utc::now().timestamp() - 600;
        let token = hs256_token(json!({
            "sub": "subject-1",
            "email": "someone@example.com",
            "exp": exp,
        }));

        let err = service.authenticate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired { expired_at } if expired_at == exp));
    }

    #[tokio::test]
    async fn test_missing_email_claim_is_rejected() {
        let service = dev_service();
        let token = hs256_token(json!({
            "sub": "subject-1",
            "exp": Utc::now().timestamp() + 3600,
        }));

        let err = service.authenticate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::ClaimsMissing { claim } if claim == "email"));
    }

    #[tokio::test]
    async fn test_garbage_token_is_invalid() {
        let service = dev_service();
        let err = service.authenticate("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid { .. }));
    }

    #[tokio::test]
    async fn test_validated_tokens_are_cached() {
        let service = dev_service();
        let first = service.authenticate("dev-token-user").await.unwrap();
        let second = service.authenticate("dev-token-user").await.unwrap();
        assert_eq!(first.subject, second.subject);
        assert_eq!(service.cache.lock().await.len(), 1);
    }

    #[test]
    fn test_audience_tolerance_set() {
        let service = AuthService::new(
            AuthConfig {
                enabled: true,
                tenant_id: Some("tenant-1".to_string()),
                client_id: Some("client-1".to_string()),
                authority: None,
            },
            Environment::Production,
            Arc::new(RoleManager::new(&[], &[])),
        );

        let ok_cases = [
            json!("client-1"),
            json!("api://client-1"),
            json!(GRAPH_AUDIENCE),
            json!([SERVICE_PRINCIPAL_AUDIENCE, "other"]),
        ];
        for aud in ok_cases {
            let claims = TokenClaims {
                sub: None,
                oid: None,
                email: None,
                preferred_username: None,
                name: None,
                iss: None,
                aud: Some(aud),
                exp: None,
            };
            assert!(service.check_audience(&claims).is_ok());
        }

        let claims = TokenClaims {
            sub: None,
            oid: None,
            email: None,
            preferred_username: None,
            name: None,
            iss: None,
            aud: Some(json!("someone-else")),
            exp: None,
        };
        assert!(matches!(
            service.check_audience(&claims),
            Err(AuthError::AudienceInvalid { .. })
        ));
    }
}
