//! The guidance pipeline: auth, sanitize, budget check, retrieve, render,
//! generate, safety-validate, persist, alert, redact.
//!
//! [`GuidanceCore`] is the dependency-injection root built once at startup;
//! the HTTP layer holds a reference and passes requests to
//! [`GuidancePipeline`]. Within one request the pipeline is strictly
//! sequential; across requests everything is shared behind per-structure
//! locks.
//!
//! State machine per request:
//! `Received -> Authenticated -> Sanitized -> BudgetChecked ->
//! (Denied | Retrieved -> Prompted -> Generated -> SafetyValidated ->
//! Persisted) -> Responded`. Errors on persistence do not change the
//! response already produced; they roll back the transaction and log at
//! ERROR severity.

use crate::auth::{AuthService, AuthenticatedUser, RoleManager};
use crate::budget::{BudgetCheck, BudgetEnforcer, CostAccountant};
use crate::config::CoreConfig;
use crate::error::{AuthzError, BudgetError, CoreError};
use crate::llm::{CannedBackend, DispatchedResponse, GeminiBackend, GenerationBackend, LlmDispatcher};
use crate::logging::{log_debug, log_error, log_info};
use crate::personality::{Personality, PersonalityRegistry, PromptRenderer};
use crate::records::{Conversation, QualityClass, StoredRecord};
use crate::retrieval::{FlatVectorIndex, HashingEmbedder, QueryEmbedder, VectorSearcher};
use crate::safety::SafetyFilter;
use crate::security::{RateLimitScope, RateLimiter, Sanitizer};
use crate::storage::transaction::CONVERSATIONS_COLLECTION;
use crate::storage::{LocalStore, TokenStore, TransactionManager};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Chunks retrieved per request.
const RETRIEVAL_K: usize = 3;
/// Minimum similarity for a chunk to count as grounding.
const RETRIEVAL_MIN_SCORE: f32 = 0.05;
/// Conversation turns included in the prompt.
const HISTORY_LIMIT: usize = 5;

/// Pipeline progress for one request, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Request received at the edge.
    Received,
    /// Bearer token validated.
    Authenticated,
    /// Inputs sanitized.
    Sanitized,
    /// Budget validated.
    BudgetChecked,
    /// Budget denial; terminal alongside `Rejected`.
    Denied,
    /// Chunks retrieved.
    Retrieved,
    /// Prompt rendered.
    Prompted,
    /// LLM produced content.
    Generated,
    /// Safety filter applied.
    SafetyValidated,
    /// Usage and audit records written.
    Persisted,
    /// Response returned.
    Responded,
}

/// One incoming guidance request, pre-sanitization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceRequest {
    /// The user's question.
    pub query: String,
    /// Requested personality id.
    pub personality_id: String,
    /// Session id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Response language; defaults to the configured language.
    #[serde(default)]
    pub language: Option<String>,
}

/// Serving metadata attached to every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Characters in the served content.
    pub character_count: usize,
    /// The personality's character budget.
    pub max_allowed: usize,
    /// Quality class.
    pub quality: QualityClass,
    /// Provider attempts consumed.
    pub attempt: u32,
    /// Model name.
    pub model: String,
    /// Wall-clock serving time.
    pub response_time_ms: u64,
}

/// A served guidance response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceResponse {
    /// The response text.
    pub content: String,
    /// Citations grounding the response.
    pub citations: Vec<String>,
    /// Personality that served it.
    pub personality_id: String,
    /// Serving metadata.
    pub metadata: ResponseMetadata,
}

/// Pipeline outcome: served, or denied by budget with a personality-
/// flavored refusal the edge returns with status 403.
#[derive(Debug, Clone)]
pub enum GuidanceResult {
    /// A generated (or fallback) response to return with status 200.
    Served(GuidanceResponse),
    /// A budget denial; no LLM call was made and no usage persisted.
    BudgetDenied {
        /// Refusal text beginning with the personality's greeting.
        refusal: String,
        /// Personality the refusal speaks as.
        personality_id: String,
        /// The denial reason.
        error: BudgetError,
    },
}

/// Root object owning every component, built once at startup.
pub struct GuidanceCore {
    /// Resolved configuration.
    pub config: CoreConfig,
    /// Token validation.
    pub auth: Arc<AuthService>,
    /// Role derivation.
    pub roles: Arc<RoleManager>,
    /// Rate limiting and block list.
    pub rate_limiter: Arc<RateLimiter>,
    /// Spend accounting.
    pub accountant: Arc<CostAccountant>,
    /// Budget caps and alerts.
    pub enforcer: Arc<BudgetEnforcer>,
    /// Dual-store transactions.
    pub transactions: Arc<TransactionManager>,
    /// Personality roster.
    pub registry: Arc<PersonalityRegistry>,
    /// Prompt templates.
    pub renderer: Arc<PromptRenderer>,
    /// LLM dispatch.
    pub dispatcher: LlmDispatcher,
    /// Vector search.
    pub searcher: Arc<dyn VectorSearcher>,
    /// Query embedding.
    pub embedder: Arc<dyn QueryEmbedder>,
}

impl std::fmt::Debug for GuidanceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuidanceCore")
            .field("environment", &self.config.environment)
            .finish()
    }
}

impl GuidanceCore {
    /// Build the full core from configuration.
    pub fn from_config(config: CoreConfig) -> Result<Arc<Self>, CoreError> {
        let store = TokenStore::from_config(&config.storage)?;
        Self::assemble(config, store, Arc::new(FlatVectorIndex::new()), None)
    }

    /// Build a development core over an explicit local directory, with an
    /// externally seeded index.
    pub fn development(
        local_dir: &std::path::Path,
        index: Arc<FlatVectorIndex>,
    ) -> Result<Arc<Self>, CoreError> {
        let config = CoreConfig::for_development(local_dir.display().to_string());
        let store = TokenStore::local_only(LocalStore::new(local_dir)?);
        Self::assemble(config, store, index, None)
    }

    /// Development core with an explicit generation backend (tests drive
    /// the dispatcher with scripted providers).
    pub fn development_with_backend(
        local_dir: &std::path::Path,
        index: Arc<FlatVectorIndex>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Arc<Self>, CoreError> {
        let config = CoreConfig::for_development(local_dir.display().to_string());
        let store = TokenStore::local_only(LocalStore::new(local_dir)?);
        Self::assemble(config, store, index, Some(backend))
    }

    fn assemble(
        config: CoreConfig,
        store: TokenStore,
        index: Arc<FlatVectorIndex>,
        backend_override: Option<Arc<dyn GenerationBackend>>,
    ) -> Result<Arc<Self>, CoreError> {
        let roles = Arc::new(RoleManager::new(
            &config.admin_emails,
            &config.super_admin_emails,
        ));
        let auth = Arc::new(AuthService::new(
            config.auth.clone(),
            config.environment,
            roles.clone(),
        ));
        let transactions = Arc::new(TransactionManager::new(
            store,
            config.storage.local_dir.clone(),
        ));
        let accountant = Arc::new(CostAccountant::new(transactions.clone())?);
        let enforcer = Arc::new(BudgetEnforcer::new(
            accountant.clone(),
            config.budget_defaults,
        ));
        let registry = Arc::new(PersonalityRegistry::new());
        let renderer = Arc::new(PromptRenderer::new()?);

        let backend: Arc<dyn GenerationBackend> = match (backend_override, &config.llm.api_key) {
            (Some(backend), _) => backend,
            (None, Some(key)) => {
                Arc::new(GeminiBackend::new(key.clone(), config.llm.model.clone()))
            }
            (None, None) => Arc::new(CannedBackend::new(config.llm.model.clone())),
        };
        let mut dispatcher =
            LlmDispatcher::new(backend, config.llm.max_tokens, config.llm.temperature);
        if config.environment.is_development() {
            // Development keeps retry pacing snappy.
            dispatcher = dispatcher.with_backoff_base(std::time::Duration::from_millis(50));
        }

        log_info!(
            environment = ?config.environment,
            personalities = registry.ids().len(),
            "Guidance core assembled"
        );

        Ok(Arc::new(Self {
            auth,
            roles,
            rate_limiter: Arc::new(RateLimiter::new()),
            accountant,
            enforcer,
            transactions,
            registry,
            renderer,
            dispatcher,
            searcher: index,
            embedder: Arc::new(HashingEmbedder::new(128)),
            config,
        }))
    }
}

/// The orchestrator. Stateless; all state lives in [`GuidanceCore`].
#[derive(Debug, Clone)]
pub struct GuidancePipeline {
    core: Arc<GuidanceCore>,
}

impl GuidancePipeline {
    /// Wrap a core.
    pub fn new(core: Arc<GuidanceCore>) -> Self {
        Self { core }
    }

    /// The underlying core.
    pub fn core(&self) -> &Arc<GuidanceCore> {
        &self.core
    }

    /// Serve one guidance request end to end.
    ///
    /// # Errors
    ///
    /// Auth, rate, and sanitize failures short-circuit with no LLM call
    /// and no persistence. Budget denials return
    /// [`GuidanceResult::BudgetDenied`] rather than an error so the edge
    /// can flavor the body.
    pub async fn handle_guidance(
        &self,
        bearer_header: Option<&str>,
        request: GuidanceRequest,
    ) -> Result<GuidanceResult, CoreError> {
        let mut state = RequestState::Received;

        // 1. Authenticate.
        let token = AuthService::extract_bearer(bearer_header)?;
        let user = self.core.auth.authenticate(token).await?;
        self.transition(&mut state, RequestState::Authenticated, &user.subject);

        // 2. Permission gate.
        if !user.permissions.can_use_guidance {
            return Err(AuthzError::InsufficientScope {
                permission: "can_use_guidance".to_string(),
            }
            .into());
        }

        // 3. Rate limit, then sanitize every inbound field.
        self.core
            .rate_limiter
            .check(&user.subject, RateLimitScope::General)?;
        let query = Sanitizer::sanitize_query(&request.query)?;
        let personality_id =
            Sanitizer::sanitize_identifier("personality_id", &request.personality_id)?;
        let session_id = match &request.session_id {
            Some(session_id) => Sanitizer::sanitize_identifier("session_id", session_id)?,
            None => Uuid::new_v4().to_string(),
        };
        let language = self.resolve_language(request.language.as_deref())?;
        self.transition(&mut state, RequestState::Sanitized, &user.subject);

        let personality = self.core.registry.resolve(&personality_id).clone();

        // 4. Conservative cost estimate; 5. budget validation before any
        // retrieval or LLM work.
        let estimated = self.core.accountant.estimate_cost(
            &self.core.config.llm.model,
            &query,
            personality.max_chars,
        );
        match self
            .core
            .enforcer
            .validate(&user.subject, &user.email, estimated)
            .await?
        {
            BudgetCheck::Allowed => {}
            BudgetCheck::Denied(error) => {
                self.transition(&mut state, RequestState::Denied, &user.subject);
                log_info!(
                    user_id = %user.subject,
                    error = %error,
                    "Budget denial, serving refusal without generation"
                );
                return Ok(GuidanceResult::BudgetDenied {
                    refusal: personality.budget_refusal(),
                    personality_id: personality.id.clone(),
                    error,
                });
            }
        }
        self.transition(&mut state, RequestState::BudgetChecked, &user.subject);

        // 6. Retrieve grounding chunks from the personality's partition.
        let hits = self.retrieve(&personality, &query).await;
        self.transition(&mut state, RequestState::Retrieved, &user.subject);

        // 7. Render the prompt with chunks, bounded history, and language.
        let history = self.session_history(&session_id).await;
        let prompt = self.render_prompt(&personality, &query, &hits, &history, &language);
        self.transition(&mut state, RequestState::Prompted, &user.subject);

        // 8. Generate, honoring the critical-alert fallback hint.
        let mut response = if self.core.enforcer.fallback_hint(&user.subject).await {
            log_debug!(user_id = %user.subject, "Fallback hint set, skipping generation");
            fallback_dispatch(&personality, &self.core.config.llm.model)
        } else {
            self.core.dispatcher.generate(&personality, &prompt).await
        };
        self.transition(&mut state, RequestState::Generated, &user.subject);

        // 9. Safety-filter the generated text; re-enforce the budget.
        let verdict = SafetyFilter::validate(&response.content);
        if !verdict.passed {
            let (content, _) = crate::llm::dispatcher::enforce_char_budget(
                &personality.safe_fallback,
                personality.max_chars,
            );
            response.content = content;
            response.quality = QualityClass::Fallback;
        }
        self.transition(&mut state, RequestState::SafetyValidated, &user.subject);

        let citations = collect_citations(&hits);
        let served = GuidanceResponse {
            content: response.content.clone(),
            citations: citations.clone(),
            personality_id: personality.id.clone(),
            metadata: ResponseMetadata {
                character_count: response.content.chars().count(),
                max_allowed: personality.max_chars,
                quality: response.quality,
                attempt: response.attempts,
                model: response.model.clone(),
                response_time_ms: response.response_time_ms,
            },
        };

        // 10. Persist usage + stats + audit in one transaction. A failure
        // here must not alter the response already produced.
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user.subject.clone(),
            session_id: session_id.clone(),
            timestamp: Utc::now(),
            question: query.clone(),
            response: served.content.clone(),
            citations,
            personality: personality.id.clone(),
        };
        if let Err(e) = self
            .core
            .accountant
            .record_usage(
                &user.subject,
                &user.email,
                &session_id,
                &response.model,
                response.input_tokens,
                response.output_tokens,
                response.quality,
                &personality.id,
                Some(conversation),
            )
            .await
        {
            log_error!(
                user_id = %user.subject,
                error = %e,
                "Persistence failed after serving; transaction rolled back"
            );
        } else {
            self.transition(&mut state, RequestState::Persisted, &user.subject);
        }

        // 11. Alert thresholds for this user's new spend level.
        if let Err(e) = self
            .core
            .enforcer
            .check_alerts(&user.subject, &user.email)
            .await
        {
            log_error!(user_id = %user.subject, error = %e, "Alert evaluation failed");
        }

        self.transition(&mut state, RequestState::Responded, &user.subject);
        Ok(GuidanceResult::Served(served))
    }

    /// Serve one guidance request under a caller-supplied deadline. On
    /// expiry the in-flight subcalls are cancelled and a timeout error is
    /// returned.
    pub async fn handle_guidance_with_deadline(
        &self,
        bearer_header: Option<&str>,
        request: GuidanceRequest,
        deadline: Option<std::time::Duration>,
    ) -> Result<GuidanceResult, CoreError> {
        match deadline {
            None => self.handle_guidance(bearer_header, request).await,
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.handle_guidance(bearer_header, request))
                    .await
                {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        log_error!(
                            deadline_ms = deadline.as_millis() as u64,
                            "Caller deadline expired, request abandoned"
                        );
                        Err(crate::error::ProviderError::Timeout {
                            timeout_seconds: deadline.as_secs(),
                        }
                        .into())
                    }
                }
            }
        }
    }

    /// The authenticated user for an admin endpoint, or an authz error.
    pub async fn require_admin(
        &self,
        bearer_header: Option<&str>,
    ) -> Result<AuthenticatedUser, CoreError> {
        let token = AuthService::extract_bearer(bearer_header)?;
        let user = self.core.auth.authenticate(token).await?;
        self.core
            .rate_limiter
            .check(&user.subject, RateLimitScope::Admin)?;
        if !user.permissions.can_access_admin_endpoints {
            return Err(AuthzError::InsufficientRole {
                required: "admin".to_string(),
                actual: user.role.as_str().to_string(),
            }
            .into());
        }
        Ok(user)
    }

    fn resolve_language(&self, requested: Option<&str>) -> Result<String, CoreError> {
        let app = &self.core.config.app;
        match requested {
            None => Ok(app.default_language.clone()),
            Some(raw) => {
                let language = Sanitizer::sanitize_string(raw, 50)?;
                if app
                    .supported_languages
                    .iter()
                    .any(|l| l.eq_ignore_ascii_case(&language))
                {
                    Ok(language)
                } else {
                    Ok(app.default_language.clone())
                }
            }
        }
    }

    async fn retrieve(
        &self,
        personality: &Personality,
        query: &str,
    ) -> Vec<crate::retrieval::SearchHit> {
        let vector = match self.core.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                log_error!(error = %e, "Query embedding failed, serving without grounding");
                return Vec::new();
            }
        };
        match self
            .core
            .searcher
            .search(
                &vector,
                RETRIEVAL_K,
                &personality.corpus_partition,
                RETRIEVAL_MIN_SCORE,
                None,
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                log_error!(error = %e, "Vector search failed, serving without grounding");
                Vec::new()
            }
        }
    }

    async fn session_history(&self, session_id: &str) -> Vec<Conversation> {
        let records = match self
            .core
            .transactions
            .store()
            .read_all(CONVERSATIONS_COLLECTION)
            .await
        {
            Ok(records) => records,
            Err(_) => return Vec::new(),
        };
        let mut turns: Vec<Conversation> = records
            .into_iter()
            .filter_map(|r| match r {
                StoredRecord::Conversation(c) if c.session_id == session_id => Some(c),
                _ => None,
            })
            .collect();
        // Clients sort by timestamp; so does the prompt.
        turns.sort_by_key(|c| c.timestamp);
        let skip = turns.len().saturating_sub(HISTORY_LIMIT);
        turns.into_iter().skip(skip).collect()
    }

    fn render_prompt(
        &self,
        personality: &Personality,
        query: &str,
        hits: &[crate::retrieval::SearchHit],
        history: &[Conversation],
        language: &str,
    ) -> String {
        let context_text = if hits.is_empty() {
            String::new()
        } else {
            hits.iter()
                .map(|h| format!("[{}] {}", h.chunk.source, h.chunk.text))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let history_text = history
            .iter()
            .map(|c| format!("Q: {}\nA: {}", c.question, c.response))
            .collect::<Vec<_>>()
            .join("\n");

        let mut context = HashMap::from([
            ("personality_name".to_string(), personality.display_name.clone()),
            ("tone".to_string(), personality.tone.clone()),
            ("query".to_string(), query.to_string()),
            ("language".to_string(), language.to_string()),
            ("max_chars".to_string(), personality.max_chars.to_string()),
        ]);
        if !context_text.is_empty() {
            context.insert("context".to_string(), context_text);
        }
        if !history_text.is_empty() {
            context.insert("history".to_string(), history_text);
        }

        self.core
            .renderer
            .render_guidance(personality.domain, &personality.id, &context)
    }

    fn transition(&self, state: &mut RequestState, next: RequestState, subject: &str) {
        log_debug!(user_id = subject, from = ?state, to = ?next, "Pipeline transition");
        *state = next;
    }
}

fn fallback_dispatch(personality: &Personality, model: &str) -> DispatchedResponse {
    let (content, _) = crate::llm::dispatcher::enforce_char_budget(
        &personality.fallback_response(),
        personality.max_chars,
    );
    DispatchedResponse {
        content,
        quality: QualityClass::Fallback,
        attempts: 0,
        model: model.to_string(),
        response_time_ms: 0,
        input_tokens: 0,
        output_tokens: 0,
        citations_expected: personality.citations_required,
    }
}

fn collect_citations(hits: &[crate::retrieval::SearchHit]) -> Vec<String> {
    let mut citations = Vec::new();
    for hit in hits {
        if hit.chunk.citations.is_empty() {
            if !citations.contains(&hit.chunk.source) {
                citations.push(hit.chunk.source.clone());
            }
        } else {
            for citation in &hit.chunk.citations {
                if !citations.contains(citation) {
                    citations.push(citation.clone());
                }
            }
        }
    }
    citations
}
