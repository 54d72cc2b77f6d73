//! Endpoint handlers and the single error-to-status translation.

use crate::error::CoreError;
use crate::pipeline::{GuidancePipeline, GuidanceRequest, GuidanceResult};
use crate::security::Redactor;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Translate a typed error into the HTTP response. This is the only place
/// errors become status codes; detailed messages survive only in
/// development mode.
fn error_response(pipeline: &GuidancePipeline, error: &CoreError) -> Response {
    let development = pipeline.core().config.environment.is_development();
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Redactor::redact_value(&json!({
        "error": {
            "code": error.error_code(),
            "message": error.user_message(development),
        }
    }));
    (status, Json(body)).into_response()
}

fn redacted_ok(body: Value) -> Response {
    (StatusCode::OK, Json(Redactor::redact_value(&body))).into_response()
}

/// Optional caller-supplied deadline, in milliseconds.
fn caller_deadline(headers: &HeaderMap) -> Option<std::time::Duration> {
    headers
        .get("x-request-timeout-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_millis)
}

/// `POST /guidance`
pub async fn guidance(
    State(pipeline): State<GuidancePipeline>,
    headers: HeaderMap,
    Json(request): Json<GuidanceRequest>,
) -> Response {
    let deadline = caller_deadline(&headers);
    match pipeline
        .handle_guidance_with_deadline(bearer(&headers), request, deadline)
        .await
    {
        Ok(GuidanceResult::Served(response)) => match serde_json::to_value(&response) {
            Ok(body) => redacted_ok(body),
            Err(_) => error_response(
                &pipeline,
                &CoreError::Storage(crate::error::StorageError::unavailable(
                    "response serialization failed",
                )),
            ),
        },
        Ok(GuidanceResult::BudgetDenied {
            refusal,
            personality_id,
            error,
        }) => {
            let core_error = CoreError::Budget(error);
            let development = pipeline.core().config.environment.is_development();
            let body = Redactor::redact_value(&json!({
                "content": refusal,
                "citations": [],
                "personality_id": personality_id,
                "error": {
                    "code": core_error.error_code(),
                    "message": core_error.user_message(development),
                }
            }));
            (StatusCode::FORBIDDEN, Json(body)).into_response()
        }
        Err(error) => error_response(&pipeline, &error),
    }
}

/// `GET /admin/role`
pub async fn admin_role(
    State(pipeline): State<GuidancePipeline>,
    headers: HeaderMap,
) -> Response {
    match pipeline.require_admin(bearer(&headers)).await {
        Ok(user) => {
            let record = json!({
                "user_id": user.subject,
                "user_email": user.email,
                "name": user.name,
                "role": user.role,
            });
            redacted_ok(json!({
                "user": Redactor::redact_user_record(&record),
                "role": user.role,
                "permissions": user.permissions,
            }))
        }
        Err(error) => error_response(&pipeline, &error),
    }
}

/// Body for `POST /admin/budget/{user_id}`.
#[derive(Debug, Deserialize)]
pub struct SetBudgetRequest {
    /// Monthly cap in USD.
    pub monthly_usd: f64,
    /// Daily cap in USD.
    pub daily_usd: f64,
    /// Per-request cap in USD.
    pub per_request_usd: f64,
}

/// `POST /admin/budget/{user_id}`
pub async fn admin_set_budget(
    State(pipeline): State<GuidancePipeline>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SetBudgetRequest>,
) -> Response {
    let admin = match pipeline.require_admin(bearer(&headers)).await {
        Ok(admin) => admin,
        Err(error) => return error_response(&pipeline, &error),
    };
    if !admin.permissions.can_configure_budgets {
        return error_response(
            &pipeline,
            &crate::error::AuthzError::InsufficientScope {
                permission: "can_configure_budgets".to_string(),
            }
            .into(),
        );
    }

    // The scoped-id guard already validated the path id.
    let limit = pipeline
        .core()
        .enforcer
        .set_user_budget(
            &user_id,
            &admin.email,
            body.monthly_usd,
            body.daily_usd,
            body.per_request_usd,
        )
        .await;
    redacted_ok(json!({
        "user_id": limit.user_id,
        "monthly_usd": limit.monthly_limit_usd,
        "daily_usd": limit.daily_limit_usd,
        "per_request_usd": limit.per_request_limit_usd,
        "updated_by": admin.email,
    }))
}

/// `DELETE /admin/block/{user_id}`
pub async fn admin_unblock(
    State(pipeline): State<GuidancePipeline>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let admin = match pipeline.require_admin(bearer(&headers)).await {
        Ok(admin) => admin,
        Err(error) => return error_response(&pipeline, &error),
    };
    if !admin.permissions.can_block_users {
        return error_response(
            &pipeline,
            &crate::error::AuthzError::InsufficientScope {
                permission: "can_block_users".to_string(),
            }
            .into(),
        );
    }

    // The scoped-id guard already validated the path id.
    let removed = pipeline.core().enforcer.unblock(&user_id, &admin.email).await;
    pipeline.core().rate_limiter.unblock(&user_id);
    redacted_ok(json!({
        "user_id": user_id,
        "unblocked": removed,
        "cleared_by": admin.email,
    }))
}

/// `GET /health`
pub async fn health(State(pipeline): State<GuidancePipeline>) -> Response {
    let core = pipeline.core();
    let consistency = core
        .transactions
        .validate_consistency()
        .await
        .map(|report| json!(report))
        .unwrap_or_else(|e| json!({ "error": e.to_string() }));

    redacted_ok(json!({
        "environment": core.config.environment,
        "sections": core.config.validation(),
        "store_mode": format!("{:?}", core.transactions.store().mode()),
        "transactions": consistency,
        "personalities": core.registry.ids().len(),
    }))
}
