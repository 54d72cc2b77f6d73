//! Edge middleware.
//!
//! The scoped-id guard extracts `user_id`, `budget_id`, and `role_id` from
//! URL segments matching `/users/{id}/...`, `/budgets/{id}/...`, and
//! `/roles/{id}/...` (plus the admin routes `/admin/budget/{id}` and
//! `/admin/block/{id}`, whose segment carries a user id), validates their
//! shape, and rejects malformed ids before any handler runs. This guard is
//! the single enforcement point for path ids; handlers receive only ids
//! that already passed the identifier rules.

use crate::security::Sanitizer;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;

/// Extract scoped ids from a request path.
///
/// `/users/u-1/budgets/b-2/` yields `{"user_id": "u-1", "budget_id": "b-2"}`;
/// `/admin/budget/u-1` and `/admin/block/u-1` yield `{"user_id": "u-1"}`.
pub fn extract_scoped_ids(path: &str) -> HashMap<String, String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut ids = HashMap::new();
    for window in segments.windows(2) {
        let key = match window[0] {
            "users" | "budget" | "block" => "user_id",
            "budgets" => "budget_id",
            "roles" => "role_id",
            _ => continue,
        };
        ids.entry(key.to_string())
            .or_insert_with(|| window[1].to_string());
    }
    ids
}

/// Reject requests whose scoped path ids fail the identifier rules.
pub async fn scoped_id_guard(request: Request, next: Next) -> Response {
    let ids = extract_scoped_ids(request.uri().path());
    for (field, value) in &ids {
        if Sanitizer::sanitize_identifier(field, value).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": {
                        "code": "INPUT_FORMAT",
                        "message": format!("invalid {field} in path"),
                    }
                })),
            )
                .into_response();
        }
    }
    next.run(request).await
}
