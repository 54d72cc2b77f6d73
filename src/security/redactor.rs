//! Outgoing response redaction.
//!
//! Walks nested JSON and replaces the value of any field whose key matches
//! the sensitive-key pattern with `[REDACTED]`. A specialized user-record
//! projection keeps only a safe subset of fields, masks email local parts,
//! and rounds monetary fields to two decimals. Security-event logging
//! routes through the same redactor as responses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

const REDACTED: &str = "[REDACTED]";

static SENSITIVE_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(password|secret|key|token|api[_-]?key|connection[_-]?string|private[_-]?key|jwt|bearer|authorization|credentials|private|internal|debug|trace|stack|error_detail)",
    )
    .expect("sensitive key regex")
});

/// Fields the user-record projection keeps.
const SAFE_USER_FIELDS: &[&str] = &[
    "user_id",
    "user_email",
    "name",
    "role",
    "total_requests",
    "total_tokens",
    "total_cost",
    "total_cost_usd",
    "current_month_cost_usd",
    "last_request",
    "blocked",
];

/// Stateless response redactor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Redactor;

impl Redactor {
    /// Replace every sensitive-keyed field in a JSON tree with `[REDACTED]`.
    pub fn redact_value(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut redacted = Map::new();
                for (key, inner) in map {
                    if SENSITIVE_KEY_RE.is_match(key) {
                        redacted.insert(key.clone(), Value::String(REDACTED.to_string()));
                    } else {
                        redacted.insert(key.clone(), Self::redact_value(inner));
                    }
                }
                Value::Object(redacted)
            }
            Value::Array(items) => Value::Array(items.iter().map(Self::redact_value).collect()),
            other => other.clone(),
        }
    }

    /// Project a user record down to its safe fields, masking emails and
    /// rounding monetary values to two decimals.
    pub fn redact_user_record(record: &Value) -> Value {
        let Value::Object(map) = record else {
            return Self::redact_value(record);
        };

        let mut safe = Map::new();
        for (key, value) in map {
            if !SAFE_USER_FIELDS.contains(&key.as_str()) {
                continue;
            }
            let projected = if key.contains("email") {
                match value.as_str() {
                    Some(email) => Value::String(mask_email(email)),
                    None => value.clone(),
                }
            } else if key.contains("cost") {
                match value.as_f64() {
                    Some(amount) => {
                        Value::from((amount * 100.0).round() / 100.0)
                    }
                    None => value.clone(),
                }
            } else {
                value.clone()
            };
            safe.insert(key.clone(), projected);
        }
        Value::Object(safe)
    }

    /// Whether a serialized body still contains a sensitive key. Used by
    /// tests and the pipeline's final assertion.
    pub fn contains_sensitive_key(body: &Value) -> bool {
        match body {
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| {
                    (SENSITIVE_KEY_RE.is_match(k) && v.as_str() != Some(REDACTED))
                        || Self::contains_sensitive_key(v)
                }),
            Value::Array(items) => items.iter().any(Self::contains_sensitive_key),
            _ => false,
        }
    }
}

/// Mask an email's local part, keeping the first two and last two
/// characters with `*` elsewhere. Local parts of three characters or
/// fewer keep only their first character.
fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return "*".repeat(email.len());
    };
    let chars: Vec<char> = local.chars().collect();
    let masked_local = if chars.len() > 3 {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
    } else {
        let head: String = chars.iter().take(1).collect();
        format!("{head}{}", "*".repeat(chars.len().saturating_sub(1)))
    };
    format!("{masked_local}@{domain}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_keys_replaced_recursively() {
        let body = json!({
            "content": "guidance",
            "api_key": "abcd",
            "nested": {
                "connection_string": "Server=...",
                "fine": "ok",
                "items": [{"jwt": "xyz"}],
            },
        });

        let redacted = Redactor::redact_value(&body);

        assert_eq!(redacted["api_key"], REDACTED);
        assert_eq!(redacted["nested"]["connection_string"], REDACTED);
        assert_eq!(redacted["nested"]["fine"], "ok");
        assert_eq!(redacted["nested"]["items"][0]["jwt"], REDACTED);
        assert!(!Redactor::contains_sensitive_key(&redacted));
    }

    #[test]
    fn test_user_record_projection_masks_and_rounds() {
        let record = json!({
            "user_id": "u1",
            "user_email": "alice.smith@example.com",
            "api_key": "abcd",
            "total_cost": 1.23456,
            "debug": "stack...",
            "role": "user",
        });

        let safe = Redactor::redact_user_record(&record);

        assert_eq!(safe["user_email"], "al*******th@example.com");
        assert_eq!(safe["total_cost"], 1.23);
        assert_eq!(safe["role"], "user");
        assert!(safe.get("api_key").is_none(), "Unsafe fields must be dropped");
        assert!(safe.get("debug").is_none());
    }

    #[test]
    fn test_short_email_local_keeps_first_character() {
        assert_eq!(mask_email("ab@example.com"), "a*@example.com");
        assert_eq!(mask_email("abc@example.com"), "a**@example.com");
        // Four characters keep both ends, leaving nothing to mask.
        assert_eq!(mask_email("abcd@example.com"), "abcd@example.com");
        assert_eq!(mask_email("abcde@example.com"), "ab*de@example.com");
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(Redactor::redact_value(&json!(42)), json!(42));
        assert_eq!(Redactor::redact_value(&json!("text")), json!("text"));
    }
}
