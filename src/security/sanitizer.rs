//! Input sanitization.
//!
//! Length caps are checked against the raw input, then strings are
//! HTML-escaped and stripped of ASCII control characters. Emails, UUIDs,
//! and alphanumeric identifiers have strict shape rules. Structured
//! parameter maps pass numbers and booleans through, truncate lists, and
//! string-coerce everything else.

use crate::error::InputError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Maximum length for any sanitized string.
pub const MAX_INPUT_LENGTH: usize = 10_000;
/// Maximum length for a user query.
pub const MAX_QUERY_LENGTH: usize = 1_000;
/// Maximum length for an email address.
pub const MAX_EMAIL_LENGTH: usize = 254;

const MAX_PARAM_KEY_LENGTH: usize = 50;
const MAX_PARAM_VALUE_LENGTH: usize = 100;
const MAX_PARAM_LIST_ITEMS: usize = 10;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("email regex")
});
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex")
});
static ALNUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("alnum regex"));

/// Stateless input sanitizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer;

impl Sanitizer {
    /// Sanitize a free-form string under the given length cap.
    ///
    /// The cap applies to the raw input; escaping may lengthen the result.
    pub fn sanitize_string(value: &str, max_length: usize) -> Result<String, InputError> {
        if value.len() > max_length {
            return Err(InputError::TooLong {
                actual: value.len(),
                max: max_length,
            });
        }

        let stripped: String = value
            .chars()
            .filter(|c| !c.is_ascii_control() || *c == '\n' || *c == '\t')
            .collect();

        Ok(html_escape(&stripped))
    }

    /// Sanitize a user query (1,000-char cap).
    pub fn sanitize_query(value: &str) -> Result<String, InputError> {
        Self::sanitize_string(value, MAX_QUERY_LENGTH)
    }

    /// Validate and normalize an email address.
    pub fn sanitize_email(value: &str) -> Result<String, InputError> {
        if value.len() > MAX_EMAIL_LENGTH {
            return Err(InputError::TooLong {
                actual: value.len(),
                max: MAX_EMAIL_LENGTH,
            });
        }
        if !EMAIL_RE.is_match(value) {
            return Err(InputError::InvalidEmail);
        }
        Ok(value.to_lowercase())
    }

    /// Validate a canonical UUID.
    pub fn sanitize_uuid(value: &str) -> Result<String, InputError> {
        if !UUID_RE.is_match(value) {
            return Err(InputError::InvalidUuid);
        }
        Ok(value.to_lowercase())
    }

    /// Validate an alphanumeric identifier (`[A-Za-z0-9_-]` only).
    pub fn sanitize_identifier(field: &str, value: &str) -> Result<String, InputError> {
        if value.is_empty() || value.len() > MAX_PARAM_VALUE_LENGTH {
            return Err(InputError::TooLong {
                actual: value.len(),
                max: MAX_PARAM_VALUE_LENGTH,
            });
        }
        if !ALNUM_RE.is_match(value) {
            return Err(InputError::InvalidFormat {
                field: field.to_string(),
                message: "only alphanumerics, underscore, and dash allowed".to_string(),
            });
        }
        Ok(value.to_string())
    }

    /// Sanitize a structured parameter map.
    ///
    /// Numbers and booleans pass through; lists truncate to 10 items of at
    /// most 100 chars each; anything else is string-coerced and sanitized.
    pub fn sanitize_params(params: &Map<String, Value>) -> Result<Map<String, Value>, InputError> {
        let mut sanitized = Map::new();
        for (key, value) in params {
            let clean_key = Self::sanitize_string(key, MAX_PARAM_KEY_LENGTH)?;
            let clean_value = match value {
                Value::Number(_) | Value::Bool(_) | Value::Null => value.clone(),
                Value::String(s) => Value::String(Self::sanitize_string(s, MAX_QUERY_LENGTH)?),
                Value::Array(items) => {
                    let mut clean_items = Vec::new();
                    for item in items.iter().take(MAX_PARAM_LIST_ITEMS) {
                        let as_string = coerce_to_string(item);
                        clean_items.push(Value::String(Self::sanitize_string(
                            &truncate(&as_string, MAX_PARAM_VALUE_LENGTH),
                            MAX_PARAM_VALUE_LENGTH,
                        )?));
                    }
                    Value::Array(clean_items)
                }
                other => {
                    let as_string = coerce_to_string(other);
                    Value::String(Self::sanitize_string(
                        &truncate(&as_string, MAX_PARAM_VALUE_LENGTH),
                        MAX_PARAM_VALUE_LENGTH,
                    )?)
                }
            };
            sanitized.insert(clean_key, clean_value);
        }
        Ok(sanitized)
    }
}

fn html_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_boundary_exactly_one_thousand() {
        let at_limit = "q".repeat(MAX_QUERY_LENGTH);
        assert!(Sanitizer::sanitize_query(&at_limit).is_ok());

        let over = "q".repeat(MAX_QUERY_LENGTH + 1);
        let err = Sanitizer::sanitize_query(&over).unwrap_err();
        assert!(matches!(err, InputError::TooLong { actual: 1001, max: 1000 }));
    }

    #[test]
    fn test_email_boundary_exactly_254() {
        // local@domain where the whole address is exactly 254 chars.
        let local = "a".repeat(254 - "@example.com".len());
        let at_limit = format!("{local}@example.com");
        assert_eq!(at_limit.len(), 254);
        assert!(Sanitizer::sanitize_email(&at_limit).is_ok());

        let over = format!("a{at_limit}");
        assert!(matches!(
            Sanitizer::sanitize_email(&over),
            Err(InputError::TooLong { .. })
        ));
    }

    #[test]
    fn test_email_shape_enforced_and_lowercased() {
        assert_eq!(
            Sanitizer::sanitize_email("Alice.Smith@Example.COM").unwrap(),
            "alice.smith@example.com"
        );
        assert!(matches!(
            Sanitizer::sanitize_email("not-an-email"),
            Err(InputError::InvalidEmail)
        ));
        assert!(matches!(
            Sanitizer::sanitize_email("a@b"),
            Err(InputError::InvalidEmail)
        ));
    }

    #[test]
    fn test_uuid_canonical_shape() {
        assert!(Sanitizer::sanitize_uuid("123E4567-e89b-12d3-a456-426614174000").is_ok());
        assert!(matches!(
            Sanitizer::sanitize_uuid("123e4567e89b12d3a456426614174000"),
            Err(InputError::InvalidUuid)
        ));
    }

    #[test]
    fn test_html_escaping_and_control_stripping() {
        let out = Sanitizer::sanitize_string("<b>hi</b>\x07 & 'quote'", 100).unwrap();
        assert_eq!(out, "&lt;b&gt;hi&lt;/b&gt; &amp; &#x27;quote&#x27;");
    }

    #[test]
    fn test_newlines_and_tabs_survive() {
        let out = Sanitizer::sanitize_string("line1\nline2\tend", 100).unwrap();
        assert_eq!(out, "line1\nline2\tend");
    }

    #[test]
    fn test_identifier_rules() {
        assert!(Sanitizer::sanitize_identifier("personality_id", "krishna").is_ok());
        assert!(Sanitizer::sanitize_identifier("personality_id", "marcus_aurelius").is_ok());
        assert!(matches!(
            Sanitizer::sanitize_identifier("personality_id", "kri shna"),
            Err(InputError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_param_map_preserves_scalars_truncates_lists() {
        let params = json!({
            "temperature": 0.7,
            "enabled": true,
            "note": "<script>",
            "tags": (0..20).map(|i| format!("tag-{i}")).collect::<Vec<_>>(),
        });
        let map = params.as_object().unwrap();

        let clean = Sanitizer::sanitize_params(map).unwrap();

        assert_eq!(clean["temperature"], json!(0.7));
        assert_eq!(clean["enabled"], json!(true));
        assert_eq!(clean["note"], json!("&lt;script&gt;"));
        assert_eq!(clean["tags"].as_array().unwrap().len(), 10);
    }
}
