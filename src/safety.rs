//! Generated-content safety filtering.
//!
//! A regex pattern set over four categories: inappropriate content, medical
//! advice, financial advice, legal advice. Each hit decrements the safety
//! score by 0.2; content passes with zero hits and a score of at least 0.7.
//! A failing response is replaced by the personality's safe-fallback line
//! and marked `quality=fallback` by the pipeline.

use crate::logging::log_warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const SCORE_DECREMENT: f64 = 0.2;
const PASS_THRESHOLD: f64 = 0.7;

static SAFETY_PATTERNS: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    let compile = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("safety pattern"))
            .collect::<Vec<_>>()
    };
    vec![
        (
            "inappropriate_content",
            compile(&[
                r"explicit sexual content",
                r"violence",
                r"hate speech",
                r"illegal activities",
            ]),
        ),
        (
            "medical_advice",
            compile(&[
                r"medical diagnosis",
                r"medical treatment",
                r"cure guarantee",
                r"drug recommendation",
            ]),
        ),
        (
            "financial_advice",
            compile(&[
                r"investment advice",
                r"stock tips",
                r"guaranteed returns",
                r"financial predictions",
            ]),
        ),
        (
            "legal_advice",
            compile(&[
                r"legal advice",
                r"legal recommendation",
                r"lawsuit guidance",
            ]),
        ),
    ]
});

/// Outcome of a safety validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    /// Whether the content may be served as-is.
    pub passed: bool,
    /// Safety score in [0, 1].
    pub score: f64,
    /// Categories whose patterns matched.
    pub flagged_categories: Vec<String>,
    /// Human-readable warnings per hit.
    pub warnings: Vec<String>,
}

/// Stateless content safety filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyFilter;

impl SafetyFilter {
    /// Validate generated content against the pattern set.
    pub fn validate(content: &str) -> SafetyVerdict {
        let lowered = content.to_lowercase();
        let mut flagged_categories = Vec::new();
        let mut warnings = Vec::new();
        let mut hits = 0usize;

        for (category, patterns) in SAFETY_PATTERNS.iter() {
            let mut category_hit = false;
            for pattern in patterns {
                if pattern.is_match(&lowered) {
                    hits += 1;
                    category_hit = true;
                    warnings.push(format!("Content contains {category}: {}", pattern.as_str()));
                }
            }
            if category_hit {
                flagged_categories.push((*category).to_string());
            }
        }

        let score = (1.0 - hits as f64 * SCORE_DECREMENT).max(0.0);
        let passed = hits == 0 && score >= PASS_THRESHOLD;

        if !passed {
            log_warn!(
                hits = hits,
                score = score,
                categories = ?flagged_categories,
                "Generated content failed safety validation"
            );
        }

        SafetyVerdict {
            passed,
            score,
            flagged_categories,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_content_passes() {
        let verdict =
            SafetyFilter::validate("Act with devotion and surrender attachment to outcomes.");
        assert!(verdict.passed);
        assert_eq!(verdict.score, 1.0);
        assert!(verdict.flagged_categories.is_empty());
    }

    #[test]
    fn test_medical_advice_is_flagged() {
        let verdict =
            SafetyFilter::validate("Here is a medical diagnosis for your condition.");
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.8);
        assert_eq!(verdict.flagged_categories, vec!["medical_advice"]);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let verdict = SafetyFilter::validate("INVESTMENT ADVICE: buy now!");
        assert!(!verdict.passed);
        assert_eq!(verdict.flagged_categories, vec!["financial_advice"]);
    }

    #[test]
    fn test_score_decrements_per_hit() {
        let verdict = SafetyFilter::validate(
            "This mixes legal advice with stock tips and a cure guarantee.",
        );
        assert_eq!(verdict.score, 1.0 - 3.0 * 0.2);
        assert_eq!(verdict.flagged_categories.len(), 3);
        assert_eq!(verdict.warnings.len(), 3);
    }

    #[test]
    fn test_score_floors_at_zero() {
        let verdict = SafetyFilter::validate(
            "violence hate speech illegal activities medical diagnosis medical treatment \
             cure guarantee drug recommendation investment advice stock tips",
        );
        assert_eq!(verdict.score, 0.0);
        assert!(!verdict.passed);
    }
}
