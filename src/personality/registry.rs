//! Personality configurations.
//!
//! Personalities are immutable at runtime: loaded at startup, reloaded only
//! on an explicit reload signal, never mutated on the request path. A
//! request naming an unknown personality gets the configured default with
//! a warning.

use crate::logging::{log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Knowledge domain a personality belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Sacred texts and devotional traditions.
    Spiritual,
    /// Natural science and mathematics.
    Scientific,
    /// Statecraft and historical leadership.
    Historical,
    /// Ethics and philosophy.
    Philosophical,
}

impl Domain {
    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spiritual => "spiritual",
            Self::Scientific => "scientific",
            Self::Historical => "historical",
            Self::Philosophical => "philosophical",
        }
    }
}

/// One persona's full serving configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    /// Identifier used in requests and partitions.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Knowledge domain.
    pub domain: Domain,
    /// Phrase every fallback and refusal begins with.
    pub greeting: String,
    /// Voice description fed to the prompt template.
    pub tone: String,
    /// Maximum response characters.
    pub max_chars: usize,
    /// Per-attempt LLM deadline in seconds.
    pub timeout_seconds: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Prompt template id (personality override key).
    pub template_id: String,
    /// Vector partition holding this persona's corpus.
    pub corpus_partition: String,
    /// Whether responses must carry citations.
    pub citations_required: bool,
    /// Canned line used when safety filtering rejects a response.
    pub safe_fallback: String,
}

impl Personality {
    /// The per-attempt deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// The canned fallback response, beginning with the greeting.
    pub fn fallback_response(&self) -> String {
        format!(
            "{}, I must pause and reflect before answering. Please ask again in a moment.",
            self.greeting
        )
    }

    /// The budget-refusal response, beginning with the greeting.
    pub fn budget_refusal(&self) -> String {
        format!(
            "{}, wisdom teaches moderation in all things. Your guidance allowance needs rest before we continue.",
            self.greeting
        )
    }
}

fn persona(
    id: &str,
    display_name: &str,
    domain: Domain,
    greeting: &str,
    tone: &str,
    citations_required: bool,
) -> Personality {
    Personality {
        id: id.to_string(),
        display_name: display_name.to_string(),
        domain,
        greeting: greeting.to_string(),
        tone: tone.to_string(),
        max_chars: 500,
        timeout_seconds: 30,
        max_retries: 2,
        template_id: id.to_string(),
        corpus_partition: id.to_string(),
        citations_required,
        safe_fallback: format!(
            "{greeting}, that question leads beyond what I may speak on. Let us return to matters of wisdom and understanding."
        ),
    }
}

fn seed_personalities() -> Vec<Personality> {
    let mut roster = vec![
        persona(
            "krishna",
            "Lord Krishna",
            Domain::Spiritual,
            "Beloved devotee",
            "compassionate, dharmic, grounded in the Bhagavad Gita",
            true,
        ),
        persona(
            "buddha",
            "Buddha",
            Domain::Spiritual,
            "Dear friend",
            "mindful, gentle, oriented toward the middle path",
            true,
        ),
        persona(
            "jesus",
            "Jesus Christ",
            Domain::Spiritual,
            "Beloved child",
            "loving, forgiving, rooted in scripture",
            true,
        ),
        persona(
            "rumi",
            "Rumi",
            Domain::Spiritual,
            "Beloved",
            "poetic, ecstatic, heart-centered",
            true,
        ),
        persona(
            "lao_tzu",
            "Lao Tzu",
            Domain::Spiritual,
            "Dear friend",
            "effortless, paradoxical, flowing like water",
            true,
        ),
        persona(
            "einstein",
            "Albert Einstein",
            Domain::Scientific,
            "My friend",
            "curious, playful, rigorous about evidence",
            false,
        ),
        persona(
            "tesla",
            "Nikola Tesla",
            Domain::Scientific,
            "Curious mind",
            "visionary, bold, fascinated by energy and resonance",
            false,
        ),
        persona(
            "lincoln",
            "Abraham Lincoln",
            Domain::Historical,
            "My fellow citizen",
            "principled, compassionate, plain-spoken",
            false,
        ),
        persona(
            "chanakya",
            "Chanakya",
            Domain::Historical,
            "Dear student",
            "strategic, pragmatic, morally grounded",
            false,
        ),
        persona(
            "confucius",
            "Confucius",
            Domain::Philosophical,
            "Honorable student",
            "measured, virtuous, devoted to learning",
            false,
        ),
        persona(
            "marcus_aurelius",
            "Marcus Aurelius",
            Domain::Philosophical,
            "Fellow seeker",
            "stoic, disciplined, focused on what is controllable",
            false,
        ),
    ];

    // Newton runs a tighter budget and deadline than the rest of the roster.
    let mut newton = persona(
        "newton",
        "Isaac Newton",
        Domain::Scientific,
        "My friend",
        "precise, mathematical, devoted to observation",
        false,
    );
    newton.max_chars = 450;
    newton.timeout_seconds = 20;
    newton.max_retries = 3;
    roster.push(newton);

    roster
}

/// Registry of all personalities, keyed by id.
#[derive(Debug)]
pub struct PersonalityRegistry {
    personalities: HashMap<String, Personality>,
    default_id: String,
}

impl Default for PersonalityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PersonalityRegistry {
    /// Load the built-in roster with `krishna` as default.
    pub fn new() -> Self {
        let personalities: HashMap<String, Personality> = seed_personalities()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        log_info!(count = personalities.len(), "Personality registry loaded");
        Self {
            personalities,
            default_id: "krishna".to_string(),
        }
    }

    /// Resolve a personality id, substituting the default for unknown ids.
    pub fn resolve(&self, id: &str) -> &Personality {
        match self.personalities.get(id) {
            Some(personality) => personality,
            None => {
                log_warn!(
                    requested = id,
                    substituted = %self.default_id,
                    "Unknown personality requested, using default"
                );
                self.personalities
                    .get(&self.default_id)
                    .expect("default personality must exist")
            }
        }
    }

    /// Exact lookup without substitution.
    pub fn get(&self, id: &str) -> Option<&Personality> {
        self.personalities.get(id)
    }

    /// Every registered personality id.
    pub fn ids(&self) -> Vec<&str> {
        self.personalities.keys().map(String::as_str).collect()
    }

    /// Reload the roster (explicit signal only; never on the request path).
    pub fn reload(&mut self) {
        self.personalities = seed_personalities()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        log_info!(count = self.personalities.len(), "Personality registry reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_holds_twelve_personalities() {
        let registry = PersonalityRegistry::new();
        assert_eq!(registry.ids().len(), 12);
        for id in [
            "krishna",
            "buddha",
            "jesus",
            "rumi",
            "lao_tzu",
            "einstein",
            "newton",
            "tesla",
            "lincoln",
            "chanakya",
            "confucius",
            "marcus_aurelius",
        ] {
            assert!(registry.get(id).is_some(), "missing personality {id}");
        }
    }

    #[test]
    fn test_unknown_personality_substitutes_default() {
        let registry = PersonalityRegistry::new();
        let resolved = registry.resolve("socrates");
        assert_eq!(resolved.id, "krishna");
    }

    #[test]
    fn test_newton_serving_parameters() {
        let registry = PersonalityRegistry::new();
        let newton = registry.get("newton").unwrap();
        assert_eq!(newton.max_chars, 450);
        assert_eq!(newton.timeout_seconds, 20);
        assert_eq!(newton.max_retries, 3);
        assert_eq!(newton.greeting, "My friend");
    }

    #[test]
    fn test_spiritual_personalities_require_citations() {
        let registry = PersonalityRegistry::new();
        assert!(registry.get("krishna").unwrap().citations_required);
        assert!(!registry.get("einstein").unwrap().citations_required);
    }

    #[test]
    fn test_fallbacks_begin_with_greeting() {
        let registry = PersonalityRegistry::new();
        let newton = registry.get("newton").unwrap();
        assert!(newton.fallback_response().starts_with("My friend"));
        assert!(newton.budget_refusal().starts_with("My friend"));
        assert!(newton.safe_fallback.starts_with("My friend"));
    }
}
