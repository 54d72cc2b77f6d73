//! Versioned prompt templates with variable substitution.
//!
//! Templates are plain text with `${var}` placeholders, keyed by
//! (template type, domain, optional personality, version). Missing
//! variables fall back to per-template defaults, then to empty string.
//! Validation happens at load time: non-empty body, balanced placeholders,
//! extractable variable set, required variables present. A
//! personality-specific template overrides its domain default.

use crate::error::ConfigError;
use crate::logging::{log_debug, log_warn};
use crate::personality::registry::Domain;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("placeholder regex"));

/// What a template is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    /// The main guidance prompt.
    Guidance,
    /// The safety-refusal wrapper.
    SafetyRefusal,
}

impl TemplateType {
    /// Variables that must appear in a template of this type.
    pub fn required_vars(self) -> &'static [&'static str] {
        match self {
            Self::Guidance => &["query", "context"],
            Self::SafetyRefusal => &["personality_name"],
        }
    }
}

/// One validated template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// What this template renders.
    pub template_type: TemplateType,
    /// Domain the template serves.
    pub domain: Domain,
    /// Personality override key, when not a domain default.
    pub personality_id: Option<String>,
    /// Monotonic version.
    pub version: u32,
    /// Body with `${var}` placeholders.
    pub body: String,
    /// Per-template defaults for absent context variables.
    pub defaults: HashMap<String, String>,
}

impl PromptTemplate {
    /// The variable names the body references.
    pub fn variables(&self) -> Vec<String> {
        PLACEHOLDER_RE
            .captures_iter(&self.body)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Validate the template's shape.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on an empty body, an unbalanced
    /// placeholder, or a missing required variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = self.describe();
        if self.body.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key,
                message: "template body is empty".to_string(),
            });
        }

        let opens = self.body.matches("${").count();
        let extracted = self.variables();
        if opens != extracted.len() {
            return Err(ConfigError::Invalid {
                key,
                message: "unbalanced ${...} placeholder".to_string(),
            });
        }

        for required in self.template_type.required_vars() {
            if !extracted.iter().any(|v| v == required) {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("required variable ${{{required}}} missing"),
                });
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{:?}/{}/{}/v{}",
            self.template_type,
            self.domain.as_str(),
            self.personality_id.as_deref().unwrap_or("-"),
            self.version
        )
    }

    /// Substitute variables from `context`, falling back to the template's
    /// defaults and then to empty string.
    pub fn render(&self, context: &HashMap<String, String>) -> String {
        PLACEHOLDER_RE
            .replace_all(&self.body, |caps: &regex::Captures<'_>| {
                let var = &caps[1];
                context
                    .get(var)
                    .or_else(|| self.defaults.get(var))
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

fn domain_default_body(domain: Domain) -> &'static str {
    match domain {
        Domain::Spiritual => {
            "You are ${personality_name}, a spiritual guide. Speak with ${tone}.\n\
             Ground every answer in the passages below and cite them.\n\
             Sacred passages:\n${context}\n\
             Recent conversation:\n${history}\n\
             Seeker's question (${language}): ${query}\n\
             Answer within ${max_chars} characters, opening with your greeting."
        }
        Domain::Scientific => {
            "You are ${personality_name}, a scientist. Speak with ${tone}.\n\
             Reason from the source material below.\n\
             Source material:\n${context}\n\
             Recent conversation:\n${history}\n\
             Question (${language}): ${query}\n\
             Answer within ${max_chars} characters, opening with your greeting."
        }
        Domain::Historical => {
            "You are ${personality_name}, a leader from history. Speak with ${tone}.\n\
             Draw on the writings below.\n\
             Writings:\n${context}\n\
             Recent conversation:\n${history}\n\
             Question (${language}): ${query}\n\
             Answer within ${max_chars} characters, opening with your greeting."
        }
        Domain::Philosophical => {
            "You are ${personality_name}, a philosopher. Speak with ${tone}.\n\
             Reflect on the texts below.\n\
             Texts:\n${context}\n\
             Recent conversation:\n${history}\n\
             Question (${language}): ${query}\n\
             Answer within ${max_chars} characters, opening with your greeting."
        }
    }
}

/// Holds validated templates and selects the right one per render.
#[derive(Debug)]
pub struct PromptRenderer {
    domain_defaults: HashMap<(TemplateType, Domain), PromptTemplate>,
    overrides: HashMap<(TemplateType, String), PromptTemplate>,
}

impl PromptRenderer {
    /// Seed the four domain-default guidance templates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a seeded template fails its
    /// own validation.
    pub fn new() -> Result<Self, ConfigError> {
        let mut domain_defaults = HashMap::new();
        for domain in [
            Domain::Spiritual,
            Domain::Scientific,
            Domain::Historical,
            Domain::Philosophical,
        ] {
            let template = PromptTemplate {
                template_type: TemplateType::Guidance,
                domain,
                personality_id: None,
                version: 1,
                body: domain_default_body(domain).to_string(),
                defaults: HashMap::from([
                    ("language".to_string(), "English".to_string()),
                    ("history".to_string(), "(no prior conversation)".to_string()),
                    ("context".to_string(), "(no passages retrieved)".to_string()),
                ]),
            };
            template.validate()?;
            domain_defaults.insert((TemplateType::Guidance, domain), template);
        }
        log_debug!(count = domain_defaults.len(), "Domain default templates seeded");
        Ok(Self {
            domain_defaults,
            overrides: HashMap::new(),
        })
    }

    /// Register a personality-specific template override.
    pub fn register_override(&mut self, template: PromptTemplate) -> Result<(), ConfigError> {
        template.validate()?;
        let Some(personality_id) = template.personality_id.clone() else {
            return Err(ConfigError::Invalid {
                key: "template override".to_string(),
                message: "override must name a personality".to_string(),
            });
        };
        let key = (template.template_type, personality_id);
        if let Some(existing) = self.overrides.get(&key) {
            if existing.version >= template.version {
                log_warn!(
                    personality = %key.1,
                    existing = existing.version,
                    offered = template.version,
                    "Ignoring stale template version"
                );
                return Ok(());
            }
        }
        self.overrides.insert(key, template);
        Ok(())
    }

    /// Select the template for a personality: override first, then the
    /// domain default.
    pub fn select(
        &self,
        template_type: TemplateType,
        domain: Domain,
        personality_id: &str,
    ) -> Option<&PromptTemplate> {
        self.overrides
            .get(&(template_type, personality_id.to_string()))
            .or_else(|| self.domain_defaults.get(&(template_type, domain)))
    }

    /// Render the guidance prompt for a personality.
    pub fn render_guidance(
        &self,
        domain: Domain,
        personality_id: &str,
        context: &HashMap<String, String>,
    ) -> String {
        match self.select(TemplateType::Guidance, domain, personality_id) {
            Some(template) => template.render(context),
            // Seeding guarantees a domain default; this is unreachable in
            // practice but renders the raw query rather than panicking.
            None => context.get("query").cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HashMap<String, String> {
        HashMap::from([
            ("personality_name".to_string(), "Lord Krishna".to_string()),
            ("tone".to_string(), "compassion".to_string()),
            ("query".to_string(), "What is my duty?".to_string()),
            (
                "context".to_string(),
                "You have a right to perform your prescribed duty".to_string(),
            ),
            ("max_chars".to_string(), "500".to_string()),
        ])
    }

    #[test]
    fn test_render_substitutes_all_known_variables() {
        let renderer = PromptRenderer::new().unwrap();
        let prompt = renderer.render_guidance(Domain::Spiritual, "krishna", &context());

        assert!(prompt.contains("Lord Krishna"));
        assert!(prompt.contains("What is my duty?"));
        assert!(prompt.contains("You have a right to perform your prescribed duty"));
        assert!(!prompt.contains("${query}"));
    }

    #[test]
    fn test_missing_variable_falls_back_to_default_then_empty() {
        let renderer = PromptRenderer::new().unwrap();
        let mut ctx = context();
        ctx.remove("context");

        let prompt = renderer.render_guidance(Domain::Spiritual, "krishna", &ctx);
        assert!(prompt.contains("(no passages retrieved)"), "Template default applies");

        ctx.remove("tone");
        let prompt = renderer.render_guidance(Domain::Spiritual, "krishna", &ctx);
        assert!(!prompt.contains("${tone}"), "Unknown variables become empty");
    }

    #[test]
    fn test_validation_rejects_empty_body() {
        let template = PromptTemplate {
            template_type: TemplateType::Guidance,
            domain: Domain::Spiritual,
            personality_id: None,
            version: 1,
            body: "   ".to_string(),
            defaults: HashMap::new(),
        };
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unbalanced_placeholder() {
        let template = PromptTemplate {
            template_type: TemplateType::Guidance,
            domain: Domain::Spiritual,
            personality_id: None,
            version: 1,
            body: "${query} and ${context and more".to_string(),
            defaults: HashMap::new(),
        };
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_validation_requires_type_variables() {
        let template = PromptTemplate {
            template_type: TemplateType::Guidance,
            domain: Domain::Spiritual,
            personality_id: None,
            version: 1,
            body: "only ${query} here".to_string(),
            defaults: HashMap::new(),
        };
        let err = template.validate().unwrap_err();
        assert!(err.to_string().contains("context"));
    }

    #[test]
    fn test_personality_override_beats_domain_default() {
        let mut renderer = PromptRenderer::new().unwrap();
        renderer
            .register_override(PromptTemplate {
                template_type: TemplateType::Guidance,
                domain: Domain::Spiritual,
                personality_id: Some("krishna".to_string()),
                version: 2,
                body: "KRISHNA OVERRIDE: ${query} / ${context}".to_string(),
                defaults: HashMap::new(),
            })
            .unwrap();

        let prompt = renderer.render_guidance(Domain::Spiritual, "krishna", &context());
        assert!(prompt.starts_with("KRISHNA OVERRIDE"));

        // Other spiritual personalities keep the domain default.
        let other = renderer.render_guidance(Domain::Spiritual, "buddha", &context());
        assert!(!other.starts_with("KRISHNA OVERRIDE"));
    }

    #[test]
    fn test_stale_override_version_ignored() {
        let mut renderer = PromptRenderer::new().unwrap();
        let v2 = PromptTemplate {
            template_type: TemplateType::Guidance,
            domain: Domain::Spiritual,
            personality_id: Some("krishna".to_string()),
            version: 2,
            body: "v2 ${query} ${context}".to_string(),
            defaults: HashMap::new(),
        };
        let v1 = PromptTemplate {
            version: 1,
            body: "v1 ${query} ${context}".to_string(),
            ..v2.clone()
        };

        renderer.register_override(v2).unwrap();
        renderer.register_override(v1).unwrap();

        let selected = renderer
            .select(TemplateType::Guidance, Domain::Spiritual, "krishna")
            .unwrap();
        assert_eq!(selected.version, 2);
    }
}
