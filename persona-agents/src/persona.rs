//! Persona management for research agents
//!
//! Loads agent profiles (prompt templates, focus description, fallback
//! queries) from TOML files, enabling customization without code changes.
//! Templates use `{name}`, `{description}`, `{count}` and `{context}`
//! placeholders.

use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use persona_core::Stage;

use crate::AgentError;

/// A persona definition loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct AgentProfile {
    pub persona: PersonaMetadata,
    pub focus: FocusConfig,
    pub prompt: PromptConfig,
    #[serde(default)]
    pub queries: QueryConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonaMetadata {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FocusConfig {
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub query_system: String,
    #[serde(default)]
    pub query_user: String,
    pub report_system: String,
    pub report_user: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryConfig {
    /// Deterministic queries used when generation fails
    #[serde(default)]
    pub fallback: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Labeled placeholder emitted when no report can be compiled
    pub degraded: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_chars() -> usize {
    4000
}

const PLACEHOLDER_PATTERN: &str = r"\{(\w+)\}";

/// Fill `{name}`-style placeholders in one pass; inserted values are never
/// expanded again and unknown keys are left as written
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let template = template.trim();
    let Ok(pattern) = Regex::new(PLACEHOLDER_PATTERN) else {
        return template.to_string();
    };

    pattern
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

impl AgentProfile {
    /// Parse a profile from TOML text
    pub fn from_toml(content: &str) -> Result<Self, AgentError> {
        toml::from_str(content).map_err(|e| AgentError::Persona(e.to_string()))
    }

    pub fn id(&self) -> &str {
        &self.persona.id
    }

    /// Focus description handed to the relevance judge
    pub fn focus(&self) -> &str {
        &self.focus.description
    }

    /// Deterministic default queries for a subject; never empty
    pub fn fallback_queries(&self, subject: &str) -> Vec<String> {
        let queries: Vec<String> = self
            .queries
            .fallback
            .iter()
            .map(|q| render_template(q, &[("name", subject)]))
            .filter(|q| !q.is_empty())
            .collect();

        if queries.is_empty() {
            vec![format!("{} {}", subject, self.persona.id)]
        } else {
            queries
        }
    }

    /// Degraded report text
    pub fn degraded_report(&self) -> String {
        self.output.degraded.trim().to_string()
    }
}

/// Registry of all loaded personas
#[derive(Debug, Default)]
pub struct PersonaRegistry {
    personas: HashMap<String, AgentProfile>,
}

impl PersonaRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all personas from the embedded prompts
    pub fn load_embedded() -> Self {
        let mut registry = Self::new();

        let embedded = [
            include_str!("../prompts/background.toml"),
            include_str!("../prompts/leadership.toml"),
            include_str!("../prompts/reputation.toml"),
            include_str!("../prompts/strategy.toml"),
            include_str!("../prompts/aggregator.toml"),
        ];

        for toml_str in embedded {
            match AgentProfile::from_toml(toml_str) {
                Ok(profile) if profile.persona.enabled => registry.register(profile),
                Ok(_) => {}
                Err(e) => warn!("Embedded persona failed to parse: {}", e),
            }
        }

        registry
    }

    /// Load the embedded personas, then override them from a directory
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> std::io::Result<Self> {
        let mut registry = Self::load_embedded();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                match AgentProfile::from_toml(&content) {
                    Ok(profile) if profile.persona.enabled => registry.register(profile),
                    Ok(_) => {}
                    Err(e) => warn!("Skipping persona {}: {}", path.display(), e),
                }
            }
        }

        Ok(registry)
    }

    /// Register a persona, replacing any with the same ID
    pub fn register(&mut self, profile: AgentProfile) {
        self.personas.insert(profile.persona.id.clone(), profile);
    }

    /// Get a persona by ID
    pub fn get(&self, id: &str) -> Option<&AgentProfile> {
        self.personas.get(id)
    }

    /// Persona for a workflow stage
    pub fn for_stage(&self, stage: Stage) -> Result<&AgentProfile, AgentError> {
        self.get(stage.as_str())
            .ok_or_else(|| AgentError::Persona(format!("no persona for stage {}", stage)))
    }

    /// List all persona IDs
    pub fn list_ids(&self) -> Vec<&str> {
        self.personas.keys().map(|s| s.as_str()).collect()
    }

    /// Count of loaded personas
    pub fn len(&self) -> usize {
        self.personas.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}
