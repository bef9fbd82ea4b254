//! Query Refiner
//!
//! Generates an agent's search queries. The model writes a free-text list,
//! structured extraction turns it into a typed list, and a numbered-list
//! parse covers malformed extraction. When everything fails the persona's
//! deterministic fallback queries are used, so the result is never empty.

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{extract_structured, render_template, AgentProfile, QueryList, SharedBackend};

/// Numbered or bulleted list item
const LIST_ITEM_PATTERN: &str = r"(?m)^\s*(?:\d+[.)]|[-*•])\s+(.+?)\s*$";

/// Upper bound on queries per agent
pub const MAX_QUERIES: usize = 5;

/// Generated queries and how they were obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedQueries {
    pub queries: Vec<String>,
    /// Whether the persona's fallback queries were used
    pub fallback: bool,
}

/// Query generator
pub struct QueryRefiner {
    backend: SharedBackend,
    query_count: String,
}

impl QueryRefiner {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            query_count: "3-5".to_string(),
        }
    }

    pub fn with_query_count(mut self, count: &str) -> Self {
        self.query_count = count.to_string();
        self
    }

    /// Generate queries for `subject` from the persona's templates
    pub async fn generate(&self, profile: &AgentProfile, subject: &str, description: &str) -> GeneratedQueries {
        let fallback = || GeneratedQueries {
            queries: profile.fallback_queries(subject),
            fallback: true,
        };

        if profile.prompt.query_user.trim().is_empty() {
            return fallback();
        }

        let vars = [
            ("name", subject),
            ("description", description),
            ("count", self.query_count.as_str()),
        ];
        let system = render_template(&profile.prompt.query_system, &vars);
        let user = render_template(&profile.prompt.query_user, &vars);

        let raw = match self.backend.generate(&system, &user).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("[{}] Query generation failed, using fallback queries: {}", profile.id(), e);
                return fallback();
            }
        };

        let structured = match extract_structured::<QueryList>(self.backend.as_ref(), &raw, QueryList::SHAPE).await {
            Ok(list) => clean_queries(list.queries),
            Err(e) => {
                debug!("[{}] Structured query extraction failed: {}", profile.id(), e);
                Vec::new()
            }
        };

        let queries = if structured.is_empty() {
            clean_queries(parse_list_items(&raw))
        } else {
            structured
        };

        if queries.is_empty() {
            warn!("[{}] No usable queries generated, using fallback queries", profile.id());
            return fallback();
        }

        info!("[{}] Generated {} queries", profile.id(), queries.len());
        GeneratedQueries {
            queries,
            fallback: false,
        }
    }
}

/// Items of a numbered or bulleted list
pub fn parse_list_items(text: &str) -> Vec<String> {
    let Ok(pattern) = Regex::new(LIST_ITEM_PATTERN) else {
        return Vec::new();
    };

    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Trim, unquote, de-duplicate and bound a query list
fn clean_queries(queries: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for query in queries {
        let query = query.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string();
        if !query.is_empty() && !cleaned.iter().any(|q| q.eq_ignore_ascii_case(&query)) {
            cleaned.push(query);
        }
    }
    cleaned.truncate(MAX_QUERIES);
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmBackend, LlmError, PersonaRegistry};
    use async_trait::async_trait;
    use persona_core::Stage;
    use std::sync::Arc;

    /// Answers generation and extraction calls from a script
    struct MockBackend {
        generation: Result<&'static str, ()>,
        extraction: &'static str,
    }

    #[async_trait]
    impl LlmBackend for MockBackend {
        async fn generate(&self, system: &str, _user: &str) -> Result<String, LlmError> {
            if system.contains("data extraction") {
                return Ok(self.extraction.to_string());
            }
            self.generation
                .map(str::to_string)
                .map_err(|_| LlmError::Api("down".into()))
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn refiner(generation: Result<&'static str, ()>, extraction: &'static str) -> QueryRefiner {
        QueryRefiner::new(Arc::new(MockBackend { generation, extraction }))
    }

    #[tokio::test]
    async fn test_structured_queries() {
        let registry = PersonaRegistry::load_embedded();
        let profile = registry.for_stage(Stage::Leadership).unwrap();

        let result = refiner(
            Ok("1. Jane Doe leadership"),
            r#"{"queries": ["\"Jane Doe leadership\"", "Jane Doe mentorship", "jane doe MENTORSHIP"]}"#,
        )
        .generate(profile, "Jane Doe", "CEO of ExampleCorp")
        .await;

        assert!(!result.fallback);
        assert_eq!(result.queries, vec!["Jane Doe leadership", "Jane Doe mentorship"]);
    }

    #[tokio::test]
    async fn test_list_parse_when_extraction_is_malformed() {
        let registry = PersonaRegistry::load_embedded();
        let profile = registry.for_stage(Stage::Strategy).unwrap();

        let result = refiner(
            Ok("Here are some queries:\n1. Jane Doe acquisitions\n2) Jane Doe revenue growth\n- Jane Doe board"),
            "I cannot produce JSON",
        )
        .generate(profile, "Jane Doe", "CEO")
        .await;

        assert!(!result.fallback);
        assert_eq!(
            result.queries,
            vec!["Jane Doe acquisitions", "Jane Doe revenue growth", "Jane Doe board"]
        );
    }

    #[tokio::test]
    async fn test_generation_failure_uses_fallback() {
        let registry = PersonaRegistry::load_embedded();
        let profile = registry.for_stage(Stage::Reputation).unwrap();

        let result = refiner(Err(()), "{}").generate(profile, "Jane Doe", "CEO").await;
        assert!(result.fallback);
        assert_eq!(result.queries, profile.fallback_queries("Jane Doe"));
    }

    #[tokio::test]
    async fn test_empty_generation_uses_fallback() {
        let registry = PersonaRegistry::load_embedded();
        let profile = registry.for_stage(Stage::Background).unwrap();

        let result = refiner(Ok("nothing useful"), r#"{"queries": []}"#)
            .generate(profile, "Jane Doe", "CEO")
            .await;
        assert!(result.fallback);
        assert!(!result.queries.is_empty());
    }

    #[test]
    fn test_parse_list_items() {
        let items = parse_list_items("1. first\n  2. second  \nnot an item\n* third");
        assert_eq!(items, vec!["first", "second", "third"]);
    }
}
