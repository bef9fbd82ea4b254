//! Structured extraction
//!
//! Turns free text into a typed value by asking the model for a JSON object
//! of a given shape. Malformed answers are parse errors, never panics.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::{AgentError, LlmBackend};

const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a precise data extraction assistant. Read the text provided by the user and extract the
requested fields.

Rules:
1. Respond with a single JSON object and nothing else
2. The object must match this shape: {shape}
3. Use null for values that are not present in the text
4. Do not invent values
"#;

/// Generated search queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryList {
    #[serde(default)]
    pub queries: Vec<String>,
}

impl QueryList {
    pub const SHAPE: &'static str = r#"{"queries": ["search query", "..."]}"#;
}

/// Subject name found in a profile summary
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubjectName {
    #[serde(default)]
    pub name: Option<String>,
}

impl SubjectName {
    pub const SHAPE: &'static str = r#"{"name": "full name of the person, or null"}"#;
}

/// Extract a typed value of `shape` from `text`
pub async fn extract_structured<T: DeserializeOwned>(
    backend: &dyn LlmBackend,
    text: &str,
    shape: &str,
) -> Result<T, AgentError> {
    let system = EXTRACTION_SYSTEM_PROMPT.replace("{shape}", shape);
    let response = backend.generate(&system, text).await?;
    parse_json_object(&response)
}

/// Parse the first JSON object embedded in a model response
pub fn parse_json_object<T: DeserializeOwned>(response: &str) -> Result<T, AgentError> {
    let start = response.find('{');
    let end = response.rfind('}');

    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &response[start..=end],
        _ => {
            return Err(AgentError::Parse(format!(
                "no JSON object in response: {}",
                response.chars().take(80).collect::<String>()
            )))
        }
    };

    serde_json::from_str(json).map_err(|e| {
        debug!("Structured parse failed: {}", e);
        AgentError::Parse(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::LlmError;

    struct MockBackend(&'static str);

    #[async_trait]
    impl LlmBackend for MockBackend {
        async fn generate(&self, system: &str, _user: &str) -> Result<String, LlmError> {
            assert!(system.contains("queries"));
            Ok(self.0.to_string())
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    #[test]
    fn test_parse_fenced_json() {
        let response = "Here you go:\n```json\n{\"name\": \"Jane Doe\"}\n```";
        let parsed: SubjectName = parse_json_object(response).unwrap();
        assert_eq!(parsed.name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn test_parse_null_and_garbage() {
        let parsed: SubjectName = parse_json_object(r#"{"name": null}"#).unwrap();
        assert!(parsed.name.is_none());

        assert!(parse_json_object::<SubjectName>("no json here").is_err());
        assert!(parse_json_object::<QueryList>(r#"{"queries": "not a list"}"#).is_err());
    }

    #[tokio::test]
    async fn test_extract_structured_queries() {
        let backend = MockBackend(r#"{"queries": ["Jane Doe CEO", "Jane Doe education"]}"#);
        let list: QueryList = extract_structured(&backend, "1. Jane Doe CEO", QueryList::SHAPE)
            .await
            .unwrap();
        assert_eq!(list.queries.len(), 2);
    }
}
