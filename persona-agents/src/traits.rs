//! Common traits and errors for research agents

use async_trait::async_trait;
use persona_core::Candidate;
use persona_web::WebError;
use thiserror::Error;

use crate::LlmError;

/// Errors from agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Web error: {0}")]
    Web(#[from] WebError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Persona error: {0}")]
    Persona(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Binary relevance oracle for a search candidate
#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    /// Whether `candidate` is about `subject` in the context of `focus`
    async fn judge(&self, subject: &str, focus: &str, candidate: &Candidate) -> Result<bool, AgentError>;
}
