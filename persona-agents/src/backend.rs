//! Chat model backends
//!
//! Agents only see [`LlmBackend`]: a system prompt and a user prompt in, one
//! text answer out. Two wire dialects sit behind it:
//!
//! - the chat completions API spoken by OpenAI, OpenRouter and local servers
//!   such as Ollama (through `async-openai`)
//! - Anthropic's messages API (plain `reqwest`)
//!
//! [`connect`] turns [`BackendSettings`] into a [`SharedBackend`].

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";
const LOCAL_API_URL: &str = "http://localhost:11434/v1";

/// Deterministic answers
const TEMPERATURE: f32 = 0.0;
const MAX_TOKENS: u32 = 2048;
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Empty response")]
    EmptyResponse,
}

/// A chat model prompted with a system and a user message
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError>;

    fn model_name(&self) -> &str;
}

/// Thread-safe reference to an LLM backend
pub type SharedBackend = Arc<dyn LlmBackend>;

/// Model providers selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    OpenAI,
    OpenRouter,
    Anthropic,
    Local,
}

impl BackendKind {
    /// Endpoint used when the settings name none
    pub fn default_base_url(&self) -> &'static str {
        match self {
            BackendKind::OpenAI => OPENAI_API_URL,
            BackendKind::OpenRouter => OPENROUTER_API_URL,
            BackendKind::Anthropic => ANTHROPIC_API_URL,
            BackendKind::Local => LOCAL_API_URL,
        }
    }

    /// Environment variable conventionally holding the key
    pub fn key_variable(&self) -> Option<&'static str> {
        match self {
            BackendKind::OpenAI => Some("OPENAI_API_KEY"),
            BackendKind::OpenRouter => Some("OPENROUTER_API_KEY"),
            BackendKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            BackendKind::Local => None,
        }
    }
}

impl FromStr for BackendKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAI),
            "openrouter" => Ok(BackendKind::OpenRouter),
            "anthropic" | "claude" => Ok(BackendKind::Anthropic),
            "local" | "ollama" => Ok(BackendKind::Local),
            other => Err(LlmError::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Everything needed to reach one model
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model: String,
    /// Required by every provider except local servers
    pub api_key: Option<String>,
    /// Overrides [`BackendKind::default_base_url`]
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl BackendSettings {
    pub fn new(kind: BackendKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            api_key: None,
            base_url: None,
            max_tokens: MAX_TOKENS,
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn endpoint(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    fn require_key(&self) -> Result<&str, LlmError> {
        match (&self.api_key, self.kind.key_variable()) {
            (Some(key), _) => Ok(key),
            (None, Some(variable)) => Err(LlmError::Config(format!(
                "{:?} needs an API key (set {})",
                self.kind, variable
            ))),
            (None, None) => Ok("local"),
        }
    }
}

/// Build the backend the settings describe
pub fn connect(settings: BackendSettings) -> Result<SharedBackend, LlmError> {
    debug!("Connecting {:?} backend at {}", settings.kind, settings.endpoint());
    Ok(match settings.kind {
        BackendKind::Anthropic => Arc::new(AnthropicBackend::new(settings)?),
        _ => Arc::new(ChatCompletionsBackend::new(settings)?),
    })
}

/// Backend for chat-completions servers (OpenAI, OpenRouter, Ollama, ...)
pub struct ChatCompletionsBackend {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u16,
}

impl ChatCompletionsBackend {
    pub fn new(settings: BackendSettings) -> Result<Self, LlmError> {
        let config = OpenAIConfig::new()
            .with_api_key(settings.require_key()?)
            .with_api_base(settings.endpoint());
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            client: Client::with_config(config).with_http_client(http),
            model: settings.model,
            max_tokens: u16::try_from(settings.max_tokens).unwrap_or(u16::MAX),
        })
    }
}

#[async_trait]
impl LlmBackend for ChatCompletionsBackend {
    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let api = |e: async_openai::error::OpenAIError| LlmError::Api(e.to_string());

        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(api)?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()
                    .map_err(api)?,
            ),
        ];
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(TEMPERATURE)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(api)?;

        let response = self.client.chat().create(request).await.map_err(api)?;

        non_empty(
            response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content),
        )
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Backend for Anthropic's messages API
pub struct AnthropicBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicBackend {
    pub fn new(settings: BackendSettings) -> Result<Self, LlmError> {
        let api_key = settings.require_key()?.to_string();
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/messages", settings.endpoint()),
            api_key,
            model: settings.model,
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": TEMPERATURE,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("messages API returned {}: {}", status, detail)));
        }

        let reply: MessagesReply = response
            .json()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        non_empty(reply.content.into_iter().find_map(|block| block.text))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn non_empty(text: Option<String>) -> Result<String, LlmError> {
    text.filter(|t| !t.trim().is_empty()).ok_or(LlmError::EmptyResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("OpenAI".parse::<BackendKind>().unwrap(), BackendKind::OpenAI);
        assert_eq!("claude".parse::<BackendKind>().unwrap(), BackendKind::Anthropic);
        assert_eq!("ollama".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("gemini".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_missing_key_is_config_error() {
        for kind in [BackendKind::OpenAI, BackendKind::OpenRouter, BackendKind::Anthropic] {
            let err = connect(BackendSettings::new(kind, "m")).err();
            assert!(matches!(err, Some(LlmError::Config(_))), "{:?}", kind);
        }
        let blank = BackendSettings::new(BackendKind::OpenAI, "m").with_api_key(Some("  ".into()));
        assert!(connect(blank).is_err());

        // local servers run keyless
        assert!(connect(BackendSettings::new(BackendKind::Local, "llama3")).is_ok());
    }

    #[test]
    fn test_endpoint_resolution() {
        let settings = BackendSettings::new(BackendKind::OpenRouter, "m");
        assert_eq!(settings.endpoint(), OPENROUTER_API_URL);

        let settings = BackendSettings::new(BackendKind::Local, "m").with_base_url("http://gpu-box:8000/v1/");
        assert_eq!(settings.endpoint(), "http://gpu-box:8000/v1");
    }

    #[tokio::test]
    async fn test_anthropic_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{ "type": "text", "text": "Jane Doe is a CEO." }]
            })))
            .mount(&server)
            .await;

        let settings = BackendSettings::new(BackendKind::Anthropic, "claude-test")
            .with_api_key(Some("test-key".into()))
            .with_base_url(server.uri());
        let backend = connect(settings).unwrap();

        assert_eq!(backend.model_name(), "claude-test");
        assert_eq!(backend.generate("system", "user").await.unwrap(), "Jane Doe is a CEO.");
    }

    #[tokio::test]
    async fn test_anthropic_rate_limit_and_blank_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{ "type": "text", "text": "   " }]
            })))
            .mount(&server)
            .await;

        let settings = BackendSettings::new(BackendKind::Anthropic, "claude-test")
            .with_api_key(Some("k".into()))
            .with_base_url(server.uri());
        let backend = connect(settings).unwrap();

        assert!(matches!(backend.generate("s", "u").await, Err(LlmError::RateLimited)));
        assert!(matches!(backend.generate("s", "u").await, Err(LlmError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_chat_completions_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "llama3",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "Jane Doe founded ExampleCorp." },
                    "finish_reason": "stop"
                }]
            })))
            .mount(&server)
            .await;

        let settings =
            BackendSettings::new(BackendKind::Local, "llama3").with_base_url(format!("{}/v1", server.uri()));
        let backend = connect(settings).unwrap();

        assert_eq!(
            backend.generate("system", "user").await.unwrap(),
            "Jane Doe founded ExampleCorp."
        );
    }
}
