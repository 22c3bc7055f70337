//! Backend Contract
//!
//! Trait definitions every backend instance implements. The routing core only
//! ever talks to `dyn Backend`; vendor crates plug in concrete types through
//! the [`BackendFactory`](super::BackendFactory).
//!
//! # Design Philosophy
//!
//! The required surface is small (`initialize`, `execute`, `shutdown` plus
//! identity). Multi-turn chat, structured generation and vendor prompt caching
//! are provided methods whose defaults degrade onto `execute`, so a backend
//! that only knows single-shot completion still works everywhere.
//!
//! Cancellation is expressed by dropping the returned future; callers race it
//! against a token or deadline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::prompt::{CacheUsage, CachedChatResponse, CachedMessage};
use crate::config::{BackendType, Role};
use crate::error::{BackendError, ErrorCode};

/// Temperature used when neither backend nor role sets one
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Max tokens used when neither backend nor role sets one
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Rough token count: one token per four characters
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
}

// ============================================================================
// Request / Response
// ============================================================================

/// A single generation request
#[derive(Clone, Debug, PartialEq)]
pub struct BackendRequest {
    /// Role the request is made for
    pub role: Role,
    /// Prompt text
    pub prompt: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f64,
    /// Merged generation parameters
    pub parameters: Map<String, Value>,
}

impl BackendRequest {
    /// Create a request with default sampling settings
    pub fn new(role: Role, prompt: impl Into<String>) -> Self {
        Self {
            role,
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            parameters: Map::new(),
        }
    }

    /// Create a request whose sampling settings come from merged parameters
    pub fn from_parameters(role: Role, prompt: impl Into<String>, parameters: Map<String, Value>) -> Self {
        let temperature = parameters
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_TEMPERATURE);
        let max_tokens = parameters
            .get("max_tokens")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_TOKENS);

        Self {
            role,
            prompt: prompt.into(),
            max_tokens,
            temperature,
            parameters,
        }
    }

    /// Same settings, different prompt
    #[must_use]
    pub fn with_prompt(&self, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..self.clone()
        }
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Response from a backend
#[derive(Clone, Debug, PartialEq)]
pub struct BackendResponse {
    /// Generated text
    pub text: String,
    /// Model that generated the response
    pub model: String,
    /// Prompt tokens (exact or estimated)
    pub prompt_tokens: u32,
    /// Completion tokens (exact or estimated)
    pub completion_tokens: u32,
    /// Terminal error reported alongside partial output
    pub error: Option<String>,
}

impl BackendResponse {
    /// Build a response whose token counts are estimated from text length
    pub fn estimated(prompt: &str, text: impl Into<String>, model: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            prompt_tokens: estimate_tokens(prompt),
            completion_tokens: estimate_tokens(&text),
            text,
            model: model.into(),
            error: None,
        }
    }

    /// Total tokens
    #[must_use]
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

// ============================================================================
// Chat Messages
// ============================================================================

/// Speaker of a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions
    System,
    /// End-user turn
    User,
    /// Model turn
    Assistant,
}

impl MessageRole {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker
    pub role: MessageRole,
    /// Text content
    pub content: String,
}

impl ChatMessage {
    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Render a conversation as one prompt for single-shot backends
#[must_use]
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Pull a JSON value out of model output, tolerating markdown fences
pub fn parse_json_output(text: &str) -> Result<Value, BackendError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|e| {
        BackendError::new(
            ErrorCode::InvalidInput,
            format!("structured output is not valid JSON: {e}"),
        )
    })
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Capability set every backend instance implements
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name, usually the configured id
    fn name(&self) -> &str;

    /// Implementation type
    fn kind(&self) -> BackendType;

    /// Model this instance talks to
    fn model(&self) -> &str;

    /// Validate credentials and reachability. Must be fast.
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Run one single-shot generation
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;

    /// Run a multi-turn conversation
    ///
    /// The default flattens the conversation into one prompt.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError> {
        let request = request.with_prompt(flatten_messages(messages));
        self.execute(&request).await
    }

    /// Generate a JSON value conforming to `schema`
    ///
    /// The default appends the schema to the prompt and parses the answer.
    async fn generate_structured(
        &self,
        request: &BackendRequest,
        schema: &Value,
    ) -> Result<Value, BackendError> {
        let prompt = format!(
            "{}\n\nRespond only with JSON matching this schema:\n{schema}",
            request.prompt
        );
        let response = self.execute(&request.with_prompt(prompt)).await?;
        parse_json_output(&response.text)
    }

    /// Whether `chat_with_prompt_cache` uses vendor-native caching
    fn supports_prompt_caching(&self) -> bool {
        false
    }

    /// Multi-turn call honoring per-message cache markers
    ///
    /// The default ignores the markers and reports plain input tokens only.
    async fn chat_with_prompt_cache(
        &self,
        messages: &[CachedMessage],
        request: &BackendRequest,
    ) -> Result<CachedChatResponse, BackendError> {
        let plain: Vec<ChatMessage> = messages.iter().map(CachedMessage::to_chat_message).collect();
        let response = self.chat(&plain, request).await?;
        let usage = CacheUsage {
            input_tokens: u64::from(response.prompt_tokens),
            output_tokens: u64::from(response.completion_tokens),
            ..CacheUsage::default()
        };
        Ok(CachedChatResponse { response, usage })
    }

    /// Release resources. Safe to call more than once.
    async fn shutdown(&self) -> Result<(), BackendError>;
}
