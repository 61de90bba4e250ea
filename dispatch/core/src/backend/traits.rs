//! LLM Provider Traits
//!
//! Trait definitions for the model providers the router dispatches to. This
//! abstraction lets the router treat cloud APIs, local MCP servers, and test
//! doubles the same way without knowing their transport details.
//!
//! # Design Philosophy
//!
//! The LlmProvider trait provides a common interface for:
//! - Sending a completion request and receiving a response
//! - Optionally streaming a response
//! - Querying available models
//! - Declaring a static capability descriptor used for candidate filtering
//!
//! Implementations handle provider-specific details (API formats, auth, etc.)
//! and report failures as [`ProviderError`], which carries enough metadata
//! (HTTP status, error code, `Retry-After`) for the error classifier.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ============================================================================
// Requests
// ============================================================================

/// Role of a message in the conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A single conversation message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A tool the model may call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool input
    pub input_schema: serde_json::Value,
}

/// A completion request as submitted by the caller
///
/// The router never mutates the caller's request. The fallback chain works on
/// a copy with `model` set to the candidate's model id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation so far, oldest first
    pub messages: Vec<Message>,
    /// Model to use (`provider/model` or a bare model id)
    pub model: Option<String>,
    /// System prompt (optional)
    pub system: Option<String>,
    /// Maximum tokens in the response (0 = provider default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Tools available to the model
    pub tools: Vec<ToolDefinition>,
    /// Whether the caller wants a streamed response
    pub stream: bool,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            model: None,
            system: None,
            max_tokens: 4096,
            temperature: None,
            tools: Vec::new(),
            stream: false,
        }
    }
}

impl CompletionRequest {
    /// Create a request with a single user message
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            ..Default::default()
        }
    }

    /// Append a message
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Set the model id
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    /// Add a tool definition
    #[must_use]
    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Token accounting reported by the provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Response from a completed request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Provider-assigned response ID
    pub id: String,
    /// Model that generated the response
    pub model: String,
    /// Response text
    pub content: String,
    /// Why generation stopped (e.g. "end_turn", "max_tokens")
    pub stop_reason: Option<String>,
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// Create a response with a generated ID
    pub fn new(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            content: content.into(),
            stop_reason: Some("end_turn".to_string()),
            usage: TokenUsage::default(),
        }
    }
}

/// Streamed response events
#[derive(Clone, Debug)]
pub enum StreamChunk {
    /// A fragment of the response
    Delta(String),
    /// Response completed
    Done(CompletionResponse),
    /// Error occurred mid-stream
    Error(ProviderError),
}

/// Information about an available model
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    /// Model identifier
    pub id: String,
    /// Human-readable description
    pub description: Option<String>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
        }
    }
}

// ============================================================================
// Capabilities and Errors
// ============================================================================

/// Static capability descriptor of a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub vision: bool,
    pub tools: bool,
    pub system_prompt: bool,
    pub multi_modal: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            streaming: false,
            vision: false,
            tools: false,
            system_prompt: true,
            multi_modal: false,
        }
    }
}

impl ProviderCapabilities {
    /// A provider that supports everything
    #[must_use]
    pub fn full() -> Self {
        Self {
            streaming: true,
            vision: true,
            tools: true,
            system_prompt: true,
            multi_modal: true,
        }
    }
}

/// Error reported by a provider
///
/// `Display` renders the message followed by the status and code, so text
/// heuristics see e.g. "429" even when the message itself does not contain it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderError {
    /// HTTP status code, if the failure came from an HTTP response
    pub status: Option<u16>,
    /// Transport or API error code (e.g. "ETIMEDOUT")
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Raw `Retry-After` header value, if present
    pub retry_after: Option<String>,
}

impl ProviderError {
    /// Create an error from a message only
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create an error from an HTTP status
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    /// Create an error from a transport error code
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::new(message)
        }
    }

    /// Attach a `Retry-After` header value
    #[must_use]
    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }

    /// Streaming is not implemented by this provider
    pub fn streaming_unsupported(provider: &str) -> Self {
        Self::new(format!("{provider} does not support streaming"))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status {status})")?;
        }
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {}

// ============================================================================
// Provider Trait
// ============================================================================

/// LLM Provider trait
///
/// Implement this trait to make a backend routable.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name of the provider (e.g. "anthropic", "mcp")
    fn name(&self) -> &str;

    /// Static capability descriptor
    fn capabilities(&self) -> ProviderCapabilities;

    /// Send a request and wait for the complete response
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Send a request and get a streaming response
    ///
    /// The channel is closed once the response completes or fails.
    async fn stream_complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError> {
        Err(ProviderError::streaming_unsupported(self.name()))
    }

    /// List available models
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// Check if a specific model is available
    async fn has_model(&self, model: &str) -> Result<bool, ProviderError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.id == model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("hello")
            .with_system("be brief")
            .with_model("mcp/kimi-k2")
            .with_temperature(5.0)
            .with_max_tokens(128);

        assert_eq!(request.messages, vec![Message::user("hello")]);
        assert_eq!(request.system.as_deref(), Some("be brief"));
        assert_eq!(request.model.as_deref(), Some("mcp/kimi-k2"));
        assert_eq!(request.temperature, Some(2.0));
        assert_eq!(request.max_tokens, 128);
    }

    #[test]
    fn test_provider_error_display_includes_status_and_code() {
        let err = ProviderError::http(429, "slow down");
        assert_eq!(err.to_string(), "slow down (status 429)");

        let err = ProviderError::with_code("ETIMEDOUT", "socket hung");
        assert_eq!(err.to_string(), "socket hung [ETIMEDOUT]");

        assert_eq!(ProviderError::new("plain").to_string(), "plain");
    }

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 32,
        };
        assert_eq!(usage.total(), 42);
    }
}
