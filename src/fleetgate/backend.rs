//! Shared primitives for provider-agnostic LLM backends.
//!
//! The gateway talks to every provider through the [`Backend`] trait and the
//! lightweight data types defined in this module.  The trait abstracts over
//! concrete vendor implementations while the supporting structs describe chat
//! messages, tool schemas, and the normalised stream events every adapter
//! emits.
//!
//! All backends yield normalised [`StreamEvent`]s:
//!
//! - `Delta` — incremental assistant text
//! - `ThinkingDelta` — incremental reasoning text
//! - `ToolCall` — a fully assembled tool invocation
//! - `Done` — completion with stop reason and optional token usage
//! - `Error` — transport/protocol/server failure; the stream terminates
//!
//! No adapter-specific fields leak through this surface.

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

use crate::fleetgate::error::GatewayError;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message (may carry pending tool calls).
    Assistant,
    /// A tool-result message correlating with a prior assistant tool call.
    Tool,
}

impl Role {
    /// Wire identifier (`"system"`, `"user"`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Source of an image content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// Base64-encoded bytes.
    Base64(String),
    /// A URL the provider can fetch.
    Url(String),
}

/// One block of multimodal message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },
    /// An image.  Only `user` messages may carry image blocks.
    Image {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Where the bytes come from.
        source: ImageSource,
    },
}

/// Message body: either a plain string or an ordered block sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Ordered multimodal blocks.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Text rendering of the content.  Image blocks collapse to a count so a
    /// text-only digest can be stored in history.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts: Vec<String> = Vec::new();
                let mut images = 0usize;
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(text.clone()),
                        ContentBlock::Image { .. } => images += 1,
                    }
                }
                if parts.is_empty() && images > 0 {
                    format!("[{} image(s)]", images)
                } else {
                    parts.join(" ")
                }
            }
        }
    }

    /// Whether any block is an image.
    pub fn has_images(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::Image { .. })),
        }
    }
}

/// A single tool call requested by the model.
///
/// Providers assign an opaque [`id`](ToolCallRequest::id) to each call so that
/// the tool result can be correlated back in a follow-up `Role::Tool` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call ID, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolSchema`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the model for this call.
    pub arguments: serde_json::Value,
}

/// Represents a generic message sent to or received from an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: MessageContent,
    /// Tool name, set on tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Correlating call id, set on tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Pending tool calls, set on assistant messages that requested tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Build a plain-text user message.
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Build a multimodal user message.
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Message {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Build a plain assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Build an assistant message carrying pending tool calls.
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Message {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_call_id: None,
            tool_calls,
        }
    }

    /// Build a tool-result message for exactly one prior tool call.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            name: Some(tool_name.into()),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Text rendering of the body.
    pub fn text(&self) -> String {
        self.content.to_text()
    }
}

/// Provider-agnostic tool schema passed to the LLM along with a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name as it will appear in the provider `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    /// Create a schema with the supplied identifier, description, and
    /// parameter schema.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        ToolSchema {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// For a routed tool, the closed enum of its `action` string property.
    ///
    /// Returns `None` when the schema declares no such enum.
    pub fn action_enum(&self) -> Option<Vec<String>> {
        let action = self
            .parameters
            .get("properties")?
            .get("action")?;
        if action.get("type").and_then(|t| t.as_str()) != Some("string") {
            return None;
        }
        let values = action.get("enum")?.as_array()?;
        Some(
            values
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        )
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
}

/// Normalised streaming event emitted by every adapter.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning/thinking text.
    ThinkingDelta {
        /// The text fragment.
        text: String,
    },
    /// A fully assembled tool invocation.
    ToolCall {
        /// Provider-assigned (or synthesised) call id.
        id: String,
        /// Tool name.
        name: String,
        /// Parsed JSON arguments.  Unparseable argument text is wrapped as
        /// `{"raw": "<text>"}`.
        arguments: serde_json::Value,
    },
    /// The model finished its turn.
    Done {
        /// Provider stop reason (e.g. `"end_turn"`, `"tool_use"`).
        stop_reason: String,
        /// Token accounting, when the provider reports it.
        usage: Option<TokenUsage>,
    },
    /// Transport, protocol, or server error.  Terminates the stream.
    Error {
        /// Human-readable message with secrets redacted.
        message: String,
        /// Short machine code (e.g. `"http_error"`, `"connection_error"`).
        code: String,
    },
}

/// Result of a backend health probe.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    /// Whether the backend answered and looks usable.
    pub ok: bool,
    /// Backend identifier.
    pub backend: String,
    /// Probe details (model counts, error strings, wrapped CLI info, …).
    pub detail: HashMap<String, serde_json::Value>,
}

impl BackendHealth {
    /// A healthy probe result for `backend`.
    pub fn healthy(backend: impl Into<String>) -> Self {
        BackendHealth {
            ok: true,
            backend: backend.into(),
            detail: HashMap::new(),
        }
    }

    /// An unhealthy probe result carrying an error string.
    pub fn unhealthy(backend: impl Into<String>, error: impl Into<String>) -> Self {
        let mut detail = HashMap::new();
        detail.insert(
            "error".to_string(),
            serde_json::Value::String(error.into()),
        );
        BackendHealth {
            ok: false,
            backend: backend.into(),
            detail,
        }
    }

    /// Error string from the probe detail, if any.
    pub fn error(&self) -> Option<&str> {
        self.detail.get("error").and_then(|v| v.as_str())
    }
}

/// Config snapshot for one chat request.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Model identifier; empty string means the backend default.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum output tokens, when bounded.
    pub max_tokens: Option<usize>,
    /// Tool schemas available this turn.
    pub tools: Vec<ToolSchema>,
    /// Optional structured-output JSON schema.
    pub response_format: Option<serde_json::Value>,
    /// Provider-specific extras passed through opaquely.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            model: String::new(),
            temperature: 0.7,
            max_tokens: None,
            tools: Vec::new(),
            response_format: None,
            extra: HashMap::new(),
        }
    }
}

/// Type alias for the lazy finite event sequence returned by
/// [`Backend::stream_chat`].
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Trait-driven abstraction for a concrete LLM provider.
///
/// A [`Backend`] instance is responsible for translating gateway requests into
/// the provider-specific wire format and for returning provider events in the
/// uniform [`StreamEvent`] shape.  The abstraction deliberately excludes any
/// conversation bookkeeping: for that see
/// [`AgentLoop`](crate::fleetgate::agent_loop::AgentLoop).
///
/// All implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend identifier (e.g. `"openai-compat"`, `"anthropic"`).
    fn name(&self) -> &str;

    /// Whether the backend supports native tool calling.  When `false`, the
    /// driver inlines tool schemas into the system prompt and extracts
    /// fenced `<tool_call>` blocks from the emitted text.
    fn supports_native_tools(&self) -> bool;

    /// Default model identifier for this backend.
    fn default_model(&self) -> &str;

    /// Base URL the backend talks to.  Empty for non-HTTP backends.  Used by
    /// the subagent spawner to detect local deployments.
    fn base_url(&self) -> &str {
        ""
    }

    /// Stream a chat completion as a lazy finite sequence of [`StreamEvent`]s.
    ///
    /// Errors are reported in-band as [`StreamEvent::Error`] followed by
    /// stream termination; the call itself never fails.
    fn stream_chat(&self, messages: Vec<Message>, config: ChatConfig) -> EventStream;

    /// Probe backend health with a short timeout.
    async fn health_check(&self) -> BackendHealth;

    /// Non-streaming convenience used for auto-compaction summaries.
    ///
    /// The default implementation drains [`stream_chat`](Backend::stream_chat)
    /// and concatenates the text deltas, surfacing any in-band error.
    async fn complete_text(
        &self,
        messages: Vec<Message>,
        config: ChatConfig,
    ) -> Result<String, GatewayError> {
        use futures_util::StreamExt;

        let mut stream = self.stream_chat(messages, config);
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta { text: t } => text.push_str(&t),
                StreamEvent::Error { message, .. } => {
                    return Err(GatewayError::Provider(message))
                }
                _ => {}
            }
        }
        Ok(text)
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest_counts_images() {
        let content = MessageContent::Blocks(vec![ContentBlock::Image {
            media_type: "image/png".to_string(),
            source: ImageSource::Base64("aGk=".to_string()),
        }]);
        assert_eq!(content.to_text(), "[1 image(s)]");
        assert!(content.has_images());
    }

    #[test]
    fn test_action_enum_extraction() {
        let schema = ToolSchema::new(
            "fs",
            "File operations",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["read", "write", "list"]},
                    "path": {"type": "string"}
                },
                "required": ["action"]
            }),
        );
        assert_eq!(
            schema.action_enum(),
            Some(vec![
                "read".to_string(),
                "write".to_string(),
                "list".to_string()
            ])
        );

        let plain = ToolSchema::new("echo", "Echo", serde_json::json!({"type": "object"}));
        assert_eq!(plain.action_enum(), None);
    }

    #[test]
    fn test_tool_result_message_shape() {
        let msg = Message::tool_result("call_1", "fs", "hello");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("fs"));
    }
}
