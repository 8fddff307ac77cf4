//! Native Anthropic Messages API backend with streaming tool support.
//!
//! Unlike the OpenAI-compatible family, Anthropic takes system messages as a
//! dedicated request parameter, renders tool results as `tool_result` content
//! blocks, and streams tool arguments as `input_json_delta` fragments that
//! are assembled here and emitted as a single
//! [`StreamEvent::ToolCall`](crate::fleetgate::backend::StreamEvent) per block.

use async_trait::async_trait;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::fleetgate::backend::{
    Backend, BackendHealth, ChatConfig, ContentBlock, EventStream, ImageSource, Message,
    MessageContent, Role, StreamEvent, TokenUsage,
};
use crate::fleetgate::http::{get_shared_http_client, HEALTH_PROBE_TIMEOUT};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Backend for Anthropic's native Messages API.
pub struct AnthropicBackend {
    base_url: String,
    default_model: String,
    api_key: Option<String>,
}

impl AnthropicBackend {
    /// Create a backend with the given API key and default model.
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self::new_with_base_url(api_key, model, "https://api.anthropic.com")
    }

    /// Create a backend pointing at a custom Anthropic-compatible base URL.
    pub fn new_with_base_url(
        api_key: Option<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        AnthropicBackend {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: model.into(),
            api_key,
        }
    }

    /// Don't leak the API key in error messages.
    fn redact(&self, message: String) -> String {
        match &self.api_key {
            Some(key) if !key.is_empty() && message.contains(key.as_str()) => {
                message.replace(key.as_str(), "[REDACTED]")
            }
            _ => message,
        }
    }

    /// Split messages into (merged system prompt, Anthropic message array).
    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_prompt: Option<String> = None;
        let mut converted: Vec<serde_json::Value> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => {
                    let text = msg.text();
                    system_prompt = Some(match system_prompt.take() {
                        Some(existing) => format!("{}\n\n{}", existing, text),
                        None => text,
                    });
                }
                Role::Tool => {
                    converted.push(serde_json::json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id.as_deref().unwrap_or("unknown"),
                            "content": msg.text(),
                        }]
                    }));
                }
                Role::Assistant if !msg.tool_calls.is_empty() => {
                    let mut blocks: Vec<serde_json::Value> = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": text}));
                    }
                    for tc in &msg.tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    converted.push(serde_json::json!({"role": "assistant", "content": blocks}));
                }
                _ => {
                    let content = match &msg.content {
                        MessageContent::Text(t) => serde_json::Value::String(t.clone()),
                        MessageContent::Blocks(blocks) => serde_json::Value::Array(
                            blocks
                                .iter()
                                .map(|b| match b {
                                    ContentBlock::Text { text } => {
                                        serde_json::json!({"type": "text", "text": text})
                                    }
                                    ContentBlock::Image { media_type, source } => match source {
                                        ImageSource::Base64(data) => serde_json::json!({
                                            "type": "image",
                                            "source": {
                                                "type": "base64",
                                                "media_type": media_type,
                                                "data": data,
                                            }
                                        }),
                                        ImageSource::Url(url) => serde_json::json!({
                                            "type": "image",
                                            "source": {"type": "url", "url": url}
                                        }),
                                    },
                                })
                                .collect(),
                        ),
                    };
                    converted.push(serde_json::json!({
                        "role": msg.role.as_str(),
                        "content": content,
                    }));
                }
            }
        }

        (system_prompt, converted)
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports_native_tools(&self) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stream_chat(&self, messages: Vec<Message>, config: ChatConfig) -> EventStream {
        let url = format!("{}/v1/messages", self.base_url);
        let api_key = self.api_key.clone();
        let model = if config.model.is_empty() {
            self.default_model.clone()
        } else {
            config.model.clone()
        };

        let (system_prompt, anthropic_messages) = Self::convert_messages(&messages);

        let mut payload = serde_json::json!({
            "model": model,
            "messages": anthropic_messages,
            "max_tokens": config.max_tokens.unwrap_or(4096),
            "stream": true,
        });
        if let Some(system) = system_prompt {
            payload["system"] = serde_json::Value::String(system);
        }
        if !config.tools.is_empty() {
            payload["tools"] = serde_json::Value::Array(
                config
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }

        let redact = {
            let api_key = api_key.clone();
            move |message: String| -> String {
                match &api_key {
                    Some(key) if !key.is_empty() && message.contains(key.as_str()) => {
                        message.replace(key.as_str(), "[REDACTED]")
                    }
                    _ => message,
                }
            }
        };

        Box::pin(async_stream::stream! {
            let key = match &api_key {
                Some(k) if !k.is_empty() => k.clone(),
                _ => {
                    yield StreamEvent::Error {
                        message: "ANTHROPIC_API_KEY not set".to_string(),
                        code: "client_init_error".to_string(),
                    };
                    return;
                }
            };

            let response = match get_shared_http_client()
                .post(&url)
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&payload)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let code = if e.is_connect() { "connection_error" } else { "api_error" };
                    yield StreamEvent::Error {
                        message: redact(e.to_string()),
                        code: code.to_string(),
                    };
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let detail = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")
                            .and_then(|e| e.get("message"))
                            .and_then(|m| m.as_str())
                            .map(|s| s.to_string())
                    })
                    .unwrap_or_else(|| body.chars().take(200).collect());
                yield StreamEvent::Error {
                    message: redact(format!("HTTP {} from anthropic: {}", status.as_u16(), detail)),
                    code: "api_error".to_string(),
                };
                return;
            }

            // Tool call being assembled from input_json_delta fragments.
            let mut current_tool_id: Option<String> = None;
            let mut current_tool_name: Option<String> = None;
            let mut current_tool_json = String::new();

            let mut input_tokens: usize = 0;
            let mut output_tokens: usize = 0;
            let mut stop_reason = "end_turn".to_string();

            let mut leftover = String::new();
            let mut byte_stream = response.bytes_stream();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error {
                            message: redact(format!("Stream read error: {}", e)),
                            code: "stream_error".to_string(),
                        };
                        return;
                    }
                };

                let text = String::from_utf8_lossy(&chunk);
                let combined = format!("{}{}", leftover, text);
                leftover.clear();

                let mut lines: Vec<&str> = combined.split('\n').collect();
                if !combined.ends_with('\n') {
                    if let Some(last) = lines.pop() {
                        leftover = last.to_string();
                    }
                }

                for line in lines {
                    let line = line.trim();
                    let data = match line.strip_prefix("data: ") {
                        Some(d) => d,
                        None => continue,
                    };
                    let obj: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };

                    match obj.get("type").and_then(|t| t.as_str()) {
                        Some("message_start") => {
                            if let Some(usage) = obj
                                .get("message")
                                .and_then(|m| m.get("usage"))
                            {
                                input_tokens = usage
                                    .get("input_tokens")
                                    .and_then(|v| v.as_u64())
                                    .unwrap_or(0) as usize;
                            }
                        }
                        Some("content_block_start") => {
                            let block = obj.get("content_block");
                            if block.and_then(|b| b.get("type")).and_then(|t| t.as_str())
                                == Some("tool_use")
                            {
                                current_tool_id = Some(
                                    block
                                        .and_then(|b| b.get("id"))
                                        .and_then(|i| i.as_str())
                                        .map(|s| s.to_string())
                                        .unwrap_or_else(|| {
                                            format!("tool_{}", &Uuid::new_v4().simple().to_string()[..8])
                                        }),
                                );
                                current_tool_name = block
                                    .and_then(|b| b.get("name"))
                                    .and_then(|n| n.as_str())
                                    .map(|s| s.to_string());
                                current_tool_json.clear();
                            }
                        }
                        Some("content_block_delta") => {
                            match obj
                                .get("delta")
                                .and_then(|d| d.get("type"))
                                .and_then(|t| t.as_str())
                            {
                                Some("text_delta") => {
                                    if let Some(text) = obj
                                        .get("delta")
                                        .and_then(|d| d.get("text"))
                                        .and_then(|t| t.as_str())
                                    {
                                        if !text.is_empty() {
                                            yield StreamEvent::Delta { text: text.to_string() };
                                        }
                                    }
                                }
                                Some("thinking_delta") => {
                                    if let Some(text) = obj
                                        .get("delta")
                                        .and_then(|d| d.get("thinking"))
                                        .and_then(|t| t.as_str())
                                    {
                                        if !text.is_empty() {
                                            yield StreamEvent::ThinkingDelta {
                                                text: text.to_string(),
                                            };
                                        }
                                    }
                                }
                                Some("input_json_delta") => {
                                    if let Some(partial) = obj
                                        .get("delta")
                                        .and_then(|d| d.get("partial_json"))
                                        .and_then(|p| p.as_str())
                                    {
                                        current_tool_json.push_str(partial);
                                    }
                                }
                                _ => {}
                            }
                        }
                        Some("content_block_stop") => {
                            if let (Some(id), Some(name)) =
                                (current_tool_id.take(), current_tool_name.take())
                            {
                                let raw = std::mem::replace(&mut current_tool_json, String::new());
                                let arguments = if raw.is_empty() {
                                    serde_json::json!({})
                                } else {
                                    serde_json::from_str(&raw)
                                        .unwrap_or_else(|_| serde_json::json!({ "raw": raw }))
                                };
                                yield StreamEvent::ToolCall { id, name, arguments };
                            }
                        }
                        Some("message_delta") => {
                            if let Some(reason) = obj
                                .get("delta")
                                .and_then(|d| d.get("stop_reason"))
                                .and_then(|r| r.as_str())
                            {
                                stop_reason = reason.to_string();
                            }
                            if let Some(out) = obj
                                .get("usage")
                                .and_then(|u| u.get("output_tokens"))
                                .and_then(|v| v.as_u64())
                            {
                                output_tokens = out as usize;
                            }
                        }
                        Some("message_stop") => {
                            yield StreamEvent::Done {
                                stop_reason: stop_reason.clone(),
                                usage: Some(TokenUsage {
                                    input_tokens,
                                    output_tokens,
                                }),
                            };
                            return;
                        }
                        Some("error") => {
                            let message = obj
                                .get("error")
                                .and_then(|e| e.get("message"))
                                .and_then(|m| m.as_str())
                                .unwrap_or("unknown provider error")
                                .to_string();
                            yield StreamEvent::Error {
                                message: redact(message),
                                code: "api_error".to_string(),
                            };
                            return;
                        }
                        _ => {}
                    }
                }
            }

            // Fallback done event when the stream closes early.
            yield StreamEvent::Done { stop_reason, usage: None };
        })
    }

    async fn health_check(&self) -> BackendHealth {
        let key = match &self.api_key {
            Some(k) if !k.is_empty() => k.clone(),
            _ => {
                return BackendHealth::unhealthy(self.name(), "ANTHROPIC_API_KEY not set");
            }
        };

        // Minimal non-streaming call to verify credentials.
        let payload = serde_json::json!({
            "model": self.default_model,
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "Hi"}],
        });

        let result = get_shared_http_client()
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let mut health = BackendHealth::healthy(self.name());
                health.detail.insert(
                    "model".to_string(),
                    serde_json::Value::String(self.default_model.clone()),
                );
                health
            }
            Ok(resp) => BackendHealth::unhealthy(
                self.name(),
                self.redact(format!("HTTP {}", resp.status().as_u16())),
            ),
            Err(e) => BackendHealth::unhealthy(self.name(), self.redact(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_messages_merge_into_parameter() {
        let messages = vec![
            Message::system("First."),
            Message::system("Second."),
            Message::user("Hello"),
        ];
        let (system, converted) = AnthropicBackend::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("First.\n\nSecond."));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["role"], "user");
    }

    #[test]
    fn test_tool_result_becomes_tool_result_block() {
        let messages = vec![Message::tool_result("toolu_1", "fs", "contents")];
        let (_, converted) = AnthropicBackend::convert_messages(&messages);
        assert_eq!(converted[0]["role"], "user");
        assert_eq!(converted[0]["content"][0]["type"], "tool_result");
        assert_eq!(converted[0]["content"][0]["tool_use_id"], "toolu_1");
    }
}
