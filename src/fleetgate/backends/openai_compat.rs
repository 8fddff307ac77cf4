//! OpenAI-compatible streaming backend for local inference servers.
//!
//! Talks to any server exposing the OpenAI Chat Completions surface
//! (LM Studio, Ollama, llama.cpp, vLLM, self-hosted proxies).  Streams SSE
//! chunks, reassembles index-keyed tool-call argument fragments, and
//! translates everything into normalised [`StreamEvent`]s.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::fleetgate::backend::{
    Backend, BackendHealth, ChatConfig, ContentBlock, EventStream, ImageSource, Message,
    MessageContent, Role, StreamEvent, TokenUsage,
};
use crate::fleetgate::http::{get_shared_http_client, HEALTH_PROBE_TIMEOUT};

/// Model-name substrings known to support native tool calling on local
/// OpenAI-compatible servers.
pub const NATIVE_TOOL_MODELS: [&str; 5] = ["qwen", "llama-3", "mistral", "devstral", "ministral"];

/// A partially assembled tool call keyed by stream index.
#[derive(Debug, Default, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    /// Flush into a [`StreamEvent::ToolCall`], wrapping unparseable argument
    /// text as `{"raw": …}`.
    fn into_event(self) -> StreamEvent {
        let arguments = if self.arguments.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments)
                .unwrap_or_else(|_| serde_json::json!({ "raw": self.arguments }))
        };
        StreamEvent::ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Backend for OpenAI-compatible HTTP servers.
pub struct OpenAICompatBackend {
    base_url: String,
    default_model: String,
    /// Bearer token, when the server requires one.
    bearer_token: Option<String>,
    name: String,
}

impl OpenAICompatBackend {
    /// Create a backend pointing at `base_url` with the given default model.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        OpenAICompatBackend {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: model.into(),
            bearer_token: None,
            name: "openai-compat".to_string(),
        }
    }

    /// Attach a bearer token sent with every request (builder pattern).
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Override the backend identifier (used by delegating wrappers).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether a specific model supports native tool calling.
    pub fn model_supports_tools(&self, model: &str) -> bool {
        let model_lower = model.to_ascii_lowercase();
        NATIVE_TOOL_MODELS.iter().any(|p| model_lower.contains(p))
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        match &self.bearer_token {
            Some(token) => vec![("Authorization".to_string(), format!("Bearer {}", token))],
            None => Vec::new(),
        }
    }

    /// Strip the bearer token out of error text.
    fn redact(&self, message: String) -> String {
        match &self.bearer_token {
            Some(token) if !token.is_empty() && message.contains(token.as_str()) => {
                message.replace(token.as_str(), "[REDACTED]")
            }
            _ => message,
        }
    }
}

/// Serialise normalised messages into the OpenAI wire format.
///
/// | [`Role`] variant | Wire representation |
/// |---|---|
/// | `System` | `{"role":"system","content":"..."}` |
/// | `User` (text) | `{"role":"user","content":"..."}` |
/// | `User` (blocks) | `{"role":"user","content":[{"type":"text",...},{"type":"image_url",...}]}` |
/// | `Assistant` with tool_calls | `{"role":"assistant","content":...,"tool_calls":[...]}` |
/// | `Tool` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
pub fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            let content_value = match &msg.content {
                MessageContent::Text(t) => serde_json::Value::String(t.clone()),
                MessageContent::Blocks(blocks) => serde_json::Value::Array(
                    blocks
                        .iter()
                        .map(|b| match b {
                            ContentBlock::Text { text } => {
                                serde_json::json!({"type": "text", "text": text})
                            }
                            ContentBlock::Image { media_type, source } => {
                                let url = match source {
                                    ImageSource::Url(u) => u.clone(),
                                    ImageSource::Base64(b64) => {
                                        format!("data:{};base64,{}", media_type, b64)
                                    }
                                };
                                serde_json::json!({"type": "image_url", "image_url": {"url": url}})
                            }
                        })
                        .collect(),
                ),
            };

            let mut m = serde_json::json!({
                "role": msg.role.as_str(),
                "content": content_value,
            });
            if let Some(name) = &msg.name {
                m["name"] = serde_json::Value::String(name.clone());
            }
            if let Some(call_id) = &msg.tool_call_id {
                m["tool_call_id"] = serde_json::Value::String(call_id.clone());
            }
            if !msg.tool_calls.is_empty() && msg.role == Role::Assistant {
                m["tool_calls"] = serde_json::Value::Array(
                    msg.tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::to_string(&tc.arguments)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                }
                            })
                        })
                        .collect(),
                );
            }
            m
        })
        .collect()
}

/// Drain accumulated tool calls ordered by stream index.
fn drain_pending(pending: &mut HashMap<u64, PendingToolCall>) -> Vec<StreamEvent> {
    let mut indices: Vec<u64> = pending.keys().copied().collect();
    indices.sort_unstable();
    indices
        .into_iter()
        .filter_map(|idx| pending.remove(&idx))
        .map(PendingToolCall::into_event)
        .collect()
}

/// Parse the `usage` object of a completion chunk into [`TokenUsage`].
fn parse_usage(obj: &serde_json::Value) -> Option<TokenUsage> {
    let usage = obj.get("usage")?;
    let input = usage.get("prompt_tokens").and_then(|v| v.as_u64())?;
    let output = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some(TokenUsage {
        input_tokens: input as usize,
        output_tokens: output as usize,
    })
}

#[async_trait]
impl Backend for OpenAICompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_native_tools(&self) -> bool {
        self.model_supports_tools(&self.default_model)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stream_chat(&self, messages: Vec<Message>, config: ChatConfig) -> EventStream {
        let url = format!("{}/chat/completions", self.base_url);
        let backend_name = self.name.clone();
        let base_url = self.base_url.clone();
        let headers = self.request_headers();
        let token = self.bearer_token.clone();

        let model = if config.model.is_empty() {
            self.default_model.clone()
        } else {
            config.model.clone()
        };
        let use_native_tools = self.model_supports_tools(&model) && !config.tools.is_empty();

        let mut payload = serde_json::json!({
            "model": model,
            "stream": true,
            "messages": wire_messages(&messages),
            "temperature": config.temperature,
        });
        if let Some(max_tokens) = config.max_tokens {
            payload["max_tokens"] = serde_json::json!(max_tokens);
        }
        if use_native_tools {
            payload["tools"] = serde_json::Value::Array(
                config
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(format) = &config.response_format {
            payload["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.get("name").and_then(|n| n.as_str()).unwrap_or("response"),
                    "strict": true,
                    "schema": format.get("schema").cloned().unwrap_or_else(|| format.clone()),
                }
            });
        }
        for (key, value) in &config.extra {
            payload[key.as_str()] = value.clone();
        }

        let redact = move |message: String| -> String {
            match &token {
                Some(t) if !t.is_empty() && message.contains(t.as_str()) => {
                    message.replace(t.as_str(), "[REDACTED]")
                }
                _ => message,
            }
        };

        Box::pin(async_stream::stream! {
            let mut request = get_shared_http_client().post(&url).json(&payload);
            for (key, value) in &headers {
                request = request.header(key.as_str(), value.as_str());
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    let code = if e.is_connect() { "connection_error" } else { "http_error" };
                    yield StreamEvent::Error {
                        message: redact(format!("Cannot reach {} at {}: {}", backend_name, base_url, e)),
                        code: code.to_string(),
                    };
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                // Pull a human message out of OpenAI- or FastAPI-style bodies.
                let detail = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")
                            .and_then(|e| e.get("message"))
                            .and_then(|m| m.as_str())
                            .map(|s| s.to_string())
                            .or_else(|| {
                                v.get("detail").and_then(|d| d.as_str()).map(|s| s.to_string())
                            })
                    })
                    .unwrap_or_else(|| body.chars().take(200).collect());
                let mut message = format!("HTTP {} from {}", status.as_u16(), backend_name);
                if !detail.is_empty() {
                    message.push_str(": ");
                    message.push_str(&detail);
                }
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("[{}] {}", backend_name, message);
                }
                yield StreamEvent::Error { message: redact(message), code: "http_error".to_string() };
                return;
            }

            let mut pending_tool_calls: HashMap<u64, PendingToolCall> = HashMap::new();
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
                // The last element might be an incomplete line; carry it over.
                if !combined.ends_with('\n') {
                    if let Some(last) = lines.pop() {
                        leftover = last.to_string();
                    }
                }

                for line in lines {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let data = line.strip_prefix("data: ").unwrap_or(line);

                    if data == "[DONE]" {
                        for event in drain_pending(&mut pending_tool_calls) {
                            yield event;
                        }
                        yield StreamEvent::Done {
                            stop_reason: "end_turn".to_string(),
                            usage: None,
                        };
                        return;
                    }

                    let obj: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let choice0 = obj
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .cloned()
                        .unwrap_or_default();
                    let delta = choice0.get("delta").cloned().unwrap_or_default();

                    if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                        if !content.is_empty() {
                            yield StreamEvent::Delta { text: content.to_string() };
                        }
                    }
                    // Reasoning text from thinking-capable models.
                    if let Some(reasoning) = delta
                        .get("reasoning_content")
                        .and_then(|c| c.as_str())
                    {
                        if !reasoning.is_empty() {
                            yield StreamEvent::ThinkingDelta { text: reasoning.to_string() };
                        }
                    }

                    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                        for tc in tool_calls {
                            let idx = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                            let entry = pending_tool_calls.entry(idx).or_insert_with(|| {
                                PendingToolCall {
                                    id: format!("call_{}", idx),
                                    ..Default::default()
                                }
                            });
                            if let Some(id) = tc.get("id").and_then(|i| i.as_str()) {
                                entry.id = id.to_string();
                            }
                            if let Some(func) = tc.get("function") {
                                if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                                    entry.name = name.to_string();
                                }
                                if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                                    entry.arguments.push_str(args);
                                }
                            }
                        }
                    }

                    if let Some(finish) = choice0.get("finish_reason").and_then(|f| f.as_str()) {
                        for event in drain_pending(&mut pending_tool_calls) {
                            yield event;
                        }
                        yield StreamEvent::Done {
                            stop_reason: finish.to_string(),
                            usage: parse_usage(&obj),
                        };
                        return;
                    }
                }
            }

            // Stream ended without an explicit finish; close it out.
            for event in drain_pending(&mut pending_tool_calls) {
                yield event;
            }
            yield StreamEvent::Done {
                stop_reason: "end_turn".to_string(),
                usage: None,
            };
        })
    }

    async fn health_check(&self) -> BackendHealth {
        let url = format!("{}/models", self.base_url);
        let mut request = get_shared_http_client()
            .get(&url)
            .timeout(HEALTH_PROBE_TIMEOUT);
        for (key, value) in self.request_headers() {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                let model_count = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("data").and_then(|d| d.as_array()).map(|a| a.len()))
                    .unwrap_or(0);
                let mut health = BackendHealth::healthy(self.name.clone());
                health.detail.insert(
                    "base_url".to_string(),
                    serde_json::Value::String(self.base_url.clone()),
                );
                health.detail.insert(
                    "model_count".to_string(),
                    serde_json::json!(model_count),
                );
                health
            }
            Ok(resp) => BackendHealth::unhealthy(
                self.name.clone(),
                self.redact(format!("HTTP {} from {}", resp.status().as_u16(), url)),
            ),
            Err(e) => BackendHealth::unhealthy(self.name.clone(), self.redact(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleetgate::backend::ToolCallRequest;

    #[test]
    fn test_native_tool_model_detection() {
        let backend = OpenAICompatBackend::new("http://127.0.0.1:1234/v1", "devstral-small");
        assert!(backend.supports_native_tools());
        assert!(!backend.model_supports_tools("gemma-3-4b-it"));
    }

    #[test]
    fn test_wire_tool_result_message() {
        let msgs = vec![Message::tool_result("call_9", "fs", "ok")];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_9");
        assert_eq!(wire[0]["content"], "ok");
    }

    #[test]
    fn test_wire_assistant_tool_calls() {
        let msgs = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".to_string(),
                name: "fs".to_string(),
                arguments: serde_json::json!({"action": "read", "path": "x"}),
            }],
        )];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "fs");
        // Arguments travel as a JSON string on the OpenAI wire.
        assert!(wire[0]["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn test_pending_tool_call_raw_fallback() {
        let pending = PendingToolCall {
            id: "call_0".to_string(),
            name: "fs".to_string(),
            arguments: "{not json".to_string(),
        };
        match pending.into_event() {
            StreamEvent::ToolCall { arguments, .. } => {
                assert_eq!(arguments["raw"], "{not json");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
