//! CLI-wrapper backend: drives the vendor `claude` CLI as a subprocess.
//!
//! The CLI is spawned in print mode with `--output-format stream-json`, so
//! stdout carries one JSON event per line.  Those line events are translated
//! into normalised [`StreamEvent`]s.  The CLI executes its own internal tools,
//! so this backend reports `supports_native_tools = false` and the driver
//! treats its output as plain text.
//!
//! PTY-based interactive session management is a separate collaborator and
//! out of scope here.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::fleetgate::backend::{
    Backend, BackendHealth, ChatConfig, EventStream, Message, Role, StreamEvent, TokenUsage,
};

/// Backend wrapping the `claude` CLI binary.
pub struct ClaudeCliBackend {
    binary: String,
    default_model: String,
}

impl ClaudeCliBackend {
    /// Create a wrapper for the `claude` binary on `PATH`.
    pub fn new(model: impl Into<String>) -> Self {
        Self::new_with_binary("claude", model)
    }

    /// Create a wrapper for an explicit binary path.
    pub fn new_with_binary(binary: impl Into<String>, model: impl Into<String>) -> Self {
        ClaudeCliBackend {
            binary: binary.into(),
            default_model: model.into(),
        }
    }

    /// Flatten the normalised message list into one prompt string.
    ///
    /// The CLI takes a single prompt, so prior turns are rendered as a
    /// transcript with role markers; the system prompt goes through
    /// `--system-prompt` instead.
    fn build_prompt(messages: &[Message]) -> (Option<String>, String) {
        let mut system: Option<String> = None;
        let mut transcript: Vec<String> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => {
                    let text = msg.text();
                    system = Some(match system.take() {
                        Some(existing) => format!("{}\n\n{}", existing, text),
                        None => text,
                    });
                }
                Role::User => transcript.push(format!("User: {}", msg.text())),
                Role::Assistant => transcript.push(format!("Assistant: {}", msg.text())),
                Role::Tool => transcript.push(format!(
                    "Tool result ({}): {}",
                    msg.name.as_deref().unwrap_or("tool"),
                    msg.text()
                )),
            }
        }

        (system, transcript.join("\n\n"))
    }
}

#[async_trait]
impl Backend for ClaudeCliBackend {
    fn name(&self) -> &str {
        "claude-cli"
    }

    fn supports_native_tools(&self) -> bool {
        false
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn stream_chat(&self, messages: Vec<Message>, config: ChatConfig) -> EventStream {
        let binary = self.binary.clone();
        let model = if config.model.is_empty() {
            self.default_model.clone()
        } else {
            config.model.clone()
        };

        let (system, prompt) = Self::build_prompt(&messages);

        Box::pin(async_stream::stream! {
            let mut command = Command::new(&binary);
            command
                .arg("-p")
                .arg(&prompt)
                .arg("--output-format")
                .arg("stream-json")
                .arg("--verbose")
                .arg("--model")
                .arg(&model)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            if let Some(system) = &system {
                command.arg("--system-prompt").arg(system);
            }

            let mut child = match command.spawn() {
                Ok(c) => c,
                Err(e) => {
                    yield StreamEvent::Error {
                        message: format!("Failed to spawn {}: {}", binary, e),
                        code: "spawn_error".to_string(),
                    };
                    return;
                }
            };

            let stdout = match child.stdout.take() {
                Some(out) => out,
                None => {
                    yield StreamEvent::Error {
                        message: "CLI produced no stdout handle".to_string(),
                        code: "spawn_error".to_string(),
                    };
                    return;
                }
            };

            let mut lines = BufReader::new(stdout).lines();
            let mut emitted_done = false;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield StreamEvent::Error {
                            message: format!("CLI read error: {}", e),
                            code: "stream_error".to_string(),
                        };
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let obj: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                match obj.get("type").and_then(|t| t.as_str()) {
                    Some("assistant") => {
                        let blocks = obj
                            .get("message")
                            .and_then(|m| m.get("content"))
                            .and_then(|c| c.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for block in blocks {
                            match block.get("type").and_then(|t| t.as_str()) {
                                Some("text") => {
                                    if let Some(text) =
                                        block.get("text").and_then(|t| t.as_str())
                                    {
                                        if !text.is_empty() {
                                            yield StreamEvent::Delta {
                                                text: text.to_string(),
                                            };
                                        }
                                    }
                                }
                                Some("thinking") => {
                                    if let Some(text) =
                                        block.get("thinking").and_then(|t| t.as_str())
                                    {
                                        if !text.is_empty() {
                                            yield StreamEvent::ThinkingDelta {
                                                text: text.to_string(),
                                            };
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    Some("result") => {
                        let usage = obj.get("usage").map(|u| TokenUsage {
                            input_tokens: u
                                .get("input_tokens")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(0) as usize,
                            output_tokens: u
                                .get("output_tokens")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(0) as usize,
                        });
                        let is_error = obj
                            .get("is_error")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        if is_error {
                            let message = obj
                                .get("result")
                                .and_then(|r| r.as_str())
                                .unwrap_or("CLI reported an error")
                                .to_string();
                            yield StreamEvent::Error {
                                message,
                                code: "cli_error".to_string(),
                            };
                        } else {
                            yield StreamEvent::Done {
                                stop_reason: "end_turn".to_string(),
                                usage,
                            };
                        }
                        emitted_done = true;
                    }
                    _ => {}
                }
            }

            let status = child.wait().await;
            if !emitted_done {
                match status {
                    Ok(status) if status.success() => {
                        yield StreamEvent::Done {
                            stop_reason: "end_turn".to_string(),
                            usage: None,
                        };
                    }
                    Ok(status) => {
                        yield StreamEvent::Error {
                            message: format!("CLI exited with {}", status),
                            code: "cli_error".to_string(),
                        };
                    }
                    Err(e) => {
                        yield StreamEvent::Error {
                            message: format!("CLI wait failed: {}", e),
                            code: "cli_error".to_string(),
                        };
                    }
                }
            }
        })
    }

    async fn health_check(&self) -> BackendHealth {
        let mut command = Command::new(&self.binary);
        command
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let probe = command.output();

        match tokio::time::timeout(crate::fleetgate::http::HEALTH_PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let mut health = BackendHealth::healthy(self.name());
                health.detail.insert(
                    "version".to_string(),
                    serde_json::Value::String(version),
                );
                health
            }
            Ok(Ok(output)) => BackendHealth::unhealthy(
                self.name(),
                format!("{} --version exited with {}", self.binary, output.status),
            ),
            Ok(Err(e)) => BackendHealth::unhealthy(
                self.name(),
                format!("{} not runnable: {}", self.binary, e),
            ),
            Err(_) => BackendHealth::unhealthy(self.name(), "version probe timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_flattening() {
        let messages = vec![
            Message::system("Be terse."),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("bye"),
        ];
        let (system, prompt) = ClaudeCliBackend::build_prompt(&messages);
        assert_eq!(system.as_deref(), Some("Be terse."));
        assert!(prompt.starts_with("User: hi"));
        assert!(prompt.contains("Assistant: hello"));
        assert!(prompt.ends_with("User: bye"));
    }
}
