//! Session hook collaborator.
//!
//! The external session manager observes every tool dispatch through four
//! JSON hooks: `pre-tool` (may block the call), `post-tool` (informational),
//! `log-progress`, and `get-context` (used for system-prompt refresh).
//! Pre-hook failures are fail-closed; post-hook failures are logged and
//! non-fatal.

use async_trait::async_trait;

use crate::fleetgate::http::get_shared_http_client;

/// Verdict of the pre-tool hook.
#[derive(Debug, Clone)]
pub struct HookDecision {
    /// Whether the hook itself executed successfully.
    pub ok: bool,
    /// Whether the hook allows the tool call.
    pub allow: bool,
    /// Reason for a refusal or failure.
    pub reason: String,
}

impl HookDecision {
    /// The permissive default.
    pub fn allow() -> Self {
        HookDecision {
            ok: true,
            allow: true,
            reason: String::new(),
        }
    }
}

/// External session collaborator observing tool dispatches.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Called before every tool dispatch.  `ok=false` or `allow=false`
    /// blocks the call.
    async fn pre_tool(&self, tool_name: &str, args: &serde_json::Value) -> HookDecision;

    /// Called after every dispatch with the outcome and a truncated result.
    /// Returns whether the hook executed; failures are non-fatal.
    async fn post_tool(&self, tool_name: &str, ok: bool, truncated_result: &str) -> bool;

    /// Forward a progress line to the session log.
    async fn log_progress(&self, message: &str) -> bool;

    /// Fetch fresh context for the system prompt.  `None` when unavailable.
    async fn get_context(&self) -> Option<String>;

    /// Whether this session holds the leader role.
    fn is_leader(&self) -> bool {
        true
    }
}

/// No-op hooks for sessions without an external collaborator.
pub struct NoopSessionHooks {
    leader: bool,
}

impl NoopSessionHooks {
    /// Hooks that allow everything; `leader` controls the role gate.
    pub fn new(leader: bool) -> Self {
        NoopSessionHooks { leader }
    }
}

#[async_trait]
impl SessionHooks for NoopSessionHooks {
    async fn pre_tool(&self, _tool_name: &str, _args: &serde_json::Value) -> HookDecision {
        HookDecision::allow()
    }

    async fn post_tool(&self, _tool_name: &str, _ok: bool, _truncated_result: &str) -> bool {
        true
    }

    async fn log_progress(&self, _message: &str) -> bool {
        true
    }

    async fn get_context(&self) -> Option<String> {
        None
    }

    fn is_leader(&self) -> bool {
        self.leader
    }
}

/// HTTP implementation posting JSON to the session manager's hook endpoints.
pub struct HttpSessionHooks {
    base_url: String,
    leader: bool,
}

impl HttpSessionHooks {
    /// Create hooks against `base_url` (e.g. `http://127.0.0.1:8200`).
    pub fn new(base_url: impl Into<String>, leader: bool) -> Self {
        HttpSessionHooks {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            leader,
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Option<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, path);
        match get_shared_http_client().post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Hook {} returned HTTP {}", path, resp.status().as_u16());
                }
                None
            }
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Hook {} failed: {}", path, e);
                }
                None
            }
        }
    }
}

#[async_trait]
impl SessionHooks for HttpSessionHooks {
    async fn pre_tool(&self, tool_name: &str, args: &serde_json::Value) -> HookDecision {
        let body = serde_json::json!({"tool_name": tool_name, "arguments": args});
        match self.post("hooks/pre-tool", body).await {
            Some(resp) => HookDecision {
                ok: resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
                allow: resp.get("allow").and_then(|v| v.as_bool()).unwrap_or(true),
                reason: resp
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            },
            // Fail-closed: an unreachable pre-hook blocks the call.
            None => HookDecision {
                ok: false,
                allow: false,
                reason: "pre-tool hook unreachable".to_string(),
            },
        }
    }

    async fn post_tool(&self, tool_name: &str, ok: bool, truncated_result: &str) -> bool {
        let body = serde_json::json!({
            "tool_name": tool_name,
            "ok": ok,
            "result": truncated_result,
        });
        self.post("hooks/post-tool", body)
            .await
            .and_then(|resp| resp.get("ok").and_then(|v| v.as_bool()))
            .unwrap_or(false)
    }

    async fn log_progress(&self, message: &str) -> bool {
        let body = serde_json::json!({"message": message});
        self.post("hooks/log-progress", body)
            .await
            .and_then(|resp| resp.get("ok").and_then(|v| v.as_bool()))
            .unwrap_or(false)
    }

    async fn get_context(&self) -> Option<String> {
        self.post("hooks/get-context", serde_json::json!({}))
            .await
            .and_then(|resp| {
                resp.get("context")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
    }

    fn is_leader(&self) -> bool {
        self.leader
    }
}
