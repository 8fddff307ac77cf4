//! External tool host protocol.
//!
//! The gateway forwards non-local tool calls to a tool host over two JSON
//! operations: `list-tools` and `call-tool`.  A closed set of tool names is
//! treated as **local** and never forwarded: the user-question ask and the
//! subagent spawners are handled in-process by the driver.
//!
//! Routed tools carry an `action` string.  Validation here is *permissive*:
//! an action absent from both the tool schema's enum and the gateway's own
//! known-action table produces a warning, but the call still proceeds — the
//! tool host is authoritative.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::fleetgate::backend::ToolSchema;
use crate::fleetgate::http::{get_shared_http_client, TOOL_HOST_TIMEOUT};
use crate::fleetgate::subagent;

/// Tool names handled in-process and never forwarded to the tool host.
pub const LOCAL_TOOLS: [&str; 3] = [
    "ask_user_question",
    "spawn_subagent",
    "spawn_parallel_subagents",
];

/// Whether `name` is a local tool.
pub fn is_local_tool(name: &str) -> bool {
    LOCAL_TOOLS.contains(&name)
}

/// Known actions per routed tool, used for permissive validation.
pub fn routed_tool_actions() -> HashMap<&'static str, HashSet<&'static str>> {
    let mut m: HashMap<&'static str, HashSet<&'static str>> = HashMap::new();
    m.insert(
        "fs",
        ["read", "list", "write", "edit", "delete"].iter().copied().collect(),
    );
    m.insert(
        "term",
        [
            "help", "list", "read", "term_read", "resolve", "send_line", "write", "talk",
            "create", "send_line_to_agent", "resize",
        ]
        .iter()
        .copied()
        .collect(),
    );
    m.insert(
        "search",
        ["help", "query", "status", "query_semantic", "query_hybrid"]
            .iter()
            .copied()
            .collect(),
    );
    m.insert("repo", ["help", "status", "get", "list", "run"].iter().copied().collect());
    m.insert("checkpoint", ["help", "list", "load", "save"].iter().copied().collect());
    m.insert(
        "session",
        ["help", "context", "start", "end", "log"].iter().copied().collect(),
    );
    m.insert(
        "memory",
        ["help", "get", "set_goal", "add_blocker", "clear_blockers", "set_steps", "reset"]
            .iter()
            .copied()
            .collect(),
    );
    m.insert(
        "inbox",
        ["help", "list", "read", "stats", "send", "complete", "claim", "mark_read"]
            .iter()
            .copied()
            .collect(),
    );
    m.insert(
        "interact",
        ["ask", "approve", "plan", "screenshot"].iter().copied().collect(),
    );
    m.insert("screen_capture", ["capture", "list"].iter().copied().collect());
    m
}

/// Validate the `action` argument of a routed tool call.
///
/// Permissive: returns a warning string only when the action is missing or
/// unknown to both the supplied schema and the gateway table; callers log the
/// warning and proceed anyway.
pub fn validate_routed_action(
    tool_name: &str,
    args: &serde_json::Value,
    schema: Option<&ToolSchema>,
) -> Option<String> {
    let known = routed_tool_actions();
    let schema_enum = schema.and_then(|s| s.action_enum());
    let table = known.get(tool_name);

    if schema_enum.is_none() && table.is_none() {
        // Not a routed tool as far as we can tell.
        return None;
    }

    let action = match args.get("action").and_then(|a| a.as_str()) {
        Some(a) if !a.is_empty() => a,
        _ => {
            return Some(format!(
                "Missing required 'action' parameter for {}",
                tool_name
            ))
        }
    };

    let in_schema = schema_enum
        .as_ref()
        .map(|e| e.iter().any(|a| a == action))
        .unwrap_or(false);
    let in_table = table.map(|t| t.contains(action)).unwrap_or(false);

    if in_schema || in_table {
        None
    } else {
        Some(format!(
            "Unknown action '{}' for {}, passing through",
            action, tool_name
        ))
    }
}

/// Result of one tool dispatch.
#[derive(Debug, Clone)]
pub struct HostToolResult {
    /// Tool name.
    pub name: String,
    /// Whether the tool reported success.
    pub ok: bool,
    /// Textualised tool payload (or error description).
    pub content: String,
}

impl HostToolResult {
    /// Successful result.
    pub fn success(name: impl Into<String>, content: impl Into<String>) -> Self {
        HostToolResult {
            name: name.into(),
            ok: true,
            content: content.into(),
        }
    }

    /// Failed result.
    pub fn failure(name: impl Into<String>, content: impl Into<String>) -> Self {
        HostToolResult {
            name: name.into(),
            ok: false,
            content: content.into(),
        }
    }
}

/// External tool host the gateway dispatches non-local tools to.
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// List available tools.
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, Box<dyn std::error::Error + Send + Sync>>;

    /// Execute a tool.  Host-side failures come back as `ok=false` results;
    /// transport failures as `Err`.
    async fn call_tool(&self, name: &str, arguments: &serde_json::Value) -> HostToolResult;
}

/// HTTP tool host client.
pub struct HttpToolHost {
    base_url: String,
}

impl HttpToolHost {
    /// Create a client against `base_url` (e.g. `http://127.0.0.1:8100`).
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpToolHost {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ToolHost for HttpToolHost {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}/tools/list", self.base_url);
        let resp = get_shared_http_client()
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?;
        let data: serde_json::Value = resp.json().await?;

        let tools = data
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(tools
            .iter()
            .filter_map(|t| {
                let name = t.get("name")?.as_str()?.to_string();
                let description = t
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("")
                    .to_string();
                let parameters = t
                    .get("input_schema")
                    .or_else(|| t.get("inputSchema"))
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"}));
                Some(ToolSchema::new(name, description, parameters))
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: &serde_json::Value) -> HostToolResult {
        let url = format!("{}/tools/call", self.base_url);
        let body = serde_json::json!({"name": name, "arguments": arguments});

        let resp = match get_shared_http_client()
            .post(&url)
            .timeout(TOOL_HOST_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return HostToolResult::failure(name, format!("Tool host unreachable: {}", e));
            }
        };

        if !resp.status().is_success() {
            return HostToolResult::failure(
                name,
                format!("Tool host HTTP {}", resp.status().as_u16()),
            );
        }

        let data: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                return HostToolResult::failure(name, format!("Bad tool host response: {}", e));
            }
        };

        if let Some(error) = data.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("tool host error");
            return HostToolResult::failure(name, message.to_string());
        }

        let ok = data.get("ok").and_then(|v| v.as_bool()).unwrap_or(true);
        let content = data
            .get("content")
            .map(|c| match c.as_str() {
                Some(s) => s.to_string(),
                None => c.to_string(),
            })
            .unwrap_or_default();

        if ok {
            HostToolResult::success(name, content)
        } else {
            HostToolResult::failure(name, content)
        }
    }
}

/// Schemas for the local tools, appended to whatever the host lists.
pub fn local_tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema::new(
            "ask_user_question",
            "Ask the user a question. Pauses execution until the user responds. \
             Use for clarification, approval, or gathering input.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "The question to ask the user"
                    },
                    "options": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": {"type": "string"},
                                "description": {"type": "string"}
                            },
                            "required": ["label"]
                        },
                        "description": "Multiple choice options (optional)"
                    },
                    "input_type": {
                        "type": "string",
                        "enum": ["text", "choice", "confirm"],
                        "default": "text"
                    },
                    "reason": {
                        "type": "string",
                        "enum": [
                            "clarification",
                            "human_approval",
                            "plan_review",
                            "upload_required",
                            "error_recovery"
                        ],
                        "default": "clarification"
                    }
                },
                "required": ["question"]
            }),
        ),
        subagent::spawn_subagent_schema(),
        subagent::spawn_parallel_subagents_schema(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_tool_detection() {
        assert!(is_local_tool("ask_user_question"));
        assert!(is_local_tool("spawn_subagent"));
        assert!(!is_local_tool("fs"));
    }

    #[test]
    fn test_routed_validation_is_permissive() {
        // Known action: clean.
        let args = serde_json::json!({"action": "read", "path": "x"});
        assert!(validate_routed_action("fs", &args, None).is_none());

        // Unknown action: warning only.
        let args = serde_json::json!({"action": "transmogrify"});
        let warning = validate_routed_action("fs", &args, None).unwrap();
        assert!(warning.contains("transmogrify"));

        // Missing action on a routed tool: warning.
        let args = serde_json::json!({"path": "x"});
        assert!(validate_routed_action("fs", &args, None).is_some());

        // Unrouted tool: no opinion.
        let args = serde_json::json!({"text": "hi"});
        assert!(validate_routed_action("echo", &args, None).is_none());
    }

    #[test]
    fn test_schema_enum_participates_in_validation() {
        let schema = ToolSchema::new(
            "custom",
            "Custom routed tool",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["frob"]}
                }
            }),
        );
        let args = serde_json::json!({"action": "frob"});
        assert!(validate_routed_action("custom", &args, Some(&schema)).is_none());

        let args = serde_json::json!({"action": "twiddle"});
        assert!(validate_routed_action("custom", &args, Some(&schema)).is_some());
    }
}
