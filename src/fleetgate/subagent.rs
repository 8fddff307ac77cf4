//! Restricted subagents spawned by the outer tool loop.
//!
//! Two types are defined: `explorer` (read + search) and `planner` (read +
//! search with a prompt that emphasises planning).  A subagent runs its own
//! inner tool loop with a filtered tool schema, a turn budget, and an
//! operation-mode override; it terminates either by calling the
//! distinguished `respond(summary)` tool (success) or by reaching the turn
//! budget (partial result).
//!
//! Parallel spawning accepts at most five specs.  When the backend looks
//! local (loopback or LAN URL), subagents run sequentially with progress
//! callbacks — local servers process requests one at a time anyway.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;

use crate::fleetgate::agent_loop::{parse_tagged_tool_calls, render_tools_prompt};
use crate::fleetgate::backend::{Backend, ChatConfig, Message, StreamEvent, ToolSchema};
use crate::fleetgate::tool_host::{HostToolResult, ToolHost};

/// One subagent type definition.
#[derive(Debug, Clone)]
pub struct SubagentTypeConfig {
    /// What the type is for.
    pub description: &'static str,
    /// Allowed tools as `"tool:action,action"` (empty action list = all).
    pub tools: &'static [&'static str],
    /// Operation-mode override.
    pub mode: &'static str,
    /// Maximum turns before a partial result is returned.
    pub max_turns: usize,
}

/// The closed set of subagent types.
pub fn subagent_types() -> HashMap<&'static str, SubagentTypeConfig> {
    let mut m = HashMap::new();
    m.insert(
        "explorer",
        SubagentTypeConfig {
            description: "Fast codebase exploration and file discovery",
            tools: &["fs:read,list", "search:query", "repo:get"],
            mode: "read",
            max_turns: 15,
        },
    );
    m.insert(
        "planner",
        SubagentTypeConfig {
            description: "Design implementation plans without executing",
            tools: &["fs:read", "search:query", "repo:get"],
            mode: "plan",
            max_turns: 20,
        },
    );
    m
}

/// Schema for the distinguished `respond` tool subagents use to finish.
pub fn respond_tool_schema() -> ToolSchema {
    ToolSchema::new(
        "respond",
        "Return your final response to the parent agent. Call this tool when you \
         have completed your task and are ready to report your findings.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "Your complete findings/summary to return to the parent agent"
                }
            },
            "required": ["summary"]
        }),
    )
}

/// Schema for the `spawn_subagent` local tool.
pub fn spawn_subagent_schema() -> ToolSchema {
    let types: Vec<&str> = {
        let mut t: Vec<&str> = subagent_types().keys().copied().collect();
        t.sort_unstable();
        t
    };
    ToolSchema::new(
        "spawn_subagent",
        "Spawn a restricted subagent to handle a delegated task. The subagent runs \
         with limited tools and returns a summary.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "subagent_type": {"type": "string", "enum": types},
                "task": {"type": "string", "description": "Task for the subagent"},
                "context": {"type": "string", "description": "Extra context (optional)"}
            },
            "required": ["subagent_type", "task"]
        }),
    )
}

/// Schema for the `spawn_parallel_subagents` local tool.
pub fn spawn_parallel_subagents_schema() -> ToolSchema {
    let types: Vec<&str> = {
        let mut t: Vec<&str> = subagent_types().keys().copied().collect();
        t.sort_unstable();
        t
    };
    ToolSchema::new(
        "spawn_parallel_subagents",
        "Spawn up to 5 subagents working on independent tasks. Runs them in \
         parallel on cloud backends, sequentially on local ones.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "subagents": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "subagent_type": {"type": "string", "enum": types},
                            "task": {"type": "string"},
                            "context": {"type": "string"}
                        },
                        "required": ["subagent_type", "task"]
                    }
                },
                "shared_context": {"type": "string"}
            },
            "required": ["subagents"]
        }),
    )
}

/// Result from one subagent run.
#[derive(Debug, Clone)]
pub struct SubagentResult {
    /// Whether the subagent finished via `respond`.
    pub ok: bool,
    /// Final summary (or partial accumulated text).
    pub content: String,
    /// Turns consumed.
    pub turns_used: usize,
    /// Tools called, in order.
    pub tools_called: Vec<String>,
    /// Subagent type, for parallel result identification.
    pub subagent_type: String,
    /// Task, for parallel result identification.
    pub task: String,
}

/// Aggregated result from a parallel batch.
#[derive(Debug, Clone)]
pub struct ParallelSubagentResult {
    /// Whether every subagent succeeded.
    pub ok: bool,
    /// Per-subagent results, in spec order.
    pub results: Vec<SubagentResult>,
    /// Total turns across the batch.
    pub total_turns: usize,
    /// Number of failed subagents.
    pub failed_count: usize,
}

impl ParallelSubagentResult {
    /// Combine all results into one formatted string.
    pub fn content(&self) -> String {
        self.results
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let status = if r.ok { "OK" } else { "FAILED" };
                let label = if r.subagent_type.is_empty() {
                    format!("#{}", i + 1)
                } else {
                    r.subagent_type.to_uppercase()
                };
                format!("## [{}] {}\n{}", status, label, r.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Lightweight agent for handling delegated tasks.
pub struct SubAgent {
    backend: Arc<dyn Backend>,
    tool_host: Arc<dyn ToolHost>,
    subagent_type: String,
    task: String,
    context: String,
    max_turns: usize,
    /// tool name -> allowed actions (empty set = any action).
    allowed_tools: HashMap<String, HashSet<String>>,
    tools_called: Vec<String>,
}

impl SubAgent {
    /// Create a subagent of `subagent_type`; fails for unknown types.
    pub fn new(
        backend: Arc<dyn Backend>,
        tool_host: Arc<dyn ToolHost>,
        subagent_type: &str,
        task: impl Into<String>,
        context: impl Into<String>,
    ) -> Result<Self, String> {
        let types = subagent_types();
        let config = types.get(subagent_type).ok_or_else(|| {
            let mut names: Vec<&str> = types.keys().copied().collect();
            names.sort_unstable();
            format!(
                "Unknown subagent type: {}. Valid: {}",
                subagent_type,
                names.join(", ")
            )
        })?;

        Ok(SubAgent {
            backend,
            tool_host,
            subagent_type: subagent_type.to_string(),
            task: task.into(),
            context: context.into(),
            max_turns: config.max_turns,
            allowed_tools: parse_tool_permissions(config.tools),
            tools_called: Vec::new(),
        })
    }

    fn can_use_tool(&self, name: &str, action: Option<&str>) -> bool {
        match self.allowed_tools.get(name) {
            Some(actions) if actions.is_empty() => true,
            Some(actions) => action.map(|a| actions.contains(a)).unwrap_or(false),
            None => false,
        }
    }

    fn build_system_prompt(&self, tools: &[ToolSchema]) -> String {
        let role = match self.subagent_type.as_str() {
            "planner" => {
                "You are a planning subagent. Design a concrete implementation plan \
                 for the task below. Read and search, but do not execute changes; \
                 describe the steps another agent should take."
            }
            _ => {
                "You are an exploration subagent. Investigate the codebase to answer \
                 the task below. Be fast and factual."
            }
        };

        let mut prompt = format!("{}\n\nTask: {}\n", role, self.task);
        if !self.context.is_empty() {
            prompt.push_str(&format!("\nContext:\n{}\n", self.context));
        }
        if !self.backend.supports_native_tools() {
            prompt.push_str(&render_tools_prompt(tools));
        }
        prompt.push_str(
            "\nWhen you are finished, call the respond tool with your complete summary.",
        );
        prompt
    }

    fn filtered_tool_schemas(&self, host_tools: Vec<ToolSchema>) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = host_tools
            .into_iter()
            .filter(|t| self.allowed_tools.contains_key(&t.name))
            .collect();
        // The respond tool is always available so the subagent can finish.
        schemas.push(respond_tool_schema());
        schemas
    }

    /// Run the restricted loop to completion or turn exhaustion.
    pub async fn run(mut self) -> SubagentResult {
        let host_tools = self.tool_host.list_tools().await.unwrap_or_default();
        let tools = self.filtered_tool_schemas(host_tools);
        let system_prompt = self.build_system_prompt(&tools);

        let mut messages = vec![Message::system(system_prompt), Message::user(self.task.clone())];
        let mut last_text = String::new();
        let mut turns = 0;

        while turns < self.max_turns {
            turns += 1;

            let config = ChatConfig {
                tools: if self.backend.supports_native_tools() {
                    tools.clone()
                } else {
                    Vec::new()
                },
                ..ChatConfig::default()
            };

            let mut stream = self.backend.stream_chat(messages.clone(), config);
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            let mut failed = false;

            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Delta { text: t } => text.push_str(&t),
                    StreamEvent::ToolCall { id, name, arguments } => {
                        tool_calls.push((id, name, arguments));
                    }
                    StreamEvent::Error { message, .. } => {
                        last_text = format!("Subagent backend error: {}", message);
                        failed = true;
                        break;
                    }
                    _ => {}
                }
            }
            if failed {
                break;
            }

            if !self.backend.supports_native_tools() {
                for call in parse_tagged_tool_calls(&text) {
                    tool_calls.push((call.id, call.name, call.arguments));
                }
            }

            if tool_calls.is_empty() {
                last_text = text;
                break;
            }

            messages.push(Message::assistant(text.clone()));
            last_text = text;

            for (id, name, arguments) in tool_calls {
                if name == "respond" {
                    self.tools_called.push("respond".to_string());
                    let summary = arguments
                        .get("summary")
                        .and_then(|s| s.as_str())
                        .unwrap_or("")
                        .to_string();
                    if log::log_enabled!(log::Level::Info) {
                        log::info!(
                            "Subagent {} called respond() after {} turns",
                            self.subagent_type,
                            turns
                        );
                    }
                    return SubagentResult {
                        ok: true,
                        content: summary,
                        turns_used: turns,
                        tools_called: self.tools_called,
                        subagent_type: self.subagent_type,
                        task: self.task,
                    };
                }

                let action = arguments.get("action").and_then(|a| a.as_str());
                let result = if self.can_use_tool(&name, action) {
                    self.tools_called.push(name.clone());
                    self.tool_host.call_tool(&name, &arguments).await
                } else {
                    HostToolResult::failure(
                        name.clone(),
                        format!("Tool {} not allowed for {} subagent", name, self.subagent_type),
                    )
                };

                messages.push(Message::tool_result(id, name, result.content));
            }
        }

        SubagentResult {
            ok: false,
            content: if last_text.is_empty() {
                format!("Turn budget exhausted after {} turns", turns)
            } else {
                last_text
            },
            turns_used: turns,
            tools_called: self.tools_called,
            subagent_type: self.subagent_type,
            task: self.task,
        }
    }
}

fn parse_tool_permissions(specs: &[&str]) -> HashMap<String, HashSet<String>> {
    let mut allowed = HashMap::new();
    for spec in specs {
        let mut parts = spec.splitn(2, ':');
        let tool = parts.next().unwrap_or("").to_string();
        if tool.is_empty() {
            continue;
        }
        let actions: HashSet<String> = parts
            .next()
            .map(|a| {
                a.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        allowed.insert(tool, actions);
    }
    allowed
}

/// Whether the backend URL points at a local deployment (loopback, LAN, or a
/// well-known local inference port).
pub fn is_local_llm(url: &str) -> bool {
    let url_lower = url.to_ascii_lowercase();
    ["localhost", "127.0.0.1", "0.0.0.0", "192.168.", "10.0.", ":1234", ":11434"]
        .iter()
        .any(|p| url_lower.contains(p))
}

/// One entry in a parallel spawn request.
#[derive(Debug, Clone)]
pub struct SubagentSpec {
    /// Subagent type.
    pub subagent_type: String,
    /// Task text.
    pub task: String,
    /// Per-subagent context.
    pub context: String,
}

/// Spawn multiple subagents: parallel for cloud backends, sequential with
/// progress callbacks for local ones.  Specs beyond five are dropped.
pub async fn spawn_parallel_subagents<F>(
    backend: Arc<dyn Backend>,
    tool_host: Arc<dyn ToolHost>,
    specs: Vec<SubagentSpec>,
    shared_context: &str,
    mut on_progress: F,
) -> ParallelSubagentResult
where
    F: FnMut(usize, usize, &str, &str),
{
    if specs.is_empty() {
        return ParallelSubagentResult {
            ok: false,
            results: Vec::new(),
            total_turns: 0,
            failed_count: 0,
        };
    }

    let specs: Vec<SubagentSpec> = specs.into_iter().take(5).collect();
    let total = specs.len();
    let is_local = is_local_llm(backend.base_url());

    let run_one = |spec: SubagentSpec| {
        let backend = Arc::clone(&backend);
        let tool_host = Arc::clone(&tool_host);
        let shared = shared_context.to_string();
        async move {
            let context = if shared.is_empty() {
                spec.context.clone()
            } else if spec.context.is_empty() {
                shared
            } else {
                format!("{}\n\n{}", shared, spec.context)
            };
            match SubAgent::new(backend, tool_host, &spec.subagent_type, spec.task.clone(), context)
            {
                Ok(agent) => agent.run().await,
                Err(e) => SubagentResult {
                    ok: false,
                    content: e,
                    turns_used: 0,
                    tools_called: Vec::new(),
                    subagent_type: spec.subagent_type,
                    task: spec.task,
                },
            }
        }
    };

    let results: Vec<SubagentResult> = if is_local {
        // Local servers serve one request at a time; run sequentially and
        // surface progress.
        let mut results = Vec::with_capacity(total);
        for (index, spec) in specs.into_iter().enumerate() {
            let subagent_type = spec.subagent_type.clone();
            on_progress(index, total, &subagent_type, "running");
            let result = run_one(spec).await;
            on_progress(index, total, &subagent_type, "finished");
            results.push(result);
        }
        results
    } else {
        futures_util::future::join_all(specs.into_iter().map(run_one)).await
    };

    let failed_count = results.iter().filter(|r| !r.ok).count();
    let total_turns = results.iter().map(|r| r.turns_used).sum();

    ParallelSubagentResult {
        ok: failed_count == 0,
        results,
        total_turns,
        failed_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_llm_heuristic() {
        assert!(is_local_llm("http://127.0.0.1:1234/v1"));
        assert!(is_local_llm("http://localhost:8317/v1"));
        assert!(is_local_llm("http://192.168.1.20:8080/v1"));
        assert!(is_local_llm("http://gpu-box:11434"));
        assert!(!is_local_llm("https://api.anthropic.com"));
    }

    #[test]
    fn test_tool_permission_parsing() {
        let allowed = parse_tool_permissions(&["fs:read,list", "search:query"]);
        assert!(allowed["fs"].contains("read"));
        assert!(allowed["fs"].contains("list"));
        assert!(!allowed["fs"].contains("write"));
        assert!(allowed["search"].contains("query"));
    }

    #[test]
    fn test_subagent_type_validation() {
        let types = subagent_types();
        assert!(types.contains_key("explorer"));
        assert!(types.contains_key("planner"));
        assert_eq!(types["explorer"].mode, "read");
        assert_eq!(types["planner"].max_turns, 20);
    }

    #[test]
    fn test_parallel_result_formatting() {
        let result = ParallelSubagentResult {
            ok: false,
            results: vec![
                SubagentResult {
                    ok: true,
                    content: "found it".to_string(),
                    turns_used: 2,
                    tools_called: vec![],
                    subagent_type: "explorer".to_string(),
                    task: "t".to_string(),
                },
                SubagentResult {
                    ok: false,
                    content: "budget gone".to_string(),
                    turns_used: 15,
                    tools_called: vec![],
                    subagent_type: "planner".to_string(),
                    task: "t".to_string(),
                },
            ],
            total_turns: 17,
            failed_count: 1,
        };
        let content = result.content();
        assert!(content.contains("## [OK] EXPLORER"));
        assert!(content.contains("## [FAILED] PLANNER"));
    }
}
