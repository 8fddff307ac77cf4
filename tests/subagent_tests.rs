//! Subagent loop tests: respond termination, tool filtering, turn budgets.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use fleetgate::fleetgate::backend::{
    Backend, BackendHealth, ChatConfig, EventStream, Message, StreamEvent, ToolSchema,
};
use fleetgate::fleetgate::subagent::{
    spawn_parallel_subagents, SubAgent, SubagentSpec,
};
use fleetgate::fleetgate::tool_host::{HostToolResult, ToolHost};

struct ScriptedBackend {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    url: String,
}

impl ScriptedBackend {
    fn new(turns: Vec<Vec<StreamEvent>>, url: &str) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            turns: Mutex::new(turns.into()),
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_native_tools(&self) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn base_url(&self) -> &str {
        &self.url
    }

    fn stream_chat(&self, _messages: Vec<Message>, _config: ChatConfig) -> EventStream {
        let turn = self
            .turns
            .try_lock()
            .ok()
            .and_then(|mut t| t.pop_front())
            .unwrap_or_else(|| {
                vec![StreamEvent::Done {
                    stop_reason: "end_turn".to_string(),
                    usage: None,
                }]
            });
        Box::pin(futures_util::stream::iter(turn))
    }

    async fn health_check(&self) -> BackendHealth {
        BackendHealth::healthy("scripted")
    }
}

struct RecordingHost {
    calls: Mutex<Vec<String>>,
}

impl RecordingHost {
    fn new() -> Arc<Self> {
        Arc::new(RecordingHost {
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ToolHost for RecordingHost {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(vec![
            ToolSchema::new("fs", "File ops", serde_json::json!({"type": "object"})),
            ToolSchema::new("term", "Terminal", serde_json::json!({"type": "object"})),
        ])
    }

    async fn call_tool(&self, name: &str, arguments: &serde_json::Value) -> HostToolResult {
        self.calls.lock().await.push(format!(
            "{}:{}",
            name,
            arguments.get("action").and_then(|a| a.as_str()).unwrap_or("-")
        ));
        HostToolResult::success(name, "contents")
    }
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args,
    }
}

fn done() -> StreamEvent {
    StreamEvent::Done {
        stop_reason: "tool_use".to_string(),
        usage: None,
    }
}

#[tokio::test]
async fn test_explorer_terminates_via_respond() {
    let backend = ScriptedBackend::new(
        vec![
            vec![
                tool_call("c1", "fs", serde_json::json!({"action": "read", "path": "x"})),
                done(),
            ],
            vec![
                tool_call("c2", "respond", serde_json::json!({"summary": "found the thing"})),
                done(),
            ],
        ],
        "https://api.example.com",
    );
    let host = RecordingHost::new();

    let subagent = SubAgent::new(
        backend,
        host.clone(),
        "explorer",
        "find the thing",
        "",
    )
    .unwrap();
    let result = subagent.run().await;

    assert!(result.ok);
    assert_eq!(result.content, "found the thing");
    assert_eq!(result.turns_used, 2);
    assert!(result.tools_called.contains(&"fs".to_string()));
    assert_eq!(host.calls.lock().await.as_slice(), ["fs:read"]);
}

#[tokio::test]
async fn test_disallowed_tool_is_refused_locally() {
    // Explorer may not touch the terminal; the host must never see the call.
    let backend = ScriptedBackend::new(
        vec![
            vec![
                tool_call("c1", "term", serde_json::json!({"action": "send_line", "text": "rm"})),
                done(),
            ],
            vec![
                tool_call("c2", "respond", serde_json::json!({"summary": "gave up"})),
                done(),
            ],
        ],
        "https://api.example.com",
    );
    let host = RecordingHost::new();

    let subagent =
        SubAgent::new(backend, host.clone(), "explorer", "poke around", "").unwrap();
    let result = subagent.run().await;

    assert!(result.ok);
    assert!(host.calls.lock().await.is_empty());
}

#[tokio::test]
async fn test_unknown_type_is_rejected() {
    let backend = ScriptedBackend::new(vec![], "https://api.example.com");
    let err = SubAgent::new(backend, RecordingHost::new(), "architect", "t", "")
        .err()
        .unwrap();
    assert!(err.contains("Unknown subagent type"));
}

#[tokio::test]
async fn test_parallel_spawn_caps_at_five_and_runs_sequentially_for_local() {
    // Seven specs: only five run.  Local URL forces sequential execution with
    // progress callbacks.
    let mut turns = Vec::new();
    for i in 0..5 {
        turns.push(vec![
            tool_call(
                "c",
                "respond",
                serde_json::json!({"summary": format!("done {}", i)}),
            ),
            done(),
        ]);
    }
    let backend = ScriptedBackend::new(turns, "http://127.0.0.1:1234/v1");
    let host = RecordingHost::new();

    let specs: Vec<SubagentSpec> = (0..7)
        .map(|i| SubagentSpec {
            subagent_type: "explorer".to_string(),
            task: format!("task {}", i),
            context: String::new(),
        })
        .collect();

    let mut progress: Vec<(usize, String)> = Vec::new();
    let result = spawn_parallel_subagents(backend, host, specs, "shared", |index, total, _, status| {
        assert_eq!(total, 5);
        progress.push((index, status.to_string()));
    })
    .await;

    assert!(result.ok);
    assert_eq!(result.results.len(), 5);
    assert_eq!(result.failed_count, 0);
    // Sequential: running/finished pairs in order.
    assert_eq!(progress.len(), 10);
    assert_eq!(progress[0], (0, "running".to_string()));
    assert_eq!(progress[1], (0, "finished".to_string()));
    assert!(result.content().contains("## [OK] EXPLORER"));
}
