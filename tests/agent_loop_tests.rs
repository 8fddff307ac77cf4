//! End-to-end driver tests over scripted mock backends and a mock tool host.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Mutex;

use fleetgate::fleetgate::backend::{
    Backend, BackendHealth, ChatConfig, EventStream, Message, MessageContent, Role, StreamEvent,
    TokenUsage, ToolSchema,
};
use fleetgate::fleetgate::config::OperationMode;
use fleetgate::fleetgate::event::AgentEvent;
use fleetgate::fleetgate::hooks::NoopSessionHooks;
use fleetgate::fleetgate::registry::{BackendRegistry, BackendRouter};
use fleetgate::fleetgate::tool_host::{HostToolResult, ToolHost};
use fleetgate::{AgentLoop, GatewayConfig};

/// Scripted backend: each `stream_chat` call pops the next turn of events.
struct ScriptedBackend {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    native: bool,
    url: String,
}

impl ScriptedBackend {
    fn new(turns: Vec<Vec<StreamEvent>>, native: bool) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            turns: Mutex::new(turns.into()),
            native,
            url: "https://api.example.com/v1".to_string(),
        })
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_native_tools(&self) -> bool {
        self.native
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

/// Mock tool host with per-tool canned results and optional delays.
struct MockToolHost {
    delays_ms: std::collections::HashMap<String, u64>,
    results: std::collections::HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl MockToolHost {
    fn new() -> Arc<Self> {
        Arc::new(MockToolHost {
            delays_ms: std::collections::HashMap::new(),
            results: std::collections::HashMap::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn with_result(mut self: Arc<Self>, tool: &str, result: &str) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .unwrap()
            .results
            .insert(tool.to_string(), result.to_string());
        self
    }

    fn with_delay(mut self: Arc<Self>, tool: &str, delay_ms: u64) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .unwrap()
            .delays_ms
            .insert(tool.to_string(), delay_ms);
        self
    }
}

#[async_trait]
impl ToolHost for MockToolHost {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(vec![])
    }

    async fn call_tool(&self, name: &str, _arguments: &serde_json::Value) -> HostToolResult {
        if let Some(delay) = self.delays_ms.get(name) {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
        }
        self.calls.lock().await.push(name.to_string());
        match self.results.get(name) {
            Some(result) => HostToolResult::success(name, result.clone()),
            None => HostToolResult::failure(name, format!("unknown tool {}", name)),
        }
    }
}

fn make_loop(
    backend: Arc<dyn Backend>,
    host: Arc<dyn ToolHost>,
    config: GatewayConfig,
) -> AgentLoop {
    let registry = Arc::new(BackendRegistry::new(config.clone()));
    let router = Arc::new(BackendRouter::new(registry, &config));
    AgentLoop::new(
        config,
        router,
        host,
        Arc::new(NoopSessionHooks::new(true)),
    )
    .with_backend(backend)
}

async fn collect(
    agent: &mut AgentLoop,
    input: &str,
) -> Vec<AgentEvent> {
    let mut stream = agent
        .process(MessageContent::Text(input.to_string()))
        .await
        .unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_short_completion_appends_assistant_message() {
    // Scenario: healthy backend streams two deltas and a done.
    let backend = ScriptedBackend::new(
        vec![vec![
            StreamEvent::Delta {
                text: "The sum".to_string(),
            },
            StreamEvent::Delta {
                text: " is 5.".to_string(),
            },
            StreamEvent::Done {
                stop_reason: "end_turn".to_string(),
                usage: Some(TokenUsage {
                    input_tokens: 8,
                    output_tokens: 4,
                }),
            },
        ]],
        true,
    );
    let mut agent = make_loop(backend, MockToolHost::new(), GatewayConfig::default());
    agent.initialize("You are an assistant.").await;

    let events = collect(&mut agent, "sum 2+3").await;

    let deltas: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Delta { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["The sum", " is 5."]);
    match events.last().unwrap() {
        AgentEvent::Done { stop_reason, usage } => {
            assert_eq!(stop_reason, "end_turn");
            let usage = usage.as_ref().unwrap();
            assert_eq!(usage.input_tokens, 8);
            assert_eq!(usage.output_tokens, 4);
        }
        other => panic!("unexpected final event: {:?}", other),
    }

    // Final conversation tail: user then assistant with the joined text.
    let history = agent.history();
    let tail: Vec<(&Role, String)> = history
        .iter()
        .rev()
        .take(2)
        .map(|m| (&m.role, m.text()))
        .collect();
    assert_eq!(tail[0].1, "The sum is 5.");
    assert_eq!(*tail[0].0, Role::Assistant);
    assert_eq!(tail[1].1, "sum 2+3");
    assert_eq!(*tail[1].0, Role::User);
}

#[tokio::test]
async fn test_tool_call_then_answer_event_order() {
    // Scenario: turn 1 requests read_file, turn 2 answers with the content.
    let backend = ScriptedBackend::new(
        vec![
            vec![
                StreamEvent::ToolCall {
                    id: "call_1".to_string(),
                    name: "read_file".to_string(),
                    arguments: serde_json::json!({"path": "/tmp/note.txt"}),
                },
                StreamEvent::Done {
                    stop_reason: "tool_use".to_string(),
                    usage: None,
                },
            ],
            vec![
                StreamEvent::Delta {
                    text: "The file says 'hello'.".to_string(),
                },
                StreamEvent::Done {
                    stop_reason: "end_turn".to_string(),
                    usage: None,
                },
            ],
        ],
        true,
    );
    let host = MockToolHost::new().with_result("read_file", "hello");
    let mut agent = make_loop(backend, host, GatewayConfig::default());
    agent.initialize("assistant").await;

    let events = collect(&mut agent, "what's in /tmp/note.txt").await;

    let shapes: Vec<&'static str> = events
        .iter()
        .map(|e| match e {
            AgentEvent::ToolStart { .. } => "tool_start",
            AgentEvent::ToolEnd { .. } => "tool_end",
            AgentEvent::Delta { .. } => "delta",
            AgentEvent::Done { .. } => "done",
            _ => "other",
        })
        .collect();
    assert_eq!(shapes, vec!["tool_start", "tool_end", "delta", "done"]);

    match &events[1] {
        AgentEvent::ToolEnd { name, ok, result, .. } => {
            assert_eq!(name, "read_file");
            assert!(*ok);
            assert_eq!(result, "hello");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(
        agent.history().last().unwrap().text(),
        "The file says 'hello'."
    );
}

#[tokio::test]
async fn test_parallel_dispatch_preserves_list_order() {
    // Scenario: two auto-approved external calls; alpha finishes after beta
    // in real time but its end event still comes first.
    let backend = ScriptedBackend::new(
        vec![
            vec![
                StreamEvent::ToolCall {
                    id: "call_a".to_string(),
                    name: "alpha".to_string(),
                    arguments: serde_json::json!({}),
                },
                StreamEvent::ToolCall {
                    id: "call_b".to_string(),
                    name: "beta".to_string(),
                    arguments: serde_json::json!({}),
                },
                StreamEvent::Done {
                    stop_reason: "tool_use".to_string(),
                    usage: None,
                },
            ],
            vec![StreamEvent::Done {
                stop_reason: "end_turn".to_string(),
                usage: None,
            }],
        ],
        true,
    );
    let host = MockToolHost::new()
        .with_result("alpha", "A")
        .with_result("beta", "B")
        .with_delay("alpha", 80)
        .with_delay("beta", 5);
    let mut agent = make_loop(backend, host, GatewayConfig::default());
    agent.initialize("assistant").await;
    agent.permissions().lock().await.grant_all();

    let events = collect(&mut agent, "go").await;

    let ordered: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolStart { name, .. } => Some(format!("start:{}", name)),
            AgentEvent::ToolEnd { name, .. } => Some(format!("end:{}", name)),
            _ => None,
        })
        .collect();
    assert_eq!(
        ordered,
        vec!["start:alpha", "start:beta", "end:alpha", "end:beta"]
    );
}

#[tokio::test]
async fn test_tool_limit_terminates_outer_loop() {
    let make_turn = || {
        vec![
            StreamEvent::ToolCall {
                id: "c1".to_string(),
                name: "echo".to_string(),
                arguments: serde_json::json!({}),
            },
            StreamEvent::Done {
                stop_reason: "tool_use".to_string(),
                usage: None,
            },
        ]
    };
    let backend = ScriptedBackend::new(vec![make_turn(), make_turn(), make_turn()], true);
    let host = MockToolHost::new().with_result("echo", "ok");
    let mut config = GatewayConfig::default();
    config.max_tool_calls = 2;
    let mut agent = make_loop(backend, host, config);
    agent.initialize("assistant").await;

    let events = collect(&mut agent, "loop forever").await;

    let error = events.iter().find_map(|e| match e {
        AgentEvent::Error { code, .. } => Some(code.clone()),
        _ => None,
    });
    assert_eq!(error.as_deref(), Some("tool_limit"));
    match events.last().unwrap() {
        AgentEvent::Done { stop_reason, .. } => assert_eq!(stop_reason, "tool_limit"),
        other => panic!("unexpected final event: {:?}", other),
    }
}

#[tokio::test]
async fn test_zero_cap_means_unlimited() {
    let mut turns = Vec::new();
    for _ in 0..4 {
        turns.push(vec![
            StreamEvent::ToolCall {
                id: "c".to_string(),
                name: "echo".to_string(),
                arguments: serde_json::json!({}),
            },
            StreamEvent::Done {
                stop_reason: "tool_use".to_string(),
                usage: None,
            },
        ]);
    }
    turns.push(vec![StreamEvent::Done {
        stop_reason: "end_turn".to_string(),
        usage: None,
    }]);
    let backend = ScriptedBackend::new(turns, true);
    let host = MockToolHost::new().with_result("echo", "ok");
    let mut config = GatewayConfig::default();
    config.max_tool_calls = 0;
    let mut agent = make_loop(backend, host, config);
    agent.initialize("assistant").await;

    let events = collect(&mut agent, "go").await;
    assert!(events
        .iter()
        .all(|e| !matches!(e, AgentEvent::Error { .. })));
    let ends = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::ToolEnd { .. }))
        .count();
    assert_eq!(ends, 4);
}

#[tokio::test]
async fn test_textual_backend_extracts_tagged_calls() {
    let backend = ScriptedBackend::new(
        vec![
            vec![
                StreamEvent::Delta {
                    text: "Checking. <tool_call><name>echo</name><arguments>{\"x\":1}</arguments></tool_call>"
                        .to_string(),
                },
                StreamEvent::Done {
                    stop_reason: "end_turn".to_string(),
                    usage: None,
                },
            ],
            vec![
                StreamEvent::Delta {
                    text: "Done.".to_string(),
                },
                StreamEvent::Done {
                    stop_reason: "end_turn".to_string(),
                    usage: None,
                },
            ],
        ],
        false,
    );
    let host = MockToolHost::new().with_result("echo", "echoed");
    let mut agent = make_loop(backend, host, GatewayConfig::default());
    agent.initialize("assistant").await;

    let events = collect(&mut agent, "go").await;
    let end = events.iter().find_map(|e| match e {
        AgentEvent::ToolEnd { name, result, .. } => Some((name.clone(), result.clone())),
        _ => None,
    });
    assert_eq!(end, Some(("echo".to_string(), "echoed".to_string())));
}

#[tokio::test]
async fn test_read_mode_blocks_write_actions() {
    let backend = ScriptedBackend::new(
        vec![
            vec![
                StreamEvent::ToolCall {
                    id: "c1".to_string(),
                    name: "fs".to_string(),
                    arguments: serde_json::json!({"action": "write", "path": "src/lib.rs"}),
                },
                StreamEvent::Done {
                    stop_reason: "tool_use".to_string(),
                    usage: None,
                },
            ],
            vec![StreamEvent::Done {
                stop_reason: "end_turn".to_string(),
                usage: None,
            }],
        ],
        true,
    );
    let host = MockToolHost::new().with_result("fs", "should never run");
    let mut config = GatewayConfig::default();
    config.operation_mode = OperationMode::Read;
    let mut agent = make_loop(backend, host, config);
    agent.initialize("assistant").await;

    let events = collect(&mut agent, "write something").await;

    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolBlocked { .. })));
    let end = events.iter().find_map(|e| match e {
        AgentEvent::ToolEnd { ok, result, .. } => Some((*ok, result.clone())),
        _ => None,
    });
    let (ok, result) = end.unwrap();
    assert!(!ok);
    assert!(result.contains("READ mode"));
}

#[tokio::test]
async fn test_plan_mode_records_planned_action() {
    let backend = ScriptedBackend::new(
        vec![
            vec![
                StreamEvent::ToolCall {
                    id: "c1".to_string(),
                    name: "fs".to_string(),
                    arguments: serde_json::json!({"action": "write", "path": "src/lib.rs"}),
                },
                StreamEvent::Done {
                    stop_reason: "tool_use".to_string(),
                    usage: None,
                },
            ],
            vec![StreamEvent::Done {
                stop_reason: "end_turn".to_string(),
                usage: None,
            }],
        ],
        true,
    );
    let host = MockToolHost::new().with_result("fs", "should never run");
    let mut config = GatewayConfig::default();
    config.operation_mode = OperationMode::Plan;
    let mut agent = make_loop(backend, host, config);
    agent.initialize("assistant").await;

    let events = collect(&mut agent, "write something").await;

    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolPlanned { .. })));
    let end = events.iter().find_map(|e| match e {
        AgentEvent::ToolEnd { ok, result, .. } => Some((*ok, result.clone())),
        _ => None,
    });
    let (ok, result) = end.unwrap();
    assert!(ok);
    assert!(result.starts_with("[PLANNED] Would execute: fs("));
}

#[tokio::test]
async fn test_stream_error_terminates_request() {
    let backend = ScriptedBackend::new(
        vec![vec![
            StreamEvent::Delta {
                text: "partial".to_string(),
            },
            StreamEvent::Error {
                message: "connection reset".to_string(),
                code: "connection_error".to_string(),
            },
        ]],
        true,
    );
    let mut agent = make_loop(backend, MockToolHost::new(), GatewayConfig::default());
    agent.initialize("assistant").await;

    let events = collect(&mut agent, "hi").await;
    match events.last().unwrap() {
        AgentEvent::Error { code, .. } => assert_eq!(code, "connection_error"),
        other => panic!("unexpected final event: {:?}", other),
    }
}
