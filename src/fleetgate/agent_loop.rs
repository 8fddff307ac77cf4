//! The per-request tool loop driver.
//!
//! [`AgentLoop`] owns one conversation and drives the multi-turn interaction:
//! pick a healthy backend, stream model events, accumulate tool calls
//! (native or extracted from tagged text), gate and dispatch each call, feed
//! results back, and repeat until the model stops calling tools.
//!
//! Per-call gate sequence: cancellation → permission gate → operation-mode
//! gate → routed-action validation (permissive) → role gate → pre-tool hook
//! (fail-closed) → dispatch (local or external) → post-tool hook (non-fatal).
//!
//! Tool calls emitted in one model turn are dispatched in parallel iff all of
//! them are external, auto-approved, and allowed by the operation mode; their
//! `ToolEnd` events are re-ordered into tool-call list order before emission.
//!
//! Textual (non-native) backends receive the tool schemas inlined into the
//! system prompt and invoke tools with a fenced tag block:
//!
//! ```text
//! <tool_call><name>fs</name><arguments>{"action":"read","path":"x"}</arguments></tool_call>
//! ```
//!
//! Arguments that fail to parse as JSON are wrapped as `{"raw": "<text>"}`
//! and dispatched anyway.

use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::fleetgate::backend::{
    Backend, ChatConfig, ContentBlock, ImageSource, Message, MessageContent, Role, StreamEvent,
    ToolCallRequest, ToolSchema,
};
use crate::fleetgate::config::{GatewayConfig, OperationMode};
use crate::fleetgate::error::GatewayError;
use crate::fleetgate::event::{preview, AgentEvent};
use crate::fleetgate::hooks::SessionHooks;
use crate::fleetgate::interrupt::{
    InputType, InterruptHandler, InterruptOption, InterruptReason, InterruptRequest,
};
use crate::fleetgate::permissions::{ApprovalDecision, PermissionManager};
use crate::fleetgate::registry::BackendRouter;
use crate::fleetgate::subagent::{spawn_parallel_subagents, SubAgent, SubagentSpec};
use crate::fleetgate::tool_host::{
    is_local_tool, validate_routed_action, HostToolResult, ToolHost,
};

const COMPACTION_PROMPT: &str = "Summarize the following conversation history concisely.\n\
Focus on:\n\
- Key decisions made\n\
- Important findings or code changes\n\
- Current task state and blockers\n\
- Any context the assistant needs to continue\n\n\
Keep under 500 words. Use bullet points.\n\n\
CONVERSATION:\n{conversation}\n\nSUMMARY:";

lazy_static! {
    static ref TAGGED_TOOL_CALL: Regex = Regex::new(
        r"(?s)<tool_call>\s*<name>([^<]+)</name>\s*<arguments>(.*?)</arguments>\s*</tool_call>"
    )
    .expect("tool call regex");
}

/// A tool call extracted from model output text.
#[derive(Debug, Clone)]
pub struct ParsedToolCall {
    /// Synthesised call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed arguments (or `{"raw": …}` on parse failure).
    pub arguments: serde_json::Value,
}

/// Extract fenced `<tool_call>` blocks from accumulated text.
pub fn parse_tagged_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    TAGGED_TOOL_CALL
        .captures_iter(text)
        .map(|caps| {
            let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("").to_string();
            let args_str = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            let arguments = if args_str.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(args_str)
                    .unwrap_or_else(|_| serde_json::json!({ "raw": args_str }))
            };
            ParsedToolCall {
                id: format!("tag_{}", &Uuid::new_v4().simple().to_string()[..8]),
                name,
                arguments,
            }
        })
        .filter(|c| !c.name.is_empty())
        .collect()
}

/// Render tool schemas into a system-prompt section for text-only backends.
pub fn render_tools_prompt(tools: &[ToolSchema]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nYou have access to the following tools:\n");
    for tool in tools {
        out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        if let Ok(schema) = serde_json::to_string(&tool.parameters) {
            out.push_str(&format!("  Parameters (JSON Schema): {}\n", schema));
        }
    }
    out.push_str(
        "\nTo use a tool, emit exactly one block per call:\n\
         <tool_call><name>TOOL_NAME</name><arguments>{\"key\": \"value\"}</arguments></tool_call>\n\
         The arguments must be a JSON object. After execution you will receive\n\
         the result and can continue.\n",
    );
    out
}

/// External callback deciding dangerous / unapproved tool calls.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide one tool call.
    async fn request_approval(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        tool_id: &str,
    ) -> ApprovalDecision;
}

// A fully resolved call waiting on dispatch.
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    arguments: serde_json::Value,
}

/// Boxed event stream returned by [`AgentLoop::process`].
pub type AgentEventStream<'a> = Pin<Box<dyn Stream<Item = AgentEvent> + Send + 'a>>;

/// Drives one conversation against the backend fleet.
pub struct AgentLoop {
    config: GatewayConfig,
    router: Arc<BackendRouter>,
    tool_host: Arc<dyn ToolHost>,
    hooks: Arc<dyn SessionHooks>,
    permissions: Arc<tokio::sync::Mutex<PermissionManager>>,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    interrupt_handler: Option<Arc<dyn InterruptHandler>>,

    messages: Vec<Message>,
    system_prompt_base: String,
    system_context: Option<String>,
    tool_schemas: Vec<ToolSchema>,
    pinned_backend: Option<Arc<dyn Backend>>,

    cancelled: Arc<AtomicBool>,
    turns_since_context_refresh: usize,
    context_window: usize,

    /// Prompt tokens of the most recent model call (estimated or reported).
    pub last_prompt_tokens: usize,
    /// Completion tokens of the most recent model call.
    pub last_completion_tokens: usize,
    /// Cumulative prompt tokens this session.
    pub total_prompt_tokens: usize,
    /// Cumulative completion tokens this session.
    pub total_completion_tokens: usize,
}

impl AgentLoop {
    /// Build a driver over the router and external collaborators.
    pub fn new(
        config: GatewayConfig,
        router: Arc<BackendRouter>,
        tool_host: Arc<dyn ToolHost>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let permissions = PermissionManager::new(config.operation_mode, None);
        let context_window = config.openai_compat.context_window;
        AgentLoop {
            config,
            router,
            tool_host,
            hooks,
            permissions: Arc::new(tokio::sync::Mutex::new(permissions)),
            approval_handler: None,
            interrupt_handler: None,
            messages: Vec::new(),
            system_prompt_base: String::new(),
            system_context: None,
            tool_schemas: Vec::new(),
            pinned_backend: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            turns_since_context_refresh: 0,
            context_window,
            last_prompt_tokens: 0,
            last_completion_tokens: 0,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
        }
    }

    /// Attach the approval callback (builder pattern).
    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    /// Attach the interrupt callback (builder pattern).
    pub fn with_interrupt_handler(mut self, handler: Arc<dyn InterruptHandler>) -> Self {
        self.interrupt_handler = Some(handler);
        self
    }

    /// Share a permission manager across drivers (builder pattern).
    pub fn with_permissions(
        mut self,
        permissions: Arc<tokio::sync::Mutex<PermissionManager>>,
    ) -> Self {
        self.permissions = permissions;
        self
    }

    /// Pin a specific backend instead of routing per request.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.pinned_backend = Some(backend);
        self
    }

    /// Initialise the driver: fetch the tool catalogue and build the system
    /// prompt.
    pub async fn initialize(&mut self, system_prompt: impl Into<String>) {
        self.system_prompt_base = system_prompt.into();
        match self.tool_host.list_tools().await {
            Ok(mut tools) => {
                tools.extend(crate::fleetgate::tool_host::local_tool_schemas());
                self.tool_schemas = tools;
            }
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Tool host listing failed: {}", e);
                }
                self.tool_schemas = crate::fleetgate::tool_host::local_tool_schemas();
            }
        }
        self.rebuild_system_prompt(None);
    }

    /// Switch to a different backend by name, keeping history.
    pub async fn switch_backend(&mut self, name: &str) -> Result<(), GatewayError> {
        let registry = self.router_registry();
        let backend = registry.get(name).await?;
        self.pinned_backend = Some(backend);
        self.rebuild_system_prompt(None);
        Ok(())
    }

    fn router_registry(&self) -> Arc<crate::fleetgate::registry::BackendRegistry> {
        // The router owns the registry; drivers resolve backends through it.
        Arc::clone(self.router.registry())
    }

    /// Handle to the cooperative cancellation flag.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Request cooperative cancellation of the in-flight request.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Shared permission manager.
    pub fn permissions(&self) -> Arc<tokio::sync::Mutex<PermissionManager>> {
        Arc::clone(&self.permissions)
    }

    /// Number of messages in history.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Snapshot of the conversation history.
    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    /// Clear history, keeping the system prompt.
    pub fn clear_history(&mut self) {
        let system = match self.messages.first() {
            Some(m) if m.role == Role::System => Some(m.clone()),
            _ => None,
        };
        self.messages.clear();
        if let Some(system) = system {
            self.messages.push(system);
        }
    }

    /// Rebuild the system prompt, optionally with refreshed external context.
    pub fn rebuild_system_prompt(&mut self, context_override: Option<&str>) {
        if let Some(context) = context_override {
            self.system_context = Some(context.to_string());
        }
        let native = self
            .pinned_backend
            .as_ref()
            .map(|b| b.supports_native_tools())
            .unwrap_or(false);
        self.apply_system_prompt(native);
    }

    // Render base prompt + session context, inlining the tool catalogue for
    // text-only backends, and replace the system message in place.
    fn apply_system_prompt(&mut self, native: bool) {
        let mut prompt = self.system_prompt_base.clone();
        if let Some(context) = &self.system_context {
            if !context.is_empty() {
                prompt.push_str("\n\n## Current session context\n");
                prompt.push_str(context);
            }
        }
        if !native && !self.tool_schemas.is_empty() {
            prompt.push_str(&render_tools_prompt(&self.tool_schemas));
        }

        let system = Message::system(prompt);
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => *first = system,
            _ => self.messages.insert(0, system),
        }
    }

    // ---- token estimation (≈4 chars per token) ----

    fn estimate_tokens(text: &str) -> usize {
        if text.is_empty() {
            0
        } else {
            text.len() / 4
        }
    }

    fn estimate_message_tokens(messages: &[Message]) -> usize {
        let mut total = 0;
        for msg in messages {
            // Role and formatting overhead.
            total += 4;
            total += Self::estimate_tokens(&msg.text());
            for tc in &msg.tool_calls {
                total += Self::estimate_tokens(&tc.name);
                total += Self::estimate_tokens(&tc.arguments.to_string());
            }
        }
        total
    }

    fn should_auto_compact(&self) -> bool {
        if self.config.stateless {
            return false;
        }
        let current = Self::estimate_message_tokens(&self.messages);
        let threshold =
            (self.context_window as f64 * self.config.compact_threshold.max(0.0)) as usize;
        current > threshold
    }

    fn format_messages_for_summary(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|msg| {
                let content = msg.text();
                let content: String = content.chars().take(500).collect();
                if msg.role == Role::Tool {
                    let short: String = content.chars().take(200).collect();
                    format!("[TOOL:{}] {}", msg.name.as_deref().unwrap_or("?"), short)
                } else {
                    format!("[{}] {}", msg.role.as_str().to_uppercase(), content)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Summarise older messages into one `[Previous conversation summary]`
    /// message, keeping the system prompt and the most recent messages.
    /// Returns the number of messages removed.
    async fn auto_compact_with_summary(&mut self, backend: &Arc<dyn Backend>) -> usize {
        let keep = self.config.keep_recent_messages;
        if self.messages.len() <= keep + 2 {
            return 0;
        }

        let has_system = self
            .messages
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false);
        let start = if has_system { 1 } else { 0 };
        let split_idx = self.messages.len() - keep;
        if split_idx <= start {
            return 0;
        }

        let to_summarize: Vec<Message> = self.messages[start..split_idx].to_vec();
        let conversation = Self::format_messages_for_summary(&to_summarize);
        let prompt = COMPACTION_PROMPT.replace("{conversation}", &conversation);

        let summary = {
            let mut config = ChatConfig::default();
            config.temperature = 0.3;
            config.max_tokens = Some(800);
            match backend.complete_text(vec![Message::user(prompt)], config).await {
                Ok(text) if !text.trim().is_empty() => text,
                _ => "[summary unavailable]".to_string(),
            }
        };

        let summary_msg = Message::user(format!("[Previous conversation summary]\n{}", summary));
        let tail: Vec<Message> = self.messages[split_idx..].to_vec();
        let mut rebuilt = Vec::with_capacity(tail.len() + 2);
        if has_system {
            rebuilt.push(self.messages[0].clone());
        }
        rebuilt.push(summary_msg);
        rebuilt.extend(tail);

        let removed = to_summarize.len();
        self.messages = rebuilt;
        if log::log_enabled!(log::Level::Info) {
            log::info!("Auto-compacted: summarized {} messages into summary", removed);
        }
        removed
    }

    /// Refresh the system prompt from the session collaborator.
    async fn refresh_context(&mut self, native: bool) {
        if let Some(context) = self.hooks.get_context().await {
            self.system_context = Some(context);
            self.apply_system_prompt(native);
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("System prompt context refreshed");
            }
        }
        self.turns_since_context_refresh = 0;
    }

    /// Process one user turn, yielding events until `Done`, `Error`, or
    /// `Cancelled`.
    ///
    /// Fails synchronously with [`GatewayError::NoHealthyBackend`] before any
    /// stream is started when the chain is exhausted.
    pub async fn process(
        &mut self,
        user_input: MessageContent,
    ) -> Result<AgentEventStream<'_>, GatewayError> {
        let backend = match &self.pinned_backend {
            Some(b) => Arc::clone(b),
            None => self.router.pick_healthy_backend().await?,
        };

        let native_tools = backend.supports_native_tools();

        Ok(Box::pin(async_stream::stream! {
            // Keep the system prompt aligned with the routed backend's tool
            // capability before the first send.
            self.apply_system_prompt(native_tools);

            // Context refresh cadence is counted in user turns.
            self.turns_since_context_refresh += 1;
            if self.turns_since_context_refresh >= self.config.context_refresh_interval.max(1) {
                self.refresh_context(native_tools).await;
            }

            if self.should_auto_compact() {
                let removed = self.auto_compact_with_summary(&backend).await;
                if removed > 0 {
                    yield AgentEvent::Info {
                        message: format!("Auto-compacted: summarized {} older messages", removed),
                    };
                }
            }

            // Stateless mode: reset to system prompt + this user message.
            if self.config.stateless && self.messages.len() > 1 {
                self.clear_history();
            }

            // Store a text-only digest when the input carries images; the
            // multimodal payload rides along for this request only.
            let multimodal_override: Option<MessageContent> = if user_input.has_images() {
                let digest = user_input.to_text();
                self.messages.push(Message::user(digest));
                Some(user_input.clone())
            } else {
                self.messages.push(Message {
                    role: Role::User,
                    content: user_input.clone(),
                    name: None,
                    tool_call_id: None,
                    tool_calls: Vec::new(),
                });
                None
            };

            self.cancelled.store(false, Ordering::SeqCst);
            let mut first_call_override = multimodal_override;
            let mut pending_screenshot: Option<Vec<ContentBlock>> = None;
            let mut tool_call_count: usize = 0;
            let max_tool_calls = self.config.effective_max_tool_calls();

            loop {
                if self.cancelled.load(Ordering::SeqCst) {
                    yield AgentEvent::Cancelled { reason: "user_cancelled".to_string() };
                    return;
                }

                // Build the outgoing message list: per-request overrides are
                // not persisted in history.
                let mut messages_to_send = self.messages.clone();
                if let Some(override_content) = first_call_override.take() {
                    if let Some(last) = messages_to_send.last_mut() {
                        if last.role == Role::User {
                            last.content = override_content;
                        }
                    }
                }
                if let Some(blocks) = pending_screenshot.take() {
                    messages_to_send.push(Message::user_blocks(blocks));
                }

                let mut chat_config = ChatConfig::default();
                if native_tools {
                    chat_config.tools = self.tool_schemas.clone();
                }
                self.last_prompt_tokens = Self::estimate_message_tokens(&messages_to_send);

                let mut llm_stream = backend.stream_chat(messages_to_send, chat_config);
                let mut accumulated_text = String::new();
                let mut native_calls: Vec<PendingCall> = Vec::new();
                let mut stop_reason = "end_turn".to_string();
                let mut final_usage = None;

                while let Some(event) = llm_stream.next().await {
                    match event {
                        StreamEvent::Delta { text } => {
                            accumulated_text.push_str(&text);
                            yield AgentEvent::Delta { text };
                        }
                        StreamEvent::ThinkingDelta { text } => {
                            yield AgentEvent::ThinkingDelta { text };
                        }
                        StreamEvent::ToolCall { id, name, arguments } => {
                            native_calls.push(PendingCall { id, name, arguments });
                        }
                        StreamEvent::Done { stop_reason: reason, usage } => {
                            stop_reason = reason;
                            if let Some(usage) = &usage {
                                self.last_prompt_tokens = usage.input_tokens;
                                self.last_completion_tokens = usage.output_tokens;
                                self.total_prompt_tokens += usage.input_tokens;
                                self.total_completion_tokens += usage.output_tokens;
                            }
                            final_usage = usage;
                        }
                        StreamEvent::Error { message, code } => {
                            // Transport/provider errors count toward the circuit.
                            self.router.record_failure(backend.name()).await;
                            yield AgentEvent::Error { message, code };
                            return;
                        }
                    }
                }
                drop(llm_stream);

                // Textual backends: extract tagged tool calls from the text.
                let mut all_calls = native_calls;
                if !native_tools && !accumulated_text.is_empty() {
                    for parsed in parse_tagged_tool_calls(&accumulated_text) {
                        all_calls.push(PendingCall {
                            id: parsed.id,
                            name: parsed.name,
                            arguments: parsed.arguments,
                        });
                    }
                }

                if all_calls.is_empty() {
                    if !accumulated_text.is_empty() {
                        self.messages.push(Message::assistant(accumulated_text));
                    }
                    yield AgentEvent::Done { stop_reason, usage: final_usage };
                    return;
                }

                // Per-request cap on cumulative tool calls (0 = unlimited).
                tool_call_count += all_calls.len();
                if max_tool_calls > 0 && tool_call_count > max_tool_calls {
                    yield AgentEvent::Error {
                        message: format!("Tool call limit exceeded ({})", max_tool_calls),
                        code: "tool_limit".to_string(),
                    };
                    yield AgentEvent::Done { stop_reason: "tool_limit".to_string(), usage: final_usage };
                    return;
                }

                // Record the assistant turn with its pending tool calls.
                let tool_call_list: Vec<ToolCallRequest> = all_calls
                    .iter()
                    .map(|c| ToolCallRequest {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    })
                    .collect();
                self.messages.push(Message::assistant_with_tool_calls(
                    accumulated_text.clone(),
                    if native_tools { tool_call_list } else { Vec::new() },
                ));

                // Parallel dispatch when every call is external, auto-approved,
                // and mode-allowed.
                if self.can_parallelize(&all_calls).await {
                    for call in &all_calls {
                        yield AgentEvent::ToolStart {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        };
                    }

                    let futures: Vec<_> = all_calls
                        .iter()
                        .map(|call| {
                            let hooks = Arc::clone(&self.hooks);
                            let host = Arc::clone(&self.tool_host);
                            let call = call.clone();
                            async move {
                                let decision = hooks.pre_tool(&call.name, &call.arguments).await;
                                if !decision.ok || !decision.allow {
                                    return HostToolResult::failure(
                                        call.name.clone(),
                                        format!("Hook blocked: {}", decision.reason),
                                    );
                                }
                                let result = host.call_tool(&call.name, &call.arguments).await;
                                let truncated = preview(&result.content, 500);
                                if !hooks.post_tool(&call.name, result.ok, &truncated).await {
                                    if log::log_enabled!(log::Level::Warn) {
                                        log::warn!("Post-tool hook failed for {}", call.name);
                                    }
                                }
                                result
                            }
                        })
                        .collect();
                    let results = futures_util::future::join_all(futures).await;

                    // ToolEnd events follow the tool-call list order,
                    // independent of completion order.
                    for (call, result) in all_calls.iter().zip(results) {
                        yield AgentEvent::ToolEnd {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            ok: result.ok,
                            result: result.content.clone(),
                        };
                        self.messages.push(Message::tool_result(
                            call.id.clone(),
                            call.name.clone(),
                            result.content,
                        ));
                    }
                    continue;
                }

                // Sequential dispatch with the full gate sequence.
                for call in all_calls {
                    if self.cancelled.load(Ordering::SeqCst) {
                        yield AgentEvent::Cancelled { reason: "user_cancelled".to_string() };
                        return;
                    }

                    yield AgentEvent::ToolStart {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                    };

                    let mut events: Vec<AgentEvent> = Vec::new();
                    let (result, screenshot) = self.dispatch_one(&call, &mut events).await;
                    for event in events {
                        yield event;
                    }

                    yield AgentEvent::ToolEnd {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        ok: result.ok,
                        result: result.content.clone(),
                    };
                    self.messages.push(Message::tool_result(
                        call.id.clone(),
                        call.name.clone(),
                        result.content,
                    ));

                    // Screenshot auto-injection for the next model turn only.
                    if let Some(path) = screenshot {
                        if let Some(blocks) = screenshot_blocks(&path) {
                            pending_screenshot = Some(blocks);
                        }
                    }
                }
            }
        }))
    }

    async fn can_parallelize(&self, calls: &[PendingCall]) -> bool {
        if calls.len() <= 1 {
            return false;
        }
        let permissions = self.permissions.lock().await;
        for call in calls {
            if is_local_tool(&call.name) {
                return false;
            }
            if permissions.should_block(&call.name) {
                return false;
            }
            if !permissions.should_auto_approve(&call.name, Some(&call.arguments)) {
                return false;
            }
            let (allowed, _) = permissions.check_operation_mode(&call.name, Some(&call.arguments));
            if !allowed {
                return false;
            }
        }
        true
    }

    // One sequential dispatch through the full gate sequence.  Side events
    // (planned/blocked/interrupt/subagent) are appended to `events`.
    // Returns the result and an optional screenshot path for auto-injection.
    async fn dispatch_one(
        &mut self,
        call: &PendingCall,
        events: &mut Vec<AgentEvent>,
    ) -> (HostToolResult, Option<String>) {
        let name = call.name.as_str();
        let args = &call.arguments;

        // Permission gate.
        {
            let blocked = {
                let permissions = self.permissions.lock().await;
                permissions.should_block(name)
            };
            if blocked {
                return (
                    HostToolResult::failure(name, "Tool blocked by user (always-deny)"),
                    None,
                );
            }

            let auto = {
                let permissions = self.permissions.lock().await;
                permissions.should_auto_approve(name, Some(args))
            };
            if !auto {
                let decision = match &self.approval_handler {
                    Some(handler) => handler.request_approval(name, args, &call.id).await,
                    None => ApprovalDecision::Allow,
                };
                match decision {
                    ApprovalDecision::Block => {
                        return (HostToolResult::failure(name, "Tool blocked by user"), None);
                    }
                    ApprovalDecision::AlwaysAllowTool => {
                        self.permissions.lock().await.grant_tool(name);
                    }
                    ApprovalDecision::AlwaysAllowAll => {
                        self.permissions.lock().await.grant_all();
                    }
                    ApprovalDecision::Allow => {}
                }
            }
        }

        // Operation-mode gate.
        {
            let (allowed, reason) = {
                let permissions = self.permissions.lock().await;
                permissions.check_operation_mode(name, Some(args))
            };
            if !allowed {
                if self.config.operation_mode == OperationMode::Plan {
                    events.push(AgentEvent::ToolPlanned {
                        id: call.id.clone(),
                        name: name.to_string(),
                        args: args.clone(),
                    });
                    let args_prefix = preview(&args.to_string(), 200);
                    return (
                        HostToolResult::success(
                            name,
                            format!("[PLANNED] Would execute: {}({})", name, args_prefix),
                        ),
                        None,
                    );
                }
                events.push(AgentEvent::ToolBlocked {
                    name: name.to_string(),
                    reason: reason.clone(),
                });
                return (HostToolResult::failure(name, reason), None);
            }
        }

        // Routed-action validation: warn only, the tool host is authoritative.
        let schema = self.tool_schemas.iter().find(|t| t.name == name);
        if let Some(warning) = validate_routed_action(name, args, schema) {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("{}", warning);
            }
        }

        // Role gate: human-in-the-loop tools are leader-only.
        let interact_tool = name == "interact"
            || matches!(name, "ask_user" | "request_approval" | "present_plan");
        if interact_tool && !self.hooks.is_leader() {
            let _ = self
                .hooks
                .log_progress(&format!(
                    "BLOCKED: Worker attempted {} ({})",
                    name,
                    args.get("action").and_then(|a| a.as_str()).unwrap_or(name)
                ))
                .await;
            return (
                HostToolResult::failure(name, format!("{} is LEADER-ONLY", name)),
                None,
            );
        }

        // Local tools dispatch in-process and skip the hook pair.
        if is_local_tool(name) {
            let result = match name {
                "ask_user_question" => self.handle_ask_user_question(args, events).await,
                "spawn_subagent" => self.handle_spawn_subagent(args, events).await,
                "spawn_parallel_subagents" => {
                    self.handle_spawn_parallel_subagents(args, events).await
                }
                _ => HostToolResult::failure(name, format!("Unknown local tool: {}", name)),
            };
            return (result, None);
        }

        // Pre-tool hook, fail-closed.
        let decision = self.hooks.pre_tool(name, args).await;
        if !decision.ok {
            return (
                HostToolResult::failure(name, format!("Pre-tool hook failed: {}", decision.reason)),
                None,
            );
        }
        if !decision.allow {
            return (
                HostToolResult::failure(name, format!("Tool blocked by hook: {}", decision.reason)),
                None,
            );
        }

        // External dispatch.
        let result = self.tool_host.call_tool(name, args).await;

        // Post-tool hook, non-fatal.
        let truncated = preview(&result.content, 500);
        if !self.hooks.post_tool(name, result.ok, &truncated).await {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("Post-tool hook failed for {}", name);
            }
        }

        // A successful screen capture schedules an image injection.
        let screenshot = if name == "screen_capture" && result.ok {
            serde_json::from_str::<serde_json::Value>(&result.content)
                .ok()
                .filter(|v| v.get("ok").and_then(|o| o.as_bool()).unwrap_or(false))
                .and_then(|v| {
                    v.get("data")
                        .and_then(|d| d.get("path"))
                        .and_then(|p| p.as_str())
                        .map(|s| s.to_string())
                })
        } else {
            None
        };

        (result, screenshot)
    }

    async fn handle_ask_user_question(
        &self,
        args: &serde_json::Value,
        events: &mut Vec<AgentEvent>,
    ) -> HostToolResult {
        let question = args
            .get("question")
            .and_then(|q| q.as_str())
            .unwrap_or("Please provide input:")
            .to_string();
        let options: Vec<InterruptOption> = args
            .get("options")
            .and_then(|o| o.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|o| {
                        Some(InterruptOption {
                            label: o.get("label")?.as_str()?.to_string(),
                            description: o
                                .get("description")
                                .and_then(|d| d.as_str())
                                .map(|s| s.to_string()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let input_type =
            InputType::parse(args.get("input_type").and_then(|t| t.as_str()).unwrap_or(""));
        let reason =
            InterruptReason::parse(args.get("reason").and_then(|r| r.as_str()).unwrap_or(""));

        let interrupt = InterruptRequest::create(question, options, input_type, reason);
        events.push(AgentEvent::Interrupt(interrupt.clone()));

        match &self.interrupt_handler {
            Some(handler) => match handler.handle(&interrupt).await {
                Ok(answer) => {
                    if log::log_enabled!(log::Level::Info) {
                        log::info!("User responded to interrupt {}", interrupt.id);
                    }
                    HostToolResult::success(
                        "ask_user_question",
                        serde_json::json!({ "answer": answer }).to_string(),
                    )
                }
                Err(e) => HostToolResult::failure(
                    "ask_user_question",
                    format!("Interrupt handler error: {}", e),
                ),
            },
            None => HostToolResult::failure(
                "ask_user_question",
                "No interrupt handler configured. Cannot get user input.",
            ),
        }
    }

    async fn handle_spawn_subagent(
        &self,
        args: &serde_json::Value,
        events: &mut Vec<AgentEvent>,
    ) -> HostToolResult {
        let subagent_type = args
            .get("subagent_type")
            .and_then(|t| t.as_str())
            .unwrap_or("explorer")
            .to_string();
        let task = args.get("task").and_then(|t| t.as_str()).unwrap_or("").to_string();
        let context = args
            .get("context")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        let backend = match &self.pinned_backend {
            Some(b) => Arc::clone(b),
            None => match self.router.pick_healthy_backend().await {
                Ok(b) => b,
                Err(e) => return HostToolResult::failure("spawn_subagent", e.to_string()),
            },
        };

        let subagent = match SubAgent::new(
            backend,
            Arc::clone(&self.tool_host),
            &subagent_type,
            task.clone(),
            context,
        ) {
            Ok(s) => s,
            Err(e) => return HostToolResult::failure("spawn_subagent", e),
        };

        events.push(AgentEvent::SubagentStart {
            subagent_type: subagent_type.clone(),
            task: preview(&task, 100),
        });

        let result = subagent.run().await;

        events.push(AgentEvent::SubagentEnd {
            subagent_type: subagent_type.clone(),
            ok: result.ok,
            turns_used: result.turns_used,
        });

        HostToolResult {
            name: "spawn_subagent".to_string(),
            ok: result.ok,
            content: format!("[Subagent:{}] {}", subagent_type, result.content),
        }
    }

    async fn handle_spawn_parallel_subagents(
        &self,
        args: &serde_json::Value,
        events: &mut Vec<AgentEvent>,
    ) -> HostToolResult {
        let specs: Vec<SubagentSpec> = args
            .get("subagents")
            .and_then(|s| s.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|s| SubagentSpec {
                        subagent_type: s
                            .get("subagent_type")
                            .and_then(|t| t.as_str())
                            .unwrap_or("explorer")
                            .to_string(),
                        task: s.get("task").and_then(|t| t.as_str()).unwrap_or("").to_string(),
                        context: s
                            .get("context")
                            .and_then(|c| c.as_str())
                            .unwrap_or("")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let shared_context = args
            .get("shared_context")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        if specs.is_empty() {
            return HostToolResult::failure("spawn_parallel_subagents", "No subagents specified");
        }

        let backend = match &self.pinned_backend {
            Some(b) => Arc::clone(b),
            None => match self.router.pick_healthy_backend().await {
                Ok(b) => b,
                Err(e) => {
                    return HostToolResult::failure("spawn_parallel_subagents", e.to_string())
                }
            },
        };

        events.push(AgentEvent::ParallelSubagentsStart {
            count: specs.len().min(5),
        });

        let mut progress: Vec<AgentEvent> = Vec::new();
        let result = spawn_parallel_subagents(
            backend,
            Arc::clone(&self.tool_host),
            specs,
            &shared_context,
            |index, total, subagent_type, status| {
                progress.push(AgentEvent::SubagentProgress {
                    index,
                    total,
                    subagent_type: subagent_type.to_string(),
                    status: status.to_string(),
                });
            },
        )
        .await;

        events.extend(progress);
        events.push(AgentEvent::ParallelSubagentsEnd {
            ok: result.ok,
            failed_count: result.failed_count,
        });

        HostToolResult {
            name: "spawn_parallel_subagents".to_string(),
            ok: result.ok,
            content: result.content(),
        }
    }
}

/// Build the synthetic screenshot message blocks for a captured file.
fn screenshot_blocks(path: &str) -> Option<Vec<ContentBlock>> {
    let file = Path::new(path);
    if !file.exists() {
        return None;
    }
    let bytes = std::fs::read(file).ok()?;
    let media_type = match file.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("screenshot");
    Some(vec![
        ContentBlock::Text {
            text: format!("[Screenshot captured: {}]", name),
        },
        ContentBlock::Image {
            media_type: media_type.to_string(),
            source: ImageSource::Base64(base64::engine::general_purpose::STANDARD.encode(bytes)),
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_tool_calls() {
        let text = "Let me read that.\n\
            <tool_call><name>fs</name><arguments>{\"action\":\"read\",\"path\":\"x\"}</arguments></tool_call>\n\
            and also\n\
            <tool_call><name>search</name><arguments>not json</arguments></tool_call>";
        let calls = parse_tagged_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "fs");
        assert_eq!(calls[0].arguments["action"], "read");
        assert_eq!(calls[1].name, "search");
        assert_eq!(calls[1].arguments["raw"], "not json");
    }

    #[test]
    fn test_parse_ignores_plain_text() {
        assert!(parse_tagged_tool_calls("no tools here").is_empty());
        assert!(parse_tagged_tool_calls("<tool_call>malformed</tool_call>").is_empty());
    }

    #[test]
    fn test_render_tools_prompt_documents_tag_format() {
        let tools = vec![ToolSchema::new(
            "fs",
            "File ops",
            serde_json::json!({"type":"object"}),
        )];
        let prompt = render_tools_prompt(&tools);
        assert!(prompt.contains("- fs: File ops"));
        assert!(prompt.contains("<tool_call><name>TOOL_NAME</name>"));
        assert!(render_tools_prompt(&[]).is_empty());
    }

    #[test]
    fn test_token_estimation() {
        assert_eq!(AgentLoop::estimate_tokens(""), 0);
        assert_eq!(AgentLoop::estimate_tokens("abcdefgh"), 2);
        let msgs = vec![Message::user("abcdefgh")];
        // 4 overhead + 2 content.
        assert_eq!(AgentLoop::estimate_message_tokens(&msgs), 6);
    }
}
