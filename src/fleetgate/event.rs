//! Agent loop event surface.
//!
//! The driver in [`agent_loop`](crate::fleetgate::agent_loop) yields a lazy
//! sequence of [`AgentEvent`]s per request.  Ordering guarantees, as observed
//! by any consumer:
//!
//! - `Delta` / `ThinkingDelta` / tool accumulation preserve within-turn order
//! - for each tool call, `ToolStart` precedes `ToolEnd` with the same id
//! - across a parallel dispatch, every `ToolStart` is emitted before any
//!   `ToolEnd`, and `ToolEnd` events follow the original tool-call list order
//!   regardless of completion order

use crate::fleetgate::backend::TokenUsage;
use crate::fleetgate::interrupt::InterruptRequest;

/// Events yielded by [`AgentLoop::process`](crate::fleetgate::agent_loop::AgentLoop::process).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental assistant text, forwarded unchanged from the backend.
    Delta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning text.
    ThinkingDelta {
        /// The text fragment.
        text: String,
    },
    /// Informational notice (auto-compaction, context refresh).
    Info {
        /// Human-readable message.
        message: String,
    },
    /// A tool dispatch is starting.
    ToolStart {
        /// Tool-call id.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments about to be dispatched.
        args: serde_json::Value,
    },
    /// A tool dispatch finished (success or failure).
    ToolEnd {
        /// Tool-call id matching the corresponding `ToolStart`.
        id: String,
        /// Tool name.
        name: String,
        /// Whether the tool reported success.
        ok: bool,
        /// Textualised tool payload.
        result: String,
    },
    /// PLAN mode recorded a write action instead of executing it.
    ToolPlanned {
        /// Tool-call id.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments that would have been dispatched.
        args: serde_json::Value,
    },
    /// READ mode refused a write action.
    ToolBlocked {
        /// Tool name.
        name: String,
        /// Why the call was refused.
        reason: String,
    },
    /// A human-in-the-loop interrupt is pending.
    Interrupt(InterruptRequest),
    /// A subagent started.
    SubagentStart {
        /// Subagent type (`explorer`, `planner`).
        subagent_type: String,
        /// Task preview (truncated).
        task: String,
    },
    /// A subagent finished.
    SubagentEnd {
        /// Subagent type.
        subagent_type: String,
        /// Whether it completed via `respond`.
        ok: bool,
        /// Turns consumed.
        turns_used: usize,
    },
    /// A parallel subagent batch started.
    ParallelSubagentsStart {
        /// Number of subagents in the batch.
        count: usize,
    },
    /// Progress during sequential subagent execution on local backends.
    SubagentProgress {
        /// 0-based index within the batch.
        index: usize,
        /// Batch size.
        total: usize,
        /// Subagent type.
        subagent_type: String,
        /// `running` or `finished`.
        status: String,
    },
    /// A parallel subagent batch finished.
    ParallelSubagentsEnd {
        /// Whether every subagent succeeded.
        ok: bool,
        /// Number of failed subagents.
        failed_count: usize,
    },
    /// The request was cancelled cooperatively.
    Cancelled {
        /// Cancellation reason (`user_cancelled`).
        reason: String,
    },
    /// The request completed.
    Done {
        /// Stop reason from the final model turn (or `tool_limit`).
        stop_reason: String,
        /// Token accounting for the final turn, when reported.
        usage: Option<TokenUsage>,
    },
    /// The request failed; the stream terminates after this event.
    Error {
        /// Human-readable message.
        message: String,
        /// Short machine code.
        code: String,
    },
}

/// Truncate `text` to at most `max` characters for event previews.
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 5), "héllo");
        assert_eq!(preview("short", 100), "short");
    }
}
