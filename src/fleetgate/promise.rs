//! Completion-promise protocol.
//!
//! Workers signal their state by embedding a promise tag in their output:
//!
//! ```text
//! <promise>DONE</promise>
//! <promise>BLOCKED:missing API key</promise>
//! <promise>STUCK:circular dependency detected</promise>
//! <promise>PROGRESS:75</promise>
//! ```
//!
//! The iteration engine consumes parsed promises to drive retries and
//! graduated escalation.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Worker-emitted completion signal.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseType {
    /// The subtask is finished.
    DONE,
    /// Progress requires an external resource or approval.
    BLOCKED,
    /// The worker cannot make progress on its own.
    STUCK,
    /// Work continues; detail may carry a percentage.
    PROGRESS,
}

impl PromiseType {
    /// Parse an uppercase signal name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "DONE" => Some(PromiseType::DONE),
            "BLOCKED" => Some(PromiseType::BLOCKED),
            "STUCK" => Some(PromiseType::STUCK),
            "PROGRESS" => Some(PromiseType::PROGRESS),
            _ => None,
        }
    }

    /// Uppercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PromiseType::DONE => "DONE",
            PromiseType::BLOCKED => "BLOCKED",
            PromiseType::STUCK => "STUCK",
            PromiseType::PROGRESS => "PROGRESS",
        }
    }
}

lazy_static! {
    static ref PROMISE_PATTERN: Regex =
        Regex::new(r"(?i)<promise>(\w+)(?::([^<]+))?</promise>").expect("promise regex");
}

/// Extract the first completion promise from worker output.
///
/// Returns the promise and its trimmed detail string (empty when absent).
/// Unknown signal names are ignored.
pub fn parse_promise(text: &str) -> (Option<PromiseType>, String) {
    match PROMISE_PATTERN.captures(text) {
        Some(caps) => {
            let signal = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let detail = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            match PromiseType::parse(signal) {
                Some(promise) => (Some(promise), detail),
                None => (None, String::new()),
            }
        }
        None => (None, String::new()),
    }
}

/// Format a promise tag for worker output.
pub fn format_promise(promise: PromiseType, detail: &str) -> String {
    if detail.is_empty() {
        format!("<promise>{}</promise>", promise.as_str())
    } else {
        format!("<promise>{}:{}</promise>", promise.as_str(), detail)
    }
}

/// Extract a clamped percentage from a PROGRESS detail string.
pub fn extract_progress_pct(detail: &str) -> Option<u8> {
    detail
        .trim()
        .trim_end_matches('%')
        .parse::<i64>()
        .ok()
        .map(|pct| pct.max(0).min(100) as u8)
}

/// Whether the promise terminates the subtask successfully.
pub fn is_terminal_promise(promise: Option<PromiseType>) -> bool {
    promise == Some(PromiseType::DONE)
}

/// Whether the promise requires leader intervention.
pub fn needs_leader_attention(promise: Option<PromiseType>) -> bool {
    matches!(promise, Some(PromiseType::BLOCKED) | Some(PromiseType::STUCK))
}
