//! Gateway error taxonomy.
//!
//! Every failure surfaced by the crate falls into one of the closed classes
//! below.  Stream-layer problems travel as [`StreamEvent::Error`](crate::fleetgate::backend::StreamEvent)
//! events and never unwind a request; tool-layer problems travel as tool
//! results so the model gets a chance to recover; everything else is returned
//! synchronously as a [`GatewayError`].

use std::error::Error;
use std::fmt;

/// Closed set of error classes produced by the gateway core.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Unknown backend, missing credentials, or a malformed fallback chain.
    /// Fatal at startup, surfaced synchronously.
    Configuration(String),
    /// Connect failure or protocol error while talking to a backend.
    Transport(String),
    /// The backend answered with a non-success status.  The body has been
    /// parsed for a human-readable message and secrets are redacted.
    Provider(String),
    /// Every backend in the chain was skipped or failed its probe.  Carries
    /// the concatenated per-backend error summaries.
    NoHealthyBackend(String),
    /// The pre-tool session hook refused the call.
    HookBlocked(String),
    /// The external tool host returned not-ok for a dispatched call.
    ToolDispatch(String),
    /// Routed-action or argument validation problem.  Validation is
    /// permissive at dispatch time, so this class mostly appears in logs.
    Validation(String),
    /// The per-request tool-call cap was exceeded.
    ToolLimit(usize),
    /// A subtask exhausted its iteration budget.
    BudgetExhausted(String),
    /// Cooperative cancellation by the caller.
    Cancelled,
    /// Filesystem problem against todo.md, the task store, or a checkpoint.
    Io(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            GatewayError::Transport(msg) => write!(f, "transport error: {}", msg),
            GatewayError::Provider(msg) => write!(f, "provider error: {}", msg),
            GatewayError::NoHealthyBackend(msg) => {
                write!(f, "no healthy backends available. Tried: {}", msg)
            }
            GatewayError::HookBlocked(msg) => write!(f, "blocked by pre-tool hook: {}", msg),
            GatewayError::ToolDispatch(msg) => write!(f, "tool dispatch failed: {}", msg),
            GatewayError::Validation(msg) => write!(f, "validation error: {}", msg),
            GatewayError::ToolLimit(max) => write!(f, "tool call limit exceeded ({})", max),
            GatewayError::BudgetExhausted(msg) => write!(f, "iteration budget exhausted: {}", msg),
            GatewayError::Cancelled => write!(f, "cancelled by user"),
            GatewayError::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

impl Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Validation(e.to_string())
    }
}
