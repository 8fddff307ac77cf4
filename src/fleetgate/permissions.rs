//! Tool permission state and operation-mode gating.
//!
//! Tracks which tools have been granted "always accept" status, which are
//! always denied, and whether the session-wide accept-all flag is set.
//! Dangerous calls (terminal writes, file mutations outside the agent's own
//! working files) always require confirmation regardless of permission state.
//! Also enforces the operation modes (`normal`, `plan`, `read`) over the
//! closed read-only/write action tables.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fleetgate::config::OperationMode;

/// Decision returned by the external approval handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Run the tool this once.
    Allow,
    /// Refuse the tool this once.
    Block,
    /// Run it and auto-approve this tool for the rest of the session.
    AlwaysAllowTool,
    /// Run it and auto-approve every tool for the rest of the session.
    AlwaysAllowAll,
}

/// Read-only actions per routed tool.
fn read_only_actions() -> HashMap<&'static str, HashSet<&'static str>> {
    let mut m = HashMap::new();
    m.insert("fs", ["read", "list"].iter().copied().collect());
    m.insert(
        "search",
        ["help", "query", "status", "query_semantic", "query_hybrid"]
            .iter()
            .copied()
            .collect(),
    );
    m.insert("repo", ["help", "status", "get", "list", "run"].iter().copied().collect());
    m.insert("checkpoint", ["help", "list", "load"].iter().copied().collect());
    m.insert(
        "session",
        ["help", "context", "start", "end", "log"].iter().copied().collect(),
    );
    m.insert("memory", ["help", "get"].iter().copied().collect());
    m.insert("inbox", ["help", "list", "read", "stats"].iter().copied().collect());
    m.insert(
        "term",
        ["help", "list", "read", "term_read", "resolve"].iter().copied().collect(),
    );
    m.insert("screen_capture", ["capture", "list"].iter().copied().collect());
    m
}

/// Write/execute actions per routed tool.
fn write_actions() -> HashMap<&'static str, HashSet<&'static str>> {
    let mut m = HashMap::new();
    m.insert("fs", ["write", "edit", "delete"].iter().copied().collect());
    m.insert(
        "term",
        ["send_line", "write", "talk", "create", "send_line_to_agent", "resize"]
            .iter()
            .copied()
            .collect(),
    );
    m.insert("checkpoint", ["save"].iter().copied().collect());
    m.insert(
        "inbox",
        ["send", "complete", "claim", "mark_read"].iter().copied().collect(),
    );
    m.insert(
        "memory",
        ["set_goal", "add_blocker", "clear_blockers", "set_steps", "reset"]
            .iter()
            .copied()
            .collect(),
    );
    m.insert("interact", ["ask", "approve", "plan", "screenshot"].iter().copied().collect());
    m
}

/// Serialised permission state.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedPermissions {
    accept_all: bool,
    always_approved: Vec<String>,
    always_denied: Vec<String>,
}

/// Manages tool approval state (session-scoped + optional persistence).
pub struct PermissionManager {
    accept_all: bool,
    always_approved: HashSet<String>,
    always_denied: HashSet<String>,
    mode: OperationMode,
    config_path: Option<PathBuf>,

    read_only: HashMap<&'static str, HashSet<&'static str>>,
    write: HashMap<&'static str, HashSet<&'static str>>,
    dangerous_tools: HashSet<&'static str>,
    dangerous_actions: HashMap<&'static str, HashSet<&'static str>>,
    safe_write_paths: HashSet<&'static str>,
    safe_write_prefixes: Vec<&'static str>,
}

impl PermissionManager {
    /// Create a manager for the given operation mode.  When `config_path` is
    /// set, [`save`](PermissionManager::save) and
    /// [`load`](PermissionManager::load) persist the grant state there.
    pub fn new(mode: OperationMode, config_path: Option<PathBuf>) -> Self {
        let mut dangerous_actions: HashMap<&'static str, HashSet<&'static str>> = HashMap::new();
        dangerous_actions.insert("fs", ["write", "edit", "delete"].iter().copied().collect());
        dangerous_actions.insert(
            "term",
            ["send_line", "write", "talk", "create", "send_line_to_agent"]
                .iter()
                .copied()
                .collect(),
        );

        PermissionManager {
            accept_all: false,
            always_approved: HashSet::new(),
            always_denied: HashSet::new(),
            mode,
            config_path,
            read_only: read_only_actions(),
            write: write_actions(),
            dangerous_tools: ["fs", "term"].iter().copied().collect(),
            dangerous_actions,
            safe_write_paths: [
                "ai/agent_context.md",
                "ai/todo.md",
                "ai/progress.md",
                "ai/sessions.json",
            ]
            .iter()
            .copied()
            .collect(),
            safe_write_prefixes: vec!["ai/checkpoints/", "ai/inbox/"],
        }
    }

    /// Current operation mode.
    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    /// Switch the operation mode at runtime.
    pub fn set_mode(&mut self, mode: OperationMode) {
        self.mode = mode;
    }

    /// Check if a tool should be auto-approved (skip the confirmation prompt).
    pub fn should_auto_approve(&self, tool_name: &str, args: Option<&serde_json::Value>) -> bool {
        // Dangerous actions always prompt.
        if self.is_dangerous(tool_name, args) {
            return false;
        }
        if self.accept_all {
            return true;
        }
        if self.always_approved.contains(tool_name) {
            return true;
        }
        false
    }

    /// Check if a tool is blocked without prompting.
    pub fn should_block(&self, tool_name: &str) -> bool {
        self.always_denied.contains(tool_name)
    }

    /// Whether a call matches the dangerous table (prompts every time).
    ///
    /// File writes under the agent's own working paths are whitelisted.
    pub fn is_dangerous(&self, tool_name: &str, args: Option<&serde_json::Value>) -> bool {
        if !self.dangerous_tools.contains(tool_name) {
            return false;
        }

        let action = args
            .and_then(|a| a.get("action"))
            .and_then(|a| a.as_str())
            .unwrap_or("");

        if action.is_empty() {
            // No action supplied: default to dangerous.
            return true;
        }

        match self.dangerous_actions.get(tool_name) {
            Some(actions) if actions.contains(action) => {
                if tool_name == "fs" && (action == "write" || action == "edit") {
                    let path = args
                        .and_then(|a| a.get("path"))
                        .and_then(|p| p.as_str())
                        .unwrap_or("");
                    let normalized = path.replace('\\', "/");
                    if self.safe_write_paths.contains(normalized.as_str()) {
                        return false;
                    }
                    if self
                        .safe_write_prefixes
                        .iter()
                        .any(|prefix| normalized.starts_with(prefix))
                    {
                        return false;
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Grant always-allow for a tool (session-scoped).
    pub fn grant_tool(&mut self, tool_name: &str) {
        self.always_approved.insert(tool_name.to_string());
        self.always_denied.remove(tool_name);
        if log::log_enabled!(log::Level::Info) {
            log::info!("Granted always-allow for {}", tool_name);
        }
    }

    /// Grant always-allow for all tools.  Dangerous calls still prompt.
    pub fn grant_all(&mut self) {
        self.accept_all = true;
        if log::log_enabled!(log::Level::Info) {
            log::info!("Granted accept-all for session");
        }
    }

    /// Set always-deny for a tool (blocks without prompting).
    pub fn deny_tool(&mut self, tool_name: &str) {
        self.always_denied.insert(tool_name.to_string());
        self.always_approved.remove(tool_name);
        if log::log_enabled!(log::Level::Info) {
            log::info!("Set always-deny for {}", tool_name);
        }
    }

    /// Reset all permissions to the default (ask).
    pub fn reset(&mut self) {
        self.accept_all = false;
        self.always_approved.clear();
        self.always_denied.clear();
    }

    /// Whether a call is a read-only action.
    pub fn is_read_only_action(&self, tool_name: &str, args: Option<&serde_json::Value>) -> bool {
        let action = args
            .and_then(|a| a.get("action"))
            .and_then(|a| a.as_str())
            .unwrap_or("");
        match self.read_only.get(tool_name) {
            // No action on a known read-capable tool defaults to safe.
            Some(actions) => action.is_empty() || actions.contains(action),
            None => false,
        }
    }

    /// Whether a call is a write/execute action.  Unknown tools default to
    /// write, the safer classification for restricted modes.
    pub fn is_write_action(&self, tool_name: &str, args: Option<&serde_json::Value>) -> bool {
        let action = args
            .and_then(|a| a.get("action"))
            .and_then(|a| a.as_str())
            .unwrap_or("");
        match self.write.get(tool_name) {
            Some(actions) => actions.contains(action),
            None => !self.read_only.contains_key(tool_name),
        }
    }

    /// Check if a call is allowed in the current operation mode.
    ///
    /// Returns `(allowed, reason)`; `reason` explains a refusal.
    pub fn check_operation_mode(
        &self,
        tool_name: &str,
        args: Option<&serde_json::Value>,
    ) -> (bool, String) {
        if self.mode == OperationMode::Normal {
            return (true, String::new());
        }
        if self.is_read_only_action(tool_name, args) {
            return (true, String::new());
        }

        let action = args
            .and_then(|a| a.get("action"))
            .and_then(|a| a.as_str())
            .unwrap_or("unknown");

        match self.mode {
            OperationMode::Read => (
                false,
                format!("Blocked in READ mode: {}:{}", tool_name, action),
            ),
            OperationMode::Plan => (
                false,
                format!("Planned (not executed): {}:{}", tool_name, action),
            ),
            OperationMode::Normal => (true, String::new()),
        }
    }

    /// Current permission state for status payloads.
    pub fn status(&self) -> serde_json::Value {
        let mut approved: Vec<&String> = self.always_approved.iter().collect();
        approved.sort();
        let mut denied: Vec<&String> = self.always_denied.iter().collect();
        denied.sort();
        serde_json::json!({
            "accept_all": self.accept_all,
            "always_approved": approved,
            "always_denied": denied,
            "operation_mode": self.mode.as_str(),
        })
    }

    /// Persist the grant state to the configured path.
    pub fn save(&self) -> bool {
        let path = match &self.config_path {
            Some(p) => p,
            None => return false,
        };
        let data = PersistedPermissions {
            accept_all: self.accept_all,
            always_approved: self.always_approved.iter().cloned().collect(),
            always_denied: self.always_denied.iter().cloned().collect(),
        };
        match serde_json::to_string_pretty(&data) {
            Ok(json) => match std::fs::write(path, json) {
                Ok(()) => true,
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("Failed to save permissions: {}", e);
                    }
                    false
                }
            },
            Err(_) => false,
        }
    }

    /// Load previously persisted grant state.
    pub fn load(&mut self) -> bool {
        let path = match &self.config_path {
            Some(p) if p.exists() => p.clone(),
            _ => return false,
        };
        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PersistedPermissions>(&raw).ok())
        {
            Some(data) => {
                self.accept_all = data.accept_all;
                self.always_approved = data.always_approved.into_iter().collect();
                self.always_denied = data.always_denied.into_iter().collect();
                true
            }
            None => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Failed to load permissions from {:?}", path);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: serde_json::Value) -> serde_json::Value {
        value
    }

    #[test]
    fn test_dangerous_write_prompts_but_safe_paths_do_not() {
        let pm = PermissionManager::new(OperationMode::Normal, None);

        let write_src = args(serde_json::json!({"action": "write", "path": "src/main.rs"}));
        assert!(pm.is_dangerous("fs", Some(&write_src)));
        assert!(!pm.should_auto_approve("fs", Some(&write_src)));

        let write_todo = args(serde_json::json!({"action": "write", "path": "ai/todo.md"}));
        assert!(!pm.is_dangerous("fs", Some(&write_todo)));

        let write_checkpoint =
            args(serde_json::json!({"action": "write", "path": "ai/checkpoints/T1/x.json"}));
        assert!(!pm.is_dangerous("fs", Some(&write_checkpoint)));

        let read = args(serde_json::json!({"action": "read", "path": "src/main.rs"}));
        assert!(!pm.is_dangerous("fs", Some(&read)));
    }

    #[test]
    fn test_accept_all_still_prompts_for_dangerous() {
        let mut pm = PermissionManager::new(OperationMode::Normal, None);
        pm.grant_all();

        let read = args(serde_json::json!({"action": "read"}));
        assert!(pm.should_auto_approve("fs", Some(&read)));

        let write = args(serde_json::json!({"action": "write", "path": "src/lib.rs"}));
        assert!(!pm.should_auto_approve("fs", Some(&write)));
    }

    #[test]
    fn test_deny_overrides_grant() {
        let mut pm = PermissionManager::new(OperationMode::Normal, None);
        pm.grant_tool("search");
        pm.deny_tool("search");
        assert!(pm.should_block("search"));
        assert!(!pm.should_auto_approve("search", None));
    }

    #[test]
    fn test_mode_gate() {
        let pm = PermissionManager::new(OperationMode::Read, None);
        let read = args(serde_json::json!({"action": "read"}));
        let write = args(serde_json::json!({"action": "write", "path": "x"}));

        assert!(pm.check_operation_mode("fs", Some(&read)).0);
        let (allowed, reason) = pm.check_operation_mode("fs", Some(&write));
        assert!(!allowed);
        assert!(reason.contains("READ mode"));

        let pm = PermissionManager::new(OperationMode::Plan, None);
        let (allowed, reason) = pm.check_operation_mode("fs", Some(&write));
        assert!(!allowed);
        assert!(reason.contains("Planned"));
    }

    #[test]
    fn test_unknown_tool_defaults_to_write() {
        let pm = PermissionManager::new(OperationMode::Read, None);
        assert!(pm.is_write_action("mystery", None));
        assert!(!pm.check_operation_mode("mystery", None).0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");

        let mut pm = PermissionManager::new(OperationMode::Normal, Some(path.clone()));
        pm.grant_tool("search");
        pm.deny_tool("term");
        assert!(pm.save());

        let mut restored = PermissionManager::new(OperationMode::Normal, Some(path));
        assert!(restored.load());
        assert!(restored.should_block("term"));
        assert!(restored.should_auto_approve("search", None));
    }
}
