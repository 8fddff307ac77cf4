//! Gateway configuration.
//!
//! [`GatewayConfig`] is constructed manually — no config-file parsing
//! dependencies are introduced.  [`GatewayConfig::from_env`] reads the same
//! environment variables the deployment scripts export, falling back to the
//! documented defaults.
//!
//! # Example
//!
//! ```rust
//! use fleetgate::GatewayConfig;
//!
//! let mut config = GatewayConfig::default();
//! config.backend_chain = vec!["openai-compat".into(), "proxy".into()];
//! config.failure_threshold = 5;
//! ```

use std::path::PathBuf;

/// Operation mode gating write-class tool actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// All tools allowed.
    Normal,
    /// Read-only actions proceed; write actions are recorded but not executed.
    Plan,
    /// Read-only actions proceed; write actions are refused.
    Read,
}

impl Default for OperationMode {
    fn default() -> Self {
        OperationMode::Normal
    }
}

impl OperationMode {
    /// Parse a mode name, defaulting to `Normal` for unknown input.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().trim() {
            "plan" => OperationMode::Plan,
            "read" => OperationMode::Read,
            _ => OperationMode::Normal,
        }
    }

    /// Lowercase identifier used in status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Normal => "normal",
            OperationMode::Plan => "plan",
            OperationMode::Read => "read",
        }
    }
}

/// Per-backend connection settings.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Base URL for HTTP backends (e.g. `http://127.0.0.1:1234/v1`).
    pub base_url: String,
    /// Default model identifier.
    pub model: String,
    /// API key, where the provider requires one.
    pub api_key: Option<String>,
    /// Context window assumed for the model when the provider does not
    /// report one.
    pub context_window: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            base_url: "http://127.0.0.1:1234/v1".to_string(),
            model: "mistralai/devstral-small-2-2512".to_string(),
            api_key: None,
            context_window: 32_000,
        }
    }
}

/// Top-level gateway configuration.
///
/// Groups the fallback chain, circuit-breaker thresholds, tool-loop limits,
/// and the on-disk layout used by the task engine.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Ordered fallback chain of backend names.
    pub backend_chain: Vec<String>,
    /// Settings for the local OpenAI-compatible backend.
    pub openai_compat: BackendSettings,
    /// Settings for the native Anthropic backend.
    pub anthropic: BackendSettings,
    /// Settings for the multi-provider proxy backend.
    pub proxy: BackendSettings,
    /// Settings for the CLI-wrapper backend.
    pub claude_cli: BackendSettings,

    /// Consecutive failures before a backend's circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe is allowed.
    pub cooldown_seconds: f64,
    /// Seconds a successful health probe stays cached.
    pub health_cache_ttl_seconds: f64,

    /// Per-request tool-call cap.  Clamped to `[1, 50]`; `0` disables the cap.
    pub max_tool_calls: usize,
    /// Stateless mode: reset history to system prompt + current user message
    /// each turn.
    pub stateless: bool,
    /// Fraction of the context window that triggers auto-compaction.
    pub compact_threshold: f64,
    /// Messages always kept verbatim when compacting.
    pub keep_recent_messages: usize,
    /// User turns between system-prompt context refreshes.
    pub context_refresh_interval: usize,
    /// Operation mode for this session.
    pub operation_mode: OperationMode,

    /// Whether this session holds the leader role.  Workers are refused the
    /// human-in-the-loop tools.
    pub is_leader: bool,

    /// Path to the todo.md source of truth.
    pub todo_path: PathBuf,
    /// Root directory for evidence packs.
    pub evidence_root: PathBuf,
    /// Root directory for checkpoints, pause states, and iteration archives.
    pub checkpoint_root: PathBuf,
    /// Project root used to resolve relative tool paths.
    pub project_root: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            backend_chain: vec!["openai-compat".to_string(), "proxy".to_string()],
            openai_compat: BackendSettings::default(),
            anthropic: BackendSettings {
                base_url: "https://api.anthropic.com".to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                api_key: None,
                context_window: 200_000,
            },
            proxy: BackendSettings {
                base_url: "http://127.0.0.1:8317/v1".to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                api_key: Some("fleetgate-local".to_string()),
                context_window: 200_000,
            },
            claude_cli: BackendSettings {
                base_url: String::new(),
                model: "claude-sonnet-4-20250514".to_string(),
                api_key: None,
                context_window: 200_000,
            },
            failure_threshold: 3,
            cooldown_seconds: 60.0,
            health_cache_ttl_seconds: 30.0,
            max_tool_calls: 25,
            stateless: false,
            compact_threshold: 0.75,
            keep_recent_messages: 6,
            context_refresh_interval: 10,
            operation_mode: OperationMode::Normal,
            is_leader: true,
            todo_path: PathBuf::from("ai/todo.md"),
            evidence_root: PathBuf::from("ai/evidence"),
            checkpoint_root: PathBuf::from("ai/checkpoints"),
            project_root: PathBuf::from("."),
        }
    }
}

impl GatewayConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Recognised variables: `FLEETGATE_BACKENDS` (comma-separated chain),
    /// `FLEETGATE_MAX_TOOL_CALLS`, `FLEETGATE_FALLBACK_THRESHOLD`,
    /// `FLEETGATE_FALLBACK_COOLDOWN`, `FLEETGATE_HEALTH_CACHE_TTL`,
    /// `FLEETGATE_LOCAL_BASE_URL`, `FLEETGATE_LOCAL_MODEL`,
    /// `FLEETGATE_PROXY_URL`, `FLEETGATE_PROXY_MODEL`,
    /// `ANTHROPIC_API_KEY`, `FLEETGATE_CLAUDE_MODEL`, `FLEETGATE_TODO_PATH`.
    pub fn from_env() -> Self {
        let mut config = GatewayConfig::default();

        if let Ok(raw) = std::env::var("FLEETGATE_BACKENDS") {
            let chain: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !chain.is_empty() {
                config.backend_chain = chain;
            }
        }
        if let Ok(raw) = std::env::var("FLEETGATE_MAX_TOOL_CALLS") {
            if let Ok(v) = raw.trim().parse::<usize>() {
                config.max_tool_calls = v;
            }
        }
        if let Ok(raw) = std::env::var("FLEETGATE_FALLBACK_THRESHOLD") {
            if let Ok(v) = raw.trim().parse::<u32>() {
                config.failure_threshold = v;
            }
        }
        if let Ok(raw) = std::env::var("FLEETGATE_FALLBACK_COOLDOWN") {
            if let Ok(v) = raw.trim().parse::<f64>() {
                config.cooldown_seconds = v;
            }
        }
        if let Ok(raw) = std::env::var("FLEETGATE_HEALTH_CACHE_TTL") {
            if let Ok(v) = raw.trim().parse::<f64>() {
                config.health_cache_ttl_seconds = v;
            }
        }
        if let Ok(url) = std::env::var("FLEETGATE_LOCAL_BASE_URL") {
            config.openai_compat.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("FLEETGATE_LOCAL_MODEL") {
            config.openai_compat.model = model;
        }
        if let Ok(url) = std::env::var("FLEETGATE_PROXY_URL") {
            config.proxy.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("FLEETGATE_PROXY_MODEL") {
            config.proxy.model = model;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.anthropic.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("FLEETGATE_CLAUDE_MODEL") {
            config.anthropic.model = model.clone();
            config.claude_cli.model = model;
        }
        if let Ok(path) = std::env::var("FLEETGATE_TODO_PATH") {
            config.todo_path = PathBuf::from(path);
        }

        config
    }

    /// Effective tool-call cap: clamped to `[1, 50]`, `0` = unlimited.
    pub fn effective_max_tool_calls(&self) -> usize {
        if self.max_tool_calls == 0 {
            0
        } else {
            self.max_tool_calls.max(1).min(50)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_tool_calls_clamping() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.effective_max_tool_calls(), 25);

        config.max_tool_calls = 0;
        assert_eq!(config.effective_max_tool_calls(), 0);

        config.max_tool_calls = 120;
        assert_eq!(config.effective_max_tool_calls(), 50);
    }

    #[test]
    fn test_operation_mode_parse() {
        assert_eq!(OperationMode::parse("PLAN"), OperationMode::Plan);
        assert_eq!(OperationMode::parse("read"), OperationMode::Read);
        assert_eq!(OperationMode::parse("bogus"), OperationMode::Normal);
    }
}
