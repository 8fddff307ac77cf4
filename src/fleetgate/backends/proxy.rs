//! Multi-provider CLI proxy backend.
//!
//! Fronts a local proxy daemon that wraps several vendor CLIs behind one
//! OpenAI-compatible surface (Claude Code, Codex, Gemini CLI, Qwen Code,
//! Copilot, Kiro, Antigravity).  The HTTP plumbing is delegated to
//! [`OpenAICompatBackend`]; this wrapper adds the bearer token the proxy
//! expects and the per-model-family heuristics that decide whether a given
//! model can take native tools.

use async_trait::async_trait;

use crate::fleetgate::backend::{
    Backend, BackendHealth, ChatConfig, EventStream, Message,
};
use crate::fleetgate::backends::openai_compat::OpenAICompatBackend;

/// Model family detected from a model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    OpenAI,
    Gemini,
    Qwen,
    Copilot,
    Kiro,
    Antigravity,
    DeepSeek,
    Other,
}

impl ModelFamily {
    /// Lowercase identifier used in health payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::OpenAI => "openai",
            ModelFamily::Gemini => "gemini",
            ModelFamily::Qwen => "qwen",
            ModelFamily::Copilot => "copilot",
            ModelFamily::Kiro => "kiro",
            ModelFamily::Antigravity => "antigravity",
            ModelFamily::DeepSeek => "deepseek",
            ModelFamily::Other => "other",
        }
    }

    /// Name of the CLI tool the proxy wraps for this family.
    pub fn wrapped_cli(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude-code",
            ModelFamily::OpenAI => "chatgpt-codex",
            ModelFamily::Gemini => "gemini-cli",
            ModelFamily::Qwen => "qwen-code",
            ModelFamily::Copilot => "github-copilot",
            ModelFamily::Kiro => "kiro-codewhisperer",
            ModelFamily::Antigravity => "antigravity",
            ModelFamily::DeepSeek => "deepseek",
            ModelFamily::Other => "unknown",
        }
    }
}

/// Detect the model family from a model identifier.
pub fn model_family(model: &str) -> ModelFamily {
    let model_id = model.to_ascii_lowercase();

    // Kiro models (AWS CodeWhisperer) before the generic checks.
    if model_id.starts_with("kiro-")
        || model_id.contains("codewhisperer")
        || model_id.contains("amazon-q")
    {
        return ModelFamily::Kiro;
    }
    // Antigravity hybrids must win over both "gemini-" and "claude".
    if model_id.starts_with("gemini-claude-")
        || model_id.contains("antigravity")
        || model_id == "tab_flash_lite_preview"
        || model_id == "gpt-oss-120b-medium"
    {
        return ModelFamily::Antigravity;
    }
    if model_id.contains("claude") {
        return ModelFamily::Claude;
    }
    if model_id.starts_with("gemini-") {
        return ModelFamily::Gemini;
    }
    if model_id.contains("gpt") || model_id.starts_with("o1") || model_id.starts_with("o3") {
        return ModelFamily::OpenAI;
    }
    if model_id.contains("copilot")
        || model_id == "grok-code-fast-1"
        || model_id == "oswe-vscode-prime"
    {
        return ModelFamily::Copilot;
    }
    if model_id.contains("qwen") {
        return ModelFamily::Qwen;
    }
    if model_id.contains("deepseek") {
        return ModelFamily::DeepSeek;
    }
    ModelFamily::Other
}

/// Whether a proxied model supports native tool calling.
///
/// Reasoning-only models (`o1*`) and purely proxied families are marked
/// non-native; Kiro only in its agentic mode.
pub fn proxy_model_supports_tools(model: &str) -> bool {
    let model_id = model.to_ascii_lowercase();
    match model_family(&model_id) {
        ModelFamily::Claude | ModelFamily::Gemini | ModelFamily::Copilot => true,
        ModelFamily::OpenAI => !(model_id.starts_with("o1-") || model_id == "o1"),
        ModelFamily::Kiro => model_id.contains("agentic"),
        ModelFamily::Antigravity
        | ModelFamily::Qwen
        | ModelFamily::DeepSeek
        | ModelFamily::Other => false,
    }
}

/// Multi-provider proxy backend.
pub struct ProxyBackend {
    inner: OpenAICompatBackend,
    default_model: String,
}

impl ProxyBackend {
    /// Create a proxy backend.  `bearer_token` defaults to the proxy's
    /// loopback credential when `None`.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        bearer_token: Option<String>,
    ) -> Self {
        let model = model.into();
        let token = bearer_token.unwrap_or_else(|| "fleetgate-local".to_string());
        ProxyBackend {
            inner: OpenAICompatBackend::new(base_url, model.clone())
                .with_bearer_token(token)
                .with_name("proxy"),
            default_model: model,
        }
    }
}

#[async_trait]
impl Backend for ProxyBackend {
    fn name(&self) -> &str {
        "proxy"
    }

    fn supports_native_tools(&self) -> bool {
        proxy_model_supports_tools(&self.default_model)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    fn stream_chat(&self, messages: Vec<Message>, config: ChatConfig) -> EventStream {
        // When the target model cannot take native tools, drop them from the
        // request; the driver has already inlined the schemas textually.
        let mut config = config;
        let model = if config.model.is_empty() {
            &self.default_model
        } else {
            &config.model
        };
        if !proxy_model_supports_tools(model) {
            config.tools.clear();
        }
        self.inner.stream_chat(messages, config)
    }

    async fn health_check(&self) -> BackendHealth {
        let mut health = self.inner.health_check().await;
        health.backend = self.name().to_string();
        if health.ok {
            let family = model_family(&self.default_model);
            health.detail.insert(
                "model_family".to_string(),
                serde_json::Value::String(family.as_str().to_string()),
            );
            health.detail.insert(
                "wrapped_cli".to_string(),
                serde_json::Value::String(family.wrapped_cli().to_string()),
            );
            health.detail.insert(
                "supports_tools".to_string(),
                serde_json::Value::Bool(self.supports_native_tools()),
            );
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_family_detection() {
        assert_eq!(model_family("claude-sonnet-4-20250514"), ModelFamily::Claude);
        assert_eq!(model_family("gemini-claude-sonnet-4-5-thinking"), ModelFamily::Antigravity);
        assert_eq!(model_family("gemini-2.5-pro"), ModelFamily::Gemini);
        assert_eq!(model_family("kiro-claude-opus-4-5"), ModelFamily::Kiro);
        assert_eq!(model_family("gpt-5-codex"), ModelFamily::OpenAI);
        assert_eq!(model_family("grok-code-fast-1"), ModelFamily::Copilot);
        assert_eq!(model_family("qwen-coder-32b"), ModelFamily::Qwen);
        assert_eq!(model_family("mystery-model"), ModelFamily::Other);
    }

    #[test]
    fn test_reasoning_models_are_not_native() {
        assert!(!proxy_model_supports_tools("o1"));
        assert!(!proxy_model_supports_tools("o1-preview"));
        assert!(proxy_model_supports_tools("gpt-5"));
        assert!(proxy_model_supports_tools("claude-opus-4-5-20251101"));
        assert!(!proxy_model_supports_tools("kiro-auto"));
        assert!(proxy_model_supports_tools("kiro-claude-sonnet-4-5-agentic"));
    }
}
