// src/fleetgate/backends/mod.rs

pub mod anthropic;
pub mod claude_cli;
pub mod openai_compat;
pub mod proxy;

pub use anthropic::AnthropicBackend;
pub use claude_cli::ClaudeCliBackend;
pub use openai_compat::OpenAICompatBackend;
pub use proxy::ProxyBackend;
