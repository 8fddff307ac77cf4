// src/lib.rs

// Import the top-level `fleetgate` module.
pub mod fleetgate;

// Re-exporting key items for easier external access.
pub use fleetgate::agent_loop::AgentLoop;
pub use fleetgate::backend::{Backend, ChatConfig, Message, Role, StreamEvent};
pub use fleetgate::config::GatewayConfig;
pub use fleetgate::engine::IterationEngine;
pub use fleetgate::error::GatewayError;
pub use fleetgate::registry::{BackendRegistry, BackendRouter};
pub use fleetgate::todo_md::TodoFile;
