//! conclave-core - Agent dispatch for multi-agent channels
//!
//! This crate provides:
//! - Provider selection across on-device, local-server and cloud backends
//! - Agent profiles, a status registry and the agent execution contract
//! - Channel orchestration: target selection, dispatch and cancellable executions
//! - Mention parsing and system prompt synthesis

pub mod agents;
pub mod context;
pub mod error;
pub mod events;
pub mod mentions;
pub mod orchestrator;
pub mod providers;
pub mod types;

// Re-export main types for convenience
pub use agents::{
    Agent, AgentConfiguration, AgentFactory, AgentProfile, AgentRegistry, AgentStatus, AgentTask,
    ExecutionEvent, ExecutionStream, InMemoryAgentRegistry, RegisteredAgent,
};
pub use context::build_agent_prompt;
pub use error::DispatchError;
pub use events::{BroadcastEventBus, EventBus, RuntimeEvent};
pub use mentions::parse_mentions;
pub use orchestrator::{ChannelAgentConfig, ChannelOrchestrator, MessageHandler, StreamHandler};
pub use providers::{
    LlmProvider, ProviderHandle, ProviderKind, ProviderSelector, ProviderStatus, SelectorConfig,
};
pub use types::{AgentId, Channel, ChannelId, ChannelMessage, MessageRole};
