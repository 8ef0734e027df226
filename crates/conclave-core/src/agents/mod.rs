//! Agents: profiles, the execution contract and the registry
//!
//! The orchestrator only talks to agents through [`Agent`] and to their
//! availability through [`AgentRegistry`]; concrete agents live elsewhere.

pub mod execution;
pub mod profile;
pub mod registry;

pub use execution::{
    Agent, AgentConfiguration, AgentFactory, AgentTask, ExecutionEvent, ExecutionStream,
};
pub use profile::AgentProfile;
pub use registry::{AgentRegistry, AgentStatus, InMemoryAgentRegistry, RegisteredAgent};
