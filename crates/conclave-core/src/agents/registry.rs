//! Agent registry: authoritative availability and busy/available toggling

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::execution::Agent;
use super::profile::AgentProfile;
use crate::types::AgentId;

/// Availability of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Available,
    Busy,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn can_accept_tasks(&self) -> bool {
        matches!(self, Self::Available)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Busy => write!(f, "busy"),
            Self::Offline => write!(f, "offline"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Registry entry for one agent
#[derive(Clone)]
pub struct RegisteredAgent {
    pub profile: AgentProfile,
    pub status: AgentStatus,
    /// Pre-bound local instance; when absent one is built through the factory
    pub instance: Option<Arc<dyn Agent>>,
}

impl RegisteredAgent {
    pub fn new(profile: AgentProfile) -> Self {
        Self {
            profile,
            status: AgentStatus::Available,
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: Arc<dyn Agent>) -> Self {
        self.instance = Some(instance);
        self
    }
}

impl std::fmt::Debug for RegisteredAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAgent")
            .field("profile", &self.profile)
            .field("status", &self.status)
            .field("instance", &self.instance.as_ref().map(|a| a.id().to_string()))
            .finish()
    }
}

/// Lookup and status updates for registered agents.
///
/// Implementations must tolerate concurrent readers and writers. Status reads
/// are not reservations: two callers may both observe `Available`.
pub trait AgentRegistry: Send + Sync {
    fn lookup(&self, id: &str) -> Option<RegisteredAgent>;

    /// Set an agent's status. Returns false if the agent is unknown.
    fn update_status(&self, id: &str, status: AgentStatus) -> bool;
}

/// In-memory registry backed by a concurrent map
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: DashMap<AgentId, RegisteredAgent>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an agent
    pub fn register(&self, agent: RegisteredAgent) {
        info!(
            "AgentRegistry: registered '{}' ({}){}",
            agent.profile.id,
            agent.profile.name,
            if agent.instance.is_some() {
                " with bound instance"
            } else {
                ""
            }
        );
        self.agents.insert(agent.profile.id.clone(), agent);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.agents.remove(id).is_some()
    }

    /// All registered agent ids, sorted
    pub fn list(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }

    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.agents.get(id).map(|e| e.status)
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn lookup(&self, id: &str) -> Option<RegisteredAgent> {
        self.agents.get(id).map(|e| e.value().clone())
    }

    fn update_status(&self, id: &str, status: AgentStatus) -> bool {
        match self.agents.get_mut(id) {
            Some(mut entry) => {
                debug!("AgentRegistry: '{}' {} -> {}", id, entry.status, status);
                entry.status = status;
                true
            }
            None => false,
        }
    }
}
