//! Agent profile: identity, role tag and model preference

use serde::{Deserialize, Serialize};

use crate::types::AgentId;

/// An agent profile defines a distinct agent persona.
///
/// `role` is the short profile tag ("concierge", "librarian", ...) that seeds
/// the synthesized system prompt when no pre-bound instance exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Extra instructions appended after the role section
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: String::new(),
            model: None,
            system_prompt: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
