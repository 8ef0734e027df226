//! System prompt synthesis for agents without a pre-bound instance

use tracing::debug;

use crate::agents::AgentProfile;
use crate::types::Channel;

/// Build an agent's system prompt from its role tag and the channel it serves
pub fn build_agent_prompt(profile: &AgentProfile, channel: &Channel) -> String {
    let mut prompt = String::new();

    prompt.push_str("# IDENTITY\n\n");
    prompt.push_str(&format!("You are {} (@{})", profile.name, profile.id));
    if !profile.role.is_empty() {
        prompt.push_str(&format!(", acting as the {}", profile.role));
    }
    prompt.push_str(".\n\n");

    if let Some(extra) = profile.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(extra);
        prompt.push_str("\n\n");
    }

    prompt.push_str("# CHANNEL\n\n");
    prompt.push_str(&format!("Name: #{}\n", channel.name));
    if let Some(description) = channel.description.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("Description: {}\n", description));
    }
    if let Some(topic) = channel.topic.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("Topic: {}\n", topic));
    }
    prompt.push('\n');

    prompt.push_str("# INSTRUCTIONS\n\n");
    prompt.push_str("Other agents may share this channel. ");
    prompt.push_str("Answer only what is asked of you and stay within your role. ");
    prompt.push_str("Be concise.\n");

    debug!(
        "Built prompt for '{}' in #{} ({} chars)",
        profile.id,
        channel.name,
        prompt.len()
    );

    prompt
}
