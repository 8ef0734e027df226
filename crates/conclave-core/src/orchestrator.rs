//! Channel orchestration
//!
//! Decides which agents answer a channel message, resolves a backend and an
//! instance for each of them, and supervises their concurrent, cancellable
//! executions. Per-target failures are reported in the channel and never
//! affect the other targets.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{
    Agent, AgentConfiguration, AgentFactory, AgentRegistry, AgentStatus, AgentTask,
    ExecutionEvent,
};
use crate::context::build_agent_prompt;
use crate::error::DispatchError;
use crate::events::{EventBus, RuntimeEvent};
use crate::mentions::parse_mentions;
use crate::providers::ProviderSelector;
use crate::types::{AgentId, Channel, ChannelId, ChannelMessage};

/// Receives every message posted to a channel
pub type MessageHandler = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// Receives every execution event of one `handle_message` call, per agent, in order
pub type StreamHandler = Arc<dyn Fn(&str, &ExecutionEvent) + Send + Sync>;

/// Which agents live in a channel and how they are triggered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelAgentConfig {
    pub channel_id: ChannelId,
    pub all_agents: BTreeSet<AgentId>,
    /// Respond to every message
    pub always_respond: BTreeSet<AgentId>,
    /// Respond only when mentioned
    pub mention_only: BTreeSet<AgentId>,
}

/// One tracked agent execution
struct ActiveExecution {
    agent_id: AgentId,
    cancel: CancellationToken,
}

/// State shared between the orchestrator and its spawned executions
struct Shared {
    registry: Arc<dyn AgentRegistry>,
    events: Arc<dyn EventBus>,
    providers: Arc<ProviderSelector>,
    factory: AgentFactory,
    configs: RwLock<HashMap<ChannelId, ChannelAgentConfig>>,
    handlers: RwLock<HashMap<ChannelId, MessageHandler>>,
    /// channel id -> task id -> execution
    active: Mutex<HashMap<ChannelId, HashMap<String, ActiveExecution>>>,
}

/// Routes channel messages to agents and supervises their executions
pub struct ChannelOrchestrator {
    shared: Arc<Shared>,
}

impl ChannelOrchestrator {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        events: Arc<dyn EventBus>,
        providers: Arc<ProviderSelector>,
        factory: AgentFactory,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                events,
                providers,
                factory,
                configs: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create or replace a channel's agent configuration.
    ///
    /// Members of `always_respond` and `mention_only` are also members of the channel.
    pub fn configure_channel(
        &self,
        channel_id: impl Into<ChannelId>,
        agents: impl IntoIterator<Item = AgentId>,
        always_respond: impl IntoIterator<Item = AgentId>,
        mention_only: impl IntoIterator<Item = AgentId>,
    ) {
        let channel_id = channel_id.into();
        let always_respond: BTreeSet<AgentId> = always_respond.into_iter().collect();
        let mention_only: BTreeSet<AgentId> = mention_only.into_iter().collect();
        let mut all_agents: BTreeSet<AgentId> = agents.into_iter().collect();
        all_agents.extend(always_respond.iter().cloned());
        all_agents.extend(mention_only.iter().cloned());

        info!(
            "Channel {}: {} agents ({} always respond, {} mention only)",
            channel_id,
            all_agents.len(),
            always_respond.len(),
            mention_only.len()
        );

        let config = ChannelAgentConfig {
            channel_id: channel_id.clone(),
            all_agents,
            always_respond,
            mention_only,
        };
        self.shared.configs.write().insert(channel_id, config);
    }

    pub fn channel_config(&self, channel_id: &str) -> Option<ChannelAgentConfig> {
        self.shared.configs.read().get(channel_id).cloned()
    }

    /// Forget a channel entirely, cancelling its executions
    pub fn remove_channel(&self, channel_id: &str) {
        self.cancel_all_tasks(channel_id);
        self.shared.configs.write().remove(channel_id);
        self.shared.handlers.write().remove(channel_id);
    }

    pub fn set_message_handler(&self, channel_id: impl Into<ChannelId>, handler: MessageHandler) {
        self.shared.handlers.write().insert(channel_id.into(), handler);
    }

    pub fn remove_message_handler(&self, channel_id: &str) {
        self.shared.handlers.write().remove(channel_id);
    }

    /// Decide which agents respond to `message`, sorted by id.
    ///
    /// Explicit mentions always qualify; `always_respond` members are added;
    /// with nobody selected the first channel member is used. Agents that
    /// cannot accept tasks right now are dropped.
    pub fn select_targets(&self, message: &ChannelMessage) -> Vec<AgentId> {
        let config = self.channel_config(&message.channel_id);

        let mut candidates = parse_mentions(&message.content);
        candidates.extend(message.mentions.iter().cloned());

        if let Some(config) = &config {
            candidates.extend(config.always_respond.iter().cloned());
            if candidates.is_empty() {
                let fallback = config
                    .all_agents
                    .iter()
                    .find(|id| !config.mention_only.contains(*id));
                if let Some(first) = fallback {
                    debug!(
                        "Channel {}: no mention or always-respond match, falling back to '{}'",
                        message.channel_id, first
                    );
                    candidates.insert(first.clone());
                }
            }
        }

        candidates
            .into_iter()
            .filter(|id| match self.shared.registry.lookup(id) {
                Some(entry) if entry.status.can_accept_tasks() => true,
                Some(entry) => {
                    info!(
                        "Channel {}: skipping '{}' ({})",
                        message.channel_id, id, entry.status
                    );
                    false
                }
                None => {
                    info!(
                        "Channel {}: skipping '{}' (not registered)",
                        message.channel_id, id
                    );
                    false
                }
            })
            .collect()
    }

    /// Route a message to its targets and launch their executions.
    ///
    /// Returns the selected targets. Each target is dispatched independently;
    /// a failure for one is reported in the channel and does not stop the rest.
    pub async fn handle_message(
        &self,
        message: &ChannelMessage,
        channel: &Channel,
        stream_handler: Option<StreamHandler>,
    ) -> Vec<AgentId> {
        let targets = self.select_targets(message);
        if targets.is_empty() {
            debug!("Channel {}: no agents selected", message.channel_id);
            return targets;
        }
        info!(
            "Channel {}: dispatching to [{}]",
            message.channel_id,
            targets.join(", ")
        );

        for agent_id in &targets {
            if let Err(e) = self
                .dispatch(agent_id, message, channel, stream_handler.clone())
                .await
            {
                warn!("Channel {}: '{}' not dispatched: {}", message.channel_id, e.agent_id(), e);
            }
        }
        targets
    }

    async fn dispatch(
        &self,
        agent_id: &AgentId,
        message: &ChannelMessage,
        channel: &Channel,
        stream_handler: Option<StreamHandler>,
    ) -> Result<(), DispatchError> {
        let shared = &self.shared;
        let channel_id = message.channel_id.clone();

        let entry = shared
            .registry
            .lookup(agent_id)
            .ok_or_else(|| DispatchError::AgentNotFound(agent_id.clone()))?;

        let Some(provider) = shared.providers.select_provider().await else {
            shared.post(
                &channel_id,
                ChannelMessage::system(
                    &channel_id,
                    format!("No provider available for @{}", agent_id),
                ),
            );
            return Err(DispatchError::NoProviderAvailable(agent_id.clone()));
        };

        let agent: Arc<dyn Agent> = match entry.instance {
            Some(instance) => instance,
            None => {
                let config = AgentConfiguration {
                    agent_id: agent_id.clone(),
                    name: entry.profile.name.clone(),
                    system_prompt: build_agent_prompt(&entry.profile, channel),
                    model: entry
                        .profile
                        .model
                        .clone()
                        .or_else(|| Some(provider.model().to_string())),
                    provider,
                };
                (shared.factory)(agent_id, config).map_err(|source| {
                    DispatchError::AgentCreationFailed {
                        agent_id: agent_id.clone(),
                        source,
                    }
                })?
            }
        };

        // Not reserved atomically: a concurrent dispatch may also have seen Available.
        shared.registry.update_status(agent_id, AgentStatus::Busy);

        let task = AgentTask::from_message(message);
        let task_id = task.id.clone();
        let cancel = CancellationToken::new();
        shared.active.lock().entry(channel_id.clone()).or_default().insert(
            task_id.clone(),
            ActiveExecution {
                agent_id: agent_id.clone(),
                cancel: cancel.clone(),
            },
        );

        let shared = Arc::clone(shared);
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            shared
                .run_execution(agent, &agent_id, task, cancel, stream_handler)
                .await;
            shared.registry.update_status(&agent_id, AgentStatus::Available);
            shared.untrack(&channel_id, &task_id);
            debug!("Channel {}: '{}' finished task {}", channel_id, agent_id, task_id);
        });

        Ok(())
    }

    /// Signal every execution in a channel to stop and stop tracking them
    pub fn cancel_all_tasks(&self, channel_id: &str) {
        let removed = self.shared.active.lock().remove(channel_id);
        if let Some(executions) = removed {
            info!(
                "Channel {}: cancelling {} executions",
                channel_id,
                executions.len()
            );
            for (task_id, execution) in executions {
                debug!("Cancelling '{}' task {}", execution.agent_id, task_id);
                execution.cancel.cancel();
            }
        }
    }

    /// Cancel every execution in every channel
    pub fn shutdown(&self) {
        let channels: Vec<ChannelId> = self.shared.active.lock().keys().cloned().collect();
        for channel_id in channels {
            self.cancel_all_tasks(&channel_id);
        }
    }

    /// Tracked executions across all channels
    pub fn active_task_count(&self) -> usize {
        self.shared.active.lock().values().map(HashMap::len).sum()
    }

    pub fn active_task_count_for(&self, channel_id: &str) -> usize {
        self.shared
            .active
            .lock()
            .get(channel_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

impl Shared {
    /// Deliver a message to the channel's handler, if one is registered
    fn post(&self, channel_id: &str, message: ChannelMessage) {
        let handler = self.handlers.read().get(channel_id).cloned();
        match handler {
            Some(handler) => handler(message),
            None => debug!("Channel {}: no message handler, dropping message", channel_id),
        }
    }

    fn post_agent_message(&self, channel_id: &str, agent_id: &str, content: String) {
        let message = ChannelMessage::assistant(channel_id, agent_id, content);
        self.post(channel_id, message.clone());
        self.events.emit(RuntimeEvent::AgentResponded {
            channel_id: channel_id.to_string(),
            agent_id: agent_id.to_string(),
            message,
        });
    }

    fn report_failure(&self, channel_id: &str, agent_id: &str, error: String) {
        self.post(
            channel_id,
            ChannelMessage::system(channel_id, format!("@{} failed: {}", agent_id, error)),
        );
        self.events.emit(RuntimeEvent::AgentFailed {
            channel_id: channel_id.to_string(),
            agent_id: agent_id.to_string(),
            error,
        });
    }

    fn untrack(&self, channel_id: &str, task_id: &str) {
        let mut active = self.active.lock();
        if let Some(executions) = active.get_mut(channel_id) {
            executions.remove(task_id);
            if executions.is_empty() {
                active.remove(channel_id);
            }
        }
    }

    /// Consume one agent's event stream until it ends, fails or is cancelled
    async fn run_execution(
        &self,
        agent: Arc<dyn Agent>,
        agent_id: &str,
        task: AgentTask,
        cancel: CancellationToken,
        stream_handler: Option<StreamHandler>,
    ) {
        let channel_id = task.channel_id.clone();

        let started = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("'{}' cancelled before starting", agent_id);
                return;
            }
            result = agent.execute(task, cancel.clone()) => result,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(source) => {
                let err = DispatchError::Execution {
                    agent_id: agent_id.to_string(),
                    source,
                };
                warn!("Channel {}: {}", channel_id, err);
                self.report_failure(&channel_id, agent_id, format!("{:#}", err));
                return;
            }
        };

        let mut buffer = String::new();
        let mut posted_message = false;
        let mut terminated = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("'{}' execution cancelled", agent_id);
                    break;
                }
                next = stream.next() => match next {
                    Some(event) => event,
                    None => {
                        if !terminated && !buffer.trim().is_empty() {
                            warn!(
                                "Channel {}: '{}' stream ended without completing, dropping {} buffered bytes",
                                channel_id, agent_id, buffer.len()
                            );
                        } else {
                            debug!("'{}' stream ended", agent_id);
                        }
                        break;
                    }
                },
            };
            terminated = event.is_terminal();

            if let Some(handler) = &stream_handler {
                handler(agent_id, &event);
            }

            match event {
                ExecutionEvent::TextDelta { text } => buffer.push_str(&text),
                ExecutionEvent::Message { content } => {
                    posted_message = true;
                    self.post_agent_message(&channel_id, agent_id, content);
                }
                ExecutionEvent::Completed => {
                    if !posted_message && !buffer.trim().is_empty() {
                        self.post_agent_message(&channel_id, agent_id, std::mem::take(&mut buffer));
                    }
                }
                ExecutionEvent::Failed { error } => {
                    warn!("Channel {}: '{}' reported failure: {}", channel_id, agent_id, error);
                    self.report_failure(&channel_id, agent_id, error);
                }
                ExecutionEvent::ToolCall { name, .. } => {
                    debug!("'{}' requested tool '{}'", agent_id, name);
                }
            }

            if terminated {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{
        ExecutionStream, InMemoryAgentRegistry, AgentProfile, RegisteredAgent,
    };
    use crate::events::BroadcastEventBus;
    use crate::providers::{
        LlmProvider, ProviderFactory, ProviderHandle, ProviderKind, SelectorConfig,
    };
    use crate::types::MessageRole;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Always-or-never available backend
    struct StaticProvider {
        available: bool,
    }

    #[async_trait]
    impl LlmProvider for StaticProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Ollama
        }
        fn provider_name(&self) -> &str {
            "static"
        }
        fn model(&self) -> &str {
            "static-model"
        }
        async fn is_available(&self) -> bool {
            self.available
        }
    }

    struct StaticFactory {
        available: bool,
    }

    impl ProviderFactory for StaticFactory {
        fn create(&self, _kind: ProviderKind, _config: &SelectorConfig) -> ProviderHandle {
            Arc::new(StaticProvider {
                available: self.available,
            })
        }
    }

    fn selector(available: bool) -> Arc<ProviderSelector> {
        let config = SelectorConfig {
            preferred_order: vec![ProviderKind::Ollama],
            ..SelectorConfig::default()
        };
        Arc::new(ProviderSelector::with_factory(
            config,
            Arc::new(StaticFactory { available }),
        ))
    }

    /// Agent that replays a fixed list of events
    struct ScriptedAgent {
        id: String,
        events: Vec<ExecutionEvent>,
        /// Never finish after the scripted events
        hang: bool,
        fail_to_start: bool,
    }

    impl ScriptedAgent {
        fn new(id: &str, events: Vec<ExecutionEvent>) -> Self {
            Self {
                id: id.to_string(),
                events,
                hang: false,
                fail_to_start: false,
            }
        }

        fn hanging(id: &str) -> Self {
            Self {
                hang: true,
                ..Self::new(id, vec![ExecutionEvent::TextDelta { text: "thinking".into() }])
            }
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(
            &self,
            _task: AgentTask,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ExecutionStream> {
            if self.fail_to_start {
                anyhow::bail!("model not loaded");
            }
            let events = stream::iter(self.events.clone());
            if self.hang {
                Ok(Box::pin(events.chain(stream::pending())))
            } else {
                Ok(Box::pin(events))
            }
        }
    }

    fn reply(text: &str) -> Vec<ExecutionEvent> {
        vec![
            ExecutionEvent::TextDelta { text: text.to_string() },
            ExecutionEvent::Completed,
        ]
    }

    struct Harness {
        orchestrator: ChannelOrchestrator,
        registry: Arc<InMemoryAgentRegistry>,
        bus: BroadcastEventBus,
        factory_calls: Arc<AtomicUsize>,
    }

    /// Every agent created by the factory answers "ok from <id>"
    fn harness_with(provider_available: bool, failing: &'static [&'static str]) -> Harness {
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let bus = BroadcastEventBus::new(64);
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let calls = factory_calls.clone();
        let factory: AgentFactory = Arc::new(move |id: &AgentId, _config: AgentConfiguration| {
            calls.fetch_add(1, Ordering::SeqCst);
            if failing.contains(&id.as_str()) {
                anyhow::bail!("no weights for {}", id);
            }
            let agent: Arc<dyn Agent> =
                Arc::new(ScriptedAgent::new(id, reply(&format!("ok from {}", id))));
            Ok(agent)
        });
        let orchestrator = ChannelOrchestrator::new(
            registry.clone(),
            Arc::new(bus.clone()),
            selector(provider_available),
            factory,
        );
        Harness {
            orchestrator,
            registry,
            bus,
            factory_calls,
        }
    }

    fn harness() -> Harness {
        harness_with(true, &[])
    }

    fn register(registry: &InMemoryAgentRegistry, ids: &[&str]) {
        for id in ids {
            registry.register(RegisteredAgent::new(
                AgentProfile::new(*id, *id).with_role(*id),
            ));
        }
    }

    fn collect_messages(
        orchestrator: &ChannelOrchestrator,
        channel_id: &str,
    ) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        orchestrator.set_message_handler(
            channel_id,
            Arc::new(move |msg: ChannelMessage| {
                let _ = tx.send(msg);
            }),
        );
        rx
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<ChannelMessage>) -> ChannelMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for channel message")
            .expect("message handler dropped")
    }

    async fn wait_idle(orchestrator: &ChannelOrchestrator) {
        for _ in 0..200 {
            if orchestrator.active_task_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("executions did not finish");
    }

    fn ids(items: &[&str]) -> Vec<AgentId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_configure_channel_normalizes_membership() {
        let h = harness();
        h.orchestrator.configure_channel(
            "general",
            ids(&["scout"]),
            ids(&["concierge"]),
            ids(&["librarian"]),
        );
        let config = h.orchestrator.channel_config("general").unwrap();
        assert_eq!(config.channel_id, "general");
        assert_eq!(
            config.all_agents.iter().cloned().collect::<Vec<_>>(),
            ids(&["concierge", "librarian", "scout"])
        );
        assert!(h.orchestrator.channel_config("other").is_none());
    }

    #[test]
    fn test_always_respond_selected_when_available() {
        let h = harness();
        register(&h.registry, &["a", "b"]);
        h.orchestrator
            .configure_channel("c", ids(&["a", "b"]), ids(&["a"]), Vec::new());

        let msg = ChannelMessage::user("c", "user", "hello there");
        assert_eq!(h.orchestrator.select_targets(&msg), ids(&["a"]));

        h.registry.update_status("a", AgentStatus::Busy);
        assert!(h.orchestrator.select_targets(&msg).is_empty());
    }

    #[test]
    fn test_mention_overrides_mention_only() {
        let h = harness();
        register(&h.registry, &["concierge", "librarian"]);
        h.orchestrator.configure_channel(
            "c",
            Vec::new(),
            ids(&["concierge"]),
            ids(&["librarian"]),
        );

        let msg = ChannelMessage::user("c", "user", "@librarian summarize");
        assert_eq!(
            h.orchestrator.select_targets(&msg),
            ids(&["concierge", "librarian"])
        );

        let msg = ChannelMessage::user("c", "user", "good morning");
        assert_eq!(h.orchestrator.select_targets(&msg), ids(&["concierge"]));
    }

    #[test]
    fn test_falls_back_to_first_member() {
        let h = harness();
        register(&h.registry, &["beta", "alpha"]);
        h.orchestrator
            .configure_channel("c", ids(&["beta", "alpha"]), Vec::new(), Vec::new());

        let msg = ChannelMessage::user("c", "user", "anyone?");
        assert_eq!(h.orchestrator.select_targets(&msg), ids(&["alpha"]));
    }

    #[test]
    fn test_fallback_skips_mention_only_members() {
        let h = harness();
        register(&h.registry, &["alpha", "beta"]);
        h.orchestrator
            .configure_channel("c", Vec::new(), Vec::new(), ids(&["alpha", "beta"]));
        h.orchestrator
            .configure_channel("d", ids(&["beta"]), Vec::new(), ids(&["alpha"]));

        let msg = ChannelMessage::user("d", "user", "anyone?");
        assert_eq!(h.orchestrator.select_targets(&msg), ids(&["beta"]));

        let msg = ChannelMessage::user("c", "user", "anyone?");
        assert!(h.orchestrator.select_targets(&msg).is_empty());
    }

    #[test]
    fn test_preparsed_mentions_are_merged() {
        let h = harness();
        register(&h.registry, &["bob", "alice-2", "carol"]);
        let msg = ChannelMessage::user("c", "user", "@bob please fix @alice-2 too")
            .with_mentions(ids(&["carol"]));
        assert_eq!(
            h.orchestrator.select_targets(&msg),
            ids(&["alice-2", "bob", "carol"])
        );
    }

    #[test]
    fn test_unregistered_and_unavailable_mentions_are_dropped() {
        let h = harness();
        register(&h.registry, &["bob", "offline"]);
        h.registry.update_status("offline", AgentStatus::Offline);
        let msg = ChannelMessage::user("c", "user", "@bob @ghost @offline");
        assert_eq!(h.orchestrator.select_targets(&msg), ids(&["bob"]));
    }

    #[test]
    fn test_unconfigured_channel_without_mentions_selects_nobody() {
        let h = harness();
        register(&h.registry, &["bob"]);
        let msg = ChannelMessage::user("nowhere", "user", "hello");
        assert!(h.orchestrator.select_targets(&msg).is_empty());
    }

    #[tokio::test]
    async fn test_text_deltas_posted_on_completion() {
        let h = harness();
        register(&h.registry, &["scout"]);
        let mut rx = collect_messages(&h.orchestrator, "c");
        let mut events = h.bus.subscribe();

        let msg = ChannelMessage::user("c", "user", "@scout go");
        let targets = h
            .orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), None)
            .await;
        assert_eq!(targets, ids(&["scout"]));

        let posted = next_message(&mut rx).await;
        assert_eq!(posted.role, MessageRole::Assistant);
        assert_eq!(posted.sender, "scout");
        assert_eq!(posted.content, "ok from scout");

        match events.recv().await.unwrap() {
            RuntimeEvent::AgentResponded { agent_id, message, .. } => {
                assert_eq!(agent_id, "scout");
                assert_eq!(message.content, "ok from scout");
            }
            other => panic!("unexpected event {:?}", other),
        }

        wait_idle(&h.orchestrator).await;
        assert_eq!(h.registry.status("scout"), Some(AgentStatus::Available));
        assert_eq!(h.factory_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_message_event_posts_immediately_without_duplicate() {
        let h = harness();
        let agent = ScriptedAgent::new(
            "scout",
            vec![
                ExecutionEvent::TextDelta { text: "draft".into() },
                ExecutionEvent::Message { content: "final answer".into() },
                ExecutionEvent::ToolCall {
                    name: "search".into(),
                    input: serde_json::json!({"q": "x"}),
                },
                ExecutionEvent::Completed,
            ],
        );
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("scout", "Scout")).with_instance(Arc::new(agent)),
        );
        let mut rx = collect_messages(&h.orchestrator, "c");

        let msg = ChannelMessage::user("c", "user", "@scout go");
        h.orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), None)
            .await;

        assert_eq!(next_message(&mut rx).await.content, "final answer");
        wait_idle(&h.orchestrator).await;
        assert!(rx.try_recv().is_err());
        // Pre-bound instance: the factory is never consulted
        assert_eq!(h.factory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_event_posts_system_message() {
        let h = harness();
        let agent = ScriptedAgent::new(
            "scout",
            vec![ExecutionEvent::Failed { error: "context overflow".into() }],
        );
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("scout", "Scout")).with_instance(Arc::new(agent)),
        );
        let mut rx = collect_messages(&h.orchestrator, "c");
        let mut events = h.bus.subscribe();

        let msg = ChannelMessage::user("c", "user", "@scout go");
        h.orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), None)
            .await;

        let posted = next_message(&mut rx).await;
        assert_eq!(posted.role, MessageRole::System);
        assert!(posted.content.contains("context overflow"));
        assert!(matches!(
            events.recv().await.unwrap(),
            RuntimeEvent::AgentFailed { .. }
        ));

        wait_idle(&h.orchestrator).await;
        assert_eq!(h.registry.status("scout"), Some(AgentStatus::Available));
    }

    #[tokio::test]
    async fn test_stream_ending_without_completion_posts_nothing() {
        let h = harness();
        let agent = ScriptedAgent::new(
            "scout",
            vec![ExecutionEvent::TextDelta { text: "half an answer".into() }],
        );
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("scout", "Scout")).with_instance(Arc::new(agent)),
        );
        let mut rx = collect_messages(&h.orchestrator, "c");

        let msg = ChannelMessage::user("c", "user", "@scout go");
        h.orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), None)
            .await;

        wait_idle(&h.orchestrator).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(h.registry.status("scout"), Some(AgentStatus::Available));
    }

    #[tokio::test]
    async fn test_execute_error_is_reported_and_cleaned_up() {
        let h = harness();
        let agent = ScriptedAgent {
            fail_to_start: true,
            ..ScriptedAgent::new("scout", Vec::new())
        };
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("scout", "Scout")).with_instance(Arc::new(agent)),
        );
        let mut rx = collect_messages(&h.orchestrator, "c");

        let msg = ChannelMessage::user("c", "user", "@scout go");
        h.orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), None)
            .await;

        let posted = next_message(&mut rx).await;
        assert_eq!(posted.role, MessageRole::System);
        assert!(posted.content.contains("model not loaded"));
        wait_idle(&h.orchestrator).await;
        assert_eq!(h.registry.status("scout"), Some(AgentStatus::Available));
    }

    #[tokio::test]
    async fn test_no_provider_posts_system_message() {
        let h = harness_with(false, &[]);
        register(&h.registry, &["scout"]);
        let mut rx = collect_messages(&h.orchestrator, "c");

        let msg = ChannelMessage::user("c", "user", "@scout go");
        let targets = h
            .orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), None)
            .await;
        assert_eq!(targets, ids(&["scout"]));

        let posted = next_message(&mut rx).await;
        assert_eq!(posted.role, MessageRole::System);
        assert_eq!(posted.content, "No provider available for @scout");
        assert_eq!(h.orchestrator.active_task_count(), 0);
        assert_eq!(h.registry.status("scout"), Some(AgentStatus::Available));
        assert_eq!(h.factory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_creation_failure_does_not_affect_other_targets() {
        let h = harness_with(true, &["broken"]);
        register(&h.registry, &["broken", "scout"]);
        let mut rx = collect_messages(&h.orchestrator, "c");

        let msg = ChannelMessage::user("c", "user", "@broken @scout go");
        h.orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), None)
            .await;

        let posted = next_message(&mut rx).await;
        assert_eq!(posted.sender, "scout");
        wait_idle(&h.orchestrator).await;
        assert_eq!(h.registry.status("broken"), Some(AgentStatus::Available));
        assert_eq!(h.factory_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_handler_receives_events_in_order() {
        let h = harness();
        let script = vec![
            ExecutionEvent::TextDelta { text: "a".into() },
            ExecutionEvent::TextDelta { text: "b".into() },
            ExecutionEvent::ToolCall {
                name: "lookup".into(),
                input: serde_json::Value::Null,
            },
            ExecutionEvent::TextDelta { text: "c".into() },
            ExecutionEvent::Completed,
        ];
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("scout", "Scout"))
                .with_instance(Arc::new(ScriptedAgent::new("scout", script.clone()))),
        );
        let mut rx = collect_messages(&h.orchestrator, "c");

        let seen: Arc<Mutex<Vec<(String, ExecutionEvent)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: StreamHandler = Arc::new(move |agent: &str, event: &ExecutionEvent| {
            sink.lock().push((agent.to_string(), event.clone()));
        });

        let msg = ChannelMessage::user("c", "user", "@scout go");
        h.orchestrator
            .handle_message(&msg, &Channel::new("c", "general"), Some(handler))
            .await;

        assert_eq!(next_message(&mut rx).await.content, "abc");
        wait_idle(&h.orchestrator).await;

        let seen = seen.lock();
        let events: Vec<ExecutionEvent> = seen.iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(events, script);
        assert!(seen.iter().all(|(agent, _)| agent == "scout"));
    }

    #[tokio::test]
    async fn test_cancel_all_tasks_is_scoped_to_channel() {
        let h = harness();
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("north", "North"))
                .with_instance(Arc::new(ScriptedAgent::hanging("north"))),
        );
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("south", "South"))
                .with_instance(Arc::new(ScriptedAgent::hanging("south"))),
        );

        h.orchestrator
            .handle_message(
                &ChannelMessage::user("one", "user", "@north go"),
                &Channel::new("one", "one"),
                None,
            )
            .await;
        h.orchestrator
            .handle_message(
                &ChannelMessage::user("two", "user", "@south go"),
                &Channel::new("two", "two"),
                None,
            )
            .await;

        assert_eq!(h.orchestrator.active_task_count(), 2);
        assert_eq!(h.registry.status("north"), Some(AgentStatus::Busy));

        h.orchestrator.cancel_all_tasks("one");
        assert_eq!(h.orchestrator.active_task_count_for("one"), 0);
        assert_eq!(h.orchestrator.active_task_count_for("two"), 1);
        assert_eq!(h.orchestrator.active_task_count(), 1);

        for _ in 0..200 {
            if h.registry.status("north") == Some(AgentStatus::Available) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.registry.status("north"), Some(AgentStatus::Available));
        assert_eq!(h.registry.status("south"), Some(AgentStatus::Busy));

        h.orchestrator.shutdown();
        assert_eq!(h.orchestrator.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_agent_is_not_selected_again() {
        let h = harness();
        h.registry.register(
            RegisteredAgent::new(AgentProfile::new("north", "North"))
                .with_instance(Arc::new(ScriptedAgent::hanging("north"))),
        );
        let msg = ChannelMessage::user("one", "user", "@north go");
        let channel = Channel::new("one", "one");

        assert_eq!(
            h.orchestrator.handle_message(&msg, &channel, None).await,
            ids(&["north"])
        );
        assert!(h.orchestrator.handle_message(&msg, &channel, None).await.is_empty());
        assert_eq!(h.orchestrator.active_task_count(), 1);

        h.orchestrator.remove_channel("one");
        assert_eq!(h.orchestrator.active_task_count(), 0);
    }
}
