// ── Conversation Engine (C3) ─────────────────────────────────────────────────
// One logical loop per process-kind agent (spec.md §4.3). Single-writer over
// its own `ConversationState` map — no other component reads or mutates it
// (spec.md §5 "Shared-resource policy").

pub mod prompt;

use crate::atoms::constants::MEMORY_SEARCH_DEFAULT_K;
use crate::atoms::error::FleetError;
use crate::atoms::traits::{AiProvider, GatewayClient};
use crate::atoms::types::{AgentSpec, ConversationState, HistoryEntry, InboundEvent, Role};
use crate::memory::MemoryStore;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Per-agent conversational loop. Holds the one `AgentSpec` it was built
/// from, the shared Gateway/Memory/provider handles, and its own exclusive
/// `ConversationState` map keyed by conversation key.
pub struct ConversationEngine {
    spec: AgentSpec,
    gateway: Arc<dyn GatewayClient>,
    memory: Arc<MemoryStore>,
    provider: Arc<dyn AiProvider>,
    states: Mutex<HashMap<String, ConversationState>>,
    own_user_id: tokio::sync::OnceCell<Option<String>>,
}

impl ConversationEngine {
    pub fn new(
        spec: AgentSpec,
        gateway: Arc<dyn GatewayClient>,
        memory: Arc<MemoryStore>,
        provider: Arc<dyn AiProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            gateway,
            memory,
            provider,
            states: Mutex::new(HashMap::new()),
            own_user_id: tokio::sync::OnceCell::new(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.spec.id
    }

    /// Runs until `events` closes or `shutdown` fires. Graceful shutdown
    /// drains the in-flight turn (if any) before returning (spec.md §5
    /// "Graceful shutdown order").
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<InboundEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(agent = %self.spec.id, "conversation engine shutting down");
                        return;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                tracing::warn!(agent = %self.spec.id, error = %e, "turn aborted");
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn resolve_own_user_id(&self) -> Option<String> {
        self.own_user_id
            .get_or_init(|| async { self.gateway.bot_user_id(&self.spec.id).await.ok().flatten() })
            .await
            .clone()
    }

    /// Step 1: admission filters, each a silent reject (logged at debug).
    /// The self-reply cut-off is unconditional and checked before any other
    /// filter (spec.md §4.3 "Anti-loop guarantees").
    async fn admit(&self, event: &InboundEvent) -> bool {
        if let Some(own_id) = self.resolve_own_user_id().await {
            if event.author_id == own_id {
                tracing::debug!(agent = %self.spec.id, "admission: self-authored event rejected");
                return false;
            }
        }

        let behavior = &self.spec.behavior;
        if event.is_bot_author && behavior.ignore_bots && !behavior.bot_allowlist.contains(&event.author_id) {
            tracing::debug!(agent = %self.spec.id, "admission: bot author not allow-listed");
            return false;
        }

        if !behavior.channel_allowlist.is_empty() && !behavior.channel_allowlist.contains(&event.channel_id) {
            tracing::debug!(agent = %self.spec.id, "admission: channel not allow-listed");
            return false;
        }

        let key = event.conversation_key().to_string();
        let turn_count = self.states.lock().get(&key).map(|s| s.turn_count).unwrap_or(0);
        if turn_count >= behavior.max_turns_per_thread {
            tracing::debug!(agent = %self.spec.id, key = %key, "admission: turn cap reached");
            return false;
        }

        true
    }

    async fn handle_event(&self, event: InboundEvent) -> Result<(), FleetError> {
        if !self.admit(&event).await {
            return Ok(());
        }

        let key = event.conversation_key().to_string();

        // Step 3: context assembly. Discord is the source of truth for recent
        // history (spec.md §9) — fetched fresh from the Gateway every turn,
        // not accumulated locally.
        let history = self.fetch_history(&key, &event).await;

        let memory_hits = match self.memory.search(Some(&self.spec.id), &event.content, MEMORY_SEARCH_DEFAULT_K).await
        {
            Ok(hits) => hits
                .into_iter()
                .filter(|h| h.similarity >= self.spec.behavior.memory_similarity_floor)
                .map(|h| h.content)
                .collect::<Vec<_>>(),
            Err(FleetError::EmbeddingUnavailable(reason)) => {
                // spec.md §7: conversation proceeds without memory augmentation.
                tracing::warn!(agent = %self.spec.id, reason = %reason, "memory degraded for this turn");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let messages = prompt::build_messages(&self.spec, &memory_hits, &history, &event.content);

        // Step 4: response delay.
        if self.spec.behavior.response_delay_seconds > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(self.spec.behavior.response_delay_seconds)).await;
        }

        // Step 5: LM invocation, one retry on failure, then abort the turn.
        let outcome = match self.provider.chat(&messages, &self.spec.llm.model).await {
            Ok(o) => o,
            Err(first_err) => {
                tracing::warn!(agent = %self.spec.id, error = %first_err, "provider call failed, retrying once");
                crate::providers::retry_delay(0, None).await;
                self.provider.chat(&messages, &self.spec.llm.model).await?
            }
        };

        if outcome.text.is_empty() {
            return Ok(());
        }

        // Step 6: post the reply. Always carries `reply_to` so testable
        // property #1 (spec.md §8) holds regardless of thread placement.
        self.gateway.send(&self.spec.id, &event.channel_id, &outcome.text, Some(&event.message_id)).await?;

        // Step 7: memorize both turns.
        let meta = |role: &str| {
            json!({
                "channel_id": event.channel_id,
                "thread_id": event.thread_id,
                "message_id": event.message_id,
                "role": role,
            })
        };
        if let Err(e) = self.memory.store(&self.spec.id, &event.content, meta("user")).await {
            tracing::warn!(agent = %self.spec.id, error = %e, "failed to memorize user turn");
        }
        if let Err(e) = self.memory.store(&self.spec.id, &outcome.text, meta("assistant")).await {
            tracing::warn!(agent = %self.spec.id, error = %e, "failed to memorize assistant turn");
        }

        // Step 8: update conversation state. Turn accounting only — message
        // content itself is never cached locally, Discord stays authoritative
        // for history (spec.md §9).
        let mut states = self.states.lock();
        let state = states
            .entry(key)
            .or_insert_with(|| ConversationState::new(self.spec.behavior.max_context_messages));
        state.turn_count += 1;
        state.last_reply_at = Some(Utc::now());

        Ok(())
    }

    /// Step 3 helper: pulls up to `max_context_messages` prior messages for
    /// `key` straight from the Gateway, oldest→newest, excluding the message
    /// that triggered this turn. `max_context_messages == 0` skips the fetch
    /// entirely — the prompt carries no history block (spec.md §8).
    async fn fetch_history(&self, key: &str, event: &InboundEvent) -> Vec<HistoryEntry> {
        let limit = self.spec.behavior.max_context_messages;
        if limit == 0 {
            return Vec::new();
        }

        let events = match self.gateway.recent_messages(&self.spec.id, key, limit).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(agent = %self.spec.id, key = %key, error = %e, "failed to fetch recent messages from gateway");
                return Vec::new();
            }
        };

        let own_id = self.resolve_own_user_id().await;
        events
            .into_iter()
            .filter(|e| e.message_id != event.message_id)
            .map(|e| {
                let role = match &own_id {
                    Some(id) if &e.author_id == id => Role::Assistant,
                    _ => Role::User,
                };
                HistoryEntry { role, content: e.content, author_id: e.author_id, timestamp: e.timestamp }
            })
            .collect()
    }

    /// Snapshot of this agent's turn count in `key`, used by tests and by
    /// the Supervisor's status reporting.
    pub fn turn_count(&self, key: &str) -> u32 {
        self.states.lock().get(key).map(|s| s.turn_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::traits::ChatOutcome;
    use crate::atoms::types::{AgentKind, Attachment, BehaviorConfig, LlmConfig, ProviderKind};
    use crate::memory::EmbeddingClient;
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeGateway {
        sent: AsyncMutex<Vec<(String, String, Option<String>)>>,
        own_user_id: Option<String>,
        history: Vec<InboundEvent>,
    }

    impl FakeGateway {
        fn new(own_user_id: Option<String>) -> Arc<Self> {
            Arc::new(Self { sent: AsyncMutex::new(Vec::new()), own_user_id, history: Vec::new() })
        }

        fn with_history(own_user_id: Option<String>, history: Vec<InboundEvent>) -> Arc<Self> {
            Arc::new(Self { sent: AsyncMutex::new(Vec::new()), own_user_id, history })
        }
    }

    #[async_trait]
    impl GatewayClient for FakeGateway {
        async fn send(
            &self,
            _bot: &str,
            channel_id: &str,
            content: &str,
            reply_to: Option<&str>,
        ) -> Result<String, FleetError> {
            self.sent.lock().await.push((channel_id.to_string(), content.to_string(), reply_to.map(String::from)));
            Ok(uuid::Uuid::new_v4().to_string())
        }

        async fn recent_messages(&self, _bot: &str, _channel_id: &str, limit: usize) -> Result<Vec<InboundEvent>, FleetError> {
            let mut events = self.history.clone();
            events.truncate(limit);
            Ok(events)
        }

        async fn bot_user_id(&self, _bot: &str) -> Result<Option<String>, FleetError> {
            Ok(self.own_user_id.clone())
        }

        async fn subscribe(&self, _bot: &str, _subscriber_id: &str) -> Result<mpsc::Receiver<InboundEvent>, FleetError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    struct FakeProvider {
        reply: String,
        seen_messages: AsyncMutex<Vec<crate::atoms::types::Message>>,
    }

    impl FakeProvider {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self { reply: reply.to_string(), seen_messages: AsyncMutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl AiProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
        async fn chat(&self, messages: &[crate::atoms::types::Message], _model: &str) -> Result<ChatOutcome, FleetError> {
            *self.seen_messages.lock().await = messages.to_vec();
            Ok(ChatOutcome { text: self.reply.clone(), usage: None })
        }
    }

    fn spec(max_turns: u32) -> AgentSpec {
        AgentSpec {
            id: "a1".into(),
            kind: AgentKind::Process,
            display_name: "A1".into(),
            personality: String::new(),
            system_prompt_suffix: String::new(),
            llm: LlmConfig { provider: ProviderKind::Anthropic, model: "claude-sonnet-4-6".into(), extra_params: Default::default() },
            discord_token_ref: "TOKEN_A1".into(),
            behavior: BehaviorConfig { max_turns_per_thread: max_turns, response_delay_seconds: 0, ..Default::default() },
            resources: None,
            auto_deploy: true,
        }
    }

    fn event(content: &str) -> InboundEvent {
        InboundEvent {
            bot_identity_id: "a1".into(),
            channel_id: "c1".into(),
            thread_id: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            author_id: "human1".into(),
            is_bot_author: false,
            content: content.to_string(),
            attachments: Vec::<Attachment>::new(),
            timestamp: Utc::now(),
        }
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::open_in_memory(EmbeddingClient::new("http://localhost:11434", "nomic-embed-text"), 3).unwrap())
    }

    #[tokio::test]
    async fn s1_basic_reply_posts_with_reply_to() {
        let gateway = FakeGateway::new(Some("bot-self".into()));
        let provider = FakeProvider::new("hello back");
        let engine = ConversationEngine::new(spec(50), gateway.clone(), memory_store(), provider);

        engine.handle_event(event("hello")).await.unwrap();

        let sent = gateway.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "hello back");
        assert!(sent[0].2.is_some());
    }

    #[tokio::test]
    async fn self_authored_events_are_never_admitted() {
        let gateway = FakeGateway::new(Some("human1".into()));
        let provider = FakeProvider::new("should not fire");
        let engine = ConversationEngine::new(spec(50), gateway.clone(), memory_store(), provider);

        engine.handle_event(event("hello")).await.unwrap();

        assert!(gateway.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn s2_anti_loop_caps_replies_at_max_turns() {
        let gateway = FakeGateway::new(None);
        let provider = FakeProvider::new("ack");
        let engine = ConversationEngine::new(spec(3), gateway.clone(), memory_store(), provider);

        for i in 0..10 {
            engine.handle_event(event(&format!("msg {i}"))).await.unwrap();
        }

        assert_eq!(gateway.sent.lock().await.len(), 3);
        assert_eq!(engine.turn_count("c1"), 3);
    }

    #[tokio::test]
    async fn zero_max_turns_never_replies() {
        let gateway = FakeGateway::new(None);
        let provider = FakeProvider::new("ack");
        let engine = ConversationEngine::new(spec(0), gateway.clone(), memory_store(), provider);

        engine.handle_event(event("hello")).await.unwrap();

        assert!(gateway.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn channel_allowlist_rejects_other_channels() {
        let gateway = FakeGateway::new(None);
        let provider = FakeProvider::new("ack");
        let mut agent_spec = spec(50);
        agent_spec.behavior.channel_allowlist = vec!["other-channel".to_string()];
        let engine = ConversationEngine::new(agent_spec, gateway.clone(), memory_store(), provider);

        engine.handle_event(event("hello")).await.unwrap();

        assert!(gateway.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn history_is_fetched_from_the_gateway_not_a_local_cache() {
        let prior = InboundEvent {
            bot_identity_id: "a1".into(),
            channel_id: "c1".into(),
            thread_id: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            author_id: "human1".into(),
            is_bot_author: false,
            content: "earlier channel message nobody replied to".to_string(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        };
        let gateway = FakeGateway::with_history(Some("bot-self".into()), vec![prior]);
        let provider = FakeProvider::new("ack");
        let engine = ConversationEngine::new(spec(50), gateway.clone(), memory_store(), provider.clone());

        // First turn in this channel: the local map has no entry for "c1" yet,
        // but the Gateway already knows about `prior`.
        engine.handle_event(event("hello")).await.unwrap();

        let seen = provider.seen_messages.lock().await;
        assert!(seen.iter().any(|m| m.content.contains("earlier channel message nobody replied to")));
    }

    #[tokio::test]
    async fn zero_max_context_messages_skips_the_gateway_fetch() {
        let prior = InboundEvent {
            bot_identity_id: "a1".into(),
            channel_id: "c1".into(),
            thread_id: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            author_id: "human1".into(),
            is_bot_author: false,
            content: "should never appear in the prompt".to_string(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        };
        let gateway = FakeGateway::with_history(None, vec![prior]);
        let provider = FakeProvider::new("ack");
        let mut agent_spec = spec(50);
        agent_spec.behavior.max_context_messages = 0;
        let engine = ConversationEngine::new(agent_spec, gateway.clone(), memory_store(), provider.clone());

        engine.handle_event(event("hello")).await.unwrap();

        let seen = provider.seen_messages.lock().await;
        assert!(!seen.iter().any(|m| m.content.contains("should never appear in the prompt")));
    }
}
