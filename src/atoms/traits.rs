// ── Atoms: Golden Traits ────────────────────────────────────────────────────
// The seams every concrete adapter (LM provider, container engine) implements.
// Kept in atoms/ because callers throughout the crate program against these
// traits, never against a concrete struct.

use crate::atoms::container_types::{ContainerHandle, ContainerInspect, ExecOutcome, LaunchSpec};
use crate::atoms::error::FleetError;
use crate::atoms::types::{InboundEvent, Message, TokenUsage};
use async_trait::async_trait;

/// A single non-streaming chat completion call against a language-model
/// provider. Providers are treated as an external collaborator (spec.md
/// Non-goals); this crate only needs the request/response shape below.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Sends `messages` to the provider and returns the assistant's reply
    /// text plus token usage. Retries and circuit-breaking happen inside the
    /// implementation; callers see only the final `Ok` or a classified
    /// `FleetError`.
    async fn chat(&self, messages: &[Message], model: &str) -> Result<ChatOutcome, FleetError>;
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// The mechanical surface C4 (Container Runtime Adapter) exposes to the
/// Supervisor (spec.md §4.4). An adapter never interprets agent semantics;
/// it only launches, inspects, and tears down opaque handles. Kept as a
/// trait so the Supervisor's reconciliation logic can be tested against an
/// in-memory fake instead of a real container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<ContainerHandle, FleetError>;
    async fn stop(&self, handle: &ContainerHandle, grace_secs: u64) -> Result<(), FleetError>;
    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInspect, FleetError>;
    async fn logs(&self, handle: &ContainerHandle, tail_lines: usize) -> Result<String, FleetError>;
    async fn exec(&self, handle: &ContainerHandle, argv: &[String]) -> Result<ExecOutcome, FleetError>;
    async fn list(&self, label_selector: &[(String, String)]) -> Result<Vec<ContainerHandle>, FleetError>;
}

/// The stateless surface C2 (Discord Gateway) exposes to C3 (Conversation
/// Engine) and C5 (Supervisor's health probes). Process-kind agents never
/// touch Discord directly; they go through this seam, which is also what
/// lets S1/S2/S6 (spec.md §8) run against an in-memory fake gateway in
/// tests rather than a live Discord connection.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn send(
        &self,
        bot: &str,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<String, FleetError>;

    async fn recent_messages(
        &self,
        bot: &str,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, FleetError>;

    /// Resolves the Discord user id this bot identity connects as, once its
    /// connection has reached `ready`. Used by the Conversation Engine's
    /// unconditional self-reply cut-off (spec.md §4.3 step 1a).
    async fn bot_user_id(&self, bot: &str) -> Result<Option<String>, FleetError>;

    /// Subscribes to this bot identity's inbound event stream. Each call
    /// creates an independent, ordered, at-least-once subscription (spec.md
    /// §4.2 "Multiplexing contract"); the returned receiver applies the
    /// Gateway's bounded-buffer, drop-oldest backpressure policy (spec.md §5).
    async fn subscribe(
        &self,
        bot: &str,
        subscriber_id: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<InboundEvent>, FleetError>;
}
