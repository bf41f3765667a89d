// ── Gateway: In-Process Client ───────────────────────────────────────────────
// The `GatewayClient` implementation the Supervisor hands to a process-kind
// agent's Conversation Engine when it runs in the same binary as the
// Gateway. Talks straight to the `GatewayRegistry`/`BotIdentity` instead of
// looping back over HTTP — the stateless-HTTP contract (spec.md §4.2) is
// still honored by `GatewayHttpClient` for any caller in a separate process.

use crate::atoms::error::FleetError;
use crate::atoms::traits::GatewayClient;
use crate::atoms::types::InboundEvent;
use crate::gateway::registry::GatewayRegistry;
use crate::gateway::rest;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct LocalGatewayClient {
    registry: Arc<GatewayRegistry>,
}

impl LocalGatewayClient {
    pub fn new(registry: Arc<GatewayRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl GatewayClient for LocalGatewayClient {
    async fn send(
        &self,
        bot: &str,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<String, FleetError> {
        let identity = self.registry.require(bot).await?;
        rest::send_message(&identity, channel_id, content, reply_to).await
    }

    async fn recent_messages(
        &self,
        bot: &str,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, FleetError> {
        let identity = self.registry.require(bot).await?;
        rest::recent_messages(&identity, channel_id, limit, None).await
    }

    async fn bot_user_id(&self, bot: &str) -> Result<Option<String>, FleetError> {
        let identity = self.registry.require(bot).await?;
        Ok(identity.user_id().map(String::from))
    }

    async fn subscribe(&self, bot: &str, _subscriber_id: &str) -> Result<mpsc::Receiver<InboundEvent>, FleetError> {
        let identity = self.registry.require(bot).await?;
        Ok(identity.subscribe())
    }
}
