// ── Gateway: Bot Identity ────────────────────────────────────────────────────
// One `BotIdentity` per unique Discord token (spec.md §3 BotIdentity, §4.2
// state machine). Owns its own WebSocket connection, its own fan-out
// broadcast, and its own outbound rate-limit gate. Grounded on the teacher's
// raw-gateway WebSocket client (`engine/discord.rs`), generalized from one
// hardcoded bridge into N independently-addressable identities.

use crate::atoms::constants::{DISCORD_API_BASE, DISCORD_GATEWAY_URL, SUBSCRIPTION_BUFFER_SIZE};
use crate::atoms::error::FleetError;
use crate::atoms::types::{Attachment, BotConnectionState, InboundEvent};
use crate::providers::reconnect_delay;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use zeroize::Zeroizing;

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    d: Option<Value>,
    s: Option<u64>,
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadyEvent {
    user: DiscordUser,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    bot: Option<bool>,
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    channel_id: String,
    author: DiscordUser,
    content: String,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
    filename: String,
    url: String,
    content_type: Option<String>,
    size: u64,
}

fn connection_state_from_u8(v: u8) -> BotConnectionState {
    match v {
        0 => BotConnectionState::Initializing,
        1 => BotConnectionState::Connecting,
        2 => BotConnectionState::Ready,
        3 => BotConnectionState::Degraded,
        _ => BotConnectionState::Closed,
    }
}

fn connection_state_to_u8(s: BotConnectionState) -> u8 {
    match s {
        BotConnectionState::Initializing => 0,
        BotConnectionState::Connecting => 1,
        BotConnectionState::Ready => 2,
        BotConnectionState::Degraded => 3,
        BotConnectionState::Closed => 4,
    }
}

/// A live Discord bot credential and its connection. Many `AgentSpec`s may
/// reference the same `BotIdentity`'s token only if they are, in fact, the
/// same identity — duplicate-token detection happens one layer up in
/// `config::SecretResolver`, before identities are ever constructed.
pub struct BotIdentity {
    pub id: String,
    token: Zeroizing<String>,
    user_id: OnceLock<String>,
    display_name: OnceLock<String>,
    state: AtomicU8,
    events_tx: broadcast::Sender<InboundEvent>,
    dropped_events: AtomicU64,
    http: reqwest::Client,
}

impl BotIdentity {
    pub fn new(id: impl Into<String>, token: String) -> Arc<Self> {
        let (events_tx, _rx) = broadcast::channel(SUBSCRIPTION_BUFFER_SIZE);
        Arc::new(Self {
            id: id.into(),
            token: Zeroizing::new(token),
            user_id: OnceLock::new(),
            display_name: OnceLock::new(),
            state: AtomicU8::new(connection_state_to_u8(BotConnectionState::Initializing)),
            events_tx,
            dropped_events: AtomicU64::new(0),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(crate::atoms::constants::GATEWAY_HTTP_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        })
    }

    pub fn state(&self) -> BotConnectionState {
        connection_state_from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, s: BotConnectionState) {
        self.state.store(connection_state_to_u8(s), Ordering::Relaxed);
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(|s| s.as_str())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.get().map(|s| s.as_str())
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn token(&self) -> &str {
        self.token.as_str()
    }

    /// Creates a new ordered, independent subscription (spec.md §4.2
    /// "Multiplexing contract"): forwards the shared broadcast into a
    /// per-subscriber bounded mpsc, converting `Lagged` into the drop-oldest
    /// policy spec.md §5 requires, with a monotonic counter.
    pub fn subscribe(self: &Arc<Self>) -> mpsc::Receiver<InboundEvent> {
        let mut rx = self.events_tx.subscribe();
        let (tx, out_rx) = mpsc::channel(SUBSCRIPTION_BUFFER_SIZE);
        let identity = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        identity.dropped_events.fetch_add(n, Ordering::Relaxed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        out_rx
    }

    /// Runs the reconnect-with-backoff supervisor loop for this identity
    /// until `stop` is signalled. Connection failures mark the identity
    /// `degraded` without blocking any other identity (spec.md §4.2).
    pub async fn run(self: Arc<Self>, stop: Arc<tokio::sync::Notify>) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(BotConnectionState::Connecting);
            tracing::info!(bot = %self.id, "connecting to discord gateway");
            let result = tokio::select! {
                r = self.clone().connect_once() => r,
                _ = stop.notified() => {
                    self.set_state(BotConnectionState::Closed);
                    return;
                }
            };
            match result {
                Ok(()) => {
                    // Clean close (e.g. explicit reconnect request); retry immediately.
                    attempt = 0;
                }
                Err(e) => {
                    self.set_state(BotConnectionState::Degraded);
                    tracing::warn!(bot = %self.id, error = %e, "gateway connection lost");
                    let delay = reconnect_delay(attempt).await;
                    tracing::info!(bot = %self.id, delay_ms = delay.as_millis() as u64, "reconnecting");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn connect_once(self: Arc<Self>) -> Result<(), FleetError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(DISCORD_GATEWAY_URL)
            .await
            .map_err(|e| FleetError::transport(format!("gateway connect: {e}")))?;
        let (write, mut read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let hello = read
            .next()
            .await
            .ok_or_else(|| FleetError::transport("gateway closed before hello"))?
            .map_err(|e| FleetError::transport(e.to_string()))?;
        let hello_text = hello.to_text().map_err(|e| FleetError::transport(e.to_string()))?;
        let hello_payload: GatewayPayload =
            serde_json::from_str(hello_text).map_err(|e| FleetError::transport(e.to_string()))?;
        if hello_payload.op != 10 {
            return Err(FleetError::transport(format!("expected hello (op 10), got op {}", hello_payload.op)));
        }
        let heartbeat_interval_ms =
            hello_payload.d.as_ref().and_then(|d| d["heartbeat_interval"].as_u64()).unwrap_or(41_250);

        let intents = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);
        let identify = json!({
            "op": 2,
            "d": {
                "token": self.token.as_str(),
                "intents": intents,
                "properties": {"os": std::env::consts::OS, "browser": "agentfleet", "device": "agentfleet"}
            }
        });
        write
            .lock()
            .await
            .send(WsMessage::Text(identify.to_string()))
            .await
            .map_err(|e| FleetError::transport(e.to_string()))?;

        let (seq_tx, mut seq_rx) = mpsc::channel::<u64>(16);
        let hb_write = write.clone();
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(heartbeat_interval_ms)).await;
                let seq = seq_rx.try_recv().ok();
                let hb = json!({"op": 1, "d": seq});
                if hb_write.lock().await.send(WsMessage::Text(hb.to_string())).await.is_err() {
                    break;
                }
            }
        });

        let result = self.event_loop(&mut read, &seq_tx).await;
        heartbeat_task.abort();
        result
    }

    async fn event_loop(
        &self,
        read: &mut (impl futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
        seq_tx: &mpsc::Sender<u64>,
    ) -> Result<(), FleetError> {
        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| FleetError::transport(e.to_string()))?;
            let text = match msg {
                WsMessage::Text(t) => t,
                WsMessage::Close(_) => return Err(FleetError::transport("gateway closed connection")),
                _ => continue,
            };
            let payload: GatewayPayload = match serde_json::from_str(&text) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Some(s) = payload.s {
                let _ = seq_tx.try_send(s);
            }
            match payload.op {
                0 => self.handle_dispatch(payload.t.as_deref().unwrap_or(""), payload.d),
                7 => return Err(FleetError::transport("gateway requested reconnect")),
                9 => return Err(FleetError::transport("invalid session")),
                10 | 11 => {}
                _ => {}
            }
        }
        Err(FleetError::transport("gateway stream ended"))
    }

    fn handle_dispatch(&self, event_name: &str, data: Option<Value>) {
        match event_name {
            "READY" => {
                if let Some(d) = data {
                    if let Ok(ready) = serde_json::from_value::<ReadyEvent>(d) {
                        let _ = self.user_id.set(ready.user.id.clone());
                        let _ = self.display_name.set(ready.user.global_name.unwrap_or(ready.user.username));
                        self.set_state(BotConnectionState::Ready);
                        tracing::info!(bot = %self.id, user_id = %self.user_id().unwrap_or(""), "gateway ready");
                    }
                }
            }
            "MESSAGE_CREATE" => {
                if let Some(d) = data {
                    if let Ok(m) = serde_json::from_value::<DiscordMessage>(d) {
                        let is_bot_author = m.author.bot.unwrap_or(false);
                        let event = InboundEvent {
                            bot_identity_id: self.id.clone(),
                            channel_id: m.channel_id,
                            thread_id: m.thread_id,
                            message_id: m.id,
                            author_id: m.author.id,
                            is_bot_author,
                            content: m.content,
                            attachments: m
                                .attachments
                                .into_iter()
                                .map(|a| Attachment {
                                    filename: a.filename,
                                    url: a.url,
                                    content_type: a.content_type,
                                    size_bytes: a.size,
                                })
                                .collect(),
                            timestamp: chrono::Utc::now(),
                        };
                        // No active subscribers is not an error: events are
                        // simply not retained (spec.md does not require a
                        // replay buffer for zero-subscriber identities).
                        let _ = self.events_tx.send(event);
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn api_base(&self) -> &'static str {
        DISCORD_API_BASE
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> InboundEvent {
        InboundEvent {
            bot_identity_id: "b1".into(),
            channel_id: "c1".into(),
            thread_id: None,
            message_id: id.to_string(),
            author_id: "human1".into(),
            is_bot_author: false,
            content: "hi".into(),
            attachments: Vec::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn s6_fan_out_delivers_to_every_subscriber_of_the_same_identity() {
        let b1 = BotIdentity::new("b1", "token1".to_string());
        let mut sub1 = b1.subscribe();
        let mut sub2 = b1.subscribe();
        let b2 = BotIdentity::new("b2", "token2".to_string());
        let mut sub3 = b2.subscribe();

        let e = event("m1");
        let _ = b1.events_tx.send(e.clone());

        let got1 = sub1.recv().await.unwrap();
        let got2 = sub2.recv().await.unwrap();
        assert_eq!(got1.message_id, e.message_id);
        assert_eq!(got2.message_id, e.message_id);

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(100), sub3.recv()).await;
        assert!(nothing.is_err(), "a subscriber of a different bot identity must not see b1's events");
    }

    #[tokio::test]
    async fn lagged_subscriber_counts_dropped_events_instead_of_erroring() {
        let b1 = BotIdentity::new("b1", "token1".to_string());
        let mut sub = b1.subscribe();
        for i in 0..(SUBSCRIPTION_BUFFER_SIZE + 5) {
            let _ = b1.events_tx.send(event(&i.to_string()));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Drain whatever made it through; the forwarding task keeps running
        // regardless of how far behind the broadcast receiver fell.
        while sub.try_recv().is_ok() {}
        assert!(b1.dropped_event_count() > 0);
    }
}
