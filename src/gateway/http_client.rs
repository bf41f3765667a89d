// ── Gateway: HTTP Client (caller side) ──────────────────────────────────────
// The `GatewayClient` implementation every other component (Conversation
// Engine, Supervisor health probes) uses. Talks only over HTTP to the
// Gateway's stateless surface — it never opens a Discord connection itself
// (spec.md §4.2 "other components never open their own").

use crate::atoms::error::FleetError;
use crate::atoms::traits::GatewayClient;
use crate::atoms::types::InboundEvent;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

pub struct GatewayHttpClient {
    base_url: String,
    http: reqwest::Client,
}

impl GatewayHttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(crate::atoms::constants::GATEWAY_HTTP_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    fn map_error(status: reqwest::StatusCode, body: Value) -> FleetError {
        let kind = body.get("error_kind").and_then(|v| v.as_str()).unwrap_or("");
        let message = body.get("message").and_then(|v| v.as_str()).unwrap_or("gateway error").to_string();
        match kind {
            "unknown_bot" => FleetError::UnknownBot(message),
            "unknown_channel" => FleetError::UnknownChannel(message),
            "permission_denied" => FleetError::PermissionDenied(message),
            "file_too_large" => FleetError::FileTooLarge(message),
            "rate_limited" => FleetError::RateLimited {
                retry_after_secs: body.get("retry_after").and_then(|v| v.as_u64()),
            },
            "identity_degraded" => FleetError::identity_degraded(message),
            _ if status == reqwest::StatusCode::SERVICE_UNAVAILABLE => FleetError::Overloaded(message),
            _ => FleetError::transport(format!("{status}: {message}")),
        }
    }

    pub async fn health(&self) -> Result<Value, FleetError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| FleetError::transport(e.to_string()))?;
        resp.json().await.map_err(|e| FleetError::transport(e.to_string()))
    }

    pub async fn list_bots(&self) -> Result<Value, FleetError> {
        let resp = self
            .http
            .get(format!("{}/bots", self.base_url))
            .send()
            .await
            .map_err(|e| FleetError::transport(e.to_string()))?;
        resp.json().await.map_err(|e| FleetError::transport(e.to_string()))
    }
}

#[async_trait]
impl GatewayClient for GatewayHttpClient {
    async fn send(
        &self,
        bot: &str,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<String, FleetError> {
        let resp = self
            .http
            .post(format!("{}/send", self.base_url))
            .json(&json!({"bot": bot, "channel_id": channel_id, "content": content, "reply_to": reply_to}))
            .send()
            .await
            .map_err(|e| FleetError::transport(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Self::map_error(status, body));
        }
        Ok(body["message_id"].as_str().unwrap_or_default().to_string())
    }

    async fn recent_messages(
        &self,
        bot: &str,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, FleetError> {
        let resp = self
            .http
            .get(format!("{}/messages", self.base_url))
            .query(&[("bot", bot), ("channel_id", channel_id), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| FleetError::transport(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Self::map_error(status, body));
        }
        let events: Vec<InboundEvent> = serde_json::from_value(body["messages"].clone()).unwrap_or_default();
        Ok(events)
    }

    async fn bot_user_id(&self, bot: &str) -> Result<Option<String>, FleetError> {
        let bots = self.list_bots().await?;
        let found = bots
            .as_array()
            .into_iter()
            .flatten()
            .find(|b| b["id"].as_str() == Some(bot))
            .and_then(|b| b["user_id"].as_str())
            .map(String::from);
        Ok(found)
    }

    async fn subscribe(
        &self,
        bot: &str,
        subscriber_id: &str,
    ) -> Result<mpsc::Receiver<InboundEvent>, FleetError> {
        let resp = self
            .http
            .get(format!("{}/subscribe", self.base_url))
            .query(&[("bot", bot), ("subscriber_id", subscriber_id)])
            .send()
            .await
            .map_err(|e| FleetError::transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            return Err(Self::map_error(status, body));
        }

        let byte_stream =
            resp.bytes_stream().map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let reader = StreamReader::new(byte_stream);
        let mut lines = tokio::io::BufReader::new(reader).lines();

        let (tx, rx) = mpsc::channel(crate::atoms::constants::SUBSCRIPTION_BUFFER_SIZE);
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(event) = serde_json::from_str::<InboundEvent>(&line) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
