// ── Gateway: HTTP Surface ────────────────────────────────────────────────────
// The stateless HTTP surface spec.md §4.2 defines. Every operation names the
// logical `bot` identity; callers never see raw tokens (spec.md §6 "Every
// outbound call carries the logical `bot` name").

use crate::atoms::error::FleetError;
use crate::atoms::types::{BotConnectionState, BotStatus};
use crate::gateway::registry::GatewayRegistry;
use crate::gateway::rest;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn router(registry: Arc<GatewayRegistry>) -> Router {
    Router::new()
        .route("/send", post(send))
        .route("/send-file", post(send_file))
        .route("/messages", get(messages))
        .route("/channels", get(channels))
        .route("/guild", get(guild))
        .route("/attachments/:bot/:channel_id/:message_id", get(attachment_info))
        .route("/attachments/:bot/:channel_id/:message_id/download", get(attachment_download))
        .route("/bots", get(bots))
        .route("/health", get(health))
        .route("/subscribe", get(subscribe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    bot: String,
    channel_id: String,
    content: String,
    #[serde(default)]
    reply_to: Option<String>,
}

async fn send(
    State(registry): State<Arc<GatewayRegistry>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<Value>, FleetError> {
    let identity = registry.require(&req.bot).await?;
    if identity.state() != BotConnectionState::Ready {
        return Err(FleetError::identity_degraded(format!("bot `{}` is not ready", req.bot)));
    }
    let message_id =
        rest::send_message(&identity, &req.channel_id, &req.content, req.reply_to.as_deref()).await?;
    Ok(Json(json!({"message_id": message_id})))
}

#[derive(Debug, Deserialize)]
struct SendFileRequest {
    bot: String,
    channel_id: String,
    filename: String,
    /// Base64-encoded file bytes; a real deployment would stream multipart
    /// directly, but the JSON contract named in spec.md §4.2 keeps this
    /// endpoint symmetric with `/send`.
    bytes_base64: String,
    #[serde(default)]
    content: Option<String>,
}

async fn send_file(
    State(registry): State<Arc<GatewayRegistry>>,
    Json(req): Json<SendFileRequest>,
) -> Result<Json<Value>, FleetError> {
    use base64::Engine;
    let identity = registry.require(&req.bot).await?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.bytes_base64)
        .map_err(|e| FleetError::transport(format!("invalid base64 payload: {e}")))?;
    const MAX_FILE_BYTES: u64 = 8 * 1024 * 1024;
    let message_id =
        rest::send_file(&identity, &req.channel_id, &req.filename, bytes, req.content.as_deref(), MAX_FILE_BYTES)
            .await?;
    Ok(Json(json!({"message_id": message_id})))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    bot: String,
    channel_id: String,
    #[serde(default = "default_limit")]
    limit: usize,
    before: Option<String>,
}

fn default_limit() -> usize {
    50
}

async fn messages(
    State(registry): State<Arc<GatewayRegistry>>,
    Query(q): Query<MessagesQuery>,
) -> Result<Json<Value>, FleetError> {
    let identity = registry.require(&q.bot).await?;
    let events = rest::recent_messages(&identity, &q.channel_id, q.limit, q.before.as_deref()).await?;
    Ok(Json(json!({"messages": events})))
}

#[derive(Debug, Deserialize)]
struct ChannelsQuery {
    bot: String,
    guild_id: String,
}

async fn channels(
    State(registry): State<Arc<GatewayRegistry>>,
    Query(q): Query<ChannelsQuery>,
) -> Result<Json<Value>, FleetError> {
    let identity = registry.require(&q.bot).await?;
    let channels = rest::list_channels(&identity, &q.guild_id).await?;
    Ok(Json(channels))
}

#[derive(Debug, Deserialize)]
struct GuildQuery {
    bot: String,
    guild_id: String,
}

async fn guild(
    State(registry): State<Arc<GatewayRegistry>>,
    Query(q): Query<GuildQuery>,
) -> Result<Json<Value>, FleetError> {
    let identity = registry.require(&q.bot).await?;
    let guild = rest::get_guild(&identity, &q.guild_id).await?;
    Ok(Json(guild))
}

async fn attachment_info(
    State(registry): State<Arc<GatewayRegistry>>,
    Path((bot, channel_id, message_id)): Path<(String, String, String)>,
) -> Result<Json<Value>, FleetError> {
    let identity = registry.require(&bot).await?;
    let messages = rest::recent_messages(&identity, &channel_id, 100, None).await?;
    let found = messages
        .into_iter()
        .find(|m| m.message_id == message_id)
        .ok_or_else(|| FleetError::NotFound(format!("message {message_id} not found in {channel_id}")))?;
    Ok(Json(json!({"attachments": found.attachments})))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    filename: String,
}

/// `GET /attachments/{bot}/{channel_id}/{message_id}/download?filename=…`
/// (spec.md §4.2). Looks up the attachment's CDN URL via the message history
/// and proxies its bytes through, so callers never need Discord CDN access
/// of their own.
async fn attachment_download(
    State(registry): State<Arc<GatewayRegistry>>,
    Path((bot, channel_id, message_id)): Path<(String, String, String)>,
    Query(q): Query<DownloadQuery>,
) -> Result<Response, FleetError> {
    let identity = registry.require(&bot).await?;
    let messages = rest::recent_messages(&identity, &channel_id, 100, None).await?;
    let found = messages
        .into_iter()
        .find(|m| m.message_id == message_id)
        .ok_or_else(|| FleetError::NotFound(format!("message {message_id} not found in {channel_id}")))?;
    let attachment = found
        .attachments
        .into_iter()
        .find(|a| a.filename == q.filename)
        .ok_or_else(|| FleetError::NotFound(format!("attachment `{}` not found on message {message_id}", q.filename)))?;

    let resp = identity
        .http()
        .get(&attachment.url)
        .send()
        .await
        .map_err(|e| FleetError::transport(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(FleetError::transport(format!("attachment fetch failed: {}", resp.status())));
    }
    let content_type = attachment.content_type.unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = resp.bytes().await.map_err(|e| FleetError::transport(e.to_string()))?;
    Ok(Response::builder()
        .header("content-type", content_type)
        .header("content-disposition", format!("attachment; filename=\"{}\"", attachment.filename))
        .body(axum::body::Body::from(bytes))
        .unwrap()
        .into_response())
}

async fn bots(State(registry): State<Arc<GatewayRegistry>>) -> Json<Value> {
    let identities = registry.list().await;
    let statuses: Vec<BotStatus> = identities
        .iter()
        .map(|i| BotStatus {
            id: i.id.clone(),
            user_id: i.user_id().map(String::from),
            display_name: i.display_name().map(String::from),
            state: i.state(),
        })
        .collect();
    Json(json!(statuses))
}

async fn health(State(registry): State<Arc<GatewayRegistry>>) -> Json<Value> {
    let identities = registry.list().await;
    let per_identity: Vec<Value> = identities
        .iter()
        .map(|i| {
            json!({
                "id": i.id,
                "state": i.state(),
                "dropped_events": i.dropped_event_count(),
            })
        })
        .collect();
    Json(json!({"identities": per_identity}))
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    bot: String,
    subscriber_id: String,
}

/// Long-lived streaming subscription (spec.md §4.2): newline-delimited JSON
/// `InboundEvent`s, one connection per `(bot_identity, subscriber_id)`.
async fn subscribe(
    State(registry): State<Arc<GatewayRegistry>>,
    Query(q): Query<SubscribeQuery>,
) -> Result<Response, FleetError> {
    let identity = registry.require(&q.bot).await?;
    tracing::debug!(bot = %q.bot, subscriber = %q.subscriber_id, "subscription opened");
    let mut rx = identity.subscribe();
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_vec(&event).unwrap_or_default();
            line.push(b'\n');
            yield Ok::<_, std::convert::Infallible>(line);
        }
    };
    let body = axum::body::Body::from_stream(stream.map(|r| r.map(axum::body::Bytes::from)));
    Ok(Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(body)
        .unwrap()
        .into_response())
}
