// ── Gateway: Discord REST Helpers ────────────────────────────────────────────
// Outbound HTTP calls against Discord's REST API on behalf of one
// `BotIdentity`. Grounded on the teacher's `send_message`/`send_typing`
// helpers in `engine/discord.rs`, generalized to the full surface spec.md
// §4.2 requires (send, send-file, message history, channel/guild info,
// attachments) and wired through the shared retry/circuit-breaker plumbing.

use crate::atoms::constants::DISCORD_MESSAGE_MAX_CHARS;
use crate::atoms::error::FleetError;
use crate::atoms::types::{Attachment, InboundEvent};
use crate::gateway::identity::BotIdentity;
use crate::providers::{is_retryable_status, parse_retry_after};
use serde_json::{json, Value};

/// Largest byte index `<= index` that lands on a UTF-8 char boundary of `s`.
/// `str::floor_char_boundary` is nightly-only, so this walks back by hand.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Splits `text` into chunks no longer than `max_chars` **bytes**, preferring
/// to break on a newline boundary so Discord's 2000-char limit never
/// truncates mid-word (spec.md §6 "Discord wire limits"). Never slices on a
/// byte offset that falls inside a multibyte codepoint (spec.md §8 "no
/// panics on valid input") — a single codepoint is never split even if that
/// makes one chunk a few bytes over `max_chars`.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_chars {
        let mut limit = floor_char_boundary(rest, max_chars);
        if limit == 0 {
            // The very first codepoint already exceeds max_chars; keep it
            // whole rather than slicing into it.
            limit = rest.char_indices().nth(1).map(|(i, _)| i).unwrap_or(rest.len());
        }
        let boundary = rest[..limit].rfind('\n').unwrap_or(limit);
        let boundary = if boundary == 0 { limit } else { boundary };
        chunks.push(rest[..boundary].to_string());
        rest = rest[boundary..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn map_status(status: reqwest::StatusCode, body: &str) -> FleetError {
    match status.as_u16() {
        401 | 403 => FleetError::PermissionDenied(body.to_string()),
        404 => FleetError::UnknownChannel(body.to_string()),
        429 => FleetError::RateLimited { retry_after_secs: parse_retry_after(body) },
        _ => FleetError::transport(format!("{status}: {body}")),
    }
}

/// `POST /send` (spec.md §4.2). Sends (optionally chunked) text, threaded if
/// `reply_to` names a message in a thread context. Returns the id of the
/// last chunk sent.
pub async fn send_message(
    identity: &BotIdentity,
    channel_id: &str,
    content: &str,
    reply_to: Option<&str>,
) -> Result<String, FleetError> {
    let mut last_id = String::new();
    for (i, chunk) in split_message(content, DISCORD_MESSAGE_MAX_CHARS).into_iter().enumerate() {
        let mut body = json!({"content": chunk});
        // Only thread the first chunk off the triggering message.
        if i == 0 {
            if let Some(msg_id) = reply_to {
                body["message_reference"] = json!({"message_id": msg_id});
            }
        }
        last_id = post_message(identity, channel_id, body).await?;
    }
    Ok(last_id)
}

async fn post_message(identity: &BotIdentity, channel_id: &str, body: Value) -> Result<String, FleetError> {
    let url = format!("{}/channels/{}/messages", identity.api_base(), channel_id);
    for attempt in 0..=crate::providers::MAX_RETRIES {
        let resp = identity
            .http()
            .post(&url)
            .header("Authorization", format!("Bot {}", identity.token()))
            .json(&body)
            .send()
            .await
            .map_err(|e| FleetError::transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            let parsed: Value = resp.json().await.map_err(|e| FleetError::transport(e.to_string()))?;
            return Ok(parsed["id"].as_str().unwrap_or_default().to_string());
        }
        let text = resp.text().await.unwrap_or_default();
        if is_retryable_status(status.as_u16()) && attempt < crate::providers::MAX_RETRIES {
            let retry_after = parse_retry_after(&text);
            crate::providers::retry_delay(attempt, retry_after).await;
            continue;
        }
        return Err(map_status(status, &text));
    }
    unreachable!("retry loop always returns or errors")
}

/// `POST /send-file` (spec.md §4.2).
pub async fn send_file(
    identity: &BotIdentity,
    channel_id: &str,
    filename: &str,
    bytes: Vec<u8>,
    content: Option<&str>,
    max_bytes: u64,
) -> Result<String, FleetError> {
    if bytes.len() as u64 > max_bytes {
        return Err(FleetError::FileTooLarge(format!("{} exceeds {max_bytes} bytes", bytes.len())));
    }
    let url = format!("{}/channels/{}/messages", identity.api_base(), channel_id);
    let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
    let mut form = reqwest::multipart::Form::new().part("files[0]", part);
    if let Some(c) = content {
        let payload = json!({"content": c});
        form = form.text("payload_json", payload.to_string());
    }
    let resp = identity
        .http()
        .post(&url)
        .header("Authorization", format!("Bot {}", identity.token()))
        .multipart(form)
        .send()
        .await
        .map_err(|e| FleetError::transport(e.to_string()))?;
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(map_status(status, &text));
    }
    let parsed: Value = serde_json::from_str(&text).map_err(|e| FleetError::transport(e.to_string()))?;
    Ok(parsed["id"].as_str().unwrap_or_default().to_string())
}

/// `GET /messages?bot&channel_id&limit&before?` (spec.md §4.2).
pub async fn recent_messages(
    identity: &BotIdentity,
    channel_id: &str,
    limit: usize,
    before: Option<&str>,
) -> Result<Vec<InboundEvent>, FleetError> {
    let mut url = format!(
        "{}/channels/{}/messages?limit={}",
        identity.api_base(),
        channel_id,
        limit.clamp(1, 100)
    );
    if let Some(b) = before {
        url.push_str(&format!("&before={b}"));
    }
    let resp = identity
        .http()
        .get(&url)
        .header("Authorization", format!("Bot {}", identity.token()))
        .send()
        .await
        .map_err(|e| FleetError::transport(e.to_string()))?;
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(map_status(status, &text));
    }
    let raw: Vec<Value> = serde_json::from_str(&text).map_err(|e| FleetError::transport(e.to_string()))?;
    let mut events: Vec<InboundEvent> = raw
        .into_iter()
        .filter_map(|m| parse_history_message(identity, channel_id, &m))
        .collect();
    // Discord returns newest-first; spec.md §4.3 wants oldest→newest.
    events.reverse();
    Ok(events)
}

fn parse_history_message(identity: &BotIdentity, channel_id: &str, m: &Value) -> Option<InboundEvent> {
    Some(InboundEvent {
        bot_identity_id: identity.id.clone(),
        channel_id: channel_id.to_string(),
        thread_id: None,
        message_id: m["id"].as_str()?.to_string(),
        author_id: m["author"]["id"].as_str()?.to_string(),
        is_bot_author: m["author"]["bot"].as_bool().unwrap_or(false),
        content: m["content"].as_str().unwrap_or_default().to_string(),
        attachments: m["attachments"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| {
                        Some(Attachment {
                            filename: a["filename"].as_str()?.to_string(),
                            url: a["url"].as_str()?.to_string(),
                            content_type: a["content_type"].as_str().map(String::from),
                            size_bytes: a["size"].as_u64().unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        timestamp: m["timestamp"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now),
    })
}

/// `GET /channels?bot&guild_id?` (spec.md §4.2).
pub async fn list_channels(identity: &BotIdentity, guild_id: &str) -> Result<Value, FleetError> {
    let url = format!("{}/guilds/{}/channels", identity.api_base(), guild_id);
    get_json(identity, &url).await
}

/// `GET /guild?bot&guild_id` (spec.md §4.2).
pub async fn get_guild(identity: &BotIdentity, guild_id: &str) -> Result<Value, FleetError> {
    let url = format!("{}/guilds/{}", identity.api_base(), guild_id);
    get_json(identity, &url).await
}

async fn get_json(identity: &BotIdentity, url: &str) -> Result<Value, FleetError> {
    let resp = identity
        .http()
        .get(url)
        .header("Authorization", format!("Bot {}", identity.token()))
        .send()
        .await
        .map_err(|e| FleetError::transport(e.to_string()))?;
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(map_status(status, &text));
    }
    serde_json::from_str(&text).map_err(|e| FleetError::transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_single_chunk() {
        let chunks = split_message("hello", 1950);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn long_message_splits_on_newline_boundary() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 12);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(10));
        assert_eq!(chunks[1], "b".repeat(10));
    }

    #[test]
    fn forces_a_hard_break_when_no_newline_exists() {
        let text = "x".repeat(30);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
    }

    #[test]
    fn never_splits_a_multibyte_codepoint() {
        // Each emoji is 4 bytes; a max_chars that lands mid-codepoint must
        // not panic and must not produce invalid UTF-8 chunks.
        let text = "😀".repeat(20);
        let chunks = split_message(&text, 10);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.is_char_boundary(0));
            assert!(chunk.is_char_boundary(chunk.len()));
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn accented_and_cjk_text_splits_without_panicking() {
        let text = "héllo wörld ".repeat(50) + &"日本語のテスト".repeat(10);
        let chunks = split_message(&text, 1950);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.is_char_boundary(0));
            assert!(chunk.is_char_boundary(chunk.len()));
        }
        assert_eq!(chunks.concat().chars().count(), text.chars().count());
    }
}
