// ── Providers: Anthropic ─────────────────────────────────────────────────────
// Implements the `AiProvider` trait against Anthropic's Messages API.

use super::http::{is_retryable_status, parse_retry_after, retry_delay, CircuitBreaker, MAX_RETRIES};
use super::ProviderConnection;
use crate::atoms::error::FleetError;
use crate::atoms::traits::{AiProvider, ChatOutcome};
use crate::atoms::types::{Message, Role, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;
use zeroize::Zeroizing;

static ANTHROPIC_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(CircuitBreaker::with_defaults);

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl AnthropicProvider {
    pub fn new(conn: &ProviderConnection) -> Self {
        let base_url = conn
            .base_url
            .clone()
            .unwrap_or_else(|| conn.kind.default_base_url().to_string());
        Self { client: super::default_http_client(), base_url, api_key: conn.api_key.clone() }
    }

    fn format_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut turns = Vec::new();
        for m in messages {
            match m.role {
                Role::System => {
                    system = Some(match system {
                        Some(prev) => format!("{prev}\n\n{}", m.content),
                        None => m.content.clone(),
                    });
                }
                Role::User => turns.push(json!({"role": "user", "content": m.content})),
                Role::Assistant => turns.push(json!({"role": "assistant", "content": m.content})),
            }
        }
        (system, turns)
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, messages: &[Message], model: &str) -> Result<ChatOutcome, FleetError> {
        ANTHROPIC_CIRCUIT.check().map_err(|e| FleetError::provider("anthropic", e))?;

        let (system, turns) = Self::format_messages(messages);
        let mut body = json!({
            "model": model,
            "max_tokens": 4096,
            "messages": turns,
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }

        for attempt in 0..=MAX_RETRIES {
            let response = self
                .client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", self.api_key.as_str())
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    ANTHROPIC_CIRCUIT.record_failure();
                    if attempt < MAX_RETRIES {
                        retry_delay(attempt, None).await;
                        continue;
                    }
                    return Err(FleetError::transport(format!("anthropic request failed: {e}")));
                }
            };

            let status = response.status();
            if status == 401 || status == 403 {
                ANTHROPIC_CIRCUIT.record_failure();
                return Err(FleetError::provider("anthropic", format!("auth rejected: {status}")));
            }
            if is_retryable_status(status.as_u16()) {
                ANTHROPIC_CIRCUIT.record_failure();
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                if attempt < MAX_RETRIES {
                    retry_delay(attempt, retry_after).await;
                    continue;
                }
                return Err(FleetError::RateLimited { retry_after_secs: retry_after });
            }
            if !status.is_success() {
                ANTHROPIC_CIRCUIT.record_failure();
                let text = response.text().await.unwrap_or_default();
                return Err(FleetError::provider("anthropic", format!("{status}: {text}")));
            }

            ANTHROPIC_CIRCUIT.record_success();
            let parsed: Value = response
                .json()
                .await
                .map_err(|e| FleetError::provider("anthropic", format!("invalid response body: {e}")))?;
            let text = parsed["content"]
                .as_array()
                .and_then(|blocks| blocks.iter().find_map(|b| b["text"].as_str()))
                .unwrap_or_default()
                .to_string();
            let usage = parsed.get("usage").map(|u| TokenUsage {
                input_tokens: u["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: u["output_tokens"].as_u64().unwrap_or(0) as u32,
            });
            return Ok(ChatOutcome { text, usage });
        }
        unreachable!("retry loop always returns or errors")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_system_and_turns_separately() {
        let messages = vec![
            Message { role: Role::System, content: "be terse".into() },
            Message { role: Role::User, content: "hi".into() },
        ];
        let (system, turns) = AnthropicProvider::format_messages(&messages);
        assert_eq!(system.as_deref(), Some("be terse"));
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn merges_multiple_system_messages() {
        let messages = vec![
            Message { role: Role::System, content: "first".into() },
            Message { role: Role::System, content: "second".into() },
        ];
        let (system, _) = AnthropicProvider::format_messages(&messages);
        assert_eq!(system.as_deref(), Some("first\n\nsecond"));
    }
}
