// ── Providers: OpenAI-Compatible ─────────────────────────────────────────────
// Handles OpenAI and xAI (Grok) — and any future provider that speaks the
// OpenAI chat-completions wire format — behind one implementation.

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

static OPENAI_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(CircuitBreaker::with_defaults);

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
    provider_name: &'static str,
}

impl OpenAiProvider {
    pub fn new(conn: &ProviderConnection) -> Self {
        let base_url = conn
            .base_url
            .clone()
            .unwrap_or_else(|| conn.kind.default_base_url().to_string());
        let provider_name = match conn.kind {
            crate::atoms::types::ProviderKind::Grok => "grok",
            _ => "openai",
        };
        Self { client: super::default_http_client(), base_url, api_key: conn.api_key.clone(), provider_name }
    }

    fn format_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({"role": role, "content": m.content})
            })
            .collect()
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.provider_name
    }

    async fn chat(&self, messages: &[Message], model: &str) -> Result<ChatOutcome, FleetError> {
        OPENAI_CIRCUIT.check().map_err(|e| FleetError::provider(self.provider_name, e))?;

        let body = json!({
            "model": model,
            "messages": Self::format_messages(messages),
        });

        for attempt in 0..=MAX_RETRIES {
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(self.api_key.as_str())
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    OPENAI_CIRCUIT.record_failure();
                    if attempt < MAX_RETRIES {
                        retry_delay(attempt, None).await;
                        continue;
                    }
                    return Err(FleetError::transport(format!("{} request failed: {e}", self.provider_name)));
                }
            };

            let status = response.status();
            if status == 401 || status == 403 {
                OPENAI_CIRCUIT.record_failure();
                return Err(FleetError::provider(self.provider_name, format!("auth rejected: {status}")));
            }
            if is_retryable_status(status.as_u16()) {
                OPENAI_CIRCUIT.record_failure();
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
                OPENAI_CIRCUIT.record_failure();
                let text = response.text().await.unwrap_or_default();
                return Err(FleetError::provider(self.provider_name, format!("{status}: {text}")));
            }

            OPENAI_CIRCUIT.record_success();
            let parsed: Value = response
                .json()
                .await
                .map_err(|e| FleetError::provider(self.provider_name, format!("invalid response body: {e}")))?;
            let text = parsed["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
            let usage = parsed.get("usage").map(|u| TokenUsage {
                input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
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
    fn formats_roles_as_openai_strings() {
        let messages = vec![
            Message { role: Role::System, content: "s".into() },
            Message { role: Role::User, content: "u".into() },
            Message { role: Role::Assistant, content: "a".into() },
        ];
        let formatted = OpenAiProvider::format_messages(&messages);
        assert_eq!(formatted[0]["role"], "system");
        assert_eq!(formatted[1]["role"], "user");
        assert_eq!(formatted[2]["role"], "assistant");
    }
}
