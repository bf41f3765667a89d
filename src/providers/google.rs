// ── Providers: Google Gemini ──────────────────────────────────────────────────

use super::http::{is_retryable_status, parse_retry_after, retry_delay, CircuitBreaker, MAX_RETRIES};
use super::ProviderConnection;
use crate::atoms::error::FleetError;
use crate::atoms::traits::{AiProvider, ChatOutcome};
use crate::atoms::types::{Message, Role};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;
use zeroize::Zeroizing;

static GOOGLE_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(CircuitBreaker::with_defaults);

pub struct GoogleProvider {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl GoogleProvider {
    pub fn new(conn: &ProviderConnection) -> Self {
        let base_url = conn
            .base_url
            .clone()
            .unwrap_or_else(|| conn.kind.default_base_url().to_string());
        Self { client: super::default_http_client(), base_url, api_key: conn.api_key.clone() }
    }

    fn format_messages(messages: &[Message]) -> (Option<Value>, Vec<Value>) {
        let mut system_instruction: Option<Value> = None;
        let mut contents = Vec::new();
        for m in messages {
            if m.role == Role::System {
                system_instruction = Some(match system_instruction {
                    Some(mut existing) => {
                        let prev = existing["parts"][0]["text"].as_str().unwrap_or("").to_string();
                        existing["parts"][0]["text"] = json!(format!("{prev}\n\n{}", m.content));
                        existing
                    }
                    None => json!({"parts": [{"text": m.content}]}),
                });
                continue;
            }
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
                Role::System => unreachable!(),
            };
            contents.push(json!({"role": role, "parts": [{"text": m.content}]}));
        }
        (system_instruction, contents)
    }
}

#[async_trait]
impl AiProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn chat(&self, messages: &[Message], model: &str) -> Result<ChatOutcome, FleetError> {
        GOOGLE_CIRCUIT.check().map_err(|e| FleetError::provider("google", e))?;

        let (system_instruction, contents) = Self::format_messages(messages);
        let mut body = json!({"contents": contents});
        if let Some(sys) = system_instruction {
            body["systemInstruction"] = sys;
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url,
            model,
            self.api_key.as_str()
        );

        for attempt in 0..=MAX_RETRIES {
            let response = self.client.post(&url).json(&body).send().await;
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    GOOGLE_CIRCUIT.record_failure();
                    if attempt < MAX_RETRIES {
                        retry_delay(attempt, None).await;
                        continue;
                    }
                    return Err(FleetError::transport(format!("google request failed: {e}")));
                }
            };

            let status = response.status();
            if status == 401 || status == 403 {
                GOOGLE_CIRCUIT.record_failure();
                return Err(FleetError::provider("google", format!("auth rejected: {status}")));
            }
            if is_retryable_status(status.as_u16()) {
                GOOGLE_CIRCUIT.record_failure();
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
                GOOGLE_CIRCUIT.record_failure();
                let text = response.text().await.unwrap_or_default();
                return Err(FleetError::provider("google", format!("{status}: {text}")));
            }

            GOOGLE_CIRCUIT.record_success();
            let parsed: Value =
                response.json().await.map_err(|e| FleetError::provider("google", format!("invalid response body: {e}")))?;
            let text = parsed["candidates"][0]["content"]["parts"][0]["text"].as_str().unwrap_or_default().to_string();
            return Ok(ChatOutcome { text, usage: None });
        }
        unreachable!("retry loop always returns or errors")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_role_maps_to_model() {
        let messages = vec![Message { role: Role::Assistant, content: "ok".into() }];
        let (_, contents) = GoogleProvider::format_messages(&messages);
        assert_eq!(contents[0]["role"], "model");
    }

    #[test]
    fn system_messages_merge_into_instruction() {
        let messages = vec![
            Message { role: Role::System, content: "a".into() },
            Message { role: Role::System, content: "b".into() },
            Message { role: Role::User, content: "hi".into() },
        ];
        let (system, contents) = GoogleProvider::format_messages(&messages);
        assert_eq!(system.unwrap()["parts"][0]["text"], "a\n\nb");
        assert_eq!(contents.len(), 1);
    }
}
