// ── Memory: Embedding Client ─────────────────────────────────────────────────
// Calls an Ollama or OpenAI-compatible embedding endpoint to turn text into a
// fixed-dimension vector (spec.md §4.1: "computes the embedding via an
// external embedding endpoint"). Failures surface as `EmbeddingUnavailable`
// so callers can degrade per spec.md §7 rather than crash the turn.

use crate::atoms::error::{FleetError, FleetResult};
use crate::providers::CircuitBreaker;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;

static EMBEDDING_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(CircuitBreaker::with_defaults);

pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(crate::atoms::constants::EMBEDDING_CALL_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    /// Embeds `text`, trying Ollama's current `/api/embed`, its legacy
    /// `/api/embeddings`, then an OpenAI-compatible `/v1/embeddings` in turn.
    pub async fn embed(&self, text: &str) -> FleetResult<Vec<f32>> {
        EMBEDDING_CIRCUIT
            .check()
            .map_err(FleetError::EmbeddingUnavailable)?;

        match self.embed_ollama(text).await {
            Ok(v) => {
                EMBEDDING_CIRCUIT.record_success();
                return Ok(v);
            }
            Err(ollama_err) => match self.embed_openai(text).await {
                Ok(v) => {
                    EMBEDDING_CIRCUIT.record_success();
                    Ok(v)
                }
                Err(openai_err) => {
                    EMBEDDING_CIRCUIT.record_failure();
                    Err(FleetError::EmbeddingUnavailable(format!(
                        "ollama: {ollama_err} | openai-compat: {openai_err}"
                    )))
                }
            },
        }
    }

    async fn embed_ollama(&self, text: &str) -> Result<Vec<f32>, String> {
        let new_url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = json!({"model": self.model, "input": text});
        if let Ok(resp) = self.client.post(&new_url).json(&body).send().await {
            if resp.status().is_success() {
                if let Ok(v) = resp.json::<Value>().await {
                    if let Some(first) = v["embeddings"].as_array().and_then(|e| e.first()).and_then(|e| e.as_array()) {
                        let vec = parse_f32_array(first);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                    if let Some(embedding) = v["embedding"].as_array() {
                        let vec = parse_f32_array(embedding);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                }
            }
        }

        let legacy_url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let legacy_body = json!({"model": self.model, "prompt": text});
        let resp = self
            .client
            .post(&legacy_url)
            .json(&legacy_body)
            .send()
            .await
            .map_err(|e| format!("ollama unreachable at {}: {e}", self.base_url))?;
        if !resp.status().is_success() {
            return Err(format!("ollama embed {}: {}", resp.status(), resp.text().await.unwrap_or_default()));
        }
        let v: Value = resp.json().await.map_err(|e| e.to_string())?;
        let embedding = v["embedding"].as_array().ok_or("no `embedding` array in ollama response")?;
        let vec = parse_f32_array(embedding);
        if vec.is_empty() {
            return Err("empty embedding vector from ollama".to_string());
        }
        Ok(vec)
    }

    async fn embed_openai(&self, text: &str) -> Result<Vec<f32>, String> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({"model": self.model, "input": text});
        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("openai-compat embed {}: {}", resp.status(), resp.text().await.unwrap_or_default()));
        }
        let v: Value = resp.json().await.map_err(|e| e.to_string())?;
        let embedding = v["data"][0]["embedding"].as_array().ok_or("no `data[0].embedding` in response")?;
        let vec = parse_f32_array(embedding);
        if vec.is_empty() {
            return Err("empty embedding vector from openai-compat endpoint".to_string());
        }
        Ok(vec)
    }

    /// Round-trips a trivial embed call; used by `memory.health()`.
    pub async fn health(&self) -> FleetResult<()> {
        self.embed("health check").await.map(|_| ())
    }
}

fn parse_f32_array(values: &[Value]) -> Vec<f32> {
    values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_f32_values() {
        let values = vec![json!(0.1), json!(0.2), json!(0.3)];
        assert_eq!(parse_f32_array(&values), vec![0.1f32, 0.2, 0.3]);
    }

    #[test]
    fn skips_non_numeric_entries() {
        let values = vec![json!(0.1), json!("oops"), json!(0.3)];
        assert_eq!(parse_f32_array(&values), vec![0.1f32, 0.3]);
    }
}
