// ── Providers ────────────────────────────────────────────────────────────────
// Pluggable language-model adapters (spec.md §3 `llm.provider ∈ {grok,
// anthropic, google, openai}`). spec.md treats these as an external
// collaborator with a known request/response shape (Non-goals); this module
// implements the thin wire adapters the Conversation Engine calls through
// the `AiProvider` trait, plus the retry/circuit-breaker plumbing every one
// of them shares.

mod anthropic;
mod google;
mod http;
mod openai;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use http::{is_retryable_status, parse_retry_after, reconnect_delay, retry_delay, CircuitBreaker, MAX_RETRIES};
pub use openai::OpenAiProvider;

use crate::atoms::traits::AiProvider;
use crate::atoms::types::ProviderKind;
use std::time::Duration;
use zeroize::Zeroizing;

/// Connection parameters resolved for one provider instance: the secret has
/// already been pulled out of the `SecretResolver` by the caller.
pub struct ProviderConnection {
    pub kind: ProviderKind,
    pub api_key: Zeroizing<String>,
    pub base_url: Option<String>,
}

/// Type-erased provider handle. New OpenAI-compatible wire formats need no
/// new code — only a new `ProviderKind` variant and a base-URL default;
/// a genuinely new wire format gets its own file and match arm here.
pub struct AnyProvider(Box<dyn AiProvider>);

impl AnyProvider {
    pub fn from_connection(conn: &ProviderConnection) -> Self {
        let provider: Box<dyn AiProvider> = match conn.kind {
            ProviderKind::Anthropic => Box::new(AnthropicProvider::new(conn)),
            ProviderKind::Google => Box::new(GoogleProvider::new(conn)),
            // Grok and OpenAI both speak the OpenAI chat-completions wire
            // format; `OpenAiProvider` is the catch-all for any such
            // provider, distinguished only by base URL.
            ProviderKind::Grok | ProviderKind::OpenAI => Box::new(OpenAiProvider::new(conn)),
        };
        Self(provider)
    }

    /// Builds directly into the `Arc<dyn AiProvider>` shape the Conversation
    /// Engine holds, skipping the intermediate newtype.
    pub fn shared_from_connection(conn: &ProviderConnection) -> std::sync::Arc<dyn AiProvider> {
        std::sync::Arc::from(Self::from_connection(conn).0)
    }
}

impl std::ops::Deref for AnyProvider {
    type Target = dyn AiProvider;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

pub(crate) fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(crate::atoms::constants::LM_CALL_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}
