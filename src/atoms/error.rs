// ── Atoms: Error Types ─────────────────────────────────────────────────────
// Single canonical error enum for the crate, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain, matching the taxonomy every
//     component converts into at its boundary (Config/Transport/RateLimited/
//     Provider/Embedding/HandleLost/PermissionDenied/Overloaded).
//   • `#[from]` wires mechanical std/external error conversions automatically.
//   • No variant carries secret material (bot tokens, API keys) in its message.
//   • Only `Config` is fatal at process startup; everything else is handled
//     by the component that produced it (retry, degrade, or state transition).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration parse failure.
    #[error("config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// SQLite / rusqlite database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Container engine (bollard/Docker) failure.
    #[error("container engine error: {0}")]
    Container(#[from] bollard::errors::Error),

    /// Declarative configuration is invalid: duplicate tokens, missing
    /// secrets, unknown provider, embedding dimension mismatch. Fatal at
    /// startup; never retried.
    #[error("config error: {0}")]
    Config(String),

    /// Network/IO failure against the Gateway, memory backend, LM provider,
    /// or container engine. Retryable with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream 429 or an internal bucket throttling. Queue and retry after
    /// `retry_after_secs` once it elapses.
    #[error("rate limited{}", retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// The language-model provider returned a structured failure.
    #[error("provider error ({provider}): {message}")]
    ProviderError { provider: String, message: String },

    /// The embedding endpoint failed. Conversation turns degrade (proceed
    /// without memory augmentation); memory `store` calls fail outright.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Memory backend could not persist a record after its embedding was
    /// computed successfully.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A container or process handle vanished or exited unexpectedly. Drives
    /// the instance state machine into `crash_loop`.
    #[error("handle lost: {0}")]
    HandleLost(String),

    /// The engine or Discord forbade the requested action. Surfaced, never
    /// retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Local queues or buffers are saturated. Drop-oldest for event fan-out,
    /// 503 for HTTP callers.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// The resolved bot identity exists but has not reached `ready` (spec.md
    /// §6 "identity degraded"). The one legitimate 503 case — distinct from
    /// generic transport/provider/container failures, which are 500s.
    #[error("identity degraded: {0}")]
    IdentityDegraded(String),

    /// Requested bot identity is not registered with the Gateway.
    #[error("unknown bot: {0}")]
    UnknownBot(String),

    /// Requested channel is not visible to the resolved bot identity.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// A resolved operation was requested against a spec_id with no live
    /// instance, or a deploy was requested against one that already has one.
    #[error("not found: {0}")]
    NotFound(String),

    /// File payload exceeds the configured attachment size ceiling.
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// Two distinct `AgentSpec`s resolved to the same Discord bot token.
    #[error("duplicate bot token: {0}")]
    DuplicateBotToken(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl FleetError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError { provider: provider.into(), message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn identity_degraded(message: impl Into<String>) -> Self {
        Self::IdentityDegraded(message.into())
    }

    /// Classifies this error per the taxonomy's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Transport(_)
                | FleetError::RateLimited { .. }
                | FleetError::Overloaded(_)
                | FleetError::IdentityDegraded(_)
        )
    }

    /// Stable machine-readable kind for `{error_kind, message, retry_after?}` bodies.
    pub fn error_kind(&self) -> &'static str {
        match self {
            FleetError::Io(_) => "io_error",
            FleetError::Serialization(_) => "serialization_error",
            FleetError::TomlParse(_) => "config_error",
            FleetError::Database(_) => "store_unavailable",
            FleetError::Container(_) => "transport_error",
            FleetError::Config(_) => "config_error",
            FleetError::Transport(_) => "transport_error",
            FleetError::RateLimited { .. } => "rate_limited",
            FleetError::ProviderError { .. } => "provider_error",
            FleetError::EmbeddingUnavailable(_) => "embedding_unavailable",
            FleetError::StoreUnavailable(_) => "store_unavailable",
            FleetError::HandleLost(_) => "handle_lost",
            FleetError::PermissionDenied(_) => "permission_denied",
            FleetError::Overloaded(_) => "overloaded",
            FleetError::IdentityDegraded(_) => "identity_degraded",
            FleetError::UnknownBot(_) => "unknown_bot",
            FleetError::UnknownChannel(_) => "unknown_channel",
            FleetError::NotFound(_) => "not_found",
            FleetError::FileTooLarge(_) => "file_too_large",
            FleetError::DuplicateBotToken(_) => "duplicate_bot_token",
            FleetError::Other(_) => "other",
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            FleetError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

impl From<String> for FleetError {
    fn from(s: String) -> Self {
        FleetError::Other(s)
    }
}

impl From<&str> for FleetError {
    fn from(s: &str) -> Self {
        FleetError::Other(s.to_string())
    }
}

impl From<FleetError> for String {
    fn from(e: FleetError) -> Self {
        e.to_string()
    }
}

// ── Gateway HTTP surface: status code mapping (spec.md §6) ─────────────────

impl IntoResponse for FleetError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            FleetError::Config(_) | FleetError::DuplicateBotToken(_) => StatusCode::CONFLICT,
            FleetError::UnknownBot(_) | FleetError::UnknownChannel(_) | FleetError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            FleetError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            FleetError::Overloaded(_) | FleetError::IdentityDegraded(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            FleetError::Serialization(_) | FleetError::FileTooLarge(_) => StatusCode::BAD_REQUEST,
            // Transport/container/provider/embedding/store/handle-lost are
            // generic backend failures, not a degraded identity (spec.md §6).
            FleetError::Transport(_)
            | FleetError::Container(_)
            | FleetError::ProviderError { .. }
            | FleetError::EmbeddingUnavailable(_)
            | FleetError::StoreUnavailable(_)
            | FleetError::HandleLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error_kind": self.error_kind(),
            "message": self.to_string(),
            "retry_after": self.retry_after_secs(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_token_maps_to_conflict() {
        let err = FleetError::DuplicateBotToken("TOKEN_X".into());
        assert_eq!(err.error_kind(), "duplicate_bot_token");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = FleetError::RateLimited { retry_after_secs: Some(5) };
        assert_eq!(err.retry_after_secs(), Some(5));
        assert!(err.is_retryable());
    }

    #[test]
    fn config_error_is_not_retryable() {
        let err = FleetError::config("duplicate token");
        assert!(!err.is_retryable());
    }

    #[test]
    fn identity_degraded_is_retryable_and_named() {
        let err = FleetError::identity_degraded("bot `a1` is not ready");
        assert!(err.is_retryable());
        assert_eq!(err.error_kind(), "identity_degraded");
    }

    #[test]
    fn transport_and_identity_degraded_map_to_distinct_statuses() {
        let transport = FleetError::transport("connection reset").into_response();
        assert_eq!(transport.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let degraded = FleetError::identity_degraded("bot `a1` is not ready").into_response();
        assert_eq!(degraded.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
