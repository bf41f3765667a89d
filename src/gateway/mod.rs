// ── Discord Gateway (C2) ─────────────────────────────────────────────────────
// A single process holds every live Discord connection; everything else
// talks to it over HTTP (spec.md §4.2). `registry`/`identity` own the
// in-process connection state this binary serves; `api` exposes it as axum
// routes; `http_client` is the caller-side `GatewayClient` every other
// component (Conversation Engine, Supervisor) uses instead of touching
// Discord directly.

pub mod api;
pub mod http_client;
pub mod identity;
pub mod local_client;
pub mod registry;
pub mod rest;

pub use http_client::GatewayHttpClient;
pub use identity::BotIdentity;
pub use local_client::LocalGatewayClient;
pub use registry::GatewayRegistry;
pub use rest::split_message;
