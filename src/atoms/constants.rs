// ── Atoms: Constants ────────────────────────────────────────────────────────
// All named constants for the crate live here. Collecting them in one place
// eliminates magic numbers and keeps every layer's code self-documenting.

// ── Memory search (spec.md §4.1) ────────────────────────────────────────────
pub const MEMORY_SEARCH_DEFAULT_K: usize = 5;
pub const MEMORY_SEARCH_MAX_K: usize = 100;

// ── Gateway backpressure (spec.md §5) ───────────────────────────────────────
// Bounded buffer per subscription; overflow policy is drop-oldest.
pub const SUBSCRIPTION_BUFFER_SIZE: usize = 256;

// ── Deadlines (spec.md §5) ───────────────────────────────────────────────────
pub const LM_CALL_TIMEOUT_SECS: u64 = 60;
pub const EMBEDDING_CALL_TIMEOUT_SECS: u64 = 10;
pub const GATEWAY_HTTP_TIMEOUT_SECS: u64 = 30;

// ── Supervisor health probing (spec.md §4.5) ────────────────────────────────
pub const DEFAULT_HEALTH_PROBE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

// ── Restart budget (spec.md §4.5 "crash_loop") ──────────────────────────────
// Background: the state machine diagram caps automatic restarts within a
// rolling window before an instance transitions to `failed`. These are the
// defaults used when a spec does not override them.
pub const DEFAULT_RESTART_BUDGET_COUNT: u32 = 3;
pub const DEFAULT_RESTART_BUDGET_WINDOW_SECS: u64 = 60;

// ── Discord wire limits ─────────────────────────────────────────────────────
// Discord rejects messages over 2000 chars; leave headroom for the reply
// splitter to break on a natural boundary rather than truncate mid-word.
pub const DISCORD_MESSAGE_MAX_CHARS: usize = 1_950;
pub const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

// ── HTTP retry/backoff (providers, embedding client, gateway reconnect) ────
pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const MAX_RECONNECT_DELAY_MS: u64 = 300_000;
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
pub const CIRCUIT_BREAKER_COOLDOWN_SECS: u64 = 60;
