// ── AgentFleet ───────────────────────────────────────────────────────────────
// Supervisor and Discord gateway for a fleet of conversational agents: some
// run as in-process conversation loops, some as long-lived containerized
// development environments. See SPEC_FULL.md for the full module map.

pub mod atoms;
pub mod config;
pub mod container;
pub mod conversation;
pub mod gateway;
pub mod memory;
pub mod providers;
pub mod supervisor;
