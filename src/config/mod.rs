// ── Configuration ───────────────────────────────────────────────────────────
// Declarative fleet configuration (spec.md §6): agents, global settings, and
// secret references. Loaded once at startup into an immutable `Arc<Config>`;
// reconciliation reads a snapshot, never the file itself, again.
//
// Every struct rejects unknown keys (`deny_unknown_fields`) per spec.md §6
// ("Unknown keys are rejected"); every optional field carries a matching
// `default_*` free function in the corpus's own style.

mod secrets;

pub use secrets::{SecretRef, SecretResolver};

use crate::atoms::error::{FleetError, FleetResult};
use crate::atoms::types::{AgentSpec, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub agents: HashMap<String, AgentSpec>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub secrets_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default = "default_log_root")]
    pub log_root: String,
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_embedding_base_url")]
    pub embedding_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_gateway_base_url")]
    pub gateway_base_url: String,
    #[serde(default = "default_gateway_bind_addr")]
    pub gateway_bind_addr: String,
    #[serde(default = "default_memory_db_path")]
    pub memory_db_path: String,
    #[serde(default = "default_health_probe_interval_secs")]
    pub health_probe_interval_secs: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_restart_budget_count")]
    pub restart_budget_count: u32,
    #[serde(default = "default_restart_budget_window_secs")]
    pub restart_budget_window_secs: u64,
    #[serde(default = "default_container_network")]
    pub container_network: String,
    #[serde(default)]
    pub allow_image_pull: bool,
    /// Secret env-var name holding the API key for each LM provider (spec.md
    /// §6 "Recognized names include ... LM provider API keys"). Agents only
    /// name a `provider`/`model`, not a per-agent key, so the key is shared
    /// per provider across every agent that uses it.
    #[serde(default = "default_provider_api_key_refs")]
    pub provider_api_key_refs: HashMap<ProviderKind, String>,
}

fn default_provider_api_key_refs() -> HashMap<ProviderKind, String> {
    let mut m = HashMap::new();
    m.insert(ProviderKind::Anthropic, "ANTHROPIC_API_KEY".to_string());
    m.insert(ProviderKind::OpenAI, "OPENAI_API_KEY".to_string());
    m.insert(ProviderKind::Google, "GOOGLE_API_KEY".to_string());
    m.insert(ProviderKind::Grok, "GROK_API_KEY".to_string());
    m
}

fn default_log_root() -> String {
    "./logs".to_string()
}
fn default_embedding_dims() -> usize {
    768
}
fn default_embedding_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_gateway_base_url() -> String {
    "http://127.0.0.1:8780".to_string()
}
fn default_gateway_bind_addr() -> String {
    "0.0.0.0:8780".to_string()
}
fn default_memory_db_path() -> String {
    "./data/memory.sqlite3".to_string()
}
fn default_health_probe_interval_secs() -> u64 {
    crate::atoms::constants::DEFAULT_HEALTH_PROBE_INTERVAL_SECS
}
fn default_startup_timeout_secs() -> u64 {
    crate::atoms::constants::DEFAULT_STARTUP_TIMEOUT_SECS
}
fn default_restart_budget_count() -> u32 {
    crate::atoms::constants::DEFAULT_RESTART_BUDGET_COUNT
}
fn default_restart_budget_window_secs() -> u64 {
    crate::atoms::constants::DEFAULT_RESTART_BUDGET_WINDOW_SECS
}
fn default_container_network() -> String {
    "agentfleet".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_root: default_log_root(),
            embedding_dims: default_embedding_dims(),
            embedding_base_url: default_embedding_base_url(),
            embedding_model: default_embedding_model(),
            gateway_base_url: default_gateway_base_url(),
            gateway_bind_addr: default_gateway_bind_addr(),
            memory_db_path: default_memory_db_path(),
            health_probe_interval_secs: default_health_probe_interval_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            restart_budget_count: default_restart_budget_count(),
            restart_budget_window_secs: default_restart_budget_window_secs(),
            container_network: default_container_network(),
            allow_image_pull: false,
            provider_api_key_refs: default_provider_api_key_refs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { agents: HashMap::new(), global: GlobalConfig::default(), secrets_refs: Vec::new() }
    }
}

impl Config {
    /// Loads configuration from a TOML file. Unknown keys are a hard error.
    pub fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the cross-cutting invariants spec.md §3/§6 attach to the
    /// fleet as a whole: `id` uniqueness (guaranteed by the map key), each
    /// `AgentSpec`'s own invariants, and non-empty `discord_token_ref`.
    fn validate(&self) -> FleetResult<()> {
        for (key, spec) in &self.agents {
            if key != &spec.id {
                return Err(FleetError::config(format!(
                    "agent map key `{key}` does not match spec.id `{}`",
                    spec.id
                )));
            }
            spec.validate().map_err(FleetError::Config)?;
            if spec.discord_token_ref.trim().is_empty() {
                return Err(FleetError::config(format!("agent `{}` has an empty discord_token_ref", spec.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_key() {
        let toml_src = "oops = true\n";
        let err = toml::from_str::<Config>(toml_src).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn defaults_are_applied_for_absent_global() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.global.embedding_dims, 768);
        assert_eq!(cfg.global.health_probe_interval_secs, 60);
    }

    #[test]
    fn agent_map_key_must_match_spec_id() {
        let toml_src = r#"
            [agents.a1]
            id = "a2"
            kind = "process"
            display_name = "A"
            discord_token_ref = "TOKEN_A"
            [agents.a1.llm]
            provider = "anthropic"
            model = "claude-sonnet-4-6"
        "#;
        let cfg: Config = toml::from_str(toml_src).unwrap();
        assert!(cfg.validate().is_err());
    }
}
