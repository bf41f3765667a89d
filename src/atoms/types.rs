// ── Atoms: Pure Data Types ──────────────────────────────────────────────────
// Plain struct/enum definitions for the fleet's data model (spec.md §3).
// Atoms layer rule: no I/O, no side effects, no imports from gateway/,
// conversation/, container/, supervisor/, memory/, providers/, or config/.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ── LM provider wiring ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Grok,
    Anthropic,
    Google,
    OpenAI,
}

impl ProviderKind {
    /// Default base URL for the wire format this provider kind speaks.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Grok => "https://api.x.ai/v1",
        }
    }

    /// Resolve a provider kind from a bare model name prefix when an
    /// `AgentSpec.llm` entry names only a model (SPEC_FULL.md "Supplemented
    /// Features": provider-routing by model-name prefix).
    pub fn from_model_prefix(model: &str) -> Option<ProviderKind> {
        let m = model.to_ascii_lowercase();
        if m.starts_with("claude") {
            Some(ProviderKind::Anthropic)
        } else if m.starts_with("gemini") {
            Some(ProviderKind::Google)
        } else if m.starts_with("grok") {
            Some(ProviderKind::Grok)
        } else if m.starts_with("gpt") || m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") {
            Some(ProviderKind::OpenAI)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub extra_params: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ── Agent declarative spec (spec.md §3 AgentSpec) ───────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Process,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    #[serde(default = "default_max_turns_per_thread")]
    pub max_turns_per_thread: u32,
    #[serde(default = "default_response_delay_seconds")]
    pub response_delay_seconds: u64,
    #[serde(default = "default_ignore_bots")]
    pub ignore_bots: bool,
    #[serde(default)]
    pub bot_allowlist: Vec<String>,
    #[serde(default)]
    pub channel_allowlist: Vec<String>,
    #[serde(default = "default_memory_similarity_floor")]
    pub memory_similarity_floor: f32,
}

fn default_max_context_messages() -> usize {
    20
}
fn default_max_turns_per_thread() -> u32 {
    50
}
fn default_response_delay_seconds() -> u64 {
    1
}
fn default_ignore_bots() -> bool {
    true
}
fn default_memory_similarity_floor() -> f32 {
    0.2
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            max_context_messages: default_max_context_messages(),
            max_turns_per_thread: default_max_turns_per_thread(),
            response_delay_seconds: default_response_delay_seconds(),
            ignore_bots: default_ignore_bots(),
            bot_allowlist: Vec::new(),
            channel_allowlist: Vec::new(),
            memory_similarity_floor: default_memory_similarity_floor(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub image: String,
    pub workspace_host_path: String,
    #[serde(default = "default_workspace_mount_path")]
    pub workspace_mount_path: String,
    #[serde(default)]
    pub extra_mounts: Vec<MountSpec>,
    #[serde(default)]
    pub env_overrides: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Optional `exec` probe (spec.md §4.5 "if a probe command is
    /// configured, `exec` returns exit 0 within a timeout"). Absent means
    /// liveness is engine-reported running state alone.
    #[serde(default)]
    pub health_check_cmd: Option<Vec<String>>,
}

fn default_workspace_mount_path() -> String {
    "/workspace".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub id: String,
    pub kind: AgentKind,
    pub display_name: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub system_prompt_suffix: String,
    pub llm: LlmConfig,
    pub discord_token_ref: String,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub resources: Option<ResourcesConfig>,
    #[serde(default = "default_auto_deploy")]
    pub auto_deploy: bool,
}

fn default_auto_deploy() -> bool {
    true
}

impl AgentSpec {
    /// Validates the invariants spec.md §3 attaches to `AgentSpec`: process
    /// agents must not carry `resources`, container agents must.
    pub fn validate(&self) -> Result<(), String> {
        match (self.kind, &self.resources) {
            (AgentKind::Process, Some(_)) => {
                Err(format!("agent `{}` is kind=process but declares `resources`", self.id))
            }
            (AgentKind::Container, None) => {
                Err(format!("agent `{}` is kind=container but declares no `resources`", self.id))
            }
            _ => Ok(()),
        }
    }
}

// ── Runtime instance state (spec.md §4.5 state machine) ─────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    CrashLoop,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub spec_id: String,
    pub state: InstanceState,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
    pub last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    pub health: &'static str,
}

// ── Discord gateway types (spec.md §3 BotIdentity / InboundEvent) ───────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BotConnectionState {
    Initializing,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub id: String,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub state: BotConnectionState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub bot_identity_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub message_id: String,
    pub author_id: String,
    pub is_bot_author: bool,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl InboundEvent {
    /// The conversation key this event belongs to (spec.md §4.3 step 2):
    /// `thread_id` when present, otherwise `channel_id`.
    pub fn conversation_key(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.channel_id)
    }
}

// ── Per-conversation state (spec.md §3 ConversationState) ───────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub author_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    pub turn_count: u32,
    pub last_reply_at: Option<chrono::DateTime<chrono::Utc>>,
    pub recent_messages: VecDeque<HistoryEntry>,
    pub max_context_messages: usize,
}

impl ConversationState {
    pub fn new(max_context_messages: usize) -> Self {
        Self {
            turn_count: 0,
            last_reply_at: None,
            recent_messages: VecDeque::with_capacity(max_context_messages.max(1)),
            max_context_messages,
        }
    }

    /// Pushes a history entry, evicting the oldest once the bound is exceeded.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        if self.max_context_messages == 0 {
            return;
        }
        if self.recent_messages.len() >= self.max_context_messages {
            self.recent_messages.pop_front();
        }
        self.recent_messages.push_back(entry);
    }
}

// ── Memory (spec.md §3 MemoryRecord) ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub agent_id: String,
    pub content: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySearchHit {
    pub content: String,
    pub similarity: f32,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_agent_rejects_resources() {
        let spec = AgentSpec {
            id: "a1".into(),
            kind: AgentKind::Process,
            display_name: "A1".into(),
            personality: String::new(),
            system_prompt_suffix: String::new(),
            llm: LlmConfig { provider: ProviderKind::Anthropic, model: "claude-sonnet-4-6".into(), extra_params: Default::default() },
            discord_token_ref: "TOKEN_A1".into(),
            behavior: BehaviorConfig::default(),
            resources: Some(ResourcesConfig {
                image: "alpine".into(),
                workspace_host_path: "/tmp".into(),
                workspace_mount_path: default_workspace_mount_path(),
                extra_mounts: vec![],
                env_overrides: Default::default(),
                labels: Default::default(),
                restart_policy: RestartPolicy::default(),
                health_check_cmd: None,
            }),
            auto_deploy: true,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn container_agent_requires_resources() {
        let mut spec = AgentSpec {
            id: "c1".into(),
            kind: AgentKind::Container,
            display_name: "C1".into(),
            personality: String::new(),
            system_prompt_suffix: String::new(),
            llm: LlmConfig { provider: ProviderKind::OpenAI, model: "gpt-5".into(), extra_params: Default::default() },
            discord_token_ref: "TOKEN_C1".into(),
            behavior: BehaviorConfig::default(),
            resources: None,
            auto_deploy: true,
        };
        assert!(spec.validate().is_err());
        spec.resources = Some(ResourcesConfig {
            image: "alpine".into(),
            workspace_host_path: "/tmp".into(),
            workspace_mount_path: default_workspace_mount_path(),
            extra_mounts: vec![],
            env_overrides: Default::default(),
            labels: Default::default(),
            restart_policy: RestartPolicy::default(),
            health_check_cmd: None,
        });
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn conversation_key_prefers_thread() {
        let e = InboundEvent {
            bot_identity_id: "b1".into(),
            channel_id: "chan".into(),
            thread_id: Some("thread".into()),
            message_id: "m1".into(),
            author_id: "u1".into(),
            is_bot_author: false,
            content: "hi".into(),
            attachments: vec![],
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(e.conversation_key(), "thread");
    }

    #[test]
    fn conversation_state_caps_history_at_zero() {
        let mut state = ConversationState::new(0);
        state.push_history(HistoryEntry {
            role: Role::User,
            content: "hi".into(),
            author_id: "u1".into(),
            timestamp: chrono::Utc::now(),
        });
        assert!(state.recent_messages.is_empty());
    }

    #[test]
    fn conversation_state_evicts_oldest() {
        let mut state = ConversationState::new(2);
        for i in 0..3 {
            state.push_history(HistoryEntry {
                role: Role::User,
                content: format!("msg{i}"),
                author_id: "u1".into(),
                timestamp: chrono::Utc::now(),
            });
        }
        assert_eq!(state.recent_messages.len(), 2);
        assert_eq!(state.recent_messages.front().unwrap().content, "msg1");
    }

    #[test]
    fn model_prefix_resolves_known_families() {
        assert_eq!(ProviderKind::from_model_prefix("claude-sonnet-4-6"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::from_model_prefix("gemini-2.5-pro"), Some(ProviderKind::Google));
        assert_eq!(ProviderKind::from_model_prefix("grok-4"), Some(ProviderKind::Grok));
        assert_eq!(ProviderKind::from_model_prefix("gpt-5"), Some(ProviderKind::OpenAI));
        assert_eq!(ProviderKind::from_model_prefix("llama-3"), None);
    }
}
