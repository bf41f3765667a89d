// ── Atoms: Container Runtime Types ──────────────────────────────────────────
// Pure data types for C4 (spec.md §4.4). `ContainerEngine` itself lives in
// `atoms::traits` alongside `AiProvider`; these are the request/response
// shapes that trait speaks in.

use serde::Serialize;
use std::collections::HashMap;

/// Everything `Supervisor` needs to ask the adapter to launch one container
/// agent. Built from `AgentSpec.resources` plus secrets resolved by the
/// caller — the adapter never reads secret material itself (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub agent_id: String,
    pub image: String,
    pub workspace_host_path: String,
    pub workspace_mount_path: String,
    pub extra_mounts: Vec<MountSpec>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub restart_policy: RestartPolicyKind,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicyKind {
    Always,
    OnFailure,
    Never,
}

/// Opaque handle to a launched container; the adapter is the only thing
/// that interprets the engine-specific `native_id`.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerHandle {
    pub native_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInspect {
    pub state: ContainerState,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i64>,
    pub resource_usage: ResourceUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}
