// ── Container Runtime Adapter (C4) ──────────────────────────────────────────
// Hides the container engine behind the small surface spec.md §4.4 defines:
// launch/stop/inspect/logs/exec/list. Grounded on the teacher's Docker
// sandbox (bollard-based ephemeral exec containers) but generalized to
// long-lived, labeled, restart-policy-aware agent containers.
//
// This module is purely mechanical — it never interprets agent semantics.
// The Supervisor is the only caller.

use crate::atoms::container_types::{
    ContainerHandle, ContainerInspect, ContainerState, ExecOutcome, LaunchSpec, ResourceUsage,
    RestartPolicyKind,
};
use crate::atoms::error::FleetError;
use crate::atoms::traits::ContainerEngine;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, RestartPolicy as BollardRestartPolicy, RestartPolicyNameEnum};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;

/// Label every agent container carries so `list(label_selector)` (and an
/// operator poking at `docker ps`) can always tell a managed container apart
/// from anything else on the host (spec.md §4.4 "labels (`managed=true`,
/// `agent=<id>`, arbitrary user labels)").
pub const MANAGED_LABEL: &str = "managed";
pub const AGENT_LABEL: &str = "agent";

pub struct BollardAdapter {
    docker: Docker,
    allow_image_pull: bool,
}

impl BollardAdapter {
    pub fn connect(allow_image_pull: bool) -> Result<Self, FleetError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, allow_image_pull })
    }

    async fn ensure_network(&self, name: &str) -> Result<(), FleetError> {
        if self.docker.inspect_network::<String>(name, None).await.is_ok() {
            return Ok(());
        }
        self.docker
            .create_network(CreateNetworkOptions { name: name.to_string(), ..Default::default() })
            .await?;
        Ok(())
    }

    /// Missing images are a hard error unless `allow_image_pull` is set
    /// (spec.md §4.4 "the adapter does not pull implicitly unless a policy
    /// flag is set").
    async fn ensure_image(&self, image: &str) -> Result<(), FleetError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.allow_image_pull {
            return Err(FleetError::config(format!(
                "image `{image}` is not present locally and allow_image_pull is false"
            )));
        }
        let opts = CreateImageOptions { from_image: image, ..Default::default() };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| FleetError::transport(format!("pulling image `{image}`: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for BollardAdapter {
    async fn launch(&self, spec: LaunchSpec) -> Result<ContainerHandle, FleetError> {
        self.ensure_network(&spec.network).await?;
        self.ensure_image(&spec.image).await?;

        let mut labels: HashMap<String, String> = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(AGENT_LABEL.to_string(), spec.agent_id.clone());

        let mut binds = vec![format!(
            "{}:{}",
            spec.workspace_host_path, spec.workspace_mount_path
        )];
        for mount in &spec.extra_mounts {
            let suffix = if mount.read_only { ":ro" } else { "" };
            binds.push(format!("{}:{}{}", mount.host_path, mount.mount_path, suffix));
        }

        let restart_policy = BollardRestartPolicy {
            name: Some(match spec.restart_policy {
                RestartPolicyKind::Always => RestartPolicyNameEnum::ALWAYS,
                RestartPolicyKind::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
                RestartPolicyKind::Never => RestartPolicyNameEnum::NO,
            }),
            maximum_retry_count: None,
        };

        let host_config = HostConfig {
            binds: Some(binds),
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(restart_policy),
            ..Default::default()
        };

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let container_name = format!("agentfleet-{}", spec.agent_id);

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        };

        let create_opts = CreateContainerOptions { name: container_name.as_str(), platform: None };
        let created = self.docker.create_container(Some(create_opts), config).await?;
        self.docker.start_container(&created.id, None::<StartContainerOptions<String>>).await?;

        Ok(ContainerHandle { native_id: created.id, agent_id: spec.agent_id })
    }

    async fn stop(&self, handle: &ContainerHandle, grace_secs: u64) -> Result<(), FleetError> {
        let opts = StopContainerOptions { t: grace_secs as i64 };
        match self.docker.stop_container(&handle.native_id, Some(opts)).await {
            Ok(()) => {}
            // Already stopped/removed — stop is idempotent (spec.md §8).
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 304 => {}
            Err(e) => return Err(e.into()),
        }
        let _ = self
            .docker
            .remove_container(&handle.native_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInspect, FleetError> {
        let info = self.docker.inspect_container(&handle.native_id, None).await?;
        let state = info.state.as_ref();
        let container_state = match state.and_then(|s| s.status) {
            Some(bollard::models::ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(bollard::models::ContainerStateStatusEnum::CREATED) => ContainerState::Created,
            Some(bollard::models::ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
            Some(bollard::models::ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
            Some(bollard::models::ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
            Some(bollard::models::ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
            _ => ContainerState::Unknown,
        };
        let started_at = state
            .and_then(|s| s.started_at.as_ref())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let exit_code = state.and_then(|s| s.exit_code);

        // Bollard's `stats` endpoint requires a streaming call; a single
        // non-streaming snapshot is enough for a health-probe cycle.
        let mut stats_stream =
            self.docker.stats(&handle.native_id, Some(bollard::container::StatsOptions { stream: false, one_shot: true }));
        let usage = if let Some(Ok(stats)) = stats_stream.next().await {
            let cpu_percent = compute_cpu_percent(&stats);
            let memory_bytes = stats.memory_stats.usage;
            ResourceUsage { cpu_percent, memory_bytes }
        } else {
            ResourceUsage { cpu_percent: None, memory_bytes: None }
        };

        Ok(ContainerInspect { state: container_state, started_at, exit_code, resource_usage: usage })
    }

    async fn logs(&self, handle: &ContainerHandle, tail_lines: usize) -> Result<String, FleetError> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_lines.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(&handle.native_id, Some(opts));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    out.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok(out)
    }

    async fn exec(&self, handle: &ContainerHandle, argv: &[String]) -> Result<ExecOutcome, FleetError> {
        let exec = self
            .docker
            .create_exec(
                &handle.native_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(ExecOutcome { exit_code, stdout, stderr })
    }

    async fn list(&self, label_selector: &[(String, String)]) -> Result<Vec<ContainerHandle>, FleetError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        let mut label_filters = vec![format!("{MANAGED_LABEL}=true")];
        for (k, v) in label_selector {
            label_filters.push(format!("{k}={v}"));
        }
        filters.insert("label".to_string(), label_filters);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let agent_id = c.labels.unwrap_or_default().get(AGENT_LABEL).cloned().unwrap_or_default();
                Some(ContainerHandle { native_id: id, agent_id })
            })
            .collect())
    }
}

fn compute_cpu_percent(stats: &bollard::container::Stats) -> Option<f64> {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta =
        stats.cpu_stats.system_cpu_usage? as f64 - stats.precpu_stats.system_cpu_usage? as f64;
    if system_delta <= 0.0 || cpu_delta < 0.0 {
        return None;
    }
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
    Some((cpu_delta / system_delta) * online_cpus * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::container_types::MountSpec;
    use std::collections::HashMap as StdHashMap;

    #[test]
    fn launch_spec_binds_workspace_and_extra_mounts() {
        let spec = LaunchSpec {
            agent_id: "a1".into(),
            image: "alpine".into(),
            workspace_host_path: "/host/ws".into(),
            workspace_mount_path: "/workspace".into(),
            extra_mounts: vec![MountSpec {
                host_path: "/host/ssh".into(),
                mount_path: "/root/.ssh".into(),
                read_only: true,
            }],
            env: StdHashMap::new(),
            labels: StdHashMap::new(),
            network: "agentfleet".into(),
            restart_policy: RestartPolicyKind::OnFailure,
        };
        let mut binds = vec![format!("{}:{}", spec.workspace_host_path, spec.workspace_mount_path)];
        for mount in &spec.extra_mounts {
            let suffix = if mount.read_only { ":ro" } else { "" };
            binds.push(format!("{}:{}{}", mount.host_path, mount.mount_path, suffix));
        }
        assert_eq!(binds, vec!["/host/ws:/workspace".to_string(), "/host/ssh:/root/.ssh:ro".to_string()]);
    }
}
