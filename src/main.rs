// ── agentfleetd ──────────────────────────────────────────────────────────────
// Binary entry point: loads configuration, resolves secrets, wires C1-C5
// together in a single process, and serves the Gateway's HTTP surface
// alongside the Supervisor's reconciliation loop.

use agentfleet::atoms::types::AgentKind;
use agentfleet::config::{Config, SecretResolver};
use agentfleet::container::BollardAdapter;
use agentfleet::gateway::GatewayRegistry;
use agentfleet::memory::{EmbeddingClient, MemoryStore};
use agentfleet::supervisor::Supervisor;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentfleet=info,tower_http=info")))
        .json()
        .init();

    let config_path = std::env::var("AGENTFLEET_CONFIG").unwrap_or_else(|_| "./agentfleet.toml".to_string());
    let config = Arc::new(Config::load(&config_path)?);
    tracing::info!(path = %config_path, agent_count = config.agents.len(), "configuration loaded");

    let agent_refs = config.agents.values().flat_map(|spec| {
        let mut refs = vec![spec.discord_token_ref.clone()];
        if let Some(key_ref) = config.global.provider_api_key_refs.get(&spec.llm.provider) {
            refs.push(key_ref.clone());
        }
        refs
    });
    let secrets = Arc::new(SecretResolver::resolve_with_agent_refs(&config.secrets_refs, agent_refs)?);

    let embedding = EmbeddingClient::new(&config.global.embedding_base_url, &config.global.embedding_model);
    let memory = Arc::new(MemoryStore::open(&config.global.memory_db_path, embedding, config.global.embedding_dims)?);

    let needs_containers = config.agents.values().any(|spec| spec.kind == AgentKind::Container);
    let container_engine: Option<Arc<dyn agentfleet::atoms::traits::ContainerEngine>> = if needs_containers {
        Some(Arc::new(BollardAdapter::connect(config.global.allow_image_pull)?))
    } else {
        None
    };

    let gateway = Arc::new(GatewayRegistry::new());

    let bind_addr = config.global.gateway_bind_addr.clone();
    let gateway_router = agentfleet::gateway::api::router(Arc::clone(&gateway));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "gateway HTTP surface listening");
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, gateway_router).await {
            tracing::error!(error = %e, "gateway HTTP server exited");
        }
    });

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&config),
        Arc::clone(&secrets),
        Arc::clone(&gateway),
        container_engine,
        Arc::clone(&memory),
    )?);

    supervisor.reconcile().await;

    let reconcile_supervisor = Arc::clone(&supervisor);
    let interval_secs = config.global.health_probe_interval_secs.max(1);
    let reconcile_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.tick().await; // first tick fires immediately; reconcile already ran once above
        loop {
            ticker.tick().await;
            reconcile_supervisor.reconcile().await;
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining agents");
    reconcile_task.abort();

    for spec in supervisor.list_specs() {
        if let Err(e) = supervisor.stop(&spec.id, config.global.startup_timeout_secs).await {
            tracing::warn!(agent = %spec.id, error = %e, "error stopping agent during shutdown");
        }
    }

    server_task.abort();
    tracing::info!("shutdown complete");
    Ok(())
}
