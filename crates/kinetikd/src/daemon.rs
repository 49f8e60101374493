//! Daemon assembly — builds the orchestrator from configuration and
//! serves the API.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use kinetik_core::config::{EvictionKind, PolicyKind, RoutingConfig};
use kinetik_core::{ClusterConfig, DaemonConfig};
use kinetik_placement::{
    BestFitByLoad, EvictionPolicy, RandomEviction, ResourceLedger, SchedulingPolicy, UniformRandom,
};
use kinetik_proxy::{HttpDiscovery, HttpRouting, InMemoryDiscovery, InMemoryRouting, IptablesForwarder};
use kinetik_runtime::DockerRuntime;
use kinetik_scheduler::{
    DiscoveryRegistrar, ForwardingRules, Orchestrator, OrchestratorConfig, RouteRegistrar,
};
use kinetik_state::StateStore;
use tracing::{error, info, warn};

/// Database file inside the data directory.
const DB_FILE: &str = "kinetik.redb";

/// Discovery, routing and forwarding collaborators chosen by config.
pub struct Registrars {
    pub discovery: Arc<dyn DiscoveryRegistrar>,
    pub routes: Arc<dyn RouteRegistrar>,
    pub forwarding: Option<Arc<dyn ForwardingRules>>,
}

impl Registrars {
    pub fn from_config(cluster: &ClusterConfig, routing: &RoutingConfig) -> anyhow::Result<Self> {
        let discovery: Arc<dyn DiscoveryRegistrar> = match &cluster.dns_address {
            Some(url) => {
                info!(%url, "using HTTP DNS registrar");
                Arc::new(HttpDiscovery::new(url)?)
            }
            None => {
                warn!("no DNS registrar configured, keeping records in memory");
                Arc::new(InMemoryDiscovery::new())
            }
        };
        let routes: Arc<dyn RouteRegistrar> = match &cluster.proxy_address {
            Some(url) => {
                info!(%url, "using HTTP route registrar");
                Arc::new(HttpRouting::new(url)?)
            }
            None => {
                warn!("no proxy registrar configured, keeping routes in memory");
                Arc::new(InMemoryRouting::new())
            }
        };
        let forwarding: Option<Arc<dyn ForwardingRules>> = match (routing.iptables, &cluster.proxy_host_address) {
            (true, Some(_)) => Some(Arc::new(IptablesForwarder::new())),
            (true, None) => {
                warn!("iptables forwarding enabled without a proxy host address, skipping");
                None
            }
            (false, _) => None,
        };
        Ok(Self {
            discovery,
            routes,
            forwarding,
        })
    }
}

/// Cluster settings persisted on first start, read back afterwards.
pub fn resolve_cluster_config(store: &StateStore, config: &DaemonConfig) -> anyhow::Result<ClusterConfig> {
    if let Some(stored) = store.get_cluster_config()? {
        info!(network = %stored.network, domain = %stored.domain, "using persisted cluster config");
        return Ok(stored);
    }
    let cluster = config.cluster_config();
    store.put_cluster_config(&cluster)?;
    info!(network = %cluster.network, domain = %cluster.domain, "cluster config persisted");
    Ok(cluster)
}

fn build_policy(
    kind: PolicyKind,
    ledger: Arc<ResourceLedger>,
    runtime: Arc<DockerRuntime>,
) -> Arc<dyn SchedulingPolicy> {
    match kind {
        PolicyKind::BestFit => Arc::new(BestFitByLoad::new(ledger, runtime)),
        PolicyKind::Random => Arc::new(UniformRandom::new(ledger)),
    }
}

fn build_eviction(kind: EvictionKind) -> Arc<dyn EvictionPolicy> {
    match kind {
        EvictionKind::Random => Arc::new(RandomEviction),
    }
}

/// Open the store, load the ledger and assemble the orchestrator.
pub fn build_orchestrator(config: &DaemonConfig, store: StateStore) -> anyhow::Result<Orchestrator> {
    let cluster = resolve_cluster_config(&store, config)?;
    let ledger = Arc::new(ResourceLedger::load(store.clone())?);

    let runtime = Arc::new(DockerRuntime::new(&config.runtime)?);
    let policy = build_policy(config.scheduler.policy, ledger.clone(), runtime.clone());
    let registrars = Registrars::from_config(&cluster, &config.routing)?;

    let mut orchestrator = Orchestrator::new(
        ledger,
        policy,
        store,
        runtime,
        registrars.discovery,
        registrars.routes,
        OrchestratorConfig::from_daemon(config, cluster),
    )
    .with_eviction(build_eviction(config.scheduler.eviction));
    if let Some(forwarding) = registrars.forwarding {
        orchestrator = orchestrator.with_forwarding(forwarding);
    }
    info!(policy = orchestrator.policy_name(), "orchestrator ready");
    Ok(orchestrator)
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("Kinetik daemon starting");

    let data_dir = Path::new(&config.storage.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let orchestrator = Arc::new(build_orchestrator(&config, store)?);
    let router = kinetik_api::build_router(orchestrator);

    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Kinetik daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_config_is_persisted_once() {
        let store = StateStore::open_in_memory().unwrap();
        let mut config = DaemonConfig::default();
        config.discovery.domain = "first".to_string();
        assert_eq!(resolve_cluster_config(&store, &config).unwrap().domain, "first");

        // Later starts keep the persisted value.
        config.discovery.domain = "second".to_string();
        assert_eq!(resolve_cluster_config(&store, &config).unwrap().domain, "first");
    }

    #[test]
    fn forwarding_needs_a_proxy_host() {
        let routing = RoutingConfig {
            iptables: true,
            ..RoutingConfig::default()
        };
        let mut cluster = ClusterConfig::default();
        assert!(Registrars::from_config(&cluster, &routing).unwrap().forwarding.is_none());

        cluster.proxy_host_address = Some("172.18.0.5".to_string());
        assert!(Registrars::from_config(&cluster, &routing).unwrap().forwarding.is_some());
    }

    #[tokio::test]
    async fn orchestrator_builds_from_defaults() {
        let store = StateStore::open_in_memory().unwrap();
        let orchestrator = build_orchestrator(&DaemonConfig::default(), store).unwrap();
        assert_eq!(orchestrator.policy_name(), "best-fit");
        assert!(orchestrator.nodes().await.is_empty());
    }
}
