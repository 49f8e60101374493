//! Collaborator interfaces the orchestrator drives.
//!
//! Adapters live in `kinetik-runtime` (container engine) and
//! `kinetik-proxy` (discovery, routing, host forwarding). All of them are
//! I/O and report failures as `anyhow::Error`; the orchestrator maps them
//! into its own error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use kinetik_core::LaunchTemplate;

/// Remote container runtime reachable per node.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull the image, create and start a container. Returns its id.
    async fn launch(&self, node_id: &str, template: &LaunchTemplate) -> anyhow::Result<String>;

    /// Address of a container on a named network, if attached.
    async fn network_address(
        &self,
        node_id: &str,
        container_id: &str,
        network: &str,
    ) -> anyhow::Result<Option<String>>;

    async fn stop(&self, node_id: &str, container_id: &str, grace: Duration) -> anyhow::Result<()>;

    async fn remove(&self, node_id: &str, container_id: &str, force: bool) -> anyhow::Result<()>;

    /// Succeeds once the node's runtime answers.
    async fn ping(&self, node_id: &str) -> anyhow::Result<()>;
}

/// DNS-style discovery registrar.
#[async_trait]
pub trait DiscoveryRegistrar: Send + Sync {
    /// Add weighted addresses to a record.
    async fn register(&self, record: &str, targets: &[(String, u32)]) -> anyhow::Result<()>;

    /// Remove one address from a record.
    async fn deregister(&self, record: &str, address: &str) -> anyhow::Result<()>;
}

/// Reverse-proxy route registrar.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    async fn register_route(
        &self,
        service: &str,
        stack: &str,
        internal_port: u16,
        public_port: u16,
    ) -> anyhow::Result<()>;

    async fn deregister_route(&self, service: &str, stack: &str) -> anyhow::Result<()>;
}

/// Host-level forwarding of a public port to the proxy.
#[async_trait]
pub trait ForwardingRules: Send + Sync {
    async fn install(
        &self,
        proxy_address: &str,
        public_port: u16,
        internal_port: u16,
    ) -> anyhow::Result<()>;
}
