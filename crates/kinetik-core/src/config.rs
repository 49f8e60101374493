//! kinetik.toml daemon configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::ClusterConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub runtime: RuntimeConfig,
    pub discovery: DiscoveryConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:10513".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/kinetik".to_string(),
        }
    }
}

/// Which node-selection policy the orchestrator uses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    BestFit,
    Random,
}

/// Which instance is removed first on scale-down.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionKind {
    #[default]
    Random,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub policy: PolicyKind,
    pub eviction: EvictionKind,
    /// Default deploy deadline; unset means no deadline.
    pub deadline_secs: Option<u64>,
    /// Tear down partial state when a deploy fails.
    pub rollback_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Port of the container engine API on every node.
    pub port: u16,
    pub api_version: String,
    pub scheme: String,
    pub network: String,
    pub stop_grace_secs: u64,
    pub attach_attempts: u32,
    pub attach_initial_backoff_ms: u64,
    pub attach_max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 2376,
            api_version: "v1.26".to_string(),
            scheme: "http".to_string(),
            network: "kinetik".to_string(),
            stop_grace_secs: 5,
            attach_attempts: 10,
            attach_initial_backoff_ms: 1000,
            attach_max_backoff_ms: 30_000,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base URL of the DNS registrar. Unset keeps records in memory.
    pub dns_url: Option<String>,
    pub dns_servers: Vec<String>,
    pub domain: String,
    pub weight: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dns_url: None,
            dns_servers: Vec::new(),
            domain: "kinetik".to_string(),
            weight: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    /// Base URL of the reverse-proxy registrar. Unset keeps routes in memory.
    pub proxy_url: Option<String>,
    /// Proxy address used as the DNAT destination.
    pub proxy_host_address: Option<String>,
    /// Install host forwarding rules with iptables.
    pub iptables: bool,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if given and present, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Cluster settings derived from the discovery, routing and runtime sections.
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            dns_address: self.discovery.dns_url.clone(),
            proxy_address: self.routing.proxy_url.clone(),
            proxy_host_address: self.routing.proxy_host_address.clone(),
            dns_servers: self.discovery.dns_servers.clone(),
            network: self.runtime.network.clone(),
            domain: self.discovery.domain.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_round_trip() {
        let config = DaemonConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("0.0.0.0:10513"));
        let back: DaemonConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[scheduler]
policy = "random"
deadline_secs = 30

[discovery]
dns_servers = ["10.0.0.2"]
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.policy, PolicyKind::Random);
        assert_eq!(config.scheduler.deadline_secs, Some(30));
        assert!(!config.scheduler.rollback_on_failure);
        assert_eq!(config.discovery.weight, 10);
        assert_eq!(config.runtime.port, 2376);

        let cluster = config.cluster_config();
        assert_eq!(cluster.dns_servers, vec!["10.0.0.2"]);
        assert_eq!(cluster.network, "kinetik");
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(toml::from_str::<DaemonConfig>("[scheduler]\npolicy = \"smart\"\n").is_err());
    }

    #[test]
    fn test_load_from_file_and_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:9000\"").unwrap();
        let config = DaemonConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");

        let missing = DaemonConfig::load(Some(Path::new("/nonexistent/kinetik.toml"))).unwrap();
        assert_eq!(missing, DaemonConfig::default());
    }
}
