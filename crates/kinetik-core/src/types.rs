//! Shared domain types used across Kinetik crates.
//!
//! These types describe cluster nodes, deployed services, and their running
//! instances. All of them are JSON-serializable: they travel over the HTTP
//! surface and are stored as-is by the state store.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of a node (its reachable address).
pub type NodeId = String;

/// Identifier of a service, always `{stack}/{service}`.
pub type ServiceId = String;

/// Identifier of an instance (the container id).
pub type InstanceId = String;

// ── Health ────────────────────────────────────────────────────────

/// Reported health of a node or instance.
///
/// Serialized as the upper-case names (`"OK"`, `"WARN"`, ...). Any string
/// that is not one of the known names reads back as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HealthState {
    Ok,
    Warn,
    Critical,
    Down,
    #[default]
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Ok => "OK",
            HealthState::Warn => "WARN",
            HealthState::Critical => "CRITICAL",
            HealthState::Down => "DOWN",
            HealthState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "OK" => HealthState::Ok,
            "WARN" => HealthState::Warn,
            "CRITICAL" => HealthState::Critical,
            "DOWN" => HealthState::Down,
            _ => HealthState::Unknown,
        }
    }

    /// Whether new replicas may be placed on a node in this state.
    pub fn is_schedulable(&self) -> bool {
        !matches!(self, HealthState::Down)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HealthState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HealthState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(HealthState::parse(&s))
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Disk usage reported by a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Used ratio in `0.0..=1.0`.
    pub used_percent: f64,
}

/// Load averages reported by a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// Periodic self-report pushed by a node.
///
/// Carries utilization only. Reservations are owned by the ledger and are
/// never taken from a report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeReport {
    pub cpu_count: u32,
    /// Sum of per-core utilization, so `0.0..=100.0 * cpu_count`.
    pub cpu_used_percent: f64,
    pub mem_used_bytes: u64,
    /// Memory used ratio in `0.0..=1.0`.
    pub mem_used_percent: f64,
    pub disk: Option<DiskUsage>,
    pub load: Option<LoadAverage>,
    pub state: Option<HealthState>,
}

/// CPU and memory committed to instances scheduled on a node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    /// Reserved CPU in fractional cores.
    pub cpu: f64,
    pub memory_bytes: u64,
}

impl Reservation {
    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.memory_bytes == 0
    }
}

/// A cluster member as tracked by the resource ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub cpu_count: u32,
    pub cpu_used_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_used_percent: f64,
    pub disk: Option<DiskUsage>,
    pub load: Option<LoadAverage>,
    pub state: HealthState,
    pub reservation: Reservation,
    /// Instances hosted on this node (back-references only).
    pub instances: Vec<InstanceId>,
    /// Unix timestamp of the last self-report.
    pub last_report: u64,
    /// Bumped on every committed mutation of this record.
    pub revision: u64,
}

impl NodeRecord {
    /// A node we know nothing about yet.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// Build a fresh record from a first report.
    pub fn from_report(id: &str, report: &NodeReport, now: u64) -> Self {
        let mut node = Self::new(id);
        node.apply_report(report, now);
        node
    }

    /// Merge a self-report into this record.
    ///
    /// Utilization fields are replaced; reservation and hosted instances
    /// are left untouched.
    pub fn apply_report(&mut self, report: &NodeReport, now: u64) {
        self.cpu_count = report.cpu_count;
        self.cpu_used_percent = report.cpu_used_percent;
        self.mem_used_bytes = report.mem_used_bytes;
        self.mem_used_percent = report.mem_used_percent;
        self.disk = report.disk.clone();
        self.load = report.load.clone();
        self.state = report.state.unwrap_or(HealthState::Ok);
        self.last_report = now;
    }
}

// ── Service ───────────────────────────────────────────────────────

/// Per-replica resource reservation requested by a service.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequest {
    /// Fractional cores (`1.0` = one full core).
    pub cpu: f64,
    pub memory_bytes: u64,
}

impl ResourceRequest {
    pub fn new(cpu: f64, memory_bytes: u64) -> Self {
        Self { cpu, memory_bytes }
    }
}

/// A published → target port pair exposed through the reverse proxy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub published: u16,
    pub target: u16,
}

/// Immutable container launch template built from a service definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchTemplate {
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    /// Overlay network the container joins.
    pub network: Option<String>,
    pub restart: Option<String>,
    pub privileged: bool,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
}

/// One named component of a stack, with its running instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub stack: String,
    pub name: String,
    /// Desired replica count.
    pub replicas: u32,
    pub reservation: Option<ResourceRequest>,
    pub ports: Vec<PortMapping>,
    pub template: LaunchTemplate,
    pub instances: Vec<InstanceRecord>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ServiceRecord {
    /// Build the `{stack}/{service}` identifier.
    pub fn service_id(stack: &str, name: &str) -> ServiceId {
        format!("{stack}/{name}")
    }

    /// Index of an instance in this service, if present.
    pub fn instance_index(&self, instance_id: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.id == instance_id)
    }

    /// Whether the running instance count matches the desired replicas.
    pub fn is_converged(&self) -> bool {
        self.instances.len() == self.replicas as usize
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// A named metric value pushed for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
}

/// One running replica of a service, bound to exactly one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    /// Container id returned by the runtime.
    pub id: InstanceId,
    pub service_id: ServiceId,
    pub node_id: NodeId,
    /// Address on the overlay network, once known.
    pub address: Option<String>,
    pub state: HealthState,
    /// Resources committed in the ledger for this replica, if any.
    #[serde(default)]
    pub reservation: Option<ResourceRequest>,
    pub metrics: Vec<MetricValue>,
    pub timeout: Option<u32>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Cluster ───────────────────────────────────────────────────────

/// Cluster-wide settings persisted on first start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Address of the DNS registrar.
    pub dns_address: Option<String>,
    /// Address of the reverse-proxy registrar.
    pub proxy_address: Option<String>,
    /// Address used in host forwarding rules for the proxy.
    pub proxy_host_address: Option<String>,
    /// DNS servers injected into every container.
    pub dns_servers: Vec<String>,
    /// Overlay network every container joins.
    pub network: String,
    /// Suffix for discovery records: `{service}.{stack}.{domain}`.
    pub domain: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            dns_address: None,
            proxy_address: None,
            proxy_host_address: None,
            dns_servers: Vec::new(),
            network: "kinetik".to_string(),
            domain: "kinetik".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Discovery record name for a service.
    pub fn record_name(&self, stack: &str, service: &str) -> String {
        format!("{service}.{stack}.{}", self.domain)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
