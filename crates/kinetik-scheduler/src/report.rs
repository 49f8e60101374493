//! Deployment phases and the report returned to callers.

use kinetik_core::{InstanceId, NodeId, ServiceId, ServiceRecord};
use serde::{Deserialize, Serialize};

/// Current phase of a deployment request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum DeployPhase {
    /// Validating the stack definition.
    #[default]
    Parsing,
    /// Ordering services by dependency.
    Resolving,
    /// Placing replica `current` of `total`.
    Placing { current: u32, total: u32 },
    /// Registering placed replicas with discovery and routing.
    Registering { service: String },
    Completed,
    Failed { reason: String },
}

/// Which registration step failed for a running replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationTarget {
    /// Overlay address lookup after start.
    Address,
    Discovery,
    Route,
    Forwarding,
}

/// A registration failure after the container was already running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationIssue {
    pub service: ServiceId,
    pub instance: Option<InstanceId>,
    pub target: RegistrationTarget,
    pub reason: String,
}

/// A replica whose container could not be started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaFailure {
    pub service: ServiceId,
    pub node: NodeId,
    pub reason: String,
}

/// Outcome of a deployment, scale or reconcile operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub stack: String,
    pub phase: DeployPhase,
    /// Resolved service order.
    pub order: Vec<String>,
    /// Services touched, with their instances as of the end of the request.
    pub services: Vec<ServiceRecord>,
    pub issues: Vec<RegistrationIssue>,
    pub failures: Vec<ReplicaFailure>,
    /// Everything the request created was torn down.
    pub rolled_back: bool,
}

impl DeploymentReport {
    pub fn new(stack: &str) -> Self {
        Self {
            stack: stack.to_string(),
            ..Self::default()
        }
    }

    /// Succeeded but with replicas missing or unreachable.
    pub fn is_degraded(&self) -> bool {
        !self.issues.is_empty() || !self.failures.is_empty()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|s| s.name == name)
    }
}
