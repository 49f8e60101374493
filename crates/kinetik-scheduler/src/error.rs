//! Orchestrator error types.

use std::collections::BTreeSet;
use std::time::Duration;

use kinetik_core::{NodeId, ServiceId, StackError};
use kinetik_placement::{LedgerError, ResolveError};
use kinetik_state::StateError;
use thiserror::Error;

use crate::report::DeploymentReport;

/// Errors returned by orchestrator operations.
///
/// Variants raised mid-deployment carry the partial [`DeploymentReport`]
/// so the caller can see what was placed and whether it was rolled back.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("already exists: {0}")]
    AlreadyExists(ServiceId),

    #[error("circular dependency among: {}", remaining.iter().cloned().collect::<Vec<_>>().join(", "))]
    CircularDependency { remaining: BTreeSet<String> },

    #[error("no eligible node for {service}")]
    NoEligibleNode {
        service: ServiceId,
        report: Option<Box<DeploymentReport>>,
    },

    #[error("runtime error for {service} on {node}: {reason}")]
    Runtime {
        service: ServiceId,
        node: NodeId,
        reason: String,
        report: Option<Box<DeploymentReport>>,
    },

    #[error("deadline of {deadline:?} exceeded deploying {stack}")]
    DeadlineExceeded {
        stack: String,
        deadline: Duration,
        report: Box<DeploymentReport>,
    },

    #[error("node {node} unreachable: {reason}")]
    NodeUnreachable { node: NodeId, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),
}

impl OrchestratorError {
    /// Partial state of the request that failed, if any.
    pub fn report(&self) -> Option<&DeploymentReport> {
        match self {
            OrchestratorError::NoEligibleNode { report, .. }
            | OrchestratorError::Runtime { report, .. } => report.as_deref(),
            OrchestratorError::DeadlineExceeded { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl From<StackError> for OrchestratorError {
    fn from(e: StackError) -> Self {
        OrchestratorError::Validation(e.to_string())
    }
}

impl From<ResolveError> for OrchestratorError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::CircularDependency { remaining } => {
                OrchestratorError::CircularDependency { remaining }
            }
            other => OrchestratorError::Validation(other.to_string()),
        }
    }
}

impl From<LedgerError> for OrchestratorError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(node) => OrchestratorError::NotFound(format!("node {node}")),
            other => OrchestratorError::Ledger(other),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
