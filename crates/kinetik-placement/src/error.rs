//! Error types for the placement core.

use std::collections::BTreeSet;

use kinetik_core::NodeId;
use thiserror::Error;

use crate::capacity::Fit;

/// Errors returned by the resource ledger.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("node {node} has insufficient capacity: {fit}")]
    InsufficientCapacity { node: NodeId, fit: Fit },

    #[error("failed to persist node {node}: {reason}")]
    Storage { node: NodeId, reason: String },
}

/// Errors returned by a scheduling policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlacementError {
    #[error("no eligible node among {considered} candidates")]
    NoEligibleNode { considered: usize },
}

/// Errors returned by the dependency resolver.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    #[error("circular dependency among: {}", join(remaining))]
    CircularDependency { remaining: BTreeSet<String> },

    #[error("{service} depends on {dependency}, which is not part of the graph")]
    MissingDependency { service: String, dependency: String },
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}
