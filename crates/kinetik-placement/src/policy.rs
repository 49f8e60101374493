//! Scheduling policies — pick the node that hosts one replica.
//!
//! A policy that accounts for resources reserves them as part of
//! selection: once [`SchedulingPolicy::select_node`] returns, the ledger
//! already carries the reservation, so a concurrent call cannot be handed
//! the same capacity.

use std::sync::Arc;

use async_trait::async_trait;
use kinetik_core::{NodeId, NodeRecord, ResourceRequest};
use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use crate::error::{LedgerError, PlacementError};
use crate::ledger::ResourceLedger;

/// Source of the per-node hosted-container count used to rank nodes.
#[async_trait]
pub trait LoadProbe: Send + Sync {
    async fn container_count(&self, node_id: &str) -> anyhow::Result<u32>;
}

/// A node picked for one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub node_id: NodeId,
    /// What was reserved on the node, if the policy accounts for resources.
    pub reserved: Option<ResourceRequest>,
}

#[async_trait]
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Select a node for one replica with the given constraints.
    async fn select_node(
        &self,
        request: Option<&ResourceRequest>,
    ) -> Result<Selection, PlacementError>;
}

fn schedulable(nodes: impl IntoIterator<Item = NodeRecord>) -> Vec<NodeRecord> {
    nodes
        .into_iter()
        .filter(|n| n.state.is_schedulable())
        .collect()
}

// ── Uniform random ────────────────────────────────────────────────

/// Picks uniformly among schedulable nodes and ignores constraints.
///
/// Nothing is reserved; use it only when no resource accounting is wanted.
pub struct UniformRandom {
    ledger: Arc<ResourceLedger>,
}

impl UniformRandom {
    pub fn new(ledger: Arc<ResourceLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl SchedulingPolicy for UniformRandom {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn select_node(
        &self,
        _request: Option<&ResourceRequest>,
    ) -> Result<Selection, PlacementError> {
        let candidates = schedulable(self.ledger.list().await.into_values());
        let picked = candidates
            .choose(&mut rand::rng())
            .map(|n| n.id.clone())
            .ok_or(PlacementError::NoEligibleNode {
                considered: candidates.len(),
            })?;
        debug!(node = %picked, candidates = candidates.len(), "random node selected");
        Ok(Selection {
            node_id: picked,
            reserved: None,
        })
    }
}

// ── Best fit by load ──────────────────────────────────────────────

/// Prefers the node hosting the fewest containers that can take the request.
///
/// Candidates are ranked by `(container count, node id)`. Without
/// constraints the first candidate wins. With constraints the first node
/// whose ledger accepts the reservation wins, and keeps it.
pub struct BestFitByLoad {
    ledger: Arc<ResourceLedger>,
    probe: Arc<dyn LoadProbe>,
}

impl BestFitByLoad {
    pub fn new(ledger: Arc<ResourceLedger>, probe: Arc<dyn LoadProbe>) -> Self {
        Self { ledger, probe }
    }

    /// Schedulable node ids, least loaded first.
    pub async fn ranked(&self) -> Vec<NodeId> {
        let candidates = schedulable(self.ledger.list().await.into_values());
        let mut ranked = Vec::with_capacity(candidates.len());
        for node in candidates {
            let count = match self.probe.container_count(&node.id).await {
                Ok(count) => count,
                Err(e) => {
                    // Unreachable runtimes sort last rather than disappear.
                    warn!(node = %node.id, error = %e, "container count unavailable");
                    u32::MAX
                }
            };
            ranked.push((count, node.id));
        }
        ranked.sort();
        ranked.into_iter().map(|(_, id)| id).collect()
    }
}

#[async_trait]
impl SchedulingPolicy for BestFitByLoad {
    fn name(&self) -> &'static str {
        "best-fit"
    }

    async fn select_node(
        &self,
        request: Option<&ResourceRequest>,
    ) -> Result<Selection, PlacementError> {
        let ranked = self.ranked().await;
        let considered = ranked.len();

        let Some(request) = request else {
            let node_id = ranked
                .into_iter()
                .next()
                .ok_or(PlacementError::NoEligibleNode { considered })?;
            debug!(node = %node_id, "least loaded node selected");
            return Ok(Selection {
                node_id,
                reserved: None,
            });
        };

        for node_id in ranked {
            match self.ledger.reserve(&node_id, request).await {
                Ok(_) => {
                    debug!(node = %node_id, cpu = request.cpu, memory = request.memory_bytes, "node selected");
                    return Ok(Selection {
                        node_id,
                        reserved: Some(*request),
                    });
                }
                Err(LedgerError::InsufficientCapacity { fit, .. }) => {
                    debug!(node = %node_id, %fit, "node skipped");
                }
                Err(LedgerError::NotFound(_)) => {
                    debug!(node = %node_id, "node vanished during selection");
                }
                Err(e) => {
                    warn!(node = %node_id, error = %e, "reservation failed");
                }
            }
        }

        Err(PlacementError::NoEligibleNode { considered })
    }
}
