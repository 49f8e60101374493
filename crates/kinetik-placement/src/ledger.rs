//! Resource ledger — the authoritative per-node reservation view.
//!
//! Every node has its own entry behind a `tokio::sync::Mutex`. All
//! mutations of one node (reserve, release, self-report merge, instance
//! back-references, health changes) run inside that entry's lock, so a
//! capacity check and the reservation it justifies can never interleave
//! with another writer. Different nodes are independent.
//!
//! The node lock covers the in-memory commit only. Persistence happens
//! after it is dropped, guarded by the record's revision so an older
//! snapshot never replaces a newer one in the store. A failed write takes
//! the change back out of memory and surfaces [`LedgerError::Storage`].
//!
//! Writers hold the map's read guard until their write lands; removal and
//! registration take the write guard, so they never race a pending write
//! of the same node.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kinetik_core::{
    HealthState, NodeId, NodeRecord, NodeReport, ResourceRequest, epoch_secs,
};
use kinetik_state::{StateResult, StateStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capacity::{Fit, check_fit};
use crate::error::LedgerError;

struct NodeEntry {
    record: NodeRecord,
    /// Set once the entry has been removed from the map. Readers holding
    /// an old handle skip it.
    retired: bool,
}

type Slot = Arc<Mutex<NodeEntry>>;

fn new_slot(record: NodeRecord) -> Slot {
    Arc::new(Mutex::new(NodeEntry {
        record,
        retired: false,
    }))
}

/// Concurrency-safe map of node id → node record with reservations.
pub struct ResourceLedger {
    nodes: RwLock<HashMap<NodeId, Slot>>,
    store: Option<StateStore>,
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLedger {
    /// An empty, memory-only ledger.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Build a ledger backed by `store`, seeded with every persisted node.
    pub fn load(store: StateStore) -> StateResult<Self> {
        let mut nodes = HashMap::new();
        for record in store.list_nodes()? {
            nodes.insert(record.id.clone(), new_slot(record));
        }
        info!(nodes = nodes.len(), "resource ledger loaded");
        Ok(Self {
            nodes: RwLock::new(nodes),
            store: Some(store),
        })
    }

    fn persist(&self, record: &NodeRecord) -> Result<(), LedgerError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let written = store
            .put_node_if_newer(record)
            .map_err(|e| LedgerError::Storage {
                node: record.id.clone(),
                reason: e.to_string(),
            })?;
        if !written {
            debug!(node = %record.id, revision = record.revision, "newer revision already stored");
        }
        Ok(())
    }

    async fn slot(&self, node_id: &str) -> Result<Slot, LedgerError> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(node_id.to_string()))
    }

    /// Apply a change to one node, then persist it outside the node lock.
    ///
    /// `apply` runs in the critical section and bumps nothing itself; the
    /// revision is bumped here. If the write fails, the record is restored
    /// when nobody touched it since, otherwise `undo` takes this change back
    /// out of the newer record.
    async fn mutate<R>(
        &self,
        node_id: &str,
        apply: impl FnOnce(&mut NodeRecord) -> Result<R, LedgerError>,
        undo: impl FnOnce(&mut NodeRecord, &R),
    ) -> Result<(R, NodeRecord), LedgerError> {
        let nodes = self.nodes.read().await;
        let slot = nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(node_id.to_string()))?;

        let (before, out, committed) = {
            let mut entry = slot.lock().await;
            let before = entry.record.clone();
            let out = apply(&mut entry.record)?;
            entry.record.revision += 1;
            (before, out, entry.record.clone())
        };

        if let Err(e) = self.persist(&committed) {
            let mut entry = slot.lock().await;
            if entry.record.revision == committed.revision {
                entry.record = before;
            } else {
                undo(&mut entry.record, &out);
                entry.record.revision += 1;
                let current = entry.record.clone();
                drop(entry);
                if let Err(again) = self.persist(&current) {
                    warn!(node = %node_id, error = %again, "store still failing after rollback");
                }
            }
            return Err(e);
        }
        drop(nodes);
        Ok((out, committed))
    }

    /// Insert a brand-new node and persist it. `None` if the id is taken.
    ///
    /// The entry is published first so the write does not block the map.
    /// If the write fails and nobody has touched the entry, it is dropped.
    async fn register(&self, record: NodeRecord) -> Result<Option<NodeRecord>, LedgerError> {
        let slot = new_slot(record.clone());
        let nodes = {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(&record.id) {
                return Ok(None);
            }
            nodes.insert(record.id.clone(), slot.clone());
            nodes.downgrade()
        };
        let result = self.persist(&record);
        drop(nodes);

        if let Err(e) = result {
            let mut nodes = self.nodes.write().await;
            let mut entry = slot.lock().await;
            if entry.record.revision == record.revision
                && nodes.get(&record.id).is_some_and(|s| Arc::ptr_eq(s, &slot))
            {
                nodes.remove(&record.id);
                entry.retired = true;
            }
            return Err(e);
        }
        Ok(Some(record))
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Snapshot of one node.
    pub async fn get(&self, node_id: &str) -> Result<NodeRecord, LedgerError> {
        let slot = self.slot(node_id).await?;
        let entry = slot.lock().await;
        Ok(entry.record.clone())
    }

    /// Snapshot of every node, ordered by id.
    pub async fn list(&self) -> BTreeMap<NodeId, NodeRecord> {
        let slots: Vec<Slot> = self.nodes.read().await.values().cloned().collect();
        let mut out = BTreeMap::new();
        for slot in slots {
            let entry = slot.lock().await;
            if !entry.retired {
                out.insert(entry.record.id.clone(), entry.record.clone());
            }
        }
        out
    }

    /// Every known node id, sorted.
    pub async fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().await.contains_key(node_id)
    }

    // ── Reservations ───────────────────────────────────────────────

    /// Reserve `request` on a node if it fits, as one atomic step.
    pub async fn reserve(
        &self,
        node_id: &str,
        request: &ResourceRequest,
    ) -> Result<NodeRecord, LedgerError> {
        let (_, record) = self
            .mutate(
                node_id,
                |node| {
                    let fit = check_fit(node, request);
                    if !fit.fits() {
                        return Err(LedgerError::InsufficientCapacity {
                            node: node.id.clone(),
                            fit,
                        });
                    }
                    let Some(memory) = node.reservation.memory_bytes.checked_add(request.memory_bytes)
                    else {
                        return Err(LedgerError::InsufficientCapacity {
                            node: node.id.clone(),
                            fit: Fit::InsufficientMemory {
                                requested: request.memory_bytes,
                                available: i128::from(u64::MAX - node.reservation.memory_bytes),
                            },
                        });
                    };
                    node.reservation.cpu += request.cpu;
                    node.reservation.memory_bytes = memory;
                    Ok(())
                },
                |node, _| {
                    node.reservation.cpu = (node.reservation.cpu - request.cpu).max(0.0);
                    node.reservation.memory_bytes =
                        node.reservation.memory_bytes.saturating_sub(request.memory_bytes);
                },
            )
            .await?;
        debug!(
            node = %node_id,
            cpu = request.cpu,
            memory = request.memory_bytes,
            reserved_cpu = record.reservation.cpu,
            reserved_memory = record.reservation.memory_bytes,
            "reservation committed"
        );
        Ok(record)
    }

    /// Return `request` to a node. Counters never drop below zero.
    pub async fn release(
        &self,
        node_id: &str,
        request: &ResourceRequest,
    ) -> Result<NodeRecord, LedgerError> {
        let (_, record) = self
            .mutate(
                node_id,
                |node| {
                    let old = node.reservation;
                    node.reservation.cpu = (old.cpu - request.cpu).max(0.0);
                    node.reservation.memory_bytes =
                        old.memory_bytes.saturating_sub(request.memory_bytes);
                    // What actually came off the counters.
                    Ok(ResourceRequest::new(
                        old.cpu - node.reservation.cpu,
                        old.memory_bytes - node.reservation.memory_bytes,
                    ))
                },
                |node, freed| {
                    node.reservation.cpu += freed.cpu;
                    node.reservation.memory_bytes =
                        node.reservation.memory_bytes.saturating_add(freed.memory_bytes);
                },
            )
            .await?;
        debug!(
            node = %node_id,
            cpu = request.cpu,
            memory = request.memory_bytes,
            reserved_cpu = record.reservation.cpu,
            reserved_memory = record.reservation.memory_bytes,
            "reservation released"
        );
        Ok(record)
    }

    // ── Node lifecycle ─────────────────────────────────────────────

    /// Create or refresh a node from its self-report.
    ///
    /// Only utilization and health are taken from the report; the committed
    /// reservation and hosted instances are preserved.
    pub async fn upsert_from_report(
        &self,
        node_id: &str,
        report: &NodeReport,
    ) -> Result<NodeRecord, LedgerError> {
        loop {
            let now = epoch_secs();
            match self
                .mutate(
                    node_id,
                    |node| {
                        let previous = node.clone();
                        node.apply_report(report, now);
                        Ok(previous)
                    },
                    |node, previous| {
                        // Only restore what the report overwrote.
                        if node.last_report == now {
                            node.cpu_count = previous.cpu_count;
                            node.cpu_used_percent = previous.cpu_used_percent;
                            node.mem_used_bytes = previous.mem_used_bytes;
                            node.mem_used_percent = previous.mem_used_percent;
                            node.disk = previous.disk.clone();
                            node.load = previous.load.clone();
                            node.state = previous.state;
                            node.last_report = previous.last_report;
                        }
                    },
                )
                .await
            {
                Ok((_, record)) => return Ok(record),
                Err(LedgerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            let mut record = NodeRecord::from_report(node_id, report, now);
            record.revision = 1;
            if let Some(record) = self.register(record).await? {
                info!(node = %node_id, cpus = record.cpu_count, "node registered");
                return Ok(record);
            }
            // Someone else registered it first; merge into theirs.
        }
    }

    /// Register a node with no utilization data yet, if absent.
    pub async fn ensure(&self, node_id: &str) -> Result<NodeRecord, LedgerError> {
        loop {
            if let Ok(record) = self.get(node_id).await {
                return Ok(record);
            }
            let mut record = NodeRecord::new(node_id);
            record.revision = 1;
            if let Some(record) = self.register(record).await? {
                info!(node = %node_id, "node registered without report");
                return Ok(record);
            }
        }
    }

    /// Set a node's health state.
    pub async fn set_state(
        &self,
        node_id: &str,
        state: HealthState,
    ) -> Result<NodeRecord, LedgerError> {
        let (_, record) = self
            .mutate(
                node_id,
                |node| Ok(std::mem::replace(&mut node.state, state)),
                |node, previous| {
                    if node.state == state {
                        node.state = *previous;
                    }
                },
            )
            .await?;
        Ok(record)
    }

    /// Record that an instance now runs on a node.
    pub async fn attach_instance(
        &self,
        node_id: &str,
        instance_id: &str,
    ) -> Result<NodeRecord, LedgerError> {
        let (_, record) = self
            .mutate(
                node_id,
                |node| {
                    let added = !node.instances.iter().any(|i| i == instance_id);
                    if added {
                        node.instances.push(instance_id.to_string());
                    }
                    Ok(added)
                },
                |node, added| {
                    if *added {
                        node.instances.retain(|i| i != instance_id);
                    }
                },
            )
            .await?;
        Ok(record)
    }

    /// Drop an instance back-reference from a node.
    pub async fn detach_instance(
        &self,
        node_id: &str,
        instance_id: &str,
    ) -> Result<NodeRecord, LedgerError> {
        let (_, record) = self
            .mutate(
                node_id,
                |node| {
                    let before = node.instances.len();
                    node.instances.retain(|i| i != instance_id);
                    Ok(node.instances.len() != before)
                },
                |node, removed| {
                    if *removed && !node.instances.iter().any(|i| i == instance_id) {
                        node.instances.push(instance_id.to_string());
                    }
                },
            )
            .await?;
        Ok(record)
    }

    /// Remove a node from the ledger and the store.
    ///
    /// Hosted instances are not touched. The map's write guard keeps
    /// pending writes of this node out while the row is deleted; the node
    /// lock itself is only taken to mark the entry.
    pub async fn remove(&self, node_id: &str) -> Result<NodeRecord, LedgerError> {
        let mut nodes = self.nodes.write().await;
        let slot = nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(node_id.to_string()))?;

        if let Some(store) = &self.store {
            store.delete_node(node_id).map_err(|e| LedgerError::Storage {
                node: node_id.to_string(),
                reason: e.to_string(),
            })?;
        }
        nodes.remove(node_id);
        drop(nodes);

        let mut entry = slot.lock().await;
        entry.retired = true;
        info!(
            node = %node_id,
            orphaned_instances = entry.record.instances.len(),
            "node removed"
        );
        Ok(entry.record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> NodeReport {
        NodeReport {
            cpu_count: 4,
            cpu_used_percent: 50.0,
            mem_used_bytes: 2_000_000_000,
            mem_used_percent: 0.5,
            ..NodeReport::default()
        }
    }

    async fn ledger_with(ids: &[&str]) -> ResourceLedger {
        let ledger = ResourceLedger::new();
        for id in ids {
            ledger.upsert_from_report(id, &report()).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn reserve_commits_reference_request() {
        let ledger = ledger_with(&["n1"]).await;

        let node = ledger
            .reserve("n1", &ResourceRequest::new(1.0, 500_000_000))
            .await
            .unwrap();
        assert_eq!(node.reservation.cpu, 1.0);
        assert_eq!(node.reservation.memory_bytes, 500_000_000);
    }

    #[tokio::test]
    async fn back_to_back_reservations_compose() {
        let ledger = ledger_with(&["n1"]).await;
        ledger
            .reserve("n1", &ResourceRequest::new(1.0, 500_000_000))
            .await
            .unwrap();

        let err = ledger
            .reserve("n1", &ResourceRequest::new(3.5, 0))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientCapacity {
                node: "n1".to_string(),
                fit: Fit::InsufficientCpu {
                    requested: 350.0,
                    available: 250.0
                }
            }
        );
        assert_eq!(ledger.get("n1").await.unwrap().reservation.cpu, 1.0);
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let ledger = ResourceLedger::new();
        assert_eq!(
            ledger.reserve("ghost", &ResourceRequest::new(0.1, 1)).await,
            Err(LedgerError::NotFound("ghost".to_string()))
        );
        assert_eq!(
            ledger.release("ghost", &ResourceRequest::new(0.1, 1)).await,
            Err(LedgerError::NotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let ledger = ledger_with(&["n1"]).await;
        ledger
            .reserve("n1", &ResourceRequest::new(0.5, 100))
            .await
            .unwrap();

        let node = ledger
            .release("n1", &ResourceRequest::new(2.0, 1_000))
            .await
            .unwrap();
        assert_eq!(node.reservation.cpu, 0.0);
        assert_eq!(node.reservation.memory_bytes, 0);
    }

    #[tokio::test]
    async fn report_preserves_reservation_and_instances() {
        let ledger = ledger_with(&["n1"]).await;
        ledger
            .reserve("n1", &ResourceRequest::new(1.0, 10))
            .await
            .unwrap();
        ledger
            .attach_instance("n1", "c1")
            .await
            .unwrap();

        let fresh = NodeReport {
            cpu_used_percent: 10.0,
            state: Some(HealthState::Warn),
            ..report()
        };
        let node = ledger.upsert_from_report("n1", &fresh).await.unwrap();
        assert_eq!(node.cpu_used_percent, 10.0);
        assert_eq!(node.state, HealthState::Warn);
        assert_eq!(node.reservation.cpu, 1.0);
        assert_eq!(node.instances, vec!["c1"]);
    }

    #[tokio::test]
    async fn revision_increases_on_every_mutation() {
        let ledger = ledger_with(&["n1"]).await;
        let r1 = ledger.get("n1").await.unwrap().revision;
        ledger.set_state("n1", HealthState::Ok).await.unwrap();
        let r2 = ledger.get("n1").await.unwrap().revision;
        assert!(r2 > r1);

        // Failed reservations do not count.
        let _ = ledger.reserve("n1", &ResourceRequest::new(100.0, 0)).await;
        assert_eq!(ledger.get("n1").await.unwrap().revision, r2);
    }

    #[tokio::test]
    async fn instance_back_references() {
        let ledger = ledger_with(&["n1"]).await;
        ledger.attach_instance("n1", "c1").await.unwrap();
        ledger.attach_instance("n1", "c1").await.unwrap();
        ledger.attach_instance("n1", "c2").await.unwrap();
        assert_eq!(ledger.get("n1").await.unwrap().instances, vec!["c1", "c2"]);

        ledger.detach_instance("n1", "c1").await.unwrap();
        assert_eq!(ledger.get("n1").await.unwrap().instances, vec!["c2"]);
    }

    #[tokio::test]
    async fn remove_then_report_recreates_fresh_entry() {
        let ledger = ledger_with(&["n1", "n2"]).await;
        ledger
            .reserve("n1", &ResourceRequest::new(1.0, 10))
            .await
            .unwrap();

        ledger.remove("n1").await.unwrap();
        assert_eq!(ledger.ids().await, vec!["n2"]);
        assert!(matches!(
            ledger.get("n1").await,
            Err(LedgerError::NotFound(_))
        ));

        let node = ledger.upsert_from_report("n1", &report()).await.unwrap();
        assert_eq!(node.reservation.cpu, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_overcommit() {
        let ledger = Arc::new(ledger_with(&["n1"]).await);
        // 350% CPU free: at most three 1.0-core requests can fit.
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .reserve("n1", &ResourceRequest::new(1.0, 1_000_000))
                    .await
                    .is_ok()
            }));
        }

        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);

        let node = ledger.get("n1").await.unwrap();
        assert_eq!(node.reservation.cpu, 3.0);
        assert_eq!(node.reservation.memory_bytes, 3_000_000);
    }

    #[tokio::test]
    async fn persisted_nodes_survive_reload() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let ledger = ResourceLedger::load(store.clone()).unwrap();
            ledger.upsert_from_report("n1", &report()).await.unwrap();
            ledger
                .reserve("n1", &ResourceRequest::new(1.0, 500_000_000))
                .await
                .unwrap();
        }

        let ledger = ResourceLedger::load(store.clone()).unwrap();
        let node = ledger.get("n1").await.unwrap();
        assert_eq!(node.reservation.cpu, 1.0);
        assert_eq!(store.get_node("n1").unwrap().unwrap().revision, node.revision);

        ledger.remove("n1").await.unwrap();
        assert!(store.get_node("n1").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn store_keeps_the_newest_revision_under_concurrent_writes() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = Arc::new(ResourceLedger::load(store.clone()).unwrap());
        ledger.upsert_from_report("n1", &report()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..24 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("c{i}");
                ledger.attach_instance("n1", &id).await.unwrap();
                let _ = ledger.reserve("n1", &ResourceRequest::new(0.1, 1_000)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let live = ledger.get("n1").await.unwrap();
        let stored = store.get_node("n1").unwrap().unwrap();
        assert_eq!(stored, live);
        assert_eq!(stored.instances.len(), 24);
    }

    #[tokio::test]
    async fn oversized_reservation_is_refused_instead_of_overflowing() {
        let ledger = ResourceLedger::new();
        let huge = NodeReport {
            cpu_count: 8,
            cpu_used_percent: 0.0,
            mem_used_bytes: 10_000_000_000_000,
            mem_used_percent: 1e-7,
            ..NodeReport::default()
        };
        ledger.upsert_from_report("n1", &huge).await.unwrap();

        let request = ResourceRequest::new(0.0, 15_000_000_000_000_000_000);
        ledger.reserve("n1", &request).await.unwrap();
        let err = ledger.reserve("n1", &request).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientCapacity {
                fit: Fit::InsufficientMemory { .. },
                ..
            }
        ));
        assert_eq!(
            ledger.get("n1").await.unwrap().reservation.memory_bytes,
            15_000_000_000_000_000_000
        );
    }

    #[tokio::test]
    async fn concurrent_first_reports_register_one_entry() {
        let ledger = Arc::new(ResourceLedger::new());
        let a = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.ensure("n1").await.unwrap() })
        };
        ledger.upsert_from_report("n1", &report()).await.unwrap();
        a.await.unwrap();

        assert_eq!(ledger.ids().await, vec!["n1"]);
        assert_eq!(ledger.get("n1").await.unwrap().cpu_count, 4);
    }
}
