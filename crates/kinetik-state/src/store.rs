//! StateStore — redb-backed state persistence for Kinetik.
//!
//! Provides typed CRUD operations over nodes, services, and the cluster
//! configuration. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).
//!
//! Instances are not stored separately: they live inside their owning
//! [`ServiceRecord`] and are derived from it when listed.

use std::path::Path;
use std::sync::Arc;

use kinetik_core::{ClusterConfig, InstanceRecord, NodeRecord, ServiceRecord};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|source| StateError::Open {
            location: path.display().to_string(),
            source,
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|source| StateError::Open {
                location: "memory".to_string(),
                source,
            })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(StateError::storage)?;
        // Opening a table in a write transaction creates it if absent.
        for table in [NODES, SERVICES, CONFIG] {
            txn.open_table(table).map_err(StateError::storage)?;
        }
        txn.commit().map_err(StateError::storage)?;
        Ok(())
    }

    // ── Generic row access ─────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(|source| StateError::Encode {
            table: table.name().to_string(),
            key: key.to_string(),
            source,
        })?;
        let txn = self.db.begin_write().map_err(StateError::storage)?;
        {
            let mut rows = txn.open_table(table).map_err(StateError::storage)?;
            rows.insert(key, value.as_slice())
                .map_err(StateError::storage)?;
        }
        txn.commit().map_err(StateError::storage)?;
        Ok(())
    }

    fn decode<T: DeserializeOwned>(table: Table, key: &str, bytes: &[u8]) -> StateResult<T> {
        serde_json::from_slice(bytes).map_err(|source| StateError::Corrupt {
            table: table.name().to_string(),
            key: key.to_string(),
            source,
        })
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(StateError::storage)?;
        let rows = txn.open_table(table).map_err(StateError::storage)?;
        match rows.get(key).map_err(StateError::storage)? {
            Some(guard) => Ok(Some(Self::decode(table, key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(StateError::storage)?;
        let rows = txn.open_table(table).map_err(StateError::storage)?;
        let mut results = Vec::new();
        for entry in rows.iter().map_err(StateError::storage)? {
            let (key, value) = entry.map_err(StateError::storage)?;
            results.push(Self::decode(table, key.value(), value.value())?);
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(StateError::storage)?;
        let existed;
        {
            let mut rows = txn.open_table(table).map_err(StateError::storage)?;
            existed = rows.remove(key).map_err(StateError::storage)?.is_some();
        }
        txn.commit().map_err(StateError::storage)?;
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record unconditionally.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put(NODES, &node.id, node)
    }

    /// Store a node unless the stored copy is already at least as new.
    ///
    /// Read and write share one write transaction, so two writers racing
    /// with different revisions always leave the higher one behind.
    /// Returns false when the write was skipped.
    pub fn put_node_if_newer(&self, node: &NodeRecord) -> StateResult<bool> {
        let value = serde_json::to_vec(node).map_err(|source| StateError::Encode {
            table: NODES.name().to_string(),
            key: node.id.clone(),
            source,
        })?;
        let txn = self.db.begin_write().map_err(StateError::storage)?;
        let written = {
            let mut rows = txn.open_table(NODES).map_err(StateError::storage)?;
            let stored = match rows.get(node.id.as_str()).map_err(StateError::storage)? {
                Some(guard) => Some(Self::decode::<NodeRecord>(NODES, &node.id, guard.value())?.revision),
                None => None,
            };
            if stored.is_some_and(|rev| rev >= node.revision) {
                false
            } else {
                rows.insert(node.id.as_str(), value.as_slice())
                    .map_err(StateError::storage)?;
                true
            }
        };
        txn.commit().map_err(StateError::storage)?;
        Ok(written)
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get(NODES, node_id)
    }

    /// List all nodes, ordered by ID.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.list(NODES)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let existed = self.delete(NODES, node_id)?;
        debug!(node = %node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service record (instances included).
    pub fn put_service(&self, svc: &ServiceRecord) -> StateResult<()> {
        self.put(SERVICES, &svc.id, svc)?;
        debug!(service = %svc.id, instances = svc.instances.len(), "service stored");
        Ok(())
    }

    /// Get a service by `{stack}/{service}` key.
    pub fn get_service(&self, key: &str) -> StateResult<Option<ServiceRecord>> {
        self.get(SERVICES, key)
    }

    /// List all services, ordered by key.
    pub fn list_services(&self) -> StateResult<Vec<ServiceRecord>> {
        self.list(SERVICES)
    }

    /// List every service of one stack.
    pub fn list_services_in_stack(&self, stack: &str) -> StateResult<Vec<ServiceRecord>> {
        Ok(self
            .list_services()?
            .into_iter()
            .filter(|s| s.stack == stack)
            .collect())
    }

    /// Delete a service by key. Returns true if it existed.
    pub fn delete_service(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(SERVICES, key)?;
        debug!(service = %key, existed, "service deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// List every instance across all services.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_services()?
            .into_iter()
            .flat_map(|s| s.instances)
            .collect())
    }

    /// Find the service owning an instance.
    pub fn find_instance(&self, instance_id: &str) -> StateResult<Option<ServiceRecord>> {
        Ok(self
            .list_services()?
            .into_iter()
            .find(|s| s.instance_index(instance_id).is_some()))
    }

    // ── Cluster configuration ──────────────────────────────────────

    pub fn get_cluster_config(&self) -> StateResult<Option<ClusterConfig>> {
        self.get(CONFIG, CLUSTER_CONFIG_KEY)
    }

    pub fn put_cluster_config(&self, config: &ClusterConfig) -> StateResult<()> {
        self.put(CONFIG, CLUSTER_CONFIG_KEY, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetik_core::{HealthState, LaunchTemplate, NodeReport};

    fn test_node(id: &str, revision: u64) -> NodeRecord {
        let report = NodeReport {
            cpu_count: 4,
            cpu_used_percent: 50.0,
            mem_used_bytes: 2_000_000_000,
            mem_used_percent: 0.5,
            ..NodeReport::default()
        };
        let mut node = NodeRecord::from_report(id, &report, 1000);
        node.revision = revision;
        node
    }

    fn test_instance(service_id: &str, id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            service_id: service_id.to_string(),
            node_id: "node-1".to_string(),
            address: Some("10.0.0.5".to_string()),
            state: HealthState::Ok,
            reservation: None,
            metrics: Vec::new(),
            timeout: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_service(stack: &str, name: &str, instances: &[&str]) -> ServiceRecord {
        let id = ServiceRecord::service_id(stack, name);
        ServiceRecord {
            instances: instances.iter().map(|i| test_instance(&id, i)).collect(),
            id,
            stack: stack.to_string(),
            name: name.to_string(),
            replicas: instances.len() as u32,
            reservation: None,
            ports: Vec::new(),
            template: LaunchTemplate {
                image: "nginx".to_string(),
                ..LaunchTemplate::default()
            },
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Nodes ──────────────────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("node-1", 1);

        store.put_node(&node).unwrap();
        assert_eq!(store.get_node("node-1").unwrap(), Some(node));
        assert!(store.get_node("node-2").unwrap().is_none());
    }

    #[test]
    fn node_list_is_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-b", 1)).unwrap();
        store.put_node(&test_node("node-a", 1)).unwrap();

        let ids: Vec<String> = store.list_nodes().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["node-a", "node-b"]);
    }

    #[test]
    fn node_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1", 1)).unwrap();

        assert!(store.delete_node("node-1").unwrap());
        assert!(!store.delete_node("node-1").unwrap());
        assert!(store.list_nodes().unwrap().is_empty());
    }

    // ── Services and instances ─────────────────────────────────────

    #[test]
    fn service_put_get_and_filter_by_stack() {
        let store = StateStore::open_in_memory().unwrap();
        let web = test_service("shop", "web", &["c1", "c2"]);
        store.put_service(&web).unwrap();
        store.put_service(&test_service("shop", "db", &["c3"])).unwrap();
        store.put_service(&test_service("blog", "web", &[])).unwrap();

        assert_eq!(store.get_service("shop/web").unwrap(), Some(web));
        assert_eq!(store.list_services().unwrap().len(), 3);
        assert_eq!(store.list_services_in_stack("shop").unwrap().len(), 2);
    }

    #[test]
    fn instances_are_derived_from_services() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_service(&test_service("shop", "web", &["c1", "c2"])).unwrap();
        store.put_service(&test_service("shop", "db", &["c3"])).unwrap();

        let mut ids: Vec<String> = store
            .list_instances()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let owner = store.find_instance("c2").unwrap().unwrap();
        assert_eq!(owner.id, "shop/web");
        assert!(store.find_instance("ghost").unwrap().is_none());
    }

    #[test]
    fn service_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_service(&test_service("shop", "web", &["c1"])).unwrap();

        assert!(store.delete_service("shop/web").unwrap());
        assert!(store.list_instances().unwrap().is_empty());
    }

    // ── Config ─────────────────────────────────────────────────────

    #[test]
    fn cluster_config_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_cluster_config().unwrap().is_none());

        let config = ClusterConfig {
            dns_servers: vec!["10.0.0.2".to_string()],
            ..ClusterConfig::default()
        };
        store.put_cluster_config(&config).unwrap();
        assert_eq!(store.get_cluster_config().unwrap(), Some(config));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_node(&test_node("node-1", 7)).unwrap();
            store.put_service(&test_service("shop", "web", &["c1"])).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_node("node-1").unwrap().unwrap().revision, 7);
        assert_eq!(store.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_services().unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(!store.delete_node("nope").unwrap());
        assert!(!store.delete_service("nope").unwrap());
    }

    #[test]
    fn corrupt_row_names_its_key() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let txn = store.db.begin_write().unwrap();
            txn.open_table(SERVICES)
                .unwrap()
                .insert("shop/web", b"not json".as_slice())
                .unwrap();
            txn.commit().unwrap();
        }

        let err = store.get_service("shop/web").unwrap_err();
        assert!(matches!(err, StateError::Corrupt { ref key, .. } if key == "shop/web"));
        assert!(store.list_services().is_err());
    }

    #[test]
    fn older_node_revision_never_overwrites_newer() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.put_node_if_newer(&test_node("node-1", 5)).unwrap());
        assert!(!store.put_node_if_newer(&test_node("node-1", 4)).unwrap());
        assert!(!store.put_node_if_newer(&test_node("node-1", 5)).unwrap());
        assert_eq!(store.get_node("node-1").unwrap().unwrap().revision, 5);

        assert!(store.put_node_if_newer(&test_node("node-1", 6)).unwrap());
        assert_eq!(store.get_node("node-1").unwrap().unwrap().revision, 6);
    }
}
