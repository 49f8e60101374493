//! redb table definitions for the Kinetik state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Node records keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Service records, instances inlined, keyed by `{stack}/{service}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Cluster-wide settings keyed by name.
pub const CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("config");

/// Key of the cluster configuration row in [`CONFIG`].
pub const CLUSTER_CONFIG_KEY: &str = "cluster";
