//! Kinetik placement core — ledger, resolver, policies.
//!
//! This crate decides *where* replicas go. It never talks to a container
//! runtime; the orchestrator in `kinetik-scheduler` executes its decisions.
//!
//! # Components
//!
//! - **`capacity`** — Free-capacity arithmetic for one node
//! - **`ledger`** — Per-node reservations under per-node mutual exclusion
//! - **`resolver`** — Dependency ordering with deterministic ties
//! - **`policy`** — Node selection (uniform random, best fit by load)
//! - **`eviction`** — Scale-down victim selection

pub mod capacity;
pub mod error;
pub mod eviction;
pub mod ledger;
pub mod policy;
pub mod resolver;

pub use capacity::{Fit, check_fit};
pub use error::{LedgerError, PlacementError, ResolveError};
pub use eviction::{EvictionPolicy, RandomEviction};
pub use ledger::ResourceLedger;
pub use policy::{BestFitByLoad, LoadProbe, SchedulingPolicy, Selection, UniformRandom};
pub use resolver::DependencyGraph;
