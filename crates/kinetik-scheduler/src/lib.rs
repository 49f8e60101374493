//! kinetik-scheduler — the placement orchestrator.
//!
//! Turns stack definitions into running replicas and keeps them in step
//! with the desired replica counts. The orchestrator:
//!
//! - Resolves service dependencies and places services in order
//! - Reserves node capacity through the scheduling policy
//! - Launches containers and registers them with discovery and routing
//! - Rolls back on failure or a missed deadline when asked to
//! - Scales services up and down one replica at a time
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── ResourceLedger   (per-node reservations)
//!   ├── SchedulingPolicy (node selection)
//!   ├── EvictionPolicy   (scale-down victim)
//!   ├── StateStore       (persisted services)
//!   └── Collaborators
//!       ├── ContainerRuntime
//!       ├── DiscoveryRegistrar
//!       ├── RouteRegistrar
//!       └── ForwardingRules (optional)
//! ```

pub mod backoff;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod report;

pub use backoff::Backoff;
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{DeploymentRequest, Orchestrator, OrchestratorConfig};
pub use ports::{ContainerRuntime, DiscoveryRegistrar, ForwardingRules, RouteRegistrar};
pub use report::{
    DeployPhase, DeploymentReport, RegistrationIssue, RegistrationTarget, ReplicaFailure,
};
