//! kinetik-runtime — remote container runtime access.
//!
//! Talks to the Docker Engine HTTP API exposed by every node at
//! `{scheme}://{node}:{port}/{api_version}`. [`DockerRuntime`] is the
//! orchestrator's [`ContainerRuntime`](kinetik_scheduler::ContainerRuntime)
//! and the best-fit policy's [`LoadProbe`](kinetik_placement::LoadProbe).
//!
//! # Launch sequence
//!
//! ```text
//! POST /images/create?fromImage=..&tag=..   pull
//! POST /containers/create                   create from LaunchTemplate
//! POST /containers/{id}/start               start (removed again on failure)
//! GET  /containers/{id}/json                overlay address lookup
//! ```

pub mod docker;
pub mod wire;

pub use docker::DockerRuntime;
