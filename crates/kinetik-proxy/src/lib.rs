//! kinetik-proxy — making replicas reachable.
//!
//! Provides the discovery, routing and host-forwarding collaborators the
//! orchestrator registers replicas with:
//!
//! - [`HttpDiscovery`]: weighted A records on a DNS registrar API
//! - [`HttpRouting`]: published-port routes on the reverse proxy
//! - [`IptablesForwarder`]: host DNAT rules towards the proxy
//! - [`InMemoryDiscovery`] / [`InMemoryRouting`]: standalone mode and tests

pub mod dns;
pub mod forwarding;
pub mod router;

pub use dns::{HttpDiscovery, InMemoryDiscovery};
pub use forwarding::{ForwardRule, IptablesForwarder};
pub use router::{HttpRouting, InMemoryRouting, Route};

use std::time::Duration;

/// Client shared by the HTTP registrars.
fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
