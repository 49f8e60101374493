//! Reverse-proxy route registrars.
//!
//! A route sends traffic arriving on a published port to the service's
//! internal port. Routes are keyed by `(stack, service)`; a service may
//! publish several ports.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use kinetik_scheduler::RouteRegistrar;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// One published-port route, as sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub service_name: String,
    pub stack_name: String,
    pub public_port: u16,
    pub internal_port: u16,
}

/// Registrar backed by the reverse proxy's HTTP API.
///
/// `POST {base}/services/` with a JSON [`Route`] adds a route and
/// `DELETE {base}/services/{stack}/{service}` drops all of a service's.
pub struct HttpRouting {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRouting {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: crate::http_client(Duration::from_secs(10))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RouteRegistrar for HttpRouting {
    async fn register_route(
        &self,
        service: &str,
        stack: &str,
        internal_port: u16,
        public_port: u16,
    ) -> Result<()> {
        let route = Route {
            service_name: service.to_string(),
            stack_name: stack.to_string(),
            public_port,
            internal_port,
        };
        let url = format!("{}/services/", self.base_url);
        let response = self.client.post(&url).json(&route).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("register route {stack}/{service}:{public_port}: {status} - {body}");
        }
        debug!(%stack, %service, public_port, internal_port, "route registered");
        Ok(())
    }

    async fn deregister_route(&self, service: &str, stack: &str) -> Result<()> {
        let url = format!("{}/services/{stack}/{service}", self.base_url);
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() {
            bail!("deregister route {stack}/{service}: {}", response.status());
        }
        debug!(%stack, %service, "route deregistered");
        Ok(())
    }
}

/// Registrar that keeps routes in memory.
#[derive(Default)]
pub struct InMemoryRouting {
    routes: RwLock<BTreeMap<(String, String), Vec<Route>>>,
}

impl InMemoryRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes of one service, in registration order.
    pub async fn routes(&self, stack: &str, service: &str) -> Vec<Route> {
        self.routes
            .read()
            .await
            .get(&(stack.to_string(), service.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Route owning a published port, if any.
    pub async fn by_public_port(&self, public_port: u16) -> Option<Route> {
        self.routes
            .read()
            .await
            .values()
            .flatten()
            .find(|r| r.public_port == public_port)
            .cloned()
    }
}

#[async_trait]
impl RouteRegistrar for InMemoryRouting {
    async fn register_route(
        &self,
        service: &str,
        stack: &str,
        internal_port: u16,
        public_port: u16,
    ) -> Result<()> {
        let mut routes = self.routes.write().await;
        if let Some(owner) = routes
            .values()
            .flatten()
            .find(|r| r.public_port == public_port)
            && (owner.stack_name != stack || owner.service_name != service)
        {
            bail!(
                "port {public_port} already routed to {}/{}",
                owner.stack_name,
                owner.service_name
            );
        }

        let entry = routes
            .entry((stack.to_string(), service.to_string()))
            .or_default();
        entry.retain(|r| r.public_port != public_port);
        entry.push(Route {
            service_name: service.to_string(),
            stack_name: stack.to_string(),
            public_port,
            internal_port,
        });
        debug!(%stack, %service, public_port, internal_port, "route registered");
        Ok(())
    }

    async fn deregister_route(&self, service: &str, stack: &str) -> Result<()> {
        self.routes
            .write()
            .await
            .remove(&(stack.to_string(), service.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn memory_routes_by_service_and_port() {
        let routing = InMemoryRouting::new();
        routing.register_route("web", "shop", 8080, 80).await.unwrap();
        routing.register_route("web", "shop", 8443, 443).await.unwrap();

        assert_eq!(routing.routes("shop", "web").await.len(), 2);
        assert_eq!(routing.by_public_port(443).await.unwrap().internal_port, 8443);

        routing.deregister_route("web", "shop").await.unwrap();
        assert!(routing.routes("shop", "web").await.is_empty());
        assert!(routing.by_public_port(80).await.is_none());
    }

    #[tokio::test]
    async fn memory_rejects_port_owned_by_another_service() {
        let routing = InMemoryRouting::new();
        routing.register_route("web", "shop", 8080, 80).await.unwrap();
        // Re-registering the same route is fine.
        routing.register_route("web", "shop", 8080, 80).await.unwrap();

        let err = routing.register_route("admin", "shop", 9000, 80).await.unwrap_err();
        assert!(err.to_string().contains("already routed to shop/web"));
        assert_eq!(routing.routes("shop", "web").await.len(), 1);
    }

    type Calls = Arc<Mutex<Vec<String>>>;

    async fn add(State(calls): State<Calls>, Json(route): Json<Route>) {
        calls.lock().unwrap().push(format!(
            "add {}/{} {}->{}",
            route.stack_name, route.service_name, route.public_port, route.internal_port
        ));
    }

    async fn drop_route(State(calls): State<Calls>, Path((stack, service)): Path<(String, String)>) {
        calls.lock().unwrap().push(format!("drop {stack}/{service}"));
    }

    #[tokio::test]
    async fn http_registrar_posts_json_routes() {
        let calls = Calls::default();
        let app = Router::new()
            .route("/services/", post(add))
            .route("/services/{stack}/{service}", delete(drop_route))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let routing = HttpRouting::new(&format!("http://{addr}")).unwrap();
        routing.register_route("web", "shop", 8080, 80).await.unwrap();
        routing.deregister_route("web", "shop").await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["add shop/web 80->8080", "drop shop/web"]
        );
    }

    #[test]
    fn route_wire_format() {
        let route = Route {
            service_name: "web".into(),
            stack_name: "shop".into(),
            public_port: 80,
            internal_port: 8080,
        };
        assert_eq!(
            serde_json::to_value(&route).unwrap(),
            serde_json::json!({
                "service_name": "web",
                "stack_name": "shop",
                "public_port": 80,
                "internal_port": 8080
            })
        );
    }
}
