//! Service discovery registrars.
//!
//! Records are named `{service}.{stack}.{domain}` and hold one weighted
//! address per replica.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use kinetik_scheduler::DiscoveryRegistrar;
use tokio::sync::RwLock;
use tracing::debug;

/// Registrar backed by the DNS server's HTTP API.
///
/// `POST {base}/api/domains/{record}` with body `"{ip} {weight}"` adds an
/// address; `DELETE` on the same path with body `"{ip}"` removes it.
pub struct HttpDiscovery {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDiscovery {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: crate::http_client(Duration::from_secs(10))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, record: &str) -> String {
        format!("{}/api/domains/{record}", self.base_url)
    }
}

#[async_trait]
impl DiscoveryRegistrar for HttpDiscovery {
    async fn register(&self, record: &str, targets: &[(String, u32)]) -> Result<()> {
        for (address, weight) in targets {
            let response = self
                .client
                .post(self.url(record))
                .header("content-type", "text/plain")
                .body(format!("{address} {weight}"))
                .send()
                .await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                bail!("register {address} under {record}: {status} - {body}");
            }
            debug!(%record, %address, weight, "address registered");
        }
        Ok(())
    }

    async fn deregister(&self, record: &str, address: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(record))
            .header("content-type", "text/plain")
            .body(address.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            bail!("deregister {address} from {record}: {status}");
        }
        debug!(%record, %address, "address deregistered");
        Ok(())
    }
}

/// Registrar that keeps records in memory.
#[derive(Default)]
pub struct InMemoryDiscovery {
    records: RwLock<HashMap<String, Vec<(String, u32)>>>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weighted addresses currently held by a record.
    pub async fn resolve(&self, record: &str) -> Vec<(String, u32)> {
        self.records
            .read()
            .await
            .get(record)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn list_records(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DiscoveryRegistrar for InMemoryDiscovery {
    async fn register(&self, record: &str, targets: &[(String, u32)]) -> Result<()> {
        let mut records = self.records.write().await;
        let entry = records.entry(record.to_string()).or_default();
        for (address, weight) in targets {
            match entry.iter_mut().find(|(a, _)| a == address) {
                Some(existing) => existing.1 = *weight,
                None => entry.push((address.clone(), *weight)),
            }
        }
        debug!(%record, count = entry.len(), "updated record");
        Ok(())
    }

    async fn deregister(&self, record: &str, address: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(entry) = records.get_mut(record) {
            entry.retain(|(a, _)| a != address);
            if entry.is_empty() {
                records.remove(record);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use std::sync::{Arc, Mutex};

    fn targets(list: &[(&str, u32)]) -> Vec<(String, u32)> {
        list.iter().map(|(a, w)| (a.to_string(), *w)).collect()
    }

    #[tokio::test]
    async fn memory_register_and_resolve() {
        let dns = InMemoryDiscovery::new();
        dns.register("web.shop.kinetik", &targets(&[("10.0.0.1", 10), ("10.0.0.2", 10)]))
            .await
            .unwrap();

        assert_eq!(dns.resolve("web.shop.kinetik").await.len(), 2);
        assert!(dns.resolve("api.shop.kinetik").await.is_empty());
    }

    #[tokio::test]
    async fn memory_reregistration_updates_weight() {
        let dns = InMemoryDiscovery::new();
        dns.register("web.shop.kinetik", &targets(&[("10.0.0.1", 10)])).await.unwrap();
        dns.register("web.shop.kinetik", &targets(&[("10.0.0.1", 5)])).await.unwrap();

        assert_eq!(dns.resolve("web.shop.kinetik").await, targets(&[("10.0.0.1", 5)]));
    }

    #[tokio::test]
    async fn memory_deregistering_last_address_drops_record() {
        let dns = InMemoryDiscovery::new();
        dns.register("web.shop.kinetik", &targets(&[("10.0.0.1", 10), ("10.0.0.2", 10)]))
            .await
            .unwrap();
        dns.deregister("web.shop.kinetik", "10.0.0.1").await.unwrap();
        assert_eq!(dns.resolve("web.shop.kinetik").await, targets(&[("10.0.0.2", 10)]));

        dns.deregister("web.shop.kinetik", "10.0.0.2").await.unwrap();
        assert!(dns.list_records().await.is_empty());
    }

    type Calls = Arc<Mutex<Vec<String>>>;

    async fn record(State(calls): State<Calls>, Path(name): Path<String>, body: String) {
        calls.lock().unwrap().push(format!("add {name} {body}"));
    }

    async fn unrecord(State(calls): State<Calls>, Path(name): Path<String>, body: String) {
        calls.lock().unwrap().push(format!("del {name} {body}"));
    }

    #[tokio::test]
    async fn http_registrar_speaks_plain_text() {
        let calls = Calls::default();
        let app = Router::new()
            .route("/api/domains/{name}", post(record).delete(unrecord))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let dns = HttpDiscovery::new(&format!("http://{addr}/")).unwrap();
        dns.register("web.shop.kinetik", &targets(&[("10.0.0.1", 10), ("10.0.0.2", 10)]))
            .await
            .unwrap();
        dns.deregister("web.shop.kinetik", "10.0.0.1").await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "add web.shop.kinetik 10.0.0.1 10",
                "add web.shop.kinetik 10.0.0.2 10",
                "del web.shop.kinetik 10.0.0.1"
            ]
        );
    }

    #[tokio::test]
    async fn http_registrar_reports_unreachable_server() {
        let dns = HttpDiscovery::new("http://127.0.0.1:1").unwrap();
        assert!(dns.register("x.y.kinetik", &targets(&[("10.0.0.1", 10)])).await.is_err());
    }
}
