//! Docker Engine HTTP adapter.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use kinetik_core::LaunchTemplate;
use kinetik_core::config::RuntimeConfig;
use kinetik_placement::LoadProbe;
use kinetik_scheduler::ContainerRuntime;
use reqwest::{Response, StatusCode};
use serde::de::IgnoredAny;
use tracing::{debug, warn};

use crate::wire::{ContainerInspect, CreateContainer, CreateResponse, image_reference};

/// Container runtime reached over the Docker Engine API of each node.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: reqwest::Client,
    scheme: String,
    port: u16,
    api_version: String,
    network: String,
}

impl DockerRuntime {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            scheme: config.scheme.clone(),
            port: config.port,
            api_version: config.api_version.clone(),
            network: config.network.clone(),
        })
    }

    /// API root for a node.
    pub fn base_url(&self, node_id: &str) -> String {
        format!(
            "{}://{}:{}/{}",
            self.scheme, node_id, self.port, self.api_version
        )
    }

    async fn pull(&self, node_id: &str, image: &str) -> Result<()> {
        let (from_image, tag) = image_reference(image);
        let mut query = vec![("fromImage", from_image)];
        if let Some(tag) = tag {
            query.push(("tag", tag));
        }
        let url = format!("{}/images/create", self.base_url(node_id));
        debug!(node = %node_id, %image, "pulling image");

        let response = self.client.post(&url).query(&query).send().await?;
        // The pull progress stream must be drained for the pull to finish.
        let response = ensure_success(response, "pull image").await?;
        response.bytes().await?;
        Ok(())
    }

    async fn create(&self, node_id: &str, template: &LaunchTemplate) -> Result<String> {
        let url = format!("{}/containers/create", self.base_url(node_id));
        let body = CreateContainer::from_template(template, &self.network);

        let response = self.client.post(&url).json(&body).send().await?;
        let created: CreateResponse = ensure_success(response, "create container")
            .await?
            .json()
            .await?;
        for warning in created.warnings.iter().flatten() {
            warn!(node = %node_id, container = %created.id, %warning, "engine warning");
        }
        Ok(created.id)
    }

    async fn start(&self, node_id: &str, container_id: &str) -> Result<()> {
        let url = format!("{}/containers/{container_id}/start", self.base_url(node_id));
        let response = self.client.post(&url).send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        ensure_success(response, "start container").await?;
        Ok(())
    }

    pub async fn inspect(&self, node_id: &str, container_id: &str) -> Result<ContainerInspect> {
        let url = format!("{}/containers/{container_id}/json", self.base_url(node_id));
        let response = self.client.get(&url).send().await?;
        Ok(ensure_success(response, "inspect container")
            .await?
            .json()
            .await?)
    }
}

/// Pass a 2xx response through, otherwise fail with status and body.
async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    bail!("{what} failed: {status} - {}", body.trim())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, node_id: &str, template: &LaunchTemplate) -> Result<String> {
        self.pull(node_id, &template.image).await?;
        let id = self.create(node_id, template).await?;

        if let Err(e) = self.start(node_id, &id).await {
            // A created but unstarted container would otherwise leak.
            if let Err(cleanup) = self.remove(node_id, &id, true).await {
                warn!(node = %node_id, container = %id, error = %cleanup, "cleanup after failed start failed");
            }
            return Err(e);
        }
        debug!(node = %node_id, container = %id, image = %template.image, "container running");
        Ok(id)
    }

    async fn network_address(
        &self,
        node_id: &str,
        container_id: &str,
        network: &str,
    ) -> Result<Option<String>> {
        Ok(self.inspect(node_id, container_id).await?.address_on(network))
    }

    async fn stop(&self, node_id: &str, container_id: &str, grace: Duration) -> Result<()> {
        let url = format!("{}/containers/{container_id}/stop", self.base_url(node_id));
        let response = self
            .client
            .post(&url)
            .query(&[("t", grace.as_secs())])
            .send()
            .await?;
        // Already stopped or already gone.
        if matches!(response.status(), StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND) {
            return Ok(());
        }
        ensure_success(response, "stop container").await?;
        Ok(())
    }

    async fn remove(&self, node_id: &str, container_id: &str, force: bool) -> Result<()> {
        let url = format!("{}/containers/{container_id}", self.base_url(node_id));
        let response = self
            .client
            .delete(&url)
            .query(&[("force", force)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(node = %node_id, container = %container_id, "container already removed");
            return Ok(());
        }
        ensure_success(response, "remove container").await?;
        Ok(())
    }

    async fn ping(&self, node_id: &str) -> Result<()> {
        let url = format!("{}/_ping", self.base_url(node_id));
        let response = self.client.get(&url).send().await?;
        ensure_success(response, "ping").await?;
        Ok(())
    }
}

#[async_trait]
impl LoadProbe for DockerRuntime {
    async fn container_count(&self, node_id: &str) -> Result<u32> {
        let url = format!("{}/containers/json", self.base_url(node_id));
        let response = self.client.get(&url).send().await?;
        let containers: Vec<IgnoredAny> = ensure_success(response, "list containers")
            .await?
            .json()
            .await?;
        Ok(containers.len() as u32)
    }
}
