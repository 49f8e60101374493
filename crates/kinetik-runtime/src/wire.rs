//! Docker Engine API request and response bodies.

use std::collections::{BTreeMap, HashMap};

use kinetik_core::LaunchTemplate;
use serde::{Deserialize, Serialize};

/// Body of `POST /containers/create`.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainer {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub host_config: HostConfig,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_search: Vec<String>,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    pub name: String,
}

impl CreateContainer {
    /// Build the create body. `network` applies when the template names none.
    pub fn from_template(template: &LaunchTemplate, network: &str) -> Self {
        Self {
            image: template.image.clone(),
            cmd: template.command.clone(),
            entrypoint: template.entrypoint.clone(),
            env: template.env.clone(),
            hostname: template.hostname.clone(),
            labels: template.labels.clone(),
            user: template.user.clone(),
            working_dir: template.working_dir.clone(),
            host_config: HostConfig {
                dns: template.dns.clone(),
                dns_search: template.dns_search.clone(),
                privileged: template.privileged,
                restart_policy: template
                    .restart
                    .clone()
                    .map(|name| RestartPolicy { name }),
                cap_add: template.cap_add.clone(),
                cap_drop: template.cap_drop.clone(),
                network_mode: Some(template.network.clone().unwrap_or_else(|| network.to_string())),
            },
        }
    }
}

/// Response of `POST /containers/create`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResponse {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// The parts of `GET /containers/{id}/json` we read.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

impl ContainerInspect {
    /// Address on `network`, if the container is attached and has one.
    pub fn address_on(&self, network: &str) -> Option<String> {
        self.network_settings
            .networks
            .get(network)
            .map(|e| e.ip_address.clone())
            .filter(|ip| !ip.is_empty())
    }
}

/// Split an image reference into the `fromImage` and `tag` pull parameters.
///
/// Digest references are pulled as-is with no tag.
pub fn image_reference(image: &str) -> (String, Option<String>) {
    if image.contains('@') {
        return (image.to_string(), None);
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), Some(image[split + 1..].to_string()))
        }
        None => (image.to_string(), Some("latest".to_string())),
    }
}
