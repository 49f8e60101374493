//! Stack definition parsing.
//!
//! A stack is described by a compose-style YAML document with a `services`
//! map. Parsing turns it into a validated [`StackDefinition`]: one
//! [`ServiceDefinition`] per service, each with its launch template, replica
//! count, reservation, ports, and dependency names.
//!
//! Every rejection is a [`StackError`] and happens before anything touches
//! the cluster.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use thiserror::Error;

use crate::types::{ClusterConfig, LaunchTemplate, PortMapping, ResourceRequest};

/// Label carrying the owning stack name on every container.
pub const STACK_LABEL: &str = "kinetik.stack";

/// Label carrying the owning service name on every container.
pub const SERVICE_LABEL: &str = "kinetik.service";

/// Errors produced while parsing or validating a stack definition.
#[derive(Debug, Error, PartialEq)]
pub enum StackError {
    #[error("cannot decode stack definition: {0}")]
    Decode(String),

    #[error("invalid stack name {0:?}: use letters, digits, '-' or '_'")]
    InvalidStackName(String),

    #[error("stack defines no services")]
    Empty,

    #[error("service {0:?}: image is required")]
    MissingImage(String),

    #[error("service {service:?} depends on unknown service {dependency:?}")]
    UnknownDependency { service: String, dependency: String },

    #[error("service {service:?}: invalid {field}: {reason}")]
    InvalidField {
        service: String,
        field: &'static str,
        reason: String,
    },
}

/// A validated multi-service definition.
#[derive(Debug, Clone, PartialEq)]
pub struct StackDefinition {
    pub stack: String,
    /// Services sorted by name.
    pub services: Vec<ServiceDefinition>,
}

/// One validated service of a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub name: String,
    pub depends_on: BTreeSet<String>,
    pub replicas: u32,
    pub reservation: Option<ResourceRequest>,
    pub ports: Vec<PortMapping>,
    pub template: LaunchTemplate,
}

impl StackDefinition {
    /// Parse and validate a YAML stack definition.
    ///
    /// `cluster` supplies the overlay network, DNS servers and domain baked
    /// into each launch template.
    pub fn parse(stack: &str, yaml: &str, cluster: &ClusterConfig) -> Result<Self, StackError> {
        validate_stack_name(stack)?;

        let file: ComposeFile =
            serde_yaml::from_str(yaml).map_err(|e| StackError::Decode(e.to_string()))?;
        if file.services.is_empty() {
            return Err(StackError::Empty);
        }

        let names: BTreeSet<&str> = file.services.keys().map(String::as_str).collect();
        let mut services = Vec::with_capacity(file.services.len());

        for (name, raw) in &file.services {
            let depends_on = raw.depends_on.clone().map(DependsOn::names).unwrap_or_default();
            for dep in &depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(StackError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            services.push(ServiceDefinition {
                name: name.clone(),
                depends_on,
                replicas: raw.deploy.as_ref().and_then(|d| d.replicas).unwrap_or(1),
                reservation: reservation(name, raw)?,
                ports: ports(name, &raw.ports)?,
                template: template(stack, name, raw, cluster)?,
            });
        }

        Ok(Self {
            stack: stack.to_string(),
            services,
        })
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }
}

fn validate_stack_name(stack: &str) -> Result<(), StackError> {
    let valid = !stack.is_empty()
        && stack
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StackError::InvalidStackName(stack.to_string()))
    }
}

// ── Raw compose document ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ComposeService {
    image: Option<String>,
    command: Option<StringOrList>,
    entrypoint: Option<StringOrList>,
    environment: Option<Environment>,
    hostname: Option<String>,
    user: Option<String>,
    working_dir: Option<String>,
    privileged: bool,
    restart: Option<String>,
    cap_add: Vec<String>,
    cap_drop: Vec<String>,
    depends_on: Option<DependsOn>,
    ports: Vec<PortSpec>,
    deploy: Option<Deploy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => s.split_whitespace().map(str::to_string).collect(),
            StringOrList::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Environment {
    List(Vec<String>),
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl DependsOn {
    fn names(self) -> BTreeSet<String> {
        match self {
            DependsOn::List(v) => v.into_iter().collect(),
            DependsOn::Map(m) => m.into_keys().collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Number(u32),
    Short(String),
    Long { target: u32, published: Option<u32> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Deploy {
    replicas: Option<u32>,
    resources: Option<Resources>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Resources {
    reservations: Option<Reservations>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Reservations {
    cpus: Option<Scalar>,
    memory: Option<Scalar>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Float(f64),
    Text(String),
}

// ── Conversion ────────────────────────────────────────────────────

fn invalid(service: &str, field: &'static str, reason: impl Into<String>) -> StackError {
    StackError::InvalidField {
        service: service.to_string(),
        field,
        reason: reason.into(),
    }
}

fn template(
    stack: &str,
    name: &str,
    raw: &ComposeService,
    cluster: &ClusterConfig,
) -> Result<LaunchTemplate, StackError> {
    let image = raw
        .image
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .ok_or_else(|| StackError::MissingImage(name.to_string()))?;

    let mut labels = BTreeMap::new();
    labels.insert(STACK_LABEL.to_string(), stack.to_string());
    labels.insert(SERVICE_LABEL.to_string(), name.to_string());

    Ok(LaunchTemplate {
        image: image.to_string(),
        command: raw.command.clone().map(StringOrList::into_vec).unwrap_or_default(),
        entrypoint: raw.entrypoint.clone().map(StringOrList::into_vec).unwrap_or_default(),
        env: environment(name, raw.environment.clone())?,
        hostname: raw.hostname.clone(),
        labels,
        dns: cluster.dns_servers.clone(),
        dns_search: vec![format!("{stack}.{}", cluster.domain)],
        network: Some(cluster.network.clone()),
        restart: raw.restart.clone(),
        privileged: raw.privileged,
        user: raw.user.clone(),
        working_dir: raw.working_dir.clone(),
        cap_add: raw.cap_add.clone(),
        cap_drop: raw.cap_drop.clone(),
    })
}

fn environment(service: &str, env: Option<Environment>) -> Result<Vec<String>, StackError> {
    let Some(env) = env else {
        return Ok(Vec::new());
    };
    match env {
        Environment::List(items) => Ok(items),
        Environment::Map(map) => {
            let mut out = Vec::with_capacity(map.len());
            for (key, value) in map {
                // A key without a value is inherited from nowhere and dropped.
                let Some(value) = value else { continue };
                let value = match value {
                    serde_yaml::Value::Null => continue,
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    _ => return Err(invalid(service, "environment", format!("{key} is not a scalar"))),
                };
                out.push(format!("{key}={value}"));
            }
            Ok(out)
        }
    }
}

fn reservation(service: &str, raw: &ComposeService) -> Result<Option<ResourceRequest>, StackError> {
    let Some(res) = raw
        .deploy
        .as_ref()
        .and_then(|d| d.resources.as_ref())
        .and_then(|r| r.reservations.as_ref())
    else {
        return Ok(None);
    };

    let cpu = match &res.cpus {
        None => 0.0,
        Some(Scalar::Int(n)) => *n as f64,
        Some(Scalar::Float(f)) => *f,
        Some(Scalar::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| invalid(service, "cpus", e.to_string()))?,
    };
    if !cpu.is_finite() || cpu < 0.0 {
        return Err(invalid(service, "cpus", format!("{cpu} is not a non-negative number")));
    }

    let memory_bytes = match &res.memory {
        None => 0,
        Some(Scalar::Int(n)) => *n,
        Some(Scalar::Float(f)) if f.is_finite() && *f >= 0.0 => *f as u64,
        Some(Scalar::Float(f)) => return Err(invalid(service, "memory", format!("{f} is negative"))),
        Some(Scalar::Text(s)) => parse_memory(s).map_err(|reason| invalid(service, "memory", reason))?,
    };

    Ok(Some(ResourceRequest::new(cpu, memory_bytes)))
}

/// Parse a memory size such as `512`, `256m`, `1.5GB` into bytes.
///
/// Suffixes are binary multiples: `k` = 1024, `m` = 1024², `g` = 1024³.
pub fn parse_memory(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("{input:?} is not a size"))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => return Err(format!("unknown size unit {other:?}")),
    };
    Ok((value * multiplier as f64) as u64)
}

fn ports(service: &str, specs: &[PortSpec]) -> Result<Vec<PortMapping>, StackError> {
    specs.iter().map(|spec| port(service, spec)).collect()
}

fn port(service: &str, spec: &PortSpec) -> Result<PortMapping, StackError> {
    let (published, target) = match spec {
        PortSpec::Number(n) => (*n, *n),
        PortSpec::Long { target, published } => (published.unwrap_or(*target), *target),
        PortSpec::Short(s) => {
            let without_proto = s.split('/').next().unwrap_or_default();
            if without_proto.contains('-') {
                return Err(invalid(service, "ports", format!("port ranges are not supported: {s}")));
            }
            let parts: Vec<&str> = without_proto.split(':').collect();
            let parse = |p: &str| {
                p.trim()
                    .parse::<u32>()
                    .map_err(|_| invalid(service, "ports", format!("{s:?} is not a port mapping")))
            };
            match parts.as_slice() {
                [target] => {
                    let t = parse(target)?;
                    (t, t)
                }
                // `ip:published:target` keeps the last two segments.
                [.., published, target] => (parse(published)?, parse(target)?),
                [] => return Err(invalid(service, "ports", "empty port mapping")),
            }
        }
    };

    let check = |p: u32| {
        u16::try_from(p)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| invalid(service, "ports", format!("{p} is not a valid port")))
    };
    Ok(PortMapping {
        published: check(published)?,
        target: check(target)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOP: &str = r#"
version: "3"
services:
  web:
    image: nginx:1.25
    depends_on: [api]
    ports:
      - "8080:80"
    deploy:
      replicas: 2
      resources:
        reservations:
          cpus: "0.5"
          memory: 256M
  api:
    image: shop/api:latest
    command: serve --port 9000
    environment:
      DB_HOST: db
      WORKERS: 4
      UNSET:
    depends_on:
      db:
        condition: service_started
  db:
    image: postgres:16
    environment:
      - POSTGRES_PASSWORD=secret
"#;

    fn cluster() -> ClusterConfig {
        ClusterConfig {
            dns_servers: vec!["10.9.0.2".to_string()],
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn parses_full_definition() {
        let def = StackDefinition::parse("shop", SHOP, &cluster()).unwrap();

        let names: Vec<&str> = def.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "db", "web"]);

        let web = def.service("web").unwrap();
        assert_eq!(web.replicas, 2);
        assert_eq!(web.depends_on, BTreeSet::from(["api".to_string()]));
        assert_eq!(
            web.reservation,
            Some(ResourceRequest::new(0.5, 256 * 1024 * 1024))
        );
        assert_eq!(
            web.ports,
            vec![PortMapping {
                published: 8080,
                target: 80
            }]
        );
        assert_eq!(web.template.labels.get(STACK_LABEL).unwrap(), "shop");
        assert_eq!(web.template.labels.get(SERVICE_LABEL).unwrap(), "web");
        assert_eq!(web.template.dns_search, vec!["shop.kinetik"]);
        assert_eq!(web.template.dns, vec!["10.9.0.2"]);
        assert_eq!(web.template.network.as_deref(), Some("kinetik"));
    }

    #[test]
    fn defaults_replicas_to_one_and_no_reservation() {
        let def = StackDefinition::parse("shop", SHOP, &cluster()).unwrap();
        let db = def.service("db").unwrap();
        assert_eq!(db.replicas, 1);
        assert!(db.reservation.is_none());
        assert_eq!(db.template.env, vec!["POSTGRES_PASSWORD=secret"]);
    }

    #[test]
    fn environment_map_skips_null_values() {
        let def = StackDefinition::parse("shop", SHOP, &cluster()).unwrap();
        let api = def.service("api").unwrap();
        assert_eq!(api.template.env, vec!["DB_HOST=db", "WORKERS=4"]);
        assert_eq!(api.template.command, vec!["serve", "--port", "9000"]);
        assert_eq!(api.depends_on, BTreeSet::from(["db".to_string()]));
    }

    #[test]
    fn rejects_bad_stack_name() {
        let err = StackDefinition::parse("my stack", SHOP, &cluster()).unwrap_err();
        assert!(matches!(err, StackError::InvalidStackName(_)));
    }

    #[test]
    fn rejects_empty_services() {
        let err = StackDefinition::parse("s", "services: {}\n", &cluster()).unwrap_err();
        assert_eq!(err, StackError::Empty);
    }

    #[test]
    fn rejects_undecodable_yaml() {
        let err = StackDefinition::parse("s", "services: [1, 2", &cluster()).unwrap_err();
        assert!(matches!(err, StackError::Decode(_)));
    }

    #[test]
    fn rejects_missing_image() {
        let yaml = "services:\n  a:\n    command: run\n";
        let err = StackDefinition::parse("s", yaml, &cluster()).unwrap_err();
        assert_eq!(err, StackError::MissingImage("a".to_string()));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let yaml = "services:\n  a:\n    image: x\n    depends_on: [ghost]\n";
        let err = StackDefinition::parse("s", yaml, &cluster()).unwrap_err();
        assert_eq!(
            err,
            StackError::UnknownDependency {
                service: "a".to_string(),
                dependency: "ghost".to_string()
            }
        );
    }

    #[test]
    fn keeps_self_dependency_for_the_resolver_to_reject() {
        let yaml = "services:\n  a:\n    image: x\n    depends_on: [a]\n";
        let def = StackDefinition::parse("s", yaml, &cluster()).unwrap();
        assert_eq!(def.services[0].depends_on, BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn accepts_mutual_dependency_for_the_resolver_to_reject() {
        let yaml = "services:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: y\n    depends_on: [a]\n";
        let def = StackDefinition::parse("s", yaml, &cluster()).unwrap();
        assert_eq!(def.services.len(), 2);
    }

    #[test]
    fn rejects_negative_cpu() {
        let yaml = "services:\n  a:\n    image: x\n    deploy:\n      resources:\n        reservations:\n          cpus: '-1'\n";
        let err = StackDefinition::parse("s", yaml, &cluster()).unwrap_err();
        assert!(matches!(err, StackError::InvalidField { field: "cpus", .. }));
    }

    #[test]
    fn port_forms() {
        let yaml = r#"
services:
  a:
    image: x
    ports:
      - 80
      - "127.0.0.1:8443:443/tcp"
      - target: 9000
        published: 19000
      - target: 7000
"#;
        let def = StackDefinition::parse("s", yaml, &cluster()).unwrap();
        let ports = &def.service("a").unwrap().ports;
        assert_eq!(
            ports,
            &vec![
                PortMapping { published: 80, target: 80 },
                PortMapping { published: 8443, target: 443 },
                PortMapping { published: 19000, target: 9000 },
                PortMapping { published: 7000, target: 7000 },
            ]
        );
    }

    #[test]
    fn rejects_port_zero_and_ranges() {
        let zero = "services:\n  a:\n    image: x\n    ports: ['0:80']\n";
        assert!(matches!(
            StackDefinition::parse("s", zero, &cluster()).unwrap_err(),
            StackError::InvalidField { field: "ports", .. }
        ));

        let range = "services:\n  a:\n    image: x\n    ports: ['8000-8010:80']\n";
        assert!(matches!(
            StackDefinition::parse("s", range, &cluster()).unwrap_err(),
            StackError::InvalidField { field: "ports", .. }
        ));
    }

    #[test]
    fn memory_units() {
        assert_eq!(parse_memory("512").unwrap(), 512);
        assert_eq!(parse_memory("1k").unwrap(), 1024);
        assert_eq!(parse_memory("256M").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory("1.5gb").unwrap(), 1024 * 1024 * 1024 * 3 / 2);
        assert!(parse_memory("12 parsecs").is_err());
        assert!(parse_memory("lots").is_err());
    }
}
