//! Host forwarding of published ports to the reverse proxy.
//!
//! Three rules per published port, all TCP:
//!
//! ```text
//! -t nat -A POSTROUTING -s P/32 -d P/32 --dport N -j MASQUERADE
//! -t nat -A DOCKER --dport N -j DNAT --to-destination P:N
//!        -A DOCKER ! -i docker_gwbridge -o docker_gwbridge -d P/32 --dport N -j ACCEPT
//! ```
//!
//! The proxy listens on the published port itself, so the DNAT target
//! keeps `N`; the internal port is the proxy's concern.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use kinetik_scheduler::ForwardingRules;
use tokio::process::Command;
use tracing::{debug, info};

const BRIDGE: &str = "docker_gwbridge";

/// One `iptables` append rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub table: Option<&'static str>,
    pub chain: &'static str,
    /// Traffic leaving through, but not entering from, this interface.
    pub out_interface: Option<&'static str>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub dport: u16,
    pub jump: &'static str,
    pub to_destination: Option<String>,
}

impl ForwardRule {
    /// Arguments to pass to `iptables`.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(table) = self.table {
            args.extend(["-t".to_string(), table.to_string()]);
        }
        args.extend(["-A", self.chain, "-m", "tcp", "-p", "tcp"].map(String::from));
        if let Some(iface) = self.out_interface {
            args.extend(["!", "-i", iface, "-o", iface].map(String::from));
        }
        if let Some(source) = &self.source {
            args.extend(["-s".to_string(), source.clone()]);
        }
        if let Some(destination) = &self.destination {
            args.extend(["-d".to_string(), destination.clone()]);
        }
        args.extend(["--dport".to_string(), self.dport.to_string()]);
        args.extend(["-j".to_string(), self.jump.to_string()]);
        if let Some(to) = &self.to_destination {
            args.extend(["--to-destination".to_string(), to.clone()]);
        }
        args
    }
}

/// Rules forwarding `published_port` on this host to the proxy.
pub fn forward_rules(proxy_address: &str, published_port: u16) -> Vec<ForwardRule> {
    let host = format!("{proxy_address}/32");
    vec![
        ForwardRule {
            table: Some("nat"),
            chain: "POSTROUTING",
            out_interface: None,
            source: Some(host.clone()),
            destination: Some(host.clone()),
            dport: published_port,
            jump: "MASQUERADE",
            to_destination: None,
        },
        ForwardRule {
            table: Some("nat"),
            chain: "DOCKER",
            out_interface: None,
            source: None,
            destination: None,
            dport: published_port,
            jump: "DNAT",
            to_destination: Some(format!("{proxy_address}:{published_port}")),
        },
        ForwardRule {
            table: None,
            chain: "DOCKER",
            out_interface: Some(BRIDGE),
            source: None,
            destination: Some(host),
            dport: published_port,
            jump: "ACCEPT",
            to_destination: None,
        },
    ]
}

/// Installs forwarding rules by running `iptables` on this host.
#[derive(Debug, Clone)]
pub struct IptablesForwarder {
    binary: String,
}

impl Default for IptablesForwarder {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl IptablesForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another executable, e.g. `iptables-legacy`.
    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    async fn run(&self, rule: &ForwardRule) -> Result<()> {
        let args = rule.args();
        debug!(binary = %self.binary, args = %args.join(" "), "applying rule");
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ForwardingRules for IptablesForwarder {
    async fn install(&self, proxy_address: &str, public_port: u16, internal_port: u16) -> Result<()> {
        for rule in forward_rules(proxy_address, public_port) {
            self.run(&rule).await?;
        }
        info!(proxy = %proxy_address, public_port, internal_port, "forwarding installed");
        Ok(())
    }
}
