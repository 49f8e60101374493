//! Placement orchestrator — drives deployments, scaling and teardown.
//!
//! A deployment walks `Parsing → Resolving → Placing → Registering →
//! Completed`, ending in `Failed` on any fatal error. Services are placed
//! one at a time in dependency order; a service starts placing only after
//! every service before it has registered and been persisted.
//!
//! Every side effect of an in-progress deployment is recorded in its
//! `Progress` right after it happens, with no await in between, so a
//! deadline that drops the placement future mid-flight can still undo
//! exactly what was done.
//!
//! Operations on one service are serialized by a per-service lock.
//! Ledger reservations have their own per-node lock inside
//! [`ResourceLedger`]; no ledger lock is held across a collaborator call.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use kinetik_core::{
    ClusterConfig, DaemonConfig, HealthState, InstanceRecord, MetricValue, NodeId, NodeRecord,
    NodeReport, ResourceRequest, ServiceDefinition, ServiceId, ServiceRecord, StackDefinition,
    epoch_secs,
};
use kinetik_placement::{
    DependencyGraph, EvictionPolicy, RandomEviction, ResourceLedger, SchedulingPolicy,
};
use kinetik_state::{StateError, StateStore};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ports::{ContainerRuntime, DiscoveryRegistrar, ForwardingRules, RouteRegistrar};
use crate::report::{
    DeployPhase, DeploymentReport, RegistrationIssue, RegistrationTarget, ReplicaFailure,
};

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cluster: ClusterConfig,
    /// Discovery weight given to every replica.
    pub dns_weight: u32,
    pub stop_grace: Duration,
    /// Deadline applied when a request does not carry one.
    pub deadline: Option<Duration>,
    /// Rollback default when a request does not say.
    pub rollback_on_failure: bool,
    pub attach_backoff: Backoff,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            dns_weight: 10,
            stop_grace: Duration::from_secs(5),
            deadline: None,
            rollback_on_failure: false,
            attach_backoff: Backoff::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_daemon(config: &DaemonConfig, cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            dns_weight: config.discovery.weight,
            stop_grace: Duration::from_secs(config.runtime.stop_grace_secs),
            deadline: config.scheduler.deadline_secs.map(Duration::from_secs),
            rollback_on_failure: config.scheduler.rollback_on_failure,
            attach_backoff: Backoff {
                initial: Duration::from_millis(config.runtime.attach_initial_backoff_ms),
                max: Duration::from_millis(config.runtime.attach_max_backoff_ms),
                attempts: config.runtime.attach_attempts,
            },
        }
    }
}

/// A request to deploy a whole stack.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub stack: String,
    /// YAML stack definition.
    pub definition: String,
    pub rollback_on_failure: Option<bool>,
    pub deadline: Option<Duration>,
}

impl DeploymentRequest {
    pub fn new(stack: &str, definition: &str) -> Self {
        Self {
            stack: stack.to_string(),
            definition: definition.to_string(),
            rollback_on_failure: None,
            deadline: None,
        }
    }

    pub fn with_rollback(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = Some(rollback);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Side effects of the replica currently being placed.
#[derive(Debug, Default)]
struct InFlight {
    node: Option<NodeId>,
    reserved: Option<ResourceRequest>,
    container: Option<String>,
}

struct Launched {
    instance: InstanceRecord,
    issues: Vec<RegistrationIssue>,
}

enum ReplicaError {
    NoEligibleNode,
    Runtime { node: NodeId, reason: String },
}

/// Why a deployment stopped before completing.
enum Abort {
    NoEligibleNode { service: ServiceId },
    Runtime {
        service: ServiceId,
        node: NodeId,
        reason: String,
    },
    State(StateError),
}

impl Abort {
    fn reason(&self) -> String {
        match self {
            Abort::NoEligibleNode { service } => format!("no eligible node for {service}"),
            Abort::Runtime {
                service, reason, ..
            } => format!("no replica of {service} could be started: {reason}"),
            Abort::State(e) => format!("state store error: {e}"),
        }
    }
}

/// Everything one deployment has done so far.
struct Progress {
    report: DeploymentReport,
    in_flight: InFlight,
    /// Services whose routes may have been installed.
    routed: BTreeSet<ServiceId>,
    persisted: BTreeSet<ServiceId>,
    placed: u32,
    total: u32,
}

impl Progress {
    fn new(stack: &str) -> Self {
        Self {
            report: DeploymentReport::new(stack),
            in_flight: InFlight::default(),
            routed: BTreeSet::new(),
            persisted: BTreeSet::new(),
            placed: 0,
            total: 0,
        }
    }

    fn enter(&mut self, phase: DeployPhase) {
        debug!(stack = %self.report.stack, ?phase, "deployment phase");
        self.report.phase = phase;
    }
}

/// The placement orchestrator.
pub struct Orchestrator {
    ledger: Arc<ResourceLedger>,
    policy: Arc<dyn SchedulingPolicy>,
    eviction: Arc<dyn EvictionPolicy>,
    store: StateStore,
    runtime: Arc<dyn ContainerRuntime>,
    discovery: Arc<dyn DiscoveryRegistrar>,
    routes: Arc<dyn RouteRegistrar>,
    forwarding: Option<Arc<dyn ForwardingRules>>,
    config: OrchestratorConfig,
    /// Per-service operation locks: service_id → lock.
    locks: Mutex<HashMap<ServiceId, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<ResourceLedger>,
        policy: Arc<dyn SchedulingPolicy>,
        store: StateStore,
        runtime: Arc<dyn ContainerRuntime>,
        discovery: Arc<dyn DiscoveryRegistrar>,
        routes: Arc<dyn RouteRegistrar>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            policy,
            eviction: Arc::new(RandomEviction),
            store,
            runtime,
            discovery,
            routes,
            forwarding: None,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Install host forwarding rules for published ports.
    pub fn with_forwarding(mut self, forwarding: Arc<dyn ForwardingRules>) -> Self {
        self.forwarding = Some(forwarding);
        self
    }

    pub fn with_eviction(mut self, eviction: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    async fn lock_service(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Lock several services. `BTreeSet` order keeps acquisition deadlock-free.
    async fn lock_services(&self, ids: &BTreeSet<ServiceId>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_service(id).await);
        }
        guards
    }

    fn load_service(&self, id: &str) -> OrchestratorResult<ServiceRecord> {
        self.store
            .get_service(id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {id}")))
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn services(&self) -> OrchestratorResult<Vec<ServiceRecord>> {
        Ok(self.store.list_services()?)
    }

    pub fn service(&self, stack: &str, name: &str) -> OrchestratorResult<ServiceRecord> {
        self.load_service(&ServiceRecord::service_id(stack, name))
    }

    pub fn instances(&self) -> OrchestratorResult<Vec<InstanceRecord>> {
        Ok(self.store.list_instances()?)
    }

    pub async fn nodes(&self) -> Vec<NodeRecord> {
        self.ledger.list().await.into_values().collect()
    }

    pub async fn node(&self, node_id: &str) -> OrchestratorResult<NodeRecord> {
        Ok(self.ledger.get(node_id).await?)
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Deploy a stack.
    ///
    /// On `NoEligibleNode` or a service with no startable replica, the
    /// request fails. Already placed replicas are kept, registered and
    /// persisted unless rollback was requested. A missed deadline always
    /// compensates.
    pub async fn deploy(&self, request: DeploymentRequest) -> OrchestratorResult<DeploymentReport> {
        let stack = request.stack.clone();
        let mut progress = Progress::new(&stack);
        info!(%stack, "deployment requested");

        let definition = StackDefinition::parse(&stack, &request.definition, &self.config.cluster)
            .inspect_err(|e| warn!(%stack, error = %e, "stack definition rejected"))?;

        let ids: BTreeSet<ServiceId> = definition
            .services
            .iter()
            .map(|s| ServiceRecord::service_id(&stack, &s.name))
            .collect();
        let _guards = self.lock_services(&ids).await;
        for id in &ids {
            if self.store.get_service(id)?.is_some() {
                return Err(OrchestratorError::AlreadyExists(id.clone()));
            }
        }

        progress.enter(DeployPhase::Resolving);
        let order = definition
            .services
            .iter()
            .map(|s| (s.name.clone(), s.depends_on.iter().cloned()))
            .collect::<DependencyGraph>()
            .resolve()
            .inspect_err(|e| warn!(%stack, error = %e, "dependency resolution failed"))?;
        debug!(%stack, ?order, "services resolved");
        progress.report.order = order.clone();
        progress.total = definition.services.iter().map(|s| s.replicas).sum();

        let rollback = request
            .rollback_on_failure
            .unwrap_or(self.config.rollback_on_failure);
        let outcome = match request.deadline.or(self.config.deadline) {
            Some(deadline) => {
                let timed =
                    tokio::time::timeout(deadline, self.place_all(&definition, &order, &mut progress))
                        .await;
                match timed {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(%stack, ?deadline, placed = progress.placed, "deployment deadline exceeded");
                        self.compensate(&mut progress).await;
                        progress.report.phase = DeployPhase::Failed {
                            reason: "deadline exceeded".to_string(),
                        };
                        return Err(OrchestratorError::DeadlineExceeded {
                            stack,
                            deadline,
                            report: Box::new(progress.report),
                        });
                    }
                }
            }
            None => self.place_all(&definition, &order, &mut progress).await,
        };

        match outcome {
            Ok(()) => {
                progress.enter(DeployPhase::Completed);
                info!(
                    %stack,
                    services = progress.report.services.len(),
                    replicas = progress.placed,
                    degraded = progress.report.is_degraded(),
                    "deployment completed"
                );
                Ok(progress.report)
            }
            Err(abort) => Err(self.abort(progress, abort, rollback).await),
        }
    }

    async fn place_all(
        &self,
        definition: &StackDefinition,
        order: &[String],
        progress: &mut Progress,
    ) -> Result<(), Abort> {
        for name in order {
            let Some(def) = definition.service(name) else {
                continue;
            };
            let id = ServiceRecord::service_id(&definition.stack, name);
            let idx = progress.report.services.len();
            progress
                .report
                .services
                .push(new_service(&definition.stack, def));

            let mut last_failure = None;
            for _ in 0..def.replicas {
                progress.placed += 1;
                progress.enter(DeployPhase::Placing {
                    current: progress.placed,
                    total: progress.total,
                });

                let service = progress.report.services[idx].clone();
                match self.launch_replica(&service, &mut progress.in_flight).await {
                    Ok(launched) => {
                        progress.in_flight = InFlight::default();
                        progress.report.services[idx].instances.push(launched.instance);
                        progress.report.issues.extend(launched.issues);
                    }
                    Err(ReplicaError::NoEligibleNode) => {
                        return Err(Abort::NoEligibleNode { service: id });
                    }
                    Err(ReplicaError::Runtime { node, reason }) => {
                        progress.report.failures.push(ReplicaFailure {
                            service: id.clone(),
                            node: node.clone(),
                            reason: reason.clone(),
                        });
                        last_failure = Some((node, reason));
                    }
                }
            }

            if def.replicas > 0 && progress.report.services[idx].instances.is_empty() {
                let (node, reason) = last_failure.unwrap_or_default();
                return Err(Abort::Runtime {
                    service: id,
                    node,
                    reason,
                });
            }

            progress.enter(DeployPhase::Registering {
                service: name.clone(),
            });
            if self.routes_apply(&progress.report.services[idx]) {
                progress.routed.insert(id.clone());
            }
            let issues = self.register_service(&progress.report.services[idx]).await;
            progress.report.issues.extend(issues);

            self.store
                .put_service(&progress.report.services[idx])
                .map_err(Abort::State)?;
            progress.persisted.insert(id.clone());
            info!(
                service = %id,
                instances = progress.report.services[idx].instances.len(),
                "service placed"
            );
        }
        Ok(())
    }

    /// Handle a failed deployment and build the error returned to the caller.
    async fn abort(&self, mut progress: Progress, abort: Abort, rollback: bool) -> OrchestratorError {
        let reason = abort.reason();
        let stack = progress.report.stack.clone();

        if rollback {
            self.compensate(&mut progress).await;
        } else if let Some(current) = progress.report.services.last()
            && !progress.persisted.contains(&current.id)
        {
            // Keep what was placed: make it reachable and tracked.
            let current = current.clone();
            if self.routes_apply(&current) {
                progress.routed.insert(current.id.clone());
            }
            let issues = self.register_service(&current).await;
            progress.report.issues.extend(issues);
            match self.store.put_service(&current) {
                Ok(()) => {
                    progress.persisted.insert(current.id.clone());
                }
                Err(e) => error!(service = %current.id, error = %e, "failed to persist partial service"),
            }
        }

        progress.report.phase = DeployPhase::Failed {
            reason: reason.clone(),
        };
        error!(%stack, %reason, rolled_back = progress.report.rolled_back, "deployment failed");

        let report = Some(Box::new(progress.report));
        match abort {
            Abort::NoEligibleNode { service } => OrchestratorError::NoEligibleNode { service, report },
            Abort::Runtime {
                service,
                node,
                reason,
            } => OrchestratorError::Runtime {
                service,
                node,
                reason,
                report,
            },
            Abort::State(e) => OrchestratorError::State(e),
        }
    }

    /// Undo every side effect recorded in `progress`, best effort.
    async fn compensate(&self, progress: &mut Progress) {
        let in_flight = std::mem::take(&mut progress.in_flight);
        if let Some(node) = &in_flight.node {
            if let Some(container) = &in_flight.container {
                self.discard_container(node, container).await;
            }
            if let Some(reserved) = &in_flight.reserved {
                self.release(node, reserved).await;
            }
        }

        for service in progress.report.services.iter().rev() {
            for instance in &service.instances {
                if let Err(e) = self.teardown_instance(service, instance).await {
                    error!(service = %service.id, instance = %instance.id, error = %e, "rollback could not remove instance");
                }
            }
            if progress.routed.contains(&service.id) {
                if let Err(e) = self.remove_routes(service).await {
                    warn!(service = %service.id, error = %e, "rollback could not deregister route");
                }
            }
            if progress.persisted.contains(&service.id) {
                if let Err(e) = self.store.delete_service(&service.id) {
                    error!(service = %service.id, error = %e, "rollback could not delete service record");
                }
            }
        }

        for service in &mut progress.report.services {
            service.instances.clear();
        }
        progress.routed.clear();
        progress.persisted.clear();
        progress.report.rolled_back = true;
        info!(stack = %progress.report.stack, "deployment rolled back");
    }

    // ── Replica lifecycle ──────────────────────────────────────────

    /// Select a node, start one container and describe the new instance.
    ///
    /// Each committed step is written to `in_flight` before the next await.
    async fn launch_replica(
        &self,
        service: &ServiceRecord,
        in_flight: &mut InFlight,
    ) -> Result<Launched, ReplicaError> {
        let selection = match self.policy.select_node(service.reservation.as_ref()).await {
            Ok(selection) => selection,
            Err(e) => {
                warn!(service = %service.id, policy = self.policy.name(), error = %e, "no node for replica");
                return Err(ReplicaError::NoEligibleNode);
            }
        };
        in_flight.node = Some(selection.node_id.clone());
        in_flight.reserved = selection.reserved;
        let node = selection.node_id;

        let container = match self.runtime.launch(&node, &service.template).await {
            Ok(container) => container,
            Err(e) => {
                warn!(service = %service.id, %node, error = %e, "container launch failed");
                if let Some(reserved) = &selection.reserved {
                    self.release(&node, reserved).await;
                }
                *in_flight = InFlight::default();
                return Err(ReplicaError::Runtime {
                    node,
                    reason: format!("{e:#}"),
                });
            }
        };
        in_flight.container = Some(container.clone());
        info!(service = %service.id, %node, %container, "container started");

        let mut issues = Vec::new();
        let network = &self.config.cluster.network;
        let address = match self.runtime.network_address(&node, &container, network).await {
            Ok(Some(address)) => Some(address),
            Ok(None) => {
                issues.push(issue(service, Some(&container), RegistrationTarget::Address, format!("not attached to network {network}")));
                None
            }
            Err(e) => {
                warn!(service = %service.id, %container, error = %e, "address lookup failed");
                issues.push(issue(service, Some(&container), RegistrationTarget::Address, format!("{e:#}")));
                None
            }
        };

        if let Err(e) = self.ledger.attach_instance(&node, &container).await {
            warn!(%node, %container, error = %e, "could not record instance on node");
        }

        let now = epoch_secs();
        Ok(Launched {
            instance: InstanceRecord {
                id: container,
                service_id: service.id.clone(),
                node_id: node,
                address,
                state: HealthState::Unknown,
                reservation: selection.reserved,
                metrics: Vec::new(),
                timeout: None,
                created_at: now,
                updated_at: now,
            },
            issues,
        })
    }

    /// Deregister, stop, remove, release and detach one instance.
    ///
    /// Discovery and stop failures are logged and the teardown goes on.
    /// A failed removal leaves the instance in place, puts its discovery
    /// entry back and is returned.
    async fn teardown_instance(
        &self,
        service: &ServiceRecord,
        instance: &InstanceRecord,
    ) -> OrchestratorResult<Vec<RegistrationIssue>> {
        let mut issues = Vec::new();
        let node = &instance.node_id;
        let record = self.config.cluster.record_name(&service.stack, &service.name);
        let mut deregistered = None;

        if let Some(address) = &instance.address {
            match self.discovery.deregister(&record, address).await {
                Ok(()) => deregistered = Some(address.clone()),
                Err(e) => {
                    warn!(%record, %address, error = %e, "discovery deregistration failed");
                    issues.push(issue(service, Some(&instance.id), RegistrationTarget::Discovery, format!("{e:#}")));
                }
            }
        }

        if let Err(e) = self
            .runtime
            .stop(node, &instance.id, self.config.stop_grace)
            .await
        {
            warn!(%node, container = %instance.id, error = %e, "stop failed, forcing removal");
        }
        if let Err(e) = self.runtime.remove(node, &instance.id, true).await {
            let mut report = None;
            if let Some(address) = deregistered {
                let targets = [(address.clone(), self.config.dns_weight)];
                match self.discovery.register(&record, &targets).await {
                    Ok(()) => debug!(%record, %address, "discovery entry restored"),
                    Err(again) => {
                        warn!(%record, %address, error = %again, "could not restore discovery entry");
                        let mut partial = DeploymentReport::new(&service.stack);
                        partial.issues.push(issue(
                            service,
                            Some(&instance.id),
                            RegistrationTarget::Discovery,
                            format!("{again:#}"),
                        ));
                        report = Some(Box::new(partial));
                    }
                }
            }
            return Err(OrchestratorError::Runtime {
                service: service.id.clone(),
                node: node.clone(),
                reason: format!("{e:#}"),
                report,
            });
        }

        if let Some(reserved) = &instance.reservation {
            self.release(node, reserved).await;
        }
        if let Err(e) = self.ledger.detach_instance(node, &instance.id).await {
            debug!(%node, container = %instance.id, error = %e, "node gone, nothing to detach");
        }
        info!(service = %service.id, %node, container = %instance.id, "instance removed");
        Ok(issues)
    }

    /// Stop and remove a container that never became an instance.
    async fn discard_container(&self, node: &str, container: &str) {
        if let Err(e) = self.runtime.stop(node, container, self.config.stop_grace).await {
            debug!(%node, %container, error = %e, "stop failed");
        }
        if let Err(e) = self.runtime.remove(node, container, true).await {
            error!(%node, %container, error = %e, "could not remove container");
        }
        let _ = self.ledger.detach_instance(node, container).await;
    }

    async fn release(&self, node: &str, reserved: &ResourceRequest) {
        if let Err(e) = self.ledger.release(node, reserved).await {
            warn!(%node, error = %e, "reservation release failed");
        }
    }

    // ── Registration ───────────────────────────────────────────────

    fn routes_apply(&self, service: &ServiceRecord) -> bool {
        !service.instances.is_empty() && !service.ports.is_empty()
    }

    /// Register every addressed instance and, if any run, the routes.
    async fn register_service(&self, service: &ServiceRecord) -> Vec<RegistrationIssue> {
        let mut issues = Vec::new();
        let record = self.config.cluster.record_name(&service.stack, &service.name);
        let targets: Vec<(String, u32)> = service
            .instances
            .iter()
            .filter_map(|i| i.address.clone())
            .map(|a| (a, self.config.dns_weight))
            .collect();

        if !targets.is_empty() {
            match self.discovery.register(&record, &targets).await {
                Ok(()) => debug!(%record, addresses = targets.len(), "discovery registered"),
                Err(e) => {
                    warn!(%record, error = %e, "discovery registration failed");
                    issues.push(issue(service, None, RegistrationTarget::Discovery, format!("{e:#}")));
                }
            }
        }

        if self.routes_apply(service) {
            issues.extend(self.install_routes(service).await);
        }
        issues
    }

    async fn install_routes(&self, service: &ServiceRecord) -> Vec<RegistrationIssue> {
        let mut issues = Vec::new();
        for port in &service.ports {
            match self
                .routes
                .register_route(&service.name, &service.stack, port.target, port.published)
                .await
            {
                Ok(()) => debug!(service = %service.id, published = port.published, target = port.target, "route registered"),
                Err(e) => {
                    warn!(service = %service.id, published = port.published, error = %e, "route registration failed");
                    issues.push(issue(service, None, RegistrationTarget::Route, format!("{e:#}")));
                }
            }

            if let (Some(forwarding), Some(proxy)) =
                (&self.forwarding, &self.config.cluster.proxy_host_address)
            {
                if let Err(e) = forwarding.install(proxy, port.published, port.target).await {
                    warn!(service = %service.id, published = port.published, error = %e, "forwarding rule failed");
                    issues.push(issue(service, None, RegistrationTarget::Forwarding, format!("{e:#}")));
                }
            }
        }
        issues
    }

    async fn remove_routes(&self, service: &ServiceRecord) -> anyhow::Result<()> {
        if service.ports.is_empty() {
            return Ok(());
        }
        self.routes
            .deregister_route(&service.name, &service.stack)
            .await?;
        debug!(service = %service.id, "route deregistered");
        Ok(())
    }

    // ── Scaling ────────────────────────────────────────────────────

    /// Place one more replica of a persisted service.
    pub async fn scale_up(&self, stack: &str, name: &str) -> OrchestratorResult<DeploymentReport> {
        let id = ServiceRecord::service_id(stack, name);
        let _guard = self.lock_service(&id).await;
        let mut service = self.load_service(&id)?;
        let mut report = DeploymentReport::new(stack);

        service.replicas += 1;
        self.add_replica(&mut service, &mut report).await?;
        info!(service = %id, replicas = service.replicas, "scaled up");

        report.phase = DeployPhase::Completed;
        report.services.push(service);
        Ok(report)
    }

    /// Remove one replica chosen by the eviction policy.
    pub async fn scale_down(&self, stack: &str, name: &str) -> OrchestratorResult<DeploymentReport> {
        let id = ServiceRecord::service_id(stack, name);
        let _guard = self.lock_service(&id).await;
        let mut service = self.load_service(&id)?;
        let mut report = DeploymentReport::new(stack);

        self.evict_one(&mut service, &mut report).await?;
        service.replicas = service.replicas.saturating_sub(1);
        service.updated_at = epoch_secs();
        self.store.put_service(&service)?;
        info!(service = %id, replicas = service.replicas, "scaled down");

        report.phase = DeployPhase::Completed;
        report.services.push(service);
        Ok(report)
    }

    /// Add or remove replicas until the instance count matches the desired
    /// replica count.
    pub async fn reconcile(&self, stack: &str, name: &str) -> OrchestratorResult<DeploymentReport> {
        let id = ServiceRecord::service_id(stack, name);
        let _guard = self.lock_service(&id).await;
        let mut service = self.load_service(&id)?;
        let mut report = DeploymentReport::new(stack);
        let before = service.instances.len();

        while service.instances.len() < service.replicas as usize {
            self.add_replica(&mut service, &mut report).await?;
        }
        while service.instances.len() > service.replicas as usize {
            self.evict_one(&mut service, &mut report).await?;
            self.store.put_service(&service)?;
        }

        info!(service = %id, before, after = service.instances.len(), "service reconciled");
        report.phase = DeployPhase::Completed;
        report.services.push(service);
        Ok(report)
    }

    /// Launch one replica, persist it, then register it.
    async fn add_replica(
        &self,
        service: &mut ServiceRecord,
        report: &mut DeploymentReport,
    ) -> OrchestratorResult<()> {
        let mut in_flight = InFlight::default();
        let launched = match self.launch_replica(service, &mut in_flight).await {
            Ok(launched) => launched,
            Err(ReplicaError::NoEligibleNode) => {
                return Err(OrchestratorError::NoEligibleNode {
                    service: service.id.clone(),
                    report: None,
                });
            }
            Err(ReplicaError::Runtime { node, reason }) => {
                return Err(OrchestratorError::Runtime {
                    service: service.id.clone(),
                    node,
                    reason,
                    report: None,
                });
            }
        };

        let first = service.instances.is_empty();
        let instance = launched.instance;
        report.issues.extend(launched.issues);
        service.instances.push(instance.clone());
        service.updated_at = epoch_secs();
        self.store.put_service(service)?;

        if let Some(address) = &instance.address {
            let record = self.config.cluster.record_name(&service.stack, &service.name);
            let targets = [(address.clone(), self.config.dns_weight)];
            if let Err(e) = self.discovery.register(&record, &targets).await {
                warn!(%record, error = %e, "discovery registration failed");
                report.issues.push(issue(service, Some(&instance.id), RegistrationTarget::Discovery, format!("{e:#}")));
            }
        }
        if first && self.routes_apply(service) {
            report.issues.extend(self.install_routes(service).await);
        }
        Ok(())
    }

    /// Tear down the eviction victim and drop it from the service.
    async fn evict_one(
        &self,
        service: &mut ServiceRecord,
        report: &mut DeploymentReport,
    ) -> OrchestratorResult<()> {
        let victim = self
            .eviction
            .select_victim(&service.instances)
            .and_then(|idx| service.instances.get(idx))
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("no instance of {} to remove", service.id)))?;
        debug!(service = %service.id, instance = %victim.id, policy = self.eviction.name(), "eviction victim chosen");
        self.remove_from_service(service, &victim.id, report).await
    }

    async fn remove_from_service(
        &self,
        service: &mut ServiceRecord,
        instance_id: &str,
        report: &mut DeploymentReport,
    ) -> OrchestratorResult<()> {
        let idx = service
            .instance_index(instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {instance_id}")))?;
        let instance = service.instances[idx].clone();

        report.issues.extend(self.teardown_instance(service, &instance).await?);
        service.instances.remove(idx);
        service.updated_at = epoch_secs();

        if service.instances.is_empty() {
            if let Err(e) = self.remove_routes(service).await {
                warn!(service = %service.id, error = %e, "route deregistration failed");
                report.issues.push(issue(service, None, RegistrationTarget::Route, format!("{e:#}")));
            }
        }
        Ok(())
    }

    // ── Removal ────────────────────────────────────────────────────

    /// Remove every instance of a service, then the service itself.
    pub async fn delete_service(&self, stack: &str, name: &str) -> OrchestratorResult<DeploymentReport> {
        let id = ServiceRecord::service_id(stack, name);
        let _guard = self.lock_service(&id).await;
        let mut service = self.load_service(&id)?;
        let mut report = DeploymentReport::new(stack);

        let ids: Vec<String> = service.instances.iter().map(|i| i.id.clone()).collect();
        for instance_id in ids {
            if let Err(e) = self.remove_from_service(&mut service, &instance_id, &mut report).await {
                // Keep what is left so a retry can finish the job.
                self.store.put_service(&service)?;
                return Err(e);
            }
        }

        self.store.delete_service(&id)?;
        info!(service = %id, "service deleted");
        report.phase = DeployPhase::Completed;
        report.services.push(service);
        Ok(report)
    }

    /// Remove one instance by container id. The desired replica count is
    /// left alone, so a later reconcile replaces it.
    pub async fn remove_instance(&self, instance_id: &str) -> OrchestratorResult<ServiceRecord> {
        let owner = self
            .store
            .find_instance(instance_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {instance_id}")))?;
        let _guard = self.lock_service(&owner.id).await;
        let mut service = self.load_service(&owner.id)?;
        let mut report = DeploymentReport::new(&service.stack);

        self.remove_from_service(&mut service, instance_id, &mut report).await?;
        self.store.put_service(&service)?;
        Ok(service)
    }

    /// Record a health and metrics update pushed for an instance.
    pub async fn update_instance(
        &self,
        instance_id: &str,
        state: HealthState,
        metrics: Vec<MetricValue>,
    ) -> OrchestratorResult<InstanceRecord> {
        let owner = self
            .store
            .find_instance(instance_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {instance_id}")))?;
        let _guard = self.lock_service(&owner.id).await;
        let mut service = self.load_service(&owner.id)?;

        let idx = service
            .instance_index(instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {instance_id}")))?;
        let instance = &mut service.instances[idx];
        instance.state = state;
        instance.metrics = metrics;
        instance.updated_at = epoch_secs();
        let updated = instance.clone();

        self.store.put_service(&service)?;
        debug!(instance = %instance_id, %state, "instance updated");
        Ok(updated)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Merge a node self-report into the ledger.
    pub async fn report_node(&self, node_id: &str, report: &NodeReport) -> OrchestratorResult<NodeRecord> {
        Ok(self.ledger.upsert_from_report(node_id, report).await?)
    }

    /// Forget a node. Its instances are not rehomed.
    pub async fn delete_node(&self, node_id: &str) -> OrchestratorResult<NodeRecord> {
        let node = self.ledger.remove(node_id).await?;
        if !node.instances.is_empty() {
            warn!(node = %node_id, instances = node.instances.len(), "deleted node still hosted instances");
        }
        Ok(node)
    }

    /// Wait for a node's runtime to answer, then mark it `OK`.
    ///
    /// Gives up after the configured attempts and marks the node `DOWN`.
    pub async fn attach_node(&self, node_id: &str) -> OrchestratorResult<NodeRecord> {
        self.ledger.ensure(node_id).await?;
        let what = format!("attach {node_id}");
        match self
            .config
            .attach_backoff
            .retry(&what, || self.runtime.ping(node_id))
            .await
        {
            Ok(()) => {
                let node = self.ledger.set_state(node_id, HealthState::Ok).await?;
                info!(node = %node_id, "node attached");
                Ok(node)
            }
            Err(e) => {
                self.ledger.set_state(node_id, HealthState::Down).await?;
                error!(node = %node_id, error = %e, "node runtime unreachable");
                Err(OrchestratorError::NodeUnreachable {
                    node: node_id.to_string(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }
}

fn new_service(stack: &str, def: &ServiceDefinition) -> ServiceRecord {
    let now = epoch_secs();
    ServiceRecord {
        id: ServiceRecord::service_id(stack, &def.name),
        stack: stack.to_string(),
        name: def.name.clone(),
        replicas: def.replicas,
        reservation: def.reservation,
        ports: def.ports.clone(),
        template: def.template.clone(),
        instances: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

fn issue(
    service: &ServiceRecord,
    instance: Option<&str>,
    target: RegistrationTarget,
    reason: String,
) -> RegistrationIssue {
    RegistrationIssue {
        service: service.id.clone(),
        instance: instance.map(str::to_string),
        target,
        reason,
    }
}
