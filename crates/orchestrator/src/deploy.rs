//! Deployment driver
//!
//! Turns a declaration into a dependency graph of resources, reconciles the
//! graph in topological order and then destroys recorded resources that are
//! no longer declared, dependents first.
//!
//! Resource URNs:
//!
//! | Resource | URN |
//! |---|---|
//! | host setup task | `host_task:<host>:<task>` |
//! | address scope | `ipam_network:<network>` |
//! | CA generation | `ca_epoch:<network>:<epoch>` |
//! | host port range | `port_range:<network>:<host>` |
//! | underlay port | `port:<network>:<endpoint>` |
//! | endpoint | `endpoint:<network>:<endpoint>` |
//! | attachment | `attachment:<network>:<endpoint>` |
//!
//! Lighthouse endpoints are named `lighthouse.<i>`, which declared endpoint
//! names cannot collide with.

use crate::config::{CertsConfig, IpamConfig, OrchestratorConfig};
use crate::declaration::Declaration;
use crate::graph::DependencyGraph;
use crate::host::{base_dirs_actions, task_urn, Host, BASE_DIRS_TASK};
use crate::reconciler::{Change, Reconciler};
use crate::state::{decode, StateStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use skein_common::{
    Action, Database, Error, FirewallPolicy, FirewallRule, Lighthouse, Port, ResourceRecord, Result, DNS_PORT,
    LIGHTHOUSE_GROUP,
};
use skein_provider::agent_config::Topology;
use skein_provider::certs::{CertIssuer, LocalIssuer, SubprocessIssuer};
use skein_provider::ipam::{Allocator, PortRange, RemoteAllocator, SqliteAllocator};
use skein_provider::resources::endpoint::group_set;
use skein_provider::resources::port::enrollment_scope;
use skein_provider::resources::{
    attach, epoch_window, AttachTarget, CaEpochInputs, CaEpochOutputs, CaEpochResource, EndpointInputs,
    EndpointOutputs, EndpointResource, IpamNetworkInputs, IpamNetworkOutputs, IpamNetworkResource, NetworkCas,
    PortInputs, PortOutputs, PortRangeInputs, PortRangeResource, PortResource, RunActionsResource,
};
use skein_provider::ssh::Connector;
use skein_provider::{ActionExecutor, ActionSet, ResourceKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub fn network_urn(network: &str) -> String {
    format!("ipam_network:{}", network)
}

pub fn ca_urn(network: &str, epoch: u64) -> String {
    format!("ca_epoch:{}:{}", network, epoch)
}

pub fn port_range_urn(network: &str, host: &str) -> String {
    format!("port_range:{}:{}", network, host)
}

pub fn port_urn(network: &str, endpoint: &str) -> String {
    format!("port:{}:{}", network, endpoint)
}

pub fn endpoint_urn(network: &str, endpoint: &str) -> String {
    format!("endpoint:{}:{}", network, endpoint)
}

pub fn attachment_urn(network: &str, endpoint: &str) -> String {
    format!("attachment:{}:{}", network, endpoint)
}

/// Name of the `index`-th lighthouse endpoint of a network
pub fn lighthouse_name(index: usize) -> String {
    format!("lighthouse.{}", index)
}

/// The agent config recorded as uploaded by an endpoint's attachment
pub fn deployed_config(state: &StateStore, network: &str, endpoint: &str) -> Result<String> {
    let urn = attachment_urn(network, endpoint);
    let set: ActionSet = state.outputs(&urn)?;
    set.actions
        .into_iter()
        .find_map(|action| match action {
            Action::Upload { content, .. } => Some(content),
            Action::Command { .. } => None,
        })
        .ok_or_else(|| Error::Internal(format!("{} uploads no config", urn)))
}

/// One resource and what happened to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceChange {
    pub urn: String,
    pub kind: String,
    #[serde(flatten)]
    pub change: Change,
}

/// Everything an apply, plan or destroy touched, in order
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub changes: Vec<ResourceChange>,
}

impl Report {
    fn push(&mut self, urn: &str, kind: &str, change: Change) {
        self.changes.push(ResourceChange {
            urn: urn.to_string(),
            kind: kind.to_string(),
            change,
        });
    }

    /// Change recorded for `urn`
    pub fn change(&self, urn: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.urn == urn).map(|c| &c.change)
    }

    pub fn count(&self, f: impl Fn(&Change) -> bool) -> usize {
        self.changes.iter().filter(|c| f(&c.change)).count()
    }

    /// True when nothing would be created, replaced, refreshed or destroyed
    pub fn is_noop(&self) -> bool {
        self.changes.iter().all(|c| c.change == Change::NoOp)
    }
}

/// An endpoint as deployed on one host
#[derive(Debug, Clone)]
struct Member {
    name: String,
    host: String,
    hostname: String,
    groups: Vec<String>,
    firewall: FirewallPolicy,
    lighthouse: bool,
}

#[derive(Debug, Clone)]
enum Node {
    HostTask(ActionSet),
    Network { network: String },
    CaEpoch { network: String, epoch: u64 },
    PortRange { network: String, host: String },
    Port { network: String, host: String },
    Endpoint { network: String, member: Member },
    Attachment { network: String, member: Member },
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::HostTask(_) | Node::Attachment { .. } => RunActionsResource::type_name(),
            Node::Network { .. } => IpamNetworkResource::type_name(),
            Node::CaEpoch { .. } => CaEpochResource::type_name(),
            Node::PortRange { .. } => PortRangeResource::type_name(),
            Node::Port { .. } => PortResource::type_name(),
            Node::Endpoint { .. } => EndpointResource::type_name(),
        }
    }
}

/// Lighthouses first, then declared endpoints by name
fn members(declaration: &Declaration, network: &str) -> Vec<Member> {
    let mut members = Vec::new();
    if let Some(decl) = declaration.networks.get(network) {
        for (i, host) in decl.lighthouses.iter().enumerate() {
            members.push(Member {
                name: lighthouse_name(i),
                host: host.clone(),
                hostname: format!("lh{}.{}", i, LIGHTHOUSE_GROUP),
                groups: vec![LIGHTHOUSE_GROUP.to_string()],
                // lighthouses only answer DNS
                firewall: FirewallPolicy {
                    inbound: vec![FirewallRule::host("any", Port::Number(DNS_PORT))],
                    outbound: Vec::new(),
                },
                lighthouse: true,
            });
        }
    }
    for (name, endpoint) in declaration.endpoints_in(network) {
        members.push(Member {
            name: name.clone(),
            host: endpoint.host.clone(),
            hostname: endpoint.hostname(name).to_string(),
            groups: group_set(&endpoint.groups),
            firewall: endpoint.firewall.clone(),
            lighthouse: false,
        });
    }
    members
}

/// The resource graph a declaration describes
fn build_graph(declaration: &Declaration) -> Result<(DependencyGraph, HashMap<String, Node>)> {
    let mut graph = DependencyGraph::new();
    let mut nodes = HashMap::new();
    let mut add = |graph: &mut DependencyGraph, urn: String, deps: Vec<String>, node: Node| -> Result<()> {
        graph.add(urn.clone(), deps)?;
        nodes.insert(urn, node);
        Ok(())
    };

    let mut hosts: BTreeMap<String, Host> = BTreeMap::new();

    for (network, decl) in &declaration.networks {
        let members = members(declaration, network);
        let [previous, current] = epoch_window(decl.epoch)?;

        let mut enrolled: Vec<&str> = Vec::new();
        for member in &members {
            if !enrolled.contains(&member.host.as_str()) {
                enrolled.push(member.host.as_str());
            }
        }

        for &name in &enrolled {
            if !hosts.contains_key(name) {
                hosts.insert(name.to_string(), Host::new(name, declaration.connection(name)?));
            }
            if let Some(task) = hosts
                .get(name)
                .and_then(|host| host.ensure_task(BASE_DIRS_TASK, base_dirs_actions()))
            {
                add(&mut graph, task.urn, Vec::new(), Node::HostTask(task.actions))?;
            }
        }

        add(
            &mut graph,
            network_urn(network),
            Vec::new(),
            Node::Network {
                network: network.clone(),
            },
        )?;
        for epoch in [previous, current] {
            add(
                &mut graph,
                ca_urn(network, epoch),
                vec![network_urn(network)],
                Node::CaEpoch {
                    network: network.clone(),
                    epoch,
                },
            )?;
        }

        for &host in &enrolled {
            add(
                &mut graph,
                port_range_urn(network, host),
                vec![network_urn(network), task_urn(host, BASE_DIRS_TASK)],
                Node::PortRange {
                    network: network.clone(),
                    host: host.to_string(),
                },
            )?;
        }

        for member in &members {
            add(
                &mut graph,
                port_urn(network, &member.name),
                vec![port_range_urn(network, &member.host)],
                Node::Port {
                    network: network.clone(),
                    host: member.host.clone(),
                },
            )?;
        }

        for member in &members {
            add(
                &mut graph,
                endpoint_urn(network, &member.name),
                vec![network_urn(network), ca_urn(network, current)],
                Node::Endpoint {
                    network: network.clone(),
                    member: member.clone(),
                },
            )?;
        }

        let lighthouse_deps: Vec<String> = members
            .iter()
            .filter(|m| m.lighthouse)
            .flat_map(|m| [endpoint_urn(network, &m.name), port_urn(network, &m.name)])
            .collect();

        for member in &members {
            let mut deps = vec![
                endpoint_urn(network, &member.name),
                port_urn(network, &member.name),
                ca_urn(network, previous),
                ca_urn(network, current),
                task_urn(&member.host, BASE_DIRS_TASK),
            ];
            for dep in &lighthouse_deps {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            add(
                &mut graph,
                attachment_urn(network, &member.name),
                deps,
                Node::Attachment {
                    network: network.clone(),
                    member: member.clone(),
                },
            )?;
        }
    }

    Ok((graph, nodes))
}

/// Outputs of resources reconciled so far in this run
#[derive(Default)]
struct Resolved {
    outputs: HashMap<String, serde_json::Value>,
}

impl Resolved {
    fn insert<T: Serialize>(&mut self, urn: &str, outputs: Option<&T>) -> Result<()> {
        if let Some(outputs) = outputs {
            self.outputs.insert(urn.to_string(), serde_json::to_value(outputs)?);
        }
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, urn: &str) -> Result<Option<T>> {
        self.outputs
            .get(urn)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| Error::Internal(format!("outputs of {}: {}", urn, e)))
            })
            .transpose()
    }
}

/// Reconciles declarations against the state database
pub struct Deployment {
    config: OrchestratorConfig,
    state: StateStore,
    allocator: Arc<dyn Allocator>,
    run_actions: RunActionsResource,
    networks: IpamNetworkResource,
    cas: CaEpochResource,
    port_ranges: PortRangeResource,
    ports: PortResource,
    endpoints: EndpointResource,
}

impl Deployment {
    pub fn new(
        config: OrchestratorConfig,
        db: Database,
        connector: Arc<dyn Connector>,
        allocator: Arc<dyn Allocator>,
        issuer: Arc<dyn CertIssuer>,
    ) -> Self {
        Self {
            config,
            state: StateStore::new(db),
            run_actions: RunActionsResource::new(ActionExecutor::new(connector)),
            networks: IpamNetworkResource::new(allocator.clone()),
            cas: CaEpochResource::new(issuer.clone()),
            port_ranges: PortRangeResource::new(allocator.clone()),
            ports: PortResource::new(allocator.clone()),
            endpoints: EndpointResource::new(allocator.clone(), issuer),
            allocator,
        }
    }

    /// Pick the allocator and issuer backends named in `config`.
    ///
    /// A remote allocator runs on a declared host, so it needs the
    /// declaration to resolve that host's connection.
    pub fn from_config(
        config: OrchestratorConfig,
        db: Database,
        connector: Arc<dyn Connector>,
        declaration: Option<&Declaration>,
    ) -> Result<Self> {
        let allocator: Arc<dyn Allocator> = match &config.ipam {
            IpamConfig::Local => Arc::new(SqliteAllocator::new(db.clone())?),
            IpamConfig::Remote { host, binary } => {
                let declaration = declaration.ok_or_else(|| {
                    Error::Config(format!("the remote allocator on {} needs a declaration", host))
                })?;
                Arc::new(RemoteAllocator::new(
                    connector.clone(),
                    declaration.connection(host)?,
                    binary.clone(),
                ))
            }
        };
        let issuer: Arc<dyn CertIssuer> = match &config.certs {
            CertsConfig::Builtin => Arc::new(LocalIssuer::new()),
            CertsConfig::Subprocess { binary } => Arc::new(SubprocessIssuer::new(binary.clone())),
        };
        Ok(Self::new(config, db, connector, allocator, issuer))
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Bring the world in line with `declaration`
    pub async fn apply(&self, declaration: &Declaration) -> Result<Report> {
        self.seed().await?;
        let report = self.run(&Reconciler::new(self.state.clone()), declaration).await?;
        info!(
            "Apply finished: {} created, {} replaced, {} refreshed, {} destroyed",
            report.count(|c| *c == Change::Create),
            report.count(|c| matches!(c, Change::Replace { .. })),
            report.count(|c| matches!(c, Change::Refresh { .. })),
            report.count(|c| *c == Change::Destroy),
        );
        Ok(report)
    }

    /// What `apply` would do, without side effects
    pub async fn plan(&self, declaration: &Declaration) -> Result<Report> {
        self.run(&Reconciler::planner(self.state.clone()), declaration).await
    }

    /// Tear down every recorded resource
    pub async fn destroy(&self) -> Result<Report> {
        let reconciler = Reconciler::new(self.state.clone());
        let records = self.state.list()?;
        let mut report = Report::default();
        self.destroy_records(&reconciler, records, &mut report).await?;
        info!("Destroyed {} resource(s)", report.changes.len());
        Ok(report)
    }

    /// The agent config last deployed for an endpoint
    pub fn render(&self, network: &str, endpoint: &str) -> Result<String> {
        deployed_config(&self.state, network, endpoint)
    }

    /// Replay recorded allocations into the allocator
    async fn seed(&self) -> Result<()> {
        let mut seeded = 0usize;

        for record in self.state.list_kind(IpamNetworkResource::type_name())? {
            let outputs: IpamNetworkOutputs = decode(&record)?;
            if let Err(e) = self
                .allocator
                .create_network(&outputs.network_id, &outputs.cidr)
                .await
            {
                warn!("Seeding address scope of {} failed: {}", record.urn, e);
            }
        }

        for record in self.state.list_kind(PortRangeResource::type_name())? {
            let outputs: PortRangeInputs = decode(&record)?;
            let result = match PortRange::new(outputs.start, outputs.end) {
                Ok(range) => self.allocator.create_host(&outputs.scope, range).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Seeding port scope of {} failed: {}", record.urn, e);
            }
        }

        for record in self.state.list_kind(EndpointResource::type_name())? {
            let outputs: EndpointOutputs = decode(&record)?;
            match self
                .allocator
                .claim_address(&outputs.network_id, &record.id, outputs.overlay_ip)
                .await
            {
                Ok(()) => seeded += 1,
                Err(e) => warn!("Seeding {} of {} failed: {}", outputs.overlay_ip, record.urn, e),
            }
        }

        for record in self.state.list_kind(PortResource::type_name())? {
            let outputs: PortOutputs = decode(&record)?;
            match self
                .allocator
                .claim_port(&outputs.scope, &record.id, outputs.port)
                .await
            {
                Ok(()) => seeded += 1,
                Err(e) => warn!("Seeding port {} of {} failed: {}", outputs.port, record.urn, e),
            }
        }

        debug!("Seeded {} recorded allocation(s)", seeded);
        Ok(())
    }

    async fn run(&self, reconciler: &Reconciler, declaration: &Declaration) -> Result<Report> {
        let (graph, nodes) = build_graph(declaration)?;
        let mut resolved = Resolved::default();
        let mut report = Report::default();

        for urn in graph.topological_order()? {
            let node = nodes
                .get(&urn)
                .ok_or_else(|| Error::Internal(format!("{} is not in the graph", urn)))?;
            let deps = graph.dependencies(&urn).unwrap_or_default().to_vec();
            let change = self
                .reconcile_node(reconciler, declaration, &urn, node, deps, &mut resolved)
                .await
                .map_err(|e| e.for_resource(&urn))?;
            report.push(&urn, node.kind(), change);
        }

        let orphans: Vec<ResourceRecord> = self
            .state
            .list()?
            .into_iter()
            .filter(|record| !graph.contains(&record.urn))
            .collect();
        self.destroy_records(reconciler, orphans, &mut report).await?;

        Ok(report)
    }

    /// Outcome for a node whose dependencies have no outputs yet
    fn pending(&self, reconciler: &Reconciler, urn: &str) -> Result<Change> {
        if !reconciler.is_dry_run() {
            return Err(Error::Internal(format!(
                "dependencies of {} were not reconciled",
                urn
            )));
        }
        Ok(match self.state.get(urn)? {
            Some(_) => Change::Pending,
            None => Change::Create,
        })
    }

    async fn reconcile_node(
        &self,
        reconciler: &Reconciler,
        declaration: &Declaration,
        urn: &str,
        node: &Node,
        deps: Vec<String>,
        resolved: &mut Resolved,
    ) -> Result<Change> {
        match node {
            Node::HostTask(actions) => {
                let r = reconciler.reconcile(&self.run_actions, urn, actions, deps).await?;
                resolved.insert(urn, r.outputs.as_ref())?;
                Ok(r.change)
            }

            Node::Network { network } => {
                let decl = &declaration.networks[network];
                let inputs = IpamNetworkInputs {
                    name: network.clone(),
                    cidr: decl.cidr.clone(),
                    domain: decl.domain.clone(),
                };
                let r = reconciler.reconcile(&self.networks, urn, &inputs, deps).await?;
                resolved.insert(urn, r.outputs.as_ref())?;
                Ok(r.change)
            }

            Node::CaEpoch { network, epoch } => {
                let Some(net) = resolved.get::<IpamNetworkOutputs>(&network_urn(network))? else {
                    return self.pending(reconciler, urn);
                };
                let inputs = CaEpochInputs {
                    network_id: net.network_id,
                    network_name: network.clone(),
                    epoch: *epoch,
                    validity_hours: self.config.ca_validity_hours,
                };
                let r = reconciler.reconcile(&self.cas, urn, &inputs, deps).await?;
                resolved.insert(urn, r.outputs.as_ref())?;
                Ok(r.change)
            }

            Node::PortRange { network, host } => {
                let Some(net) = resolved.get::<IpamNetworkOutputs>(&network_urn(network))? else {
                    return self.pending(reconciler, urn);
                };
                let (start, end) = declaration.networks[network].underlay_ports;
                let inputs = PortRangeInputs {
                    scope: enrollment_scope(&net.network_id, host, start, end),
                    start,
                    end,
                };
                let r = reconciler.reconcile(&self.port_ranges, urn, &inputs, deps).await?;
                resolved.insert(urn, r.outputs.as_ref())?;
                Ok(r.change)
            }

            Node::Port { network, host } => {
                let Some(range) = resolved.get::<PortRangeInputs>(&port_range_urn(network, host))? else {
                    return self.pending(reconciler, urn);
                };
                let inputs = PortInputs { scope: range.scope };
                let r = reconciler.reconcile(&self.ports, urn, &inputs, deps).await?;
                resolved.insert(urn, r.outputs.as_ref())?;
                Ok(r.change)
            }

            Node::Endpoint { network, member } => {
                let current = declaration.networks[network].epoch;
                let (Some(net), Some(ca)) = (
                    resolved.get::<IpamNetworkOutputs>(&network_urn(network))?,
                    resolved.get::<CaEpochOutputs>(&ca_urn(network, current))?,
                ) else {
                    return self.pending(reconciler, urn);
                };
                let inputs = EndpointInputs {
                    network_id: net.network_id,
                    network_prefix_len: net.prefix_len,
                    domain: net.domain,
                    hostname: member.hostname.clone(),
                    groups: member.groups.clone(),
                    firewall: member.firewall.clone(),
                    ca: ca.ca,
                    leaf_validity_days: self.config.leaf_validity_days,
                };
                let r = reconciler.reconcile(&self.endpoints, urn, &inputs, deps).await?;
                resolved.insert(urn, r.outputs.as_ref())?;
                Ok(r.change)
            }

            Node::Attachment { network, member } => {
                let Some(set) = self.attachment(declaration, network, member, resolved)? else {
                    return self.pending(reconciler, urn);
                };
                let r = reconciler.reconcile(&self.run_actions, urn, &set, deps).await?;
                resolved.insert(urn, r.outputs.as_ref())?;
                Ok(r.change)
            }
        }
    }

    /// The action set deploying `member`, once everything it needs exists
    fn attachment(
        &self,
        declaration: &Declaration,
        network: &str,
        member: &Member,
        resolved: &Resolved,
    ) -> Result<Option<ActionSet>> {
        let decl = &declaration.networks[network];
        let [previous, current] = epoch_window(decl.epoch)?;

        let (Some(endpoint), Some(port), Some(prev_ca), Some(cur_ca)) = (
            resolved.get::<EndpointOutputs>(&endpoint_urn(network, &member.name))?,
            resolved.get::<PortOutputs>(&port_urn(network, &member.name))?,
            resolved.get::<CaEpochOutputs>(&ca_urn(network, previous))?,
            resolved.get::<CaEpochOutputs>(&ca_urn(network, current))?,
        ) else {
            return Ok(None);
        };

        let mut lighthouses = Vec::with_capacity(decl.lighthouses.len());
        for (i, host) in decl.lighthouses.iter().enumerate() {
            let name = lighthouse_name(i);
            let (Some(lh), Some(lh_port)) = (
                resolved.get::<EndpointOutputs>(&endpoint_urn(network, &name))?,
                resolved.get::<PortOutputs>(&port_urn(network, &name))?,
            ) else {
                return Ok(None);
            };
            lighthouses.push(Lighthouse {
                overlay_ip: lh.overlay_ip,
                underlay_host: declaration.connection(host)?.host,
                underlay_port: lh_port.port,
            });
        }

        let cas = NetworkCas::new(prev_ca.ca, cur_ca.ca)?;
        let topology = Topology {
            trusted_cas: cas.trust_bundle(),
            lighthouses,
            log_level: self.config.agent.log_level.clone(),
        };
        let target = AttachTarget {
            connection: declaration.connection(&member.host)?,
            is_lighthouse: member.lighthouse,
            underlay_port: port.port,
            config_dir: self.config.agent.config_dir.clone(),
            service_prefix: self.config.agent.service_prefix.clone(),
            network_mode: self.config.agent.network_mode,
        };
        attach(&endpoint, network, &topology, &target).map(Some)
    }

    /// Destroy `records`, dependents before their dependencies
    async fn destroy_records(
        &self,
        reconciler: &Reconciler,
        records: Vec<ResourceRecord>,
        report: &mut Report,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let graph = DependencyGraph::from_records(
            records
                .iter()
                .map(|r| (r.urn.as_str(), r.dependencies.as_slice())),
        )?;
        let by_urn: HashMap<&str, &ResourceRecord> = records.iter().map(|r| (r.urn.as_str(), r)).collect();

        let mut seen = HashSet::new();
        for urn in graph.reverse_order()? {
            let Some(record) = by_urn.get(urn.as_str()) else {
                continue;
            };
            if !seen.insert(urn.clone()) {
                continue;
            }
            let change = self
                .destroy_record(reconciler, record)
                .await
                .map_err(|e| e.for_resource(&urn))?;
            report.push(&urn, &record.kind, change);
        }
        Ok(())
    }

    async fn destroy_record(&self, reconciler: &Reconciler, record: &ResourceRecord) -> Result<Change> {
        match record.kind.as_str() {
            k if k == RunActionsResource::type_name() => reconciler.destroy(&self.run_actions, record).await,
            k if k == IpamNetworkResource::type_name() => reconciler.destroy(&self.networks, record).await,
            k if k == CaEpochResource::type_name() => reconciler.destroy(&self.cas, record).await,
            k if k == PortRangeResource::type_name() => reconciler.destroy(&self.port_ranges, record).await,
            k if k == PortResource::type_name() => reconciler.destroy(&self.ports, record).await,
            k if k == EndpointResource::type_name() => reconciler.destroy(&self.endpoints, record).await,
            other => Err(Error::Validation(format!("unknown resource kind {}", other))),
        }
    }
}
