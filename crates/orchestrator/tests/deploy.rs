//! End-to-end deployments against an in-memory fleet

use chrono::Utc;
use skein_common::{Database, Error, MeshCertificate, Port, Proto};
use skein_orchestrator::config::IpamConfig;
use skein_orchestrator::deploy::{ca_urn, endpoint_urn, port_urn};
use skein_orchestrator::{Change, Declaration, Deployment, OrchestratorConfig};
use skein_provider::agent_config::{AgentConfig, CompiledRule};
use skein_provider::certs::LocalIssuer;
use skein_provider::ipam::{Allocator, SqliteAllocator};
use skein_provider::resources::{CaEpochOutputs, EndpointOutputs, IpamNetworkOutputs, NetworkMode, PortOutputs};
use skein_provider::ssh::MemoryConnector;
use std::net::Ipv4Addr;
use std::sync::Arc;

const LIGHTHOUSE: &str = "203.0.113.7:22";
const NODE: &str = "203.0.113.20:22";

fn declaration(epoch: u64, hostname: &str, port: u16) -> Declaration {
    Declaration::parse(&format!(
        r#"
[hosts.lh]
host = "203.0.113.7"
user = "root"
password = "pw"

[hosts.node1]
host = "203.0.113.20"
user = "root"
password = "pw"

[networks.mesh]
cidr = "10.0.1.0/24"
epoch = {epoch}
lighthouses = ["lh"]

[endpoints.backend]
network = "mesh"
host = "node1"
hostname = "{hostname}"
groups = ["app"]
firewall = {{ inbound = [{{ host = "any", port = {port} }}], outbound = [] }}
"#
    ))
    .unwrap()
}

fn deployment(db: &Database, connector: &MemoryConnector) -> Deployment {
    Deployment::from_config(
        OrchestratorConfig::default(),
        db.clone(),
        Arc::new(connector.clone()),
        None,
    )
    .unwrap()
}

fn endpoint(deployment: &Deployment, name: &str) -> EndpointOutputs {
    deployment.state().outputs(&endpoint_urn("mesh", name)).unwrap()
}

#[tokio::test]
async fn test_end_to_end_member_config() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    let report = deployment.apply(&declaration(1, "backend", 80)).await.unwrap();
    assert_eq!(report.changes.len(), 13);
    assert_eq!(report.count(|c| *c == Change::Create), 13);

    let lighthouse = endpoint(&deployment, "lighthouse.0");
    let backend = endpoint(&deployment, "backend");
    assert_eq!(lighthouse.fqdn(), "lh0.lighthouses.skein.internal");
    assert_eq!(backend.fqdn(), "backend.skein.internal");
    for ip in [lighthouse.overlay_ip, backend.overlay_ip] {
        assert!(ip >= Ipv4Addr::new(10, 0, 1, 1) && ip <= Ipv4Addr::new(10, 0, 1, 254));
    }
    assert_ne!(lighthouse.overlay_ip, backend.overlay_ip);

    let rendered = deployment.render("mesh", "backend").unwrap();
    let config: AgentConfig = serde_json::from_str(&rendered).unwrap();
    let lh_ip = lighthouse.overlay_ip.to_string();

    assert_eq!(config.static_host_map.len(), 1);
    assert_eq!(
        config.static_host_map.get(&lh_ip),
        Some(&vec!["203.0.113.7:30000".to_string()])
    );
    assert_eq!(config.lighthouse.hosts, vec![lh_ip]);
    assert!(!config.lighthouse.am_lighthouse);
    assert_eq!(config.listen.port, 30000);
    assert_eq!(
        config.firewall.outbound,
        vec![CompiledRule {
            port: Port::Number(53),
            proto: Proto::Any,
            host: None,
            groups: Some(vec!["lighthouses".into()]),
        }]
    );
    assert_eq!(
        config.firewall.inbound,
        vec![CompiledRule {
            port: Port::Number(80),
            proto: Proto::Any,
            host: Some("any".into()),
            groups: None,
        }]
    );

    // trusts both generations, current first, and the leaf chains to it
    let bundle = MeshCertificate::parse_bundle(&config.pki.ca).unwrap();
    assert_eq!(bundle.len(), 2);
    assert!(bundle.iter().all(|ca| ca.details.is_ca));
    let leaf = MeshCertificate::from_pem(&config.pki.cert).unwrap();
    leaf.verify(&bundle[0], Utc::now()).unwrap();
    assert_eq!(leaf.details.name, "backend.skein.internal");
    assert_eq!(leaf.details.groups, vec!["app"]);

    assert!(connector.files(NODE).values().any(|content| *content == rendered));
    let commands = connector.commands(NODE);
    assert!(commands.iter().any(|c| c == "mkdir -p /etc/skein && mkdir -p /opt/skein"));
    assert!(commands.iter().any(|c| c.contains("systemctl enable --now skein-")));

    let lh_config: AgentConfig = serde_json::from_str(&deployment.render("mesh", "lighthouse.0").unwrap()).unwrap();
    assert!(lh_config.lighthouse.am_lighthouse);
    assert!(lh_config.static_host_map.is_empty());
    assert!(!connector.files(LIGHTHOUSE).is_empty());
    assert_eq!(connector.open_sessions(), 0);
}

#[tokio::test]
async fn test_reapply_is_a_noop() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);
    let decl = declaration(1, "backend", 80);

    deployment.apply(&decl).await.unwrap();
    let before = endpoint(&deployment, "backend");
    let connections = connector.connections();

    let report = deployment.apply(&decl).await.unwrap();
    assert!(report.is_noop(), "{:?}", report);

    let after = endpoint(&deployment, "backend");
    assert_eq!(before.endpoint_id, after.endpoint_id);
    assert_eq!(before.certificate, after.certificate);
    assert_eq!(connector.connections(), connections);

    let network: IpamNetworkOutputs = deployment.state().outputs("ipam_network:mesh").unwrap();
    let allocator = SqliteAllocator::new(db.clone()).unwrap();
    assert_eq!(allocator.list_addresses(&network.network_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_hostname_change_replaces_endpoint() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    deployment.apply(&declaration(1, "backend", 80)).await.unwrap();
    let old = endpoint(&deployment, "backend");

    let report = deployment.apply(&declaration(1, "api", 80)).await.unwrap();
    assert_eq!(
        report.change("endpoint:mesh:backend"),
        Some(&Change::Replace {
            keys: vec!["hostname".into()]
        })
    );
    assert!(matches!(
        report.change("attachment:mesh:backend"),
        Some(Change::Replace { .. })
    ));
    assert_eq!(report.change("endpoint:mesh:lighthouse.0"), Some(&Change::NoOp));

    let new = endpoint(&deployment, "backend");
    assert_ne!(new.endpoint_id, old.endpoint_id);
    assert_ne!(new.overlay_ip, old.overlay_ip);
    assert_ne!(new.certificate, old.certificate);
    assert_eq!(new.fqdn(), "api.skein.internal");

    let allocator = SqliteAllocator::new(db.clone()).unwrap();
    let bound = allocator.list_addresses(&new.network_id).await.unwrap();
    assert!(bound.iter().any(|(id, ip)| *id == new.endpoint_id && *ip == new.overlay_ip));
    assert!(bound.iter().all(|(id, _)| *id != old.endpoint_id));

    // the old config was torn down, the new one uploaded
    let files = connector.files(NODE);
    assert_eq!(files.len(), 1);
    assert!(files.keys().all(|path| path.starts_with("/etc/skein/mesh/")));
}

#[tokio::test]
async fn test_firewall_change_refreshes_endpoint() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    deployment.apply(&declaration(1, "backend", 80)).await.unwrap();
    let old = endpoint(&deployment, "backend");

    let report = deployment.apply(&declaration(1, "backend", 443)).await.unwrap();
    assert_eq!(
        report.change("endpoint:mesh:backend"),
        Some(&Change::Refresh {
            fields: vec!["firewall".into()]
        })
    );
    assert!(matches!(
        report.change("attachment:mesh:backend"),
        Some(Change::Replace { .. })
    ));

    let new = endpoint(&deployment, "backend");
    assert_eq!(new.endpoint_id, old.endpoint_id);
    assert_eq!(new.overlay_ip, old.overlay_ip);

    let config: AgentConfig = serde_json::from_str(&deployment.render("mesh", "backend").unwrap()).unwrap();
    assert_eq!(config.firewall.inbound[0].port, Port::Number(443));
}

#[tokio::test]
async fn test_epoch_rotation() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    deployment.apply(&declaration(1, "backend", 80)).await.unwrap();
    let signed_at_one = endpoint(&deployment, "backend");
    assert_eq!(signed_at_one.signing_epoch, 1);

    let report = deployment.apply(&declaration(2, "backend", 80)).await.unwrap();
    assert_eq!(report.change(&ca_urn("mesh", 0)), Some(&Change::Destroy));
    assert_eq!(report.change(&ca_urn("mesh", 1)), Some(&Change::NoOp));
    assert_eq!(report.change(&ca_urn("mesh", 2)), Some(&Change::Create));
    // still trusted at epoch 2
    assert_eq!(report.change("endpoint:mesh:backend"), Some(&Change::NoOp));
    assert!(matches!(
        report.change("attachment:mesh:backend"),
        Some(Change::Replace { .. })
    ));

    let cas = deployment.state().list_kind("ca_epoch").unwrap();
    assert_eq!(cas.len(), 2);
    let current: CaEpochOutputs = deployment.state().outputs(&ca_urn("mesh", 2)).unwrap();
    assert_eq!(current.epoch, 2);
    assert_eq!(current.ca.epoch, 2);

    let report = deployment.apply(&declaration(3, "backend", 80)).await.unwrap();
    assert_eq!(
        report.change("endpoint:mesh:backend"),
        Some(&Change::Replace {
            keys: vec!["signing_epoch".into()]
        })
    );
    let reissued = endpoint(&deployment, "backend");
    assert_eq!(reissued.signing_epoch, 3);

    let current: CaEpochOutputs = deployment.state().outputs(&ca_urn("mesh", 3)).unwrap();
    let ca = MeshCertificate::from_pem(&current.ca.certificate).unwrap();
    MeshCertificate::from_pem(&reissued.certificate)
        .unwrap()
        .verify(&ca, Utc::now())
        .unwrap();
}

#[tokio::test]
async fn test_plan_has_no_side_effects() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    let report = deployment.plan(&declaration(1, "backend", 80)).await.unwrap();
    assert_eq!(report.changes.len(), 13);
    assert!(report.changes.iter().all(|c| c.change == Change::Create));
    assert!(deployment.state().list().unwrap().is_empty());
    assert_eq!(connector.connections(), 0);

    deployment.apply(&declaration(1, "backend", 80)).await.unwrap();
    let records = deployment.state().list().unwrap().len();
    let connections = connector.connections();

    let report = deployment.plan(&declaration(1, "api", 80)).await.unwrap();
    assert!(matches!(
        report.change("endpoint:mesh:backend"),
        Some(Change::Replace { .. })
    ));
    assert_eq!(report.change("attachment:mesh:backend"), Some(&Change::Pending));
    assert_eq!(report.change("endpoint:mesh:lighthouse.0"), Some(&Change::NoOp));
    assert_eq!(deployment.state().list().unwrap().len(), records);
    assert_eq!(connector.connections(), connections);
    assert_eq!(endpoint(&deployment, "backend").hostname, "backend");
}

#[tokio::test]
async fn test_undeclared_resources_are_destroyed() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    deployment.apply(&declaration(1, "backend", 80)).await.unwrap();

    let mut decl = declaration(1, "backend", 80);
    decl.endpoints.clear();
    let report = deployment.apply(&decl).await.unwrap();

    let position = |urn: &str| report.changes.iter().position(|c| c.urn == urn).unwrap();
    for urn in [
        "attachment:mesh:backend",
        "endpoint:mesh:backend",
        "port:mesh:backend",
        "port_range:mesh:node1",
        "host_task:node1:base-dirs",
    ] {
        assert_eq!(report.change(urn), Some(&Change::Destroy), "{}", urn);
    }
    assert!(position("attachment:mesh:backend") < position("endpoint:mesh:backend"));
    assert!(position("port:mesh:backend") < position("port_range:mesh:node1"));
    assert!(deployment.state().get("endpoint:mesh:backend").unwrap().is_none());
    assert!(connector.files(NODE).is_empty());
}

#[tokio::test]
async fn test_destroy_everything() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);
    deployment.apply(&declaration(1, "backend", 80)).await.unwrap();

    let report = deployment.destroy().await.unwrap();
    assert_eq!(report.changes.len(), 13);
    assert!(report.changes.iter().all(|c| c.change == Change::Destroy));
    let position = |urn: &str| report.changes.iter().position(|c| c.urn == urn).unwrap();
    assert!(position("attachment:mesh:backend") < position("endpoint:mesh:backend"));
    assert!(position("endpoint:mesh:backend") < position("ca_epoch:mesh:1"));
    assert!(position("ca_epoch:mesh:0") < position("ipam_network:mesh"));
    assert!(deployment.state().list().unwrap().is_empty());
    assert!(connector.files(NODE).is_empty());
    assert!(connector.files(LIGHTHOUSE).is_empty());
}

#[tokio::test]
async fn test_seeding_restores_allocator() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let decl = declaration(1, "backend", 80);
    deployment(&db, &connector).apply(&decl).await.unwrap();

    // a fresh allocator that knows nothing about earlier runs
    let allocator = Arc::new(SqliteAllocator::new(Database::open_memory().unwrap()).unwrap());
    let deployment = Deployment::new(
        OrchestratorConfig::default(),
        db.clone(),
        Arc::new(connector.clone()),
        allocator.clone(),
        Arc::new(LocalIssuer::new()),
    );
    let report = deployment.apply(&decl).await.unwrap();
    assert!(report.is_noop(), "{:?}", report);

    let backend = endpoint(&deployment, "backend");
    let bound = allocator.list_addresses(&backend.network_id).await.unwrap();
    assert!(bound.contains(&(backend.endpoint_id.clone(), backend.overlay_ip)));
    assert_eq!(bound.len(), 2);
}

#[tokio::test]
async fn test_remote_allocator_needs_declaration() {
    let config = OrchestratorConfig {
        ipam: IpamConfig::Remote {
            host: "lh".into(),
            binary: "/opt/skein/bin/skein-ipam".into(),
        },
        ..Default::default()
    };
    let result = Deployment::from_config(
        config.clone(),
        Database::open_memory().unwrap(),
        Arc::new(MemoryConnector::new()),
        None,
    );
    assert!(matches!(result, Err(Error::Config(_))));

    let decl = declaration(1, "backend", 80);
    assert!(Deployment::from_config(
        config,
        Database::open_memory().unwrap(),
        Arc::new(MemoryConnector::new()),
        Some(&decl),
    )
    .is_ok());
}

#[tokio::test]
async fn test_pod_networking_rejects_lighthouses() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let mut config = OrchestratorConfig::default();
    config.agent.network_mode = NetworkMode::Pod;
    let deployment = Deployment::from_config(config, db, Arc::new(connector), None).unwrap();

    let err = deployment.apply(&declaration(1, "backend", 80)).await.unwrap_err();
    assert!(err.to_string().starts_with("attachment:mesh:lighthouse.0: "));
    assert!(matches!(err.root(), Error::Validation(msg) if msg.contains("pod networking")));
}

#[tokio::test]
async fn test_failed_command_halts_dependents() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    connector.fail_command("systemctl enable --now", 5, "unit not found");
    let deployment = deployment(&db, &connector);

    let err = deployment.apply(&declaration(1, "backend", 80)).await.unwrap_err();
    assert!(err.to_string().contains("unit not found"));
    assert!(matches!(err.root(), Error::Provisioning { exit_code: 5, .. }));
    assert!(deployment.state().get("attachment:mesh:backend").unwrap().is_none());

    connector.clear_failures();
    let report = deployment.apply(&declaration(1, "backend", 80)).await.unwrap();
    assert_eq!(report.change("endpoint:mesh:backend"), Some(&Change::NoOp));
    assert_eq!(report.change("attachment:mesh:backend"), Some(&Change::Create));
}

/// Lighthouse and members all on one host
fn colocated(cidr: &str, end: u32, members: &[&str], groups: &str) -> Declaration {
    let mut text = format!(
        r#"
[hosts.lh]
host = "203.0.113.7"
user = "root"
password = "pw"

[networks.mesh]
cidr = "{cidr}"
epoch = 1
lighthouses = ["lh"]
underlay_ports = [30000, {end}]
"#
    );
    for name in members {
        text.push_str(&format!(
            "\n[endpoints.{name}]\nnetwork = \"mesh\"\nhost = \"lh\"\ngroups = {groups}\n"
        ));
    }
    Declaration::parse(&text).unwrap()
}

fn ports(deployment: &Deployment, names: &[&str]) -> Vec<PortOutputs> {
    names
        .iter()
        .map(|name| deployment.state().outputs(&port_urn("mesh", name)).unwrap())
        .collect()
}

#[tokio::test]
async fn test_port_range_change_moves_ports() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    deployment
        .apply(&colocated("10.0.1.0/24", 31000, &["a"], r#"["app"]"#))
        .await
        .unwrap();
    let before = ports(&deployment, &["lighthouse.0", "a"]);

    let report = deployment
        .apply(&colocated("10.0.1.0/24", 31001, &["a", "b"], r#"["app"]"#))
        .await
        .unwrap();
    assert!(matches!(report.change("port_range:mesh:lh"), Some(Change::Replace { .. })));
    for urn in ["port:mesh:lighthouse.0", "port:mesh:a"] {
        assert_eq!(
            report.change(urn),
            Some(&Change::Replace {
                keys: vec!["scope".into()]
            }),
            "{}",
            urn
        );
    }

    let after = ports(&deployment, &["lighthouse.0", "a", "b"]);
    let mut values: Vec<u16> = after.iter().map(|p| p.port).collect();
    values.sort_unstable();
    values.dedup();
    assert_eq!(values.len(), 3, "duplicate underlay ports: {:?}", after);
    assert!(after.iter().all(|p| p.scope == after[0].scope));
    assert_ne!(after[0].scope, before[0].scope);

    // the allocator agrees with what is recorded
    let allocator = SqliteAllocator::new(db.clone()).unwrap();
    let mut bound: Vec<u16> = allocator
        .list_ports(&after[0].scope)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, port)| port)
        .collect();
    bound.sort_unstable();
    assert_eq!(bound, values);

    let report = deployment
        .apply(&colocated("10.0.1.0/24", 31001, &["a", "b"], r#"["app"]"#))
        .await
        .unwrap();
    assert!(report.is_noop(), "{:?}", report);
}

#[tokio::test]
async fn test_cidr_change_readdresses_endpoints() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    deployment
        .apply(&colocated("10.0.1.0/24", 31000, &["a", "b"], r#"["app"]"#))
        .await
        .unwrap();
    let old_network: IpamNetworkOutputs = deployment.state().outputs("ipam_network:mesh").unwrap();

    let report = deployment
        .apply(&colocated("10.0.2.0/24", 31000, &["a", "b"], r#"["app"]"#))
        .await
        .unwrap();
    assert_eq!(
        report.change("ipam_network:mesh"),
        Some(&Change::Replace {
            keys: vec!["cidr".into()]
        })
    );
    for name in ["lighthouse.0", "a", "b"] {
        assert!(
            matches!(report.change(&endpoint_urn("mesh", name)), Some(Change::Replace { keys }) if keys.contains(&"network_id".to_string())),
            "{}",
            name
        );
    }

    let network: IpamNetworkOutputs = deployment.state().outputs("ipam_network:mesh").unwrap();
    assert_ne!(network.network_id, old_network.network_id);

    let endpoints: Vec<EndpointOutputs> = ["lighthouse.0", "a", "b"]
        .iter()
        .map(|name| endpoint(&deployment, name))
        .collect();
    let mut addresses: Vec<Ipv4Addr> = endpoints.iter().map(|e| e.overlay_ip).collect();
    assert!(addresses.iter().all(|ip| ip.octets()[..3] == [10, 0, 2]));
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), 3);
    assert!(endpoints.iter().all(|e| e.network_id == network.network_id));

    let allocator = SqliteAllocator::new(db.clone()).unwrap();
    assert_eq!(allocator.list_addresses(&network.network_id).await.unwrap().len(), 3);

    let mut values: Vec<u16> = ports(&deployment, &["lighthouse.0", "a", "b"])
        .iter()
        .map(|p| p.port)
        .collect();
    values.sort_unstable();
    values.dedup();
    assert_eq!(values.len(), 3);
}

#[tokio::test]
async fn test_reordered_groups_are_a_noop() {
    let db = Database::open_memory().unwrap();
    let connector = MemoryConnector::new();
    let deployment = deployment(&db, &connector);

    deployment
        .apply(&colocated("10.0.1.0/24", 31000, &["a"], r#"["app", "db"]"#))
        .await
        .unwrap();
    let before = endpoint(&deployment, "a");

    let report = deployment
        .apply(&colocated("10.0.1.0/24", 31000, &["a"], r#"["db", "app", "db"]"#))
        .await
        .unwrap();
    assert!(report.is_noop(), "{:?}", report);
    assert_eq!(endpoint(&deployment, "a").endpoint_id, before.endpoint_id);
}
