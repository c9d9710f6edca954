//! Attaching an endpoint to a host
//!
//! Renders the agent configuration and wraps it, with the service restart
//! that picks it up, in an [`ActionSet`] realized as a `run_actions`
//! resource. The config digest is the set's trigger, so any config change
//! replaces the attachment.

use super::endpoint::EndpointOutputs;
use crate::agent_config::{compile, interface_name, Topology};
use crate::executor::{trigger_digest, ActionSet};
use serde::{Deserialize, Serialize};
use skein_common::{Action, ConnectionParams, Error, Result};
use tracing::debug;

/// How agent workloads are networked on the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Host,
    Bridge,
    Pod,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::Bridge => write!(f, "bridge"),
            NetworkMode::Pod => write!(f, "pod"),
        }
    }
}

/// Where and how an endpoint is deployed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget {
    pub connection: ConnectionParams,
    pub is_lighthouse: bool,
    pub underlay_port: u16,
    pub config_dir: String,
    pub service_prefix: String,
    pub network_mode: NetworkMode,
}

impl AttachTarget {
    /// Host ports the agent must bind directly
    pub fn direct_ports(&self) -> Vec<u16> {
        if self.is_lighthouse {
            vec![self.underlay_port]
        } else {
            Vec::new()
        }
    }
}

pub fn validate_port_bindings(mode: NetworkMode, ports: &[u16]) -> Result<()> {
    if mode == NetworkMode::Pod && !ports.is_empty() {
        return Err(Error::Validation(
            "workloads that use pod networking cannot bind direct ports".into(),
        ));
    }
    Ok(())
}

/// Remote path of an endpoint's rendered config
pub fn config_path(config_dir: &str, network_name: &str, interface: &str) -> String {
    format!(
        "{}/{}/{}.json",
        config_dir.trim_end_matches('/'),
        network_name,
        interface
    )
}

/// Build the deployable action set for `endpoint` on `target`
pub fn attach(
    endpoint: &EndpointOutputs,
    network_name: &str,
    topology: &Topology,
    target: &AttachTarget,
) -> Result<ActionSet> {
    validate_port_bindings(target.network_mode, &target.direct_ports())?;

    let config = compile(endpoint, topology, target.is_lighthouse, target.underlay_port);
    let document = config.render()?;
    let interface = interface_name(&endpoint.network_id, &endpoint.fqdn());
    let path = config_path(&target.config_dir, network_name, &interface);
    let service = format!("{}{}", target.service_prefix, interface);
    debug!("Attaching {} as {} via {}", endpoint.fqdn(), service, path);

    let digest = trigger_digest(document.as_bytes());
    Ok(ActionSet::new(
        target.connection.clone(),
        vec![
            Action::upload(document, path),
            Action::reversible(
                format!(
                    "systemctl daemon-reload && systemctl enable --now {svc} && systemctl restart {svc}",
                    svc = service
                ),
                format!(
                    "systemctl disable --now {} && systemctl daemon-reload",
                    service
                ),
            ),
        ],
    )
    .with_trigger(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_common::{FirewallPolicy, FirewallRule, Lighthouse, Port};
    use std::net::Ipv4Addr;

    fn endpoint(firewall: FirewallPolicy) -> EndpointOutputs {
        EndpointOutputs {
            endpoint_id: "e1".into(),
            network_id: "4c1e0b52-aaaa".into(),
            network_prefix_len: 24,
            domain: "skein.internal".into(),
            hostname: "backend".into(),
            groups: vec!["app".into()],
            firewall: firewall.with_lighthouse_dns(),
            overlay_ip: Ipv4Addr::new(10, 0, 1, 2),
            private_key: "KEY".into(),
            certificate: "CERT".into(),
            signing_epoch: 1,
        }
    }

    fn topology() -> Topology {
        Topology {
            trusted_cas: "CA".into(),
            lighthouses: vec![Lighthouse {
                overlay_ip: Ipv4Addr::new(10, 0, 1, 1),
                underlay_host: "203.0.113.7".into(),
                underlay_port: 30000,
            }],
            log_level: "info".into(),
        }
    }

    fn target(is_lighthouse: bool, network_mode: NetworkMode) -> AttachTarget {
        AttachTarget {
            connection: ConnectionParams::with_password("node1", "root", "pw"),
            is_lighthouse,
            underlay_port: 30001,
            config_dir: "/etc/skein".into(),
            service_prefix: "skein-".into(),
            network_mode,
        }
    }

    #[test]
    fn test_attach_uploads_config_and_restarts_service() {
        let set = attach(
            &endpoint(FirewallPolicy::default()),
            "mesh",
            &topology(),
            &target(false, NetworkMode::Host),
        )
        .unwrap();

        assert_eq!(set.actions.len(), 2);
        match &set.actions[0] {
            Action::Upload {
                content,
                remote_path,
            } => {
                assert_eq!(remote_path, "/etc/skein/mesh/sk4c1e0backends.json");
                let value: serde_json::Value = serde_json::from_str(content).unwrap();
                assert_eq!(value["listen"]["port"], 30001);
            }
            other => panic!("expected upload, got {:?}", other),
        }
        match &set.actions[1] {
            Action::Command { create, delete } => {
                assert!(create.contains("systemctl restart skein-sk4c1e0backends"));
                assert_eq!(
                    delete.as_deref(),
                    Some("systemctl disable --now skein-sk4c1e0backends && systemctl daemon-reload")
                );
            }
            other => panic!("expected command, got {:?}", other),
        }
        assert_eq!(set.triggers.len(), 1);
    }

    #[test]
    fn test_config_change_changes_trigger() {
        let t = target(false, NetworkMode::Host);
        let before = attach(&endpoint(FirewallPolicy::default()), "mesh", &topology(), &t).unwrap();
        let again = attach(&endpoint(FirewallPolicy::default()), "mesh", &topology(), &t).unwrap();
        assert_eq!(before, again);

        let opened = FirewallPolicy {
            inbound: vec![FirewallRule::host("any", Port::Number(443))],
            outbound: vec![],
        };
        let after = attach(&endpoint(opened), "mesh", &topology(), &t).unwrap();
        assert_ne!(before.triggers, after.triggers);
        assert_ne!(before.fingerprint().unwrap(), after.fingerprint().unwrap());
    }

    #[test]
    fn test_pod_networking_rejects_direct_ports() {
        let ep = endpoint(FirewallPolicy::default());
        let err = attach(&ep, "mesh", &topology(), &target(true, NetworkMode::Pod)).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("pod networking")));

        assert!(attach(&ep, "mesh", &topology(), &target(false, NetworkMode::Pod)).is_ok());
        assert!(attach(&ep, "mesh", &topology(), &target(true, NetworkMode::Bridge)).is_ok());
    }
}
