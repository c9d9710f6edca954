//! Mesh agent configuration compiler
//!
//! A pure function from an endpoint, its network's topology and its role to
//! the agent's configuration document. Maps are ordered and the document is
//! serialized with a fixed field order, so equal inputs give byte-identical
//! output.

use crate::resources::endpoint::EndpointOutputs;
use serde::{Deserialize, Serialize};
use skein_common::{FirewallRule, Lighthouse, Port, Proto, Result, DNS_PORT};
use std::collections::BTreeMap;

/// Literal prefix of every virtual interface name
pub const INTERFACE_PREFIX: &str = "sk";

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME: usize = 15;

/// Network-wide inputs shared by every endpoint's config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// PEM bundle of trusted CAs, current epoch first
    pub trusted_cas: String,
    pub lighthouses: Vec<Lighthouse>,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub pki: PkiSection,
    pub static_host_map: BTreeMap<String, Vec<String>>,
    pub lighthouse: LighthouseSection,
    pub listen: ListenSection,
    pub punchy: PunchySection,
    pub tun: TunSection,
    pub firewall: FirewallSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiSection {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LighthouseSection {
    pub am_lighthouse: bool,
    pub hosts: Vec<String>,
    pub serve_dns: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSection {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenSection {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchySection {
    pub punch: bool,
    pub respond: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunSection {
    pub disabled: bool,
    pub dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSection {
    pub outbound: Vec<CompiledRule>,
    pub inbound: Vec<CompiledRule>,
}

/// Firewall rule in the agent's schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub port: Port,
    pub proto: Proto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    pub level: String,
}

impl AgentConfig {
    /// Deterministic serialized document
    pub fn render(&self) -> Result<String> {
        let mut document = serde_json::to_string_pretty(self)?;
        document.push('\n');
        Ok(document)
    }
}

fn strip_separators(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Virtual interface name: prefix, 5 chars of network id, 8 of hostname
pub fn interface_name(network_id: &str, hostname: &str) -> String {
    let network: String = strip_separators(network_id).chars().take(5).collect();
    let host: String = strip_separators(hostname).chars().take(8).collect();
    let mut name = format!("{}{}{}", INTERFACE_PREFIX, network, host);
    name.truncate(MAX_INTERFACE_NAME);
    name
}

/// Qualify host targets with the DNS domain and default the protocol
pub fn compile_rule(rule: &FirewallRule, domain: &str) -> CompiledRule {
    match rule {
        FirewallRule::Host(rule) => CompiledRule {
            port: rule.port,
            proto: rule.proto.unwrap_or_default(),
            host: Some(if rule.host == "any" {
                "any".to_string()
            } else {
                format!("{}.{}", rule.host, domain)
            }),
            groups: None,
        },
        FirewallRule::Group(rule) => CompiledRule {
            port: rule.port,
            proto: rule.proto.unwrap_or_default(),
            host: None,
            groups: Some(rule.groups.clone()),
        },
    }
}

/// Compile the agent configuration of one endpoint
pub fn compile(
    endpoint: &EndpointOutputs,
    topology: &Topology,
    is_lighthouse: bool,
    underlay_port: u16,
) -> AgentConfig {
    let static_host_map = if is_lighthouse {
        BTreeMap::new()
    } else {
        topology
            .lighthouses
            .iter()
            .map(|lh| (lh.overlay_ip.to_string(), vec![lh.underlay_address()]))
            .collect()
    };

    let hosts = if is_lighthouse {
        Vec::new()
    } else {
        topology
            .lighthouses
            .iter()
            .map(|lh| lh.overlay_ip.to_string())
            .collect()
    };

    let compile_all = |rules: &[FirewallRule]| -> Vec<CompiledRule> {
        rules
            .iter()
            .map(|rule| compile_rule(rule, &endpoint.domain))
            .collect()
    };

    AgentConfig {
        pki: PkiSection {
            ca: topology.trusted_cas.clone(),
            cert: endpoint.certificate.clone(),
            key: endpoint.private_key.clone(),
        },
        static_host_map,
        lighthouse: LighthouseSection {
            am_lighthouse: is_lighthouse,
            hosts,
            serve_dns: is_lighthouse,
            dns: is_lighthouse.then(|| DnsSection {
                host: endpoint.overlay_ip.to_string(),
                port: DNS_PORT,
            }),
        },
        listen: ListenSection {
            host: "::".to_string(),
            port: underlay_port,
        },
        punchy: PunchySection {
            punch: true,
            respond: true,
        },
        tun: TunSection {
            disabled: false,
            dev: interface_name(&endpoint.network_id, &endpoint.fqdn()),
        },
        firewall: FirewallSection {
            outbound: compile_all(&endpoint.firewall.outbound),
            inbound: compile_all(&endpoint.firewall.inbound),
        },
        logging: LoggingSection {
            level: topology.log_level.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_common::{FirewallPolicy, GroupRule, HostRule};
    use std::net::Ipv4Addr;

    fn endpoint(firewall: FirewallPolicy) -> EndpointOutputs {
        EndpointOutputs {
            endpoint_id: "0f8e3c2a-1111-2222-3333-444455556666".into(),
            network_id: "9b1d-77aa-42".into(),
            network_prefix_len: 24,
            domain: "skein.internal".into(),
            hostname: "backend-api".into(),
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
            trusted_cas: "CA2CA1".into(),
            lighthouses: vec![Lighthouse {
                overlay_ip: Ipv4Addr::new(10, 0, 1, 1),
                underlay_host: "203.0.113.7".into(),
                underlay_port: 30000,
            }],
            log_level: "info".into(),
        }
    }

    #[test]
    fn test_member_config() {
        let ep = endpoint(FirewallPolicy::default());
        let config = compile(&ep, &topology(), false, 30004);

        assert_eq!(config.pki.ca, "CA2CA1");
        assert_eq!(config.pki.cert, "CERT");
        assert_eq!(
            config.static_host_map.get("10.0.1.1"),
            Some(&vec!["203.0.113.7:30000".to_string()])
        );
        assert_eq!(config.lighthouse.hosts, vec!["10.0.1.1"]);
        assert!(!config.lighthouse.am_lighthouse);
        assert!(!config.lighthouse.serve_dns);
        assert!(config.lighthouse.dns.is_none());
        assert_eq!(config.listen.host, "::");
        assert_eq!(config.listen.port, 30004);
        assert!(config.punchy.punch && config.punchy.respond);
        assert!(!config.tun.disabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_lighthouse_config() {
        let ep = endpoint(FirewallPolicy {
            inbound: vec![FirewallRule::host("any", Port::Number(53))],
            outbound: vec![],
        });
        let config = compile(&ep, &topology(), true, 30000);

        assert!(config.static_host_map.is_empty());
        assert!(config.lighthouse.hosts.is_empty());
        assert!(config.lighthouse.am_lighthouse);
        assert!(config.lighthouse.serve_dns);
        assert_eq!(
            config.lighthouse.dns,
            Some(DnsSection {
                host: "10.0.1.2".into(),
                port: 53
            })
        );
    }

    #[test]
    fn test_firewall_rules_compiled() {
        let ep = endpoint(FirewallPolicy {
            inbound: vec![
                FirewallRule::host("any", Port::Number(80)),
                FirewallRule::Host(HostRule {
                    host: "db".into(),
                    port: Port::Any,
                    proto: Some(Proto::Tcp),
                }),
                FirewallRule::Group(GroupRule {
                    groups: vec!["ops".into(), "admin".into()],
                    port: Port::Number(22),
                    proto: None,
                }),
            ],
            outbound: vec![],
        });
        let config = compile(&ep, &topology(), false, 30001);

        assert_eq!(
            config.firewall.inbound,
            vec![
                CompiledRule {
                    port: Port::Number(80),
                    proto: Proto::Any,
                    host: Some("any".into()),
                    groups: None,
                },
                CompiledRule {
                    port: Port::Any,
                    proto: Proto::Tcp,
                    host: Some("db.skein.internal".into()),
                    groups: None,
                },
                CompiledRule {
                    port: Port::Number(22),
                    proto: Proto::Any,
                    host: None,
                    groups: Some(vec!["ops".into(), "admin".into()]),
                },
            ]
        );
        assert_eq!(
            config.firewall.outbound,
            vec![CompiledRule {
                port: Port::Number(53),
                proto: Proto::Any,
                host: None,
                groups: Some(vec!["lighthouses".into()]),
            }]
        );
    }

    #[test]
    fn test_interface_name() {
        let name = interface_name("9b1d-77aa-42", "backend-api.skein.internal");
        assert_eq!(name, "sk9b1d7backenda");
        assert!(name.len() <= MAX_INTERFACE_NAME);
        assert_eq!(interface_name("ab", "c"), "skabc");
    }

    #[test]
    fn test_render_is_deterministic() {
        let ep = endpoint(FirewallPolicy::default());
        let mut topo = topology();
        topo.lighthouses.push(Lighthouse {
            overlay_ip: Ipv4Addr::new(10, 0, 1, 3),
            underlay_host: "203.0.113.8".into(),
            underlay_port: 30000,
        });

        let first = compile(&ep, &topo, false, 30001).render().unwrap();
        let second = compile(&ep, &topo, false, 30001).render().unwrap();
        assert_eq!(first, second);

        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["firewall"]["outbound"][0]["port"], 53);
        assert_eq!(value["firewall"]["outbound"][0]["proto"], "any");
        assert!(value["lighthouse"].get("dns").is_none());
    }
}
