//! `ca_epoch`: one certificate authority generation of a network
//!
//! A network at epoch E declares the two generations E-1 and E. Bumping the
//! epoch leaves E-1 in place as the previous CA, creates the new current one
//! and orphans E-2, which the driver then destroys.

use super::{changed_fields, Created, Diff, ResourceKind};
use crate::certs::{CaConfig, CertIssuer};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use skein_common::{CaIdentity, Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Clock skew tolerated at the start of every validity window
pub const CLOCK_SKEW_MINUTES: i64 = 5;

/// The two epochs a network trusts at epoch `epoch`, previous first
pub fn epoch_window(epoch: u64) -> Result<[u64; 2]> {
    if epoch == 0 {
        return Err(Error::Validation("network epoch must be at least 1".into()));
    }
    Ok([epoch - 1, epoch])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaEpochInputs {
    pub network_id: String,
    pub network_name: String,
    pub epoch: u64,
    pub validity_hours: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaEpochOutputs {
    pub network_id: String,
    pub epoch: u64,
    pub ca: CaIdentity,
}

pub struct CaEpochResource {
    issuer: Arc<dyn CertIssuer>,
}

impl CaEpochResource {
    pub fn new(issuer: Arc<dyn CertIssuer>) -> Self {
        Self { issuer }
    }
}

/// Self-signed CA for one epoch, valid from a few minutes ago
pub async fn create_ca(issuer: &dyn CertIssuer, network_name: &str, epoch: u64, validity_hours: i64) -> Result<CaIdentity> {
    let now = Utc::now();
    let config = CaConfig {
        name: format!("{} CA epoch {}", network_name, epoch),
        valid_not_before: now - Duration::minutes(CLOCK_SKEW_MINUTES),
        valid_not_after: now + Duration::hours(validity_hours),
    };
    issuer.create_ca(epoch, &config).await
}

#[async_trait]
impl ResourceKind for CaEpochResource {
    type Inputs = CaEpochInputs;
    type Outputs = CaEpochOutputs;

    fn type_name() -> &'static str {
        "ca_epoch"
    }

    async fn create(&self, inputs: &CaEpochInputs) -> Result<Created<CaEpochOutputs>> {
        let ca = create_ca(
            self.issuer.as_ref(),
            &inputs.network_name,
            inputs.epoch,
            inputs.validity_hours,
        )
        .await?;
        Ok(Created {
            id: format!("{}/{}", inputs.network_id, inputs.epoch),
            outputs: CaEpochOutputs {
                network_id: inputs.network_id.clone(),
                epoch: inputs.epoch,
                ca,
            },
        })
    }

    fn diff(&self, _id: &str, old: &CaEpochOutputs, new: &CaEpochInputs) -> Result<Diff> {
        // validity is fixed at creation
        Ok(Diff::replace_all(changed_fields(old, new, &["network_id", "epoch"])?))
    }

    async fn delete(&self, id: &str, _outputs: &CaEpochOutputs) -> Result<()> {
        // issued certificates are not revoked; they stop being trusted
        info!("Retired CA {}", id);
        Ok(())
    }
}

/// The trusted CA pair of a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCas {
    previous: CaIdentity,
    current: CaIdentity,
}

impl NetworkCas {
    pub fn new(previous: CaIdentity, current: CaIdentity) -> Result<Self> {
        if previous.epoch + 1 != current.epoch {
            return Err(Error::Validation(format!(
                "CA epochs {} and {} are not consecutive",
                previous.epoch, current.epoch
            )));
        }
        Ok(Self { previous, current })
    }

    /// Generate both generations for `epoch`
    pub async fn generate(issuer: &dyn CertIssuer, network_name: &str, epoch: u64, validity_hours: i64) -> Result<Self> {
        let [previous, current] = epoch_window(epoch)?;
        debug!("Generating CAs {} and {} for {}", previous, current, network_name);
        Self::new(
            create_ca(issuer, network_name, previous, validity_hours).await?,
            create_ca(issuer, network_name, current, validity_hours).await?,
        )
    }

    pub fn epoch(&self) -> u64 {
        self.current.epoch
    }

    pub fn current(&self) -> &CaIdentity {
        &self.current
    }

    pub fn previous(&self) -> &CaIdentity {
        &self.previous
    }

    /// Both identities, previous first
    pub fn identities(&self) -> [&CaIdentity; 2] {
        [&self.previous, &self.current]
    }

    /// PEM bundle every agent trusts, current CA first
    pub fn trust_bundle(&self) -> String {
        let mut bundle = self.current.certificate.clone();
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(&self.previous.certificate);
        bundle
    }

    /// Whether a certificate signed at `signing_epoch` is still trusted
    pub fn trusts_epoch(&self, signing_epoch: u64) -> bool {
        signing_epoch == self.previous.epoch || signing_epoch == self.current.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::LocalIssuer;
    use skein_common::MeshCertificate;

    #[tokio::test]
    async fn test_network_holds_two_generations() {
        let issuer = LocalIssuer::new();
        for epoch in [1, 2, 7] {
            let cas = NetworkCas::generate(&issuer, "mesh", epoch, 168).await.unwrap();
            let [previous, current] = cas.identities();
            assert_eq!(previous.epoch, epoch - 1);
            assert_eq!(current.epoch, epoch);
            assert_eq!(cas.current().epoch, cas.epoch());
            assert_ne!(previous.certificate, current.certificate);

            let bundle = MeshCertificate::parse_bundle(&cas.trust_bundle()).unwrap();
            assert_eq!(bundle.len(), 2);
            assert_eq!(bundle[0].details.name, format!("mesh CA epoch {}", epoch));
            assert!(bundle.iter().all(|cert| cert.details.is_ca));
        }
    }

    #[tokio::test]
    async fn test_validity_window() {
        let issuer = LocalIssuer::new();
        let before = Utc::now();
        let ca = create_ca(&issuer, "mesh", 1, 168).await.unwrap();
        let cert = MeshCertificate::from_pem(&ca.certificate).unwrap();

        assert!(cert.details.not_before <= before - Duration::minutes(4));
        assert!(cert.details.not_after >= before + Duration::hours(167));
        assert!(cert.is_valid_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_epoch_resource() {
        let kind = CaEpochResource::new(Arc::new(LocalIssuer::new()));
        let inputs = CaEpochInputs {
            network_id: "net".into(),
            network_name: "mesh".into(),
            epoch: 3,
            validity_hours: 168,
        };
        let created = kind.create(&inputs).await.unwrap();
        assert_eq!(created.id, "net/3");
        assert_eq!(created.outputs.ca.epoch, 3);

        let longer = CaEpochInputs {
            validity_hours: 1000,
            ..inputs.clone()
        };
        assert!(kind.diff(&created.id, &created.outputs, &longer).unwrap().is_noop());

        let moved = CaEpochInputs {
            network_id: "other".into(),
            ..inputs
        };
        assert_eq!(
            kind.diff(&created.id, &created.outputs, &moved).unwrap().replace_keys,
            vec!["network_id"]
        );
    }

    #[test]
    fn test_epoch_window() {
        assert_eq!(epoch_window(1).unwrap(), [0, 1]);
        assert!(matches!(epoch_window(0), Err(Error::Validation(_))));
    }
}
