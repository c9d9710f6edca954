//! Issuer that shells out to `skein-certs`

use super::protocol::{self, Mode, Target};
use super::{CaConfig, CertConfig, CertIssuer};
use async_trait::async_trait;
use skein_common::{CaIdentity, Error, LeafIdentity, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

pub struct SubprocessIssuer {
    binary: PathBuf,
}

impl SubprocessIssuer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, mode: Mode, target: Target, vars: &[(&str, String)]) -> Result<String> {
        debug!(
            "Running {} ({}/{})",
            self.binary.display(),
            mode.as_str(),
            target.as_str()
        );

        let output = Command::new(&self.binary)
            .env(protocol::MODE, mode.as_str())
            .env(protocol::TARGET, target.as_str())
            .envs(vars.iter().map(|(k, v)| (*k, v.as_str())))
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Provisioning {
                command: format!("{} {}/{}", self.binary.display(), mode.as_str(), target.as_str()),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|e| Error::Crypto(format!("issuer output is not UTF-8: {}", e)))
    }
}

#[async_trait]
impl CertIssuer for SubprocessIssuer {
    async fn create_ca(&self, epoch: u64, config: &CaConfig) -> Result<CaIdentity> {
        let private_key = self.run(Mode::Ca, Target::Key, &[]).await?;
        let certificate = self
            .run(
                Mode::Ca,
                Target::Cert,
                &[
                    (protocol::CA_KEY, private_key.clone()),
                    (protocol::CA_CONFIG, serde_json::to_string(config)?),
                ],
            )
            .await?;
        info!("Created CA {} for epoch {}", config.name, epoch);
        Ok(CaIdentity {
            epoch,
            private_key,
            certificate,
        })
    }

    async fn issue(&self, ca: &CaIdentity, config: &CertConfig) -> Result<LeafIdentity> {
        let private_key = self.run(Mode::Host, Target::Key, &[]).await?;
        let certificate = self
            .run(
                Mode::Host,
                Target::Cert,
                &[
                    (protocol::CA_KEY, ca.private_key.clone()),
                    (protocol::CA_CERT, ca.certificate.clone()),
                    (protocol::HOST_KEY, private_key.clone()),
                    (protocol::CERT_CONFIG, serde_json::to_string(config)?),
                ],
            )
            .await?;
        info!("Issued certificate for {}", config.hostname);
        Ok(LeafIdentity {
            private_key,
            certificate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let issuer = SubprocessIssuer::new("/nonexistent/skein-certs");
        let err = issuer
            .create_ca(
                1,
                &CaConfig {
                    name: "x".into(),
                    valid_not_before: chrono::Utc::now(),
                    valid_not_after: chrono::Utc::now() + chrono::Duration::days(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_reports_stderr() {
        let issuer = SubprocessIssuer::new("false");
        let err = issuer
            .run(Mode::Ca, Target::Key, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provisioning { exit_code: 1, .. }));
    }
}
