//! Environment-variable issuance protocol
//!
//! `MANAGER_MODE` (`ca` or `host`) and `MANAGER_TARGET` (`key` or `cert`)
//! select the operation; inputs arrive as PEM or JSON in the remaining
//! variables. The requested PEM is the only output.

use super::{generate_ca_key, generate_host_key, sign_ca, sign_host, CaConfig, CertConfig};
use skein_common::{Error, Result};

pub const MODE: &str = "MANAGER_MODE";
pub const TARGET: &str = "MANAGER_TARGET";
pub const CA_KEY: &str = "CA_KEY";
pub const CA_CERT: &str = "CA_CERT";
pub const HOST_KEY: &str = "HOST_KEY";
pub const CA_CONFIG: &str = "CA_CONFIG";
pub const CERT_CONFIG: &str = "CERT_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ca,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Key,
    Cert,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ca => "ca",
            Mode::Host => "host",
        }
    }
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Key => "key",
            Target::Cert => "cert",
        }
    }
}

fn required(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    env(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{} is not set", name)))
}

fn json<T: serde::de::DeserializeOwned>(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<T> {
    let raw = required(env, name)?;
    serde_json::from_str(&raw).map_err(|e| Error::Config(format!("{} is malformed: {}", name, e)))
}

/// Handle one request whose variables are looked up through `env`
pub fn handle(env: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mode = match required(env, MODE)?.as_str() {
        "ca" => Mode::Ca,
        "host" => Mode::Host,
        other => return Err(Error::Config(format!("unknown {}: {}", MODE, other))),
    };
    let target = match required(env, TARGET)?.as_str() {
        "key" => Target::Key,
        "cert" => Target::Cert,
        other => return Err(Error::Config(format!("unknown {}: {}", TARGET, other))),
    };

    match (mode, target) {
        (Mode::Ca, Target::Key) => Ok(generate_ca_key()),
        (Mode::Ca, Target::Cert) => {
            let config: CaConfig = json(env, CA_CONFIG)?;
            sign_ca(&required(env, CA_KEY)?, &config)
        }
        (Mode::Host, Target::Key) => Ok(generate_host_key()),
        (Mode::Host, Target::Cert) => {
            let config: CertConfig = json(env, CERT_CONFIG)?;
            sign_host(
                &required(env, CA_KEY)?,
                &required(env, CA_CERT)?,
                &required(env, HOST_KEY)?,
                &config,
            )
        }
    }
}
