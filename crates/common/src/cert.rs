//! Mesh certificates
//!
//! Wire-compatible with the Nebula v1 certificate: a protobuf envelope of
//! details plus an Ed25519 signature over the encoded details. Overlay
//! addresses are carried as `(ip, mask)` u32 pairs and the issuer is the
//! SHA-256 of the signing CA's encoded certificate.

use crate::crypto::{sha256, verifying_key_from_bytes, KeyPair, Signer, Verifier};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use ipnetwork::Ipv4Network;
use prost::Message;
use std::net::Ipv4Addr;

pub const CERTIFICATE_TAG: &str = "NEBULA CERTIFICATE";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RawCertificate {
    #[prost(message, optional, tag = "1")]
    pub details: Option<RawCertificateDetails>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RawCertificateDetails {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, repeated, tag = "2")]
    pub ips: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub subnets: Vec<u32>,
    #[prost(string, repeated, tag = "4")]
    pub groups: Vec<String>,
    #[prost(int64, tag = "5")]
    pub not_before: i64,
    #[prost(int64, tag = "6")]
    pub not_after: i64,
    #[prost(bytes = "vec", tag = "7")]
    pub public_key: Vec<u8>,
    #[prost(bool, tag = "8")]
    pub is_ca: bool,
    #[prost(bytes = "vec", tag = "9")]
    pub issuer: Vec<u8>,
    #[prost(enumeration = "Curve", tag = "100")]
    pub curve: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Curve {
    Curve25519 = 0,
    P256 = 1,
}

// ============================================================================
// Certificate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    pub name: String,
    pub ips: Vec<Ipv4Network>,
    pub subnets: Vec<Ipv4Network>,
    pub groups: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    /// Hex SHA-256 of the signing certificate; empty when self-signed
    pub issuer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshCertificate {
    pub details: CertificateDetails,
    pub signature: Vec<u8>,
}

fn encode_networks(networks: &[Ipv4Network]) -> Vec<u32> {
    networks
        .iter()
        .flat_map(|net| [u32::from(net.ip()), u32::from(net.mask())])
        .collect()
}

fn decode_networks(pairs: &[u32]) -> Result<Vec<Ipv4Network>> {
    if pairs.len() % 2 != 0 {
        return Err(Error::Crypto("encoded addresses must be ip/mask pairs".into()));
    }
    pairs
        .chunks(2)
        .map(|pair| {
            let ip = Ipv4Addr::from(pair[0]);
            let mask = Ipv4Addr::from(pair[1]);
            Ipv4Network::with_netmask(ip, mask)
                .map_err(|e| Error::Crypto(format!("invalid mask {}: {}", mask, e)))
        })
        .collect()
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::Crypto(format!("timestamp out of range: {}", secs)))
}

impl CertificateDetails {
    fn to_raw(&self) -> Result<RawCertificateDetails> {
        let issuer = hex::decode(&self.issuer)
            .map_err(|e| Error::Crypto(format!("invalid issuer: {}", e)))?;
        Ok(RawCertificateDetails {
            name: self.name.clone(),
            ips: encode_networks(&self.ips),
            subnets: encode_networks(&self.subnets),
            groups: self.groups.clone(),
            not_before: self.not_before.timestamp(),
            not_after: self.not_after.timestamp(),
            public_key: self.public_key.clone(),
            is_ca: self.is_ca,
            issuer,
            curve: Curve::Curve25519 as i32,
        })
    }

    fn from_raw(raw: RawCertificateDetails) -> Result<Self> {
        if raw.curve != Curve::Curve25519 as i32 {
            return Err(Error::Crypto(format!("unsupported curve {}", raw.curve)));
        }
        Ok(Self {
            name: raw.name,
            ips: decode_networks(&raw.ips)?,
            subnets: decode_networks(&raw.subnets)?,
            groups: raw.groups,
            not_before: timestamp(raw.not_before)?,
            not_after: timestamp(raw.not_after)?,
            public_key: raw.public_key,
            is_ca: raw.is_ca,
            issuer: hex::encode(raw.issuer),
        })
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_raw()?.encode_to_vec())
    }
}

impl MeshCertificate {
    /// Sign `details` with `key`
    pub fn sign(mut details: CertificateDetails, key: &KeyPair) -> Result<Self> {
        // second precision on the wire
        details.not_before = timestamp(details.not_before.timestamp())?;
        details.not_after = timestamp(details.not_after.timestamp())?;
        let signature = key.sign(&details.encode()?);
        Ok(Self { details, signature })
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let raw = RawCertificate {
            details: Some(self.details.to_raw()?),
            signature: self.signature.clone(),
        };
        Ok(raw.encode_to_vec())
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let raw = RawCertificate::decode(bytes)?;
        let details = raw
            .details
            .ok_or_else(|| Error::Crypto("certificate has no details".into()))?;
        Ok(Self {
            details: CertificateDetails::from_raw(details)?,
            signature: raw.signature,
        })
    }

    pub fn to_pem(&self) -> Result<String> {
        Ok(crate::crypto::encode_pem(CERTIFICATE_TAG, self.marshal()?))
    }

    pub fn from_pem(input: &str) -> Result<Self> {
        Self::unmarshal(&crate::crypto::decode_pem(CERTIFICATE_TAG, input)?)
    }

    /// Parse every certificate of a concatenated PEM bundle, in order
    pub fn parse_bundle(input: &str) -> Result<Vec<Self>> {
        pem::parse_many(input)?
            .into_iter()
            .map(|block| {
                if block.tag() != CERTIFICATE_TAG {
                    return Err(Error::Crypto(format!("unexpected PEM block {}", block.tag())));
                }
                Self::unmarshal(block.contents())
            })
            .collect()
    }

    /// Hex SHA-256 of the encoded certificate
    pub fn fingerprint(&self) -> Result<String> {
        Ok(hex::encode(sha256(&self.marshal()?)))
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.details.not_before <= now && now <= self.details.not_after
    }

    /// Check the signature against the public key embedded in `signer`
    pub fn check_signature(&self, signer: &MeshCertificate) -> Result<()> {
        let key = verifying_key_from_bytes(&signer.details.public_key)?;
        Verifier::verify(&key, &self.details.encode()?, &self.signature)
    }

    /// Verify this certificate was issued by `ca` and both are valid at `now`
    pub fn verify(&self, ca: &MeshCertificate, now: DateTime<Utc>) -> Result<()> {
        if !ca.details.is_ca {
            return Err(Error::Crypto(format!("{} is not a CA", ca.details.name)));
        }
        if self.details.issuer != ca.fingerprint()? {
            return Err(Error::Crypto(format!(
                "{} was not issued by {}",
                self.details.name, ca.details.name
            )));
        }
        if !ca.is_valid_at(now) {
            return Err(Error::Crypto(format!("CA {} is expired", ca.details.name)));
        }
        if !self.is_valid_at(now) {
            return Err(Error::Crypto(format!(
                "certificate {} is outside its validity window",
                self.details.name
            )));
        }
        self.check_signature(ca)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExchangeKeyPair;
    use chrono::Duration;

    fn ca(name: &str) -> (KeyPair, MeshCertificate) {
        let key = KeyPair::generate();
        let now = Utc::now();
        let details = CertificateDetails {
            name: name.into(),
            ips: vec![],
            subnets: vec![],
            groups: vec![],
            not_before: now - Duration::minutes(5),
            not_after: now + Duration::days(7),
            public_key: key.public_key_bytes().to_vec(),
            is_ca: true,
            issuer: String::new(),
        };
        let cert = MeshCertificate::sign(details, &key).unwrap();
        (key, cert)
    }

    fn leaf(ca_key: &KeyPair, ca_cert: &MeshCertificate) -> MeshCertificate {
        let host = ExchangeKeyPair::generate();
        let now = Utc::now();
        let details = CertificateDetails {
            name: "backend".into(),
            ips: vec!["10.0.1.2/24".parse().unwrap()],
            subnets: vec![],
            groups: vec!["app".into()],
            not_before: now - Duration::minutes(5),
            not_after: now + Duration::days(1),
            public_key: host.public_key_bytes().to_vec(),
            is_ca: false,
            issuer: ca_cert.fingerprint().unwrap(),
        };
        MeshCertificate::sign(details, ca_key).unwrap()
    }

    #[test]
    fn test_self_signed_ca_verifies() {
        let (_, cert) = ca("mesh-1");
        assert!(cert.check_signature(&cert).is_ok());
        let parsed = MeshCertificate::from_pem(&cert.to_pem().unwrap()).unwrap();
        assert_eq!(parsed, cert);
    }

    #[test]
    fn test_leaf_keeps_address_and_groups() {
        let (key, ca_cert) = ca("mesh-1");
        let cert = leaf(&key, &ca_cert);
        let parsed = MeshCertificate::from_pem(&cert.to_pem().unwrap()).unwrap();

        assert_eq!(parsed.details.ips[0].ip(), Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(parsed.details.ips[0].prefix(), 24);
        assert_eq!(parsed.details.groups, vec!["app"]);
        assert!(parsed.verify(&ca_cert, Utc::now()).is_ok());
    }

    #[test]
    fn test_leaf_rejected_by_other_ca() {
        let (key, ca_cert) = ca("mesh-1");
        let (_, other) = ca("mesh-2");
        let cert = leaf(&key, &ca_cert);
        assert!(cert.verify(&other, Utc::now()).is_err());
    }

    #[test]
    fn test_tampered_details_fail_signature() {
        let (key, ca_cert) = ca("mesh-1");
        let mut cert = leaf(&key, &ca_cert);
        cert.details.groups.push("admin".into());
        assert!(cert.check_signature(&ca_cert).is_err());
    }

    #[test]
    fn test_bundle_parsing_preserves_order() {
        let (_, first) = ca("mesh-2");
        let (_, second) = ca("mesh-1");
        let bundle = format!("{}{}", first.to_pem().unwrap(), second.to_pem().unwrap());
        let parsed = MeshCertificate::parse_bundle(&bundle).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].details.name, "mesh-2");
        assert_eq!(parsed[1].details.name, "mesh-1");
    }
}
