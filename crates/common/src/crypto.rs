//! Cryptographic utilities for Skein
//!
//! Ed25519 keys sign certificates, X25519 keys are the endpoint's
//! Diffie-Hellman identity. Both are stored as PEM blocks in the layout
//! the mesh agent reads.

use crate::{Error, Result};
use ed25519_dalek::{
    Signature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey,
};
use pem::{EncodeConfig, LineEnding, Pem};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};

pub const ED25519_PRIVATE_KEY_TAG: &str = "NEBULA ED25519 PRIVATE KEY";
pub const X25519_PRIVATE_KEY_TAG: &str = "NEBULA X25519 PRIVATE KEY";
pub const X25519_PUBLIC_KEY_TAG: &str = "NEBULA X25519 PUBLIC KEY";

/// Encode one PEM block with LF line endings
pub fn encode_pem(tag: &str, contents: Vec<u8>) -> String {
    pem::encode_config(
        &Pem::new(tag, contents),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

/// Decode one PEM block and check its tag
pub fn decode_pem(tag: &str, input: &str) -> Result<Vec<u8>> {
    let block = pem::parse(input.trim())?;
    if block.tag() != tag {
        return Err(Error::Crypto(format!(
            "expected PEM block {}, found {}",
            tag,
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

// ============================================================================
// Ed25519 (certificate signing)
// ============================================================================

/// Ed25519 key pair for signing
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Parse a PEM private key (64 bytes: seed followed by public key)
    pub fn from_pem(input: &str) -> Result<Self> {
        let bytes = decode_pem(ED25519_PRIVATE_KEY_TAG, input)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("Invalid Ed25519 private key length".to_string()))?;
        let signing_key = SigningKey::from_keypair_bytes(&bytes)?;
        Ok(Self { signing_key })
    }

    pub fn to_pem(&self) -> String {
        encode_pem(
            ED25519_PRIVATE_KEY_TAG,
            self.signing_key.to_keypair_bytes().to_vec(),
        )
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Trait for types that can sign data
pub trait Signer {
    /// Sign the given data
    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

impl Signer for KeyPair {
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

/// Trait for types that can verify signatures
pub trait Verifier {
    /// Verify a signature
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()>;
}

impl Verifier for VerifyingKey {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::Crypto("Invalid signature length".to_string()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        DalekVerifier::verify(self, data, &sig)?;
        Ok(())
    }
}

impl Verifier for KeyPair {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        Verifier::verify(&self.verifying_key(), data, signature)
    }
}

/// Create a verifying key from raw bytes
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("Invalid public key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Crypto(e.to_string()))
}

// ============================================================================
// X25519 (endpoint identity)
// ============================================================================

/// X25519 key pair held by one endpoint
#[derive(Clone)]
pub struct ExchangeKeyPair {
    secret: StaticSecret,
}

impl ExchangeKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_pem(input: &str) -> Result<Self> {
        let bytes = decode_pem(X25519_PRIVATE_KEY_TAG, input)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("Invalid X25519 private key length".to_string()))?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    pub fn to_pem(&self) -> String {
        encode_pem(X25519_PRIVATE_KEY_TAG, self.secret.to_bytes().to_vec())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        ExchangePublicKey::from(&self.secret).to_bytes()
    }

    pub fn public_key_pem(&self) -> String {
        encode_pem(X25519_PUBLIC_KEY_TAG, self.public_key_bytes().to_vec())
    }
}

impl std::fmt::Debug for ExchangeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}
