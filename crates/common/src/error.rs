//! Error types for Skein

use thiserror::Error;

/// Result type alias using Skein Error
pub type Result<T> = std::result::Result<T, Error>;

/// Skein error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The allocator has no free address or port left in a scope
    #[error("Allocation scope {scope} exhausted: no free {resource}")]
    Exhaustion { scope: String, resource: String },

    /// A create-path remote command exited non-zero
    #[error("Command `{command}` exited with status {exit_code}: {stderr}")]
    Provisioning {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// SSH session could not be established
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Missing or malformed connection parameters or settings
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    /// A failure attributed to one reconciled resource
    #[error("{urn}: {source}")]
    Resource {
        urn: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Attach the identifier of the resource whose operation failed
    pub fn for_resource(self, urn: impl Into<String>) -> Self {
        match self {
            already @ Error::Resource { .. } => already,
            other => Error::Resource {
                urn: urn.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping resource attribution
    pub fn root(&self) -> &Error {
        match self {
            Error::Resource { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_exhaustion(&self) -> bool {
        matches!(self.root(), Error::Exhaustion { .. })
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Crypto(format!("malformed certificate: {}", e))
    }
}

impl From<pem::PemError> for Error {
    fn from(e: pem::PemError) -> Self {
        Error::Crypto(format!("malformed PEM: {}", e))
    }
}
