//! Corral Error Types

use thiserror::Error;

/// Result type alias for Corral operations
pub type Result<T> = std::result::Result<T, Error>;

/// Corral error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Clustering preconditions
    #[error("This server is already clustered")]
    AlreadyClustered,

    #[error("This server is not clustered")]
    NotClustered,

    #[error("Not the cluster leader; leader is at {0}")]
    NotLeader(String),

    #[error("No leader address found")]
    NoLeader,

    // Membership uniqueness
    #[error("Cluster member name {0:?} already exists")]
    NameExists(String),

    #[error("Cluster member address {0:?} already exists")]
    AddressExists(String),

    #[error("Cluster member {0:?} not found")]
    MemberNotFound(String),

    // Join validation
    #[error("Member schema version {member} is behind cluster schema version {cluster}")]
    SchemaMismatch { member: u64, cluster: u64 },

    #[error("Mismatching {kind} for {entity} {name:?}: {reason}")]
    ConfigMismatch {
        kind: String,
        entity: String,
        name: String,
        reason: String,
    },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    // Trust
    #[error("Join token is invalid, expired or already used")]
    TokenInvalid,

    #[error("Certificate error: {0}")]
    Certificate(String),

    // Fan-out / transport
    #[error("Peer {address} is unreachable: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("Transient transport failure: {0}")]
    Transient(String),

    // Replicated store
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Replicated store error: {0}")]
    Store(String),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Catch-all for operator mistakes surfaced over the API
    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::PeerUnreachable { .. } | Error::NoLeader
        )
    }

    /// Check if this error means the request must be re-issued against the leader
    pub fn is_leader_redirect(&self) -> bool {
        matches!(self, Error::NotLeader(_))
    }

    /// Check if this error came from a failed peer connection
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::PeerUnreachable { .. } | Error::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(Error::PeerUnreachable {
            address: "10.0.0.2:8443".into(),
            reason: "connection refused".into()
        }
        .is_retryable());
        assert!(!Error::AlreadyClustered.is_retryable());
        assert!(!Error::TokenInvalid.is_retryable());
    }

    #[test]
    fn test_leader_redirect() {
        assert!(Error::NotLeader("10.0.0.1:8443".into()).is_leader_redirect());
        assert!(!Error::NoLeader.is_leader_redirect());
    }
}
