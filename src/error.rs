//! PairDB Error Types

use thiserror::Error;

/// Result type alias for PairDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// PairDB error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Guard errors
    #[error("not master")]
    NotMaster,

    #[error("not master and slave not synced (state: {0})")]
    SlaveNotSynced(String),

    // Oplog errors
    #[error("Oplog truncated: position {requested} no longer available (oldest retained: {oldest})")]
    OplogTruncated { requested: u64, oldest: u64 },

    #[error("Oplog serialization error: {0}")]
    OplogSerialization(#[from] bincode::Error),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Stale replication session: epoch {session} behind master epoch {current}")]
    StaleEpoch { session: u64, current: u64 },

    #[error("Resync failed after {attempts} restarts")]
    ResyncExhausted { attempts: u32 },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient network condition, recovered by
    /// the next heartbeat tick rather than escalated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error forces a full initial copy instead of
    /// incremental catch-up.
    pub fn requires_full_resync(&self) -> bool {
        matches!(self, Error::OplogTruncated { .. })
    }
}
