//! Oplog Entry Types
//!
//! The oplog records every write a master accepts, in the order it was
//! accepted. Entries are immutable once appended; a slave only ever copies
//! entries from the master's log and applies them in position order.

use serde::{Deserialize, Serialize};

use crate::storage::Operation;

/// Oplog position - strictly increasing per master, never reused
pub type Position = u64;

/// A single replicated write operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Position in the master's log
    pub position: Position,
    /// Master epoch at the time the entry was written
    pub epoch: u64,
    /// Target namespace ("db.collection")
    pub namespace: String,
    /// The operation payload
    pub op: Operation,
    /// When the master accepted the write
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OplogEntry {
    pub fn new(position: Position, epoch: u64, namespace: String, op: Operation) -> Self {
        Self {
            position,
            epoch,
            namespace,
            op,
            timestamp: chrono::Utc::now(),
        }
    }
}
