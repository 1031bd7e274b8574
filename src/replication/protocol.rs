//! Pair Protocol
//!
//! Wire messages exchanged between the two data nodes, the arbiter, and
//! clients. Request/response over length-prefixed bincode frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::oplog::{OplogEntry, Position};
use crate::storage::{Document, SnapshotChunk};

/// What kind of process answered a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessKind {
    /// Data-holding pair member
    Data,
    /// Data-less tie-breaker
    Arbiter,
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Heartbeat / Role ==========
    /// Liveness probe, carrying the sender's self-reported role
    Heartbeat {
        from: String,
        role: i8,
        epoch: u64,
    },

    /// Probe answer with the target's self-report
    HeartbeatReply {
        kind: ProcessKind,
        role: i8,
        epoch: u64,
    },

    /// Role poll, answered by data nodes and the arbiter alike
    RoleQuery,

    /// Role answer: 1 master, 0 slave, -1 negotiating/no opinion
    RoleReply {
        role: i8,
        epoch: u64,
    },

    // ========== Oplog replication ==========
    /// Slave pull: entries strictly after `after`, tagged with the
    /// master epoch the slave believes it is following
    Pull {
        after: Position,
        epoch: u64,
        max_entries: usize,
    },

    /// Pull answer (empty when the slave is at the tail)
    PullReply {
        entries: Vec<OplogEntry>,
        last_position: Position,
    },

    // ========== Initial copy ==========
    /// Open a snapshot session against the master
    SnapshotStart,

    /// Snapshot session descriptor; `start_position` is the oplog
    /// position recorded at the moment the copy begins
    SnapshotStarted {
        session: Uuid,
        start_position: Position,
        total_chunks: u64,
    },

    /// Fetch one chunk of a snapshot session
    SnapshotFetch {
        session: Uuid,
        chunk: u64,
    },

    /// One chunk of namespace data
    SnapshotChunkReply {
        chunk: SnapshotChunk,
    },

    /// Close a snapshot session (completed or abandoned)
    SnapshotDone {
        session: Uuid,
    },

    // ========== Client data access ==========
    /// Insert a document
    Insert {
        client: Uuid,
        namespace: String,
        doc: Document,
    },

    /// Replace documents matching `query`
    Update {
        client: Uuid,
        namespace: String,
        query: Document,
        doc: Document,
        upsert: bool,
    },

    /// Remove documents matching `query`
    Remove {
        client: Uuid,
        namespace: String,
        query: Document,
    },

    /// Write acknowledged (the originating protocol also batches acks,
    /// so failures are additionally recorded for GetLastError)
    WriteReply {
        affected: usize,
    },

    /// Query documents
    Find {
        client: Uuid,
        namespace: String,
        query: Document,
        slave_ok: bool,
    },

    FindReply {
        docs: Vec<Document>,
    },

    /// Count matching documents
    Count {
        client: Uuid,
        namespace: String,
        query: Document,
        slave_ok: bool,
    },

    CountReply {
        count: usize,
    },

    /// Deferred error surface: last recorded write error for a client
    GetLastError {
        client: Uuid,
    },

    LastErrorReply {
        error: Option<String>,
    },

    /// Clear the client's recorded error
    ResetError {
        client: Uuid,
    },

    ResetErrorReply,

    // ========== Status ==========
    StatusRequest,

    StatusReply(Box<StatusReport>),

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Not the master
    NotMaster,
    /// Slave not yet synced (reads refused even with slave_ok)
    NotSynced,
    /// Requested oplog position evicted; full copy required
    OplogTruncated,
    /// Pull session tagged with an outdated master epoch
    StaleEpoch,
    /// Unknown snapshot session
    UnknownSession,
    /// Data operation sent to the arbiter
    ArbiterHoldsNoData,
    /// Internal error
    Internal,
}

/// Status answer shared by data nodes and the arbiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub address: String,
    pub kind: ProcessKind,
    pub role: i8,
    pub epoch: u64,
    pub sync_state: String,
    /// Last oplog position applied locally (slave) or written (master)
    pub last_position: Position,
    /// Oldest oplog position still retained (master side)
    pub oldest_retained: Position,
    /// Last roles the two data nodes reported (arbiter side)
    pub recorded_roles: Vec<(String, i8)>,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatReply { .. } => "HeartbeatReply",
            Message::RoleQuery => "RoleQuery",
            Message::RoleReply { .. } => "RoleReply",
            Message::Pull { .. } => "Pull",
            Message::PullReply { .. } => "PullReply",
            Message::SnapshotStart => "SnapshotStart",
            Message::SnapshotStarted { .. } => "SnapshotStarted",
            Message::SnapshotFetch { .. } => "SnapshotFetch",
            Message::SnapshotChunkReply { .. } => "SnapshotChunkReply",
            Message::SnapshotDone { .. } => "SnapshotDone",
            Message::Insert { .. } => "Insert",
            Message::Update { .. } => "Update",
            Message::Remove { .. } => "Remove",
            Message::WriteReply { .. } => "WriteReply",
            Message::Find { .. } => "Find",
            Message::FindReply { .. } => "FindReply",
            Message::Count { .. } => "Count",
            Message::CountReply { .. } => "CountReply",
            Message::GetLastError { .. } => "GetLastError",
            Message::LastErrorReply { .. } => "LastErrorReply",
            Message::ResetError { .. } => "ResetError",
            Message::ResetErrorReply => "ResetErrorReply",
            Message::StatusRequest => "StatusRequest",
            Message::StatusReply(_) => "StatusReply",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Heartbeat {
            from: "127.0.0.1:7501".to_string(),
            role: 1,
            epoch: 4,
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::Heartbeat { from, role, epoch } => {
                assert_eq!(from, "127.0.0.1:7501");
                assert_eq!(role, 1);
                assert_eq!(epoch, 4);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_document_payload_roundtrip() {
        let msg = Message::Insert {
            client: Uuid::new_v4(),
            namespace: "test.z".to_string(),
            doc: json!({ "i": 1, "nested": { "a": [1, 2, 3] } }),
        };
        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Insert { doc, .. } => {
                assert_eq!(doc["nested"]["a"][2], json!(3));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
