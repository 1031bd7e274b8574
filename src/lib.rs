//! PairDB - Two-Node Replicated Data Store
//!
//! A replicated document store built around a fixed pair of data nodes
//! plus one data-less arbiter. One data node is master at a time and
//! accepts all writes; the other replicates continuously from the
//! master's operation log and can serve reads on explicit opt-in.
//!
//! # Architecture
//!
//! Roles are never configured, only negotiated: each node probes its
//! peer and the arbiter on a fixed heartbeat and feeds the observations
//! to a resolver that decides the role per tick. Arbiter reachability
//! stands in for a 2-of-3 quorum, so the surviving node of a partition
//! can take over as master without ever producing two masters when all
//! three processes see each other.
//!
//! # Features
//!
//! - Automatic master election with lexicographic address precedence
//! - Failover when the master dies and the arbiter is still reachable
//! - Bounded in-memory operation log with explicit truncation reporting
//! - Full resync (snapshot copy plus catch-up) for a rejoining node
//! - Epoch-tagged replication sessions, stale sessions discarded
//! - Per-client deferred error surface for unchecked writes

pub mod arbiter;
pub mod config;
pub mod error;
pub mod guard;
pub mod heartbeat;
pub mod net;
pub mod node;
pub mod oplog;
pub mod replication;
pub mod state;
pub mod storage;

pub use config::PairDbConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::PairDbConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::PairNode;
    pub use crate::oplog::{Oplog, OplogEntry, Position};
    pub use crate::replication::Message;
    pub use crate::state::{NodeView, Role, SyncState};
    pub use crate::storage::{MemoryStore, Operation, StorageHandle};
}
