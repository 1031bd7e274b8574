//! Node Role and Sync State
//!
//! Role is owned by the state machine task and published to every other
//! activity as an immutable `NodeView` snapshot; nothing outside the
//! machine mutates it.

use serde::{Deserialize, Serialize};

/// Role of a data node in the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// No opinion yet: startup, or contact lost with both other processes
    Negotiating,
    /// Replicating from the master
    Slave,
    /// Accepting writes and serving the oplog
    Master,
}

impl Role {
    /// Wire encoding used by role queries: -1 / 0 / 1
    pub fn to_wire(self) -> i8 {
        match self {
            Role::Negotiating => -1,
            Role::Slave => 0,
            Role::Master => 1,
        }
    }

    pub fn from_wire(value: i8) -> Option<Self> {
        match value {
            -1 => Some(Role::Negotiating),
            0 => Some(Role::Slave),
            1 => Some(Role::Master),
            _ => None,
        }
    }

    pub fn is_master(self) -> bool {
        self == Role::Master
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Negotiating => write!(f, "NEGOTIATING"),
            Role::Slave => write!(f, "SLAVE"),
            Role::Master => write!(f, "MASTER"),
        }
    }
}

/// Resync progress of a data node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// No usable dataset
    Unsynced,
    /// Full snapshot copy from the master in progress
    InitialCopy,
    /// Applying oplog entries from the recorded copy position to the tail
    CatchingUp,
    /// Caught up to the master's live tail
    Synced,
}

impl SyncState {
    /// Slave reads are only safe once fully caught up
    pub fn readable(self) -> bool {
        self == SyncState::Synced
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Unsynced => write!(f, "UNSYNCED"),
            SyncState::InitialCopy => write!(f, "INITIAL_COPY"),
            SyncState::CatchingUp => write!(f, "CATCHING_UP"),
            SyncState::Synced => write!(f, "SYNCED"),
        }
    }
}

/// Immutable snapshot of a node's shared state, published over a watch
/// channel by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    /// Current role
    pub role: Role,
    /// Current sync progress
    pub sync_state: SyncState,
    /// Monotonic counter, bumped on every role transition; tags
    /// replication sessions so stale ones can be discarded
    pub epoch: u64,
    /// Address of the node currently believed to be master (may be self)
    pub master_addr: Option<String>,
    /// Epoch the current master reported for itself, when known
    pub master_epoch: Option<u64>,
}

impl NodeView {
    /// Startup view: everything unknown, role reconstructed purely from
    /// heartbeats
    pub fn initial() -> Self {
        Self {
            role: Role::Negotiating,
            sync_state: SyncState::Unsynced,
            epoch: 0,
            master_addr: None,
            master_epoch: None,
        }
    }

    /// Identity of the replication source, as (address, epoch). A change
    /// in either invalidates an open pull session.
    pub fn master_identity(&self) -> Option<(String, u64)> {
        match (&self.master_addr, self.master_epoch) {
            (Some(addr), Some(epoch)) => Some((addr.clone(), epoch)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_encoding_roundtrip() {
        for role in [Role::Negotiating, Role::Slave, Role::Master] {
            assert_eq!(Role::from_wire(role.to_wire()), Some(role));
        }
        assert_eq!(Role::Master.to_wire(), 1);
        assert_eq!(Role::Slave.to_wire(), 0);
        assert_eq!(Role::Negotiating.to_wire(), -1);
        assert_eq!(Role::from_wire(7), None);
    }

    #[test]
    fn test_only_synced_is_readable() {
        assert!(SyncState::Synced.readable());
        assert!(!SyncState::Unsynced.readable());
        assert!(!SyncState::InitialCopy.readable());
        assert!(!SyncState::CatchingUp.readable());
    }

    #[test]
    fn test_initial_view_is_negotiating() {
        let view = NodeView::initial();
        assert_eq!(view.role, Role::Negotiating);
        assert_eq!(view.sync_state, SyncState::Unsynced);
        assert_eq!(view.epoch, 0);
        assert!(view.master_identity().is_none());
    }
}
