//! Write/Read Guard
//!
//! Gate in front of the external data-access surface. Stateless per
//! request: the current role and sync state are re-read on every call,
//! never cached, so a demotion takes effect on the very next request.
//!
//! Writes additionally feed a per-client deferred error slot: the
//! originating protocol batches acknowledgements, so a caller that fired
//! an unchecked write can observe the rejection through a later
//! `last_error` query.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::state::{Role, StateHandle};

/// Role/sync gate plus the per-client last-error registry
pub struct AccessGuard {
    state: StateHandle,
    last_errors: RwLock<HashMap<Uuid, Option<String>>>,
}

impl AccessGuard {
    pub fn new(state: StateHandle) -> Self {
        Self {
            state,
            last_errors: RwLock::new(HashMap::new()),
        }
    }

    /// Gate a mutating operation: master only, no queuing, no retry
    pub fn check_write(&self) -> Result<()> {
        let view = self.state.view();
        if view.role.is_master() {
            Ok(())
        } else {
            Err(Error::NotMaster)
        }
    }

    /// Gate a read. Slave reads require explicit opt-in and a fully
    /// synced dataset; a catching-up slave would serve data that both
    /// lags the master and may be pre-resync garbage.
    pub fn check_read(&self, slave_ok: bool) -> Result<()> {
        let view = self.state.view();
        match view.role {
            Role::Master => Ok(()),
            Role::Slave if slave_ok => {
                if view.sync_state.readable() {
                    Ok(())
                } else {
                    Err(Error::SlaveNotSynced(view.sync_state.to_string()))
                }
            }
            _ => Err(Error::NotMaster),
        }
    }

    /// Record a write outcome for the deferred error surface. A
    /// successful write clears the slot, mirroring "error of the last
    /// operation" semantics.
    pub async fn record_write_outcome(&self, client: Uuid, error: Option<String>) {
        self.last_errors.write().await.insert(client, error);
    }

    /// Last recorded write error for this client, if any
    pub async fn last_error(&self, client: Uuid) -> Option<String> {
        self.last_errors
            .read()
            .await
            .get(&client)
            .cloned()
            .flatten()
    }

    /// Clear the client's recorded error
    pub async fn reset_error(&self, client: Uuid) {
        self.last_errors.write().await.remove(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{machine, HeartbeatSample, PeerReport, SyncState};
    use std::time::Duration;

    async fn guard_with_role(peer_role: Option<Role>, precedence: bool) -> AccessGuard {
        let (self_addr, peer_addr) = if precedence {
            ("127.0.0.1:7502", "127.0.0.1:7501")
        } else {
            ("127.0.0.1:7501", "127.0.0.1:7502")
        };
        let (state, _task) = machine::spawn(self_addr.into(), peer_addr.into(), true);
        state
            .sample(HeartbeatSample {
                peer: peer_role.map(|role| PeerReport { role, epoch: 1 }),
                arbiter_reachable: true,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        AccessGuard::new(state)
    }

    #[tokio::test]
    async fn test_master_accepts_reads_and_writes() {
        let guard = guard_with_role(Some(Role::Negotiating), true).await;
        guard.check_write().unwrap();
        guard.check_read(false).unwrap();
        guard.check_read(true).unwrap();
    }

    #[tokio::test]
    async fn test_slave_rejects_writes_outright() {
        let guard = guard_with_role(Some(Role::Master), false).await;
        assert!(matches!(guard.check_write(), Err(Error::NotMaster)));
    }

    #[tokio::test]
    async fn test_slave_read_requires_opt_in_and_sync() {
        let guard = guard_with_role(Some(Role::Master), false).await;

        // No opt-in: rejected like a write
        assert!(matches!(guard.check_read(false), Err(Error::NotMaster)));

        // Opted in but unsynced: still rejected
        assert!(matches!(
            guard.check_read(true),
            Err(Error::SlaveNotSynced(_))
        ));

        // Synced slave with opt-in: served
        guard.state.set_sync_state(SyncState::Synced).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.check_read(true).unwrap();
    }

    #[tokio::test]
    async fn test_negotiating_rejects_everything() {
        let (state, _task) =
            machine::spawn("127.0.0.1:7501".into(), "127.0.0.1:7502".into(), true);
        let guard = AccessGuard::new(state);
        assert!(matches!(guard.check_write(), Err(Error::NotMaster)));
        assert!(matches!(guard.check_read(true), Err(Error::NotMaster)));
    }

    #[tokio::test]
    async fn test_deferred_error_surface() {
        let guard = guard_with_role(Some(Role::Master), false).await;
        let client = Uuid::new_v4();

        assert_eq!(guard.last_error(client).await, None);

        // Unchecked write rejected; error observable later
        guard
            .record_write_outcome(client, Some(Error::NotMaster.to_string()))
            .await;
        assert_eq!(guard.last_error(client).await, Some("not master".to_string()));

        // Still there until reset
        assert_eq!(guard.last_error(client).await, Some("not master".to_string()));
        guard.reset_error(client).await;
        assert_eq!(guard.last_error(client).await, None);
    }

    #[tokio::test]
    async fn test_successful_write_clears_slot() {
        let guard = guard_with_role(Some(Role::Negotiating), true).await;
        let client = Uuid::new_v4();

        guard
            .record_write_outcome(client, Some(Error::NotMaster.to_string()))
            .await;
        guard.record_write_outcome(client, None).await;
        assert_eq!(guard.last_error(client).await, None);
    }

    #[tokio::test]
    async fn test_guard_reevaluates_fresh_per_call() {
        // Lower-precedence node fails over to master, then the old
        // master reappears; the healed pair demotes this side and the
        // very next call must see it
        let guard = guard_with_role(Some(Role::Master), false).await;
        guard.state.set_sync_state(SyncState::Synced).await;
        guard
            .state
            .sample(HeartbeatSample { peer: None, arbiter_reachable: true })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.check_write().unwrap();

        guard
            .state
            .sample(HeartbeatSample {
                peer: Some(PeerReport { role: Role::Master, epoch: 9 }),
                arbiter_reachable: true,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(guard.check_write(), Err(Error::NotMaster)));
    }
}
