//! Slave Replication Loop
//!
//! The slave side of the pair: decides whether an incremental catch-up is
//! possible or a full resync is required, then pulls oplog entries from
//! the current master and applies them in order. The loop is cancelled
//! immediately when the local role changes or the master identity moves;
//! a pull session never outlives the master incarnation it was opened
//! against.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::PairDbConfig;
use crate::error::{Error, Result};
use crate::net::NetClient;
use crate::oplog::{OplogEntry, Position};
use crate::replication::resync::ResyncController;
use crate::replication::{ErrorCode, Message};
use crate::state::{NodeView, Role, StateHandle, SyncState};
use crate::storage::StorageHandle;

/// Apply a batch of pulled entries in position order, returning the new
/// last-applied position. Already-applied positions are skipped so the
/// applied frontier never moves backward.
pub async fn apply_batch(
    storage: &StorageHandle,
    entries: &[OplogEntry],
    mut applied: Position,
) -> Position {
    for entry in entries {
        if entry.position <= applied {
            continue;
        }
        if let Err(e) = storage.apply(&entry.namespace, &entry.op).await {
            // A single bad entry must not wedge replication; the document
            // level diverges until the next full resync repairs it
            tracing::error!(
                "Failed to apply entry at position {}: {}",
                entry.position,
                e
            );
        }
        applied = entry.position;
    }
    applied
}

/// Continuous replication driver for a data node while it is a slave
pub struct SlaveLoop {
    state: StateHandle,
    storage: StorageHandle,
    client: NetClient,
    config: PairDbConfig,
    /// Last oplog position applied this process lifetime (shared so
    /// status queries can report it)
    applied: Arc<AtomicU64>,
    /// Master incarnation the current dataset was synced from
    synced_from: Option<(String, u64)>,
    /// Set when the master reported our position truncated
    needs_full_copy: bool,
}

impl SlaveLoop {
    pub fn new(
        state: StateHandle,
        storage: StorageHandle,
        client: NetClient,
        config: PairDbConfig,
        applied: Arc<AtomicU64>,
    ) -> Self {
        Self {
            state,
            storage,
            client,
            config,
            applied,
            synced_from: None,
            needs_full_copy: false,
        }
    }

    fn applied(&self) -> Position {
        self.applied.load(Ordering::Acquire)
    }

    fn set_applied(&self, position: Position) {
        self.applied.store(position, Ordering::Release);
    }

    /// Run until shutdown. Idles while the node is not a slave.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut view_rx = self.state.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let view = view_rx.borrow().clone();
            let identity = match (view.role, view.master_identity()) {
                (Role::Slave, Some(identity)) => identity,
                _ => {
                    // Not replicating right now; wait for a view change
                    tokio::select! {
                        _ = view_rx.changed() => continue,
                        _ = shutdown_rx.changed() => continue,
                    }
                }
            };

            let (master_addr, master_epoch) = identity;
            match self
                .replicate_from(&master_addr, master_epoch, &mut view_rx, &mut shutdown_rx)
                .await
            {
                Ok(()) | Err(Error::Cancelled) => {}
                Err(Error::ResyncExhausted { attempts }) => {
                    // Persistent failure: surfaced to the operator, then
                    // retried against whatever master is current later
                    tracing::error!(
                        "Persistent resync failure against {} after {} attempts",
                        master_addr,
                        attempts
                    );
                    self.sleep_interval(&mut shutdown_rx, 10).await;
                }
                Err(e) if e.is_retryable() => {
                    // Master unreachable; the resolver will react on its
                    // own clock, just pace the retry
                    tracing::debug!("Replication source {} unreachable: {}", master_addr, e);
                    self.sleep_interval(&mut shutdown_rx, 1).await;
                }
                Err(e) => {
                    tracing::warn!("Replication session against {} ended: {}", master_addr, e);
                    self.sleep_interval(&mut shutdown_rx, 1).await;
                }
            }
        }
    }

    /// One replication session against one master incarnation
    async fn replicate_from(
        &mut self,
        master_addr: &str,
        master_epoch: u64,
        view_rx: &mut watch::Receiver<NodeView>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if self.full_copy_required(master_addr, master_epoch).await {
            let resync = ResyncController::new(
                self.state.clone(),
                self.storage.clone(),
                self.client.clone(),
                self.config.resync.clone(),
                self.config.oplog.max_batch_entries,
            );
            let applied = resync.run(master_addr, master_epoch, view_rx).await?;
            self.set_applied(applied);
            self.synced_from = Some((master_addr.to_string(), master_epoch));
            self.needs_full_copy = false;
        } else {
            self.state.set_sync_state(SyncState::CatchingUp).await;
        }

        self.tail(master_addr, master_epoch, view_rx, shutdown_rx).await
    }

    /// Whether incremental catch-up can be trusted for this master
    async fn full_copy_required(&self, master_addr: &str, master_epoch: u64) -> bool {
        // (a) no local dataset
        if self.storage.is_empty().await && self.applied() == 0 {
            return true;
        }
        // (b) master told us our position fell out of the window
        if self.needs_full_copy {
            return true;
        }
        // (c) different master than last synced from: positions from the
        // old incarnation cannot be assumed to overlap
        match &self.synced_from {
            Some((addr, epoch)) => addr != master_addr || *epoch != master_epoch,
            None => true,
        }
    }

    /// Continuous pull against the live tail
    async fn tail(
        &mut self,
        master_addr: &str,
        master_epoch: u64,
        view_rx: &mut watch::Receiver<NodeView>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        // The session just reported a non-Synced state (CatchingUp, or the
        // resync walk before it); the watch view lags the machine's mpsc
        // queue, so it must not be consulted here. Reporting Synced again
        // on an already-synced node is a no-op in the machine.
        let mut synced_reported = false;

        loop {
            {
                let view = view_rx.borrow();
                if view.role != Role::Slave
                    || view.master_identity()
                        != Some((master_addr.to_string(), master_epoch))
                {
                    tracing::info!(
                        "Tearing down pull session against {} (epoch {})",
                        master_addr,
                        master_epoch
                    );
                    return Err(Error::Cancelled);
                }
            }
            if *shutdown_rx.borrow() {
                return Err(Error::ShuttingDown);
            }

            let pull = self.client.request(
                master_addr,
                Message::Pull {
                    after: self.applied(),
                    epoch: master_epoch,
                    max_entries: self.config.oplog.max_batch_entries,
                },
            );

            // The pull may park server-side waiting for new entries, but a
            // role/identity change must cancel it immediately
            let reply = tokio::select! {
                reply = pull => reply?,
                _ = view_rx.changed() => continue,
                _ = shutdown_rx.changed() => continue,
            };

            match reply {
                Message::PullReply { entries, last_position } => {
                    let applied = apply_batch(&self.storage, &entries, self.applied()).await;
                    self.set_applied(applied);
                    if !synced_reported && applied >= last_position {
                        self.state.set_sync_state(SyncState::Synced).await;
                        synced_reported = true;
                    }
                }
                Message::Error { code: ErrorCode::OplogTruncated, message } => {
                    tracing::warn!("Fell out of the oplog window: {}", message);
                    self.needs_full_copy = true;
                    self.state.set_sync_state(SyncState::Unsynced).await;
                    return Err(Error::OplogTruncated {
                        requested: self.applied() + 1,
                        oldest: 0,
                    });
                }
                Message::Error { code: ErrorCode::StaleEpoch, message } => {
                    // The master we were following has been superseded
                    tracing::info!("Pull session stale: {}", message);
                    return Err(Error::Cancelled);
                }
                Message::Error { code: ErrorCode::NotMaster, .. } => {
                    // The resolver has not caught up with a demotion yet
                    return Err(Error::NotMaster);
                }
                other => {
                    return Err(Error::UnexpectedResponse(other.type_name().to_string()))
                }
            }
        }
    }

    async fn sleep_interval(&self, shutdown_rx: &mut watch::Receiver<bool>, multiple: u32) {
        let pause = self.config.pair.heartbeat_interval() * multiple;
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}
