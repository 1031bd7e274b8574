//! Initial/Resync Controller
//!
//! Rebuilds a slave's dataset from the current master: full snapshot copy,
//! then oplog catch-up from the position recorded when the copy began.
//! A truncation during catch-up restarts the whole copy; restarts are
//! bounded and then escalated as a persistent failure.

use tokio::sync::watch;
use uuid::Uuid;

use crate::config::ResyncConfig;
use crate::error::{Error, Result};
use crate::net::NetClient;
use crate::oplog::Position;
use crate::replication::slave::apply_batch;
use crate::replication::{ErrorCode, Message};
use crate::state::{NodeView, Role, StateHandle, SyncState};
use crate::storage::StorageHandle;

/// One resync run against a specific master incarnation
pub struct ResyncController {
    state: StateHandle,
    storage: StorageHandle,
    client: NetClient,
    config: ResyncConfig,
    max_batch_entries: usize,
}

impl ResyncController {
    pub fn new(
        state: StateHandle,
        storage: StorageHandle,
        client: NetClient,
        config: ResyncConfig,
        max_batch_entries: usize,
    ) -> Self {
        Self {
            state,
            storage,
            client,
            config,
            max_batch_entries,
        }
    }

    /// Run a full resync against `master_addr`, returning the position
    /// caught up to. Walks SyncState Unsynced -> InitialCopy ->
    /// CatchingUp -> Synced; bails out with `Cancelled` the moment the
    /// local role leaves Slave or the master identity changes.
    pub async fn run(
        &self,
        master_addr: &str,
        master_epoch: u64,
        view_rx: &mut watch::Receiver<NodeView>,
    ) -> Result<Position> {
        let mut attempts: u32 = 0;

        loop {
            self.check_cancelled(view_rx, master_addr)?;

            match self.attempt(master_addr, master_epoch, view_rx).await {
                Ok(position) => {
                    self.state.set_sync_state(SyncState::Synced).await;
                    tracing::info!(
                        "Resync from {} complete at position {} ({} restart(s))",
                        master_addr,
                        position,
                        attempts
                    );
                    return Ok(position);
                }
                Err(e) if e.requires_full_resync() => {
                    attempts += 1;
                    if attempts > self.config.max_restarts {
                        self.state.set_sync_state(SyncState::Unsynced).await;
                        tracing::error!(
                            "Resync from {} failed persistently: oplog truncated {} times",
                            master_addr,
                            attempts
                        );
                        return Err(Error::ResyncExhausted { attempts });
                    }
                    tracing::warn!(
                        "Oplog truncated during catch-up; restarting full copy ({}/{})",
                        attempts,
                        self.config.max_restarts
                    );
                }
                Err(e) => {
                    self.state.set_sync_state(SyncState::Unsynced).await;
                    return Err(e);
                }
            }
        }
    }

    /// One copy + catch-up attempt
    async fn attempt(
        &self,
        master_addr: &str,
        master_epoch: u64,
        view_rx: &mut watch::Receiver<NodeView>,
    ) -> Result<Position> {
        self.state.set_sync_state(SyncState::InitialCopy).await;

        // Open the session first so the start position covers every
        // document the snapshot will contain
        let (session, start_position, total_chunks) =
            match self.client.request(master_addr, Message::SnapshotStart).await? {
                Message::SnapshotStarted { session, start_position, total_chunks } => {
                    (session, start_position, total_chunks)
                }
                Message::Error { code: ErrorCode::NotMaster, .. } => {
                    return Err(Error::NotMaster)
                }
                other => {
                    return Err(Error::UnexpectedResponse(other.type_name().to_string()))
                }
            };

        tracing::info!(
            "Initial copy from {}: {} chunks, catch-up from position {}",
            master_addr,
            total_chunks,
            start_position
        );

        self.storage.clear().await?;
        let copy_result = self
            .copy_chunks(master_addr, session, total_chunks, view_rx)
            .await;
        // Always release the master-side session, even on failure
        let _ = self
            .client
            .request(master_addr, Message::SnapshotDone { session })
            .await;
        copy_result?;

        self.state.set_sync_state(SyncState::CatchingUp).await;
        self.catch_up(master_addr, master_epoch, start_position, view_rx)
            .await
    }

    async fn copy_chunks(
        &self,
        master_addr: &str,
        session: Uuid,
        total_chunks: u64,
        view_rx: &mut watch::Receiver<NodeView>,
    ) -> Result<()> {
        for chunk in 0..total_chunks {
            self.check_cancelled(view_rx, master_addr)?;

            let reply = self
                .client
                .request(master_addr, Message::SnapshotFetch { session, chunk })
                .await?;
            match reply {
                Message::SnapshotChunkReply { chunk } => {
                    self.storage.load_chunk(chunk).await?;
                }
                Message::Error { code, message } => {
                    return Err(Error::Replication(format!(
                        "snapshot fetch failed ({:?}): {}",
                        code, message
                    )));
                }
                other => {
                    return Err(Error::UnexpectedResponse(other.type_name().to_string()))
                }
            }
        }
        Ok(())
    }

    /// Apply oplog entries from `start_position` until the live tail is
    /// reached
    async fn catch_up(
        &self,
        master_addr: &str,
        master_epoch: u64,
        start_position: Position,
        view_rx: &mut watch::Receiver<NodeView>,
    ) -> Result<Position> {
        let mut applied = start_position;

        loop {
            self.check_cancelled(view_rx, master_addr)?;

            let reply = self
                .client
                .request(
                    master_addr,
                    Message::Pull {
                        after: applied,
                        epoch: master_epoch,
                        max_entries: self.max_batch_entries,
                    },
                )
                .await?;

            match reply {
                Message::PullReply { entries, last_position } => {
                    let caught_up = entries.is_empty() && applied >= last_position;
                    applied = apply_batch(&self.storage, &entries, applied).await;
                    if caught_up || applied >= last_position {
                        return Ok(applied);
                    }
                }
                Message::Error { code: ErrorCode::OplogTruncated, message } => {
                    tracing::warn!("Catch-up lost the window: {}", message);
                    return Err(Error::OplogTruncated { requested: applied + 1, oldest: 0 });
                }
                Message::Error { code: ErrorCode::NotMaster, .. } => return Err(Error::NotMaster),
                Message::Error { code: ErrorCode::StaleEpoch, message } => {
                    return Err(Error::Replication(message))
                }
                other => {
                    return Err(Error::UnexpectedResponse(other.type_name().to_string()))
                }
            }
        }
    }

    fn check_cancelled(
        &self,
        view_rx: &mut watch::Receiver<NodeView>,
        master_addr: &str,
    ) -> Result<()> {
        let view = view_rx.borrow();
        if view.role != Role::Slave {
            return Err(Error::Cancelled);
        }
        if view.master_addr.as_deref() != Some(master_addr) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
