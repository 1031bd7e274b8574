//! Master Replication Service
//!
//! The master side of the pair: applies accepted writes, appends each one
//! to the oplog before acknowledging, and serves pull and snapshot
//! sessions to the slave. Every handler re-checks the current role; a
//! demoted node answers `NotMaster` rather than serving a stale stream.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::{OplogConfig, ResyncConfig};
use crate::error::{Error, Result};
use crate::oplog::{Oplog, Position};
use crate::replication::{ErrorCode, Message};
use crate::state::{Role, StateHandle};
use crate::storage::{Operation, SnapshotChunk, StorageHandle};

/// An open snapshot session: the dataset materialized as chunks, plus the
/// oplog position recorded when the copy began
struct SnapshotSession {
    start_position: Position,
    chunks: Vec<SnapshotChunk>,
}

/// Master-side replication service
pub struct MasterService {
    state: StateHandle,
    storage: StorageHandle,
    oplog: std::sync::Arc<Oplog>,
    sessions: RwLock<HashMap<Uuid, SnapshotSession>>,
    /// Serializes apply+append so oplog order always equals the order the
    /// operations hit storage
    write_order: Mutex<()>,
    oplog_config: OplogConfig,
    resync_config: ResyncConfig,
    /// How long an empty pull parks waiting for the tail before answering
    poll_wait: Duration,
}

impl MasterService {
    pub fn new(
        state: StateHandle,
        storage: StorageHandle,
        oplog: std::sync::Arc<Oplog>,
        oplog_config: OplogConfig,
        resync_config: ResyncConfig,
    ) -> Self {
        Self {
            state,
            storage,
            oplog,
            sessions: RwLock::new(HashMap::new()),
            write_order: Mutex::new(()),
            oplog_config,
            resync_config,
            poll_wait: Duration::from_millis(500),
        }
    }

    /// Apply an accepted write and append it to the oplog.
    ///
    /// The caller (the guard) has already established mastership; the
    /// check here closes the race where a demotion lands between the
    /// guard's check and the apply.
    pub async fn write(&self, namespace: &str, op: Operation) -> Result<usize> {
        let view = self.state.view();
        if view.role != Role::Master {
            return Err(Error::NotMaster);
        }

        // Storage and the oplog sit behind separate locks; without this
        // section two concurrent writes could append in the opposite order
        // from the order they were applied, and the slave's replay would
        // converge to a different document state
        let _order = self.write_order.lock().await;
        let affected = self.storage.apply(namespace, &op).await?;
        let entry = self.oplog.append(view.epoch, namespace, op).await?;
        tracing::debug!(
            "Accepted {} on {} at position {}",
            entry.op.kind(),
            namespace,
            entry.position
        );
        Ok(affected)
    }

    /// Serve a slave pull request
    pub async fn handle_pull(&self, after: Position, epoch: u64, max_entries: usize) -> Message {
        let view = self.state.view();
        if view.role != Role::Master {
            return not_master();
        }
        // A pull tagged with an older epoch belongs to a session opened
        // against a previous incarnation of this master
        if epoch < view.epoch {
            return Message::Error {
                code: ErrorCode::StaleEpoch,
                message: Error::StaleEpoch { session: epoch, current: view.epoch }.to_string(),
            };
        }

        let limit = max_entries.min(self.oplog_config.max_batch_entries);
        match self.read_with_wait(after, limit).await {
            Ok(entries) => Message::PullReply {
                entries,
                last_position: self.oplog.last_position().await,
            },
            Err(Error::OplogTruncated { requested, oldest }) => Message::Error {
                code: ErrorCode::OplogTruncated,
                message: Error::OplogTruncated { requested, oldest }.to_string(),
            },
            Err(e) => Message::Error {
                code: ErrorCode::Internal,
                message: e.to_string(),
            },
        }
    }

    /// Read entries after `after`; when the slave is already at the tail,
    /// park briefly so the pull long-polls instead of spinning
    async fn read_with_wait(&self, after: Position, limit: usize) -> Result<Vec<crate::oplog::OplogEntry>> {
        let entries = self.oplog.read_after(after, limit).await?;
        if !entries.is_empty() {
            return Ok(entries);
        }
        let _ = tokio::time::timeout(self.poll_wait, self.oplog.wait_past(after)).await;
        self.oplog.read_after(after, limit).await
    }

    /// Open a snapshot session for an initial copy
    pub async fn handle_snapshot_start(&self) -> Message {
        let view = self.state.view();
        if view.role != Role::Master {
            return not_master();
        }

        // Record the position first: entries written during the copy are
        // replayed by the catch-up phase
        let start_position = self.oplog.last_position().await;
        let chunks = self
            .storage
            .snapshot(self.resync_config.snapshot_chunk_docs)
            .await;
        let total_chunks = chunks.len() as u64;

        let session = Uuid::new_v4();
        self.sessions
            .write()
            .await
            .insert(session, SnapshotSession { start_position, chunks });

        tracing::info!(
            "Snapshot session {} opened: {} chunks from position {}",
            session,
            total_chunks,
            start_position
        );

        Message::SnapshotStarted {
            session,
            start_position,
            total_chunks,
        }
    }

    /// Serve one chunk of an open snapshot session
    pub async fn handle_snapshot_fetch(&self, session: Uuid, chunk: u64) -> Message {
        let sessions = self.sessions.read().await;
        match sessions.get(&session) {
            Some(open) => match open.chunks.get(chunk as usize) {
                Some(data) => Message::SnapshotChunkReply { chunk: data.clone() },
                None => Message::Error {
                    code: ErrorCode::Internal,
                    message: format!("chunk {} out of range", chunk),
                },
            },
            None => Message::Error {
                code: ErrorCode::UnknownSession,
                message: format!("unknown snapshot session {}", session),
            },
        }
    }

    /// Close a snapshot session
    pub async fn handle_snapshot_done(&self, session: Uuid) -> Message {
        if self.sessions.write().await.remove(&session).is_some() {
            tracing::info!("Snapshot session {} closed", session);
        }
        Message::SnapshotDone { session }
    }

    /// Drop all open snapshot sessions (called on demotion)
    pub async fn drop_sessions(&self) {
        let mut sessions = self.sessions.write().await;
        if !sessions.is_empty() {
            tracing::info!("Dropping {} snapshot session(s)", sessions.len());
            sessions.clear();
        }
    }
}

fn not_master() -> Message {
    Message::Error {
        code: ErrorCode::NotMaster,
        message: Error::NotMaster.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{machine, HeartbeatSample, PeerReport};
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn master_service() -> MasterService {
        // Higher-precedence fresh node, peer negotiating: becomes master
        let (state, _task) = machine::spawn("127.0.0.1:7502".into(), "127.0.0.1:7501".into(), true);
        state
            .sample(HeartbeatSample {
                peer: Some(PeerReport { role: Role::Negotiating, epoch: 0 }),
                arbiter_reachable: true,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(state.view().role, Role::Master);

        MasterService::new(
            state,
            MemoryStore::handle(),
            Arc::new(Oplog::new(100)),
            OplogConfig::default(),
            ResyncConfig::default(),
        )
    }

    async fn negotiating_service() -> MasterService {
        let (state, _task) = machine::spawn("127.0.0.1:7502".into(), "127.0.0.1:7501".into(), true);
        MasterService::new(
            state,
            MemoryStore::handle(),
            Arc::new(Oplog::new(100)),
            OplogConfig::default(),
            ResyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_write_appends_to_oplog() {
        let master = master_service().await;
        master
            .write("test.z", Operation::Insert { doc: json!({ "i": 1 }) })
            .await
            .unwrap();
        master
            .write("test.z", Operation::Insert { doc: json!({ "i": 2 }) })
            .await
            .unwrap();

        assert_eq!(master.oplog.last_position().await, 2);
        assert_eq!(master.storage.count("test.z", &json!({})).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_refused_when_not_master() {
        let service = negotiating_service().await;
        let err = service
            .write("test.z", Operation::Insert { doc: json!({ "i": 1 }) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotMaster));
        assert!(service.storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_writes_replay_to_identical_state() {
        let master = Arc::new(master_service().await);
        master
            .write("test.z", Operation::Insert { doc: json!({ "_id": "a", "v": 0 }) })
            .await
            .unwrap();

        // Conflicting updates to the same document from concurrent tasks
        let mut handles = Vec::new();
        for i in 1..=20i64 {
            let master = Arc::clone(&master);
            handles.push(tokio::spawn(async move {
                master
                    .write(
                        "test.z",
                        Operation::Update {
                            query: json!({ "_id": "a" }),
                            doc: json!({ "v": i }),
                            upsert: false,
                        },
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let epoch = master.state.view().epoch;
        let entries = match master.handle_pull(0, epoch, 100).await {
            Message::PullReply { entries, .. } => entries,
            other => panic!("unexpected {}", other.type_name()),
        };
        assert_eq!(entries.len(), 21);

        // Replaying the oplog must land on exactly the master's state,
        // whichever update happened to win
        let replayed = MemoryStore::handle();
        crate::replication::slave::apply_batch(&replayed, &entries, 0).await;

        let master_doc = master
            .storage
            .find("test.z", &json!({ "_id": "a" }))
            .await
            .unwrap();
        let replayed_doc = replayed
            .find("test.z", &json!({ "_id": "a" }))
            .await
            .unwrap();
        assert_eq!(master_doc, replayed_doc);
    }

    #[tokio::test]
    async fn test_pull_returns_entries_in_order() {
        let master = master_service().await;
        for i in 0..3 {
            master
                .write("test.z", Operation::Insert { doc: json!({ "i": i }) })
                .await
                .unwrap();
        }

        let epoch = master.state.view().epoch;
        match master.handle_pull(0, epoch, 100).await {
            Message::PullReply { entries, last_position } => {
                let positions: Vec<_> = entries.iter().map(|e| e.position).collect();
                assert_eq!(positions, vec![1, 2, 3]);
                assert_eq!(last_position, 3);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_stale_epoch_pull_rejected() {
        let master = master_service().await;
        let epoch = master.state.view().epoch;
        assert!(epoch > 0);
        match master.handle_pull(0, epoch - 1, 100).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::StaleEpoch),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_truncated_pull_reports_error() {
        let (state, _task) = machine::spawn("127.0.0.1:7502".into(), "127.0.0.1:7501".into(), true);
        state
            .sample(HeartbeatSample {
                peer: Some(PeerReport { role: Role::Negotiating, epoch: 0 }),
                arbiter_reachable: true,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let master = MasterService::new(
            state,
            MemoryStore::handle(),
            Arc::new(Oplog::new(2)),
            OplogConfig::default(),
            ResyncConfig::default(),
        );
        for i in 0..5 {
            master
                .write("test.z", Operation::Insert { doc: json!({ "i": i }) })
                .await
                .unwrap();
        }

        let epoch = master.state.view().epoch;
        match master.handle_pull(0, epoch, 100).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::OplogTruncated),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_snapshot_session_lifecycle() {
        let master = master_service().await;
        for i in 0..5 {
            master
                .write("test.z", Operation::Insert { doc: json!({ "i": i }) })
                .await
                .unwrap();
        }

        let (session, start_position, total_chunks) = match master.handle_snapshot_start().await {
            Message::SnapshotStarted { session, start_position, total_chunks } => {
                (session, start_position, total_chunks)
            }
            other => panic!("unexpected {}", other.type_name()),
        };
        assert_eq!(start_position, 5);
        assert!(total_chunks >= 1);

        let mut docs = 0;
        for chunk in 0..total_chunks {
            match master.handle_snapshot_fetch(session, chunk).await {
                Message::SnapshotChunkReply { chunk } => docs += chunk.docs.len(),
                other => panic!("unexpected {}", other.type_name()),
            }
        }
        assert_eq!(docs, 5);

        master.handle_snapshot_done(session).await;
        match master.handle_snapshot_fetch(session, 0).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownSession),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_snapshot_position_precedes_later_writes() {
        let master = master_service().await;
        master
            .write("test.z", Operation::Insert { doc: json!({ "i": 1 }) })
            .await
            .unwrap();

        let start_position = match master.handle_snapshot_start().await {
            Message::SnapshotStarted { start_position, .. } => start_position,
            other => panic!("unexpected {}", other.type_name()),
        };

        // A write after the copy begins is not in the snapshot; it must
        // be covered by catch-up from the recorded position
        master
            .write("test.z", Operation::Insert { doc: json!({ "i": 2 }) })
            .await
            .unwrap();
        assert_eq!(start_position, 1);
        assert_eq!(master.oplog.last_position().await, 2);
    }
}
