//! Pair Data Node
//!
//! Wires one data-holding member of the pair: the role state machine
//! (single owner of Role/SyncState), the heartbeat prober, the network
//! server answering peers and clients, the master service, and the slave
//! replication loop. Each activity runs on its own task; none blocks
//! another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::PairDbConfig;
use crate::error::{Error, Result};
use crate::guard::AccessGuard;
use crate::heartbeat::HeartbeatTask;
use crate::net::{MessageHandler, NetClient, NetServer};
use crate::oplog::Oplog;
use crate::replication::{
    ErrorCode, MasterService, Message, ProcessKind, SlaveLoop, StatusReport,
};
use crate::state::{machine, NodeView, Role, StateHandle};
use crate::storage::{Operation, StorageHandle};

/// A running pair data node
pub struct PairNode {
    state: StateHandle,
    address: String,
    server: Arc<NetServer>,
    shutdown: watch::Sender<bool>,
}

impl PairNode {
    /// Bind the configured address and start every activity
    pub async fn start(config: PairDbConfig, storage: StorageHandle) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.node.bind_address).await?;
        Self::start_with_listener(config, storage, listener).await
    }

    /// Start on an already-bound listener (lets tests pick ports first)
    pub async fn start_with_listener(
        config: PairDbConfig,
        storage: StorageHandle,
        listener: TcpListener,
    ) -> Result<Self> {
        config.validate()?;
        let address = listener.local_addr()?.to_string();
        let self_address = if config.node.advertise_address.is_some() {
            config.node.self_address().to_string()
        } else {
            address.clone()
        };

        let started_empty = storage.is_empty().await;
        let (state, _machine_task) = machine::spawn(
            self_address.clone(),
            config.pair.peer_address.clone(),
            started_empty,
        );

        let oplog = Arc::new(Oplog::new(config.oplog.max_entries));
        let applied = Arc::new(AtomicU64::new(0));
        let guard = Arc::new(AccessGuard::new(state.clone()));
        let master = Arc::new(MasterService::new(
            state.clone(),
            storage.clone(),
            oplog.clone(),
            config.oplog.clone(),
            config.resync.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Network server answering peers, the arbiter's pair member, and
        // clients
        let handler = Arc::new(DataNodeHandler {
            address: self_address.clone(),
            state: state.clone(),
            guard: guard.clone(),
            master: master.clone(),
            storage: storage.clone(),
            oplog: oplog.clone(),
            applied: applied.clone(),
        });
        let server = Arc::new(NetServer::new(address.clone(), handler));
        {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    tracing::error!("Server loop failed: {}", e);
                }
            });
        }

        // Heartbeat prober
        let heartbeat = HeartbeatTask::new(
            state.clone(),
            self_address.clone(),
            config.pair.clone(),
        );
        tokio::spawn(heartbeat.run(shutdown_rx.clone()));

        // Slave replication loop (idles while not slave)
        let repl_client = NetClient::new(
            config.pair.heartbeat_timeout(),
            // Pulls long-poll server-side; give them headroom beyond the
            // heartbeat timeout
            config.pair.heartbeat_timeout() * 4,
        );
        let slave = SlaveLoop::new(
            state.clone(),
            storage.clone(),
            repl_client,
            config.clone(),
            applied.clone(),
        );
        tokio::spawn(slave.run(shutdown_rx.clone()));

        // Demotion watcher: tear down master-side snapshot sessions the
        // moment mastership is lost
        {
            let mut view_rx = state.subscribe();
            let master = master.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut was_master = false;
                loop {
                    let role = view_rx.borrow().role;
                    if was_master && role != Role::Master {
                        master.drop_sessions().await;
                    }
                    was_master = role == Role::Master;
                    tokio::select! {
                        changed = view_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        tracing::info!(
            "Pair node on {} (peer {}, arbiter {})",
            self_address,
            config.pair.peer_address,
            config.pair.arbiter_address
        );

        Ok(Self {
            state,
            address,
            server,
            shutdown: shutdown_tx,
        })
    }

    /// Bound address (useful when started on port 0)
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current state snapshot
    pub fn view(&self) -> NodeView {
        self.state.view()
    }

    /// Handle for external observers
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Stop every activity. Abrupt kills need no cleanup: a restarted
    /// process re-enters Negotiating and rebuilds its role from
    /// heartbeats alone.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.server.shutdown();
    }
}

/// Message handler for a data node
struct DataNodeHandler {
    address: String,
    state: StateHandle,
    guard: Arc<AccessGuard>,
    master: Arc<MasterService>,
    storage: StorageHandle,
    oplog: Arc<Oplog>,
    applied: Arc<AtomicU64>,
}

impl DataNodeHandler {
    async fn handle_write(&self, client: Uuid, namespace: &str, op: Operation) -> Message {
        if let Err(e) = self.guard.check_write() {
            // Rejected outright; also recorded for the deferred error
            // surface so an unchecked writer can observe it later
            self.guard
                .record_write_outcome(client, Some(e.to_string()))
                .await;
            return Message::Error {
                code: ErrorCode::NotMaster,
                message: e.to_string(),
            };
        }

        match self.master.write(namespace, op).await {
            Ok(affected) => {
                self.guard.record_write_outcome(client, None).await;
                Message::WriteReply { affected }
            }
            Err(Error::NotMaster) => {
                self.guard
                    .record_write_outcome(client, Some(Error::NotMaster.to_string()))
                    .await;
                Message::Error {
                    code: ErrorCode::NotMaster,
                    message: Error::NotMaster.to_string(),
                }
            }
            Err(e) => {
                self.guard
                    .record_write_outcome(client, Some(e.to_string()))
                    .await;
                Message::Error {
                    code: ErrorCode::Internal,
                    message: e.to_string(),
                }
            }
        }
    }

    fn read_rejection(e: Error) -> Message {
        match e {
            Error::SlaveNotSynced(_) => Message::Error {
                code: ErrorCode::NotSynced,
                message: e.to_string(),
            },
            _ => Message::Error {
                code: ErrorCode::NotMaster,
                message: Error::NotMaster.to_string(),
            },
        }
    }

    async fn status(&self) -> StatusReport {
        let view = self.state.view();
        let last_position = if view.role == Role::Master {
            self.oplog.last_position().await
        } else {
            self.applied.load(Ordering::Acquire)
        };

        StatusReport {
            address: self.address.clone(),
            kind: ProcessKind::Data,
            role: view.role.to_wire(),
            epoch: view.epoch,
            sync_state: view.sync_state.to_string(),
            last_position,
            oldest_retained: self.oplog.oldest_retained().await,
            recorded_roles: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for DataNodeHandler {
    async fn handle(&self, _peer: &str, message: Message) -> Message {
        match message {
            Message::Heartbeat { .. } => {
                let view = self.state.view();
                Message::HeartbeatReply {
                    kind: ProcessKind::Data,
                    role: view.role.to_wire(),
                    epoch: view.epoch,
                }
            }

            Message::RoleQuery => {
                let view = self.state.view();
                Message::RoleReply {
                    role: view.role.to_wire(),
                    epoch: view.epoch,
                }
            }

            Message::Pull { after, epoch, max_entries } => {
                self.master.handle_pull(after, epoch, max_entries).await
            }
            Message::SnapshotStart => self.master.handle_snapshot_start().await,
            Message::SnapshotFetch { session, chunk } => {
                self.master.handle_snapshot_fetch(session, chunk).await
            }
            Message::SnapshotDone { session } => {
                self.master.handle_snapshot_done(session).await
            }

            Message::Insert { client, namespace, doc } => {
                self.handle_write(client, &namespace, Operation::Insert { doc })
                    .await
            }
            Message::Update { client, namespace, query, doc, upsert } => {
                self.handle_write(
                    client,
                    &namespace,
                    Operation::Update { query, doc, upsert },
                )
                .await
            }
            Message::Remove { client, namespace, query } => {
                self.handle_write(client, &namespace, Operation::Remove { query })
                    .await
            }

            Message::Find { namespace, query, slave_ok, .. } => {
                if let Err(e) = self.guard.check_read(slave_ok) {
                    return Self::read_rejection(e);
                }
                match self.storage.find(&namespace, &query).await {
                    Ok(docs) => Message::FindReply { docs },
                    Err(e) => Message::Error {
                        code: ErrorCode::Internal,
                        message: e.to_string(),
                    },
                }
            }

            Message::Count { namespace, query, slave_ok, .. } => {
                if let Err(e) = self.guard.check_read(slave_ok) {
                    return Self::read_rejection(e);
                }
                match self.storage.count(&namespace, &query).await {
                    Ok(count) => Message::CountReply { count },
                    Err(e) => Message::Error {
                        code: ErrorCode::Internal,
                        message: e.to_string(),
                    },
                }
            }

            Message::GetLastError { client } => Message::LastErrorReply {
                error: self.guard.last_error(client).await,
            },

            Message::ResetError { client } => {
                self.guard.reset_error(client).await;
                Message::ResetErrorReply
            }

            Message::StatusRequest => Message::StatusReply(Box::new(self.status().await)),

            other => Message::Error {
                code: ErrorCode::Internal,
                message: format!("unexpected message {}", other.type_name()),
            },
        }
    }
}
