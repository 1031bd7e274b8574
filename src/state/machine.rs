//! Role State Machine
//!
//! One task per process owns Role, SyncState and the epoch counter. Every
//! mutation arrives as a message (heartbeat samples from the probe task,
//! sync-state reports from the resync controller); every reader holds a
//! `watch::Receiver<NodeView>` snapshot channel. The replication loops and
//! the guard never write this state directly.

use tokio::sync::{mpsc, watch};

use crate::state::node::{NodeView, Role, SyncState};
use crate::state::resolver::{self, ElectionInputs, MasterIs, PeerReport};

/// One heartbeat round's observations, fed to the machine every tick
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSample {
    /// Peer's self-report; `None` when unreachable within the window
    pub peer: Option<PeerReport>,
    /// Whether the arbiter answered within the window
    pub arbiter_reachable: bool,
}

enum Command {
    Sample(HeartbeatSample),
    SetSyncState(SyncState),
}

/// Handle for feeding and observing the state machine
#[derive(Clone)]
pub struct StateHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<NodeView>,
}

impl StateHandle {
    /// Current snapshot; re-read fresh on every call site that gates a
    /// request
    pub fn view(&self) -> NodeView {
        self.view.borrow().clone()
    }

    /// Subscribe to view changes (used by loops that must cancel on role
    /// transitions)
    pub fn subscribe(&self) -> watch::Receiver<NodeView> {
        self.view.clone()
    }

    /// Deliver one heartbeat round's observations
    pub async fn sample(&self, sample: HeartbeatSample) {
        let _ = self.commands.send(Command::Sample(sample)).await;
    }

    /// Report resync progress (resync controller only)
    pub async fn set_sync_state(&self, sync_state: SyncState) {
        let _ = self.commands.send(Command::SetSyncState(sync_state)).await;
    }
}

/// Spawn the owning task for a data node's role state.
///
/// `started_empty` records whether the dataset was empty at process start;
/// a fresh empty node is electable before its first sync, a restarted node
/// with data is not until it reaches `Synced` again.
pub fn spawn(
    self_address: String,
    peer_address: String,
    started_empty: bool,
) -> (StateHandle, tokio::task::JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (view_tx, view_rx) = watch::channel(NodeView::initial());

    let machine = Machine {
        self_address,
        peer_address,
        started_empty,
        peer_observed: false,
        view_tx,
    };
    let task = tokio::spawn(machine.run(command_rx));

    (
        StateHandle {
            commands: command_tx,
            view: view_rx,
        },
        task,
    )
}

struct Machine {
    self_address: String,
    peer_address: String,
    started_empty: bool,
    /// Set on the first successful heartbeat round with the peer; never
    /// cleared for the lifetime of the process
    peer_observed: bool,
    view_tx: watch::Sender<NodeView>,
}

impl Machine {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Sample(sample) => self.on_sample(sample),
                Command::SetSyncState(sync_state) => self.on_sync_state(sync_state),
            }
        }
        tracing::debug!("State machine task exiting");
    }

    fn electable(&self, view: &NodeView) -> bool {
        view.sync_state == SyncState::Synced
            || (self.started_empty && view.sync_state == SyncState::Unsynced)
    }

    fn on_sample(&mut self, sample: HeartbeatSample) {
        if sample.peer.is_some() {
            self.peer_observed = true;
        }

        let current = self.view_tx.borrow().clone();
        let decision = resolver::resolve(&ElectionInputs {
            local_role: current.role,
            peer: sample.peer,
            arbiter_reachable: sample.arbiter_reachable,
            peer_observed: self.peer_observed,
            electable: self.electable(&current),
            local_precedence: self.self_address > self.peer_address,
        });

        let mut next = current.clone();

        if decision.role != current.role {
            next.role = decision.role;
            next.epoch = current.epoch + 1;
            tracing::info!(
                "Role transition: {} -> {} (epoch {})",
                current.role,
                next.role,
                next.epoch
            );
        }

        match decision.master {
            MasterIs::Local => {
                next.master_addr = Some(self.self_address.clone());
                next.master_epoch = Some(next.epoch);
                // The master is by definition the reference copy
                next.sync_state = SyncState::Synced;
            }
            MasterIs::Peer => {
                next.master_addr = Some(self.peer_address.clone());
                // Track the master's own epoch so an in-flight pull
                // session tagged with an older one gets discarded
                if let Some(report) = sample.peer {
                    next.master_epoch = Some(report.epoch);
                }
                if decision.role != current.role {
                    // Entering Slave (or switching masters): prior sync
                    // history cannot be trusted until the resync
                    // controller re-establishes it
                    next.sync_state = SyncState::Unsynced;
                }
            }
            MasterIs::Unknown => {
                next.master_addr = None;
                next.master_epoch = None;
            }
        }

        if next != current {
            let _ = self.view_tx.send(next);
        }
    }

    fn on_sync_state(&mut self, sync_state: SyncState) {
        let current = self.view_tx.borrow().clone();
        if current.sync_state == sync_state {
            return;
        }
        // The resync controller only reports for a slave; a concurrent
        // promotion wins
        if current.role == Role::Master && sync_state != SyncState::Synced {
            tracing::debug!(
                "Ignoring sync-state report {} while master",
                sync_state
            );
            return;
        }
        tracing::info!("Sync state: {} -> {}", current.sync_state, sync_state);
        let mut next = current;
        next.sync_state = sync_state;
        let _ = self.view_tx.send(next);
    }
}
