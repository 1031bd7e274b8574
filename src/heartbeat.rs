//! Heartbeat Channel
//!
//! Fixed-period liveness probe of the peer data node and the arbiter.
//! Each probe is bounded by the heartbeat timeout; a probed process is
//! treated as reachable while its last successful round is within the
//! liveness window, so one dropped packet does not flap the election.
//! Every tick produces exactly one sample for the role state machine.

use std::time::Instant;

use tokio::sync::watch;
use tokio::time::interval;

use crate::config::PairConfig;
use crate::net::NetClient;
use crate::replication::Message;
use crate::state::{HeartbeatSample, PeerReport, Role, StateHandle};

/// Periodic prober feeding the role state machine
pub struct HeartbeatTask {
    state: StateHandle,
    client: NetClient,
    self_address: String,
    config: PairConfig,
    /// Last successful round with the peer, with its self-report
    peer_seen: Option<(Instant, PeerReport)>,
    /// Last successful round with the arbiter
    arbiter_seen: Option<Instant>,
}

impl HeartbeatTask {
    pub fn new(state: StateHandle, self_address: String, config: PairConfig) -> Self {
        let client = NetClient::new(config.heartbeat_timeout(), config.heartbeat_timeout());
        Self {
            state,
            client,
            self_address,
            config,
            peer_seen: None,
            arbiter_seen: None,
        }
    }

    /// Run until shutdown, one probe round per interval
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = self.probe_round().await;
                    self.state.sample(sample).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One probe round: peer and arbiter in parallel, both bounded
    async fn probe_round(&mut self) -> HeartbeatSample {
        let view = self.state.view();
        let probe = Message::Heartbeat {
            from: self.self_address.clone(),
            role: view.role.to_wire(),
            epoch: view.epoch,
        };

        let peer_addr = self.config.peer_address.clone();
        let arbiter_addr = self.config.arbiter_address.clone();
        let (peer_reply, arbiter_reply) = tokio::join!(
            self.client.request(&peer_addr, probe.clone()),
            self.client.request(&arbiter_addr, probe),
        );

        let now = Instant::now();

        match peer_reply {
            Ok(Message::HeartbeatReply { role, epoch, .. }) => {
                if let Some(role) = Role::from_wire(role) {
                    self.peer_seen = Some((now, PeerReport { role, epoch }));
                } else {
                    tracing::warn!("Peer {} reported invalid role {}", peer_addr, role);
                }
            }
            Ok(other) => {
                tracing::warn!(
                    "Peer {} answered heartbeat with {}",
                    peer_addr,
                    other.type_name()
                );
            }
            Err(e) => {
                tracing::trace!("Peer {} unreachable this round: {}", peer_addr, e);
            }
        }

        match arbiter_reply {
            Ok(Message::HeartbeatReply { .. }) => {
                self.arbiter_seen = Some(now);
            }
            Ok(other) => {
                tracing::warn!(
                    "Arbiter {} answered heartbeat with {}",
                    arbiter_addr,
                    other.type_name()
                );
            }
            Err(e) => {
                tracing::trace!("Arbiter {} unreachable this round: {}", arbiter_addr, e);
            }
        }

        let window = self.config.liveness_window();
        let peer = match self.peer_seen {
            Some((seen, report)) if now.duration_since(seen) < window => Some(report),
            _ => None,
        };
        let arbiter_reachable = matches!(
            self.arbiter_seen,
            Some(seen) if now.duration_since(seen) < window
        );

        HeartbeatSample {
            peer,
            arbiter_reachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MessageHandler, NetServer};
    use crate::state::machine;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedRole(i8, u64);

    #[async_trait::async_trait]
    impl MessageHandler for FixedRole {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::Heartbeat { .. } => Message::HeartbeatReply {
                    kind: crate::replication::ProcessKind::Data,
                    role: self.0,
                    epoch: self.1,
                },
                other => Message::Error {
                    code: crate::replication::ErrorCode::Internal,
                    message: other.type_name().to_string(),
                },
            }
        }
    }

    async fn spawn_responder(role: i8, epoch: u64) -> String {
        let server = Arc::new(NetServer::new(
            "127.0.0.1:0".to_string(),
            Arc::new(FixedRole(role, epoch)),
        ));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    fn fast_pair_config(peer: String, arbiter: String) -> PairConfig {
        PairConfig {
            peer_address: peer,
            arbiter_address: arbiter,
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 200,
            liveness_window_ms: 250,
        }
    }

    #[tokio::test]
    async fn test_probe_round_reports_reachable_processes() {
        let peer = spawn_responder(1, 3).await;
        let arbiter = spawn_responder(-1, 0).await;

        let (state, _task) = machine::spawn("127.0.0.1:7501".into(), peer.clone(), true);
        let mut heartbeat = HeartbeatTask::new(
            state,
            "127.0.0.1:7501".into(),
            fast_pair_config(peer, arbiter),
        );

        let sample = heartbeat.probe_round().await;
        assert_eq!(
            sample.peer,
            Some(PeerReport { role: Role::Master, epoch: 3 })
        );
        assert!(sample.arbiter_reachable);
    }

    #[tokio::test]
    async fn test_unreachable_processes_reported_down() {
        let (state, _task) = machine::spawn("127.0.0.1:7501".into(), "127.0.0.1:1".into(), true);
        let mut heartbeat = HeartbeatTask::new(
            state,
            "127.0.0.1:7501".into(),
            fast_pair_config("127.0.0.1:1".into(), "127.0.0.1:2".into()),
        );

        let sample = heartbeat.probe_round().await;
        assert_eq!(sample.peer, None);
        assert!(!sample.arbiter_reachable);
    }

    #[tokio::test]
    async fn test_liveness_window_bridges_one_missed_round() {
        let peer = spawn_responder(0, 1).await;
        let arbiter = spawn_responder(-1, 0).await;

        let (state, _task) = machine::spawn("127.0.0.1:7501".into(), peer.clone(), true);
        let mut heartbeat = HeartbeatTask::new(
            state,
            "127.0.0.1:7501".into(),
            PairConfig {
                peer_address: peer,
                arbiter_address: arbiter,
                heartbeat_interval_ms: 50,
                heartbeat_timeout_ms: 100,
                liveness_window_ms: 10_000,
            },
        );

        let sample = heartbeat.probe_round().await;
        assert!(sample.peer.is_some());

        // Point the next probes at dead addresses; the previous success
        // stays within the liveness window
        heartbeat.config.peer_address = "127.0.0.1:1".to_string();
        heartbeat.config.arbiter_address = "127.0.0.1:2".to_string();

        let sample = heartbeat.probe_round().await;
        assert!(sample.peer.is_some());
        assert!(sample.arbiter_reachable);
    }

    #[tokio::test]
    async fn test_stale_contact_expires() {
        let (state, _task) = machine::spawn("127.0.0.1:7501".into(), "127.0.0.1:1".into(), true);
        let mut heartbeat = HeartbeatTask::new(
            state,
            "127.0.0.1:7501".into(),
            PairConfig {
                peer_address: "127.0.0.1:1".into(),
                arbiter_address: "127.0.0.1:2".into(),
                heartbeat_interval_ms: 50,
                heartbeat_timeout_ms: 100,
                liveness_window_ms: 60,
            },
        );

        // Seed a contact, then let it age past the window
        heartbeat.peer_seen = Some((
            Instant::now(),
            PeerReport { role: Role::Master, epoch: 1 },
        ));
        heartbeat.arbiter_seen = Some(Instant::now());
        tokio::time::sleep(Duration::from_millis(80)).await;

        let sample = heartbeat.probe_round().await;
        assert_eq!(sample.peer, None);
        assert!(!sample.arbiter_reachable);
    }
}
