//! Arbiter
//!
//! The data-less third process of a pair. It answers heartbeats so each
//! data node can use its reachability as the 2-of-3 quorum substitute,
//! and records the last role each data node reported (visible in status
//! output). It never holds data, never votes a role of its own, and
//! never initiates anything.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::net::MessageHandler;
use crate::replication::{ErrorCode, Message, ProcessKind, StatusReport};

/// Arbiter message handler
pub struct ArbiterService {
    address: String,
    /// Last role each data node reported, by its advertised address
    recorded_roles: RwLock<HashMap<String, i8>>,
}

impl ArbiterService {
    pub fn new(address: String) -> Arc<Self> {
        Arc::new(Self {
            address,
            recorded_roles: RwLock::new(HashMap::new()),
        })
    }

    async fn record(&self, from: String, role: i8) {
        let mut recorded = self.recorded_roles.write().await;
        let previous = recorded.insert(from.clone(), role);
        if previous != Some(role) {
            tracing::info!("Data node {} now reports role {}", from, role);
        }
    }

    async fn status(&self) -> StatusReport {
        let recorded = self.recorded_roles.read().await;
        let mut recorded_roles: Vec<(String, i8)> =
            recorded.iter().map(|(a, r)| (a.clone(), *r)).collect();
        recorded_roles.sort();

        StatusReport {
            address: self.address.clone(),
            kind: ProcessKind::Arbiter,
            role: -1,
            epoch: 0,
            sync_state: "ARBITER".to_string(),
            last_position: 0,
            oldest_retained: 0,
            recorded_roles,
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for ArbiterService {
    async fn handle(&self, _peer: &str, message: Message) -> Message {
        match message {
            Message::Heartbeat { from, role, .. } => {
                self.record(from, role).await;
                Message::HeartbeatReply {
                    kind: ProcessKind::Arbiter,
                    role: -1,
                    epoch: 0,
                }
            }

            // The arbiter never asserts mastership
            Message::RoleQuery => Message::RoleReply { role: -1, epoch: 0 },

            Message::StatusRequest => Message::StatusReply(Box::new(self.status().await)),

            // Data access against the arbiter is a caller bug
            Message::Insert { .. }
            | Message::Update { .. }
            | Message::Remove { .. }
            | Message::Find { .. }
            | Message::Count { .. }
            | Message::GetLastError { .. }
            | Message::ResetError { .. }
            | Message::Pull { .. }
            | Message::SnapshotStart
            | Message::SnapshotFetch { .. }
            | Message::SnapshotDone { .. } => Message::Error {
                code: ErrorCode::ArbiterHoldsNoData,
                message: "arbiter holds no data".to_string(),
            },

            other => Message::Error {
                code: ErrorCode::Internal,
                message: format!("unexpected message {}", other.type_name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_heartbeat_records_reported_role() {
        let arbiter = ArbiterService::new("127.0.0.1:7500".to_string());

        let reply = arbiter
            .handle(
                "peer",
                Message::Heartbeat { from: "127.0.0.1:7501".into(), role: 0, epoch: 2 },
            )
            .await;
        match reply {
            Message::HeartbeatReply { kind, role, .. } => {
                assert_eq!(kind, ProcessKind::Arbiter);
                assert_eq!(role, -1);
            }
            other => panic!("unexpected {}", other.type_name()),
        }

        arbiter
            .handle(
                "peer",
                Message::Heartbeat { from: "127.0.0.1:7502".into(), role: 1, epoch: 5 },
            )
            .await;

        let status = arbiter.status().await;
        assert_eq!(
            status.recorded_roles,
            vec![
                ("127.0.0.1:7501".to_string(), 0),
                ("127.0.0.1:7502".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_arbiter_never_reports_master() {
        let arbiter = ArbiterService::new("127.0.0.1:7500".to_string());
        match arbiter.handle("peer", Message::RoleQuery).await {
            Message::RoleReply { role, .. } => assert_eq!(role, -1),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_data_operations_rejected() {
        let arbiter = ArbiterService::new("127.0.0.1:7500".to_string());

        let ops = vec![
            Message::Insert {
                client: Uuid::new_v4(),
                namespace: "test.z".into(),
                doc: json!({ "i": 1 }),
            },
            Message::Find {
                client: Uuid::new_v4(),
                namespace: "test.z".into(),
                query: json!({}),
                slave_ok: true,
            },
            Message::Pull { after: 0, epoch: 1, max_entries: 10 },
            Message::SnapshotStart,
        ];
        for op in ops {
            match arbiter.handle("peer", op).await {
                Message::Error { code, .. } => {
                    assert_eq!(code, ErrorCode::ArbiterHoldsNoData)
                }
                other => panic!("unexpected {}", other.type_name()),
            }
        }
    }
}
