//! Bounded Oplog
//!
//! Size-bounded, append-only log of write operations. Oldest entries are
//! evicted in insertion order once the bound is reached; a read past the
//! retained window fails with `OplogTruncated` rather than skipping
//! positions.

use std::collections::VecDeque;

use tokio::sync::{Notify, RwLock};

use crate::error::{Error, Result};
use crate::oplog::entry::{OplogEntry, Position};
use crate::storage::Operation;

struct OplogInner {
    entries: VecDeque<OplogEntry>,
    /// Next position to assign
    next_position: Position,
    /// Oldest position still retained (valid even when entries is empty)
    oldest_retained: Position,
}

/// Bounded in-memory oplog owned by the master side of a node
pub struct Oplog {
    inner: RwLock<OplogInner>,
    max_entries: usize,
    /// Woken on append so pull sessions can wait for the tail
    appended: Notify,
}

impl Oplog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(OplogInner {
                entries: VecDeque::new(),
                next_position: 1,
                oldest_retained: 1,
            }),
            max_entries,
            appended: Notify::new(),
        }
    }

    /// Append a write, assigning the next position. Evicts the oldest
    /// entry when the bound is exceeded.
    pub async fn append(&self, epoch: u64, namespace: &str, op: Operation) -> Result<OplogEntry> {
        let mut inner = self.inner.write().await;
        let position = inner.next_position;
        inner.next_position += 1;

        let entry = OplogEntry::new(position, epoch, namespace.to_string(), op);
        inner.entries.push_back(entry.clone());

        while inner.entries.len() > self.max_entries {
            if let Some(evicted) = inner.entries.pop_front() {
                inner.oldest_retained = evicted.position + 1;
                tracing::trace!("Evicted oplog entry at position {}", evicted.position);
            }
        }
        drop(inner);

        self.appended.notify_waiters();
        Ok(entry)
    }

    /// Read up to `limit` entries strictly after `after`.
    ///
    /// Fails with `OplogTruncated` when `after + 1` has already been
    /// evicted - the caller must fall back to a full copy, never skip.
    pub async fn read_after(&self, after: Position, limit: usize) -> Result<Vec<OplogEntry>> {
        let inner = self.inner.read().await;
        let wanted = after + 1;

        if wanted < inner.oldest_retained {
            return Err(Error::OplogTruncated {
                requested: wanted,
                oldest: inner.oldest_retained,
            });
        }

        Ok(inner
            .entries
            .iter()
            .filter(|e| e.position > after)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Wait until an entry past `after` exists (or return immediately if
    /// one already does). Pull sessions park here between batches.
    pub async fn wait_past(&self, after: Position) {
        loop {
            let notified = self.appended.notified();
            {
                let inner = self.inner.read().await;
                if inner.next_position > after + 1 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Position of the most recent entry (0 when nothing was ever written)
    pub async fn last_position(&self) -> Position {
        self.inner.read().await.next_position - 1
    }

    /// Oldest position still retained
    pub async fn oldest_retained(&self) -> Position {
        self.inner.read().await.oldest_retained
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}
