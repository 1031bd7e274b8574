//! Storage Collaborator
//!
//! The storage/query engine is an external collaborator consumed through a
//! narrow interface: apply a write operation, run a simple query, stream a
//! snapshot. Replication and election never reach past this trait.
//!
//! Documents are JSON objects keyed by `_id`. Queries are equality matches
//! on top-level fields (the subset the pair protocol itself relies on).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// A stored document: a JSON object with an `_id` field
pub type Document = Value;

/// Write operations accepted by a master and replayed by a slave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a document (assigns `_id` if absent)
    Insert { doc: Document },

    /// Update documents matching `query`; with `upsert`, insert the
    /// replacement document when nothing matches
    Update {
        query: Document,
        doc: Document,
        upsert: bool,
    },

    /// Remove documents matching `query`
    Remove { query: Document },
}

impl Operation {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Remove { .. } => "remove",
        }
    }
}

/// Check whether `doc` matches `query` (equality on top-level fields;
/// an empty query matches everything)
pub fn matches(doc: &Document, query: &Document) -> bool {
    match query.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| doc.get(k) == Some(v)),
        None => false,
    }
}

/// A chunk of documents from one namespace, streamed during initial copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub namespace: String,
    pub docs: Vec<Document>,
}

/// Narrow storage interface the replication core is written against
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Apply a write operation to a namespace; returns the number of
    /// documents affected
    async fn apply(&self, namespace: &str, op: &Operation) -> Result<usize>;

    /// Find documents matching an equality query
    async fn find(&self, namespace: &str, query: &Document) -> Result<Vec<Document>>;

    /// Count documents matching an equality query
    async fn count(&self, namespace: &str, query: &Document) -> Result<usize>;

    /// All namespaces holding at least one document
    async fn namespaces(&self) -> Vec<String>;

    /// Stream the full dataset as chunks of at most `chunk_docs` documents
    async fn snapshot(&self, chunk_docs: usize) -> Vec<SnapshotChunk>;

    /// Load a snapshot chunk, replacing nothing (caller clears first)
    async fn load_chunk(&self, chunk: SnapshotChunk) -> Result<()>;

    /// Drop the entire dataset (start of an initial copy)
    async fn clear(&self) -> Result<()>;

    /// Whether the dataset holds no documents at all
    async fn is_empty(&self) -> bool;
}

/// Shared handle to a storage implementation
pub type StorageHandle = Arc<dyn Storage>;

/// In-memory storage engine
///
/// The production deployment would place a real engine behind [`Storage`];
/// the pair protocol and its tests run against this one.
pub struct MemoryStore {
    namespaces: RwLock<BTreeMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(BTreeMap::new()),
        }
    }

    /// Convenience constructor returning a shared handle
    pub fn handle() -> StorageHandle {
        Arc::new(Self::new())
    }

    fn ensure_id(doc: &mut Document) {
        if doc.get("_id").is_none() {
            if let Some(obj) = doc.as_object_mut() {
                obj.insert(
                    "_id".to_string(),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStore {
    async fn apply(&self, namespace: &str, op: &Operation) -> Result<usize> {
        let mut namespaces = self.namespaces.write().await;
        match op {
            Operation::Insert { doc } => {
                if !doc.is_object() {
                    return Err(Error::Storage("document must be an object".into()));
                }
                let mut doc = doc.clone();
                Self::ensure_id(&mut doc);
                namespaces.entry(namespace.to_string()).or_default().push(doc);
                Ok(1)
            }
            Operation::Update { query, doc, upsert } => {
                let docs = namespaces.entry(namespace.to_string()).or_default();
                let mut affected = 0;
                for existing in docs.iter_mut() {
                    if matches(existing, query) {
                        // Replacement update, preserving the original _id
                        let id = existing.get("_id").cloned();
                        let mut replacement = doc.clone();
                        if let (Some(id), Some(obj)) = (id, replacement.as_object_mut()) {
                            obj.insert("_id".to_string(), id);
                        }
                        *existing = replacement;
                        affected += 1;
                    }
                }
                if affected == 0 && *upsert {
                    let mut doc = doc.clone();
                    Self::ensure_id(&mut doc);
                    docs.push(doc);
                    affected = 1;
                }
                Ok(affected)
            }
            Operation::Remove { query } => {
                let docs = match namespaces.get_mut(namespace) {
                    Some(docs) => docs,
                    None => return Ok(0),
                };
                let before = docs.len();
                docs.retain(|d| !matches(d, query));
                Ok(before - docs.len())
            }
        }
    }

    async fn find(&self, namespace: &str, query: &Document) -> Result<Vec<Document>> {
        let namespaces = self.namespaces.read().await;
        let docs = namespaces.get(namespace).cloned().unwrap_or_default();
        if query.as_object().map(|q| q.is_empty()).unwrap_or(false) {
            return Ok(docs);
        }
        Ok(docs.into_iter().filter(|d| matches(d, query)).collect())
    }

    async fn count(&self, namespace: &str, query: &Document) -> Result<usize> {
        Ok(self.find(namespace, query).await?.len())
    }

    async fn namespaces(&self) -> Vec<String> {
        let namespaces = self.namespaces.read().await;
        namespaces
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    async fn snapshot(&self, chunk_docs: usize) -> Vec<SnapshotChunk> {
        let namespaces = self.namespaces.read().await;
        let mut chunks = Vec::new();
        for (ns, docs) in namespaces.iter() {
            if docs.is_empty() {
                continue;
            }
            for batch in docs.chunks(chunk_docs.max(1)) {
                chunks.push(SnapshotChunk {
                    namespace: ns.clone(),
                    docs: batch.to_vec(),
                });
            }
        }
        chunks
    }

    async fn load_chunk(&self, chunk: SnapshotChunk) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(chunk.namespace)
            .or_default()
            .extend(chunk.docs);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.namespaces.write().await.clear();
        Ok(())
    }

    async fn is_empty(&self) -> bool {
        let namespaces = self.namespaces.read().await;
        namespaces.values().all(|docs| docs.is_empty())
    }
}
