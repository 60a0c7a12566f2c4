//! Storage abstraction layer for replicated documents
//!
//! A [`ReplicatedStore`] behaves like a multi-master document database: every
//! key holds a set of leaf revisions. Concurrent writers that replicate into
//! each other leave more than one live leaf behind, and the store elects a
//! winner by revision generation. That election is an arbitrary, non-causal
//! tiebreak; callers that need to know whose value lost must keep their own
//! record of what they wrote (see `replication`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::object::Record;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Revision {rev} of {key} is not a live leaf")]
    RevisionNotFound { key: String, rev: Revision },

    #[error("Update conflict on {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Key layout inside a store
pub mod keys {
    use crate::object::ObjectId;

    /// Prefix reserved for private, never replicated records
    pub const LOCAL_PREFIX: &str = "_local/";

    /// Replication scope of a document
    pub fn namespace(document_id: &str) -> String {
        format!("{}/", document_id)
    }

    pub fn object(document_id: &str, id: &ObjectId) -> String {
        format!("{}/{}", document_id, id)
    }

    pub fn head(document_id: &str) -> String {
        format!("{}/heads/master", document_id)
    }

    pub fn metadata(document_id: &str) -> String {
        format!("{}/metadata", document_id)
    }

    /// Private copy of the last head this client wrote
    pub fn local_head(document_id: &str) -> String {
        format!("{}{}/heads/master", LOCAL_PREFIX, document_id)
    }
}

/// Revisions kept in a leaf's ancestry list
const MAX_REVISION_HISTORY: usize = 1000;

/// Store revision tag, `"<generation>-<hash>"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Derive the next revision from `parent` and the new body
    pub fn next(parent: Option<&Revision>, deleted: bool, record: &Record) -> Self {
        let generation = parent.map(Revision::generation).unwrap_or(0) + 1;
        let mut hasher = Sha256::new();
        if let Some(p) = parent {
            hasher.update(p.0.as_bytes());
        }
        hasher.update([deleted as u8]);
        hasher.update(serde_json::to_vec(record).unwrap_or_default());
        let digest = hex::encode(hasher.finalize());
        Self(format!("{}-{}", generation, &digest[..32]))
    }

    /// Generation counter, the store's winner tiebreak
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(g, _)| g.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One leaf revision of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub key: String,
    pub rev: Revision,
    #[serde(default)]
    pub deleted: bool,
    pub record: Record,
    /// Ancestor revisions of `rev`, nearest first
    #[serde(default)]
    pub history: Vec<Revision>,
}

impl StoredDoc {
    fn descends_from(&self, rev: &Revision) -> bool {
        self.history.contains(rev)
    }
}

/// Winning revision of a key together with the live revisions it beat
#[derive(Debug, Clone)]
pub struct Conflicted {
    pub winner: StoredDoc,
    pub conflicts: Vec<StoredDoc>,
}

impl Conflicted {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Winner followed by every conflicting revision
    pub fn all(&self) -> impl Iterator<Item = &StoredDoc> {
        std::iter::once(&self.winner).chain(self.conflicts.iter())
    }
}

/// A single write inside [`ReplicatedStore::bulk_write`]
#[derive(Debug, Clone)]
pub enum Write {
    /// Content-addressed record; a no-op if the key already has a live value
    Immutable { key: String, record: Record },
    /// Optimistic update on top of `base` (`None` creates the key)
    Update {
        key: String,
        base: Option<Revision>,
        record: Record,
    },
}

impl Write {
    pub fn key(&self) -> &str {
        match self {
            Write::Immutable { key, .. } | Write::Update { key, .. } => key,
        }
    }
}

/// Leaf revisions of one key and the rules for changing them.
///
/// Shared by every backend so winner election and revision ancestry behave
/// identically in memory and on disk.
#[derive(Debug, Clone, Default)]
pub struct LeafSet {
    leaves: Vec<StoredDoc>,
}

impl LeafSet {
    pub fn from_leaves(leaves: Vec<StoredDoc>) -> Self {
        Self { leaves }
    }

    pub fn leaves(&self) -> &[StoredDoc] {
        &self.leaves
    }

    pub fn into_leaves(self) -> Vec<StoredDoc> {
        self.leaves
    }

    /// Live leaves beat deleted ones, then higher generation, then higher rev
    pub fn winner(&self) -> Option<&StoredDoc> {
        self.leaves
            .iter()
            .max_by(|a, b| {
                (!a.deleted, a.rev.generation(), &a.rev).cmp(&(!b.deleted, b.rev.generation(), &b.rev))
            })
    }

    pub fn live_winner(&self) -> Option<&StoredDoc> {
        self.winner().filter(|d| !d.deleted)
    }

    pub fn conflicted(&self) -> Option<Conflicted> {
        let winner = self.live_winner()?.clone();
        let conflicts = self
            .leaves
            .iter()
            .filter(|d| !d.deleted && d.rev != winner.rev)
            .cloned()
            .collect();
        Some(Conflicted { winner, conflicts })
    }

    fn extend(key: &str, parent: Option<&StoredDoc>, deleted: bool, record: Record) -> StoredDoc {
        let rev = Revision::next(parent.map(|p| &p.rev), deleted, &record);
        let history = match parent {
            Some(p) => std::iter::once(p.rev.clone())
                .chain(p.history.iter().cloned())
                .take(MAX_REVISION_HISTORY)
                .collect(),
            None => Vec::new(),
        };
        StoredDoc {
            key: key.to_string(),
            rev,
            deleted,
            record,
            history,
        }
    }

    /// Write `record` on top of `base`
    pub fn put(&mut self, key: &str, base: Option<&Revision>, record: Record) -> Result<Revision> {
        let parent_idx = match base {
            Some(base) => Some(
                self.leaves
                    .iter()
                    .position(|d| &d.rev == base && !d.deleted)
                    .ok_or_else(|| StorageError::Conflict(key.to_string()))?,
            ),
            None => {
                if self.live_winner().is_some() {
                    return Err(StorageError::Conflict(key.to_string()));
                }
                // Recreating a deleted key extends its tombstone
                self.winner().map(|w| w.rev.clone()).and_then(|rev| self.leaves.iter().position(|d| d.rev == rev))
            }
        };
        let doc = Self::extend(key, parent_idx.map(|i| &self.leaves[i]), false, record);
        let rev = doc.rev.clone();
        match parent_idx {
            Some(i) => self.leaves[i] = doc,
            None => self.leaves.push(doc),
        }
        Ok(rev)
    }

    /// Tombstone one live leaf
    pub fn delete(&mut self, key: &str, rev: &Revision) -> Result<()> {
        let idx = self
            .leaves
            .iter()
            .position(|d| &d.rev == rev && !d.deleted)
            .ok_or_else(|| StorageError::RevisionNotFound {
                key: key.to_string(),
                rev: rev.clone(),
            })?;
        let record = self.leaves[idx].record.clone();
        let tombstone = Self::extend(key, Some(&self.leaves[idx]), true, record);
        self.leaves[idx] = tombstone;
        Ok(())
    }

    /// Merge a leaf replicated from another store.
    ///
    /// Returns false when the revision is already known here. A leaf that does
    /// not descend from any local leaf is kept beside them as a conflict.
    pub fn insert_replica(&mut self, doc: StoredDoc) -> bool {
        let known = self
            .leaves
            .iter()
            .any(|d| d.rev == doc.rev || d.descends_from(&doc.rev));
        if known {
            return false;
        }
        self.leaves.retain(|d| !doc.descends_from(&d.rev));
        self.leaves.push(doc);
        true
    }
}

/// Replicated document store
///
/// All backends must implement this trait. Keys under
/// [`keys::LOCAL_PREFIX`] live in a separate private space that
/// [`replicate`] never copies.
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    /// Winning live revision of `key`
    async fn get(&self, key: &str) -> Result<Option<StoredDoc>>;

    /// Winning live revision plus every live revision it beat
    async fn get_with_conflicts(&self, key: &str) -> Result<Option<Conflicted>>;

    /// Optimistic write on top of `base`
    async fn put(&self, key: &str, base: Option<&Revision>, record: Record) -> Result<Revision>;

    /// Apply every write or none. Immutable writes of existing keys yield `None`.
    async fn bulk_write(&self, writes: Vec<Write>) -> Result<Vec<Option<Revision>>>;

    /// Tombstone one revision, typically a losing conflict
    async fn delete_revision(&self, key: &str, rev: &Revision) -> Result<()>;

    /// Winning live revisions of every key under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<StoredDoc>>;

    /// Every leaf (live or deleted) under `prefix`, for replication
    async fn leaves(&self, prefix: &str) -> Result<Vec<StoredDoc>>;

    /// Merge replicated leaves, returning how many were new
    async fn insert_leaves(&self, docs: Vec<StoredDoc>) -> Result<usize>;

    /// Read a private record
    async fn get_local(&self, key: &str) -> Result<Option<Record>>;

    /// Write a private record
    async fn set_local(&self, key: &str, record: Record) -> Result<()>;
}

/// Outcome of one [`replicate`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub docs_read: usize,
    pub docs_written: usize,
}

/// Copy every leaf under `prefix` from `source` into `target`
pub async fn replicate(
    source: &dyn ReplicatedStore,
    target: &dyn ReplicatedStore,
    prefix: &str,
) -> Result<ReplicationReport> {
    let leaves: Vec<StoredDoc> = source
        .leaves(prefix)
        .await?
        .into_iter()
        .filter(|d| !d.key.starts_with(keys::LOCAL_PREFIX))
        .collect();
    let docs_read = leaves.len();
    let docs_written = target.insert_leaves(leaves).await?;
    tracing::debug!(prefix, docs_read, docs_written, "replicated");
    Ok(ReplicationReport {
        docs_read,
        docs_written,
    })
}

/// Apply `writes` to `sets`, all-or-nothing.
///
/// `load` supplies the current leaves of keys not yet in `sets`.
pub(crate) fn apply_writes(
    sets: &mut HashMap<String, LeafSet>,
    writes: Vec<Write>,
    mut load: impl FnMut(&str) -> Result<LeafSet>,
) -> Result<Vec<Option<Revision>>> {
    let mut staged: HashMap<String, LeafSet> = HashMap::new();
    let mut revs = Vec::with_capacity(writes.len());
    for write in writes {
        let key = write.key().to_string();
        if !staged.contains_key(&key) {
            let current = match sets.get(&key) {
                Some(set) => set.clone(),
                None => load(&key)?,
            };
            staged.insert(key.clone(), current);
        }
        let set = staged.entry(key.clone()).or_default();
        let rev = match write {
            Write::Immutable { record, .. } => {
                if set.live_winner().is_some() {
                    None
                } else {
                    Some(set.put(&key, None, record)?)
                }
            }
            Write::Update { base, record, .. } => Some(set.put(&key, base.as_ref(), record)?),
        };
        revs.push(rev);
    }
    sets.extend(staged);
    Ok(revs)
}

/// In-memory store
///
/// Used as the test double for the shared replicated database and as a
/// scratch replica. `set_offline` simulates a network partition.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, LeafSet>>,
    local: RwLock<HashMap<String, Record>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StorageError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    /// Total number of leaves held, for tests and diagnostics
    pub async fn leaf_count(&self) -> usize {
        self.docs.read().await.values().map(|s| s.leaves().len()).sum()
    }
}

#[async_trait]
impl ReplicatedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredDoc>> {
        self.check_online()?;
        let docs = self.docs.read().await;
        Ok(docs.get(key).and_then(|s| s.live_winner().cloned()))
    }

    async fn get_with_conflicts(&self, key: &str) -> Result<Option<Conflicted>> {
        self.check_online()?;
        let docs = self.docs.read().await;
        Ok(docs.get(key).and_then(LeafSet::conflicted))
    }

    async fn put(&self, key: &str, base: Option<&Revision>, record: Record) -> Result<Revision> {
        self.check_online()?;
        let mut docs = self.docs.write().await;
        docs.entry(key.to_string()).or_default().put(key, base, record)
    }

    async fn bulk_write(&self, writes: Vec<Write>) -> Result<Vec<Option<Revision>>> {
        self.check_online()?;
        let mut docs = self.docs.write().await;
        let mut sets = HashMap::new();
        let revs = apply_writes(&mut sets, writes, |key| Ok(docs.get(key).cloned().unwrap_or_default()))?;
        docs.extend(sets);
        Ok(revs)
    }

    async fn delete_revision(&self, key: &str, rev: &Revision) -> Result<()> {
        self.check_online()?;
        let mut docs = self.docs.write().await;
        docs.get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?
            .delete(key, rev)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredDoc>> {
        self.check_online()?;
        let docs = self.docs.read().await;
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(_, s)| s.live_winner().cloned())
            .collect())
    }

    async fn leaves(&self, prefix: &str) -> Result<Vec<StoredDoc>> {
        self.check_online()?;
        let docs = self.docs.read().await;
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .flat_map(|(_, s)| s.leaves().iter().cloned())
            .collect())
    }

    async fn insert_leaves(&self, incoming: Vec<StoredDoc>) -> Result<usize> {
        self.check_online()?;
        let mut docs = self.docs.write().await;
        let mut written = 0;
        for doc in incoming {
            if docs.entry(doc.key.clone()).or_default().insert_replica(doc) {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn get_local(&self, key: &str) -> Result<Option<Record>> {
        self.check_online()?;
        Ok(self.local.read().await.get(key).cloned())
    }

    async fn set_local(&self, key: &str, record: Record) -> Result<()> {
        self.check_online()?;
        self.local.write().await.insert(key.to_string(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Head, Metadata, ObjectId};

    fn head(tag: &[u8]) -> Record {
        Record::Ref(Head::initial(ObjectId::from_data(tag)))
    }

    #[tokio::test]
    async fn test_put_requires_current_revision() {
        let store = MemoryStore::new();
        let r1 = store.put("d/heads/master", None, head(b"a")).await.unwrap();
        assert_eq!(r1.generation(), 1);

        let r2 = store.put("d/heads/master", Some(&r1), head(b"b")).await.unwrap();
        assert_eq!(r2.generation(), 2);

        let stale = store.put("d/heads/master", Some(&r1), head(b"c")).await;
        assert!(matches!(stale, Err(StorageError::Conflict(_))));

        let create_again = store.put("d/heads/master", None, head(b"c")).await;
        assert!(matches!(create_again, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_bulk_write_is_atomic() {
        let store = MemoryStore::new();
        let r1 = store.put("d/metadata", None, Record::Metadata(Metadata::new(None, 1))).await.unwrap();
        store.put("d/metadata", Some(&r1), Record::Metadata(Metadata::new(None, 2))).await.unwrap();

        let result = store
            .bulk_write(vec![
                Write::Update { key: "d/heads/master".into(), base: None, record: head(b"a") },
                Write::Update {
                    key: "d/metadata".into(),
                    base: Some(r1),
                    record: Record::Metadata(Metadata::new(None, 3)),
                },
            ])
            .await;
        assert!(result.is_err());
        assert!(store.get("d/heads/master").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_immutable_write_is_idempotent() {
        let store = MemoryStore::new();
        let write = || Write::Immutable { key: "d/x".into(), record: head(b"x") };
        let first = store.bulk_write(vec![write()]).await.unwrap();
        let second = store.bulk_write(vec![write()]).await.unwrap();
        assert!(first[0].is_some());
        assert!(second[0].is_none());
        assert_eq!(store.leaf_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_conflict_after_replication() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let base = a.put("d/heads/master", None, head(b"base")).await.unwrap();
        replicate(&a, &b, "d/").await.unwrap();

        a.put("d/heads/master", Some(&base), head(b"from-a")).await.unwrap();
        b.put("d/heads/master", Some(&base), head(b"from-b")).await.unwrap();

        replicate(&b, &a, "d/").await.unwrap();
        replicate(&a, &b, "d/").await.unwrap();

        let ca = a.get_with_conflicts("d/heads/master").await.unwrap().unwrap();
        let cb = b.get_with_conflicts("d/heads/master").await.unwrap().unwrap();
        assert_eq!(ca.conflicts.len(), 1);
        // Both replicas elect the same winner
        assert_eq!(ca.winner.rev, cb.winner.rev);
    }

    #[tokio::test]
    async fn test_descendant_replaces_ancestor_on_replication() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let r1 = a.put("d/heads/master", None, head(b"1")).await.unwrap();
        replicate(&a, &b, "d/").await.unwrap();
        a.put("d/heads/master", Some(&r1), head(b"2")).await.unwrap();

        let report = replicate(&a, &b, "d/").await.unwrap();
        assert_eq!(report.docs_written, 1);
        let c = b.get_with_conflicts("d/heads/master").await.unwrap().unwrap();
        assert!(!c.has_conflicts());
        assert_eq!(c.winner.rev.generation(), 2);

        let again = replicate(&a, &b, "d/").await.unwrap();
        assert_eq!(again.docs_written, 0);
    }

    #[tokio::test]
    async fn test_deleted_conflict_replicates() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let base = a.put("k/heads/master", None, head(b"base")).await.unwrap();
        replicate(&a, &b, "k/").await.unwrap();
        a.put("k/heads/master", Some(&base), head(b"a")).await.unwrap();
        b.put("k/heads/master", Some(&base), head(b"b")).await.unwrap();
        replicate(&b, &a, "k/").await.unwrap();

        let c = a.get_with_conflicts("k/heads/master").await.unwrap().unwrap();
        let loser = c.conflicts[0].rev.clone();
        a.delete_revision("k/heads/master", &loser).await.unwrap();
        assert!(!a.get_with_conflicts("k/heads/master").await.unwrap().unwrap().has_conflicts());

        replicate(&a, &b, "k/").await.unwrap();
        assert!(!b.get_with_conflicts("k/heads/master").await.unwrap().unwrap().has_conflicts());
    }

    #[tokio::test]
    async fn test_local_records_are_not_replicated() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        a.set_local(&keys::local_head("d"), head(b"mine")).await.unwrap();
        replicate(&a, &b, "").await.unwrap();
        assert!(b.get_local(&keys::local_head("d")).await.unwrap().is_none());
        assert!(a.get_local(&keys::local_head("d")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_store_rejects_calls() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(store.get("x").await, Err(StorageError::Unavailable(_))));
        store.set_offline(false);
        assert!(store.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_scopes_to_prefix() {
        let store = MemoryStore::new();
        store.put("a/1", None, head(b"1")).await.unwrap();
        store.put("a/2", None, head(b"2")).await.unwrap();
        store.put("ab/1", None, head(b"3")).await.unwrap();
        assert_eq!(store.list("a/").await.unwrap().len(), 2);
    }
}
