//! Replication and conflict resolution for commit-model documents.
//!
//! A document lives under `<documentId>/` in a [`ReplicatedStore`]: immutable
//! tree and commit records, one mutable head ref and one metadata record.
//! Clients save into a local replica, then pull from and push to a shared
//! store. Concurrent head updates leave more than one live ref revision
//! behind; [`resolve_ref_conflicts`] decides whether that was harmless or
//! whether the application has to merge.

use crate::history::{CommitGraph, HistoryError};
use crate::object::{commit_tree, Commit, CommitBundle, Head, Metadata, ObjectId, Record, TreeObject, WorkingTree};
use crate::storage::{self, keys, ReplicatedStore, ReplicationReport, Revision, StorageError, Write};
use std::collections::HashSet;

/// Errors surfaced by load, save, pull, push and sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Another pull or push of {0} is in flight")]
    Busy(String),

    #[error("Commit worker failed: {0}")]
    Worker(String),

    #[error("Record {key} is a {found}, expected {expected}")]
    UnexpectedRecord {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl SyncError {
    /// Network or store failure the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(StorageError::Unavailable(_)) | SyncError::Storage(StorageError::Io(_)) | SyncError::Busy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// A value together with the store revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub rev: Revision,
}

/// Everything known about one document in one store
#[derive(Debug, Clone, Default)]
pub struct LoadedDocument {
    pub document_id: String,
    pub commits: Vec<Commit>,
    pub trees: Vec<TreeObject>,
    /// Winning head ref; `None` for a bare document
    pub head: Option<Versioned<Head>>,
    /// Live ref revisions that lost the election
    pub conflicts: Vec<Versioned<Head>>,
    pub metadata: Option<Versioned<Metadata>>,
    /// Commit to display; the head unless a preview was requested
    pub checkout: Option<ObjectId>,
}

impl LoadedDocument {
    pub fn is_bare(&self) -> bool {
        self.head.is_none()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn graph(&self) -> CommitGraph {
        CommitGraph::new(self.commits.iter().cloned(), self.trees.iter().cloned())
    }

    /// Working tree of the checked-out commit, `None` when bare
    pub fn working_tree(&self) -> Result<Option<WorkingTree>> {
        match &self.checkout {
            Some(id) => Ok(Some(self.graph().checkout(id)?)),
            None => Ok(None),
        }
    }

    pub fn known_ids(&self) -> HashSet<ObjectId> {
        self.commits
            .iter()
            .map(|c| c.id)
            .chain(self.trees.iter().map(|t| t.id))
            .collect()
    }
}

/// Load a document at its head
pub async fn load(store: &dyn ReplicatedStore, document_id: &str) -> Result<(LoadedDocument, HashSet<ObjectId>)> {
    load_at(store, document_id, None).await
}

/// Load a document, checking out `at` instead of the head when given.
///
/// The head is not moved. A missing head or metadata is not an error: the
/// document is returned bare.
pub async fn load_at(
    store: &dyn ReplicatedStore,
    document_id: &str,
    at: Option<ObjectId>,
) -> Result<(LoadedDocument, HashSet<ObjectId>)> {
    let mut doc = LoadedDocument {
        document_id: document_id.to_string(),
        ..Default::default()
    };
    for stored in store.list(&keys::namespace(document_id)).await? {
        match stored.record {
            Record::Commit(c) => doc.commits.push(c),
            Record::Tree(t) => doc.trees.push(t),
            Record::Ref(_) | Record::Metadata(_) => {}
        }
    }

    if let Some(conflicted) = store.get_with_conflicts(&keys::head(document_id)).await? {
        doc.head = Some(versioned_head(&conflicted.winner.key, conflicted.winner.record, conflicted.winner.rev)?);
        for loser in conflicted.conflicts {
            doc.conflicts.push(versioned_head(&loser.key, loser.record, loser.rev)?);
        }
    }

    let metadata_key = keys::metadata(document_id);
    if let Some(stored) = store.get(&metadata_key).await? {
        doc.metadata = Some(Versioned {
            value: expect_metadata(&metadata_key, stored.record)?,
            rev: stored.rev,
        });
    }

    doc.checkout = at.or_else(|| doc.head.as_ref().map(|h| h.value.value));
    let known = doc.known_ids();
    tracing::debug!(
        document_id,
        commits = doc.commits.len(),
        trees = doc.trees.len(),
        conflicts = doc.conflicts.len(),
        "loaded document"
    );
    Ok((doc, known))
}

fn versioned_head(key: &str, record: Record, rev: Revision) -> Result<Versioned<Head>> {
    match record {
        Record::Ref(head) => Ok(Versioned { value: head, rev }),
        other => Err(SyncError::UnexpectedRecord {
            key: key.to_string(),
            expected: "ref",
            found: other.kind(),
        }),
    }
}

fn expect_metadata(key: &str, record: Record) -> Result<Metadata> {
    match record {
        Record::Metadata(m) => Ok(m),
        other => Err(SyncError::UnexpectedRecord {
            key: key.to_string(),
            expected: "metadata",
            found: other.kind(),
        }),
    }
}

/// One edit to commit
#[derive(Debug, Clone)]
pub struct EditBatch {
    pub author: String,
    pub tree: WorkingTree,
    /// Unix milliseconds
    pub timestamp: i64,
    /// New document name; `None` keeps the current one
    pub name: Option<String>,
    /// Explicit parents, e.g. both sides of a merge; defaults to the head
    pub parents: Option<Vec<ObjectId>>,
}

impl EditBatch {
    pub fn new(author: impl Into<String>, tree: WorkingTree, timestamp: i64) -> Self {
        Self {
            author: author.into(),
            tree,
            timestamp,
            name: None,
            parents: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parents(mut self, parents: Vec<ObjectId>) -> Self {
        self.parents = Some(parents);
        self
    }
}

/// Two diverged heads the application must merge.
///
/// Saving a commit whose parents include both `local` and `remote`
/// acknowledges the event; the resolver then drops the losing ref revisions.
#[derive(Debug, Clone)]
pub struct MergeEvent {
    pub document_id: String,
    pub local: ObjectId,
    pub remote: ObjectId,
    pub commits: Vec<Commit>,
    pub trees: Vec<TreeObject>,
}

impl MergeEvent {
    pub fn graph(&self) -> CommitGraph {
        CommitGraph::new(self.commits.iter().cloned(), self.trees.iter().cloned())
    }

    pub fn merge_base(&self) -> Option<ObjectId> {
        self.graph().merge_base(&self.local, &self.remote)
    }
}

/// What [`resolve_ref_conflicts`] did
#[derive(Debug, Clone)]
pub enum Resolution {
    /// At most one live ref revision
    Clean,
    /// Losing revisions carried nothing new and were deleted
    Transparent { kept: ObjectId, deleted: Vec<Revision> },
    /// Genuine divergence; nothing was deleted
    MergeRequired(MergeEvent),
}

impl Resolution {
    pub fn merge(&self) -> Option<&MergeEvent> {
        match self {
            Resolution::MergeRequired(event) => Some(event),
            _ => None,
        }
    }

    pub fn conflicts_exist(&self) -> bool {
        matches!(self, Resolution::MergeRequired(_))
    }
}

/// Result of [`save`]
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub commit: ObjectId,
    /// Keys written by the bulk write
    pub persisted: Vec<String>,
    pub known: HashSet<ObjectId>,
    pub conflicts_exist: bool,
    pub metadata: Metadata,
    pub head: Head,
    /// Saved tree annotated with object ids
    pub tree: WorkingTree,
    pub merge: Option<MergeEvent>,
}

/// Commit `batch` and move the head to it.
///
/// Hashing runs on the blocking pool. New objects, the ref and the metadata
/// go out in one atomic bulk write; the head written is then kept privately
/// so later conflicts can tell which side was ours.
pub async fn save(
    store: &dyn ReplicatedStore,
    document_id: &str,
    batch: EditBatch,
    known: &HashSet<ObjectId>,
) -> Result<SaveOutcome> {
    let head_key = keys::head(document_id);
    let metadata_key = keys::metadata(document_id);

    let current = store.get_with_conflicts(&head_key).await?;
    let current_metadata = match store.get(&metadata_key).await? {
        Some(stored) => Some(Versioned {
            value: expect_metadata(&metadata_key, stored.record)?,
            rev: stored.rev,
        }),
        None => None,
    };

    let mut live_heads = Vec::new();
    if let Some(conflicted) = &current {
        for stored in conflicted.all() {
            live_heads.push(versioned_head(&stored.key, stored.record.clone(), stored.rev.clone())?);
        }
    }
    let winner = live_heads.first().cloned();
    let parents = match batch.parents.clone() {
        Some(parents) => parents,
        None => winner.iter().map(|h| h.value.value).collect(),
    };

    let mut metadata = match &current_metadata {
        Some(m) => m.value.clone(),
        None => Metadata::new(None, batch.timestamp),
    };
    if let Some(name) = &batch.name {
        metadata.name = Some(name.clone());
    }
    metadata.updated_at = metadata.updated_at.max(batch.timestamp);

    let EditBatch {
        author,
        tree,
        timestamp,
        ..
    } = batch;
    let bundle_metadata = metadata.clone();
    let (bundle, tree) = tokio::task::spawn_blocking(move || {
        let mut tree = tree;
        let bundle = commit_tree(&author, parents, &mut tree, timestamp, Some(bundle_metadata));
        (bundle, tree)
    })
    .await
    .map_err(|e| SyncError::Worker(e.to_string()))?;
    let commit_id = bundle.commit_id();

    // Fold every live head this commit builds on
    let folded: Vec<&Head> = live_heads
        .iter()
        .map(|h| &h.value)
        .filter(|h| bundle.commit.parents.contains(&h.value))
        .collect();
    let head = Head::advance(commit_id, folded);

    let (writes, persisted) = build_writes(document_id, &bundle, known, &head, winner.as_ref(), current_metadata.as_ref());
    store.bulk_write(writes).await?;
    store.set_local(&keys::local_head(document_id), Record::Ref(head.clone())).await?;
    tracing::info!(document_id, commit = %commit_id, objects = persisted.len(), "saved commit");

    let mut known = known.clone();
    known.extend(bundle.objects.iter().map(|t| t.id));
    known.insert(commit_id);

    let resolution = resolve_ref_conflicts(store, document_id).await?;
    Ok(SaveOutcome {
        commit: commit_id,
        persisted,
        known,
        conflicts_exist: resolution.conflicts_exist(),
        metadata,
        head,
        tree,
        merge: resolution.merge().cloned(),
    })
}

fn build_writes(
    document_id: &str,
    bundle: &CommitBundle,
    known: &HashSet<ObjectId>,
    head: &Head,
    current_head: Option<&Versioned<Head>>,
    current_metadata: Option<&Versioned<Metadata>>,
) -> (Vec<Write>, Vec<String>) {
    let mut writes = Vec::new();
    for record in bundle.immutable_records() {
        let Some(id) = record.object_id() else { continue };
        if known.contains(&id) {
            continue;
        }
        writes.push(Write::Immutable {
            key: keys::object(document_id, &id),
            record,
        });
    }
    writes.push(Write::Update {
        key: keys::head(document_id),
        base: current_head.map(|h| h.rev.clone()),
        record: Record::Ref(head.clone()),
    });
    if let Some(metadata) = &bundle.metadata {
        writes.push(Write::Update {
            key: keys::metadata(document_id),
            base: current_metadata.map(|m| m.rev.clone()),
            record: Record::Metadata(metadata.clone()),
        });
    }
    let persisted = writes.iter().map(|w| w.key().to_string()).collect();
    (writes, persisted)
}

/// Arbitrate conflicting head revisions.
///
/// The store's election is only a generation tiebreak, so it is never taken
/// as proof that a conflict was harmless. A conflict is transparent when one
/// live head already contains every other live value: the losers are
/// deleted. This covers a winner equal to the private copy of our last write
/// as well as plain fast-forwards. Anything else is a merge event naming the
/// private copy (or the winner, if this client never wrote) as local.
pub async fn resolve_ref_conflicts(store: &dyn ReplicatedStore, document_id: &str) -> Result<Resolution> {
    let head_key = keys::head(document_id);
    let Some(conflicted) = store.get_with_conflicts(&head_key).await? else {
        return Ok(Resolution::Clean);
    };
    if !conflicted.has_conflicts() {
        return Ok(Resolution::Clean);
    }

    let mut leaves = Vec::new();
    for stored in conflicted.all() {
        leaves.push(versioned_head(&stored.key, stored.record.clone(), stored.rev.clone())?);
    }
    let private = match store.get_local(&keys::local_head(document_id)).await? {
        Some(Record::Ref(head)) => Some(head),
        _ => None,
    };

    // Prefer keeping our own value when it dominates
    let mut candidates: Vec<&Versioned<Head>> = leaves.iter().collect();
    if let Some(private) = &private {
        candidates.sort_by_key(|h| h.value.value != private.value);
    }
    let dominant = candidates.into_iter().find(|candidate| {
        leaves
            .iter()
            .all(|other| other.value.value == candidate.value.value || candidate.value.contains(&other.value.value))
    });

    if let Some(dominant) = dominant {
        let kept = dominant.value.value;
        let keep_rev = dominant.rev.clone();
        let mut deleted = Vec::new();
        for leaf in &leaves {
            if leaf.rev != keep_rev {
                store.delete_revision(&head_key, &leaf.rev).await?;
                deleted.push(leaf.rev.clone());
            }
        }
        tracing::info!(document_id, kept = %kept, deleted = deleted.len(), "resolved ref conflict transparently");
        return Ok(Resolution::Transparent { kept, deleted });
    }

    // `all()` yields the store's winner first
    let winner_value = leaves[0].value.value;
    let local = private
        .as_ref()
        .map(|h| h.value)
        .filter(|v| leaves.iter().any(|l| l.value.value == *v))
        .unwrap_or(winner_value);
    let remote = leaves
        .iter()
        .map(|l| l.value.value)
        .find(|v| *v != local)
        .unwrap_or(local);

    let (doc, _) = load(store, document_id).await?;
    tracing::warn!(document_id, local = %local, remote = %remote, "ref conflict requires merge");
    Ok(Resolution::MergeRequired(MergeEvent {
        document_id: document_id.to_string(),
        local,
        remote,
        commits: doc.commits,
        trees: doc.trees,
    }))
}

/// Keep the metadata copy with the greatest `updatedAt`, delete the rest.
///
/// Ties keep the store's winner. Returns the number of revisions deleted.
pub async fn resolve_metadata_conflicts(store: &dyn ReplicatedStore, document_id: &str) -> Result<usize> {
    let key = keys::metadata(document_id);
    let Some(conflicted) = store.get_with_conflicts(&key).await? else {
        return Ok(0);
    };
    if !conflicted.has_conflicts() {
        return Ok(0);
    }

    let mut copies = Vec::new();
    for stored in conflicted.all() {
        copies.push(Versioned {
            value: expect_metadata(&key, stored.record.clone())?,
            rev: stored.rev.clone(),
        });
    }
    // Winner comes first; ties keep it
    let keep = copies
        .iter()
        .fold(None::<&Versioned<Metadata>>, |best, m| match best {
            Some(b) if b.value.updated_at >= m.value.updated_at => Some(b),
            _ => Some(m),
        })
        .map(|m| m.rev.clone());

    let mut deleted = 0;
    for copy in &copies {
        if Some(&copy.rev) != keep.as_ref() {
            store.delete_revision(&key, &copy.rev).await?;
            deleted += 1;
        }
    }
    tracing::debug!(document_id, deleted, "resolved metadata conflicts");
    Ok(deleted)
}

/// Result of a pull that brought in new data
#[derive(Debug, Clone)]
pub struct Pulled {
    pub document: LoadedDocument,
    pub resolution: Resolution,
    pub report: ReplicationReport,
}

impl Pulled {
    pub fn conflicts_exist(&self) -> bool {
        self.resolution.conflicts_exist()
    }
}

/// Replicate `remote` into `local` for one document.
///
/// Returns `None` when nothing new arrived. Metadata conflicts are settled
/// before the document is loaded and handed back.
pub async fn pull(local: &dyn ReplicatedStore, remote: &dyn ReplicatedStore, document_id: &str) -> Result<Option<Pulled>> {
    let report = storage::replicate(remote, local, &keys::namespace(document_id)).await?;
    if report.docs_written == 0 {
        tracing::debug!(document_id, "pull brought nothing new");
        return Ok(None);
    }
    resolve_metadata_conflicts(local, document_id).await?;
    let resolution = resolve_ref_conflicts(local, document_id).await?;
    let (document, _) = load(local, document_id).await?;
    tracing::info!(document_id, written = report.docs_written, "pulled");
    Ok(Some(Pulled {
        document,
        resolution,
        report,
    }))
}

/// Replicate `local` into `remote` for one document.
///
/// With `only_if_no_conflicts`, nothing is sent while the local ref is
/// conflicted and `None` is returned.
pub async fn push(
    local: &dyn ReplicatedStore,
    remote: &dyn ReplicatedStore,
    document_id: &str,
    only_if_no_conflicts: bool,
) -> Result<Option<ReplicationReport>> {
    if only_if_no_conflicts {
        let conflicted = local
            .get_with_conflicts(&keys::head(document_id))
            .await?
            .is_some_and(|c| c.has_conflicts());
        if conflicted {
            tracing::warn!(document_id, "push skipped: unresolved ref conflicts");
            return Ok(None);
        }
    }
    let report = storage::replicate(local, remote, &keys::namespace(document_id)).await?;
    tracing::info!(document_id, written = report.docs_written, "pushed");
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn outline(text: &str) -> WorkingTree {
        WorkingTree::node("0", "", vec![WorkingTree::leaf("1", text)])
    }

    #[tokio::test]
    async fn test_load_bare_document() {
        let store = MemoryStore::new();
        let (doc, known) = load(&store, "doc").await.unwrap();
        assert!(doc.is_bare());
        assert!(known.is_empty());
        assert!(doc.working_tree().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStore::new();
        let outcome = save(&store, "doc", EditBatch::new("alice", outline("hi"), 10).with_name("Notes"), &HashSet::new())
            .await
            .unwrap();
        assert!(!outcome.conflicts_exist);
        assert_eq!(outcome.metadata.name.as_deref(), Some("Notes"));
        assert!(outcome.persisted.contains(&keys::head("doc")));

        let (doc, known) = load(&store, "doc").await.unwrap();
        assert_eq!(doc.head.as_ref().unwrap().value.value, outcome.commit);
        assert_eq!(known, outcome.known);
        assert_eq!(doc.working_tree().unwrap().unwrap().children[0].content, "hi");
    }

    #[tokio::test]
    async fn test_second_save_advances_head() {
        let store = MemoryStore::new();
        let first = save(&store, "doc", EditBatch::new("alice", outline("one"), 10), &HashSet::new())
            .await
            .unwrap();
        let second = save(&store, "doc", EditBatch::new("alice", outline("two"), 20), &first.known)
            .await
            .unwrap();
        assert_eq!(second.head.ancestors, vec![first.commit]);
        assert!(!second.persisted.contains(&keys::object("doc", &first.commit)));
    }

    #[tokio::test]
    async fn test_load_at_previews_older_commit() {
        let store = MemoryStore::new();
        let first = save(&store, "doc", EditBatch::new("alice", outline("one"), 10), &HashSet::new())
            .await
            .unwrap();
        let second = save(&store, "doc", EditBatch::new("alice", outline("two"), 20), &first.known)
            .await
            .unwrap();
        let (doc, _) = load_at(&store, "doc", Some(first.commit)).await.unwrap();
        assert_eq!(doc.head.as_ref().unwrap().value.value, second.commit);
        assert_eq!(doc.working_tree().unwrap().unwrap().children[0].content, "one");
    }

    #[tokio::test]
    async fn test_metadata_conflict_keeps_latest() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        a.put(&keys::metadata("doc"), None, Record::Metadata(Metadata::new(Some("old".into()), 5)))
            .await
            .unwrap();
        b.put(&keys::metadata("doc"), None, Record::Metadata(Metadata::new(Some("new".into()), 9)))
            .await
            .unwrap();
        storage::replicate(&b, &a, "doc/").await.unwrap();
        assert_eq!(resolve_metadata_conflicts(&a, "doc").await.unwrap(), 1);
        let kept = a.get_with_conflicts(&keys::metadata("doc")).await.unwrap().unwrap();
        assert!(!kept.has_conflicts());
        assert_eq!(kept.winner.record, Record::Metadata(Metadata::new(Some("new".into()), 9)));
    }

    #[tokio::test]
    async fn test_push_guard_blocks_conflicted_ref() {
        let local = MemoryStore::new();
        let other = MemoryStore::new();
        let remote = MemoryStore::new();
        save(&local, "doc", EditBatch::new("alice", outline("a"), 1), &HashSet::new())
            .await
            .unwrap();
        save(&other, "doc", EditBatch::new("bob", outline("b"), 2), &HashSet::new())
            .await
            .unwrap();
        storage::replicate(&other, &local, "doc/").await.unwrap();
        assert!(matches!(resolve_ref_conflicts(&local, "doc").await.unwrap(), Resolution::MergeRequired(_)));

        assert!(push(&local, &remote, "doc", true).await.unwrap().is_none());
        assert_eq!(remote.leaf_count().await, 0);
    }

    #[tokio::test]
    async fn test_pull_reports_network_failure() {
        let local = MemoryStore::new();
        let remote = MemoryStore::new();
        remote.set_offline(true);
        let err = pull(&local, &remote, "doc").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
