//! Local workspace: a directory holding the client config, a SQLite replica
//! and the card database migrated documents land in.

use anyhow::{anyhow, bail, Context, Result};
use outline_core::card::Card;
use outline_core::export;
use outline_core::hlc::Hlc;
use outline_core::object::{Commit, ObjectId, WorkingTree};
use outline_core::replication::{self, EditBatch, MergeEvent, Resolution, SaveOutcome};
use outline_core::sync::{Session, CONFIG_FILE};
use outline_core::{merge_trees, migrate_document, CardDb, MigrationOutcome, SqliteStore, SyncConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Workspace {
    dir: PathBuf,
    config: SyncConfig,
    store: Arc<SqliteStore>,
}

/// Result of [`Workspace::merge`]
#[derive(Debug)]
pub struct Merged {
    pub outcome: SaveOutcome,
    /// Local ids edited on both sides; our version was kept
    pub conflicts: Vec<String>,
}

impl Workspace {
    /// Create a workspace, keeping any existing config
    pub fn init(dir: &Path, author: Option<String>) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut config = SyncConfig::load(dir)?;
        if let Some(author) = author {
            config.author = author;
        }
        config.save(dir)?;
        let store = SqliteStore::open(dir).with_context(|| format!("Failed to open store in {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            store: Arc::new(store),
        })
    }

    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.join(CONFIG_FILE).exists() {
            bail!("{} is not an outline workspace (run `outlinesync init`)", dir.display());
        }
        let config = SyncConfig::load(dir)?;
        let store = SqliteStore::open(dir).with_context(|| format!("Failed to open store in {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            store: Arc::new(store),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Session over the local replica, primed with the known object ids
    pub async fn session(&self, document_id: &str) -> Result<Session> {
        let session = Session::new(document_id, self.store.clone());
        session.load().await?;
        Ok(session)
    }

    pub async fn commit(&self, document_id: &str, tree: WorkingTree, name: Option<String>) -> Result<SaveOutcome> {
        let session = self.session(document_id).await?;
        let mut batch = EditBatch::new(self.config.author.clone(), tree, now_ms());
        batch.name = name;
        Ok(session.save(batch).await?)
    }

    /// Commits reachable from the head, newest first
    pub async fn log(&self, document_id: &str, limit: usize) -> Result<Vec<Commit>> {
        let (doc, _) = replication::load(self.store.as_ref(), document_id).await?;
        let Some(head) = &doc.head else {
            return Ok(Vec::new());
        };
        let graph = doc.graph();
        Ok(graph.log(&head.value.value, limit).into_iter().cloned().collect())
    }

    /// Working tree at `at`, or at the head
    pub async fn checkout(&self, document_id: &str, at: Option<ObjectId>) -> Result<WorkingTree> {
        let (doc, _) = replication::load_at(self.store.as_ref(), document_id, at).await?;
        doc.working_tree()?
            .ok_or_else(|| anyhow!("Document {} has no commits", document_id))
    }

    /// Settle ref conflicts, merging diverged heads automatically.
    ///
    /// Returns `None` when there was nothing to merge.
    pub async fn merge(&self, document_id: &str) -> Result<Option<Merged>> {
        let resolution = replication::resolve_ref_conflicts(self.store.as_ref(), document_id).await?;
        let event = match resolution {
            Resolution::MergeRequired(event) => event,
            _ => return Ok(None),
        };
        let (tree, conflicts) = merged_tree(&event)?;
        let session = self.session(document_id).await?;
        let batch = EditBatch::new(self.config.author.clone(), tree, now_ms())
            .with_parents(vec![event.local, event.remote]);
        let outcome = session.save(batch).await?;
        Ok(Some(Merged { outcome, conflicts }))
    }

    /// Write the head tree as JSON, returning the verified hash
    pub async fn export(&self, document_id: &str, out: &Path) -> Result<String> {
        let tree = self.checkout(document_id, None).await?;
        let payload = export::tree_json(&tree)?;
        Ok(export::export_verified(out, &payload)?)
    }

    /// Convert the document to cards and write them as JSON
    pub async fn migrate(&self, document_id: &str, out: &Path) -> Result<(MigrationOutcome, String)> {
        let db = CardDb::open(&self.dir).context("Failed to open card database")?;
        let mut cards = db.load(Hlc::new(self.config.client_id.clone()))?;
        let outcome = migrate_document(self.store.as_ref(), document_id, &mut cards).await?;
        if outcome.created {
            db.save_tree(&cards, &outcome.tree_id)?;
        }
        let visible: Vec<Card> = cards.visible(&outcome.tree_id);
        let hash = export::export_verified(out, &export::cards_json(&visible)?)?;
        Ok((outcome, hash))
    }
}

/// Open another workspace's replica as a remote
pub fn open_remote(dir: &Path) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(dir).with_context(|| format!("Failed to open remote {}", dir.display()))?;
    Ok(Arc::new(store))
}

/// Read a working tree from a JSON file
pub fn read_tree(path: &Path) -> Result<WorkingTree> {
    let data = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let tree = serde_json::from_str(&data).with_context(|| format!("{} is not an outline tree", path.display()))?;
    Ok(tree)
}

fn merged_tree(event: &MergeEvent) -> Result<(WorkingTree, Vec<String>)> {
    let graph = event.graph();
    let ours = graph.checkout(&event.local)?;
    let theirs = graph.checkout(&event.remote)?;
    let base = match event.merge_base() {
        Some(id) => graph.checkout(&id)?,
        None => WorkingTree::leaf(ours.id.clone(), ""),
    };
    let outcome = merge_trees(&base, &ours, &theirs);
    Ok((outcome.tree, outcome.conflicts))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outline(items: &[(&str, &str)]) -> WorkingTree {
        WorkingTree::node(
            "0",
            "",
            items.iter().map(|(id, text)| WorkingTree::leaf(*id, *text)).collect(),
        )
    }

    #[test]
    fn test_open_requires_init() {
        let dir = TempDir::new().unwrap();
        assert!(Workspace::open(dir.path()).is_err());
        Workspace::init(dir.path(), Some("alice".into())).unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        assert_eq!(ws.config().author, "alice");
    }

    #[tokio::test]
    async fn test_commit_log_checkout() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::init(dir.path(), Some("alice".into())).unwrap();
        let first = ws.commit("doc", outline(&[("1", "a")]), Some("Notes".into())).await.unwrap();
        let second = ws.commit("doc", outline(&[("1", "a"), ("2", "b")]), None).await.unwrap();

        let log = ws.log("doc", 10).await.unwrap();
        assert_eq!(log.iter().map(|c| c.id).collect::<Vec<_>>(), vec![second.commit, first.commit]);
        assert_eq!(log[0].author, "alice");

        let old = ws.checkout("doc", Some(first.commit)).await.unwrap();
        assert_eq!(old.children.len(), 1);
        let head = ws.checkout("doc", None).await.unwrap();
        assert_eq!(head.children.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_diverged_workspaces() {
        let remote_dir = TempDir::new().unwrap();
        let a_dir = TempDir::new().unwrap();
        let b_dir = TempDir::new().unwrap();
        let remote = open_remote(remote_dir.path()).unwrap();
        let a = Workspace::init(a_dir.path(), Some("a".into())).unwrap();
        let b = Workspace::init(b_dir.path(), Some("b".into())).unwrap();

        a.commit("doc", outline(&[("1", "base")]), None).await.unwrap();
        a.session("doc").await.unwrap().push(remote.as_ref(), true).await.unwrap();
        b.session("doc").await.unwrap().pull(remote.as_ref()).await.unwrap();

        a.commit("doc", outline(&[("1", "base"), ("2", "from a")]), None).await.unwrap();
        b.commit("doc", outline(&[("1", "edited by b")]), None).await.unwrap();
        a.session("doc").await.unwrap().push(remote.as_ref(), true).await.unwrap();

        let pulled = b.session("doc").await.unwrap().pull(remote.as_ref()).await.unwrap().unwrap();
        assert!(pulled.conflicts_exist());

        let merged = b.merge("doc").await.unwrap().unwrap();
        assert!(merged.conflicts.is_empty());
        let tree = b.checkout("doc", None).await.unwrap();
        assert_eq!(tree.find("1").unwrap().content, "edited by b");
        assert_eq!(tree.find("2").unwrap().content, "from a");
        assert!(b.merge("doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_export_and_migrate() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::init(dir.path(), None).unwrap();
        ws.commit("doc", outline(&[("1", "a"), ("2", "b")]), None).await.unwrap();

        let out = dir.path().join("doc.json");
        let hash = ws.export("doc", &out).await.unwrap();
        assert_eq!(hash, export::content_hash(&std::fs::read(&out).unwrap()));
        let tree = read_tree(&out).unwrap();
        assert_eq!(tree.children.len(), 2);

        let cards_out = dir.path().join("cards.json");
        let (outcome, _) = ws.migrate("doc", &cards_out).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.cards.len(), 3);
        let written: Vec<Card> = serde_json::from_slice(&std::fs::read(&cards_out).unwrap()).unwrap();
        assert_eq!(written.len(), 3);
    }

    #[tokio::test]
    async fn test_second_migrate_reuses_cards() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::init(dir.path(), None).unwrap();
        ws.commit("doc", outline(&[("1", "a"), ("2", "b")]), None).await.unwrap();

        let out = dir.path().join("cards.json");
        let (first, _) = ws.migrate("doc", &out).await.unwrap();
        assert!(first.created);

        // Fresh handle, as a second CLI invocation would have
        let ws = Workspace::open(dir.path()).unwrap();
        let (second, _) = ws.migrate("doc", &out).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.tree_id, first.tree_id);
        let ids = |cards: &[Card]| {
            let mut ids: Vec<String> = cards.iter().map(|c| c.id.clone()).collect();
            ids.sort();
            ids
        };
        assert_eq!(ids(&second.cards), ids(&first.cards));
    }
}
