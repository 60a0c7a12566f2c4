//! Client configuration and per-document sync sessions.
//!
//! `SyncConfig` is the on-disk client configuration. `Session` carries the
//! state one client keeps for one open document: the local replica, the set
//! of object ids already persisted, and the pull lock that keeps a push from
//! starting while a pull/merge cycle is in flight (and vice versa).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::object::ObjectId;
use crate::replication::{self, EditBatch, LoadedDocument, Pulled, SaveOutcome, SyncError};
use crate::storage::{ReplicatedStore, ReplicationReport};

/// File name of the client configuration inside a workspace directory
pub const CONFIG_FILE: &str = "outline-sync.json";

// ─────────────────────────────────────────────────────
// Client configuration
// ─────────────────────────────────────────────────────

/// Client configuration stored at `<dir>/outline-sync.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// HLC node id; unique per client.
    pub client_id: String,
    /// Author recorded on commits.
    pub author: String,
    /// Silence on the delta channel before reconnecting.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Consecutive push failures before the error is surfaced.
    #[serde(default = "default_push_failure_threshold")]
    pub push_failure_threshold: u32,
    /// History snapshots kept per card tree.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots_per_tree: usize,
    /// Snapshots older than this are pruned; `None` keeps them forever.
    #[serde(default)]
    pub snapshot_max_age_hours: Option<u32>,
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_push_failure_threshold() -> u32 {
    4
}

fn default_max_snapshots() -> usize {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            author: "anonymous".to_string(),
            heartbeat_secs: default_heartbeat_secs(),
            push_failure_threshold: default_push_failure_threshold(),
            max_snapshots_per_tree: default_max_snapshots(),
            snapshot_max_age_hours: None,
        }
    }
}

impl SyncConfig {
    /// Load config from a workspace directory, or defaults if absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read sync config from {:?}", config_path))?;
        let config: SyncConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse sync config JSON")?;
        Ok(config)
    }

    /// Save config to a workspace directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn snapshot_max_age_ms(&self) -> Option<i64> {
        self.snapshot_max_age_hours.map(|h| i64::from(h) * 3_600_000)
    }
}

// ─────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────

/// Process-local mutual exclusion between pull and push
#[derive(Debug, Default)]
pub struct PullLock(AtomicBool);

impl PullLock {
    pub fn try_acquire(&self) -> Option<PullGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PullGuard(&self.0))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the [`PullLock`] on drop
pub struct PullGuard<'a>(&'a AtomicBool);

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One client's view of one document
pub struct Session {
    document_id: String,
    local: Arc<dyn ReplicatedStore>,
    known: Mutex<HashSet<ObjectId>>,
    lock: PullLock,
}

impl Session {
    pub fn new(document_id: impl Into<String>, local: Arc<dyn ReplicatedStore>) -> Self {
        Self {
            document_id: document_id.into(),
            local,
            known: Mutex::new(HashSet::new()),
            lock: PullLock::default(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn local(&self) -> &dyn ReplicatedStore {
        self.local.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_held()
    }

    fn known(&self) -> HashSet<ObjectId> {
        self.known.lock().map(|k| k.clone()).unwrap_or_default()
    }

    fn remember(&self, ids: HashSet<ObjectId>) {
        if let Ok(mut known) = self.known.lock() {
            *known = ids;
        }
    }

    fn acquire(&self) -> replication::Result<PullGuard<'_>> {
        self.lock
            .try_acquire()
            .ok_or_else(|| SyncError::Busy(self.document_id.clone()))
    }

    /// Load the document from the local replica
    pub async fn load(&self) -> replication::Result<LoadedDocument> {
        let (doc, known) = replication::load(self.local(), &self.document_id).await?;
        self.remember(known);
        Ok(doc)
    }

    /// Commit an edit into the local replica
    pub async fn save(&self, batch: EditBatch) -> replication::Result<SaveOutcome> {
        let known = self.known();
        let outcome = replication::save(self.local(), &self.document_id, batch, &known).await?;
        self.remember(outcome.known.clone());
        Ok(outcome)
    }

    pub async fn pull(&self, remote: &dyn ReplicatedStore) -> replication::Result<Option<Pulled>> {
        let _guard = self.acquire()?;
        self.pull_locked(remote).await
    }

    pub async fn push(
        &self,
        remote: &dyn ReplicatedStore,
        only_if_no_conflicts: bool,
    ) -> replication::Result<Option<ReplicationReport>> {
        let _guard = self.acquire()?;
        replication::push(self.local(), remote, &self.document_id, only_if_no_conflicts).await
    }

    async fn pull_locked(&self, remote: &dyn ReplicatedStore) -> replication::Result<Option<Pulled>> {
        let pulled = replication::pull(self.local(), remote, &self.document_id).await?;
        if let Some(pulled) = &pulled {
            self.remember(pulled.document.known_ids());
        }
        Ok(pulled)
    }

    /// Pull, hand the result to `on_pulled`, then push.
    ///
    /// `on_pulled` reports whether unresolved conflicts remain, falling back
    /// to `conflicts_exist` when it returns `None`. Known conflicts skip the
    /// push; otherwise the push is guarded. A merge event from the pull always
    /// counts as a conflict.
    pub async fn sync<P, Q>(
        &self,
        remote: &dyn ReplicatedStore,
        conflicts_exist: Option<bool>,
        on_pulled: P,
        on_pushed: Q,
    ) -> replication::Result<()>
    where
        P: FnOnce(Option<&Pulled>) -> Option<bool>,
        Q: FnOnce(Option<&ReplicationReport>),
    {
        let _guard = self.acquire()?;
        let pulled = self.pull_locked(remote).await?;
        let merge_pending = pulled.as_ref().is_some_and(Pulled::conflicts_exist);
        let status = on_pulled(pulled.as_ref()).or(conflicts_exist);

        // The guard stays on even when the caller reports no conflicts; an
        // older pull may have left the ref conflicted.
        let report = match (merge_pending, status) {
            (true, _) | (false, Some(true)) => {
                tracing::info!(document_id = %self.document_id, "sync skipped push: conflicts pending");
                None
            }
            (false, Some(false) | None) => replication::push(self.local(), remote, &self.document_id, true).await?,
        };
        on_pushed(report.as_ref());
        Ok(())
    }
}
