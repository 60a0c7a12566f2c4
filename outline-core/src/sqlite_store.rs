//! SQLite-backed replicated store
//!
//! Keeps every leaf revision of every key in one table, with WAL mode for
//! write throughput. Winner election and revision ancestry are delegated to
//! [`LeafSet`] so the on-disk store behaves exactly like [`MemoryStore`].
//!
//! [`MemoryStore`]: crate::storage::MemoryStore

use crate::object::Record;
use crate::storage::{
    Conflicted, LeafSet, ReplicatedStore, Result, Revision, StorageError, StoredDoc, Write, apply_writes,
};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

fn open_db(root: &Path) -> Result<Connection> {
    std::fs::create_dir_all(root)?;
    let db_path = root.join("store.sqlite");
    let conn = Connection::open(&db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS leaves (
            key TEXT NOT NULL,
            rev TEXT NOT NULL,
            deleted INTEGER NOT NULL,
            body TEXT NOT NULL,
            history TEXT NOT NULL,
            PRIMARY KEY (key, rev)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS local_docs (
            key TEXT PRIMARY KEY,
            body TEXT NOT NULL
        ) WITHOUT ROWID;",
    )?;
    Ok(conn)
}

fn row_to_doc(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, bool, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0, row.get(3)?, row.get(4)?))
}

fn decode_doc((key, rev, deleted, body, history): (String, String, bool, String, String)) -> Result<StoredDoc> {
    Ok(StoredDoc {
        key,
        rev: Revision::from(rev),
        deleted,
        record: serde_json::from_str(&body)?,
        history: serde_json::from_str(&history)?,
    })
}

fn conn_load_set(conn: &Connection, key: &str) -> Result<LeafSet> {
    let mut stmt = conn.prepare_cached("SELECT key,rev,deleted,body,history FROM leaves WHERE key=?1")?;
    let rows = stmt.query_map(params![key], row_to_doc)?;
    let mut leaves = Vec::new();
    for row in rows {
        leaves.push(decode_doc(row?)?);
    }
    Ok(LeafSet::from_leaves(leaves))
}

fn conn_store_set(conn: &Connection, key: &str, set: &LeafSet) -> Result<()> {
    conn.execute("DELETE FROM leaves WHERE key=?1", params![key])?;
    for doc in set.leaves() {
        conn.execute(
            "INSERT INTO leaves (key,rev,deleted,body,history) VALUES (?1,?2,?3,?4,?5)",
            params![
                key,
                doc.rev.as_str(),
                doc.deleted as i64,
                serde_json::to_string(&doc.record)?,
                serde_json::to_string(&doc.history)?,
            ],
        )?;
    }
    Ok(())
}

fn conn_prefix_docs(conn: &Connection, prefix: &str) -> Result<Vec<StoredDoc>> {
    let mut stmt = conn.prepare_cached(
        "SELECT key,rev,deleted,body,history FROM leaves WHERE substr(key,1,?2)=?1 ORDER BY key",
    )?;
    let rows = stmt.query_map(params![prefix, prefix.chars().count() as i64], row_to_doc)?;
    let mut docs = Vec::new();
    for row in rows {
        docs.push(decode_doc(row?)?);
    }
    Ok(docs)
}

/// Group leaves by key, preserving key order
fn group_by_key(docs: Vec<StoredDoc>) -> Vec<LeafSet> {
    let mut sets: Vec<(String, Vec<StoredDoc>)> = Vec::new();
    for doc in docs {
        match sets.last_mut() {
            Some((key, leaves)) if *key == doc.key => leaves.push(doc),
            _ => sets.push((doc.key.clone(), vec![doc])),
        }
    }
    sets.into_iter().map(|(_, leaves)| LeafSet::from_leaves(leaves)).collect()
}

/// SQLite-backed replicated store
pub struct SqliteStore {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store under `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_db(path)?;
        tracing::debug!("Opened SQLite store at {:?}", path);
        Ok(Self {
            root: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))
    }
}

#[async_trait]
impl ReplicatedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<StoredDoc>> {
        let conn = self.conn()?;
        Ok(conn_load_set(&conn, key)?.live_winner().cloned())
    }

    async fn get_with_conflicts(&self, key: &str) -> Result<Option<Conflicted>> {
        let conn = self.conn()?;
        Ok(conn_load_set(&conn, key)?.conflicted())
    }

    async fn put(&self, key: &str, base: Option<&Revision>, record: Record) -> Result<Revision> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut set = conn_load_set(&tx, key)?;
        let rev = set.put(key, base, record)?;
        conn_store_set(&tx, key, &set)?;
        tx.commit()?;
        Ok(rev)
    }

    async fn bulk_write(&self, writes: Vec<Write>) -> Result<Vec<Option<Revision>>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut sets: HashMap<String, LeafSet> = HashMap::new();
        let revs = apply_writes(&mut sets, writes, |key| conn_load_set(&tx, key))?;
        for (key, set) in &sets {
            conn_store_set(&tx, key, set)?;
        }
        tx.commit()?;
        Ok(revs)
    }

    async fn delete_revision(&self, key: &str, rev: &Revision) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut set = conn_load_set(&tx, key)?;
        if set.leaves().is_empty() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        set.delete(key, rev)?;
        conn_store_set(&tx, key, &set)?;
        tx.commit()?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredDoc>> {
        let conn = self.conn()?;
        let docs = conn_prefix_docs(&conn, prefix)?;
        Ok(group_by_key(docs)
            .iter()
            .filter_map(|s| s.live_winner().cloned())
            .collect())
    }

    async fn leaves(&self, prefix: &str) -> Result<Vec<StoredDoc>> {
        let conn = self.conn()?;
        conn_prefix_docs(&conn, prefix)
    }

    async fn insert_leaves(&self, docs: Vec<StoredDoc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut sets: HashMap<String, LeafSet> = HashMap::new();
        let mut written = 0;
        for doc in docs {
            let key = doc.key.clone();
            if !sets.contains_key(&key) {
                sets.insert(key.clone(), conn_load_set(&tx, &key)?);
            }
            if sets.entry(key).or_default().insert_replica(doc) {
                written += 1;
            }
        }
        for (key, set) in &sets {
            conn_store_set(&tx, key, set)?;
        }
        tx.commit()?;
        Ok(written)
    }

    async fn get_local(&self, key: &str) -> Result<Option<Record>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM local_docs WHERE key=?1", params![key], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    async fn set_local(&self, key: &str, record: Record) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO local_docs (key,body) VALUES (?1,?2) \
             ON CONFLICT(key) DO UPDATE SET body=excluded.body",
            params![key, serde_json::to_string(&record)?],
        )?;
        Ok(())
    }
}
