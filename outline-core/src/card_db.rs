//! SQLite persistence for card trees
//!
//! Cards, history snapshots and the last issued clock timestamp live in
//! `cards.sqlite` beside the replica store. A [`CardStore`] stays the working
//! copy; callers write each [`ApplyReport`] through with [`CardDb::record`].

use crate::card::{ApplyReport, Card, CardStore, HistorySnapshot};
use crate::hlc::{Hlc, Timestamp};
use crate::storage::{Result, StorageError};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const CLOCK_KEY: &str = "clock";

pub struct CardDb {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl CardDb {
    /// Open or create the card database under `path`
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let conn = Connection::open(path.join("cards.sqlite"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cards (
                id TEXT PRIMARY KEY,
                tree_id TEXT NOT NULL,
                body TEXT NOT NULL
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS cards_tree ON cards (tree_id);
            CREATE TABLE IF NOT EXISTS snapshots (
                tree_id TEXT NOT NULL,
                snapshot_key TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (tree_id, snapshot_key)
            ) WITHOUT ROWID;
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            ) WITHOUT ROWID;",
        )?;
        tracing::debug!("Opened card database at {:?}", path);
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

    /// Rebuild a card store from disk.
    ///
    /// The clock is moved past the last persisted timestamp so stamps issued
    /// after a restart still sort after everything already written.
    pub fn load(&self, mut clock: Hlc) -> Result<CardStore> {
        let conn = self.conn()?;

        let mut cards = Vec::new();
        let mut stmt = conn.prepare_cached("SELECT body FROM cards")?;
        for body in stmt.query_map([], |row| row.get::<_, String>(0))? {
            let card: Card = serde_json::from_str(&body?)?;
            cards.push(card);
        }

        let mut snapshots = Vec::new();
        let mut stmt = conn.prepare_cached("SELECT body FROM snapshots")?;
        for body in stmt.query_map([], |row| row.get::<_, String>(0))? {
            let snapshot: HistorySnapshot = serde_json::from_str(&body?)?;
            snapshots.push(snapshot);
        }

        let last: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key=?1", params![CLOCK_KEY], |row| row.get(0))
            .optional()?;
        if let Some(last) = last {
            let last: Timestamp = serde_json::from_str(&last)?;
            clock.recv(&last);
        }
        for card in &cards {
            clock.recv(&card.updated_at);
        }

        tracing::info!(cards = cards.len(), snapshots = snapshots.len(), "loaded card database");
        Ok(CardStore::restore(clock, cards, snapshots))
    }

    /// Write through the effects of one batch or merge.
    ///
    /// Snapshots named in `report.snapshots` are copied from `store` for
    /// every tree the report touched.
    pub fn record(&self, store: &CardStore, report: &ApplyReport) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for card in &report.changed {
            upsert_card(&tx, card)?;
        }
        for id in &report.removed {
            tx.execute("DELETE FROM cards WHERE id=?1", params![id])?;
        }
        let trees: BTreeSet<&str> = report.changed.iter().map(|c| c.tree_id.as_str()).collect();
        for tree_id in trees {
            for key in &report.snapshots {
                if let Some(snapshot) = store.snapshot(tree_id, key) {
                    insert_snapshot(&tx, snapshot)?;
                }
            }
        }
        save_clock(&tx, &store.clock().last())?;
        tx.commit()?;
        Ok(())
    }

    /// Replace everything stored for one tree with the store's current state
    pub fn save_tree(&self, store: &CardStore, tree_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cards WHERE tree_id=?1", params![tree_id])?;
        tx.execute("DELETE FROM snapshots WHERE tree_id=?1", params![tree_id])?;
        for card in store.cards(tree_id) {
            upsert_card(&tx, &card)?;
        }
        for snapshot in store.snapshots(tree_id) {
            insert_snapshot(&tx, snapshot)?;
        }
        save_clock(&tx, &store.clock().last())?;
        tx.commit()?;
        Ok(())
    }
}

fn upsert_card(tx: &Transaction<'_>, card: &Card) -> Result<()> {
    tx.execute(
        "INSERT INTO cards (id,tree_id,body) VALUES (?1,?2,?3) \
         ON CONFLICT(id) DO UPDATE SET tree_id=excluded.tree_id, body=excluded.body",
        params![card.id, card.tree_id, serde_json::to_string(card)?],
    )?;
    Ok(())
}

fn insert_snapshot(tx: &Transaction<'_>, snapshot: &HistorySnapshot) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO snapshots (tree_id,snapshot_key,body) VALUES (?1,?2,?3)",
        params![
            snapshot.tree_id,
            serde_json::to_string(&snapshot.snapshot_key)?,
            serde_json::to_string(snapshot)?,
        ],
    )?;
    Ok(())
}

fn save_clock(tx: &Transaction<'_>, last: &Timestamp) -> Result<()> {
    tx.execute(
        "INSERT INTO meta (key,value) VALUES (?1,?2) ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![CLOCK_KEY, serde_json::to_string(last)?],
    )?;
    Ok(())
}
