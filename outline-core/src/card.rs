//! Flat, tombstoned card store ordered by hybrid logical clock timestamps
//!
//! Cards form a tree through `parent_id`, with siblings ordered by `position`.
//! Every local change is stamped with a fresh [`Hlc`] timestamp and remote
//! changes merge last-writer-wins per card, so the same set of
//! `(card, timestamp)` pairs converges to the same state in any arrival order.

use crate::hlc::{Hlc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Errors from applying a card batch
#[derive(Debug, thiserror::Error)]
pub enum CardError {
    #[error("Card not found: {0}")]
    NotFound(String),

    #[error("Card {0} appears more than once in the batch")]
    Duplicate(String),
}

pub type Result<T> = std::result::Result<T, CardError>;

/// One outline node in the flat model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub tree_id: String,
    pub parent_id: Option<String>,
    pub content: String,
    pub position: f64,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub synced: bool,
}

impl Card {
    /// New unsynced card; the timestamp is assigned when the card is applied
    pub fn new(
        id: impl Into<String>,
        tree_id: impl Into<String>,
        parent_id: Option<String>,
        content: impl Into<String>,
        position: f64,
    ) -> Self {
        Self {
            id: id.into(),
            tree_id: tree_id.into(),
            parent_id,
            content: content.into(),
            position,
            updated_at: Timestamp::zero(),
            deleted: false,
            synced: false,
        }
    }
}

/// Local changes applied together by [`CardStore::apply_batch`]
#[derive(Debug, Clone, Default)]
pub struct CardBatch {
    /// Inserts and edits
    pub to_add: Vec<Card>,
    /// `(card id, timestamp that was pushed)`
    pub to_mark_synced: Vec<(String, Timestamp)>,
    pub to_tombstone: Vec<String>,
    /// Hard removals, bypassing tombstones
    pub to_remove: Vec<String>,
}

impl CardBatch {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_mark_synced.is_empty()
            && self.to_tombstone.is_empty()
            && self.to_remove.is_empty()
    }

    /// A lone, still-empty card insert does not deserve a history entry
    fn is_trivial(&self) -> bool {
        self.to_add.len() == 1
            && self.to_add[0].content.is_empty()
            && self.to_mark_synced.is_empty()
            && self.to_tombstone.is_empty()
            && self.to_remove.is_empty()
    }
}

/// Point-in-time copy of a tree's visible cards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub snapshot_key: Timestamp,
    pub tree_id: String,
    pub cards: Vec<Card>,
}

/// What a batch or merge changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Cards whose stored state changed, with their final value
    pub changed: Vec<Card>,
    pub removed: Vec<String>,
    pub snapshots: Vec<Timestamp>,
}

/// Card store of one client (or of the server, for a set of trees)
#[derive(Debug)]
pub struct CardStore {
    clock: Hlc,
    cards: BTreeMap<String, Card>,
    snapshots: BTreeMap<String, Vec<HistorySnapshot>>,
}

impl CardStore {
    pub fn new(clock: Hlc) -> Self {
        Self {
            clock,
            cards: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    /// Rebuild a store from persisted cards and snapshots
    pub fn restore(clock: Hlc, cards: Vec<Card>, snapshots: Vec<HistorySnapshot>) -> Self {
        let mut store = Self::new(clock);
        for card in cards {
            store.cards.insert(card.id.clone(), card);
        }
        for snapshot in snapshots {
            store.snapshots.entry(snapshot.tree_id.clone()).or_default().push(snapshot);
        }
        for list in store.snapshots.values_mut() {
            list.sort_by(|a, b| a.snapshot_key.cmp(&b.snapshot_key));
        }
        store
    }

    pub fn clock(&self) -> &Hlc {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut Hlc {
        &mut self.clock
    }

    pub fn get(&self, id: &str) -> Option<&Card> {
        self.cards.get(id)
    }

    /// Every card of a tree, tombstones included
    pub fn cards(&self, tree_id: &str) -> Vec<Card> {
        self.cards
            .values()
            .filter(|c| c.tree_id == tree_id)
            .cloned()
            .collect()
    }

    /// Non-deleted cards of a tree, in parent then position order
    pub fn visible(&self, tree_id: &str) -> Vec<Card> {
        let mut cards: Vec<Card> = self
            .cards
            .values()
            .filter(|c| c.tree_id == tree_id && !c.deleted)
            .cloned()
            .collect();
        cards.sort_by(|a, b| {
            a.parent_id
                .cmp(&b.parent_id)
                .then(a.position.total_cmp(&b.position))
                .then_with(|| a.id.cmp(&b.id))
        });
        cards
    }

    /// Children of `parent` in sibling order
    pub fn children(&self, tree_id: &str, parent: Option<&str>) -> Vec<Card> {
        self.visible(tree_id)
            .into_iter()
            .filter(|c| c.parent_id.as_deref() == parent)
            .collect()
    }

    /// Local changes not yet acknowledged by the server
    pub fn unsynced(&self, tree_id: &str) -> Vec<Card> {
        self.cards
            .values()
            .filter(|c| c.tree_id == tree_id && !c.synced)
            .cloned()
            .collect()
    }

    pub fn tree_ids(&self) -> BTreeSet<String> {
        self.cards.values().map(|c| c.tree_id.clone()).collect()
    }

    /// Highest timestamp stored for a tree
    pub fn watermark(&self, tree_id: &str) -> Option<Timestamp> {
        self.cards
            .values()
            .filter(|c| c.tree_id == tree_id)
            .map(|c| c.updated_at.clone())
            .max()
    }

    /// Apply local changes all-or-nothing.
    ///
    /// Added and tombstoned cards are stamped with fresh timestamps. Unless the
    /// batch is a single empty insert, every tree it added to or tombstoned in
    /// gets a history snapshot keyed by the batch's highest timestamp.
    pub fn apply_batch(&mut self, batch: CardBatch) -> Result<ApplyReport> {
        let mut seen = BTreeSet::new();
        for id in batch.to_add.iter().map(|c| &c.id).chain(batch.to_tombstone.iter()) {
            if !seen.insert(id.clone()) {
                return Err(CardError::Duplicate(id.clone()));
            }
        }
        for id in &batch.to_tombstone {
            if !self.cards.contains_key(id) {
                return Err(CardError::NotFound(id.clone()));
            }
        }
        // Cards added by this batch count as existing for the later steps
        for id in batch.to_remove.iter().chain(batch.to_mark_synced.iter().map(|(id, _)| id)) {
            if !self.cards.contains_key(id) && !batch.to_add.iter().any(|c| &c.id == id) {
                return Err(CardError::NotFound(id.clone()));
            }
        }

        let trivial = batch.is_trivial();
        let mut report = ApplyReport::default();
        let mut touched_trees = BTreeSet::new();
        let mut max_ts: Option<Timestamp> = None;

        for mut card in batch.to_add {
            card.updated_at = self.clock.next();
            card.synced = false;
            touched_trees.insert(card.tree_id.clone());
            max_ts = Some(card.updated_at.clone());
            report.changed.push(card.clone());
            self.cards.insert(card.id.clone(), card);
        }

        for id in batch.to_tombstone {
            let ts = self.clock.next();
            if let Some(card) = self.cards.get_mut(&id) {
                card.deleted = true;
                card.synced = false;
                card.updated_at = ts.clone();
                touched_trees.insert(card.tree_id.clone());
                report.changed.push(card.clone());
            }
            max_ts = Some(ts);
        }

        for (id, pushed) in batch.to_mark_synced {
            if let Some(card) = self.cards.get_mut(&id) {
                // A newer local edit stays pending
                if card.updated_at == pushed && !card.synced {
                    card.synced = true;
                    report.changed.push(card.clone());
                }
            }
        }

        for id in batch.to_remove {
            if self.cards.remove(&id).is_some() {
                report.removed.push(id);
            }
        }

        if let Some(key) = max_ts.filter(|_| !trivial) {
            for tree_id in touched_trees {
                self.capture_snapshot(&tree_id, key.clone());
            }
            report.snapshots.push(key);
        }
        Ok(report)
    }

    /// Merge cards received from another replica, last-writer-wins per card.
    ///
    /// Equal timestamps are a replay and change nothing. Accepted cards are
    /// marked synced and the clock moves past every timestamp seen.
    pub fn merge_remote(&mut self, remote: Vec<Card>) -> ApplyReport {
        let mut report = ApplyReport::default();
        for mut card in remote {
            self.clock.recv(&card.updated_at);
            let newer = match self.cards.get(&card.id) {
                Some(local) => card.updated_at > local.updated_at,
                None => true,
            };
            if newer {
                card.synced = true;
                report.changed.push(card.clone());
                self.cards.insert(card.id.clone(), card);
            }
        }
        report
    }

    /// Replace a tree with an authoritative copy, keeping unsynced local edits
    /// that are newer than the incoming version
    pub fn reset_tree(&mut self, tree_id: &str, authoritative: Vec<Card>) -> ApplyReport {
        let pending: Vec<Card> = self
            .unsynced(tree_id)
            .into_iter()
            .filter(|local| {
                authoritative
                    .iter()
                    .find(|c| c.id == local.id)
                    .is_none_or(|c| c.updated_at < local.updated_at)
            })
            .collect();
        self.cards.retain(|_, c| c.tree_id != tree_id);
        let report = self.merge_remote(authoritative);
        for card in pending {
            self.cards.insert(card.id.clone(), card);
        }
        report
    }

    /// Capture a snapshot of a tree's visible cards
    pub fn capture_snapshot(&mut self, tree_id: &str, key: Timestamp) {
        let cards = self.visible(tree_id);
        let list = self.snapshots.entry(tree_id.to_string()).or_default();
        if list.iter().any(|s| s.snapshot_key == key) {
            return;
        }
        list.push(HistorySnapshot {
            snapshot_key: key,
            tree_id: tree_id.to_string(),
            cards,
        });
        list.sort_by(|a, b| a.snapshot_key.cmp(&b.snapshot_key));
    }

    /// Snapshots of a tree, oldest first
    pub fn snapshots(&self, tree_id: &str) -> &[HistorySnapshot] {
        self.snapshots.get(tree_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn snapshot(&self, tree_id: &str, key: &Timestamp) -> Option<&HistorySnapshot> {
        self.snapshots(tree_id).iter().find(|s| &s.snapshot_key == key)
    }

    /// Drop snapshots older than `max_age_ms` or beyond the newest `max_count`
    pub fn prune_snapshots(&mut self, max_count: usize, max_age_ms: Option<i64>, now_ms: i64) -> usize {
        let mut pruned = 0;
        for list in self.snapshots.values_mut() {
            let before = list.len();
            if let Some(age) = max_age_ms {
                list.retain(|s| now_ms - s.snapshot_key.millis <= age);
            }
            if list.len() > max_count {
                let excess = list.len() - max_count;
                list.drain(..excess);
            }
            pruned += before - list.len();
        }
        pruned
    }

    /// Hard-remove tombstones the server already acknowledged
    pub fn compact(&mut self, tree_id: &str) -> Vec<String> {
        let dead: Vec<String> = self
            .cards
            .values()
            .filter(|c| c.tree_id == tree_id && c.deleted && c.synced)
            .map(|c| c.id.clone())
            .collect();
        for id in &dead {
            self.cards.remove(id);
        }
        dead
    }
}
