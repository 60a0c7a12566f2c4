//! One-way conversion of commit-model documents into card trees.

use crate::card::{Card, CardBatch, CardError, CardStore};
use crate::object::{Record, WorkingTree};
use crate::replication::{self, SyncError};
use crate::storage::{keys, ReplicatedStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Card(#[from] CardError),

    #[error("Document {0} has no commits to migrate")]
    Bare(String),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

/// Result of [`migrate_document`]
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub tree_id: String,
    pub cards: Vec<Card>,
    /// False when an earlier run had already produced the cards
    pub created: bool,
}

/// Flatten a working tree into unstamped cards in pre-order.
///
/// Every node, the root included, becomes a card with a fresh id. Positions
/// are sibling indexes.
pub fn tree_to_cards(tree: &WorkingTree, tree_id: &str) -> Vec<Card> {
    let mut cards = Vec::with_capacity(tree.node_count());
    push_node(tree, tree_id, None, 0, &mut cards);
    cards
}

fn push_node(node: &WorkingTree, tree_id: &str, parent: Option<&str>, index: usize, out: &mut Vec<Card>) {
    let id = uuid::Uuid::new_v4().to_string();
    out.push(Card::new(
        id.clone(),
        tree_id,
        parent.map(str::to_string),
        node.content.clone(),
        index as f64,
    ));
    for (i, child) in node.children.iter().enumerate() {
        push_node(child, tree_id, Some(&id), i, out);
    }
}

/// Migrate the head of `document_id` into `cards`.
///
/// The source metadata is marked `migratedTo` before any card is written, so
/// a retry after a crash reuses the same tree id. A retry after success
/// returns the existing cards.
pub async fn migrate_document(
    store: &dyn ReplicatedStore,
    document_id: &str,
    cards: &mut CardStore,
) -> Result<MigrationOutcome> {
    let (doc, _) = replication::load(store, document_id).await?;
    let tree = doc
        .working_tree()?
        .ok_or_else(|| MigrationError::Bare(document_id.to_string()))?;

    let existing = doc.metadata.as_ref().and_then(|m| m.value.migrated_to.clone());
    if let Some(tree_id) = &existing {
        let already = cards.cards(tree_id);
        if !already.is_empty() {
            tracing::info!(document_id, tree_id = %tree_id, "document already migrated");
            return Ok(MigrationOutcome {
                tree_id: tree_id.clone(),
                cards: already,
                created: false,
            });
        }
    }

    let tree_id = existing.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = cards.clock().last().millis.max(chrono::Utc::now().timestamp_millis());
    let (mut metadata, base) = match doc.metadata {
        Some(m) => (m.value, Some(m.rev)),
        None => (crate::object::Metadata::new(None, now), None),
    };
    if metadata.migrated_to.as_deref() != Some(tree_id.as_str()) {
        metadata.migrated_to = Some(tree_id.clone());
        metadata.updated_at = metadata.updated_at.max(now);
        store
            .put(&keys::metadata(document_id), base.as_ref(), Record::Metadata(metadata))
            .await?;
    }

    let report = cards.apply_batch(CardBatch {
        to_add: tree_to_cards(&tree, &tree_id),
        ..Default::default()
    })?;
    tracing::info!(document_id, tree_id = %tree_id, cards = report.changed.len(), "migrated document");
    Ok(MigrationOutcome {
        tree_id,
        cards: report.changed,
        created: true,
    })
}
