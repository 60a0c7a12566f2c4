//! Outline Sync Core Library
//!
//! Versioning and synchronization engine for hierarchical outline documents:
//! - Content-addressed tree/commit objects and the commit history graph
//! - Replicated document stores (in-memory and SQLite, WAL mode)
//! - Conflict detection and arbitration between replicas
//! - HLC-ordered, tombstoned card store for the flat document model, with SQLite persistence
//! - Delta sync wire protocol and client transport
//! - Migration from the commit model to cards, and verified export

pub mod object;
pub mod storage;
pub mod sqlite_store;
pub mod history;
pub mod replication;
pub mod sync;
pub mod hlc;
pub mod card;
pub mod card_db;
pub mod protocol;
pub mod transport;
pub mod migration;
pub mod export;

pub use object::{commit_tree, write_tree, Commit, CommitBundle, Head, Metadata, ObjectId, Record, TreeObject, WorkingTree};
pub use storage::{keys, replicate, MemoryStore, ReplicatedStore, ReplicationReport, Result, Revision, StorageError, StoredDoc};
pub use sqlite_store::SqliteStore;
pub use history::{compare_heads, merge_trees, CommitGraph, Divergence, HistoryError, MergeOutcome};
pub use replication::{
    load, load_at, pull, push, resolve_metadata_conflicts, resolve_ref_conflicts, save, EditBatch, LoadedDocument,
    MergeEvent, Pulled, Resolution, SaveOutcome, SyncError, Versioned,
};
pub use sync::{Session, SyncConfig};
pub use hlc::{Hlc, Timestamp};
pub use card::{Card, CardBatch, CardError, CardStore, HistorySnapshot};
pub use card_db::CardDb;
pub use protocol::{ClientMessage, Envelope, ProtocolError, ServerMessage, TreeInfo};
pub use transport::{DeltaClient, Event, TcpConnector, TransportError};
pub use migration::{migrate_document, tree_to_cards, MigrationError, MigrationOutcome};
pub use export::{export_verified, ExportError};
