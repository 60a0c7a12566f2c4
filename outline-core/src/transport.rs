//! Client side of the delta sync channel.
//!
//! [`DeltaClient`] owns a client's [`CardStore`] for one tree and a single
//! connection to the server. Messages sent while disconnected are queued and
//! flushed in order after the join message on reconnect. Silence longer than
//! half the heartbeat triggers a ping; a second silent half reconnects.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::card::{ApplyReport, CardBatch, CardError, CardStore, HistorySnapshot};
use crate::card_db::CardDb;
use crate::hlc::Timestamp;
use crate::protocol::{
    self, merge_tree_infos, ClientMessage, ProtocolError, ServerMessage, SnapshotMeta, TreeInfo, HISTORY_PAGE_SIZE,
};
use crate::sync::SyncConfig;

/// Transport failures surfaced to the application
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Card(#[from] CardError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error("Not connected")]
    Disconnected,

    #[error("Push failed {failures} times in a row; retry manually")]
    PushHalted { failures: u32 },

    #[error("Server rejected changes to {tree_id} and nothing local is pending; reload required")]
    HardConflict { tree_id: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One open channel to the server
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: &ClientMessage) -> protocol::Result<()>;
    async fn recv(&mut self) -> protocol::Result<ServerMessage>;
}

/// Opens connections
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Connection;

    async fn connect(&self) -> protocol::Result<Self::Conn>;
}

/// Length-prefixed JSON over TCP
pub struct TcpConnection {
    stream: TcpStream,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, message: &ClientMessage) -> protocol::Result<()> {
        protocol::write_frame(&mut self.stream, message).await
    }

    async fn recv(&mut self) -> protocol::Result<ServerMessage> {
        protocol::read_frame(&mut self.stream).await
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Conn = TcpConnection;

    async fn connect(&self) -> protocol::Result<TcpConnection> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection { stream })
    }
}

/// What handling one server message did
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Cards(ApplyReport),
    /// Authoritative state was requested after a conflict or invalidation
    Refetching,
    Pushed { synced: usize },
    PushRetried { failures: u32 },
    Trees(Vec<TreeInfo>),
    HistoryMeta {
        entries: Vec<SnapshotMeta>,
        next: Option<Timestamp>,
    },
    History(Option<HistorySnapshot>),
    Pong,
}

/// Delta sync client for one tree
pub struct DeltaClient<C: Connector> {
    connector: C,
    conn: Option<C::Conn>,
    tree_id: String,
    store: CardStore,
    queue: VecDeque<ClientMessage>,
    trees: BTreeMap<String, TreeInfo>,
    push_failures: u32,
    failure_threshold: u32,
    halted: bool,
    heartbeat: Duration,
    pinged: bool,
    db: Option<CardDb>,
}

impl<C: Connector> DeltaClient<C> {
    pub fn new(connector: C, tree_id: impl Into<String>, store: CardStore, config: &SyncConfig) -> Self {
        Self {
            connector,
            conn: None,
            tree_id: tree_id.into(),
            store,
            queue: VecDeque::new(),
            trees: BTreeMap::new(),
            push_failures: 0,
            failure_threshold: config.push_failure_threshold,
            halted: false,
            heartbeat: Duration::from_secs(config.heartbeat_secs),
            pinged: false,
            db: None,
        }
    }

    /// Write every change to the store through to `db`
    pub fn with_db(mut self, db: CardDb) -> Self {
        self.db = Some(db);
        self
    }

    fn persist(&self, report: &ApplyReport) -> Result<()> {
        if let Some(db) = &self.db {
            db.record(&self.store, report)?;
        }
        Ok(())
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    pub fn store(&self) -> &CardStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CardStore {
        &mut self.store
    }

    pub fn trees(&self) -> &BTreeMap<String, TreeInfo> {
        &self.trees
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn push_failures(&self) -> u32 {
        self.push_failures
    }

    /// Override the heartbeat interval
    pub fn set_heartbeat(&mut self, heartbeat: Duration) {
        self.heartbeat = heartbeat;
    }

    /// Connect, join the room, then flush queued messages in order.
    ///
    /// Cards still unsynced afterwards were pushed on a connection that died
    /// before the acknowledgement; they are pushed again.
    pub async fn connect(&mut self) -> Result<()> {
        let mut conn = self.connector.connect().await?;
        conn.send(&ClientMessage::Join {
            tree_id: self.tree_id.clone(),
        })
        .await?;
        self.conn = Some(conn);
        self.pinged = false;
        tracing::info!(tree_id = %self.tree_id, queued = self.queue.len(), "connected");
        let pushed = self.queue.iter().any(|m| self.is_own_push(m));
        self.flush().await?;
        if !pushed && !self.halted && !self.store.unsynced(&self.tree_id).is_empty() {
            self.push().await?;
        }
        Ok(())
    }

    fn is_own_push(&self, message: &ClientMessage) -> bool {
        matches!(message, ClientMessage::Push { tree_id, .. } if *tree_id == self.tree_id)
    }

    pub fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            tracing::info!(tree_id = %self.tree_id, "disconnected");
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        while let Some(message) = self.queue.front() {
            if let Err(e) = conn.send(message).await {
                tracing::warn!(tree_id = %self.tree_id, error = %e, "send failed; keeping queue");
                self.conn = None;
                return Err(e.into());
            }
            self.queue.pop_front();
        }
        Ok(())
    }

    /// Send now if connected, otherwise queue for the next connection
    pub async fn send(&mut self, message: ClientMessage) -> Result<()> {
        self.queue.push_back(message);
        if self.conn.is_some() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Apply a local batch and push the resulting changes
    pub async fn apply_local(&mut self, batch: CardBatch) -> Result<ApplyReport> {
        let report = self.store.apply_batch(batch)?;
        self.persist(&report)?;
        if !report.changed.is_empty() && !self.halted {
            self.push().await?;
        }
        Ok(report)
    }

    /// Push every unsynced card of the tree.
    ///
    /// A push still waiting in the queue is replaced, since the new one
    /// carries a superset of its cards.
    pub async fn push(&mut self) -> Result<()> {
        if self.halted {
            return Err(TransportError::PushHalted {
                failures: self.push_failures,
            });
        }
        let cards = self.store.unsynced(&self.tree_id);
        if cards.is_empty() {
            return Ok(());
        }
        let tree_id = self.tree_id.clone();
        self.queue
            .retain(|m| !matches!(m, ClientMessage::Push { tree_id: queued, .. } if *queued == tree_id));
        self.send(ClientMessage::Push {
            tree_id: self.tree_id.clone(),
            cards,
        })
        .await
    }

    /// Manual retry after the failure threshold was reached
    pub async fn retry(&mut self) -> Result<()> {
        self.push_failures = 0;
        self.halted = false;
        if self.conn.is_none() {
            self.connect().await?;
        }
        self.push().await
    }

    pub async fn pull(&mut self) -> Result<()> {
        self.send(ClientMessage::Pull {
            tree_id: self.tree_id.clone(),
        })
        .await
    }

    /// Publish document-list entries
    pub async fn send_trees(&mut self, entries: Vec<TreeInfo>) -> Result<()> {
        merge_tree_infos(&mut self.trees, entries.clone());
        self.send(ClientMessage::Trees(entries)).await
    }

    pub async fn request_history(&mut self, before: Option<Timestamp>) -> Result<()> {
        self.send(ClientMessage::HistoryMeta {
            tree_id: self.tree_id.clone(),
            before,
            limit: HISTORY_PAGE_SIZE,
        })
        .await
    }

    pub async fn request_snapshot(&mut self, snapshot_key: Timestamp) -> Result<()> {
        self.send(ClientMessage::History {
            tree_id: self.tree_id.clone(),
            snapshot_key,
        })
        .await
    }

    /// Wait for the next server message and handle it, reconnecting on
    /// silence
    pub async fn next_event(&mut self) -> Result<Event> {
        loop {
            if self.conn.is_none() {
                self.connect().await?;
            }
            let half = self.heartbeat / 2;
            let Some(conn) = self.conn.as_mut() else {
                return Err(TransportError::Disconnected);
            };
            match tokio::time::timeout(half, conn.recv()).await {
                Ok(Ok(message)) => {
                    self.pinged = false;
                    return self.handle(message).await;
                }
                Ok(Err(e)) => {
                    self.conn = None;
                    return Err(e.into());
                }
                Err(_) if !self.pinged => {
                    self.pinged = true;
                    if let Err(e) = conn.send(&ClientMessage::Ping).await {
                        self.conn = None;
                        return Err(e.into());
                    }
                }
                Err(_) => {
                    tracing::warn!(tree_id = %self.tree_id, "heartbeat lost; reconnecting");
                    self.conn = None;
                }
            }
        }
    }

    /// Apply one server message to local state
    pub async fn handle(&mut self, message: ServerMessage) -> Result<Event> {
        match message {
            ServerMessage::Cards { tree_id, cards, full } => {
                let report = if full {
                    self.store.reset_tree(&tree_id, cards)
                } else {
                    self.store.merge_remote(cards)
                };
                if full {
                    if let Some(db) = &self.db {
                        db.save_tree(&self.store, &tree_id)?;
                    }
                } else {
                    self.persist(&report)?;
                }
                Ok(Event::Cards(report))
            }
            ServerMessage::CardsConflict { tree_id, reason } => {
                tracing::warn!(tree_id = %tree_id, reason = %reason, "server reported a card conflict");
                let hard = self.store.unsynced(&tree_id).is_empty();
                self.send(ClientMessage::Pull {
                    tree_id: tree_id.clone(),
                })
                .await?;
                if hard {
                    return Err(TransportError::HardConflict { tree_id });
                }
                Ok(Event::Refetching)
            }
            ServerMessage::PushOk {
                watermark, synced, ..
            } => {
                self.store.clock_mut().recv(&watermark);
                let to_mark_synced: Vec<_> = synced
                    .into_iter()
                    .filter(|(id, _)| self.store.get(id).is_some())
                    .collect();
                let count = to_mark_synced.len();
                let report = self.store.apply_batch(CardBatch {
                    to_mark_synced,
                    ..Default::default()
                })?;
                self.persist(&report)?;
                self.push_failures = 0;
                Ok(Event::Pushed { synced: count })
            }
            ServerMessage::PushError { tree_id, error } => {
                self.push_failures += 1;
                tracing::warn!(tree_id = %tree_id, error = %error, failures = self.push_failures, "push failed");
                if self.push_failures >= self.failure_threshold {
                    self.halted = true;
                    return Err(TransportError::PushHalted {
                        failures: self.push_failures,
                    });
                }
                self.push().await?;
                Ok(Event::PushRetried {
                    failures: self.push_failures,
                })
            }
            ServerMessage::DoPull { tree_id } => {
                self.send(ClientMessage::Pull { tree_id }).await?;
                Ok(Event::Refetching)
            }
            ServerMessage::TreesOk(entries) => Ok(Event::Trees(merge_tree_infos(&mut self.trees, entries))),
            ServerMessage::HistoryMeta { entries, next, .. } => Ok(Event::HistoryMeta { entries, next }),
            ServerMessage::History { snapshot, .. } => Ok(Event::History(snapshot)),
            ServerMessage::Pong => Ok(Event::Pong),
        }
    }
}
