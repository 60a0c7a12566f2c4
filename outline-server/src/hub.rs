//! Authoritative card state and room membership.
//!
//! The hub owns one [`CardStore`] holding every tree it serves. Clients join
//! a tree's room; accepted pushes are acknowledged to the sender and
//! broadcast to the rest of the room. With a [`CardDb`] attached, every
//! accepted push is written through before it is acknowledged.

use outline_core::card::{Card, CardStore};
use outline_core::card_db::CardDb;
use outline_core::hlc::Hlc;
use outline_core::protocol::{merge_tree_infos, ClientMessage, ServerMessage, SnapshotMeta, TreeInfo};
use outline_core::StorageError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub type ClientId = u64;

/// Snapshot retention applied on compaction
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub max_snapshots: usize,
    pub max_age_ms: Option<i64>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_snapshots: 500,
            max_age_ms: None,
        }
    }
}

struct HubState {
    store: CardStore,
    db: Option<CardDb>,
    trees: BTreeMap<String, TreeInfo>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>,
    rooms: HashMap<String, HashSet<ClientId>>,
}

impl HubState {
    fn send(&self, client: ClientId, message: ServerMessage) {
        if let Some(tx) = self.clients.get(&client) {
            // A closed channel means the client is leaving
            let _ = tx.send(message);
        }
    }

    fn broadcast(&self, tree_id: &str, except: Option<ClientId>, message: &ServerMessage) {
        if let Some(members) = self.rooms.get(tree_id) {
            for member in members.iter().filter(|m| Some(**m) != except) {
                self.send(*member, message.clone());
            }
        }
    }
}

pub struct Hub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    retention: Retention,
}

impl Hub {
    pub fn new(node: &str, retention: Retention) -> Self {
        Self::with_clock(Hlc::new(node), retention)
    }

    /// Hub whose cards and snapshots persist under `dir`
    pub fn open(dir: &Path, clock: Hlc, retention: Retention) -> Result<Self, StorageError> {
        let db = CardDb::open(dir)?;
        let store = db.load(clock)?;
        info!(trees = store.tree_ids().len(), "restored card trees");
        Ok(Self::from_parts(store, Some(db), retention))
    }

    pub fn with_clock(clock: Hlc, retention: Retention) -> Self {
        Self::from_parts(CardStore::new(clock), None, retention)
    }

    fn from_parts(store: CardStore, db: Option<CardDb>, retention: Retention) -> Self {
        Self {
            state: Mutex::new(HubState {
                store,
                db,
                trees: BTreeMap::new(),
                clients: HashMap::new(),
                rooms: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            retention,
        }
    }

    /// Register a connection; everything for it arrives on the receiver
    pub async fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.clients.insert(id, tx);
        debug!(client = id, "client registered");
        (id, rx)
    }

    pub async fn leave(&self, client: ClientId) {
        let mut state = self.state.lock().await;
        state.clients.remove(&client);
        for members in state.rooms.values_mut() {
            members.remove(&client);
        }
        debug!(client, "client left");
    }

    /// Cards of a tree as stored, tombstones included
    pub async fn cards(&self, tree_id: &str) -> Vec<Card> {
        self.state.lock().await.store.cards(tree_id)
    }

    pub async fn handle(&self, client: ClientId, message: ClientMessage) {
        let mut state = self.state.lock().await;
        match message {
            ClientMessage::Join { tree_id } => {
                state.rooms.entry(tree_id.clone()).or_default().insert(client);
                info!(client, tree_id = %tree_id, "joined room");
                let list = state.trees.values().cloned().collect();
                state.send(client, ServerMessage::TreesOk(list));
            }
            ClientMessage::Push { tree_id, cards } => push(&mut state, client, tree_id, cards),
            ClientMessage::Pull { tree_id } => {
                let cards = state.store.cards(&tree_id);
                state.send(
                    client,
                    ServerMessage::Cards {
                        tree_id,
                        cards,
                        full: true,
                    },
                );
            }
            ClientMessage::Trees(entries) => {
                let changed = merge_tree_infos(&mut state.trees, entries);
                let list = state.trees.values().cloned().collect();
                state.send(client, ServerMessage::TreesOk(list));
                if !changed.is_empty() {
                    for other in state.clients.keys().filter(|c| **c != client) {
                        state.send(*other, ServerMessage::TreesOk(changed.clone()));
                    }
                }
            }
            ClientMessage::HistoryMeta { tree_id, before, limit } => {
                let newest_first: Vec<SnapshotMeta> = state
                    .store
                    .snapshots(&tree_id)
                    .iter()
                    .rev()
                    .filter(|s| before.as_ref().is_none_or(|b| &s.snapshot_key < b))
                    .map(|s| SnapshotMeta {
                        snapshot_key: s.snapshot_key.clone(),
                        card_count: s.cards.len(),
                    })
                    .collect();
                let limit = limit.max(1);
                let next = (newest_first.len() > limit).then(|| newest_first[limit - 1].snapshot_key.clone());
                let entries = newest_first.into_iter().take(limit).collect();
                state.send(client, ServerMessage::HistoryMeta { tree_id, entries, next });
            }
            ClientMessage::History { tree_id, snapshot_key } => {
                let snapshot = state.store.snapshot(&tree_id, &snapshot_key).cloned();
                state.send(client, ServerMessage::History { tree_id, snapshot });
            }
            ClientMessage::Ping => state.send(client, ServerMessage::Pong),
        }
    }

    /// Drop acknowledged tombstones and old snapshots; rooms whose trees
    /// lost cards are told to pull again. Returns the trees invalidated.
    pub async fn compact(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        let now = state.store.clock_mut().next().millis;
        let pruned = state
            .store
            .prune_snapshots(self.retention.max_snapshots, self.retention.max_age_ms, now);
        let mut invalidated = Vec::new();
        for tree_id in state.store.tree_ids() {
            let removed = state.store.compact(&tree_id);
            if let Some(db) = &state.db {
                if let Err(e) = db.save_tree(&state.store, &tree_id) {
                    error!(tree_id = %tree_id, error = %e, "failed to persist compaction");
                }
            }
            if !removed.is_empty() {
                info!(tree_id = %tree_id, removed = removed.len(), "compacted tombstones");
                state.broadcast(&tree_id, None, &ServerMessage::DoPull { tree_id: tree_id.clone() });
                invalidated.push(tree_id);
            }
        }
        debug!(pruned, "compaction finished");
        invalidated
    }
}

fn push(state: &mut HubState, client: ClientId, tree_id: String, cards: Vec<Card>) {
    if let Some(card) = cards.iter().find(|c| c.tree_id != tree_id) {
        state.send(
            client,
            ServerMessage::PushError {
                tree_id,
                error: format!("card {} belongs to tree {}", card.id, card.tree_id),
            },
        );
        return;
    }

    // Parents must exist already or arrive in the same batch
    let incoming: HashSet<&str> = cards.iter().map(|c| c.id.as_str()).collect();
    let orphan = cards.iter().find(|c| {
        c.parent_id.as_deref().is_some_and(|p| {
            !incoming.contains(p) && state.store.get(p).is_none_or(|parent| parent.tree_id != tree_id)
        })
    });
    if let Some(orphan) = orphan {
        warn!(client, tree_id = %tree_id, card = %orphan.id, "push references a missing parent");
        let reason = format!("parent of {} does not exist", orphan.id);
        state.send(client, ServerMessage::CardsConflict { tree_id, reason });
        return;
    }

    let synced: Vec<_> = cards.iter().map(|c| (c.id.clone(), c.updated_at.clone())).collect();
    let ids: Vec<String> = cards.iter().map(|c| c.id.clone()).collect();
    let pushed: HashMap<String, Card> = cards.iter().map(|c| (c.id.clone(), c.clone())).collect();
    let mut report = state.store.merge_remote(cards);
    let watermark = state.store.clock_mut().next();

    if let Some(key) = report.changed.iter().map(|c| c.updated_at.clone()).max() {
        state.store.capture_snapshot(&tree_id, key.clone());
        report.snapshots.push(key);
    }

    // Not acknowledged unless durable; the client re-pushes and the replay is a no-op
    if let Some(db) = &state.db {
        if let Err(e) = db.record(&state.store, &report) {
            error!(client, tree_id = %tree_id, error = %e, "failed to persist push");
            state.send(
                client,
                ServerMessage::PushError {
                    tree_id,
                    error: "storage failure".to_string(),
                },
            );
            return;
        }
    }

    // Versions that lost to something newer go back to the sender
    let winners: Vec<Card> = ids
        .iter()
        .filter_map(|id| state.store.get(id))
        .filter(|stored| pushed.get(&stored.id).is_some_and(|p| stored.updated_at > p.updated_at))
        .cloned()
        .collect();

    debug!(client, tree_id = %tree_id, changed = report.changed.len(), stale = winners.len(), "push applied");
    state.send(
        client,
        ServerMessage::PushOk {
            tree_id: tree_id.clone(),
            watermark,
            synced,
        },
    );
    if !winners.is_empty() {
        state.send(
            client,
            ServerMessage::Cards {
                tree_id: tree_id.clone(),
                cards: winners,
                full: false,
            },
        );
    }
    if !report.changed.is_empty() {
        state.broadcast(
            &tree_id,
            Some(client),
            &ServerMessage::Cards {
                tree_id: tree_id.clone(),
                cards: report.changed,
                full: false,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outline_core::hlc::{ManualClock, Timestamp};
    use std::sync::Arc;

    fn hub() -> (Arc<ManualClock>, Hub) {
        let clock = Arc::new(ManualClock::new(1_000));
        let hub = Hub::with_clock(Hlc::with_source("server", clock.clone()), Retention::default());
        (clock, hub)
    }

    fn card(id: &str, parent: Option<&str>, content: &str, millis: i64, node: &str) -> Card {
        let mut card = Card::new(id, "t", parent.map(str::to_string), content, 0.0);
        card.updated_at = Timestamp::new(millis, 0, node);
        card
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    async fn joined(hub: &Hub) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (id, mut rx) = hub.register().await;
        hub.handle(id, ClientMessage::Join { tree_id: "t".into() }).await;
        drain(&mut rx);
        (id, rx)
    }

    #[tokio::test]
    async fn test_push_acks_and_broadcasts() {
        let (_clock, hub) = hub();
        let (a, mut rx_a) = joined(&hub).await;
        let (_b, mut rx_b) = joined(&hub).await;

        let pushed = card("x", None, "foo", 5_000, "a");
        hub.handle(
            a,
            ClientMessage::Push {
                tree_id: "t".into(),
                cards: vec![pushed.clone()],
            },
        )
        .await;

        match drain(&mut rx_a).as_slice() {
            [ServerMessage::PushOk { watermark, synced, .. }] => {
                assert!(*watermark > pushed.updated_at);
                assert_eq!(synced, &vec![("x".to_string(), pushed.updated_at.clone())]);
            }
            other => panic!("unexpected replies: {:?}", other),
        }
        match drain(&mut rx_b).as_slice() {
            [ServerMessage::Cards { cards, full: false, .. }] => assert_eq!(cards[0].content, "foo"),
            other => panic!("unexpected broadcast: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replayed_push_is_a_noop() {
        let (_clock, hub) = hub();
        let (a, mut rx_a) = joined(&hub).await;
        let (_b, mut rx_b) = joined(&hub).await;
        let push = ClientMessage::Push {
            tree_id: "t".into(),
            cards: vec![card("x", None, "foo", 5_000, "a")],
        };
        hub.handle(a, push.clone()).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(a, push).await;
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::PushOk { .. }]));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.cards("t").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_push_gets_winner_back() {
        let (_clock, hub) = hub();
        let (a, mut rx_a) = joined(&hub).await;
        hub.handle(
            a,
            ClientMessage::Push {
                tree_id: "t".into(),
                cards: vec![card("x", None, "baz", 9_000, "b")],
            },
        )
        .await;
        drain(&mut rx_a);
        hub.handle(
            a,
            ClientMessage::Push {
                tree_id: "t".into(),
                cards: vec![card("x", None, "bar", 8_000, "a")],
            },
        )
        .await;
        let replies = drain(&mut rx_a);
        assert!(matches!(
            replies.as_slice(),
            [ServerMessage::PushOk { .. }, ServerMessage::Cards { cards, .. }] if cards[0].content == "baz"
        ));
    }

    #[tokio::test]
    async fn test_orphan_push_conflicts() {
        let (_clock, hub) = hub();
        let (a, mut rx_a) = joined(&hub).await;
        hub.handle(
            a,
            ClientMessage::Push {
                tree_id: "t".into(),
                cards: vec![card("child", Some("missing"), "x", 5_000, "a")],
            },
        )
        .await;
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::CardsConflict { .. }]));
        assert!(hub.cards("t").await.is_empty());

        // Parent in the same batch is fine
        hub.handle(
            a,
            ClientMessage::Push {
                tree_id: "t".into(),
                cards: vec![card("p", None, "p", 5_000, "a"), card("c", Some("p"), "c", 5_001, "a")],
            },
        )
        .await;
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::PushOk { .. }]));
    }

    #[tokio::test]
    async fn test_history_paging() {
        let (_clock, hub) = hub();
        let (a, mut rx_a) = joined(&hub).await;
        for i in 0..5 {
            hub.handle(
                a,
                ClientMessage::Push {
                    tree_id: "t".into(),
                    cards: vec![card("x", None, &format!("v{}", i), 2_000 + i, "a")],
                },
            )
            .await;
        }
        drain(&mut rx_a);

        hub.handle(
            a,
            ClientMessage::HistoryMeta {
                tree_id: "t".into(),
                before: None,
                limit: 3,
            },
        )
        .await;
        let (entries, next) = match drain(&mut rx_a).pop() {
            Some(ServerMessage::HistoryMeta { entries, next, .. }) => (entries, next),
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].snapshot_key.millis, 2_004);
        let next = next.unwrap();

        hub.handle(
            a,
            ClientMessage::HistoryMeta {
                tree_id: "t".into(),
                before: Some(next),
                limit: 3,
            },
        )
        .await;
        match drain(&mut rx_a).pop() {
            Some(ServerMessage::HistoryMeta { entries, next, .. }) => {
                assert_eq!(entries.len(), 2);
                assert!(next.is_none());
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        hub.handle(
            a,
            ClientMessage::History {
                tree_id: "t".into(),
                snapshot_key: entries[2].snapshot_key.clone(),
            },
        )
        .await;
        match drain(&mut rx_a).pop() {
            Some(ServerMessage::History { snapshot: Some(s), .. }) => assert_eq!(s.cards[0].content, "v2"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compaction_sends_do_pull() {
        let (_clock, hub) = hub();
        let (a, mut rx_a) = joined(&hub).await;
        let mut dead = card("x", None, "gone", 5_000, "a");
        dead.deleted = true;
        hub.handle(
            a,
            ClientMessage::Push {
                tree_id: "t".into(),
                cards: vec![dead],
            },
        )
        .await;
        drain(&mut rx_a);

        assert_eq!(hub.compact().await, vec!["t".to_string()]);
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::DoPull { .. }]));
        assert!(hub.cards("t").await.is_empty());
    }

    #[tokio::test]
    async fn test_pushed_cards_survive_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server_clock = || Hlc::with_source("server", Arc::new(ManualClock::new(1_000)));
        {
            let hub = Hub::open(tmp.path(), server_clock(), Retention::default()).unwrap();
            let (a, mut rx_a) = joined(&hub).await;
            hub.handle(
                a,
                ClientMessage::Push {
                    tree_id: "t".into(),
                    cards: vec![card("x", None, "foo", 5_000, "a")],
                },
            )
            .await;
            assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::PushOk { .. }]));
        }

        let hub = Hub::open(tmp.path(), server_clock(), Retention::default()).unwrap();
        let cards = hub.cards("t").await;
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].content, "foo");

        // Snapshot history comes back with the cards
        let (b, mut rx_b) = joined(&hub).await;
        hub.handle(
            b,
            ClientMessage::HistoryMeta {
                tree_id: "t".into(),
                before: None,
                limit: 10,
            },
        )
        .await;
        match drain(&mut rx_b).pop() {
            Some(ServerMessage::HistoryMeta { entries, .. }) => assert_eq!(entries.len(), 1),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trees_lww() {
        let (_clock, hub) = hub();
        let (a, mut rx_a) = joined(&hub).await;
        let (_b, mut rx_b) = joined(&hub).await;
        let info = TreeInfo {
            id: "t".into(),
            name: Some("Plan".into()),
            updated_at: 10,
            deleted: false,
        };
        hub.handle(a, ClientMessage::Trees(vec![info.clone()])).await;
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::TreesOk(list)] if list == &vec![info.clone()]));
        assert!(matches!(drain(&mut rx_b).as_slice(), [ServerMessage::TreesOk(_)]));

        let older = TreeInfo {
            name: Some("Old".into()),
            updated_at: 5,
            ..info.clone()
        };
        hub.handle(a, ClientMessage::Trees(vec![older])).await;
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::TreesOk(list)] if list == &vec![info.clone()]));
        assert!(drain(&mut rx_b).is_empty());
    }
}
