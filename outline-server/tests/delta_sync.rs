//! Delta sync over TCP between two clients and the hub

use outline_core::card::{Card, CardBatch, CardStore};
use outline_core::hlc::{Hlc, ManualClock};
use outline_core::transport::{DeltaClient, Event, TcpConnector};
use outline_core::SyncConfig;
use outline_server::hub::{Hub, Retention};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn start_server() -> (String, Arc<Hub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    // Server clock stays behind the clients so client edits order by their own clocks
    let clock = Arc::new(ManualClock::new(1_000));
    let hub = Arc::new(Hub::with_clock(Hlc::with_source("server", clock), Retention::default()));
    tokio::spawn(outline_server::serve(listener, hub.clone()));
    (addr, hub)
}

fn client(addr: &str, node: &str, at: i64) -> DeltaClient<TcpConnector> {
    let clock = Arc::new(ManualClock::new(at));
    let store = CardStore::new(Hlc::with_source(node, clock));
    DeltaClient::new(TcpConnector::new(addr), "t", store, &SyncConfig::default())
}

async fn next(client: &mut DeltaClient<TcpConnector>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), client.next_event())
        .await
        .expect("server reply")
        .unwrap()
}

fn edit(client: &DeltaClient<TcpConnector>, content: &str) -> CardBatch {
    let mut card = client.store().get("x").unwrap().clone();
    card.content = content.to_string();
    CardBatch {
        to_add: vec![card],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_offline_edit_wins_by_timestamp() {
    let (addr, hub) = start_server().await;
    let mut a = client(&addr, "a", 2_000);
    let mut b = client(&addr, "b", 3_000);

    a.connect().await.unwrap();
    assert!(matches!(next(&mut a).await, Event::Trees(_)));
    a.apply_local(CardBatch {
        to_add: vec![Card::new("x", "t", None, "foo", 0.0)],
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(next(&mut a).await, Event::Pushed { synced: 1 });

    b.connect().await.unwrap();
    assert!(matches!(next(&mut b).await, Event::Trees(_)));
    b.pull().await.unwrap();
    assert!(matches!(next(&mut b).await, Event::Cards(_)));
    assert_eq!(b.store().get("x").unwrap().content, "foo");

    // B goes offline; A edits first, B edits later
    b.disconnect();
    let batch = edit(&a, "bar");
    a.apply_local(batch).await.unwrap();
    assert_eq!(next(&mut a).await, Event::Pushed { synced: 1 });
    let batch = edit(&b, "baz");
    b.apply_local(batch).await.unwrap();
    assert_eq!(b.queued(), 1);

    b.connect().await.unwrap();
    assert!(matches!(next(&mut b).await, Event::Trees(_)));
    assert_eq!(next(&mut b).await, Event::Pushed { synced: 1 });
    assert!(matches!(next(&mut a).await, Event::Cards(_)));

    assert_eq!(a.store().get("x").unwrap().content, "baz");
    assert_eq!(b.store().get("x").unwrap().content, "baz");
    assert_eq!(hub.cards("t").await[0].content, "baz");
    assert!(b.store().unsynced("t").is_empty());
}

#[tokio::test]
async fn test_ping_pong() {
    let (addr, _hub) = start_server().await;
    let mut a = client(&addr, "a", 1_000);
    a.connect().await.unwrap();
    assert!(matches!(next(&mut a).await, Event::Trees(_)));
    a.send(outline_core::ClientMessage::Ping).await.unwrap();
    assert_eq!(next(&mut a).await, Event::Pong);
}
