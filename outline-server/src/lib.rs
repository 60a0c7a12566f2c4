//! Outline Server - delta sync hub for card trees
//!
//! Accepts TCP connections speaking length-prefixed JSON envelopes, keeps the
//! authoritative card state per tree, and periodically compacts it.

pub mod hub;

use hub::{ClientId, Hub};
use outline_core::protocol::{self, ClientMessage, ProtocolError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Accept connections forever
pub async fn serve(listener: TcpListener, hub: Arc<Hub>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, hub).await {
                error!("Error serving connection {}: {}", peer, e);
            }
        });
    }
}

/// Run compaction every `interval`
pub fn spawn_compaction(hub: Arc<Hub>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let invalidated = hub.compact().await;
            if !invalidated.is_empty() {
                info!(trees = invalidated.len(), "compaction invalidated trees");
            }
        }
    })
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: Arc<Hub>) -> Result<(), ProtocolError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (client, mut outbox) = hub.register().await;
    info!(client, %peer, "connection accepted");

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if let Err(e) = protocol::write_frame(&mut writer, &message).await {
                warn!(client, error = %e, "write failed");
                break;
            }
        }
    });

    let result = read_loop(&mut reader, client, &hub).await;
    hub.leave(client).await;
    writer_task.abort();
    info!(client, %peer, "connection closed");
    match result {
        Err(ProtocolError::Closed) => Ok(()),
        other => other,
    }
}

async fn read_loop(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    client: ClientId,
    hub: &Hub,
) -> Result<(), ProtocolError> {
    loop {
        let message: ClientMessage = protocol::read_frame(reader).await?;
        debug!(client, ?message, "received");
        hub.handle(client, message).await;
    }
}
