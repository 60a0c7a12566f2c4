//! Delta sync wire protocol.
//!
//! Every message is a `{tag, payload}` JSON envelope. On a byte stream each
//! envelope travels as one frame: a little-endian `u32` length followed by the
//! JSON body.

use crate::card::{Card, HistorySnapshot};
use crate::hlc::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default page size for `historyMeta`.
pub const HISTORY_PAGE_SIZE: usize = 50;

/// Framing and decoding failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Document-list entry, last-writer-wins by `updated_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeInfo {
    pub id: String,
    pub name: Option<String>,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

/// Merge document-list entries into `into`, returning the entries that won
pub fn merge_tree_infos(into: &mut BTreeMap<String, TreeInfo>, incoming: Vec<TreeInfo>) -> Vec<TreeInfo> {
    let mut changed = Vec::new();
    for info in incoming {
        let newer = into
            .get(&info.id)
            .is_none_or(|current| info.updated_at > current.updated_at);
        if newer {
            changed.push(info.clone());
            into.insert(info.id.clone(), info);
        }
    }
    changed
}

/// Index entry for one history snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub snapshot_key: Timestamp,
    pub card_count: usize,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enter the room of a tree; always the first message after connecting
    #[serde(rename_all = "camelCase")]
    Join { tree_id: String },
    /// Delta batch of locally stamped cards
    #[serde(rename_all = "camelCase")]
    Push { tree_id: String, cards: Vec<Card> },
    /// Request the full authoritative state of a tree
    #[serde(rename_all = "camelCase")]
    Pull { tree_id: String },
    Trees(Vec<TreeInfo>),
    /// Page of the snapshot index, newest first, strictly older than `before`
    #[serde(rename_all = "camelCase")]
    HistoryMeta {
        tree_id: String,
        before: Option<Timestamp>,
        limit: usize,
    },
    #[serde(rename_all = "camelCase")]
    History { tree_id: String, snapshot_key: Timestamp },
    Ping,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Bulk upsert of cards; `full` replaces the client's copy of the tree
    #[serde(rename_all = "camelCase")]
    Cards {
        tree_id: String,
        cards: Vec<Card>,
        #[serde(default)]
        full: bool,
    },
    /// The push could not be applied; re-fetch authoritative state
    #[serde(rename_all = "camelCase")]
    CardsConflict { tree_id: String, reason: String },
    /// Push accepted; `synced` lists the `(id, timestamp)` pairs now durable
    #[serde(rename_all = "camelCase")]
    PushOk {
        tree_id: String,
        watermark: Timestamp,
        synced: Vec<(String, Timestamp)>,
    },
    #[serde(rename_all = "camelCase")]
    PushError { tree_id: String, error: String },
    /// The server invalidated a tree; pull it again
    #[serde(rename_all = "camelCase")]
    DoPull { tree_id: String },
    TreesOk(Vec<TreeInfo>),
    #[serde(rename_all = "camelCase")]
    HistoryMeta {
        tree_id: String,
        entries: Vec<SnapshotMeta>,
        /// Cursor for the next page, if any
        next: Option<Timestamp>,
    },
    #[serde(rename_all = "camelCase")]
    History {
        tree_id: String,
        snapshot: Option<HistorySnapshot>,
    },
    Pong,
}

/// A message that can travel in a frame
pub trait Envelope: Serialize + DeserializeOwned {
    /// Serialize to a length-prefixed frame.
    fn encode(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Deserialize from a frame body (after the length prefix).
    fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl Envelope for ClientMessage {}
impl Envelope for ServerMessage {}

/// Write one frame
pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Envelope,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; [`ProtocolError::Closed`] on a clean end of stream
pub async fn read_frame<R, M>(reader: &mut R) -> Result<M>
where
    R: AsyncRead + Unpin,
    M: Envelope,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    M::decode(&body)
}
