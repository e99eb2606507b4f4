use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("registry actor is no longer running")]
    RegistryClosed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bind address: {0}")]
    Address(#[from] std::net::AddrParseError),
}

pub const PUBLIC_ROOM: &str = "PUBLIC";
pub const DEFAULT_NAME: &str = "peer";
pub const DEFAULT_ROLE: &str = "receiver";

const PEER_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PEER_ID_LEN: usize = 11;

/// Peer ID: whatever the client announced as `deviceId`, or a random token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..PEER_ID_LEN)
            .map(|_| PEER_ID_CHARS[rng.random_range(0..PEER_ID_CHARS.len())] as char)
            .collect();
        Self(id)
    }

    /// Use the client supplied id, falling back to a generated one when it is
    /// missing or empty.
    pub fn from_client(raw: Option<&str>) -> Self {
        match raw {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Normalized room key: trimmed and uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn normalize(raw: Option<&str>) -> Self {
        let key = raw.unwrap_or_default().trim().to_uppercase();
        if key.is_empty() {
            Self(PUBLIC_ROOM.to_string())
        } else {
            Self(key)
        }
    }

    pub fn public() -> Self {
        Self(PUBLIC_ROOM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomKey {
    fn from(s: &str) -> Self {
        Self::normalize(Some(s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    #[default]
    Available,
    Busy,
}

impl PeerStatus {
    /// Only the literal `"busy"` marks a peer busy.
    pub fn from_presence(status: Option<&str>) -> Self {
        match status {
            Some("busy") => Self::Busy,
            _ => Self::Available,
        }
    }
}

/// Identifies one accepted websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Liveness flag shared by a connection and the peer it registered.
///
/// The connection marks it on every inbound frame; the heartbeat sweep clears
/// it and expects it to be set again before the next sweep.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn mark_alive(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// One roster entry as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "deviceId")]
    pub id: PeerId,
    pub name: String,
    pub role: String,
    pub status: PeerStatus,
}

/// Wrapper for outbound WebSocket text using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

/// Work for a connection's writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(OutboundMessage),
    Ping,
    /// Drop the socket without a close handshake.
    Terminate,
}

/// Handle onto a connection's outbound queue. The connection task owns the
/// socket; sending after it is gone fails and is ignored.
pub type PeerSender = mpsc::UnboundedSender<Outbound>;

/// A registered session.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub role: String,
    pub status: PeerStatus,
    pub room: RoomKey,
    pub conn: ConnId,
    pub liveness: Liveness,
    pub tx: PeerSender,
}

impl Peer {
    /// Peer with default display metadata, available and alive.
    pub fn new(id: PeerId, room: RoomKey, conn: ConnId, tx: PeerSender) -> Self {
        Self {
            id,
            name: DEFAULT_NAME.to_string(),
            role: DEFAULT_ROLE.to_string(),
            status: PeerStatus::Available,
            room,
            conn,
            liveness: Liveness::new(),
            tx,
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role.clone(),
            status: self.status,
        }
    }

    /// Best-effort delivery; returns whether the connection still accepted it.
    pub fn deliver(&self, out: Outbound) -> bool {
        self.tx.send(out).is_ok()
    }
}
