//! WebSocket signaling relay for peers sharing a room

mod actor;
mod heartbeat;
mod messages;
mod registry;
mod server;
mod session;
mod types;

pub use actor::RegistryHandle;
pub use heartbeat::{HEARTBEAT_INTERVAL, HeartbeatMonitor};
pub use messages::{ClientMessage, Hello, RelayFrame, ServerMessage};
pub use registry::{HeartbeatReport, Registry};
pub use server::{DEFAULT_SIGNALING_PORT, SIGNALING_PATH, SignalingServer};
pub use session::{ConnectionSession, SessionState};
pub use types::{
    ConnId, Liveness, Outbound, OutboundMessage, PUBLIC_ROOM, Peer, PeerId, PeerInfo, PeerSender,
    PeerStatus, RoomKey, SignalingError,
};
