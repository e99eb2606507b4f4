//! Peer registry and room index.
//!
//! Both live in one [`Registry`] so that membership changes and roster
//! computation are always applied together. The registry is owned by the
//! registry actor; nothing else mutates it.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::messages::{RelayFrame, ServerMessage};
use super::types::{ConnId, Outbound, OutboundMessage, Peer, PeerId, PeerInfo, PeerStatus, RoomKey};

/// Outcome of one heartbeat sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub terminated: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<PeerId, Peer>,
    /// Member ids per room, in join order.
    rooms: HashMap<RoomKey, Vec<PeerId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, returning the entry it replaced.
    pub fn register(&mut self, peer: Peer) -> Option<Peer> {
        self.peers.insert(peer.id.clone(), peer)
    }

    pub fn lookup(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Add `id` to `room`, creating the room if needed.
    pub fn join(&mut self, id: &PeerId, room: &RoomKey) {
        let members = self.rooms.entry(room.clone()).or_default();
        if !members.contains(id) {
            members.push(id.clone());
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.room = room.clone();
        }
    }

    /// Remove `id` from `room`, deleting the room once empty.
    pub fn leave(&mut self, id: &PeerId, room: &RoomKey) {
        let Some(members) = self.rooms.get_mut(room) else {
            return;
        };
        members.retain(|member| member != id);
        if members.is_empty() {
            self.rooms.remove(room);
            info!("Room {} removed (empty)", room);
        }
    }

    pub fn members(&self, room: &RoomKey) -> &[PeerId] {
        self.rooms.get(room).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resolve the room's members against the registry. Ids that no longer
    /// resolve, or that resolve to a peer now in another room, are skipped.
    pub fn roster(&self, room: &RoomKey) -> Vec<PeerInfo> {
        self.resolve(room).map(Peer::info).collect()
    }

    /// Members of `room` that still resolve to a peer currently in `room`.
    fn resolve<'a>(&'a self, room: &'a RoomKey) -> impl Iterator<Item = &'a Peer> + 'a {
        self.members(room)
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter(move |peer| &peer.room == room)
    }

    /// Serialize once and hand a copy to every resolvable member. Returns the
    /// number of members whose connection accepted it.
    pub fn broadcast(&self, room: &RoomKey, msg: &ServerMessage) -> usize {
        let Some(out) = encode(msg) else {
            return 0;
        };
        self.resolve(room)
            .filter(|peer| peer.deliver(Outbound::Text(out.clone())))
            .count()
    }

    pub fn broadcast_roster(&self, room: &RoomKey) -> usize {
        let roster = ServerMessage::Roster {
            list: self.roster(room),
        };
        self.broadcast(room, &roster)
    }

    /// Deliver `frame` from `from` to `to` when both are in the same room.
    /// Anything else is dropped without telling the sender.
    pub fn relay(&self, from: &PeerId, to: &PeerId, frame: &RelayFrame) -> bool {
        let (Some(sender), Some(target)) = (self.peers.get(from), self.peers.get(to)) else {
            debug!("Dropping relay {} -> {}: unknown peer", from, to);
            return false;
        };
        if sender.room != target.room {
            debug!("Dropping relay {} -> {}: different rooms", from, to);
            return false;
        }
        target.deliver(Outbound::Text(frame.forwarded(from)))
    }

    /// Peer registered under `id` by connection `conn`, if it is still that
    /// connection's entry.
    pub fn owned_by(&self, id: &PeerId, conn: ConnId) -> Option<&Peer> {
        self.peers.get(id).filter(|peer| peer.conn == conn)
    }

    /// Register a peer from a `hello`: join its room, send it the roster
    /// directly, then broadcast the roster to the whole room.
    ///
    /// A peer already registered under the same id is replaced. It leaves its
    /// room, and if it belonged to another connection that connection is
    /// terminated.
    pub fn admit(&mut self, peer: Peer) {
        let id = peer.id.clone();
        let room = peer.room.clone();
        let conn = peer.conn;

        if let Some(prior) = self.remove(&id) {
            self.leave(&id, &prior.room);
            if prior.conn != conn {
                warn!("Peer {} re-registered from {}, dropping {}", id, conn, prior.conn);
                prior.deliver(Outbound::Terminate);
            }
            if prior.room != room {
                self.broadcast_roster(&prior.room);
            }
        }

        self.register(peer);
        self.join(&id, &room);
        info!("Peer {} joined room {}", id, room);

        let roster = ServerMessage::Roster {
            list: self.roster(&room),
        };
        if let (Some(peer), Some(out)) = (self.peers.get(&id), encode(&roster)) {
            peer.deliver(Outbound::Text(out));
        }
        self.broadcast(&room, &roster);
    }

    /// Remove the entry `conn` registered under `id` and tell its room.
    pub fn depart(&mut self, id: &PeerId, conn: ConnId) -> bool {
        if self.owned_by(id, conn).is_none() {
            return false;
        }
        let Some(peer) = self.remove(id) else {
            return false;
        };
        self.leave(id, &peer.room);
        info!("Peer {} left room {}", id, peer.room);
        self.broadcast_roster(&peer.room);
        true
    }

    pub fn set_status(&mut self, id: &PeerId, conn: ConnId, status: PeerStatus) -> bool {
        let Some(peer) = self.peers.get_mut(id).filter(|peer| peer.conn == conn) else {
            return false;
        };
        peer.status = status;
        let room = peer.room.clone();
        self.broadcast_roster(&room);
        true
    }

    /// Relay on behalf of the peer `conn` registered as `from`.
    pub fn relay_from(&self, from: &PeerId, conn: ConnId, to: &PeerId, frame: &RelayFrame) -> bool {
        if self.owned_by(from, conn).is_none() {
            debug!("Dropping relay from stale session {}", conn);
            return false;
        }
        self.relay(from, to, frame)
    }

    /// Terminate peers that stayed silent since the previous sweep; clear the
    /// flag and ping everyone else.
    pub fn heartbeat_sweep(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        for peer in self.peers.values() {
            if peer.liveness.take() {
                peer.deliver(Outbound::Ping);
                report.pinged += 1;
            } else {
                warn!("Peer {} missed heartbeat, terminating", peer.id);
                peer.deliver(Outbound::Terminate);
                report.terminated += 1;
            }
        }
        report
    }
}

fn encode(msg: &ServerMessage) -> Option<OutboundMessage> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(OutboundMessage::from(json)),
        Err(e) => {
            warn!("Failed to serialize server message: {}", e);
            None
        }
    }
}
