//! Per-connection state machine.

use tracing::{debug, info};

use super::actor::RegistryHandle;
use super::messages::{ClientMessage, Hello};
use super::types::{
    ConnId, DEFAULT_NAME, DEFAULT_ROLE, Liveness, Peer, PeerId, PeerSender, PeerStatus, RoomKey,
    SignalingError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered(PeerId),
    Closed,
}

/// Drives one connection: turns inbound frames into registry commands.
pub struct ConnectionSession {
    conn: ConnId,
    state: SessionState,
    liveness: Liveness,
    tx: PeerSender,
    registry: RegistryHandle,
}

impl ConnectionSession {
    /// `tx` is the connection's outbound queue; it is handed to the peer on
    /// registration.
    pub fn new(registry: RegistryHandle, tx: PeerSender) -> Self {
        Self {
            conn: ConnId::next(),
            state: SessionState::Unregistered,
            liveness: Liveness::new(),
            tx,
            registry,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        match &self.state {
            SessionState::Registered(id) => Some(id),
            _ => None,
        }
    }

    /// Handle one inbound text frame. Malformed or out-of-place frames are
    /// dropped; only a dead registry is an error.
    pub async fn on_text(&mut self, text: &str) -> Result<(), SignalingError> {
        let registered = match &self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Unregistered => None,
            SessionState::Registered(id) => Some(id.clone()),
        };
        self.liveness.mark_alive();

        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed frame on {}: {}", self.conn, e);
                return Ok(());
            }
        };

        match (registered, msg) {
            (_, ClientMessage::Hello(hello)) => self.register(hello).await?,

            (Some(id), ClientMessage::Presence { status }) => {
                let status = PeerStatus::from_presence(status.as_deref());
                self.registry.set_status(id, self.conn, status).await?;
            }

            (
                Some(id),
                ClientMessage::Offer(frame) | ClientMessage::Answer(frame) | ClientMessage::Ice(frame),
            ) => match frame.to.clone() {
                Some(to) => self.registry.relay(id, self.conn, to, frame).await?,
                None => debug!("Dropping relay frame without target from {}", id),
            },

            (Some(id), ClientMessage::Unknown) => {
                debug!("Ignoring unrecognized frame from {}", id);
            }

            (None, msg) => {
                debug!("Ignoring {} before hello on {}", msg.kind(), self.conn);
            }
        }
        Ok(())
    }

    /// Any non-text traffic (binary frames) still counts as liveness.
    pub fn on_activity(&self) {
        if self.state != SessionState::Closed {
            self.liveness.mark_alive();
        }
    }

    pub fn on_pong(&self) {
        self.on_activity();
    }

    /// Close from either side. Removes the registered peer, if any, and
    /// broadcasts its room. Idempotent.
    pub async fn on_close(&mut self) -> Result<(), SignalingError> {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Registered(id) = state {
            self.registry.leave(id, self.conn).await?;
        }
        Ok(())
    }

    async fn register(&mut self, hello: Hello) -> Result<(), SignalingError> {
        let id = PeerId::from_client(hello.device_id.as_deref());

        if let SessionState::Registered(previous) = &self.state {
            if previous != &id {
                self.registry.leave(previous.clone(), self.conn).await?;
            }
        }

        let peer = Peer {
            name: hello.name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
            role: hello.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            liveness: self.liveness.clone(),
            ..Peer::new(
                id.clone(),
                RoomKey::normalize(hello.room.as_deref()),
                self.conn,
                self.tx.clone(),
            )
        };
        info!("Registering peer {} ({}) on {}", id, peer.role, self.conn);
        self.registry.admit(peer).await?;
        self.state = SessionState::Registered(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use super::*;
    use crate::signaling::types::Outbound;

    fn session(registry: &RegistryHandle) -> (ConnectionSession, UnboundedReceiver<Outbound>) {
        let (tx, rx) = unbounded_channel();
        (ConnectionSession::new(registry.clone(), tx), rx)
    }

    async fn next_json(rx: &mut UnboundedReceiver<Outbound>) -> Value {
        loop {
            match rx.recv().await.expect("connection queue closed") {
                Outbound::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    fn roster_ids(msg: &Value) -> Vec<&str> {
        msg["list"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["deviceId"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn hello_registers_with_defaults() {
        let registry = RegistryHandle::spawn();
        let (mut s, mut rx) = session(&registry);

        s.on_text(r#"{"type":"hello","room":"  lobby "}"#).await.unwrap();
        let Some(id) = s.peer_id().cloned() else {
            panic!("Expected registered session");
        };

        let roster = next_json(&mut rx).await;
        assert_eq!(
            roster,
            json!({"type": "roster", "list": [
                {"deviceId": id.as_str(), "name": "peer", "role": "receiver", "status": "available"}
            ]})
        );
        let listed = registry.roster(RoomKey::from("LOBBY")).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn frames_before_hello_are_ignored() {
        let registry = RegistryHandle::spawn();
        let (mut s, mut rx) = session(&registry);

        s.on_text(r#"{"type":"presence","status":"busy"}"#).await.unwrap();
        s.on_text(r#"{"type":"offer","to":"x"}"#).await.unwrap();
        s.on_text("not json").await.unwrap();
        assert_eq!(s.state(), &SessionState::Unregistered);

        assert!(registry.roster(RoomKey::public()).await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn presence_toggles_busy() {
        let registry = RegistryHandle::spawn();
        let (mut s, mut rx) = session(&registry);
        s.on_text(r#"{"type":"hello","deviceId":"a"}"#).await.unwrap();
        next_json(&mut rx).await;
        next_json(&mut rx).await;

        s.on_text(r#"{"type":"presence","status":"busy"}"#).await.unwrap();
        assert_eq!(next_json(&mut rx).await["list"][0]["status"], "busy");

        s.on_text(r#"{"type":"presence"}"#).await.unwrap();
        assert_eq!(next_json(&mut rx).await["list"][0]["status"], "available");

        s.on_text(r#"{"type":"presence","status":"busy"}"#).await.unwrap();
        s.on_text(r#"{"type":"presence","status":"away"}"#).await.unwrap();
        assert_eq!(next_json(&mut rx).await["list"][0]["status"], "busy");
        assert_eq!(next_json(&mut rx).await["list"][0]["status"], "available");
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let registry = RegistryHandle::spawn();
        let (mut a, mut rx_a) = session(&registry);
        let (mut b, mut rx_b) = session(&registry);

        a.on_text(r#"{"type":"hello","deviceId":"a","name":"Alice","role":"sender","room":"R"}"#)
            .await
            .unwrap();
        let own = next_json(&mut rx_a).await;
        assert_eq!(
            own,
            json!({"type": "roster", "list": [
                {"deviceId": "a", "name": "Alice", "role": "sender", "status": "available"}
            ]})
        );
        assert_eq!(next_json(&mut rx_a).await, own);

        b.on_text(r#"{"type":"hello","deviceId":"b","room":"r"}"#).await.unwrap();
        assert_eq!(roster_ids(&next_json(&mut rx_a).await), vec!["a", "b"]);
        assert_eq!(roster_ids(&next_json(&mut rx_b).await), vec!["a", "b"]);
        assert_eq!(roster_ids(&next_json(&mut rx_b).await), vec!["a", "b"]);

        a.on_text(r#"{"type":"offer","to":"b","sdp":"X"}"#).await.unwrap();
        assert_eq!(
            next_json(&mut rx_b).await,
            json!({"type": "offer", "to": "b", "sdp": "X", "from": "a"})
        );

        b.on_close().await.unwrap();
        assert_eq!(b.state(), &SessionState::Closed);
        let after = next_json(&mut rx_a).await;
        assert_eq!(roster_ids(&after), vec!["a"]);
    }

    #[tokio::test]
    async fn close_before_hello_has_no_side_effects() {
        let registry = RegistryHandle::spawn();
        let (mut s, _rx) = session(&registry);
        s.on_close().await.unwrap();
        assert_eq!(s.state(), &SessionState::Closed);

        s.on_text(r#"{"type":"hello","deviceId":"late"}"#).await.unwrap();
        assert_eq!(s.state(), &SessionState::Closed);
        assert!(registry.roster(RoomKey::public()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_hello_moves_peer() {
        let registry = RegistryHandle::spawn();
        let (mut s, _rx) = session(&registry);
        s.on_text(r#"{"type":"hello","deviceId":"a","room":"one"}"#).await.unwrap();
        s.on_text(r#"{"type":"hello","deviceId":"a2","room":"two"}"#).await.unwrap();

        assert!(registry.roster(RoomKey::from("ONE")).await.unwrap().is_empty());
        let two = registry.roster(RoomKey::from("TWO")).await.unwrap();
        assert_eq!(two.len(), 1);
        assert_eq!(two[0].id, PeerId::from("a2"));
    }

    #[tokio::test]
    async fn inbound_traffic_refreshes_liveness() {
        let registry = RegistryHandle::spawn();
        let (mut s, _rx) = session(&registry);
        s.on_text(r#"{"type":"hello","deviceId":"a"}"#).await.unwrap();

        assert!(s.liveness().take());
        s.on_text("garbage").await.unwrap();
        assert!(s.liveness().is_alive());

        s.liveness().take();
        s.on_pong();
        assert!(s.liveness().is_alive());
    }
}
