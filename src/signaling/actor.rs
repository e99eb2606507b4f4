use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::RelayFrame;
use super::registry::{HeartbeatReport, Registry};
use super::types::{ConnId, Peer, PeerId, PeerInfo, PeerStatus, RoomKey, SignalingError};

const COMMAND_QUEUE: usize = 1024;

/// Commands sent to the registry actor
pub(crate) enum RegistryCommand {
    Admit {
        peer: Peer,
    },
    Leave {
        peer_id: PeerId,
        conn: ConnId,
    },
    SetStatus {
        peer_id: PeerId,
        conn: ConnId,
        status: PeerStatus,
    },
    Relay {
        from: PeerId,
        conn: ConnId,
        to: PeerId,
        frame: RelayFrame,
    },
    Heartbeat {
        reply: oneshot::Sender<HeartbeatReport>,
    },
    Roster {
        room: RoomKey,
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
}

/// Sole owner of the [`Registry`]. Commands are applied one at a time, so a
/// roster is never computed halfway through a membership change.
pub(crate) async fn registry_actor(mut rx: mpsc::Receiver<RegistryCommand>) {
    let mut registry = Registry::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RegistryCommand::Admit { peer } => registry.admit(peer),

            RegistryCommand::Leave { peer_id, conn } => {
                if !registry.depart(&peer_id, conn) {
                    debug!("Leave for {} from {} ignored (not its entry)", peer_id, conn);
                }
            }

            RegistryCommand::SetStatus {
                peer_id,
                conn,
                status,
            } => {
                registry.set_status(&peer_id, conn, status);
            }

            RegistryCommand::Relay {
                from,
                conn,
                to,
                frame,
            } => {
                registry.relay_from(&from, conn, &to, &frame);
            }

            RegistryCommand::Heartbeat { reply } => {
                let _ = reply.send(registry.heartbeat_sweep());
            }

            RegistryCommand::Roster { room, reply } => {
                let _ = reply.send(registry.roster(&room));
            }
        }
    }

    debug!(
        "Registry actor stopped with {} peers in {} rooms",
        registry.peer_count(),
        registry.room_count()
    );
}

/// Handle to communicate with the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    pub(crate) tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Start a registry actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<RegistryCommand>(COMMAND_QUEUE);
        tokio::spawn(registry_actor(rx));
        Self { tx }
    }

    async fn send(&self, cmd: RegistryCommand) -> Result<(), SignalingError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| SignalingError::RegistryClosed)
    }

    /// Register a peer, send it the roster and broadcast the roster to its room
    pub async fn admit(&self, peer: Peer) -> Result<(), SignalingError> {
        self.send(RegistryCommand::Admit { peer }).await
    }

    /// Remove the entry `conn` registered as `peer_id` and broadcast its room
    pub async fn leave(&self, peer_id: PeerId, conn: ConnId) -> Result<(), SignalingError> {
        self.send(RegistryCommand::Leave { peer_id, conn }).await
    }

    pub async fn set_status(
        &self,
        peer_id: PeerId,
        conn: ConnId,
        status: PeerStatus,
    ) -> Result<(), SignalingError> {
        self.send(RegistryCommand::SetStatus {
            peer_id,
            conn,
            status,
        })
        .await
    }

    /// Forward a negotiation frame; dropped silently if unroutable
    pub async fn relay(
        &self,
        from: PeerId,
        conn: ConnId,
        to: PeerId,
        frame: RelayFrame,
    ) -> Result<(), SignalingError> {
        self.send(RegistryCommand::Relay {
            from,
            conn,
            to,
            frame,
        })
        .await
    }

    /// Run one heartbeat sweep over every registered peer
    pub async fn heartbeat(&self) -> Result<HeartbeatReport, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::Heartbeat { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| SignalingError::RegistryClosed)
    }

    /// Current roster of a room
    pub async fn roster(&self, room: RoomKey) -> Result<Vec<PeerInfo>, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::Roster {
            room,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| SignalingError::RegistryClosed)
    }
}
