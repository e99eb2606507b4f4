use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::actor::RegistryHandle;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);

/// Periodically pings every registered peer and terminates the ones that
/// did not show any traffic since the previous tick.
pub struct HeartbeatMonitor {
    registry: RegistryHandle,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: RegistryHandle, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the registry actor goes away. The first sweep happens one
    /// full interval after start.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.registry.heartbeat().await {
                Ok(report) => debug!(
                    "Heartbeat: pinged {}, terminated {}",
                    report.pinged, report.terminated
                ),
                Err(_) => {
                    info!("Registry gone, stopping heartbeat");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::signaling::session::ConnectionSession;
    use crate::signaling::types::{Outbound, RoomKey};

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_terminated_and_removed() {
        let registry = RegistryHandle::spawn();
        let (tx_quiet, mut rx_quiet) = unbounded_channel();
        let (tx_chatty, mut rx_chatty) = unbounded_channel();
        let mut quiet = ConnectionSession::new(registry.clone(), tx_quiet);
        let mut chatty = ConnectionSession::new(registry.clone(), tx_chatty);
        quiet.on_text(r#"{"type":"hello","deviceId":"q","room":"hb"}"#).await.unwrap();
        chatty.on_text(r#"{"type":"hello","deviceId":"c","room":"hb"}"#).await.unwrap();

        let started = Instant::now();
        let monitor = HeartbeatMonitor::new(registry.clone(), HEARTBEAT_INTERVAL).spawn();

        // first tick: both pinged
        loop {
            match rx_chatty.recv().await.unwrap() {
                Outbound::Ping => break,
                _ => continue,
            }
        }
        assert!(started.elapsed() >= HEARTBEAT_INTERVAL);
        chatty.on_pong();

        // second tick: the quiet one is terminated, the chatty one pinged again
        loop {
            match rx_quiet.recv().await.unwrap() {
                Outbound::Terminate => break,
                _ => continue,
            }
        }
        assert!(started.elapsed() >= HEARTBEAT_INTERVAL * 2);
        assert!(started.elapsed() < HEARTBEAT_INTERVAL * 3);

        // the connection runs its close path; the survivor hears about it
        quiet.on_close().await.unwrap();
        let roster = loop {
            if let Outbound::Text(text) = rx_chatty.recv().await.unwrap() {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if value["list"].as_array().map(Vec::len) == Some(1) {
                    break value;
                }
            }
        };
        assert_eq!(roster["list"][0]["deviceId"], "c");

        let remaining = registry.roster(RoomKey::from("hb")).await.unwrap();
        assert_eq!(remaining.len(), 1);
        monitor.abort();
    }
}
