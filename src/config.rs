use std::time::Duration;

use clap::Parser;

use crate::signaling::{DEFAULT_SIGNALING_PORT, HEARTBEAT_INTERVAL};

const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Lobby relay: room-scoped WebRTC signaling over WebSocket
#[derive(Parser, Debug, Clone)]
#[command(name = "lobby-relay")]
#[command(version)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_SIGNALING_PORT)]
    pub port: u16,

    /// Bind address
    #[arg(short, long, env = "BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Comma-separated origins allowed to open the websocket (any when unset)
    #[arg(long, env = "ALLOW_ORIGINS", value_delimiter = ',')]
    pub allow_origins: Vec<String>,

    /// Seconds between heartbeat sweeps
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = HEARTBEAT_INTERVAL.as_secs())]
    pub heartbeat_secs: u64,

    /// Seconds a new connection may take to send its request and finish the
    /// websocket handshake
    #[arg(long, env = "HANDSHAKE_TIMEOUT_SECS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
    pub handshake_timeout_secs: u64,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// Trimmed, non-empty origins, or `None` when every origin is accepted.
    pub fn origin_allow_list(&self) -> Option<Vec<String>> {
        let origins: Vec<String> = self
            .allow_origins
            .iter()
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();
        (!origins.is_empty()).then_some(origins)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_SIGNALING_PORT,
            bind: "0.0.0.0".to_string(),
            allow_origins: Vec::new(),
            heartbeat_secs: HEARTBEAT_INTERVAL.as_secs(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }
}
