use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::RegistryHandle;
use super::heartbeat::HeartbeatMonitor;
use super::session::ConnectionSession;
use super::types::{Outbound, SignalingError};
use crate::config::Config;

pub const DEFAULT_SIGNALING_PORT: u16 = 8787;
/// Websocket upgrades are only accepted under this path.
pub const SIGNALING_PATH: &str = "/server";

const HEAD_PEEK_LEN: usize = 2048;
const HEAD_PEEK_ATTEMPTS: usize = 20;
const HEAD_PEEK_BACKOFF: Duration = Duration::from_millis(5);

pub struct SignalingServer {
    listener: TcpListener,
    handle: RegistryHandle,
    allow_origins: Option<Arc<[String]>>,
    heartbeat: Duration,
    handshake_timeout: Duration,
}

impl SignalingServer {
    /// Bind the listener and start the registry actor.
    pub async fn bind(config: &Config) -> Result<Self, SignalingError> {
        let addr: SocketAddr = config.bind_addr().parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Signaling server listening on {} path={}",
            listener.local_addr()?,
            SIGNALING_PATH
        );

        let allow_origins: Option<Arc<[String]>> = config.origin_allow_list().map(Arc::from);
        if let Some(origins) = &allow_origins {
            info!("Accepting websocket origins: {}", origins.join(", "));
        }

        Ok(Self {
            listener,
            handle: RegistryHandle::spawn(),
            allow_origins,
            heartbeat: config.heartbeat_interval(),
            handshake_timeout: config.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<(), SignalingError> {
        let heartbeat = HeartbeatMonitor::new(self.handle.clone(), self.heartbeat).spawn();

        let result = loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(SignalingError::from(e)),
            };
            let handle = self.handle.clone();
            let allow_origins = self.allow_origins.clone();
            let handshake_timeout = self.handshake_timeout;

            tokio::spawn(async move {
                let result =
                    handle_connection(stream, addr, handle, allow_origins, handshake_timeout).await;
                if let Err(e) = result {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        };

        heartbeat.abort();
        result
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RegistryHandle,
    allow_origins: Option<Arc<[String]>>,
    handshake_timeout: Duration,
) -> Result<(), SignalingError> {
    let Ok(head) = timeout(handshake_timeout, peek_request_head(&stream)).await else {
        debug!("No request head from {} within {:?}, dropping", addr, handshake_timeout);
        return Ok(());
    };
    let head = head?;
    if !is_upgrade(&head) {
        return serve_http(stream, &head).await;
    }

    let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        check_upgrade(req, resp, allow_origins.as_deref())
    });
    let Ok(ws_stream) = timeout(handshake_timeout, handshake).await else {
        debug!("Handshake from {} did not finish within {:?}", addr, handshake_timeout);
        return Ok(());
    };
    let ws_stream = ws_stream?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    info!("WebSocket connection from {}", addr);

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut session = ConnectionSession::new(handle, tx);

    let mut send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let ws_msg = match out {
                Outbound::Text(msg) => Message::Text(msg.into_inner()),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Terminate => break,
            };
            if ws_tx.send(ws_msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => {
                debug!("Outbound side of {} finished, terminating", addr);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = session.on_text(text.as_str()).await {
                            warn!("Message handling error: {}", e);
                            break;
                        }
                    }
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if let Err(e) = session.on_text(text).await {
                                warn!("Message handling error: {}", e);
                                break;
                            }
                        }
                        Err(_) => session.on_activity(),
                    },
                    Message::Pong(_) => {
                        session.on_pong();
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Err(e) = session.on_close().await {
        warn!("Cleanup for {} failed: {}", addr, e);
    }

    send_task.abort();
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}

/// Peek at the request head without consuming it, so the websocket handshake
/// can still read it.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<String> {
    let mut buf = [0u8; HEAD_PEEK_LEN];
    let mut n = 0;
    for _ in 0..HEAD_PEEK_ATTEMPTS {
        n = stream.peek(&mut buf).await?;
        if n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        tokio::time::sleep(HEAD_PEEK_BACKOFF).await;
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

fn is_upgrade(head: &str) -> bool {
    head.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

fn request_path(head: &str) -> &str {
    head.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
}

/// Plain HTTP: `/` is the liveness probe, everything else is 404.
async fn serve_http(mut stream: TcpStream, head: &str) -> Result<(), SignalingError> {
    let response = if request_path(head) == "/" {
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    };

    let mut buf = [0u8; HEAD_PEEK_LEN];
    let _ = stream.read(&mut buf).await?;
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn check_upgrade(
    req: &Request,
    resp: Response,
    allow_origins: Option<&[String]>,
) -> Result<Response, ErrorResponse> {
    if !req.uri().path().starts_with(SIGNALING_PATH) {
        debug!("Rejecting upgrade on {}", req.uri().path());
        return Err(reject(StatusCode::NOT_FOUND));
    }

    if let Some(allowed) = allow_origins {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !allowed.iter().any(|candidate| candidate == origin) {
            warn!("Rejecting upgrade from origin {:?}", origin);
            return Err(reject(StatusCode::FORBIDDEN));
        }
    }

    Ok(resp)
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}
