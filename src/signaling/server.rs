use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::SignalingConfig;
use crate::protocol::{self, ClientMessage, ServerMessage};

use super::actor::RelayHandle;
use super::types::OutboundMessage;

pub struct SignalingServer {
    listener: TcpListener,
    handle: RelayHandle,
    config: SignalingConfig,
}

impl SignalingServer {
    /// Bind the listener and start the relay actor. A bind failure is the
    /// only fatal error and is returned to the caller.
    pub async fn bind(config: SignalingConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let handle = RelayHandle::spawn(config.max_connections);

        info!("Signaling server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handle,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let handle = self.handle.clone();
            let liveness = Liveness::from(&self.config);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handle, liveness).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    heartbeat_interval: Duration,
    pong_timeout: Option<Duration>,
}

impl From<&SignalingConfig> for Liveness {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            pong_timeout: config.pong_timeout,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RelayHandle,
    liveness: Liveness,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let peer_id = match handle.connect(tx.clone()).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Refusing {}: {}", addr, e);
            let _ = ws_tx.send(Message::Close(None)).await;
            return Ok(());
        }
    };
    info!("WebSocket connection from {} assigned {}", addr, peer_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(Message::Text(msg.into_inner())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let ping = OutboundMessage::encode(&ServerMessage::Ping)?;
    let mut ping_interval = tokio::time::interval(liveness.heartbeat_interval);
    // the first tick fires immediately
    ping_interval.tick().await;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                let _ = tx.send(ping.clone());
                if let (Some(timeout), None) = (liveness.pong_timeout, pong_deadline) {
                    pong_deadline = Some(Instant::now() + timeout);
                }
                debug!("Ping sent to {}", peer_id);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", peer_id);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", peer_id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => match protocol::decode::<ClientMessage>(&text) {
                        Ok(ClientMessage::Pong) => {
                            pong_deadline = None;
                            handle.dispatch(peer_id, ClientMessage::Pong).await;
                        }
                        Ok(client_msg) => handle.dispatch(peer_id, client_msg).await,
                        Err(e) => warn!("Dropping message from {}: {}", peer_id, e),
                    },
                    Message::Binary(_) => debug!("Ignoring binary frame from {}", peer_id),
                    Message::Close(_) => {
                        info!("Close received from {}", peer_id);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    handle.disconnect(&peer_id).await;
    drop(tx);
    // let the writer flush the remove-peer notices before the socket goes away
    if tokio::time::timeout(Duration::from_millis(100), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    info!("WebSocket disconnected: {} ({})", peer_id, addr);

    Ok(())
}
