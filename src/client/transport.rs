use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::protocol::{self, ClientMessage, ServerMessage};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Inbound side of the signaling socket. `Closed` is delivered exactly once
/// and nothing follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed,
}

/// Open a WebSocket to the relay and split it into an outbound queue and an
/// inbound event stream.
pub async fn connect(
    url: &str,
) -> Result<
    (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ),
    TransportError,
> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    info!("Connected to signaling server {}", url);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match protocol::encode(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {:?}: {}", msg, e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => match protocol::decode::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if in_tx.send(TransportEvent::Message(msg)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping message from server: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => debug!("Ignoring binary frame from server"),
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
            }
        }
        info!("Disconnected from signaling server");
        let _ = in_tx.send(TransportEvent::Closed);
    });

    Ok((out_tx, in_rx))
}
