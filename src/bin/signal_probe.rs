//! Joins a channel on a running relay and prints who comes and goes.
//!
//! Usage: signal_probe [ws://host:port] [channel]

use std::error::Error;

use meshroom::client::{TransportEvent, connect_transport};
use meshroom::protocol::{ClientMessage, ServerMessage};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "ws://127.0.0.1:3000".to_string());
    let channel = args.next().unwrap_or_else(|| "lobby".to_string());

    let (outbound, mut inbound) = connect_transport(&url).await?;
    outbound.send(ClientMessage::JoinChannel {
        channel: channel.clone(),
    })?;

    while let Some(event) = inbound.recv().await {
        let msg = match event {
            TransportEvent::Message(msg) => msg,
            TransportEvent::Closed => {
                println!("Relay closed the connection");
                break;
            }
        };

        match msg {
            ServerMessage::Connected { self_id, peers } => {
                println!("Connected as {} ({} others online)", self_id, peers.len());
                println!("Joined '{}'", channel);
            }
            ServerMessage::AddPeer {
                peer_id,
                should_create_offer,
            } => {
                let role = if should_create_offer { "offerer" } else { "answerer" };
                println!("+ {} (we are {})", peer_id, role);
            }
            ServerMessage::RemovePeer { peer_id } => println!("- {}", peer_id),
            ServerMessage::SessionDescription {
                peer_id,
                description,
            } => println!("< {} from {}", description.kind, peer_id),
            ServerMessage::IceCandidate { peer_id, .. } => println!("< candidate from {}", peer_id),
            ServerMessage::Ping => {
                let _ = outbound.send(ClientMessage::Pong);
            }
        }
    }

    Ok(())
}
