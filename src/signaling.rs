//! WebSocket signaling relay: identity, channel membership, routing, liveness

mod actor;
mod server;
mod types;

pub use actor::RelayHandle;
pub use server::SignalingServer;
pub use types::{ChannelName, OutboundMessage, SignalingError};
