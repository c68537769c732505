use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::protocol::{self, PeerId, ProtocolError};

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Create a new outbound message from any string type
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    /// Serialize a protocol message into a frame
    pub fn encode<T: Serialize>(msg: &T) -> Result<Self, ProtocolError> {
        Ok(Self::from(protocol::encode(msg)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

pub type ChannelName = String;

/// Relay-side record of one transport connection
#[derive(Debug)]
pub(crate) struct Connection {
    /// Channel for outbound messages to this connection.
    pub tx: mpsc::UnboundedSender<OutboundMessage>,
    pub channels: HashSet<ChannelName>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            tx,
            channels: HashSet::new(),
        }
    }
}

/// Members of one named channel
#[derive(Debug, Default)]
pub(crate) struct Channel {
    pub members: HashSet<PeerId>,
}
