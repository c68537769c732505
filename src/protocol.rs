//! Wire format shared by the relay and its clients.
//!
//! Every frame is a JSON text message tagged by `type`. Messages aimed at a
//! specific peer carry that peer's id in `peerId`; the relay rewrites it to the
//! sender's id when forwarding and leaves everything else untouched.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

const PEER_ID_PREFIX: &[u8] = b"peer_";
const GENERATED_ID_LEN: usize = 21;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Longest id accepted off the wire. Relays may hand out ids of their own
/// shape (ULIDs, UUIDs), so only the upper bound is enforced.
pub const MAX_PEER_ID_LEN: usize = 64;

/// Codec errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("peer id must be 1 to {max} bytes, got {0}", max = MAX_PEER_ID_LEN)]
    InvalidPeerId(usize),
}

/// Connection id, stored inline so it stays `Copy`.
///
/// Ids generated here are "peer_" + 16 hex digits from 64 random bits, so
/// they cannot be guessed from one another. Ids parsed from the wire are kept
/// verbatim.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    bytes: [u8; MAX_PEER_ID_LEN],
    len: u8,
}

impl PeerId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; MAX_PEER_ID_LEN];
        bytes[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);

        let value: u64 = rand::rng().random();
        for i in 0..16 {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            bytes[PEER_ID_PREFIX.len() + i] = HEX_CHARS[nibble];
        }
        Self {
            bytes,
            len: GENERATED_ID_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.as_str()).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for PeerId {
    type Error = ProtocolError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() || s.len() > MAX_PEER_ID_LEN {
            return Err(ProtocolError::InvalidPeerId(s.len()));
        }
        let mut bytes = [0u8; MAX_PEER_ID_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self {
            bytes,
            len: s.len() as u8,
        })
    }
}

impl FromStr for PeerId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::try_from(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        })
    }
}

/// An SDP blob plus its role in the offer/answer exchange. Fields this crate
/// does not interpret are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default)]
    pub sdp: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
            extra: Map::new(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
            extra: Map::new(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpType::Rollback,
            sdp: String::new(),
            extra: Map::new(),
        }
    }
}

/// Browser `RTCIceCandidateInit`. `sdpMid`, `usernameFragment` and anything
/// newer ride along in `extra`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub candidate: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            sdp_mline_index,
            candidate: candidate.into(),
            extra: Map::new(),
        }
    }
}

/// Messages sent from client to relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a named channel; the relay introduces every current member
    JoinChannel { channel: String },

    /// Leave a single channel without disconnecting
    LeaveChannel { channel: String },

    /// Offer, answer or rollback for the peer named by `peer_id`
    SessionDescription {
        peer_id: PeerId,
        description: SessionDescription,
    },

    /// Gathered ICE candidate for the peer named by `peer_id`
    IceCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },

    /// Answer to a relay ping
    Pong,
}

/// Messages sent from relay to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Identity assignment plus every other connected id
    Connected { self_id: PeerId, peers: Vec<PeerId> },

    /// Introduction to a channel-mate; exactly one side of a pair gets `true`
    AddPeer {
        peer_id: PeerId,
        should_create_offer: bool,
    },

    /// A channel-mate went away
    RemovePeer { peer_id: PeerId },

    /// Forwarded description; `peer_id` names the sender
    SessionDescription {
        peer_id: PeerId,
        description: SessionDescription,
    },

    /// Forwarded candidate; `peer_id` names the sender
    IceCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },

    /// Liveness probe
    Ping,
}

impl ServerMessage {
    /// The relay-side rewrite of a peer-targeted client message: same payload,
    /// `peer_id` replaced by the sender. `None` for messages that are not
    /// routed to another peer.
    pub fn forwarded(from: PeerId, msg: ClientMessage) -> Option<(PeerId, ServerMessage)> {
        match msg {
            ClientMessage::SessionDescription {
                peer_id,
                description,
            } => Some((
                peer_id,
                ServerMessage::SessionDescription {
                    peer_id: from,
                    description,
                },
            )),
            ClientMessage::IceCandidate { peer_id, candidate } => Some((
                peer_id,
                ServerMessage::IceCandidate {
                    peer_id: from,
                    candidate,
                },
            )),
            ClientMessage::JoinChannel { .. }
            | ClientMessage::LeaveChannel { .. }
            | ClientMessage::Pong => None,
        }
    }
}

pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
