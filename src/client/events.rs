use std::fmt;
use std::sync::Arc;

use crate::protocol::{IceCandidate, PeerId, SessionDescription};

use super::rtc::RtcConnection;

/// Notifications for the UI/media layer. Every per-peer event carries the
/// link's RTC connection so the media layer can attach or detach tracks on
/// it; it never drives negotiation.
#[derive(Clone)]
pub enum PeerEvent {
    Connected {
        self_id: PeerId,
        peers: Vec<PeerId>,
    },
    PeerAdded {
        peer_id: PeerId,
        connection: Arc<dyn RtcConnection>,
        should_create_offer: bool,
    },
    PeerRemoved {
        peer_id: PeerId,
        connection: Arc<dyn RtcConnection>,
    },
    LocalDescriptionSet {
        peer_id: PeerId,
        connection: Arc<dyn RtcConnection>,
        description: SessionDescription,
    },
    RemoteDescriptionSet {
        peer_id: PeerId,
        connection: Arc<dyn RtcConnection>,
        description: SessionDescription,
    },
    IceCandidateSet {
        peer_id: PeerId,
        connection: Arc<dyn RtcConnection>,
        candidate: IceCandidate,
    },
    Disconnected,
}

impl PeerEvent {
    /// The remote peer this event concerns, if any
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            PeerEvent::PeerAdded { peer_id, .. }
            | PeerEvent::PeerRemoved { peer_id, .. }
            | PeerEvent::LocalDescriptionSet { peer_id, .. }
            | PeerEvent::RemoteDescriptionSet { peer_id, .. }
            | PeerEvent::IceCandidateSet { peer_id, .. } => Some(*peer_id),
            PeerEvent::Connected { .. } | PeerEvent::Disconnected => None,
        }
    }

    /// The RTC connection of the link this event concerns
    pub fn connection(&self) -> Option<&Arc<dyn RtcConnection>> {
        match self {
            PeerEvent::PeerAdded { connection, .. }
            | PeerEvent::PeerRemoved { connection, .. }
            | PeerEvent::LocalDescriptionSet { connection, .. }
            | PeerEvent::RemoteDescriptionSet { connection, .. }
            | PeerEvent::IceCandidateSet { connection, .. } => Some(connection),
            PeerEvent::Connected { .. } | PeerEvent::Disconnected => None,
        }
    }
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Connected { self_id, peers } => f
                .debug_struct("Connected")
                .field("self_id", self_id)
                .field("peers", peers)
                .finish(),
            PeerEvent::PeerAdded {
                peer_id,
                should_create_offer,
                ..
            } => f
                .debug_struct("PeerAdded")
                .field("peer_id", peer_id)
                .field("should_create_offer", should_create_offer)
                .finish_non_exhaustive(),
            PeerEvent::PeerRemoved { peer_id, .. } => f
                .debug_struct("PeerRemoved")
                .field("peer_id", peer_id)
                .finish_non_exhaustive(),
            PeerEvent::LocalDescriptionSet {
                peer_id,
                description,
                ..
            } => f
                .debug_struct("LocalDescriptionSet")
                .field("peer_id", peer_id)
                .field("description", description)
                .finish_non_exhaustive(),
            PeerEvent::RemoteDescriptionSet {
                peer_id,
                description,
                ..
            } => f
                .debug_struct("RemoteDescriptionSet")
                .field("peer_id", peer_id)
                .field("description", description)
                .finish_non_exhaustive(),
            PeerEvent::IceCandidateSet {
                peer_id, candidate, ..
            } => f
                .debug_struct("IceCandidateSet")
                .field("peer_id", peer_id)
                .field("candidate", candidate)
                .finish_non_exhaustive(),
            PeerEvent::Disconnected => f.write_str("Disconnected"),
        }
    }
}
