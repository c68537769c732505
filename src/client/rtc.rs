//! Seam between the negotiation controller and the media stack that owns the
//! actual RTC session objects.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error("connection closed")]
    Closed,
}

/// One RTC session with a single remote peer.
///
/// Methods take `&self`; implementations keep their own interior state.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), RtcError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    async fn close(&self);
}

/// Factory for RTC sessions, one per introduced peer.
pub trait RtcConnector: Send + Sync {
    fn connect(
        &self,
        peer_id: PeerId,
        ice_servers: &[IceServer],
        events: RtcEventSink,
    ) -> Result<Arc<dyn RtcConnection>, RtcError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RtcEventKind {
    IceCandidateGathered(IceCandidate),
    NegotiationNeeded,
}

/// Media-layer signal tagged with the link it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcEvent {
    pub(crate) peer_id: PeerId,
    pub(crate) generation: u64,
    pub(crate) kind: RtcEventKind,
}

/// Handed to each RTC session so it can report gathered candidates and
/// renegotiation needs. Events from a removed or replaced link are discarded
/// by the controller.
#[derive(Debug, Clone)]
pub struct RtcEventSink {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<RtcEvent>,
}

impl RtcEventSink {
    pub(crate) fn new(
        peer_id: PeerId,
        generation: u64,
        tx: mpsc::UnboundedSender<RtcEvent>,
    ) -> Self {
        Self {
            peer_id,
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn ice_candidate_gathered(&self, candidate: IceCandidate) {
        self.emit(RtcEventKind::IceCandidateGathered(candidate));
    }

    pub fn negotiation_needed(&self) {
        self.emit(RtcEventKind::NegotiationNeeded);
    }

    fn emit(&self, kind: RtcEventKind) {
        let _ = self.tx.send(RtcEvent {
            peer_id: self.peer_id,
            generation: self.generation,
            kind,
        });
    }
}
