use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::protocol::{ClientMessage, IceCandidate, PeerId, SdpType, SessionDescription};

use super::controller::Outputs;
use super::events::PeerEvent;
use super::rtc::RtcConnection;

/// Offer/answer state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Progress of the clean-up after both sides offered at once.
///
/// Glare is always mutual under ordered delivery: each side rolls back and
/// answers the other's offer, so each side also receives one reply to the
/// offer it abandoned. That reply (an answer, or a `rollback` when the peer
/// could not answer) is consumed without being applied, after which the
/// initiator of the pair issues a fresh offer. Offers the other side deferred
/// during the glare wait for that follow-up; a new local trigger does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlareRecovery {
    None,
    AwaitingStaleAnswer,
    AwaitingFollowUpOffer,
}

/// Client-side state for one remote peer
pub struct PeerLink {
    remote: PeerId,
    connection: Arc<dyn RtcConnection>,
    state: NegotiationState,
    initiator: bool,
    generation: u64,
    renegotiation_pending: bool,
    glare: GlareRecovery,
    pending_local: Option<SessionDescription>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("initiator", &self.initiator)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    pub(crate) fn new(
        remote: PeerId,
        connection: Arc<dyn RtcConnection>,
        initiator: bool,
        generation: u64,
    ) -> Self {
        Self {
            remote,
            connection,
            state: NegotiationState::Stable,
            initiator,
            generation,
            renegotiation_pending: false,
            glare: GlareRecovery::None,
            pending_local: None,
            local_description: None,
            remote_description: None,
        }
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Whether this side was designated to make the first offer
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn connection(&self) -> Arc<dyn RtcConnection> {
        self.connection.clone()
    }

    /// Last completed local description
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Last completed remote description
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn ready_to_offer(&self) -> bool {
        self.state == NegotiationState::Stable && self.glare == GlareRecovery::None
    }

    /// A local renegotiation trigger: offer now, or once the link is ready.
    pub(crate) async fn negotiate(&mut self, out: &Outputs) {
        if self.state == NegotiationState::Stable
            && self.glare == GlareRecovery::AwaitingFollowUpOffer
        {
            // a crossing follow-up offer is ordinary glare
            debug!("Offering to {} without waiting for a follow-up", self.remote);
            self.glare = GlareRecovery::None;
        }
        self.offer(out).await;
    }

    async fn offer(&mut self, out: &Outputs) {
        if !self.ready_to_offer() {
            debug!(
                "Deferring renegotiation with {} ({:?}, {:?})",
                self.remote, self.state, self.glare
            );
            self.renegotiation_pending = true;
            return;
        }
        self.renegotiation_pending = false;

        let offer = match self.connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                error!("Failed to create offer for {}: {}", self.remote, e);
                self.renegotiation_pending = true;
                return;
            }
        };
        if let Err(e) = self.connection.set_local_description(offer.clone()).await {
            error!("Failed to set local offer for {}: {}", self.remote, e);
            self.renegotiation_pending = true;
            return;
        }

        self.state = NegotiationState::HaveLocalOffer;
        self.pending_local = Some(offer.clone());
        info!("Sent offer to {}", self.remote);
        out.emit(PeerEvent::LocalDescriptionSet {
            peer_id: self.remote,
            connection: self.connection.clone(),
            description: offer.clone(),
        });
        out.send(ClientMessage::SessionDescription {
            peer_id: self.remote,
            description: offer,
        });
    }

    pub(crate) async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
        out: &Outputs,
    ) {
        match description.kind {
            SdpType::Offer => self.accept_offer(description, out).await,
            SdpType::Answer => self.accept_answer(description, out).await,
            SdpType::Rollback => self.accept_rollback(out).await,
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription, out: &Outputs) {
        if self.glare == GlareRecovery::AwaitingFollowUpOffer {
            self.glare = GlareRecovery::None;
        }

        if self.state == NegotiationState::HaveLocalOffer {
            info!("Glare with {}, rolling back local offer", self.remote);
            if let Err(e) = self
                .connection
                .set_local_description(SessionDescription::rollback())
                .await
            {
                error!("Failed to roll back offer for {}: {}", self.remote, e);
                self.reject_offer(out);
                return;
            }
            self.state = NegotiationState::Stable;
            self.pending_local = None;
            self.glare = GlareRecovery::AwaitingStaleAnswer;
        }

        if let Err(e) = self.connection.set_remote_description(offer.clone()).await {
            error!("Failed to set remote offer from {}: {}", self.remote, e);
            self.reject_offer(out);
            return;
        }
        self.state = NegotiationState::HaveRemoteOffer;
        out.emit(PeerEvent::RemoteDescriptionSet {
            peer_id: self.remote,
            connection: self.connection.clone(),
            description: offer.clone(),
        });

        let answer = match self.connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Failed to create answer for {}: {}", self.remote, e);
                self.abandon_remote_offer(out).await;
                return;
            }
        };
        if let Err(e) = self.connection.set_local_description(answer.clone()).await {
            error!("Failed to set local answer for {}: {}", self.remote, e);
            self.abandon_remote_offer(out).await;
            return;
        }

        self.state = NegotiationState::Stable;
        self.local_description = Some(answer.clone());
        self.remote_description = Some(offer);
        info!("Sent answer to {}", self.remote);
        out.emit(PeerEvent::LocalDescriptionSet {
            peer_id: self.remote,
            connection: self.connection.clone(),
            description: answer.clone(),
        });
        out.send(ClientMessage::SessionDescription {
            peer_id: self.remote,
            description: answer,
        });

        self.resume(out).await;
    }

    /// Drop a remote offer we could not answer and tell the offerer, so
    /// neither side keeps waiting for an answer that will not come.
    async fn abandon_remote_offer(&mut self, out: &Outputs) {
        match self
            .connection
            .set_remote_description(SessionDescription::rollback())
            .await
        {
            Ok(()) => self.state = NegotiationState::Stable,
            Err(e) => error!("Failed to roll back remote offer from {}: {}", self.remote, e),
        }
        self.reject_offer(out);
    }

    fn reject_offer(&self, out: &Outputs) {
        warn!("Rejecting offer from {}", self.remote);
        out.send(ClientMessage::SessionDescription {
            peer_id: self.remote,
            description: SessionDescription::rollback(),
        });
    }

    async fn accept_answer(&mut self, answer: SessionDescription, out: &Outputs) {
        if self.state == NegotiationState::HaveLocalOffer {
            if let Err(e) = self.connection.set_remote_description(answer.clone()).await {
                error!("Failed to set remote answer from {}: {}", self.remote, e);
                return;
            }
            self.state = NegotiationState::Stable;
            self.local_description = self.pending_local.take();
            self.remote_description = Some(answer.clone());
            info!("Negotiation with {} complete", self.remote);
            out.emit(PeerEvent::RemoteDescriptionSet {
                peer_id: self.remote,
                connection: self.connection.clone(),
                description: answer,
            });
            self.resume(out).await;
            return;
        }

        if self.glare == GlareRecovery::AwaitingStaleAnswer {
            debug!("Discarding answer to rolled-back offer from {}", self.remote);
            self.finish_stale_exchange(out).await;
            return;
        }

        warn!(
            "Ignoring answer from {} in state {:?}",
            self.remote, self.state
        );
    }

    /// A remote `rollback` either withdraws the peer's pending offer or
    /// rejects ours.
    async fn accept_rollback(&mut self, out: &Outputs) {
        match self.state {
            NegotiationState::HaveRemoteOffer => {
                if let Err(e) = self
                    .connection
                    .set_remote_description(SessionDescription::rollback())
                    .await
                {
                    error!("Failed to roll back remote offer from {}: {}", self.remote, e);
                    return;
                }
                self.state = NegotiationState::Stable;
                self.resume(out).await;
            }
            NegotiationState::HaveLocalOffer => {
                if let Err(e) = self
                    .connection
                    .set_local_description(SessionDescription::rollback())
                    .await
                {
                    error!("Failed to roll back offer for {}: {}", self.remote, e);
                    return;
                }
                info!("Offer rejected by {}", self.remote);
                self.state = NegotiationState::Stable;
                self.pending_local = None;
                // retried on the next trigger, not here
                self.renegotiation_pending = false;
            }
            NegotiationState::Stable if self.glare == GlareRecovery::AwaitingStaleAnswer => {
                debug!("Rolled-back offer to {} was rejected", self.remote);
                self.finish_stale_exchange(out).await;
            }
            state => debug!("Ignoring rollback from {} in state {:?}", self.remote, state),
        }
    }

    async fn finish_stale_exchange(&mut self, out: &Outputs) {
        if self.initiator {
            self.glare = GlareRecovery::None;
            self.renegotiation_pending = true;
        } else {
            self.glare = GlareRecovery::AwaitingFollowUpOffer;
        }
        self.resume(out).await;
    }

    pub(crate) async fn add_ice_candidate(&mut self, candidate: IceCandidate, out: &Outputs) {
        if let Err(e) = self.connection.add_ice_candidate(candidate.clone()).await {
            error!("Failed to add ICE candidate from {}: {}", self.remote, e);
            return;
        }
        out.emit(PeerEvent::IceCandidateSet {
            peer_id: self.remote,
            connection: self.connection.clone(),
            candidate,
        });
    }

    /// Terminal: close the RTC session whatever is in flight.
    pub(crate) async fn close(&mut self) {
        self.connection.close().await;
        self.state = NegotiationState::Closed;
        self.renegotiation_pending = false;
        info!("Connection to {} closed", self.remote);
    }

    async fn resume(&mut self, out: &Outputs) {
        if self.renegotiation_pending && self.ready_to_offer() {
            self.offer(out).await;
        }
    }
}
