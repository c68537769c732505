use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::protocol::{ClientMessage, PeerId, ServerMessage};

use super::events::PeerEvent;
use super::link::PeerLink;
use super::rtc::{RtcConnector, RtcEvent, RtcEventKind, RtcEventSink};
use super::transport::TransportEvent;

/// Where a link's side effects go: protocol messages to the relay, events to
/// the UI/media layer.
pub(crate) struct Outputs {
    transport: mpsc::UnboundedSender<ClientMessage>,
    events: async_channel::Sender<PeerEvent>,
}

impl Outputs {
    pub fn send(&self, msg: ClientMessage) {
        if self.transport.send(msg).is_err() {
            debug!("Transport closed, message dropped");
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        // nobody listening is fine, a stalled listener loses events
        if let Err(async_channel::TrySendError::Full(event)) = self.events.try_send(event) {
            warn!("Event queue full, dropping {:?}", event);
        }
    }
}

/// Local requests to a running controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    JoinChannel(String),
    LeaveChannel(String),
    /// Local media changed; renegotiate every link
    LocalMediaReady,
    Shutdown,
}

/// Handle to a controller running in its own task
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerCommand>,
}

impl ControllerHandle {
    pub fn join_channel(&self, channel: impl Into<String>) {
        let _ = self.tx.send(ControllerCommand::JoinChannel(channel.into()));
    }

    pub fn leave_channel(&self, channel: impl Into<String>) {
        let _ = self.tx.send(ControllerCommand::LeaveChannel(channel.into()));
    }

    pub fn local_media_ready(&self) {
        let _ = self.tx.send(ControllerCommand::LocalMediaReady);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ControllerCommand::Shutdown);
    }
}

/// Owns every `PeerLink` of one signaling session
pub struct PeerController {
    connector: Arc<dyn RtcConnector>,
    config: ClientConfig,
    self_id: Option<PeerId>,
    links: HashMap<PeerId, PeerLink>,
    next_generation: u64,
    out: Outputs,
    rtc_tx: mpsc::UnboundedSender<RtcEvent>,
    rtc_rx: mpsc::UnboundedReceiver<RtcEvent>,
}

impl PeerController {
    /// Build a controller writing to `transport`. The returned receiver
    /// yields `PeerEvent`s and may be cloned for several consumers; it holds
    /// at most `config.event_queue_capacity` unread events.
    pub fn new(
        connector: Arc<dyn RtcConnector>,
        config: ClientConfig,
        transport: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, async_channel::Receiver<PeerEvent>) {
        let (events_tx, events_rx) = async_channel::bounded(config.event_queue_capacity.max(1));
        let (rtc_tx, rtc_rx) = mpsc::unbounded_channel();

        let controller = Self {
            connector,
            config,
            self_id: None,
            links: HashMap::new(),
            next_generation: 0,
            out: Outputs {
                transport,
                events: events_tx,
            },
            rtc_tx,
            rtc_rx,
        };
        (controller, events_rx)
    }

    pub fn self_id(&self) -> Option<PeerId> {
        self.self_id
    }

    pub fn link(&self, peer_id: &PeerId) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.links.keys().copied().collect()
    }

    /// Spawn the controller loop. Returns the command handle and the join
    /// handle of the task.
    pub fn spawn(
        self,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (ControllerHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(inbound, rx));
        (ControllerHandle { tx }, task)
    }

    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<ControllerCommand>,
    ) {
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(TransportEvent::Message(msg)) => self.handle_server_message(msg).await,
                    Some(TransportEvent::Closed) | None => {
                        self.handle_transport_closed().await;
                        break;
                    }
                },

                Some(event) = self.rtc_rx.recv() => self.handle_rtc_event(event).await,

                cmd = commands.recv() => match cmd {
                    Some(ControllerCommand::JoinChannel(channel)) => {
                        self.out.send(ClientMessage::JoinChannel { channel });
                    }
                    Some(ControllerCommand::LeaveChannel(channel)) => {
                        self.out.send(ClientMessage::LeaveChannel { channel });
                    }
                    Some(ControllerCommand::LocalMediaReady) => self.local_media_ready().await,
                    Some(ControllerCommand::Shutdown) | None => {
                        self.handle_transport_closed().await;
                        break;
                    }
                },
            }
        }
        debug!("Peer controller stopped");
    }

    pub async fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Connected { self_id, peers } => {
                info!("Assigned id {} ({} peers online)", self_id, peers.len());
                self.self_id = Some(self_id);
                self.out.emit(PeerEvent::Connected { self_id, peers });
            }

            ServerMessage::AddPeer {
                peer_id,
                should_create_offer,
            } => self.add_peer(peer_id, should_create_offer).await,

            ServerMessage::RemovePeer { peer_id } => self.remove_peer(peer_id).await,

            ServerMessage::SessionDescription {
                peer_id,
                description,
            } => match self.links.get_mut(&peer_id) {
                Some(link) => link.apply_remote_description(description, &self.out).await,
                None => debug!("Dropping description from unknown peer {}", peer_id),
            },

            ServerMessage::IceCandidate { peer_id, candidate } => {
                match self.links.get_mut(&peer_id) {
                    Some(link) => link.add_ice_candidate(candidate, &self.out).await,
                    None => debug!("Dropping ICE candidate from unknown peer {}", peer_id),
                }
            }

            ServerMessage::Ping => self.out.send(ClientMessage::Pong),
        }
    }

    async fn add_peer(&mut self, peer_id: PeerId, should_create_offer: bool) {
        if self.links.contains_key(&peer_id) {
            warn!("Already connected to peer {}", peer_id);
            return;
        }
        if self.self_id == Some(peer_id) {
            warn!("Relay introduced us to ourselves");
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = RtcEventSink::new(peer_id, generation, self.rtc_tx.clone());
        let connection = match self
            .connector
            .connect(peer_id, &self.config.ice_servers, sink)
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to create RTC connection for {}: {}", peer_id, e);
                return;
            }
        };

        info!("Added peer {}", peer_id);
        self.out.emit(PeerEvent::PeerAdded {
            peer_id,
            connection: connection.clone(),
            should_create_offer,
        });

        let link = self
            .links
            .entry(peer_id)
            .or_insert_with(|| PeerLink::new(peer_id, connection, should_create_offer, generation));
        if should_create_offer {
            link.negotiate(&self.out).await;
        }
    }

    async fn remove_peer(&mut self, peer_id: PeerId) {
        let Some(mut link) = self.links.remove(&peer_id) else {
            debug!("Remove for unknown peer {}", peer_id);
            return;
        };
        link.close().await;
        self.out.emit(PeerEvent::PeerRemoved {
            peer_id,
            connection: link.connection(),
        });
    }

    /// Apply a media-layer signal unless its link has gone away since.
    pub async fn handle_rtc_event(&mut self, event: RtcEvent) {
        let Some(link) = self
            .links
            .get_mut(&event.peer_id)
            .filter(|link| link.generation() == event.generation)
        else {
            trace!("Dropping late RTC event for {}", event.peer_id);
            return;
        };

        match event.kind {
            RtcEventKind::IceCandidateGathered(candidate) => {
                self.out.send(ClientMessage::IceCandidate {
                    peer_id: event.peer_id,
                    candidate,
                });
            }
            RtcEventKind::NegotiationNeeded => link.negotiate(&self.out).await,
        }
    }

    pub async fn local_media_ready(&mut self) {
        for link in self.links.values_mut() {
            link.negotiate(&self.out).await;
        }
    }

    /// Tear everything down after the signaling socket went away.
    pub async fn handle_transport_closed(&mut self) {
        for (peer_id, mut link) in self.links.drain() {
            link.close().await;
            self.out.emit(PeerEvent::PeerRemoved {
                peer_id,
                connection: link.connection(),
            });
        }
        self.self_id = None;
        self.out.emit(PeerEvent::Disconnected);
    }

    #[cfg(test)]
    pub(crate) async fn process_pending_rtc_events(&mut self) {
        while let Ok(event) = self.rtc_rx.try_recv() {
            self.handle_rtc_event(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NegotiationState;
    use crate::client::rtc::mock::MockConnector;
    use crate::protocol::{IceCandidate, SdpType, SessionDescription};

    fn peer(id: &str) -> PeerId {
        id.parse().unwrap()
    }

    fn swap<T>((x, y): (T, T)) -> (T, T) {
        (y, x)
    }

    struct Harness {
        id: PeerId,
        controller: PeerController,
        connector: Arc<MockConnector>,
        sent: mpsc::UnboundedReceiver<ClientMessage>,
        events: async_channel::Receiver<PeerEvent>,
    }

    impl Harness {
        async fn new(id: &str) -> Self {
            let connector = MockConnector::new(id);
            let (tx, sent) = mpsc::unbounded_channel();
            let (mut controller, events) =
                PeerController::new(connector.clone(), ClientConfig::default(), tx);
            let id = peer(id);
            controller
                .handle_server_message(ServerMessage::Connected {
                    self_id: id,
                    peers: vec![],
                })
                .await;
            Self {
                id,
                controller,
                connector,
                sent,
                events,
            }
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            std::iter::from_fn(|| self.sent.try_recv().ok()).collect()
        }

        fn events(&self) -> Vec<PeerEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        async fn add_peer(&mut self, peer: PeerId, should_create_offer: bool) {
            self.controller
                .handle_server_message(ServerMessage::AddPeer {
                    peer_id: peer,
                    should_create_offer,
                })
                .await;
        }

        async fn deliver(&mut self, from: PeerId, msg: ClientMessage) {
            let (target, out) = ServerMessage::forwarded(from, msg).unwrap();
            assert_eq!(target, self.id);
            self.controller.handle_server_message(out).await;
        }

        fn state(&self, peer: PeerId) -> NegotiationState {
            self.controller.link(&peer).unwrap().state()
        }
    }

    /// Relay messages both ways until neither side has anything left to say.
    /// Each round drains both outboxes before delivering, so messages cross
    /// in flight like they do on a real network.
    async fn pump(a: &mut Harness, b: &mut Harness) {
        loop {
            let from_a = a.sent();
            let from_b = b.sent();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for msg in from_a {
                b.deliver(a.id, msg).await;
            }
            for msg in from_b {
                a.deliver(b.id, msg).await;
            }
        }
    }

    async fn linked_pair() -> (Harness, Harness) {
        let mut a = Harness::new("a1").await;
        let mut b = Harness::new("b1").await;
        a.add_peer(b.id, true).await;
        b.add_peer(a.id, false).await;
        pump(&mut a, &mut b).await;
        (a, b)
    }

    fn offers(msgs: &[ClientMessage]) -> Vec<&SessionDescription> {
        msgs.iter()
            .filter_map(|m| match m {
                ClientMessage::SessionDescription { description, .. } => Some(description),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn initiator_sends_offer_on_add_peer() {
        let mut a = Harness::new("a1").await;
        let b = peer("b1");
        a.add_peer(b, true).await;

        assert_eq!(a.state(b), NegotiationState::HaveLocalOffer);
        let sent = a.sent();
        assert_eq!(sent, vec![ClientMessage::SessionDescription {
            peer_id: b,
            description: SessionDescription::offer("a1>b1-offer-1"),
        }]);
    }

    #[tokio::test]
    async fn non_initiator_waits_for_offer() {
        let mut b = Harness::new("b1").await;
        let a = peer("a1");
        b.add_peer(a, false).await;

        assert_eq!(b.state(a), NegotiationState::Stable);
        assert!(b.sent().is_empty());
        assert!(matches!(
            b.events().last(),
            Some(PeerEvent::PeerAdded { should_create_offer: false, .. })
        ));
    }

    #[tokio::test]
    async fn offer_answer_reaches_stable_on_both_sides() {
        let (a, b) = linked_pair().await;

        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(b.state(a.id), NegotiationState::Stable);

        let a_link = a.controller.link(&b.id).unwrap();
        let b_link = b.controller.link(&a.id).unwrap();
        assert_eq!(a_link.local_description(), b_link.remote_description());
        assert_eq!(a_link.remote_description(), b_link.local_description());
        assert!(a_link.is_initiator());
        assert!(!b_link.is_initiator());
    }

    #[tokio::test]
    async fn duplicate_add_peer_keeps_existing_link() {
        let mut a = Harness::new("a1").await;
        let b = peer("b1");
        a.add_peer(b, true).await;
        a.sent();
        a.add_peer(b, true).await;

        assert!(a.sent().is_empty());
        assert_eq!(a.state(b), NegotiationState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn add_peer_for_self_is_ignored() {
        let mut a = Harness::new("a1").await;
        a.add_peer(a.id, true).await;
        assert!(a.controller.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_connect_creates_no_link() {
        let mut a = Harness::new("a1").await;
        a.connector.fail_connect();
        a.add_peer(peer("b1"), true).await;
        assert!(a.controller.peer_ids().is_empty());
        assert!(a.sent().is_empty());
    }

    #[tokio::test]
    async fn ice_candidates_apply_in_any_state() {
        let mut a = Harness::new("a1").await;
        let b = peer("b1");
        a.add_peer(b, false).await;

        let candidate = IceCandidate::new("candidate:1", Some(0));
        a.deliver(b, ClientMessage::IceCandidate {
            peer_id: a.id,
            candidate: candidate.clone(),
        })
        .await;

        assert_eq!(a.connector.connection(b).candidates(), vec![candidate]);
        assert!(
            a.events()
                .iter()
                .any(|e| matches!(e, PeerEvent::IceCandidateSet { .. }))
        );
    }

    #[tokio::test]
    async fn messages_from_unknown_peers_are_dropped() {
        let mut a = Harness::new("a1").await;
        let ghost = peer("ghost");
        a.deliver(ghost, ClientMessage::SessionDescription {
            peer_id: a.id,
            description: SessionDescription::offer("X"),
        })
        .await;
        a.deliver(ghost, ClientMessage::IceCandidate {
            peer_id: a.id,
            candidate: IceCandidate::new("c", None),
        })
        .await;

        assert!(a.sent().is_empty());
        assert!(a.controller.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn gathered_candidates_are_sent_to_the_peer() {
        let mut a = Harness::new("a1").await;
        let b = peer("b1");
        a.add_peer(b, false).await;

        let candidate = IceCandidate::new("candidate:2", Some(1));
        a.connector.sink(b).ice_candidate_gathered(candidate.clone());
        a.controller.process_pending_rtc_events().await;

        assert_eq!(a.sent(), vec![ClientMessage::IceCandidate {
            peer_id: b,
            candidate
        }]);
    }

    #[tokio::test]
    async fn renegotiation_while_offering_is_deferred() {
        let mut a = Harness::new("a1").await;
        let mut b = Harness::new("b1").await;
        a.add_peer(b.id, true).await;
        b.add_peer(a.id, false).await;
        let first = a.sent();
        assert_eq!(offers(&first).len(), 1);

        // first offer still unanswered
        a.connector.sink(b.id).negotiation_needed();
        a.controller.process_pending_rtc_events().await;
        assert!(a.sent().is_empty());

        for msg in first {
            b.deliver(a.id, msg).await;
        }
        for msg in b.sent() {
            a.deliver(b.id, msg).await;
        }

        // the deferred offer goes out once the first exchange is done
        let sent = a.sent();
        assert_eq!(offers(&sent).len(), 1);
        assert_eq!(offers(&sent)[0].sdp, "a1>b1-offer-2");
        assert_eq!(a.state(b.id), NegotiationState::HaveLocalOffer);

        for msg in sent {
            b.deliver(a.id, msg).await;
        }
        pump(&mut a, &mut b).await;
        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(b.state(a.id), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn local_media_ready_renegotiates_every_link() {
        let (mut a, mut b) = linked_pair().await;
        a.controller.local_media_ready().await;
        assert_eq!(a.state(b.id), NegotiationState::HaveLocalOffer);
        pump(&mut a, &mut b).await;
        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(
            a.controller.link(&b.id).unwrap().local_description(),
            b.controller.link(&a.id).unwrap().remote_description()
        );
    }

    #[tokio::test]
    async fn failed_answer_rejects_the_offer() {
        let mut a = Harness::new("a1").await;
        let mut b = Harness::new("b1").await;
        a.add_peer(b.id, true).await;
        b.add_peer(a.id, false).await;
        b.connector.connection(a.id).fail_next("create_answer");

        for msg in a.sent() {
            b.deliver(a.id, msg).await;
        }
        assert_eq!(b.state(a.id), NegotiationState::Stable);
        let rejection = b.sent();
        assert_eq!(rejection, vec![ClientMessage::SessionDescription {
            peer_id: a.id,
            description: SessionDescription::rollback(),
        }]);

        for msg in rejection {
            a.deliver(b.id, msg).await;
        }
        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(a.connector.connection(b.id).rollbacks(), 1);

        // the next trigger retries from scratch
        a.controller.local_media_ready().await;
        pump(&mut a, &mut b).await;
        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(b.state(a.id), NegotiationState::Stable);
        assert_eq!(
            a.connector.connection(b.id).current_pair(),
            swap(b.connector.connection(a.id).current_pair())
        );
    }

    #[tokio::test]
    async fn failed_offer_stays_stable() {
        let mut a = Harness::new("a1").await;
        let b = peer("b1");
        a.add_peer(b, false).await;
        a.connector.connection(b).fail_next("create_offer");

        a.controller.local_media_ready().await;
        assert_eq!(a.state(b), NegotiationState::Stable);
        assert!(a.sent().is_empty());
    }

    #[tokio::test]
    async fn stray_answer_in_stable_is_ignored() {
        let (mut a, b) = linked_pair().await;
        a.deliver(b.id, ClientMessage::SessionDescription {
            peer_id: a.id,
            description: SessionDescription::answer("bogus"),
        })
        .await;
        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_ne!(
            a.controller.link(&b.id).unwrap().remote_description(),
            Some(&SessionDescription::answer("bogus"))
        );
    }

    #[tokio::test]
    async fn remote_rollback_returns_to_stable() {
        let mut b = Harness::new("b1").await;
        let a = peer("a1");
        b.add_peer(a, false).await;
        let conn = b.connector.connection(a);
        conn.fail_next("create_answer");
        conn.fail_next("remote_rollback");
        b.deliver(a, ClientMessage::SessionDescription {
            peer_id: b.id,
            description: SessionDescription::offer("a1>b1-offer-1"),
        })
        .await;
        assert_eq!(b.state(a), NegotiationState::HaveRemoteOffer);
        b.sent();

        b.deliver(a, ClientMessage::SessionDescription {
            peer_id: b.id,
            description: SessionDescription::rollback(),
        })
        .await;
        assert_eq!(b.state(a), NegotiationState::Stable);
        assert_eq!(conn.rollbacks(), 1);
    }

    #[tokio::test]
    async fn glare_converges_on_one_description_pair() {
        let (mut a, mut b) = linked_pair().await;

        // both sides offer before seeing the other's offer
        a.connector.sink(b.id).negotiation_needed();
        b.connector.sink(a.id).negotiation_needed();
        a.controller.process_pending_rtc_events().await;
        b.controller.process_pending_rtc_events().await;
        assert_eq!(a.state(b.id), NegotiationState::HaveLocalOffer);
        assert_eq!(b.state(a.id), NegotiationState::HaveLocalOffer);

        pump(&mut a, &mut b).await;

        let a_conn = a.connector.connection(b.id);
        let b_conn = b.connector.connection(a.id);
        assert_eq!(a_conn.rollbacks(), 1);
        assert_eq!(b_conn.rollbacks(), 1);

        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(b.state(a.id), NegotiationState::Stable);
        assert_eq!(a_conn.state(), NegotiationState::Stable);
        assert_eq!(b_conn.state(), NegotiationState::Stable);

        let (a_local, a_remote) = a_conn.current_pair();
        let (b_local, b_remote) = b_conn.current_pair();
        assert_eq!(a_local, b_remote);
        assert_eq!(a_remote, b_local);

        let a_link = a.controller.link(&b.id).unwrap();
        assert_eq!(a_link.local_description(), a_local.as_ref());
        assert_eq!(a_link.remote_description(), a_remote.as_ref());
    }

    async fn glare(a: &mut Harness, b: &mut Harness) {
        a.connector.sink(b.id).negotiation_needed();
        b.connector.sink(a.id).negotiation_needed();
        a.controller.process_pending_rtc_events().await;
        b.controller.process_pending_rtc_events().await;
    }

    fn assert_converged(a: &Harness, b: &Harness) {
        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(b.state(a.id), NegotiationState::Stable);
        assert_eq!(
            a.connector.connection(b.id).current_pair(),
            swap(b.connector.connection(a.id).current_pair())
        );
    }

    #[tokio::test]
    async fn glare_with_failed_answer_still_converges() {
        let (mut a, mut b) = linked_pair().await;
        glare(&mut a, &mut b).await;
        b.connector.connection(a.id).fail_next("create_answer");

        pump(&mut a, &mut b).await;
        assert_converged(&a, &b);

        // neither side is left deferring its triggers
        for _ in 0..3 {
            a.controller.local_media_ready().await;
            assert_eq!(a.state(b.id), NegotiationState::HaveLocalOffer);
            pump(&mut a, &mut b).await;
            assert_converged(&a, &b);

            b.controller.local_media_ready().await;
            assert_eq!(b.state(a.id), NegotiationState::HaveLocalOffer);
            pump(&mut a, &mut b).await;
            assert_converged(&a, &b);
        }
    }

    #[tokio::test]
    async fn failed_follow_up_offer_does_not_block_the_other_side() {
        let (mut a, mut b) = linked_pair().await;
        glare(&mut a, &mut b).await;
        // the initiator's re-offer after glare fails
        a.connector.connection(b.id).fail_next("create_offer");
        pump(&mut a, &mut b).await;
        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(b.state(a.id), NegotiationState::Stable);

        b.connector.sink(a.id).negotiation_needed();
        b.controller.process_pending_rtc_events().await;
        assert_eq!(b.state(a.id), NegotiationState::HaveLocalOffer);

        pump(&mut a, &mut b).await;
        assert_converged(&a, &b);
    }

    #[tokio::test]
    async fn deferred_renegotiation_survives_glare() {
        let (mut a, mut b) = linked_pair().await;

        a.controller.local_media_ready().await;
        b.controller.local_media_ready().await;
        // a second trigger on the non-initiator while its offer is in flight
        b.connector.sink(a.id).negotiation_needed();
        b.controller.process_pending_rtc_events().await;

        pump(&mut a, &mut b).await;

        assert_eq!(a.state(b.id), NegotiationState::Stable);
        assert_eq!(b.state(a.id), NegotiationState::Stable);
        let (a_local, a_remote) = a.connector.connection(b.id).current_pair();
        let (b_local, b_remote) = b.connector.connection(a.id).current_pair();
        assert_eq!(a_local, b_remote);
        assert_eq!(a_remote, b_local);
        // the deferred offer from b was the last exchange
        assert_eq!(b_local.map(|d| d.kind), Some(SdpType::Offer));
    }

    #[tokio::test]
    async fn remove_peer_closes_link_and_ignores_late_events() {
        let (mut a, b) = linked_pair().await;
        let old_sink = a.connector.sink(b.id);
        let old_conn = a.connector.connection(b.id);

        a.controller
            .handle_server_message(ServerMessage::RemovePeer { peer_id: b.id })
            .await;
        assert!(old_conn.is_closed());
        assert!(a.controller.link(&b.id).is_none());
        assert!(
            a.events()
                .iter()
                .any(|e| matches!(e, PeerEvent::PeerRemoved { peer_id, .. } if *peer_id == b.id))
        );

        // the peer comes back; events from the old session must not leak in
        a.add_peer(b.id, false).await;
        old_sink.negotiation_needed();
        old_sink.ice_candidate_gathered(IceCandidate::new("stale", Some(0)));
        a.controller.process_pending_rtc_events().await;

        assert!(a.sent().is_empty());
        assert_eq!(a.state(b.id), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn per_peer_events_carry_the_connection() {
        let (mut a, b) = linked_pair().await;
        a.controller
            .handle_server_message(ServerMessage::RemovePeer { peer_id: b.id })
            .await;

        let conn = a.connector.connection(b.id);
        let events = a.events();
        let per_peer: Vec<&PeerEvent> = events.iter().filter(|e| e.peer_id().is_some()).collect();
        // added, offer set, answer set, removed
        assert_eq!(per_peer.len(), 4);
        for event in per_peer {
            let carried = event.connection().unwrap();
            assert_eq!(
                Arc::as_ptr(carried) as *const (),
                Arc::as_ptr(&conn) as *const ()
            );
        }
    }

    #[tokio::test]
    async fn unread_events_are_capped() {
        let connector = MockConnector::new("a1");
        let (tx, mut sent) = mpsc::unbounded_channel();
        let config = ClientConfig {
            event_queue_capacity: 2,
            ..ClientConfig::default()
        };
        let (mut controller, events) = PeerController::new(connector, config, tx);

        for id in ["b1", "c1", "d1"] {
            controller
                .handle_server_message(ServerMessage::AddPeer {
                    peer_id: peer(id),
                    should_create_offer: true,
                })
                .await;
        }

        assert_eq!(events.len(), 2);
        // negotiation is unaffected by the stalled listener
        let offers = std::iter::from_fn(|| sent.try_recv().ok()).count();
        assert_eq!(offers, 3);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let mut a = Harness::new("a1").await;
        a.controller.handle_server_message(ServerMessage::Ping).await;
        assert_eq!(a.sent(), vec![ClientMessage::Pong]);
    }

    #[tokio::test]
    async fn transport_close_tears_down_every_link() {
        let mut a = Harness::new("a1").await;
        let peers = [peer("b1"), peer("c1")];
        for peer in peers {
            a.add_peer(peer, true).await;
        }
        a.events();

        a.controller.handle_transport_closed().await;

        for peer in peers {
            assert!(a.connector.connection(peer).is_closed());
        }
        assert!(a.controller.peer_ids().is_empty());
        assert_eq!(a.controller.self_id(), None);
        let events = a.events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, PeerEvent::PeerRemoved { .. }))
                .count(),
            2
        );
        assert!(matches!(events.last(), Some(PeerEvent::Disconnected)));
    }

    #[tokio::test]
    async fn run_loop_handles_commands_and_close() {
        let connector = MockConnector::new("a1");
        let (tx, mut sent) = mpsc::unbounded_channel();
        let (controller, events) =
            PeerController::new(connector.clone(), ClientConfig::default(), tx);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (handle, task) = controller.spawn(in_rx);

        handle.join_channel("room");
        assert_eq!(sent.recv().await, Some(ClientMessage::JoinChannel {
            channel: "room".to_string()
        }));

        in_tx
            .send(TransportEvent::Message(ServerMessage::AddPeer {
                peer_id: peer("b1"),
                should_create_offer: true,
            }))
            .unwrap();
        assert!(matches!(
            sent.recv().await,
            Some(ClientMessage::SessionDescription { .. })
        ));

        in_tx.send(TransportEvent::Closed).unwrap();
        task.await.unwrap();
        assert!(connector.connection(peer("b1")).is_closed());

        let all: Vec<PeerEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(matches!(all.last(), Some(PeerEvent::Disconnected)));
    }
}
