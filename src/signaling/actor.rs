use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::protocol::{ClientMessage, PeerId, ServerMessage};

use super::types::{Channel, ChannelName, Connection, OutboundMessage, SignalingError};

/// Commands sent to the relay actor
pub(crate) enum RelayCommand {
    Connect {
        tx: mpsc::UnboundedSender<OutboundMessage>,
        reply: oneshot::Sender<Result<PeerId, SignalingError>>,
    },
    Message {
        from: PeerId,
        msg: ClientMessage,
    },
    Disconnect {
        peer_id: PeerId,
    },
    ChannelMembers {
        channel: ChannelName,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// Connection and channel tables. Only the actor task touches this.
pub(crate) struct RelayState {
    connections: HashMap<PeerId, Connection>,
    channels: HashMap<ChannelName, Channel>,
    max_connections: usize,
}

impl RelayState {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            channels: HashMap::new(),
            max_connections,
        }
    }

    pub fn apply(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Connect { tx, reply } => {
                let _ = reply.send(self.connect(tx));
            }
            RelayCommand::Message { from, msg } => self.handle_message(from, msg),
            RelayCommand::Disconnect { peer_id } => self.disconnect(peer_id),
            RelayCommand::ChannelMembers { channel, reply } => {
                let _ = reply.send(self.channel_members(&channel));
            }
        }
    }

    /// Register a connection and greet it with its id and every other id.
    pub fn connect(
        &mut self,
        tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<PeerId, SignalingError> {
        if self.connections.len() >= self.max_connections {
            return Err(SignalingError::ConnectionLimit(self.max_connections));
        }

        let mut peer_id = PeerId::generate();
        while self.connections.contains_key(&peer_id) {
            peer_id = PeerId::generate();
        }

        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        send_to(&tx, &ServerMessage::Connected {
            self_id: peer_id,
            peers,
        });

        self.connections.insert(peer_id, Connection::new(tx));
        info!("Connection {} registered", peer_id);
        Ok(peer_id)
    }

    pub fn handle_message(&mut self, from: PeerId, msg: ClientMessage) {
        if !self.connections.contains_key(&from) {
            debug!("Dropping message from unknown connection {}", from);
            return;
        }

        match msg {
            ClientMessage::JoinChannel { channel } => self.join_channel(from, channel),
            ClientMessage::LeaveChannel { channel } => self.leave_channel(from, &channel),
            ClientMessage::Pong => trace!("Pong from {}", from),
            msg @ (ClientMessage::SessionDescription { .. } | ClientMessage::IceCandidate { .. }) => {
                self.forward(from, msg)
            }
        }
    }

    pub fn join_channel(&mut self, peer_id: PeerId, channel: ChannelName) {
        let Some(conn) = self.connections.get(&peer_id) else {
            return;
        };
        if conn.channels.contains(&channel) {
            warn!("Connection {} is already in channel '{}'", peer_id, channel);
            return;
        }

        let members: Vec<PeerId> = self
            .channels
            .get(&channel)
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default();

        for member in members {
            // pairs already linked through another channel are not introduced twice
            if self.shares_channel(peer_id, member) {
                continue;
            }
            self.send(member, &ServerMessage::AddPeer {
                peer_id,
                should_create_offer: false,
            });
            self.send(peer_id, &ServerMessage::AddPeer {
                peer_id: member,
                should_create_offer: true,
            });
        }

        self.channels
            .entry(channel.clone())
            .or_default()
            .members
            .insert(peer_id);
        if let Some(conn) = self.connections.get_mut(&peer_id) {
            conn.channels.insert(channel.clone());
        }
        info!("Connection {} joined channel '{}'", peer_id, channel);
    }

    pub fn leave_channel(&mut self, peer_id: PeerId, channel: &str) {
        let removed = self
            .connections
            .get_mut(&peer_id)
            .is_some_and(|conn| conn.channels.remove(channel));
        if !removed {
            warn!("Connection {} was not found in channel '{}'", peer_id, channel);
            return;
        }

        let remaining = self.remove_member(peer_id, channel);
        for member in remaining {
            if self.shares_channel(peer_id, member) {
                continue;
            }
            self.send(member, &ServerMessage::RemovePeer { peer_id });
            self.send(peer_id, &ServerMessage::RemovePeer { peer_id: member });
        }
        info!("Connection {} left channel '{}'", peer_id, channel);
    }

    /// Route a description or candidate to its target with the sender's id
    /// substituted. Unknown targets are an expected race and are dropped.
    pub fn forward(&mut self, from: PeerId, msg: ClientMessage) {
        let Some((target, out)) = ServerMessage::forwarded(from, msg) else {
            return;
        };
        if self.connections.contains_key(&target) {
            trace!("Relaying from {} to {}", from, target);
            self.send(target, &out);
        } else {
            trace!("Dropping message from {} to departed {}", from, target);
        }
    }

    pub fn disconnect(&mut self, peer_id: PeerId) {
        let Some(conn) = self.connections.remove(&peer_id) else {
            return;
        };

        let mut former_mates = HashSet::new();
        for channel in &conn.channels {
            former_mates.extend(self.remove_member(peer_id, channel));
        }

        let departed = OutboundMessage::encode(&ServerMessage::RemovePeer { peer_id });
        for mate in former_mates {
            if let (Some(mate_conn), Ok(msg)) = (self.connections.get(&mate), &departed) {
                let _ = mate_conn.tx.send(msg.clone());
            }
            // the departing socket is usually gone already
            send_to(&conn.tx, &ServerMessage::RemovePeer { peer_id: mate });
        }

        info!("Connection {} removed", peer_id);
    }

    pub fn channel_members(&self, channel: &str) -> Vec<PeerId> {
        self.channels
            .get(channel)
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop `peer_id` from a channel's member set and return who is left.
    fn remove_member(&mut self, peer_id: PeerId, channel: &str) -> Vec<PeerId> {
        let Some(ch) = self.channels.get_mut(channel) else {
            return Vec::new();
        };
        ch.members.remove(&peer_id);
        let remaining: Vec<PeerId> = ch.members.iter().copied().collect();

        if ch.members.is_empty() {
            self.channels.remove(channel);
            debug!("Channel '{}' removed (empty)", channel);
        }
        remaining
    }

    fn shares_channel(&self, a: PeerId, b: PeerId) -> bool {
        match (self.connections.get(&a), self.connections.get(&b)) {
            (Some(a), Some(b)) => !a.channels.is_disjoint(&b.channels),
            _ => false,
        }
    }

    fn send(&self, to: PeerId, msg: &ServerMessage) {
        if let Some(conn) = self.connections.get(&to) {
            send_to(&conn.tx, msg);
        }
    }
}

fn send_to(tx: &mpsc::UnboundedSender<OutboundMessage>, msg: &ServerMessage) {
    match OutboundMessage::encode(msg) {
        Ok(out) => {
            let _ = tx.send(out);
        }
        Err(e) => warn!("Failed to encode {:?}: {}", msg, e),
    }
}

pub(crate) async fn relay_actor(mut rx: mpsc::Receiver<RelayCommand>, mut state: RelayState) {
    while let Some(cmd) = rx.recv().await {
        state.apply(cmd);
    }
    debug!("Relay actor stopped");
}

/// Handle to communicate with the relay actor
#[derive(Clone)]
pub struct RelayHandle {
    pub(crate) tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Spawn a relay actor on the current runtime
    pub fn spawn(max_connections: usize) -> Self {
        let (tx, rx) = mpsc::channel::<RelayCommand>(1024);
        tokio::spawn(relay_actor(rx, RelayState::new(max_connections)));
        Self { tx }
    }

    /// Register a new connection. Its `connected` greeting is queued on `tx`
    /// before this returns.
    pub async fn connect(
        &self,
        tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<PeerId, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RelayCommand::Connect {
                tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?
    }

    /// Hand an inbound client message to the relay
    pub async fn dispatch(&self, from: PeerId, msg: ClientMessage) {
        let _ = self.tx.send(RelayCommand::Message { from, msg }).await;
    }

    pub async fn disconnect(&self, peer_id: &PeerId) {
        let _ = self
            .tx
            .send(RelayCommand::Disconnect { peer_id: *peer_id })
            .await;
    }

    pub async fn channel_members(&self, channel: &str) -> Vec<PeerId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = RelayCommand::ChannelMembers {
            channel: channel.to_string(),
            reply: reply_tx,
        };
        if self.tx.send(cmd).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}
