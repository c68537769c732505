//! Client side of the mesh: one negotiation state machine per remote peer,
//! driven by messages from the relay and signals from the media layer.

mod controller;
mod events;
mod link;
mod rtc;
mod transport;

use std::sync::Arc;

pub use controller::{ControllerCommand, ControllerHandle, PeerController};
pub use events::PeerEvent;
pub use link::{NegotiationState, PeerLink};
pub use rtc::{RtcConnection, RtcConnector, RtcError, RtcEvent, RtcEventSink};
pub use transport::{TransportError, TransportEvent, connect as connect_transport};

use crate::config::ClientConfig;

/// Connect to a relay and start a controller for the session.
pub async fn connect(
    url: &str,
    connector: Arc<dyn RtcConnector>,
    config: ClientConfig,
) -> Result<
    (
        ControllerHandle,
        async_channel::Receiver<PeerEvent>,
        tokio::task::JoinHandle<()>,
    ),
    TransportError,
> {
    let (outbound, inbound) = transport::connect(url).await?;
    let (controller, events) = PeerController::new(connector, config, outbound);
    let (handle, task) = controller.spawn(inbound);
    Ok((handle, events, task))
}
