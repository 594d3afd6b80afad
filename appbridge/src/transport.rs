//! Channel surface between the event loop and whatever carries the wire.
//!
//! The bridge is transport-agnostic: a host binds these channels to its
//! broker or socket layer and the loop never learns which.

use crate::protocol::{OutboundMessage, Reply};
use tokio::sync::{mpsc, oneshot};

/// Opaque handle for one live inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Everything the transport can tell the event loop.
#[derive(Debug)]
pub enum Inbound {
    /// A request body from a connected app. The reply goes back on
    /// `responder`; a dropped responder means the connection went away
    /// mid-request and the reply is discarded.
    Request {
        connection: ConnectionId,
        body: String,
        responder: oneshot::Sender<Reply>,
    },
    /// An identify payload answering a discovery broadcast.
    Identify { app: String, payload: String },
    /// The transport lost a connection without a goodbye.
    Disconnected { connection: ConnectionId },
}

/// The transport-facing half of the channel pair created with the loop.
pub struct BridgeChannels {
    pub requests: mpsc::Sender<Inbound>,
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
}
