//! Peer transport abstraction
//!
//! The transport turns a rendezvous identifier into a direct point-to-point
//! link carrying media and an ordered, reliable data channel. Negotiation
//! (offer/answer, candidate exchange) is entirely the transport's business.
//!
//! # Event Flow
//!
//! ```text
//! Dialer                         Listener
//!   │ Endpoint::dial(code)          │
//!   │──────── offer ───────────────►│ EndpointEvent::Incoming
//!   │                               │ IncomingOffer::answer(stream)
//!   │◄── StreamReceived ───────────►│
//!   │◄── ChannelOpen ──────────────►│   (both sides opened a data channel)
//!   │◄══ Data ════════════════════►│
//!   │◄── Closed ────────────────────│   (peer closed or rejected)
//! ```
//!
//! Events are pulled with a bounded wait so workers can observe
//! cancellation between events.

use std::sync::Arc;
use std::time::Duration;

use crate::media::{LocalStream, RemoteStream};

pub mod loopback;

pub use loopback::LoopbackNetwork;

// ============================================================================
// Traits
// ============================================================================

/// Factory for local endpoints
pub trait Transport: Send + Sync {
    /// Create an endpoint reachable under `endpoint_id` (the share code)
    fn create_endpoint(&self, endpoint_id: &str) -> Result<Arc<dyn Endpoint>, TransportError>;
}

/// Local endpoint: receives offers and dials remote endpoints
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    /// Wait up to `timeout` for the next endpoint event
    fn next_event(&self, timeout: Duration) -> Option<EndpointEvent>;

    /// Start dialing `remote_id`. Returns immediately; progress arrives as
    /// [`ConnectionEvent`]s on the returned connection.
    fn dial(
        &self,
        remote_id: &str,
        stream: &LocalStream,
    ) -> Result<Arc<dyn Connection>, TransportError>;

    fn close(&self);
}

/// Inbound connection offer
pub trait IncomingOffer: Send {
    fn remote_id(&self) -> &str;

    /// Accept the offer with the local stream
    fn answer(self: Box<Self>, stream: &LocalStream)
        -> Result<Arc<dyn Connection>, TransportError>;

    /// Refuse the offer without answering
    fn reject(self: Box<Self>);
}

/// A negotiated or negotiating peer link
pub trait Connection: Send + Sync {
    fn remote_id(&self) -> &str;

    /// Request the ordered, reliable data channel; it opens asynchronously
    fn open_data_channel(&self) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Wait up to `timeout` for the next connection event
    fn next_event(&self, timeout: Duration) -> Option<ConnectionEvent>;

    fn close(&self);
}

/// Ordered, reliable message pipe tied to a connection
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Send one message. Must not block.
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    fn close(&self);
}

// ============================================================================
// Events
// ============================================================================

/// Event raised by an endpoint
pub enum EndpointEvent {
    Incoming(Box<dyn IncomingOffer>),
    Error(TransportError),
}

impl std::fmt::Debug for EndpointEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointEvent::Incoming(offer) => write!(f, "Incoming({})", offer.remote_id()),
            EndpointEvent::Error(e) => write!(f, "Error({:?})", e),
        }
    }
}

/// Event raised by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Peer media arrived
    StreamReceived(RemoteStream),
    /// Data channel is open on both sides
    ChannelOpen,
    /// One data channel message
    Data(Vec<u8>),
    /// Peer closed or rejected the link
    Closed,
    Error(TransportError),
}

// ============================================================================
// Error Type
// ============================================================================

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No endpoint is reachable under the dialed id
    PeerUnavailable(String),
    /// The remote refused the offer
    Rejected(String),
    /// The requested endpoint id is already in use
    IdTaken(String),
    /// The transport as a whole cannot be used
    NetworkUnavailable(String),
    /// The local endpoint was closed
    EndpointClosed,
    /// The data channel is not open
    ChannelClosed,
    Other(String),
}

impl TransportError {
    /// The dialed target is gone; expected during matchmaking and never surfaced
    pub fn is_target_gone(&self) -> bool {
        matches!(
            self,
            TransportError::PeerUnavailable(_) | TransportError::Rejected(_)
        )
    }

    /// No further progress is possible on this endpoint
    pub fn is_categorical(&self) -> bool {
        matches!(
            self,
            TransportError::NetworkUnavailable(_)
                | TransportError::IdTaken(_)
                | TransportError::EndpointClosed
        )
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::PeerUnavailable(id) => write!(f, "peer '{}' unavailable", id),
            TransportError::Rejected(id) => write!(f, "peer '{}' rejected the offer", id),
            TransportError::IdTaken(id) => write!(f, "endpoint id '{}' already in use", id),
            TransportError::NetworkUnavailable(e) => write!(f, "network unavailable: {}", e),
            TransportError::EndpointClosed => write!(f, "endpoint closed"),
            TransportError::ChannelClosed => write!(f, "data channel not open"),
            TransportError::Other(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}
