//! In-process loopback transport
//!
//! Endpoints live in a shared hub keyed by endpoint id. Dialing pushes an
//! offer onto the remote endpoint's event queue; each side of a link owns an
//! event queue fed by the other side, which gives ordered, reliable delivery.
//!
//! ```text
//!   caller ──dial──► hub ──Incoming──► callee endpoint
//!     │                                   │ answer()
//!     └────────── Link (shared state) ────┘
//!        ChannelOpen once answered and both sides opened a channel
//! ```
//!
//! An offer that is rejected or dropped unanswered closes the link, so the
//! caller sees `Closed`. An offer left pending never opens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::media::{LocalStream, RemoteStream, StreamKind};

use super::{
    Connection, ConnectionEvent, DataChannel, Endpoint, EndpointEvent, IncomingOffer, Transport,
    TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Network Hub
// ============================================================================

#[derive(Default)]
struct Hub {
    endpoints: HashMap<String, Sender<EndpointEvent>>,
    unavailable: bool,
}

/// Loopback transport shared by every client in one process
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make endpoint creation and dialing fail as if the network were down
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.hub).unavailable = unavailable;
    }

    pub fn endpoint_count(&self) -> usize {
        lock(&self.hub).endpoints.len()
    }

    pub fn has_endpoint(&self, id: &str) -> bool {
        lock(&self.hub).endpoints.contains_key(id)
    }
}

impl Transport for LoopbackNetwork {
    fn create_endpoint(&self, endpoint_id: &str) -> Result<Arc<dyn Endpoint>, TransportError> {
        let mut hub = lock(&self.hub);

        if hub.unavailable {
            return Err(TransportError::NetworkUnavailable(
                "loopback network disabled".to_string(),
            ));
        }
        if hub.endpoints.contains_key(endpoint_id) {
            return Err(TransportError::IdTaken(endpoint_id.to_string()));
        }

        let (tx, rx) = mpsc::channel();
        hub.endpoints.insert(endpoint_id.to_string(), tx);
        log::trace!("Loopback endpoint '{}' created", endpoint_id);

        Ok(Arc::new(LoopbackEndpoint {
            id: endpoint_id.to_string(),
            hub: Arc::clone(&self.hub),
            events: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// Endpoint
// ============================================================================

struct LoopbackEndpoint {
    id: String,
    hub: Arc<Mutex<Hub>>,
    events: Mutex<Receiver<EndpointEvent>>,
    closed: AtomicBool,
}

impl Endpoint for LoopbackEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn next_event(&self, timeout: Duration) -> Option<EndpointEvent> {
        if self.closed.load(Ordering::Acquire) {
            return Some(EndpointEvent::Error(TransportError::EndpointClosed));
        }

        match lock(&self.events).recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(EndpointEvent::Error(TransportError::EndpointClosed))
            }
        }
    }

    fn dial(
        &self,
        remote_id: &str,
        stream: &LocalStream,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::EndpointClosed);
        }

        let remote = {
            let hub = lock(&self.hub);
            if hub.unavailable {
                return Err(TransportError::NetworkUnavailable(
                    "loopback network disabled".to_string(),
                ));
            }
            hub.endpoints
                .get(remote_id)
                .cloned()
                .ok_or_else(|| TransportError::PeerUnavailable(remote_id.to_string()))?
        };

        let (caller_tx, caller_rx) = mpsc::channel();
        let (callee_tx, callee_rx) = mpsc::channel();
        let link = Arc::new(Link::new(
            [self.id.clone(), remote_id.to_string()],
            [caller_tx, callee_tx],
            stream.kind,
        ));

        let offer = LoopbackOffer {
            link: Arc::clone(&link),
            events: Some(callee_rx),
            settled: false,
        };
        remote
            .send(EndpointEvent::Incoming(Box::new(offer)))
            .map_err(|_| TransportError::PeerUnavailable(remote_id.to_string()))?;

        log::trace!("Loopback '{}' dialed '{}'", self.id, remote_id);

        Ok(Arc::new(LoopbackConnection {
            side: Side::Caller,
            link,
            events: Mutex::new(caller_rx),
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            lock(&self.hub).endpoints.remove(&self.id);
            log::trace!("Loopback endpoint '{}' closed", self.id);
        }
    }
}

// ============================================================================
// Link
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Caller => 0,
            Side::Callee => 1,
        }
    }

    fn other(self) -> Side {
        match self {
            Side::Caller => Side::Callee,
            Side::Callee => Side::Caller,
        }
    }
}

#[derive(Default)]
struct LinkState {
    answered: bool,
    open: bool,
    closed: bool,
    channels: [bool; 2],
    kinds: [Option<StreamKind>; 2],
}

/// State shared by both sides of one dial
struct Link {
    ids: [String; 2],
    senders: [Sender<ConnectionEvent>; 2],
    state: Mutex<LinkState>,
}

impl Link {
    fn new(ids: [String; 2], senders: [Sender<ConnectionEvent>; 2], caller_kind: StreamKind) -> Self {
        let state = LinkState {
            kinds: [Some(caller_kind), None],
            ..LinkState::default()
        };
        Link {
            ids,
            senders,
            state: Mutex::new(state),
        }
    }

    fn deliver(&self, to: Side, event: ConnectionEvent) {
        // The receiving side may already be gone
        let _ = self.senders[to.index()].send(event);
    }

    fn answer(&self, kind: StreamKind) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::PeerUnavailable(self.ids[0].clone()));
        }

        state.answered = true;
        state.kinds[Side::Callee.index()] = Some(kind);

        for side in [Side::Caller, Side::Callee] {
            let other = side.other();
            if let Some(kind) = state.kinds[other.index()] {
                self.deliver(
                    side,
                    ConnectionEvent::StreamReceived(RemoteStream {
                        peer_id: self.ids[other.index()].clone(),
                        kind,
                    }),
                );
            }
        }

        self.maybe_open(&mut state);
        Ok(())
    }

    fn request_channel(&self, side: Side) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        state.channels[side.index()] = true;
        self.maybe_open(&mut state);
        Ok(())
    }

    fn maybe_open(&self, state: &mut LinkState) {
        if state.answered && state.channels == [true, true] && !state.open && !state.closed {
            state.open = true;
            self.deliver(Side::Caller, ConnectionEvent::ChannelOpen);
            self.deliver(Side::Callee, ConnectionEvent::ChannelOpen);
        }
    }

    fn is_open(&self) -> bool {
        let state = lock(&self.state);
        state.open && !state.closed
    }

    fn send(&self, from: Side, payload: &[u8]) -> Result<(), TransportError> {
        let state = lock(&self.state);
        if !state.open || state.closed {
            return Err(TransportError::ChannelClosed);
        }
        self.deliver(from.other(), ConnectionEvent::Data(payload.to_vec()));
        Ok(())
    }

    fn close(&self, from: Side) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        state.open = false;
        self.deliver(from.other(), ConnectionEvent::Closed);
    }
}

// ============================================================================
// Offer, Connection, Channel
// ============================================================================

struct LoopbackOffer {
    link: Arc<Link>,
    events: Option<Receiver<ConnectionEvent>>,
    settled: bool,
}

impl IncomingOffer for LoopbackOffer {
    fn remote_id(&self) -> &str {
        &self.link.ids[Side::Caller.index()]
    }

    fn answer(
        mut self: Box<Self>,
        stream: &LocalStream,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.settled = true;
        let events = self
            .events
            .take()
            .ok_or_else(|| TransportError::Other("offer already answered".to_string()))?;
        self.link.answer(stream.kind)?;

        Ok(Arc::new(LoopbackConnection {
            side: Side::Callee,
            link: Arc::clone(&self.link),
            events: Mutex::new(events),
        }))
    }

    fn reject(mut self: Box<Self>) {
        self.settled = true;
        self.link.close(Side::Callee);
    }
}

impl Drop for LoopbackOffer {
    fn drop(&mut self) {
        if !self.settled {
            self.link.close(Side::Callee);
        }
    }
}

struct LoopbackConnection {
    side: Side,
    link: Arc<Link>,
    events: Mutex<Receiver<ConnectionEvent>>,
}

impl Connection for LoopbackConnection {
    fn remote_id(&self) -> &str {
        &self.link.ids[self.side.other().index()]
    }

    fn open_data_channel(&self) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.link.request_channel(self.side)?;
        Ok(Arc::new(LoopbackChannel {
            side: self.side,
            link: Arc::clone(&self.link),
        }))
    }

    fn next_event(&self, timeout: Duration) -> Option<ConnectionEvent> {
        lock(&self.events).recv_timeout(timeout).ok()
    }

    fn close(&self) {
        self.link.close(self.side);
    }
}

struct LoopbackChannel {
    side: Side,
    link: Arc<Link>,
}

impl DataChannel for LoopbackChannel {
    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.link.send(self.side, payload)
    }

    fn close(&self) {
        self.link.close(self.side);
    }
}
