//! Listener and connection pump
//!
//! The listener is the passive half of an episode: it pulls events from the
//! local endpoint and answers inbound offers while no connection is live.
//! Every answered or dialed connection is then driven by a
//! [`ConnectionPump`], which commits it on channel open and afterwards
//! dispatches its payloads until the episode ends.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::media::RemoteStream;
use crate::metrics::Metrics;
use crate::observer::Notice;
use crate::orchestrator::EpisodeContext;
use crate::state::{EndReason, Role};
use crate::transport::{
    Connection, ConnectionEvent, DataChannel, EndpointEvent, IncomingOffer, TransportError,
};

// ============================================================================
// Offer Admission
// ============================================================================

/// Session facts an inbound offer is judged against
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Admission {
    pub connected: bool,
    pub share_code: Option<String>,
    /// Code our own matchmaking loop is dialing right now
    pub pending_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RejectReason {
    /// A connection is already live
    Busy,
    /// Both sides are dialing each other; the lower code keeps its own dial
    CrossDial,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Busy => write!(f, "already connected"),
            RejectReason::CrossDial => write!(f, "crossed dial, keeping our own"),
        }
    }
}

/// Decide whether an offer from `remote` may be answered.
///
/// When both clients dial each other at once, the one with the
/// lexicographically lower share code rejects the inbound offer and the
/// other accepts it, so exactly one of the two links survives.
pub(crate) fn should_accept(admission: &Admission, remote: &str) -> Result<(), RejectReason> {
    if admission.connected {
        return Err(RejectReason::Busy);
    }

    let crossed = admission.pending_target.as_deref() == Some(remote);
    if crossed && admission.share_code.as_deref().is_some_and(|own| own < remote) {
        return Err(RejectReason::CrossDial);
    }

    Ok(())
}

// ============================================================================
// Listener
// ============================================================================

pub(crate) struct Listener {
    ctx: EpisodeContext,
}

impl Listener {
    pub(crate) fn new(ctx: EpisodeContext) -> Self {
        Listener { ctx }
    }

    /// Serve the endpoint until the episode ends
    pub(crate) fn run(self) {
        let wait = self.ctx.orchestrator.config().event_poll();
        log::debug!("Listening on '{}'", self.ctx.endpoint.id());

        while self.ctx.orchestrator.is_current(&self.ctx.token) {
            match self.ctx.endpoint.next_event(wait) {
                None => {}
                Some(EndpointEvent::Incoming(offer)) => self.handle_offer(offer),
                Some(EndpointEvent::Error(e)) => {
                    if self.handle_error(e) {
                        break;
                    }
                }
            }
        }

        log::debug!("Listener on '{}' stopped", self.ctx.endpoint.id());
    }

    pub(crate) fn handle_offer(&self, offer: Box<dyn IncomingOffer>) {
        let orchestrator = &self.ctx.orchestrator;
        let remote = offer.remote_id().to_string();

        let Some(admission) = orchestrator.admission(&self.ctx.token) else {
            offer.reject();
            return;
        };

        if let Err(reason) = should_accept(&admission, &remote) {
            Metrics::incr(&orchestrator.metrics_ref().offers_rejected_total);
            log::info!("Rejecting offer from '{}': {}", remote, reason);
            offer.reject();
            return;
        }

        let connection = match offer.answer(&self.ctx.stream) {
            Ok(connection) => connection,
            Err(e) => {
                log::debug!("Answering '{}' failed: {}", remote, e);
                return;
            }
        };

        let channel = match connection.open_data_channel() {
            Ok(channel) => channel,
            Err(e) => {
                log::debug!("Data channel to '{}' failed: {}", remote, e);
                connection.close();
                return;
            }
        };

        log::debug!("Answered offer from '{}'", remote);

        let deadline = Instant::now() + orchestrator.config().attempt_timeout();
        let pump = ConnectionPump::new(
            self.ctx.clone(),
            Role::Host,
            Arc::clone(&connection),
            Arc::clone(&channel),
            Some(deadline),
        );

        let spawned = thread::Builder::new()
            .name(format!("inbound-{}", remote))
            .spawn(move || pump.run());
        if let Err(e) = spawned {
            log::warn!("Cannot drive inbound connection from '{}': {}", remote, e);
            release_unpumped(connection.as_ref(), channel.as_ref());
        }
    }

    /// Returns whether the listener should stop
    fn handle_error(&self, e: TransportError) -> bool {
        let orchestrator = &self.ctx.orchestrator;
        if !orchestrator.is_current(&self.ctx.token) {
            return true;
        }

        if !e.is_categorical() {
            log::debug!("Endpoint '{}' reported: {}", self.ctx.share_code, e);
            return false;
        }

        if orchestrator.is_searching(&self.ctx.token) {
            log::warn!("Endpoint '{}' failed: {}", self.ctx.share_code, e);
            orchestrator.notify(&Notice::TransportFailure(e.to_string()));
            orchestrator.end_current(&self.ctx.token, EndReason::TransportError);
        } else {
            // The live connection does not depend on the endpoint
            log::warn!("Endpoint '{}' failed while connected: {}", self.ctx.share_code, e);
        }
        true
    }
}

/// Close an answered connection nothing will drive, so its dialer sees
/// `Closed` instead of waiting out its attempt timeout
fn release_unpumped(connection: &dyn Connection, channel: &dyn DataChannel) {
    channel.close();
    connection.close();
}

// ============================================================================
// Connection Pump
// ============================================================================

/// Result of one pump step
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PumpStep {
    /// Nothing decisive happened
    Pending,
    /// This connection became the session's connection
    Committed,
    /// Opened after another connection had already won
    Discarded,
    /// Closed or failed before opening
    Failed(Option<TransportError>),
    /// Did not open before its deadline
    TimedOut,
    /// The episode is over
    Ended,
}

impl PumpStep {
    pub(crate) fn is_final(&self) -> bool {
        !matches!(self, PumpStep::Pending | PumpStep::Committed)
    }
}

/// Drives one connection from negotiation through the live session
pub(crate) struct ConnectionPump {
    ctx: EpisodeContext,
    role: Role,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn DataChannel>,
    committed: bool,
    /// Only enforced before commit
    deadline: Option<Instant>,
    /// Peer media held until commit
    remote_stream: Option<RemoteStream>,
    profile_due: Option<Instant>,
}

impl ConnectionPump {
    pub(crate) fn new(
        ctx: EpisodeContext,
        role: Role,
        connection: Arc<dyn Connection>,
        channel: Arc<dyn DataChannel>,
        deadline: Option<Instant>,
    ) -> Self {
        ConnectionPump {
            ctx,
            role,
            connection,
            channel,
            committed: false,
            deadline,
            remote_stream: None,
            profile_due: None,
        }
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.committed
    }

    /// Close a connection that never became live
    pub(crate) fn abandon(&self) {
        if !self.committed {
            release_unpumped(self.connection.as_ref(), self.channel.as_ref());
        }
    }

    /// Process at most one connection event, waiting up to `wait` for it
    pub(crate) fn poll(&mut self, now: Instant, wait: Duration) -> PumpStep {
        let orchestrator = &self.ctx.orchestrator;
        let token = &self.ctx.token;

        if self.committed {
            if !orchestrator.is_current(token) {
                return PumpStep::Ended;
            }
            if self.profile_due.is_some_and(|due| now >= due) {
                self.profile_due = None;
                orchestrator.send_profile_for(token);
            }
        } else {
            if token.is_cancelled() {
                self.abandon();
                return PumpStep::Ended;
            }
            if self.deadline.is_some_and(|deadline| now >= deadline) {
                log::debug!(
                    "{} connection to '{}' did not open in time",
                    self.role,
                    self.connection.remote_id()
                );
                self.abandon();
                return PumpStep::TimedOut;
            }
        }

        let Some(event) = self.connection.next_event(wait) else {
            return PumpStep::Pending;
        };

        match event {
            ConnectionEvent::StreamReceived(stream) => {
                if self.committed {
                    orchestrator.notify_remote_stream(&stream);
                } else {
                    self.remote_stream = Some(stream);
                }
                PumpStep::Pending
            }
            ConnectionEvent::ChannelOpen => {
                if self.committed {
                    return PumpStep::Pending;
                }
                let committed = orchestrator.commit_connection(
                    token,
                    self.role,
                    Arc::clone(&self.connection),
                    Arc::clone(&self.channel),
                );
                if !committed {
                    return PumpStep::Discarded;
                }

                self.committed = true;
                self.deadline = None;
                self.profile_due = Some(now + orchestrator.config().profile_send_delay());
                if let Some(stream) = self.remote_stream.take() {
                    orchestrator.notify_remote_stream(&stream);
                }
                PumpStep::Committed
            }
            ConnectionEvent::Data(payload) => {
                if self.committed {
                    orchestrator.handle_payload(token, &payload);
                } else {
                    log::debug!("Ignoring {} bytes before the channel opened", payload.len());
                }
                PumpStep::Pending
            }
            ConnectionEvent::Closed => {
                if self.committed {
                    orchestrator.end_current(token, EndReason::PeerClosed);
                    PumpStep::Ended
                } else {
                    self.abandon();
                    PumpStep::Failed(None)
                }
            }
            ConnectionEvent::Error(e) => {
                if self.committed {
                    log::warn!("Connection to '{}' failed: {}", self.connection.remote_id(), e);
                    orchestrator.end_current(token, EndReason::TransportError);
                    PumpStep::Ended
                } else {
                    self.abandon();
                    PumpStep::Failed(Some(e))
                }
            }
        }
    }

    /// Pump until the connection is discarded, fails or the episode ends
    pub(crate) fn run(mut self) {
        let wait = self.ctx.orchestrator.config().event_poll();
        loop {
            let step = self.poll(Instant::now(), wait);
            if step.is_final() {
                log::trace!(
                    "Pump for '{}' finished: {:?}",
                    self.connection.remote_id(),
                    step
                );
                break;
            }
        }
    }
}
