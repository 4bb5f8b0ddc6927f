//! Session state owned by the connection orchestrator
//!
//! There is exactly one [`SessionState`] per client. Only
//! [`ConnectionOrchestrator`](crate::ConnectionOrchestrator) mutates it, always
//! under its mutex; the listener and the matchmaking loop read it through
//! orchestrator queries.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::media::LocalStream;
use crate::protocol::OutboundQueue;
use crate::transport::{Connection, DataChannel, Endpoint};

// ============================================================================
// Enums
// ============================================================================

/// Session mode. Peers only match within the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Text,
    Video,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Text => write!(f, "text"),
            Mode::Video => write!(f, "video"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Mode::Text),
            "video" => Ok(Mode::Video),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Which half produced the live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    /// Accepted an inbound offer on our share code
    Host,
    /// Dialed a candidate from the directory
    Joiner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Host => write!(f, "host"),
            Role::Joiner => write!(f, "joiner"),
        }
    }
}

/// Episode status
///
/// ```text
/// Idle ─start─► Advertising/Matching ─first open─► Connected
///                      ▲                              │
///                      └──────requeue──── Disconnected ◄┘
/// ```
///
/// Advertising and Matching overlap: the client is listening from the
/// moment the episode starts and searching once the matchmaking loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Advertising,
    Matching,
    Connected,
    Disconnected,
}

impl Status {
    /// Listening and/or dialing, not yet connected
    pub fn is_searching(self) -> bool {
        matches!(self, Status::Advertising | Status::Matching)
    }

    /// An episode is running
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Status::Advertising | Status::Matching | Status::Connected
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Idle => "idle",
            Status::Advertising => "advertising",
            Status::Matching => "matching",
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

/// Why an episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The user stopped searching or left the session
    LocalStop,
    /// The user asked for another partner
    Next,
    /// The peer sent `DISCONNECT`
    PeerDisconnected,
    /// The transport reported the link closed
    PeerClosed,
    /// The endpoint or link failed
    TransportError,
    /// The episode could not be started
    Aborted,
}

impl EndReason {
    /// Whether the peer should receive `DISCONNECT` before teardown
    pub fn notifies_peer(self) -> bool {
        matches!(self, EndReason::LocalStop | EndReason::Next)
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::LocalStop => "local-stop",
            EndReason::Next => "next",
            EndReason::PeerDisconnected => "peer-disconnected",
            EndReason::PeerClosed => "peer-closed",
            EndReason::TransportError => "transport-error",
            EndReason::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Episode Token
// ============================================================================

/// Cancellation token handed to every worker of one episode.
///
/// Workers compare their token against the current episode before calling
/// back into the orchestrator, so late events from a finished episode never
/// touch the next one.
#[derive(Debug, Clone)]
pub struct EpisodeToken {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl EpisodeToken {
    pub(crate) fn new(id: u64) -> Self {
        EpisodeToken {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Handles taken out of the state when an episode ends, released outside the lock
pub(crate) struct Released {
    pub episode: u64,
    pub share_code: Option<String>,
    pub connection: Option<Arc<dyn Connection>>,
    pub data_channel: Option<Arc<dyn DataChannel>>,
    pub endpoint: Option<Arc<dyn Endpoint>>,
    pub local_stream: Option<LocalStream>,
    pub was_connected: bool,
}

/// Process-wide record of this client's episode
pub struct SessionState {
    pub(crate) local_id: String,
    pub(crate) share_code: Option<String>,
    /// Code of the previous episode, kept only so it is never reissued back to back
    pub(crate) last_share_code: Option<String>,
    pub(crate) mode: Mode,
    pub(crate) role: Role,
    pub(crate) connection: Option<Arc<dyn Connection>>,
    pub(crate) data_channel: Option<Arc<dyn DataChannel>>,
    pub(crate) status: Status,
    pub(crate) episode: u64,
    pub(crate) token: Option<EpisodeToken>,
    pub(crate) endpoint: Option<Arc<dyn Endpoint>>,
    pub(crate) local_stream: Option<LocalStream>,
    /// Code the matchmaking loop is currently dialing
    pub(crate) pending_target: Option<String>,
    pub(crate) peer_code: Option<String>,
    pub(crate) remote_profile: Option<serde_json::Value>,
    pub(crate) outbound: OutboundQueue,
    pub(crate) last_end: Option<EndReason>,
}

impl SessionState {
    pub fn new(local_id: String, mode: Mode) -> Self {
        SessionState {
            local_id,
            share_code: None,
            last_share_code: None,
            mode,
            role: Role::None,
            connection: None,
            data_channel: None,
            status: Status::Idle,
            episode: 0,
            token: None,
            endpoint: None,
            local_stream: None,
            pending_target: None,
            peer_code: None,
            remote_profile: None,
            outbound: OutboundQueue::new(),
            last_end: None,
        }
    }

    /// Whether `token` belongs to the running episode
    pub(crate) fn is_current(&self, token: &EpisodeToken) -> bool {
        self.token
            .as_ref()
            .is_some_and(|t| t.id == token.id && !t.is_cancelled())
    }

    /// Reset per-episode fields and enter Advertising with a fresh token
    pub(crate) fn begin_episode(&mut self, mode: Mode, share_code: String) -> EpisodeToken {
        self.episode += 1;
        let token = EpisodeToken::new(self.episode);

        self.mode = mode;
        self.role = Role::None;
        self.connection = None;
        self.data_channel = None;
        self.endpoint = None;
        self.local_stream = None;
        self.pending_target = None;
        self.peer_code = None;
        self.remote_profile = None;
        self.outbound.clear();
        self.last_end = None;
        self.last_share_code = Some(share_code.clone());
        self.share_code = Some(share_code);
        self.token = Some(token.clone());
        self.status = Status::Advertising;

        token
    }

    /// Cancel the episode and take every handle out, leaving `status` as given
    pub(crate) fn release(&mut self, status: Status, reason: EndReason) -> Released {
        if let Some(token) = self.token.take() {
            token.cancel();
        }

        let was_connected = self.status == Status::Connected;
        self.status = status;
        self.last_end = Some(reason);
        self.role = Role::None;
        self.pending_target = None;
        self.peer_code = None;
        self.remote_profile = None;
        self.outbound.clear();

        Released {
            episode: self.episode,
            share_code: self.share_code.take(),
            connection: self.connection.take(),
            data_channel: self.data_channel.take(),
            endpoint: self.endpoint.take(),
            local_stream: self.local_stream.take(),
            was_connected,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_id: self.local_id.clone(),
            share_code: self.share_code.clone(),
            mode: self.mode,
            role: self.role,
            status: self.status,
            episode: self.episode,
            connected: self.connection.is_some(),
            channel_open: self.data_channel.as_ref().is_some_and(|c| c.is_open()),
            peer_code: self.peer_code.clone(),
            queued_messages: self.outbound.len(),
            last_end: self.last_end,
        }
    }
}

/// Read-only copy of the session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub local_id: String,
    pub share_code: Option<String>,
    pub mode: Mode,
    pub role: Role,
    pub status: Status,
    pub episode: u64,
    pub connected: bool,
    pub channel_open: bool,
    pub peer_code: Option<String>,
    pub queued_messages: usize,
    /// Reason the previous episode ended, until the next one starts
    pub last_end: Option<EndReason>,
}
