//! Connection orchestrator
//!
//! Single authority over [`SessionState`]. The listener and the matchmaking
//! loop run on their own threads and request every transition through the
//! methods here; each mutation happens under one mutex.
//!
//! ```text
//!                    start_episode / join
//!   Idle ──────────────────────────────────► Advertising ─first tick─► Matching
//!    ▲  media or endpoint failure                 │                       │
//!    └────────────────────────────────────────────┤   commit_connection   │
//!                                                  ▼                       ▼
//!                      requeue / next ◄── Disconnected ◄─end── Connected
//! ```
//!
//! `commit_connection` is the only place a connection is stored. It is a
//! check-and-set under the state lock: the first path to reach an open data
//! channel wins and every later one is closed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use ring::rand::SystemRandom;

use crate::config::SessionConfig;
use crate::directory::Directory;
use crate::error::SessionError;
use crate::listener::{Admission, Listener};
use crate::matchmaking::MatchmakingLoop;
use crate::media::{LocalStream, MediaError, MediaSource, NoMedia, RemoteStream};
use crate::metrics::Metrics;
use crate::observer::{Notice, NullObserver, SessionObserver};
use crate::protocol::{decode_message, encode_message, Profile, ProtocolMessage};
use crate::random::{generate_fresh_share_code, generate_local_id, is_valid_share_code};
use crate::state::{
    EndReason, EpisodeToken, Mode, Released, Role, SessionSnapshot, SessionState, Status,
};
use crate::transport::{Connection, DataChannel, Endpoint, Transport, TransportError};

/// Result of a send request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open data channel
    Sent,
    /// Held until the data channel opens
    Queued,
}

// ============================================================================
// Episode Context
// ============================================================================

/// Everything a worker needs for one episode
#[derive(Clone)]
pub(crate) struct EpisodeContext {
    pub orchestrator: ConnectionOrchestrator,
    pub token: EpisodeToken,
    pub endpoint: Arc<dyn Endpoint>,
    pub stream: LocalStream,
    pub mode: Mode,
    pub share_code: String,
}

// ============================================================================
// Builder
// ============================================================================

pub struct OrchestratorBuilder {
    config: SessionConfig,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    media: Option<Arc<dyn MediaSource>>,
    observer: Option<Arc<dyn SessionObserver>>,
    metrics: Option<Arc<Metrics>>,
}

impl OrchestratorBuilder {
    pub fn media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Share one metrics instance between several orchestrators
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<ConnectionOrchestrator, SessionError> {
        self.config.validate()?;

        let rng = SystemRandom::new();
        let local_id = match &self.config.local_id {
            Some(id) => id.trim().to_string(),
            None => generate_local_id(&rng)?,
        };
        let profile = self
            .config
            .profile
            .clone()
            .unwrap_or_else(|| Profile::default_for(&local_id))
            .to_value();

        log::debug!("Session client '{}' created", local_id);

        let state = SessionState::new(local_id, self.config.mode);
        Ok(ConnectionOrchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                state: Mutex::new(state),
                directory: self.directory,
                transport: self.transport,
                media: self.media.unwrap_or_else(|| Arc::new(NoMedia)),
                observer: self.observer.unwrap_or_else(|| Arc::new(NullObserver)),
                metrics: self.metrics.unwrap_or_default(),
                rng,
                profile,
            }),
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Inner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaSource>,
    observer: Arc<dyn SessionObserver>,
    metrics: Arc<Metrics>,
    rng: SystemRandom,
    /// Profile blob sent to every peer
    profile: serde_json::Value,
}

/// Handle to one client's session. Cloning shares the same session.
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl ConnectionOrchestrator {
    pub fn builder(
        config: SessionConfig,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn Transport>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            directory,
            transport,
            media: None,
            observer: None,
            metrics: None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Episode Lifecycle
    // ========================================================================

    /// Start advertising and searching in `mode`.
    ///
    /// Does nothing when an episode is already running. Fails, leaving the
    /// session Idle, when no local stream or endpoint can be obtained.
    pub fn start_episode(&self, mode: Mode) -> Result<(), SessionError> {
        self.start(mode, None)
    }

    /// Start an episode whose first dial targets the rendezvous `code`
    pub fn join(&self, mode: Mode, code: &str) -> Result<(), SessionError> {
        self.start(mode, Some(code.trim().to_ascii_uppercase()))
    }

    fn start(&self, mode: Mode, join_target: Option<String>) -> Result<(), SessionError> {
        match self.prepare_episode(mode)? {
            Some(ctx) => self.spawn_workers(ctx, join_target),
            None => Ok(()),
        }
    }

    /// Enter Advertising, acquire media, create the endpoint and register it.
    /// Returns `None` when an episode is already running.
    pub(crate) fn prepare_episode(
        &self,
        mode: Mode,
    ) -> Result<Option<EpisodeContext>, SessionError> {
        let (token, share_code) = {
            let mut state = self.lock_state();
            if state.status.is_active() {
                log::debug!("Episode {} already running; start ignored", state.episode);
                return Ok(None);
            }
            let code =
                generate_fresh_share_code(&self.inner.rng, state.last_share_code.as_deref())?;
            let token = state.begin_episode(mode, code.clone());
            (token, code)
        };
        Metrics::incr(&self.inner.metrics.episodes_total);

        let (mode, stream) = match self.acquire_stream(mode, &share_code) {
            Ok(acquired) => acquired,
            Err(e) => {
                self.abort_episode(&token, Notice::MediaUnavailable(e.to_string()));
                return Err(SessionError::Media(e));
            }
        };

        let endpoint = match self.inner.transport.create_endpoint(&share_code) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.release_stream(&stream);
                self.abort_episode(&token, Notice::EndpointUnavailable(e.to_string()));
                return Err(SessionError::Endpoint(e));
            }
        };

        if let Err(e) = self.inner.directory.register(&share_code, mode) {
            Metrics::incr(&self.inner.metrics.directory_errors_total);
            log::warn!("Directory registration of '{}' failed: {}", share_code, e);
        }

        {
            let mut state = self.lock_state();
            if !state.is_current(&token) {
                drop(state);
                log::debug!("Episode ended while starting; releasing '{}'", share_code);
                endpoint.close();
                self.release_stream(&stream);
                self.inner.directory.unregister(&share_code);
                return Ok(None);
            }
            state.mode = mode;
            state.endpoint = Some(Arc::clone(&endpoint));
            state.local_stream = Some(stream.clone());
        }

        log::info!(
            "Episode {} started: advertising '{}' for {} sessions",
            token.id(),
            share_code,
            mode
        );
        self.inner.observer.on_status(Status::Advertising);

        Ok(Some(EpisodeContext {
            orchestrator: self.clone(),
            token,
            endpoint,
            stream,
            mode,
            share_code,
        }))
    }

    fn acquire_stream(
        &self,
        mode: Mode,
        share_code: &str,
    ) -> Result<(Mode, LocalStream), MediaError> {
        if mode == Mode::Text {
            return Ok((Mode::Text, LocalStream::placeholder(share_code)));
        }

        match self.inner.media.acquire_camera() {
            Ok(stream) => Ok((Mode::Video, stream)),
            Err(e) if self.inner.config.media_fallback_to_text => {
                log::warn!("Camera unavailable ({}); continuing in text mode", e);
                self.inner.observer.on_notice(&Notice::MediaFallback);
                Ok((Mode::Text, LocalStream::placeholder(share_code)))
            }
            Err(e) => Err(e),
        }
    }

    fn release_stream(&self, stream: &LocalStream) {
        if stream.is_camera() {
            self.inner.media.release(stream);
        }
    }

    /// Abandon a starting episode and return to Idle
    fn abort_episode(&self, token: &EpisodeToken, notice: Notice) {
        let released = {
            let mut state = self.lock_state();
            if !state.is_current(token) {
                return;
            }
            state.release(Status::Idle, EndReason::Aborted)
        };

        log::warn!("Episode {} aborted: {}", released.episode, notice);
        if let Some(endpoint) = released.endpoint {
            endpoint.close();
        }
        self.inner.observer.on_notice(&notice);
        self.inner.observer.on_status(Status::Idle);
    }

    fn spawn_workers(
        &self,
        ctx: EpisodeContext,
        join_target: Option<String>,
    ) -> Result<(), SessionError> {
        let token = ctx.token.clone();

        let listener = Listener::new(ctx.clone());
        let spawned = thread::Builder::new()
            .name(format!("listener-{}", ctx.share_code))
            .spawn(move || listener.run());
        if let Err(e) = spawned {
            self.end_current(&token, EndReason::Aborted);
            return Err(SessionError::Spawn(e.to_string()));
        }

        let name = format!("matchmaking-{}", ctx.share_code);
        let matchmaking = MatchmakingLoop::new(ctx, join_target);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || matchmaking.run());
        if let Err(e) = spawned {
            self.end_current(&token, EndReason::Aborted);
            return Err(SessionError::Spawn(e.to_string()));
        }

        Ok(())
    }

    /// Store the first connection to open; close any later one.
    ///
    /// Returns whether `connection` became the session's connection.
    pub(crate) fn commit_connection(
        &self,
        token: &EpisodeToken,
        role: Role,
        connection: Arc<dyn Connection>,
        channel: Arc<dyn DataChannel>,
    ) -> bool {
        let peer_code = connection.remote_id().to_string();

        let share_code = {
            let mut state = self.lock_state();

            if !state.is_current(token) {
                drop(state);
                log::debug!("Closing {} connection to '{}' from a finished episode", role, peer_code);
                channel.close();
                connection.close();
                return false;
            }

            if state.connection.is_some() {
                drop(state);
                Metrics::incr(&self.inner.metrics.duplicate_connections_total);
                log::info!("Discarding duplicate {} connection to '{}'", role, peer_code);
                channel.close();
                connection.close();
                return false;
            }

            state.connection = Some(Arc::clone(&connection));
            state.data_channel = Some(Arc::clone(&channel));
            state.role = role;
            state.status = Status::Connected;
            state.peer_code = Some(peer_code.clone());
            state.pending_target = None;

            // Flushed under the lock so a concurrent send cannot overtake the queue
            for msg in state.outbound.drain() {
                if let Err(e) = send_on(&channel, &msg) {
                    log::warn!("Dropping queued {} message: {}", msg.kind(), e);
                }
            }

            state.share_code.clone()
        };

        self.inner.metrics.session_opened();
        log::info!("Connected to '{}' as {}", peer_code, role);

        if let Some(code) = share_code {
            self.mark_connected(&code);
        }
        if role == Role::Joiner {
            self.mark_connected(&peer_code);
        }

        self.inner.observer.on_status(Status::Connected);
        true
    }

    fn mark_connected(&self, code: &str) {
        if let Err(e) = self.inner.directory.mark_connected(code) {
            Metrics::incr(&self.inner.metrics.directory_errors_total);
            log::warn!("Could not mark '{}' connected: {}", code, e);
        }
    }

    /// End whatever episode is running. Safe from any state; repeated calls
    /// are no-ops.
    pub fn end_episode(&self, reason: EndReason) {
        self.finish(None, reason);
    }

    /// End the episode `token` belongs to, if it is still running
    pub(crate) fn end_current(&self, token: &EpisodeToken, reason: EndReason) -> bool {
        self.finish(Some(token), reason)
    }

    fn finish(&self, token: Option<&EpisodeToken>, reason: EndReason) -> bool {
        let released = {
            let mut state = self.lock_state();
            if let Some(token) = token {
                if !state.is_current(token) {
                    return false;
                }
            }
            if !state.status.is_active() {
                return false;
            }
            state.release(Status::Disconnected, reason)
        };

        self.teardown(released, reason);
        true
    }

    fn teardown(&self, released: Released, reason: EndReason) {
        if reason.notifies_peer() {
            if let Some(channel) = released.data_channel.as_ref().filter(|c| c.is_open()) {
                if let Err(e) = send_on(channel, &ProtocolMessage::Disconnect) {
                    log::debug!("DISCONNECT not delivered: {}", e);
                }
            }
        }

        if let Some(code) = &released.share_code {
            if released.was_connected {
                if let Err(e) = self.inner.directory.mark_available(code) {
                    Metrics::incr(&self.inner.metrics.directory_errors_total);
                    log::debug!("Could not mark '{}' available: {}", code, e);
                }
            }
            self.inner.directory.unregister(code);
        }

        if let Some(channel) = released.data_channel {
            channel.close();
        }
        if let Some(connection) = released.connection {
            connection.close();
        }
        if let Some(endpoint) = released.endpoint {
            endpoint.close();
        }
        if let Some(stream) = released.local_stream {
            self.release_stream(&stream);
        }
        if released.was_connected {
            self.inner.metrics.session_closed();
        }

        log::info!("Episode {} ended ({})", released.episode, reason);
        self.inner.observer.on_status(Status::Disconnected);
    }

    /// Start a new episode in the previous mode. Only acts when Disconnected.
    pub fn requeue(&self) -> Result<(), SessionError> {
        let mode = {
            let state = self.lock_state();
            if state.status != Status::Disconnected {
                log::debug!("Requeue ignored while {}", state.status);
                return Ok(());
            }
            state.mode
        };
        self.start_episode(mode)
    }

    /// Leave the current partner and look for another one
    pub fn next(&self) -> Result<(), SessionError> {
        self.end_episode(EndReason::Next);
        self.requeue()
    }

    pub fn stop(&self) {
        self.end_episode(EndReason::LocalStop);
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Send a chat line, queueing it until the channel opens
    pub fn send_chat(&self, text: &str) -> Result<SendOutcome, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let sender = self.local_id();
        self.send_message(ProtocolMessage::chat(&sender, text))
    }

    /// Send our profile, queueing it until the channel opens
    pub fn send_profile(&self) -> Result<SendOutcome, SessionError> {
        self.send_message(ProtocolMessage::profile(self.inner.profile.clone()))
    }

    /// Scheduled profile send for a connected episode
    pub(crate) fn send_profile_for(&self, token: &EpisodeToken) {
        if !self.is_current(token) {
            return;
        }
        match self.send_profile() {
            Ok(_) => log::debug!("Profile sent"),
            Err(e) => log::debug!("Profile not sent: {}", e),
        }
    }

    fn send_message(&self, msg: ProtocolMessage) -> Result<SendOutcome, SessionError> {
        let payload = encode_message(&msg)?;

        let mut state = self.lock_state();
        if !state.status.is_active() {
            return Err(SessionError::NoSession);
        }

        // Queue only until a connection commits; the commit flushes it once
        if state.connection.is_none() {
            log::trace!("Queueing {} until the channel opens", msg.kind());
            state.outbound.push(msg);
            return Ok(SendOutcome::Queued);
        }

        match &state.data_channel {
            Some(channel) if channel.is_open() => {
                channel.send(&payload).map_err(SessionError::Channel)?;
                Ok(SendOutcome::Sent)
            }
            _ => Err(SessionError::Channel(TransportError::ChannelClosed)),
        }
    }

    /// Dispatch one inbound channel payload. Malformed payloads are dropped.
    pub(crate) fn handle_payload(&self, token: &EpisodeToken, payload: &[u8]) {
        let msg = match decode_message(payload) {
            Ok(msg) => msg,
            Err(e) => {
                Metrics::incr(&self.inner.metrics.malformed_messages_total);
                log::warn!("Dropping malformed payload ({} bytes): {}", payload.len(), e);
                return;
            }
        };

        if !self.is_current(token) {
            return;
        }

        match msg {
            ProtocolMessage::Chat {
                sender,
                text,
                timestamp,
            } => {
                self.inner.observer.on_chat(&sender, &text, timestamp);
            }
            ProtocolMessage::Profile { profile, .. } => {
                {
                    let mut state = self.lock_state();
                    if !state.is_current(token) {
                        return;
                    }
                    state.remote_profile = Some(profile.clone());
                }
                self.inner.observer.on_profile(&profile);
            }
            ProtocolMessage::Disconnect => {
                log::info!("Peer sent DISCONNECT");
                self.end_current(token, EndReason::PeerDisconnected);
            }
        }
    }

    // ========================================================================
    // Worker Support
    // ========================================================================

    pub(crate) fn is_current(&self, token: &EpisodeToken) -> bool {
        self.lock_state().is_current(token)
    }

    /// Still looking for a partner in the episode of `token`
    pub(crate) fn is_searching(&self, token: &EpisodeToken) -> bool {
        let state = self.lock_state();
        state.is_current(token) && state.status.is_searching() && state.connection.is_none()
    }

    /// Advertising becomes Matching once the first matchmaking tick runs
    pub(crate) fn mark_matching(&self, token: &EpisodeToken) {
        let changed = {
            let mut state = self.lock_state();
            if state.is_current(token) && state.status == Status::Advertising {
                state.status = Status::Matching;
                true
            } else {
                false
            }
        };
        if changed {
            self.inner.observer.on_status(Status::Matching);
        }
    }

    pub(crate) fn set_pending_target(&self, token: &EpisodeToken, target: Option<String>) {
        let mut state = self.lock_state();
        if state.is_current(token) {
            state.pending_target = target;
        }
    }

    /// What the listener needs to decide on an inbound offer
    pub(crate) fn admission(&self, token: &EpisodeToken) -> Option<Admission> {
        let state = self.lock_state();
        if !state.is_current(token) {
            return None;
        }
        Some(Admission {
            connected: state.connection.is_some(),
            share_code: state.share_code.clone(),
            pending_target: state.pending_target.clone(),
        })
    }

    pub(crate) fn notify(&self, notice: &Notice) {
        self.inner.observer.on_notice(notice);
    }

    pub(crate) fn notify_remote_stream(&self, stream: &RemoteStream) {
        self.inner.observer.on_remote_stream(stream);
    }

    pub(crate) fn directory(&self) -> &dyn Directory {
        self.inner.directory.as_ref()
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn metrics_ref(&self) -> &Metrics {
        &self.inner.metrics
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock_state().snapshot()
    }

    pub fn status(&self) -> Status {
        self.lock_state().status
    }

    pub fn local_id(&self) -> String {
        self.lock_state().local_id.clone()
    }

    pub fn share_code(&self) -> Option<String> {
        self.lock_state().share_code.clone()
    }

    /// Last profile received from the current peer
    pub fn remote_profile(&self) -> Option<serde_json::Value> {
        self.lock_state().remote_profile.clone()
    }

    /// Profile this client sends to peers
    pub fn profile(&self) -> &serde_json::Value {
        &self.inner.profile
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Clients listed in the directory across both modes; 0 when it is unreachable
    pub fn online_count(&self) -> usize {
        let mut total = 0;
        for mode in [Mode::Text, Mode::Video] {
            match self.inner.directory.list(mode) {
                Ok(records) => {
                    total += records
                        .iter()
                        .filter(|r| is_valid_share_code(&r.code))
                        .count();
                }
                Err(e) => {
                    Metrics::incr(&self.inner.metrics.directory_errors_total);
                    log::debug!("Online count unavailable: {}", e);
                    return 0;
                }
            }
        }
        total
    }
}

fn send_on(channel: &Arc<dyn DataChannel>, msg: &ProtocolMessage) -> Result<(), SessionError> {
    let payload = encode_message(msg)?;
    channel.send(&payload).map_err(SessionError::Channel)
}
