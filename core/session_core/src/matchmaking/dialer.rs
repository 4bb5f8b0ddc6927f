use std::thread;
use std::time::{Duration, Instant};

use crate::listener::{ConnectionPump, PumpStep};
use crate::metrics::Metrics;
use crate::observer::Notice;
use crate::orchestrator::EpisodeContext;
use crate::state::Role;
use crate::transport::TransportError;

use super::attempt::Matchmaker;

/// Result of one matchmaking tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// The episode is no longer searching; the loop should exit
    Stopped,
    /// A dial is still in flight
    Skipped,
    NoCandidates,
    DirectoryUnavailable,
    /// The dial failed immediately
    DialFailed,
    Dialed(String),
}

/// Periodic poll-select-dial loop for one episode.
///
/// When its own dial commits, the loop keeps driving that connection until
/// the episode ends.
pub(crate) struct MatchmakingLoop {
    ctx: EpisodeContext,
    matchmaker: Matchmaker,
    /// Rendezvous code to dial on the first tick instead of listing
    join_target: Option<String>,
    pump: Option<ConnectionPump>,
    directory_failures: u32,
    unreachable_reported: bool,
}

impl MatchmakingLoop {
    pub(crate) fn new(ctx: EpisodeContext, join_target: Option<String>) -> Self {
        let capacity = ctx.orchestrator.config().attempted_capacity;
        MatchmakingLoop {
            ctx,
            matchmaker: Matchmaker::new(capacity),
            join_target,
            pump: None,
            directory_failures: 0,
            unreachable_reported: false,
        }
    }

    pub(crate) fn tick(&mut self, now: Instant) -> TickOutcome {
        let orchestrator = &self.ctx.orchestrator;
        let token = &self.ctx.token;

        if !orchestrator.is_searching(token) {
            return TickOutcome::Stopped;
        }
        if self.pump.is_some() || self.matchmaker.has_attempt() {
            log::trace!("Dial in flight; tick skipped");
            return TickOutcome::Skipped;
        }
        orchestrator.mark_matching(token);

        let target = match self.join_target.take() {
            Some(code) => {
                self.matchmaker.remember(&code);
                code
            }
            None => {
                let records = match orchestrator.directory().list(self.ctx.mode) {
                    Ok(records) => {
                        self.directory_failures = 0;
                        records
                    }
                    Err(e) => {
                        self.directory_failed(&e.to_string());
                        return TickOutcome::DirectoryUnavailable;
                    }
                };

                match self
                    .matchmaker
                    .select_candidate(&records, self.ctx.mode, &self.ctx.share_code)
                {
                    Ok(Some(code)) => code,
                    Ok(None) => {
                        log::trace!("No candidates among {} records", records.len());
                        return TickOutcome::NoCandidates;
                    }
                    Err(e) => {
                        log::warn!("Candidate selection failed: {}", e);
                        return TickOutcome::NoCandidates;
                    }
                }
            }
        };

        self.dial(target, now)
    }

    fn dial(&mut self, target: String, now: Instant) -> TickOutcome {
        let orchestrator = &self.ctx.orchestrator;
        Metrics::incr(&orchestrator.metrics_ref().dial_attempts_total);
        orchestrator.set_pending_target(&self.ctx.token, Some(target.clone()));
        log::debug!("Dialing '{}'", target);

        let connection = match self.ctx.endpoint.dial(&target, &self.ctx.stream) {
            Ok(connection) => connection,
            Err(e) => {
                self.dial_failed(&target, Some(&e));
                return TickOutcome::DialFailed;
            }
        };

        let channel = match connection.open_data_channel() {
            Ok(channel) => channel,
            Err(e) => {
                connection.close();
                self.dial_failed(&target, Some(&e));
                return TickOutcome::DialFailed;
            }
        };

        let timeout = orchestrator.config().attempt_timeout();
        self.matchmaker.begin_attempt(target.clone(), now, timeout);
        // The attempt owns the deadline
        self.pump = Some(ConnectionPump::new(
            self.ctx.clone(),
            Role::Joiner,
            connection,
            channel,
            None,
        ));

        TickOutcome::Dialed(target)
    }

    fn dial_failed(&mut self, target: &str, error: Option<&TransportError>) {
        let orchestrator = &self.ctx.orchestrator;
        Metrics::incr(&orchestrator.metrics_ref().dial_failures_total);
        orchestrator.set_pending_target(&self.ctx.token, None);

        match error {
            Some(e) if e.is_target_gone() => log::debug!("Candidate '{}' is gone", target),
            Some(e) => log::debug!("Dial to '{}' failed: {}", target, e),
            None => log::debug!("Dial to '{}' closed before opening", target),
        }
    }

    fn directory_failed(&mut self, error: &str) {
        let orchestrator = &self.ctx.orchestrator;
        Metrics::incr(&orchestrator.metrics_ref().directory_errors_total);
        self.directory_failures += 1;
        log::debug!(
            "Directory list failed ({} in a row): {}",
            self.directory_failures,
            error
        );

        let threshold = orchestrator.config().directory_failure_threshold;
        if self.directory_failures >= threshold && !self.unreachable_reported {
            self.unreachable_reported = true;
            log::warn!(
                "Directory unreachable after {} attempts",
                self.directory_failures
            );
            orchestrator.notify(&Notice::DirectoryUnreachable {
                consecutive_failures: self.directory_failures,
            });
        }
    }

    /// Drive the in-flight dial, or the live connection it became.
    ///
    /// Returns `None` when nothing is in flight.
    pub(crate) fn poll_attempt(&mut self, now: Instant, wait: Duration) -> Option<PumpStep> {
        let orchestrator = self.ctx.orchestrator.clone();
        let token = self.ctx.token.clone();
        let pump = self.pump.as_mut()?;

        if !pump.is_committed() {
            if self.matchmaker.attempt_expired(now) {
                pump.abandon();
                if let Some(attempt) = self.matchmaker.clear_attempt() {
                    log::debug!("Dial to '{}' timed out", attempt.target_code);
                }
                self.pump = None;
                Metrics::incr(&orchestrator.metrics_ref().dial_timeouts_total);
                orchestrator.set_pending_target(&token, None);
                return Some(PumpStep::TimedOut);
            }

            if !orchestrator.is_searching(&token) {
                // The listener won or the episode ended
                pump.abandon();
                self.pump = None;
                self.matchmaker.clear_attempt();
                return Some(PumpStep::Ended);
            }
        }

        let step = pump.poll(now, wait);
        match &step {
            PumpStep::Pending => {}
            PumpStep::Committed => {
                self.matchmaker.clear_attempt();
            }
            PumpStep::Failed(error) => {
                let target = self
                    .matchmaker
                    .clear_attempt()
                    .map(|a| a.target_code)
                    .unwrap_or_default();
                self.pump = None;
                self.dial_failed(&target, error.as_ref());
            }
            PumpStep::Discarded | PumpStep::TimedOut | PumpStep::Ended => {
                self.pump = None;
                self.matchmaker.clear_attempt();
                orchestrator.set_pending_target(&token, None);
            }
        }
        Some(step)
    }

    /// Tick on the configured interval until the episode stops searching,
    /// then keep pumping a connection this loop committed.
    pub(crate) fn run(mut self) {
        let interval = self.ctx.orchestrator.config().tick_interval();
        let wait = self.ctx.orchestrator.config().event_poll();
        let mut next_tick = Instant::now();

        log::debug!("Matchmaking for '{}' started", self.ctx.share_code);

        loop {
            let now = Instant::now();

            if self.pump.is_some() {
                self.poll_attempt(now, wait);
                continue;
            }

            if now >= next_tick {
                next_tick = now + interval;
                if self.tick(now) == TickOutcome::Stopped {
                    break;
                }
                continue;
            }

            if !self.ctx.orchestrator.is_searching(&self.ctx.token) {
                break;
            }
            thread::sleep(wait.min(next_tick.saturating_duration_since(now)));
        }

        log::debug!("Matchmaking for '{}' stopped", self.ctx.share_code);
    }

    #[cfg(test)]
    fn matchmaker(&self) -> &Matchmaker {
        &self.matchmaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::config::SessionConfig;
    use crate::directory::{Directory, DirectoryRecord, MemoryDirectory};
    use crate::observer::{ChannelObserver, SessionEvent};
    use crate::orchestrator::ConnectionOrchestrator;
    use crate::state::{Mode, Status};
    use crate::transport::{Endpoint, LoopbackNetwork, Transport};

    const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(8);

    struct Setup {
        directory: Arc<MemoryDirectory>,
        network: LoopbackNetwork,
        client: ConnectionOrchestrator,
        ctx: EpisodeContext,
        events: std::sync::mpsc::Receiver<SessionEvent>,
    }

    fn setup(config: SessionConfig) -> Setup {
        let directory = Arc::new(MemoryDirectory::new());
        let network = LoopbackNetwork::new();
        let (observer, events) = ChannelObserver::new();
        let client = ConnectionOrchestrator::builder(
            config,
            Arc::clone(&directory) as Arc<dyn Directory>,
            Arc::new(network.clone()) as Arc<dyn Transport>,
        )
        .observer(Arc::new(observer))
        .build()
        .unwrap();
        let ctx = client.prepare_episode(Mode::Text).unwrap().unwrap();
        Setup {
            directory,
            network,
            client,
            ctx,
            events,
        }
    }

    fn advertise(s: &Setup, code: &str, connected: bool) -> Arc<dyn Endpoint> {
        s.directory.insert(DirectoryRecord {
            code: code.to_string(),
            mode: Mode::Text,
            connected,
            last_seen_ms: 1,
        });
        s.network.create_endpoint(code).unwrap()
    }

    #[test]
    fn test_single_candidate_is_dialed() {
        let s = setup(SessionConfig::default());
        let _target = advertise(&s, "ABCDE", false);
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), None);

        assert_eq!(
            matchmaking.tick(Instant::now()),
            TickOutcome::Dialed("ABCDE".to_string())
        );
        assert!(matchmaking.matchmaker().attempted().contains("ABCDE"));
        assert_eq!(matchmaking.matchmaker().attempted().len(), 1);
        assert_eq!(
            s.client.metrics().dial_attempts_total.load(Ordering::Relaxed),
            1
        );
        assert_eq!(s.client.status(), Status::Matching);
    }

    #[test]
    fn test_only_connected_records_means_no_dial() {
        let s = setup(SessionConfig::default());
        let _a = advertise(&s, "ABCDE", true);
        let _b = advertise(&s, "FGHJK", true);
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), None);

        assert_eq!(matchmaking.tick(Instant::now()), TickOutcome::NoCandidates);
        assert!(matchmaking.matchmaker().attempted().is_empty());
        assert_eq!(
            s.client.metrics().dial_attempts_total.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_timed_out_attempt_moves_to_next_candidate() {
        let s = setup(SessionConfig::default());
        // Never polled, so its offer is never answered
        let _silent = advertise(&s, "ABCDE", false);
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), None);

        let start = Instant::now();
        assert_eq!(
            matchmaking.tick(start),
            TickOutcome::Dialed("ABCDE".to_string())
        );
        assert_eq!(matchmaking.tick(start), TickOutcome::Skipped);

        let expired = start + ATTEMPT_TIMEOUT;
        assert_eq!(
            matchmaking.poll_attempt(expired, Duration::ZERO),
            Some(PumpStep::TimedOut)
        );
        assert!(!matchmaking.matchmaker().has_attempt());
        assert!(!s.client.snapshot().connected);
        assert_eq!(
            s.client.metrics().dial_timeouts_total.load(Ordering::Relaxed),
            1
        );

        // Nothing else to dial: the timed out target is not retried
        assert_eq!(matchmaking.tick(expired), TickOutcome::NoCandidates);

        let _other = advertise(&s, "FGHJK", false);
        assert_eq!(
            matchmaking.tick(expired),
            TickOutcome::Dialed("FGHJK".to_string())
        );
    }

    #[test]
    fn test_unknown_target_fails_silently() {
        let s = setup(SessionConfig::default());
        s.directory.insert(DirectoryRecord {
            code: "GHOST".to_string(),
            mode: Mode::Text,
            connected: false,
            last_seen_ms: 1,
        });
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), None);

        assert_eq!(matchmaking.tick(Instant::now()), TickOutcome::DialFailed);
        assert!(!matchmaking.matchmaker().has_attempt());
        assert_eq!(
            s.client.metrics().dial_failures_total.load(Ordering::Relaxed),
            1
        );
        assert!(!s
            .events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::Notice(_))));
    }

    #[test]
    fn test_rejected_dial_clears_attempt() {
        let s = setup(SessionConfig::default());
        let target = advertise(&s, "ABCDE", false);
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), None);

        assert!(matches!(
            matchmaking.tick(Instant::now()),
            TickOutcome::Dialed(_)
        ));
        match target.next_event(Duration::from_millis(100)) {
            Some(crate::transport::EndpointEvent::Incoming(offer)) => offer.reject(),
            other => panic!("expected offer, got {:?}", other),
        }

        assert_eq!(
            matchmaking.poll_attempt(Instant::now(), Duration::from_millis(100)),
            Some(PumpStep::Failed(None))
        );
        assert!(!matchmaking.matchmaker().has_attempt());
        assert_eq!(s.client.status(), Status::Matching);
    }

    #[test]
    fn test_join_dials_target_first() {
        let s = setup(SessionConfig::default());
        let _target = s.network.create_endpoint("QRSTU").unwrap();
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), Some("QRSTU".to_string()));

        assert_eq!(
            matchmaking.tick(Instant::now()),
            TickOutcome::Dialed("QRSTU".to_string())
        );
        assert!(matchmaking.matchmaker().attempted().contains("QRSTU"));
    }

    #[test]
    fn test_directory_unreachable_reported_once() {
        let s = setup(SessionConfig {
            directory_failure_threshold: 2,
            ..SessionConfig::default()
        });
        s.directory.set_reachable(false);
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), None);

        let now = Instant::now();
        for _ in 0..4 {
            assert_eq!(matchmaking.tick(now), TickOutcome::DirectoryUnavailable);
        }

        let notices: Vec<_> = s
            .events
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::Notice(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(
            notices,
            vec![Notice::DirectoryUnreachable {
                consecutive_failures: 2
            }]
        );
        assert_eq!(s.client.status(), Status::Matching);
    }

    #[test]
    fn test_tick_stops_after_episode_end() {
        let s = setup(SessionConfig::default());
        let mut matchmaking = MatchmakingLoop::new(s.ctx.clone(), None);
        s.client.stop();

        assert_eq!(matchmaking.tick(Instant::now()), TickOutcome::Stopped);
    }
}
