//! Lightweight Prometheus-compatible metrics for matchmaking sessions.
//!
//! Uses atomic counters so the listener, the matchmaking loop and the
//! connection pumps can record events without taking the session lock.
//! One `Arc<Metrics>` may be shared by every orchestrator in a process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters describing matchmaking activity
pub struct Metrics {
    /// Episodes started (counter)
    pub episodes_total: AtomicU64,
    /// Sessions currently connected (gauge)
    pub active_sessions: AtomicU64,
    /// Outbound dials issued (counter)
    pub dial_attempts_total: AtomicU64,
    /// Dials abandoned after the attempt timeout (counter)
    pub dial_timeouts_total: AtomicU64,
    /// Dials that failed or were closed before opening (counter)
    pub dial_failures_total: AtomicU64,
    /// Connections committed, inbound or outbound (counter)
    pub matches_total: AtomicU64,
    /// Second connections discarded by the first-writer guard (counter)
    pub duplicate_connections_total: AtomicU64,
    /// Inbound offers refused without answering (counter)
    pub offers_rejected_total: AtomicU64,
    /// Inbound payloads dropped as malformed (counter)
    pub malformed_messages_total: AtomicU64,
    /// Failed directory calls (counter)
    pub directory_errors_total: AtomicU64,
    /// Creation time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            episodes_total: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            dial_attempts_total: AtomicU64::new(0),
            dial_timeouts_total: AtomicU64::new(0),
            dial_failures_total: AtomicU64::new(0),
            matches_total: AtomicU64::new(0),
            duplicate_connections_total: AtomicU64::new(0),
            offers_rejected_total: AtomicU64::new(0),
            malformed_messages_total: AtomicU64::new(0),
            directory_errors_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.matches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        // Saturating: a gauge must never wrap
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP chat_episodes_total Total matchmaking episodes started\n\
             # TYPE chat_episodes_total counter\n\
             chat_episodes_total {}\n\
             # HELP chat_active_sessions Current number of connected sessions\n\
             # TYPE chat_active_sessions gauge\n\
             chat_active_sessions {}\n\
             # HELP chat_dial_attempts_total Total outbound dials issued\n\
             # TYPE chat_dial_attempts_total counter\n\
             chat_dial_attempts_total {}\n\
             # HELP chat_dial_timeouts_total Total dials abandoned after the attempt timeout\n\
             # TYPE chat_dial_timeouts_total counter\n\
             chat_dial_timeouts_total {}\n\
             # HELP chat_dial_failures_total Total dials that failed before opening\n\
             # TYPE chat_dial_failures_total counter\n\
             chat_dial_failures_total {}\n\
             # HELP chat_matches_total Total connections committed\n\
             # TYPE chat_matches_total counter\n\
             chat_matches_total {}\n\
             # HELP chat_duplicate_connections_total Total duplicate connections discarded\n\
             # TYPE chat_duplicate_connections_total counter\n\
             chat_duplicate_connections_total {}\n\
             # HELP chat_offers_rejected_total Total inbound offers rejected\n\
             # TYPE chat_offers_rejected_total counter\n\
             chat_offers_rejected_total {}\n\
             # HELP chat_malformed_messages_total Total malformed payloads dropped\n\
             # TYPE chat_malformed_messages_total counter\n\
             chat_malformed_messages_total {}\n\
             # HELP chat_directory_errors_total Total failed directory calls\n\
             # TYPE chat_directory_errors_total counter\n\
             chat_directory_errors_total {}\n\
             # HELP chat_uptime_seconds Uptime in seconds\n\
             # TYPE chat_uptime_seconds gauge\n\
             chat_uptime_seconds {}\n",
            self.episodes_total.load(Ordering::Relaxed),
            self.active_sessions.load(Ordering::Relaxed),
            self.dial_attempts_total.load(Ordering::Relaxed),
            self.dial_timeouts_total.load(Ordering::Relaxed),
            self.dial_failures_total.load(Ordering::Relaxed),
            self.matches_total.load(Ordering::Relaxed),
            self.duplicate_connections_total.load(Ordering::Relaxed),
            self.offers_rejected_total.load(Ordering::Relaxed),
            self.malformed_messages_total.load(Ordering::Relaxed),
            self.directory_errors_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
