//! Candidate bookkeeping for the matchmaking loop
//!
//! Pure state: no I/O and no clock reads. The loop feeds in directory
//! snapshots and the current `Instant`.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use ring::rand::SystemRandom;

use crate::directory::DirectoryRecord;
use crate::random::{is_valid_share_code, uniform_index, RandomError};
use crate::state::Mode;

// ============================================================================
// Attempted Set
// ============================================================================

/// Codes already dialed this episode. Forgotten wholesale once full.
#[derive(Debug)]
pub struct AttemptedSet {
    codes: HashSet<String>,
    capacity: usize,
}

impl AttemptedSet {
    pub fn new(capacity: usize) -> Self {
        AttemptedSet {
            codes: HashSet::new(),
            capacity,
        }
    }

    /// Record `code`, emptying the set first when it is full
    pub fn insert(&mut self, code: &str) {
        if self.codes.len() >= self.capacity {
            log::debug!("Attempted set full ({}); forgetting", self.codes.len());
            self.codes.clear();
        }
        self.codes.insert(code.to_string());
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

// ============================================================================
// Connection Attempt
// ============================================================================

/// The single outbound dial in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub target_code: String,
    pub started_at: Instant,
    pub deadline: Instant,
}

impl ConnectionAttempt {
    pub fn new(target_code: String, now: Instant, timeout: Duration) -> Self {
        ConnectionAttempt {
            target_code,
            started_at: now,
            deadline: now + timeout,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

// ============================================================================
// Matchmaker
// ============================================================================

/// Candidate filter and selection plus the in-flight attempt slot
pub struct Matchmaker {
    attempted: AttemptedSet,
    attempt: Option<ConnectionAttempt>,
    rng: SystemRandom,
}

impl Matchmaker {
    pub fn new(capacity: usize) -> Self {
        Matchmaker {
            attempted: AttemptedSet::new(capacity),
            attempt: None,
            rng: SystemRandom::new(),
        }
    }

    /// Records that may be dialed: same mode, not connected, not our own
    /// code, well formed and not attempted yet this episode.
    pub fn candidates<'a>(
        &self,
        records: &'a [DirectoryRecord],
        mode: Mode,
        own_code: &str,
    ) -> Vec<&'a DirectoryRecord> {
        records
            .iter()
            .filter(|r| r.mode == mode)
            .filter(|r| !r.connected)
            .filter(|r| r.code != own_code)
            .filter(|r| is_valid_share_code(&r.code))
            .filter(|r| !self.attempted.contains(&r.code))
            .collect()
    }

    /// Pick one candidate uniformly at random and remember it as attempted
    pub fn select_candidate(
        &mut self,
        records: &[DirectoryRecord],
        mode: Mode,
        own_code: &str,
    ) -> Result<Option<String>, RandomError> {
        let candidates = self.candidates(records, mode, own_code);
        let Some(index) = uniform_index(&self.rng, candidates.len())? else {
            return Ok(None);
        };

        let code = candidates[index].code.clone();
        log::trace!("Selected '{}' out of {} candidates", code, candidates.len());
        self.attempted.insert(&code);
        Ok(Some(code))
    }

    /// Remember a code dialed without going through selection
    pub fn remember(&mut self, code: &str) {
        self.attempted.insert(code);
    }

    pub fn begin_attempt(&mut self, target_code: String, now: Instant, timeout: Duration) {
        self.attempt = Some(ConnectionAttempt::new(target_code, now, timeout));
    }

    pub fn has_attempt(&self) -> bool {
        self.attempt.is_some()
    }

    pub fn attempt_expired(&self, now: Instant) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.is_expired(now))
    }

    pub fn clear_attempt(&mut self) -> Option<ConnectionAttempt> {
        self.attempt.take()
    }

    pub fn attempted(&self) -> &AttemptedSet {
        &self.attempted
    }
}
