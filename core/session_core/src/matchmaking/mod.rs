//! Matchmaking: the active half of an episode
//!
//! Every tick the loop lists the directory, picks one untried candidate at
//! random and dials it. Only one dial is in flight at a time; a dial that
//! does not open within the attempt timeout is abandoned and its target is
//! never retried automatically.

mod attempt;
mod dialer;

pub use attempt::{AttemptedSet, ConnectionAttempt, Matchmaker};
pub(crate) use dialer::MatchmakingLoop;
