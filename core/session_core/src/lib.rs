//! Session Core
//!
//! Connection orchestration for anonymous peer-to-peer chat. Each client
//! advertises a short rendezvous code in a shared directory and, at the same
//! time, searches that directory for a partner to dial:
//! - `orchestrator`: the session state machine and the single writer of state
//! - `listener`: answers inbound offers and pumps live connections
//! - `matchmaking`: polls the directory, picks a random candidate, dials it
//! - `protocol`: CHAT / PROFILE / DISCONNECT messages on the data channel
//!
//! ```text
//!            ┌──────────────── ConnectionOrchestrator ────────────────┐
//!            │                 (Mutex<SessionState>)                   │
//!            └───────▲──────────────────────────────────────▲──────────┘
//!     commit/end     │                                      │ commit/end
//!            ┌───────┴────────┐                    ┌────────┴────────┐
//!            │    Listener    │                    │ MatchmakingLoop │
//!            │ (inbound offer)│                    │  (tick + dial)  │
//!            └───────▲────────┘                    └───▲─────────▲───┘
//!                    │ Endpoint events          list() │         │ dial()
//!               ┌────┴──────┐                  ┌───────┴───┐ ┌───┴───────┐
//!               │ Transport │                  │ Directory │ │ Transport │
//!               └───────────┘                  └───────────┘ └───────────┘
//! ```
//!
//! The directory and the transport are collaborators behind traits;
//! [`MemoryDirectory`] and [`LoopbackNetwork`] run everything in process.

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod directory;
pub mod error;
mod listener;
pub mod matchmaking;
pub mod media;
pub mod metrics;
pub mod observer;
mod orchestrator;
pub mod protocol;
pub mod random;
pub mod state;
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, SessionConfig};
pub use directory::{Directory, DirectoryError, DirectoryRecord, MemoryDirectory};
pub use error::SessionError;
pub use media::{LocalStream, MediaError, MediaSource, NoMedia, RemoteStream, StreamKind, SyntheticCamera};
pub use metrics::Metrics;
pub use observer::{ChannelObserver, Notice, NullObserver, SessionEvent, SessionObserver};
pub use orchestrator::{ConnectionOrchestrator, OrchestratorBuilder, SendOutcome};
pub use protocol::{Profile, ProtocolMessage};
pub use state::{EndReason, EpisodeToken, Mode, Role, SessionSnapshot, Status};
pub use transport::{LoopbackNetwork, Transport, TransportError};
