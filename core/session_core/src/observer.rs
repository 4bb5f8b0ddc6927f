//! UI and profile-cache collaborator
//!
//! The orchestrator reports everything a user interface needs through
//! [`SessionObserver`]. Callbacks run on worker threads and must not call
//! back into the orchestrator synchronously while holding their own locks.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::media::RemoteStream;
use crate::state::Status;

/// Failures surfaced to the user. Per-candidate failures never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Camera acquisition failed and the episode was aborted
    MediaUnavailable(String),
    /// Camera acquisition failed and the episode continues in text mode
    MediaFallback,
    /// The local endpoint could not be created
    EndpointUnavailable(String),
    /// The directory failed this many times in a row
    DirectoryUnreachable { consecutive_failures: u32 },
    /// The endpoint failed while searching and the episode ended
    TransportFailure(String),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::MediaUnavailable(e) => write!(f, "camera unavailable: {}", e),
            Notice::MediaFallback => write!(f, "camera unavailable, continuing with text only"),
            Notice::EndpointUnavailable(e) => write!(f, "cannot go online: {}", e),
            Notice::DirectoryUnreachable {
                consecutive_failures,
            } => write!(
                f,
                "matchmaking server unreachable ({} failures in a row)",
                consecutive_failures
            ),
            Notice::TransportFailure(e) => write!(f, "connection lost: {}", e),
        }
    }
}

/// Receiver of session events. Every method defaults to a no-op.
pub trait SessionObserver: Send + Sync {
    fn on_status(&self, _status: Status) {}

    fn on_chat(&self, _sender: &str, _text: &str, _timestamp: u64) {}

    /// Remote profile received (the profile cache)
    fn on_profile(&self, _profile: &serde_json::Value) {}

    fn on_remote_stream(&self, _stream: &RemoteStream) {}

    fn on_notice(&self, _notice: &Notice) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

/// Owned copy of one observer callback
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(Status),
    Chat {
        sender: String,
        text: String,
        timestamp: u64,
    },
    Profile(serde_json::Value),
    RemoteStream(RemoteStream),
    Notice(Notice),
}

/// Observer forwarding every callback into an mpsc channel
pub struct ChannelObserver {
    tx: Mutex<Sender<SessionEvent>>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (ChannelObserver { tx: Mutex::new(tx) }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Receiver dropped: nobody is listening anymore
        let _ = tx.send(event);
    }
}

impl SessionObserver for ChannelObserver {
    fn on_status(&self, status: Status) {
        self.forward(SessionEvent::Status(status));
    }

    fn on_chat(&self, sender: &str, text: &str, timestamp: u64) {
        self.forward(SessionEvent::Chat {
            sender: sender.to_string(),
            text: text.to_string(),
            timestamp,
        });
    }

    fn on_profile(&self, profile: &serde_json::Value) {
        self.forward(SessionEvent::Profile(profile.clone()));
    }

    fn on_remote_stream(&self, stream: &RemoteStream) {
        self.forward(SessionEvent::RemoteStream(stream.clone()));
    }

    fn on_notice(&self, notice: &Notice) {
        self.forward(SessionEvent::Notice(notice.clone()));
    }
}
