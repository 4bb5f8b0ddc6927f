//! Local and remote media stream handles
//!
//! Capture itself lives outside this crate. Text sessions send a placeholder
//! stream so both modes negotiate the same way; video sessions ask the
//! [`MediaSource`] collaborator for a camera stream.

use serde::{Deserialize, Serialize};

/// What a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Real camera/microphone capture
    Camera,
    /// Blank stream standing in for media in text sessions
    Placeholder,
}

/// Stream offered to the peer when dialing or answering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub kind: StreamKind,
}

impl LocalStream {
    /// Placeholder stream owned by `owner` (usually the share code)
    pub fn placeholder(owner: &str) -> Self {
        LocalStream {
            id: format!("placeholder-{}", owner),
            kind: StreamKind::Placeholder,
        }
    }

    pub fn camera(id: impl Into<String>) -> Self {
        LocalStream {
            id: id.into(),
            kind: StreamKind::Camera,
        }
    }

    pub fn is_camera(&self) -> bool {
        self.kind == StreamKind::Camera
    }
}

/// Stream received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer_id: String,
    pub kind: StreamKind,
}

/// Reasons a camera stream could not be acquired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// No capture device present
    NoDevice,
    /// The user or platform refused access
    PermissionDenied,
    /// Anything else reported by the capture layer
    Other(String),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::NoDevice => write!(f, "no capture device available"),
            MediaError::PermissionDenied => write!(f, "capture permission denied"),
            MediaError::Other(e) => write!(f, "capture failed: {}", e),
        }
    }
}

impl std::error::Error for MediaError {}

/// Capture collaborator used for video sessions
pub trait MediaSource: Send + Sync {
    fn acquire_camera(&self) -> Result<LocalStream, MediaError>;

    /// Stop the tracks of a stream obtained from [`acquire_camera`](Self::acquire_camera)
    fn release(&self, _stream: &LocalStream) {}
}

/// Media source for hosts without capture hardware
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMedia;

impl MediaSource for NoMedia {
    fn acquire_camera(&self) -> Result<LocalStream, MediaError> {
        Err(MediaError::NoDevice)
    }
}

/// Media source producing a synthetic camera stream, used by the simulator
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticCamera;

impl MediaSource for SyntheticCamera {
    fn acquire_camera(&self) -> Result<LocalStream, MediaError> {
        Ok(LocalStream::camera("synthetic-camera"))
    }

    fn release(&self, stream: &LocalStream) {
        log::debug!("Releasing synthetic stream {}", stream.id);
    }
}
