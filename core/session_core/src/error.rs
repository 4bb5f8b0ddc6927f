//! Errors returned to callers of the orchestrator

use crate::config::ConfigError;
use crate::media::MediaError;
use crate::protocol::EncodeError;
use crate::random::RandomError;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The local endpoint could not be created
    Endpoint(TransportError),
    /// The camera stream could not be acquired
    Media(MediaError),
    /// Sending on the data channel failed
    Channel(TransportError),
    Encode(EncodeError),
    Config(ConfigError),
    Random(RandomError),
    /// Chat text was empty after trimming
    EmptyMessage,
    /// No episode is running
    NoSession,
    /// A worker thread could not be started
    Spawn(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Endpoint(e) => write!(f, "cannot create endpoint: {}", e),
            SessionError::Media(e) => write!(f, "cannot acquire media: {}", e),
            SessionError::Channel(e) => write!(f, "send failed: {}", e),
            SessionError::Encode(e) => write!(f, "cannot encode message: {}", e),
            SessionError::Config(e) => write!(f, "{}", e),
            SessionError::Random(e) => write!(f, "{}", e),
            SessionError::EmptyMessage => write!(f, "message is empty"),
            SessionError::NoSession => write!(f, "no session in progress"),
            SessionError::Spawn(e) => write!(f, "cannot start worker: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Endpoint(e) | SessionError::Channel(e) => Some(e),
            SessionError::Media(e) => Some(e),
            SessionError::Encode(e) => Some(e),
            SessionError::Config(e) => Some(e),
            SessionError::Random(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MediaError> for SessionError {
    fn from(e: MediaError) -> Self {
        SessionError::Media(e)
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        SessionError::Encode(e)
    }
}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Config(e)
    }
}

impl From<RandomError> for SessionError {
    fn from(e: RandomError) -> Self {
        SessionError::Random(e)
    }
}
