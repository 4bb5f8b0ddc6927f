//! Session configuration
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object is a valid configuration.
//!
//! ```json
//! { "mode": "video", "tick_interval_ms": 1000, "media_fallback_to_text": true }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Profile;
use crate::state::Mode;

// ============================================================================
// Defaults
// ============================================================================

/// Matchmaking tick interval
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 2_000;

/// Per-attempt dial timeout; the only hard timeout
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 8_000;

/// Delay between connecting and sending our profile
pub const DEFAULT_PROFILE_SEND_DELAY_MS: u64 = 500;

/// Attempted-code set size before it is forgotten
pub const DEFAULT_ATTEMPTED_CAPACITY: usize = 20;

/// Consecutive directory list failures before the user is told
pub const DEFAULT_DIRECTORY_FAILURE_THRESHOLD: u32 = 5;

/// Bounded wait used by workers when pulling transport events
pub const DEFAULT_EVENT_POLL_MS: u64 = 50;

// ============================================================================
// SessionConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Stable client identifier; generated when absent
    pub local_id: Option<String>,
    pub mode: Mode,
    pub tick_interval_ms: u64,
    pub attempt_timeout_ms: u64,
    pub profile_send_delay_ms: u64,
    pub attempted_capacity: usize,
    pub directory_failure_threshold: u32,
    pub event_poll_ms: u64,
    /// Continue in text mode when the camera cannot be acquired
    pub media_fallback_to_text: bool,
    /// Profile sent to peers; the default profile is derived from `local_id`
    pub profile: Option<Profile>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_id: None,
            mode: Mode::Text,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            profile_send_delay_ms: DEFAULT_PROFILE_SEND_DELAY_MS,
            attempted_capacity: DEFAULT_ATTEMPTED_CAPACITY,
            directory_failure_threshold: DEFAULT_DIRECTORY_FAILURE_THRESHOLD,
            event_poll_ms: DEFAULT_EVENT_POLL_MS,
            media_fallback_to_text: false,
            profile: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loaded session config from {}", path.display());
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("attempt_timeout_ms", self.attempt_timeout_ms),
            ("event_poll_ms", self.event_poll_ms),
            ("attempted_capacity", self.attempted_capacity as u64),
            (
                "directory_failure_threshold",
                u64::from(self.directory_failure_threshold),
            ),
        ];

        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }

        if let Some(id) = &self.local_id {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("local_id must not be empty".into()));
            }
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn profile_send_delay(&self) -> Duration {
        Duration::from_millis(self.profile_send_delay_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read
    Io(String),
    /// The file is not valid configuration JSON
    Parse(String),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid config: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid config value: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = SessionConfig::from_json("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.attempt_timeout(), Duration::from_secs(8));
        assert_eq!(config.profile_send_delay(), Duration::from_millis(500));
        assert_eq!(config.attempted_capacity, 20);
    }

    #[test]
    fn test_partial_override() {
        let config = SessionConfig::from_json(
            r#"{"mode":"video","tick_interval_ms":100,"media_fallback_to_text":true,
                "profile":{"username":"Ada","joined":1}}"#,
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Video);
        assert_eq!(config.tick_interval_ms, 100);
        assert!(config.media_fallback_to_text);
        assert_eq!(config.profile.unwrap().username, "Ada");
        assert_eq!(config.attempt_timeout_ms, DEFAULT_ATTEMPT_TIMEOUT_MS);
    }

    #[test]
    fn test_rejects_zero_values() {
        let err = SessionConfig::from_json(r#"{"attempt_timeout_ms":0}"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid("attempt_timeout_ms must be non-zero".to_string())
        );
        assert!(SessionConfig::from_json(r#"{"attempted_capacity":0}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"local_id":"  "}"#).is_err());
    }

    #[test]
    fn test_rejects_unknown_fields_and_bad_json() {
        assert!(matches!(
            SessionConfig::from_json(r#"{"tick":1}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SessionConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = SessionConfig::load(Path::new("/nonexistent/session.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
