//! Message protocol spoken over the data channel
//!
//! Once a data channel is open both peers exchange self-describing JSON
//! records, one per channel message:
//!
//! ```text
//! {"type":"CHAT","sender":"user_k3v9x0q2a","text":"hi","timestamp":1700000000000}
//! {"type":"PROFILE","profile":{...},"timestamp":1700000000000}
//! {"type":"DISCONNECT"}
//! ```
//!
//! The channel is ordered and reliable, so there are no acknowledgements.
//! `CHAT` and `PROFILE` sent before the channel opens wait in an
//! [`OutboundQueue`] and are flushed once when it opens; `DISCONNECT` is only
//! ever sent on an open channel.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Maximum encoded message size (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 65536;

// ============================================================================
// Protocol Messages
// ============================================================================

/// Messages exchanged once the data channel is open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    /// Chat line typed by the peer
    Chat {
        sender: String,
        text: String,
        timestamp: u64,
    },

    /// Peer profile, sent once by each side shortly after connecting
    Profile {
        profile: serde_json::Value,
        timestamp: u64,
    },

    /// Peer is tearing the session down
    Disconnect,
}

impl ProtocolMessage {
    pub fn chat(sender: &str, text: &str) -> Self {
        ProtocolMessage::Chat {
            sender: sender.to_string(),
            text: text.to_string(),
            timestamp: unix_millis(),
        }
    }

    pub fn profile(profile: serde_json::Value) -> Self {
        ProtocolMessage::Profile {
            profile,
            timestamp: unix_millis(),
        }
    }

    /// Wire tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Chat { .. } => "CHAT",
            ProtocolMessage::Profile { .. } => "PROFILE",
            ProtocolMessage::Disconnect => "DISCONNECT",
        }
    }

    /// Whether the message may wait for the channel to open
    pub fn is_queueable(&self) -> bool {
        !matches!(self, ProtocolMessage::Disconnect)
    }
}

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Message Encoding/Decoding
// ============================================================================

/// Encode a message as one channel payload
pub fn encode_message(msg: &ProtocolMessage) -> Result<Vec<u8>, EncodeError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(EncodeError::MessageTooLarge(payload.len()));
    }

    Ok(payload)
}

/// Decode one channel payload
pub fn decode_message(buf: &[u8]) -> Result<ProtocolMessage, DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::Empty);
    }

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(DecodeError::MessageTooLarge(buf.len()));
    }

    serde_json::from_slice(buf).map_err(|e| DecodeError::Deserialization(e.to_string()))
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during message encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Message exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur during message decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Zero-length payload
    Empty,
    /// Not a known message record
    Deserialization(String),
    /// Payload exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty payload"),
            DecodeError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            DecodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Outbound Queue
// ============================================================================

/// Messages waiting for the data channel to open
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<ProtocolMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message; `DISCONNECT` is never queued
    pub fn push(&mut self, msg: ProtocolMessage) -> bool {
        if !msg.is_queueable() {
            return false;
        }
        self.pending.push_back(msg);
        true
    }

    /// Take every queued message in send order
    pub fn drain(&mut self) -> Vec<ProtocolMessage> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ============================================================================
// Profile
// ============================================================================

/// Profile shared with the peer after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub interests: Option<String>,
    /// Creation time, milliseconds since the Unix epoch
    pub joined: u64,
}

impl Profile {
    /// Profile used when none is configured: `User` plus the last four
    /// characters of the local id
    pub fn default_for(local_id: &str) -> Self {
        let tail: Vec<char> = local_id.chars().rev().take(4).collect();
        let suffix: String = tail.into_iter().rev().collect();

        Profile {
            username: format!("User{}", suffix),
            age: None,
            location: None,
            interests: None,
            joined: unix_millis(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
