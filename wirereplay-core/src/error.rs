//! Error types for WireReplay operations

use serde::{Deserialize, Serialize};

use crate::session::SessionError;
use crate::wire::DecodeError;

/// Result type for WireReplay operations
pub type Result<T> = std::result::Result<T, WireReplayError>;

/// Coarse classification used to decide whether a failure aborts the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Input is unusable; fatal to the whole run, never retried
    Corruption,
    /// Rejected before any I/O begins
    Configuration,
    /// Network failure; fatal to one pipeline, or to the run before any pipeline exists
    Transport,
    /// Anything reported while executing a single op
    Execution,
}

/// Error types for the replay engine
#[derive(Debug, thiserror::Error)]
pub enum WireReplayError {
    /// A wire message or playback document could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An op carried the zero timestamp and cannot be scheduled
    #[error("Can't play operation found with zero-timestamp (connection {connection}, order {order})")]
    ZeroTimestamp {
        /// Connection the op was recorded under
        connection: i64,
        /// Intra-generation order of the op
        order: i64,
    },

    /// Invalid flags or configuration values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dial or socket failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The input source cannot rewind
    #[error("Seek unsupported: {0}")]
    SeekUnsupported(String),

    /// Playback envelope could not be decoded
    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    /// Playback envelope could not be encoded
    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    /// Serialization error for reports
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP front end failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// One or more filter shards failed
    #[error("Filter error: {0}")]
    Filter(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl WireReplayError {
    /// Map this error onto the replay failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            WireReplayError::Decode(_)
            | WireReplayError::ZeroTimestamp { .. }
            | WireReplayError::BsonDecode(_) => ErrorClass::Corruption,
            WireReplayError::Configuration(_) | WireReplayError::SeekUnsupported(_) => {
                ErrorClass::Configuration
            }
            WireReplayError::Transport(_) | WireReplayError::Http(_) | WireReplayError::Io(_) => {
                ErrorClass::Transport
            }
            WireReplayError::BsonEncode(_)
            | WireReplayError::Serialization(_)
            | WireReplayError::Filter(_)
            | WireReplayError::Other(_) => ErrorClass::Execution,
        }
    }

    /// True when the run must stop immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Corruption | ErrorClass::Configuration
        )
    }
}

impl From<SessionError> for WireReplayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Decode(e) => WireReplayError::Decode(e),
            other => WireReplayError::Transport(other.to_string()),
        }
    }
}

impl From<String> for WireReplayError {
    fn from(s: String) -> Self {
        WireReplayError::Other(s)
    }
}

impl From<&str> for WireReplayError {
    fn from(s: &str) -> Self {
        WireReplayError::Other(s.to_string())
    }
}
