//! Playback envelope types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::wire::{DecodeError, HEADER_LEN, MsgHeader, Op};

/// Format version written into new playback files
pub const PLAYBACK_FILE_VERSION: i32 = 1;

/// Header document at the start of a playback file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackFileMetadata {
    /// Envelope format version
    pub playback_file_version: i32,
    /// Driver-issued ops were removed when the file was written
    #[serde(default)]
    pub driver_ops_filtered: bool,
}

impl Default for PlaybackFileMetadata {
    fn default() -> Self {
        Self {
            playback_file_version: PLAYBACK_FILE_VERSION,
            driver_ops_filtered: false,
        }
    }
}

/// A still-encoded wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOp {
    /// Header as captured
    pub header: MsgHeader,
    /// Body bytes, stored as BSON binary
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl RawOp {
    /// Capture an op with the given header ids
    pub fn from_op(op: &Op, request_id: i32, response_to: i32) -> Self {
        let message = op.encode(request_id, response_to);
        let header = MsgHeader {
            message_length: message.len() as i32,
            request_id,
            response_to,
            op_code: op.opcode() as i32,
        };
        Self {
            header,
            body: message[HEADER_LEN..].to_vec(),
        }
    }

    /// Decode the body
    pub fn parse(&self) -> Result<Op, DecodeError> {
        Op::decode(&self.header, &self.body)
    }

    /// True when the recording saw this message travel server to client
    pub fn is_server_reply(&self) -> bool {
        self.header.is_server_reply()
    }
}

/// One recorded operation plus replay bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedOp {
    /// The captured message
    pub raw_op: RawOp,
    /// When the recording observed it; the epoch marks a corrupt entry
    #[serde(default)]
    pub seen: DateTime<Utc>,
    /// The connection closed here
    #[serde(default)]
    pub eof: bool,
    /// Client address
    #[serde(default)]
    pub src_endpoint: String,
    /// Server address
    #[serde(default)]
    pub dst_endpoint: String,
    /// Recording-time connection number
    #[serde(default)]
    pub seen_connection_num: i64,
    /// Replay-time connection number
    #[serde(default)]
    pub played_connection_num: i64,
    /// Repeat pass that produced this instance
    #[serde(default)]
    pub generation: i32,
    /// Position within the pass
    #[serde(default)]
    pub order: i64,
    /// Latency observed at recording time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_micros: Option<i64>,
    /// Target instant assigned by the scheduler
    #[serde(skip)]
    pub play_at: Option<Instant>,
}

impl RecordedOp {
    /// New envelope for a captured op
    pub fn new(raw_op: RawOp, seen: DateTime<Utc>, seen_connection_num: i64) -> Self {
        Self {
            raw_op,
            seen,
            eof: false,
            src_endpoint: String::new(),
            dst_endpoint: String::new(),
            seen_connection_num,
            played_connection_num: 0,
            generation: 0,
            order: 0,
            latency_micros: None,
            play_at: None,
        }
    }

    /// Connection-close marker
    pub fn eof_marker(seen: DateTime<Utc>, seen_connection_num: i64) -> Self {
        let raw_op = RawOp {
            header: MsgHeader::default(),
            body: Vec::new(),
        };
        Self {
            eof: true,
            ..Self::new(raw_op, seen, seen_connection_num)
        }
    }

    /// Builder: set endpoints
    pub fn with_endpoints(mut self, src: impl Into<String>, dst: impl Into<String>) -> Self {
        self.src_endpoint = src.into();
        self.dst_endpoint = dst.into();
        self
    }

    /// True when `seen` was never set
    pub fn has_zero_seen(&self) -> bool {
        self.seen == DateTime::<Utc>::default()
    }

    /// Encode as one playback document
    pub fn to_bytes(&self) -> Result<Vec<u8>, bson::ser::Error> {
        bson::to_vec(self)
    }

    /// Decode one playback document
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bson::de::Error> {
        bson::from_slice(bytes)
    }
}
