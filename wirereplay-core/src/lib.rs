//! # WireReplay - Replay recorded database wire-protocol traffic
//!
//! WireReplay takes a capture of client/server traffic and plays it back
//! against a live server with the recorded timing:
//! - Binary wire-protocol decoding for every legacy opcode and sectioned messages
//! - Streamed playback files, optionally gzip-compressed, repeatable N times
//! - Cursor id remapping so recorded cursors follow the live server's ids
//! - One ordered pipeline per recorded connection, connections in parallel
//! - Per-op latency and error statistics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wirereplay_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = WireReplayConfig::load(None)?;
//!     let dialer = TcpDialer::new(&config.play.target, config.play.dial_retry_window)?;
//!     let stats = Arc::new(StatCollector::stdout(StatFormat::Json));
//!
//!     let summary = play_file(&config.play, "capture.playback", stats, Arc::new(dialer)).await?;
//!     println!("{} ops over {} connections", summary.ops_dispatched, summary.connections);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **wire**: the op model, decoding, encoding and cursor id access
//! - **playback**: the file format, repeat generations and the op stream
//! - **cursor**: the preprocessing pass and per-connection cursor bindings
//! - **session**: dialing and framing against the replay target
//! - **execution**: the dispatch loop and per-connection execution units
//! - **filter**: driver-op removal and splitting by connection
//! - **ingest**: HTTP server and client front ends
//! - **stats**: the per-op statistics sink

pub mod config;
pub mod cursor;
pub mod error;
pub mod execution;
pub mod filter;
pub mod ingest;
pub mod playback;
pub mod session;
pub mod stats;
pub mod wire;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        FilterConfig, PlayConfig, ServerConfig, StatsConfig, WireReplayConfig,
    };
    pub use crate::cursor::{CursorBindings, CursorRemap};
    pub use crate::error::{ErrorClass, Result, WireReplayError};
    pub use crate::execution::{
        ExecutionContext, ExecutionOptions, PlaybackSummary, compute_play_at, play_file,
    };
    pub use crate::filter::{FilterSummary, filter_file, filter_stream};
    pub use crate::ingest::{IngestClient, SendSummary, send_file, serve};
    pub use crate::playback::{
        OpStream, PlaybackFileMetadata, PlaybackFileReader, PlaybackSource, PlaybackWriter,
        RawOp, RecordedOp, SeekCapability, StreamEnd,
    };
    pub use crate::session::{Dialer, SessionError, TcpDialer, WireConnection};
    pub use crate::stats::{OpStat, StatCollector, StatFormat, StatsReport};
    pub use crate::wire::{DecodeError, MsgHeader, Op, OpCode, OpMetadata, Reply};
}
