//! Replay execution
//!
//! One dispatch loop reads the op stream in file order, assigns every op its
//! target play time, and routes it to the pipeline for its recorded
//! connection. Each pipeline is a bounded queue drained by a single task that
//! owns one live session, so ops on a connection run strictly in recorded
//! order while connections run in parallel.
//!
//! # Architecture
//!
//! ```text
//! OpStream ──► dispatch loop ──► [queue] ──► connection unit ──► target
//!                   │        └─► [queue] ──► connection unit ──► target
//!                   └─ pacing                        │
//!                                                    └─► StatCollector
//! ```

mod connection;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::PlayConfig;
use crate::cursor::CursorRemap;
use crate::error::{Result, WireReplayError};
use crate::session::Dialer;
use crate::stats::{StatCollector, StatsReport};

pub use scheduler::{STREAM_CAPACITY, compute_play_at, play_file};

/// Timing and buffering knobs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOptions {
    /// Time multiplier
    pub speed: f64,
    /// Ignore timing entirely
    pub full_speed: bool,
    /// Look-ahead bound between dispatch and play time
    pub queue_time: Duration,
    /// Ops dispatched between pacing checks
    pub queue_granularity: usize,
    /// Per-connection queue capacity
    pub connection_buffer: usize,
    /// Skip handshake and heartbeat commands
    pub skip_driver_ops: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from(&PlayConfig::default())
    }
}

impl From<&PlayConfig> for ExecutionOptions {
    fn from(config: &PlayConfig) -> Self {
        Self {
            speed: config.speed,
            full_speed: config.full_speed,
            queue_time: config.queue_time,
            queue_granularity: config.queue_granularity.max(1),
            connection_buffer: config.connection_buffer.max(1),
            skip_driver_ops: true,
        }
    }
}

/// Aggregate outcome of a replay run
#[derive(Debug, Clone)]
pub struct PlaybackSummary {
    /// Ops handed to connection pipelines
    pub ops_dispatched: u64,
    /// Connection-close markers processed
    pub connections_closed: u64,
    /// Pipelines opened
    pub connections: i64,
    /// Wall time from first op to drain
    pub elapsed: Duration,
    /// Stats sink totals
    pub stats: StatsReport,
}

/// State shared by the dispatch loop and every connection unit of one run
pub struct ExecutionContext {
    dialer: Arc<dyn Dialer>,
    cursors: Option<Arc<CursorRemap>>,
    stats: Arc<StatCollector>,
    options: ExecutionOptions,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Create a context for one run
    pub fn new(dialer: Arc<dyn Dialer>, stats: Arc<StatCollector>, options: ExecutionOptions) -> Self {
        Self {
            dialer,
            cursors: None,
            stats,
            options,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builder: rewrite cursor ids with a preprocessed table
    pub fn with_cursor_remap(mut self, remap: CursorRemap) -> Self {
        self.cursors = Some(Arc::new(remap));
        self
    }

    /// Options in effect
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// The stats sink
    pub fn stats(&self) -> &Arc<StatCollector> {
        &self.stats
    }

    /// Token cancelled when the run aborts
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Dial the target once so an unreachable server fails the run up front
    pub async fn probe(&self) -> Result<()> {
        let mut conn = self
            .dialer
            .dial()
            .await
            .map_err(|e| WireReplayError::Transport(format!("cannot reach replay target: {}", e)))?;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Probe connection close failed");
        }
        info!("Replay target reachable");
        Ok(())
    }
}
