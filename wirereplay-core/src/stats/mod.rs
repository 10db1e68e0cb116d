//! Per-op replay statistics
//!
//! Execution units hand one [`OpStat`] per executed op to a shared
//! [`StatCollector`]. Each record is written as a single line under the
//! collector's lock, so lines from different connections never interleave.

mod export;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, WireReplayError};

pub use export::StatExporter;

/// Output format for per-op records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatFormat {
    /// One JSON object per line
    Json,
    /// One human-readable line per op
    Text,
    /// Counters only
    #[default]
    None,
}

impl FromStr for StatFormat {
    type Err = WireReplayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(StatFormat::Json),
            "text" => Ok(StatFormat::Text),
            "none" => Ok(StatFormat::None),
            other => Err(WireReplayError::Configuration(format!(
                "unknown stats format {:?} (expected json, text or none)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for StatFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatFormat::Json => "json",
            StatFormat::Text => "text",
            StatFormat::None => "none",
        };
        f.write_str(name)
    }
}

/// Outcome of one replayed op
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpStat {
    /// Recording-time connection
    pub seen_connection_num: i64,
    /// Replay-time connection
    pub played_connection_num: i64,
    /// Repeat pass
    pub generation: i32,
    /// Position within the pass
    pub order: i64,
    /// Operation kind
    pub op_type: String,
    /// Target namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Command name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Wall-clock time the op was sent
    pub played_at: DateTime<Utc>,
    /// Send-to-reply latency, for ops with a reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_us: Option<u64>,
    /// How late the op was sent relative to its target time
    pub play_lag_us: u64,
    /// Documents returned
    pub num_returned: usize,
    /// Errors reported by the server or the transport
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl OpStat {
    /// Latency as a duration
    pub fn latency(&self) -> Option<Duration> {
        self.latency_us.map(Duration::from_micros)
    }
}

/// Totals produced when the collector closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    /// Identifier of this replay run
    pub run_id: Uuid,
    /// Collector creation time
    pub started_at: DateTime<Utc>,
    /// Close time
    pub finished_at: DateTime<Utc>,
    /// Ops recorded
    pub ops_recorded: u64,
    /// Ops that reported at least one error
    pub ops_with_errors: u64,
    /// Summed latency of ops with a reply
    pub total_latency_us: u64,
    /// Mean latency of ops with a reply
    pub mean_latency_us: u64,
    /// Largest latency seen
    pub max_latency_us: u64,
}

struct StatState {
    out: Option<Box<dyn Write + Send>>,
    ops: u64,
    errors: u64,
    latency_samples: u64,
    total_latency_us: u64,
    max_latency_us: u64,
    closed: bool,
}

/// Shared sink for [`OpStat`] records
pub struct StatCollector {
    format: StatFormat,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    state: Mutex<StatState>,
}

impl StatCollector {
    /// Collector writing to an arbitrary sink
    pub fn new(format: StatFormat, out: Box<dyn Write + Send>) -> Self {
        let out = match format {
            StatFormat::None => None,
            _ => Some(out),
        };
        Self {
            format,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: Mutex::new(StatState {
                out,
                ops: 0,
                errors: 0,
                latency_samples: 0,
                total_latency_us: 0,
                max_latency_us: 0,
                closed: false,
            }),
        }
    }

    /// Collector writing to stdout
    pub fn stdout(format: StatFormat) -> Self {
        Self::new(format, Box::new(std::io::stdout()))
    }

    /// Collector writing to a file
    pub fn to_file(path: impl AsRef<Path>, format: StatFormat) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(format, Box::new(BufWriter::new(file))))
    }

    /// Collector that only counts
    pub fn counting() -> Self {
        Self::new(StatFormat::None, Box::new(std::io::sink()))
    }

    /// Configured format
    pub fn format(&self) -> StatFormat {
        self.format
    }

    /// Identifier of this run
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, StatState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add one record
    pub fn record(&self, stat: &OpStat) {
        let line = match self.format {
            StatFormat::Json => match StatExporter::to_json_line(stat) {
                Ok(line) => Some(line),
                Err(e) => {
                    warn!(error = %e, "Failed to serialize op stat");
                    None
                }
            },
            StatFormat::Text => Some(StatExporter::to_text_line(stat)),
            StatFormat::None => None,
        };

        let mut state = self.lock();
        if state.closed {
            warn!(order = stat.order, "Op stat recorded after close");
            return;
        }
        state.ops += 1;
        if !stat.errors.is_empty() {
            state.errors += 1;
        }
        if let Some(latency) = stat.latency_us {
            state.latency_samples += 1;
            state.total_latency_us += latency;
            state.max_latency_us = state.max_latency_us.max(latency);
        }
        if let (Some(line), Some(out)) = (line, state.out.as_mut()) {
            if let Err(e) = out.write_all(format!("{}\n", line).as_bytes()) {
                warn!(error = %e, "Failed to write op stat");
            }
        }
    }

    /// Totals so far
    pub fn snapshot(&self) -> StatsReport {
        let state = self.lock();
        self.report_from(&state)
    }

    fn report_from(&self, state: &StatState) -> StatsReport {
        StatsReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            ops_recorded: state.ops,
            ops_with_errors: state.errors,
            total_latency_us: state.total_latency_us,
            mean_latency_us: state
                .total_latency_us
                .checked_div(state.latency_samples)
                .unwrap_or(0),
            max_latency_us: state.max_latency_us,
        }
    }

    /// Write the summary, flush, and stop accepting records
    pub fn close(&self) -> Result<StatsReport> {
        let mut state = self.lock();
        let report = self.report_from(&state);
        if state.closed {
            return Ok(report);
        }
        state.closed = true;
        let summary = match self.format {
            StatFormat::Json => Some(StatExporter::to_json_summary(&report)?),
            StatFormat::Text => Some(StatExporter::to_summary(&report)),
            StatFormat::None => None,
        };
        if let Some(out) = state.out.as_mut() {
            if let Some(summary) = summary {
                out.write_all(format!("{}\n", summary).as_bytes())?;
            }
            out.flush()?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests;
