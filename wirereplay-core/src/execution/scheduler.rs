//! Dispatch loop and the file replay entry point

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{ConnectionUnit, Dispatched};
use super::{ExecutionContext, ExecutionOptions, PlaybackSummary};
use crate::config::PlayConfig;
use crate::cursor::CursorRemap;
use crate::error::{Result, WireReplayError};
use crate::playback::{OpStream, PlaybackFileReader};
use crate::session::Dialer;
use crate::stats::StatCollector;

/// Capacity of the channel between the file reader and the dispatch loop
pub const STREAM_CAPACITY: usize = 1000;

/// Target instant for an op seen at `seen`
///
/// Gaps between recorded timestamps are divided by `speed`; the first op of a
/// run plays at `playback_start`. Ops recorded before `recording_start` play
/// immediately. A scaled gap that does not fit in the clock is an error.
pub fn compute_play_at(
    playback_start: Instant,
    recording_start: DateTime<Utc>,
    seen: DateTime<Utc>,
    speed: f64,
) -> Result<Instant> {
    let offset = (seen - recording_start).to_std().unwrap_or(Duration::ZERO);
    Duration::try_from_secs_f64(offset.as_secs_f64() / speed)
        .ok()
        .and_then(|scaled| playback_start.checked_add(scaled))
        .ok_or_else(|| {
            WireReplayError::Configuration(format!(
                "op seen {:?} after the first cannot be scheduled at speed {}",
                offset, speed
            ))
        })
}

struct Pipeline {
    sender: mpsc::Sender<Dispatched>,
    played_connection_num: i64,
}

#[derive(Default)]
struct DispatchCounters {
    dispatched: u64,
    closed: u64,
    connections: i64,
}

impl ExecutionContext {
    /// Replay every op of `stream` against the target
    ///
    /// Returns once every connection pipeline has drained. A zero timestamp,
    /// an op that does not decode, or a failing input stream cancels all
    /// pipelines and is returned as the error. The stats sink is closed in
    /// both cases. A context plays one stream.
    pub async fn play(&self, mut stream: OpStream) -> Result<PlaybackSummary> {
        let started = Instant::now();
        let mut connections = HashMap::new();
        let mut counters = DispatchCounters::default();

        let outcome = match self.dispatch(&mut stream, &mut connections, &mut counters).await {
            Ok(()) => stream.finish().await.map(|end| debug!(?end, "Op stream ended")),
            Err(e) => {
                if let Err(stream_err) = stream.finish().await {
                    debug!(error = %stream_err, "Op stream also failed");
                }
                Err(e)
            }
        };

        if let Err(e) = &outcome {
            warn!(error = %e, "Aborting replay");
            self.cancel.cancel();
        }
        drop(connections);
        self.tracker.close();
        self.tracker.wait().await;

        let report = self.stats.close();
        outcome?;
        let stats = report?;

        let summary = PlaybackSummary {
            ops_dispatched: counters.dispatched,
            connections_closed: counters.closed,
            connections: counters.connections,
            elapsed: started.elapsed(),
            stats,
        };
        info!(
            op_count = summary.ops_dispatched,
            connections = summary.connections,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Replay complete"
        );
        Ok(summary)
    }

    async fn dispatch(
        &self,
        stream: &mut OpStream,
        connections: &mut HashMap<i64, Pipeline>,
        counters: &mut DispatchCounters,
    ) -> Result<()> {
        let ExecutionOptions {
            speed,
            full_speed,
            queue_time,
            queue_granularity,
            connection_buffer,
            skip_driver_ops,
        } = self.options.clone();
        let mut clock: Option<(DateTime<Utc>, Instant)> = None;

        while let Some(mut recorded) = stream.recv().await {
            if recorded.has_zero_seen() {
                return Err(WireReplayError::ZeroTimestamp {
                    connection: recorded.seen_connection_num,
                    order: recorded.order,
                });
            }
            let (recording_start, playback_start) =
                *clock.get_or_insert_with(|| (recorded.seen, Instant::now()));
            let play_at =
                compute_play_at(playback_start, recording_start, recorded.seen, speed)?;
            recorded.play_at = Some(play_at);

            if recorded.eof {
                counters.closed += 1;
                if connections.remove(&recorded.seen_connection_num).is_some() {
                    debug!(
                        connection = recorded.seen_connection_num,
                        generation = recorded.generation,
                        "Connection draining"
                    );
                }
                continue;
            }

            let op = recorded.raw_op.parse()?;
            let pipeline = match connections.entry(recorded.seen_connection_num) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    counters.connections += 1;
                    let (sender, queue) = mpsc::channel(connection_buffer.max(1));
                    let unit = ConnectionUnit {
                        seen_connection_num: recorded.seen_connection_num,
                        played_connection_num: counters.connections,
                        dialer: Arc::clone(&self.dialer),
                        cursors: self.cursors.clone(),
                        stats: Arc::clone(&self.stats),
                        full_speed,
                        skip_driver_ops,
                        cancel: self.cancel.child_token(),
                    };
                    self.tracker.spawn(unit.run(queue));
                    entry.insert(Pipeline {
                        sender,
                        played_connection_num: counters.connections,
                    })
                }
            };
            recorded.played_connection_num = pipeline.played_connection_num;

            let connection = recorded.seen_connection_num;
            if pipeline.sender.send(Dispatched { recorded, op }).await.is_err() {
                debug!(connection, "Connection pipeline gone, dropping op");
            }
            counters.dispatched += 1;

            if !full_speed && counters.dispatched % queue_granularity.max(1) as u64 == 0 {
                if let Some(wake) = play_at.checked_sub(queue_time) {
                    tokio::time::sleep_until(wake).await;
                }
            }
        }
        Ok(())
    }
}

/// Replay a playback file against the configured target
///
/// Opens the file, runs cursor preprocessing when enabled, checks that the
/// target is reachable, then plays `repeat` generations.
pub async fn play_file(
    config: &PlayConfig,
    path: impl AsRef<Path>,
    stats: Arc<StatCollector>,
    dialer: Arc<dyn Dialer>,
) -> Result<PlaybackSummary> {
    config.validate()?;
    let path = path.as_ref().to_path_buf();
    let gzip = config.gzip;
    let preprocess = config.preprocess;

    let (reader, remap) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut reader = PlaybackFileReader::open(&path, gzip)?;
        let remap = if preprocess {
            Some(CursorRemap::build(&mut reader)?)
        } else {
            None
        };
        Ok((reader, remap))
    })
    .await
    .map_err(|e| WireReplayError::Other(format!("preprocessing task failed: {}", e)))??;

    let mut options = ExecutionOptions::from(config);
    options.skip_driver_ops = !reader.metadata().driver_ops_filtered;

    let mut context = ExecutionContext::new(dialer, stats, options);
    if let Some(remap) = remap {
        context = context.with_cursor_remap(remap);
    }
    context.probe().await?;

    info!(
        repeat = config.repeat,
        speed = config.speed,
        full_speed = config.full_speed,
        "Starting replay"
    );
    context.play(reader.into_stream(config.repeat, STREAM_CAPACITY)).await
}
