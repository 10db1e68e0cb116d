//! Per-connection execution unit

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::{CursorBindings, CursorRemap};
use crate::playback::RecordedOp;
use crate::session::Dialer;
use crate::stats::{OpStat, StatCollector};
use crate::wire::Op;

/// An op routed to a connection, decoded once by the dispatch loop
#[derive(Debug)]
pub(crate) struct Dispatched {
    pub recorded: RecordedOp,
    pub op: Op,
}

/// Everything one unit needs; owned by its task
pub(crate) struct ConnectionUnit {
    pub seen_connection_num: i64,
    pub played_connection_num: i64,
    pub dialer: Arc<dyn Dialer>,
    pub cursors: Option<Arc<CursorRemap>>,
    pub stats: Arc<StatCollector>,
    pub full_speed: bool,
    pub skip_driver_ops: bool,
    pub cancel: CancellationToken,
}

impl ConnectionUnit {
    /// Drain the queue until it closes, the session dies, or the run is cancelled
    pub async fn run(self, mut queue: mpsc::Receiver<Dispatched>) {
        let mut conn = match self.dialer.dial().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    connection = self.seen_connection_num,
                    error = %e,
                    "Dial failed, dropping connection pipeline"
                );
                return;
            }
        };
        debug!(
            connection = self.seen_connection_num,
            played = self.played_connection_num,
            "Connection pipeline started"
        );

        let mut bindings = CursorBindings::new();
        let mut last_live_cursor = 0i64;
        let mut executed = 0u64;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = queue.recv() => next,
            };
            let Some(Dispatched { recorded, mut op }) = next else {
                break;
            };

            if !self.full_speed {
                if let Some(play_at) = recorded.play_at {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(play_at) => {}
                    }
                }
            }

            if recorded.raw_op.is_server_reply() {
                if let Some(remap) = &self.cursors {
                    match bindings.learn(remap, &op, last_live_cursor) {
                        Ok(bound) if bound > 0 => debug!(
                            connection = self.seen_connection_num,
                            live_cursor = last_live_cursor,
                            bound,
                            "Bound recorded cursor to live cursor"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(
                            connection = self.seen_connection_num,
                            error = %e,
                            "Recorded reply has unreadable cursor ids"
                        ),
                    }
                }
                continue;
            }

            if self.skip_driver_ops && op.is_driver_op() {
                debug!(
                    connection = self.seen_connection_num,
                    order = recorded.order,
                    "Skipping driver-issued op"
                );
                last_live_cursor = 0;
                continue;
            }

            let mut errors = Vec::new();
            if let Some(remap) = &self.cursors {
                if let Err(e) = bindings.rewrite(remap, &mut op) {
                    errors.push(format!("cursor rewrite failed: {}", e));
                }
            }

            let played_at = Utc::now();
            let lag = recorded
                .play_at
                .map(|target| Instant::now().saturating_duration_since(target))
                .unwrap_or_default();
            let mut stat = self.stat_for(&recorded, &op, played_at, lag.as_micros() as u64);

            // a recorded reply only binds to the live reply of the request just before it
            last_live_cursor = 0;
            let result = op.execute(conn.as_mut()).await;
            executed += 1;
            match result {
                Ok(Some(reply)) => {
                    stat.latency_us = Some(reply.latency.as_micros() as u64);
                    stat.num_returned = reply.num_returned();
                    errors.extend(reply.errors());
                    last_live_cursor = reply.cursor_id();
                    stat.errors = errors;
                    self.stats.record(&stat);
                }
                Ok(None) => {
                    stat.errors = errors;
                    self.stats.record(&stat);
                }
                Err(e) if e.is_transport() => {
                    errors.push(e.to_string());
                    stat.errors = errors;
                    self.stats.record(&stat);
                    warn!(
                        connection = self.seen_connection_num,
                        order = recorded.order,
                        error = %e,
                        "Session failed, terminating connection pipeline"
                    );
                    break;
                }
                Err(e) => {
                    errors.push(e.to_string());
                    stat.errors = errors;
                    self.stats.record(&stat);
                }
            }
        }

        if let Err(e) = conn.close().await {
            debug!(connection = self.seen_connection_num, error = %e, "Close failed");
        }
        info!(
            connection = self.seen_connection_num,
            played = self.played_connection_num,
            op_count = executed,
            "Connection pipeline closed"
        );
    }

    fn stat_for(
        &self,
        recorded: &RecordedOp,
        op: &Op,
        played_at: chrono::DateTime<Utc>,
        play_lag_us: u64,
    ) -> OpStat {
        let metadata = op.metadata();
        OpStat {
            seen_connection_num: self.seen_connection_num,
            played_connection_num: self.played_connection_num,
            generation: recorded.generation,
            order: recorded.order,
            op_type: metadata.op,
            namespace: metadata.namespace,
            command: metadata.command,
            played_at,
            latency_us: None,
            play_lag_us,
            num_returned: 0,
            errors: Vec::new(),
        }
    }
}

