//! Client that streams a playback file to an ingestion server

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::server::SUCCESS_BODY;
use crate::config::PlayConfig;
use crate::error::{Result, WireReplayError};
use crate::execution::{ExecutionOptions, STREAM_CAPACITY, compute_play_at};
use crate::playback::{OpStream, PlaybackFileReader, RecordedOp};

/// Outcome of a send run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    /// Ops the server accepted
    pub ops_sent: u64,
    /// Ops the server answered with an error
    pub ops_rejected: u64,
}

/// Posts encoded ops to an ingestion server
#[derive(Clone)]
pub struct IngestClient {
    client: reqwest::Client,
    url: String,
}

impl IngestClient {
    /// Client for the server at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post one op; `Ok(false)` when the server rejected it
    pub async fn send(&self, op: &RecordedOp) -> Result<bool> {
        let body = op.to_bytes()?;
        let response = self
            .client
            .post(&self.url)
            .body(body)
            .send()
            .await
            .map_err(|e| WireReplayError::Http(format!("POST {} failed: {}", self.url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WireReplayError::Http(format!(
                "ingestion server returned {}: {}",
                status, text
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| WireReplayError::Http(format!("reading response failed: {}", e)))?;
        Ok(text == SUCCESS_BODY)
    }

    /// Post every op of `stream`, pacing like the replay scheduler
    ///
    /// Zero-timestamp ops abort the run. Every `queue_granularity` ops the
    /// sender waits until it is within `queue_time` of the op's play time.
    pub async fn send_stream(
        &self,
        mut stream: OpStream,
        options: &ExecutionOptions,
    ) -> Result<SendSummary> {
        let mut summary = SendSummary::default();
        let mut clock: Option<(DateTime<Utc>, Instant)> = None;
        let mut count = 0u64;

        let sent = async {
            while let Some(op) = stream.recv().await {
                if op.has_zero_seen() {
                    return Err(WireReplayError::ZeroTimestamp {
                        connection: op.seen_connection_num,
                        order: op.order,
                    });
                }
                count += 1;
                let (recording_start, playback_start) =
                    *clock.get_or_insert_with(|| (op.seen, Instant::now()));

                if !options.full_speed && count % options.queue_granularity.max(1) as u64 == 0 {
                    let play_at =
                        compute_play_at(playback_start, recording_start, op.seen, options.speed)?;
                    if let Some(wake) = play_at.checked_sub(options.queue_time) {
                        debug!(op_count = count, "Waiting to bound queued ops");
                        tokio::time::sleep_until(wake).await;
                    }
                }

                if self.send(&op).await? {
                    summary.ops_sent += 1;
                } else {
                    warn!(
                        connection = op.seen_connection_num,
                        order = op.order,
                        "Server rejected op"
                    );
                    summary.ops_rejected += 1;
                }
            }
            Ok::<(), WireReplayError>(())
        }
        .await;

        let ended = stream.finish().await;
        sent?;
        ended?;
        info!(
            ops_sent = summary.ops_sent,
            ops_rejected = summary.ops_rejected,
            url = %self.url,
            "Send complete"
        );
        Ok(summary)
    }
}

/// Stream a playback file to the ingestion server at `url`
pub async fn send_file(
    config: &PlayConfig,
    path: impl AsRef<Path>,
    url: &str,
) -> Result<SendSummary> {
    config.validate()?;
    let path = path.as_ref().to_path_buf();
    let gzip = config.gzip;
    let reader = tokio::task::spawn_blocking(move || PlaybackFileReader::open(&path, gzip))
        .await
        .map_err(|e| WireReplayError::Other(format!("playback reader task failed: {}", e)))??;

    let client = IngestClient::new(url);
    let options = ExecutionOptions::from(config);
    client
        .send_stream(reader.into_stream(config.repeat, STREAM_CAPACITY), &options)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{IngestState, ingest_router};
    use crate::playback::RawOp;
    use crate::wire::{MsgOp, Op};
    use bson::doc;
    use chrono::TimeZone;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn recorded(connection: i64, secs: i64) -> RecordedOp {
        let op = Op::Msg(MsgOp::from_document(&doc! { "find": "users", "$db": "app" }).unwrap());
        let seen = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        RecordedOp::new(RawOp::from_op(&op, 1, 0), seen, connection)
    }

    fn stream_of(ops: Vec<RecordedOp>) -> OpStream {
        let (tx, rx) = mpsc::channel(ops.len().max(1));
        for op in ops {
            tx.try_send(op).unwrap();
        }
        OpStream::from_receiver(rx)
    }

    async fn start_server() -> (String, mpsc::Receiver<RecordedOp>) {
        let (tx, rx) = mpsc::channel(16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, ingest_router(IngestState::new(tx)))
                .await
                .unwrap();
        });
        (format!("http://{}/", addr), rx)
    }

    #[tokio::test]
    async fn test_send_stream_delivers_ops() {
        let (url, mut rx) = start_server().await;
        let client = IngestClient::new(url);
        let options = ExecutionOptions {
            full_speed: true,
            ..ExecutionOptions::default()
        };

        let summary = client
            .send_stream(stream_of(vec![recorded(1, 0), recorded(2, 1)]), &options)
            .await
            .unwrap();
        assert_eq!(summary.ops_sent, 2);
        assert_eq!(summary.ops_rejected, 0);
        assert_eq!(rx.recv().await.unwrap().seen_connection_num, 1);
        assert_eq!(rx.recv().await.unwrap().seen_connection_num, 2);
    }

    #[tokio::test]
    async fn test_zero_timestamp_aborts_send() {
        let (url, _rx) = start_server().await;
        let mut bad = recorded(1, 0);
        bad.seen = DateTime::<Utc>::default();
        let err = IngestClient::new(url)
            .send_stream(stream_of(vec![bad]), &ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WireReplayError::ZeroTimestamp { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = IngestClient::new(format!("http://{}/", addr))
            .send(&recorded(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, WireReplayError::Http(_)));
    }
}
