//! Traffic filtering and splitting
//!
//! Reads a playback file once, optionally drops driver-issued ops, and
//! routes every op to shard `seen_connection_num mod N`. All ops of one
//! recorded connection therefore land in the same output file, in recorded
//! order. Each shard is written by its own blocking worker; a shard that
//! receives nothing has its file removed.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::FilterConfig;
use crate::error::{Result, WireReplayError};
use crate::playback::{OpStream, PlaybackFileMetadata, PlaybackFileReader, PlaybackWriter, RecordedOp};

/// Queue depth between the splitter and each shard writer
pub const SHARD_QUEUE_CAPACITY: usize = 1000;

/// Shard an op belongs to
pub fn shard_index(seen_connection_num: i64, split: usize) -> usize {
    seen_connection_num.rem_euclid(split.max(1) as i64) as usize
}

/// Output paths for a validated config, one per shard
pub fn shard_paths(config: &FilterConfig) -> Vec<PathBuf> {
    if config.split <= 1 {
        return config.output_file.iter().cloned().collect();
    }
    let prefix = config.output_prefix.as_deref().unwrap_or_default();
    (0..config.split)
        .map(|i| PathBuf::from(format!("{}{:02}.playback", prefix, i)))
        .collect()
}

/// What one shard writer produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOutcome {
    /// Shard number
    pub index: usize,
    /// Output file, if file-backed
    pub path: Option<PathBuf>,
    /// Ops written
    pub ops_written: usize,
    /// The file was deleted because it received no ops
    pub removed: bool,
}

/// Totals of a filter run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSummary {
    /// Ops read from the input
    pub ops_read: u64,
    /// Driver-issued ops dropped
    pub ops_removed: u64,
    /// Per-shard results
    pub shards: Vec<ShardOutcome>,
}

impl FilterSummary {
    /// Shards that kept their output file
    pub fn non_empty_shards(&self) -> usize {
        self.shards.iter().filter(|s| !s.removed).count()
    }
}

/// Split `input` into the outputs named by `config`
pub async fn filter_file(config: &FilterConfig, input: impl AsRef<Path>) -> Result<FilterSummary> {
    config.validate()?;
    let input = input.as_ref().to_path_buf();
    let gzip = config.gzip;
    let reader = tokio::task::spawn_blocking(move || PlaybackFileReader::open(&input, gzip))
        .await
        .map_err(|e| WireReplayError::Other(format!("playback reader task failed: {}", e)))??;

    let metadata = PlaybackFileMetadata {
        driver_ops_filtered: config.remove_driver_ops || reader.metadata().driver_ops_filtered,
        ..PlaybackFileMetadata::default()
    };
    let mut writers = Vec::with_capacity(config.split);
    for path in shard_paths(config) {
        writers.push(PlaybackWriter::create(&path, config.gzip_output, &metadata)?);
    }

    info!(
        split = config.split,
        remove_driver_ops = config.remove_driver_ops,
        "Filtering playback file"
    );
    filter_stream(reader.into_stream(1, SHARD_QUEUE_CAPACITY), writers, config.remove_driver_ops)
        .await
}

/// Route every op of `stream` into one of `writers`
///
/// Every shard writer runs to completion even when another fails; their
/// errors are collected into one [`WireReplayError::Filter`].
pub async fn filter_stream(
    mut stream: OpStream,
    writers: Vec<PlaybackWriter>,
    remove_driver_ops: bool,
) -> Result<FilterSummary> {
    if writers.is_empty() {
        return Err(WireReplayError::Configuration(
            "at least one output is required".to_string(),
        ));
    }
    let split = writers.len();
    let (senders, workers): (Vec<_>, Vec<_>) = writers
        .into_iter()
        .enumerate()
        .map(|(index, writer)| {
            let (tx, rx) = mpsc::channel(SHARD_QUEUE_CAPACITY);
            (tx, spawn_shard(index, writer, rx))
        })
        .unzip();

    let mut summary = FilterSummary::default();
    let mut routed = Ok(());
    while let Some(op) = stream.recv().await {
        summary.ops_read += 1;
        if remove_driver_ops && !op.eof {
            match op.raw_op.parse() {
                Ok(parsed) if parsed.is_driver_op() => {
                    summary.ops_removed += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    routed = Err(WireReplayError::from(e));
                    break;
                }
            }
        }
        let index = shard_index(op.seen_connection_num, split);
        if senders[index].send(op).await.is_err() {
            warn!(shard = index, "Shard writer went away");
        }
    }
    let ended = stream.finish().await;
    drop(senders);

    let mut failures = Vec::new();
    for worker in workers {
        match worker.await {
            Ok(Ok(outcome)) => summary.shards.push(outcome),
            Ok(Err(e)) => failures.push(e.to_string()),
            Err(e) => failures.push(format!("shard writer panicked: {}", e)),
        }
    }

    routed?;
    let end = ended?;
    debug!(?end, "Filter input ended");

    if !failures.is_empty() {
        for failure in &failures {
            error!(error = %failure, "Shard writer failed");
        }
        return Err(WireReplayError::Filter(format!(
            "{} of {} shard writers failed: {}",
            failures.len(),
            split,
            failures.join("; ")
        )));
    }

    info!(
        ops_read = summary.ops_read,
        ops_removed = summary.ops_removed,
        non_empty = summary.non_empty_shards(),
        "Filter complete"
    );
    Ok(summary)
}

fn spawn_shard(
    index: usize,
    mut writer: PlaybackWriter,
    mut queue: mpsc::Receiver<RecordedOp>,
) -> JoinHandle<Result<ShardOutcome>> {
    tokio::task::spawn_blocking(move || {
        let mut failed = None;
        while let Some(op) = queue.blocking_recv() {
            if failed.is_some() {
                continue;
            }
            if let Err(e) = writer.write(&op) {
                failed = Some(e);
            }
        }

        let path = writer.path().map(Path::to_path_buf);
        let ops_written = writer.ops_written();
        let finished = writer.finish();
        if let Some(e) = failed {
            return Err(e);
        }
        finished?;

        let mut removed = false;
        if ops_written == 0 {
            if let Some(path) = &path {
                info!(shard = index, path = %path.display(), "No ops written, removing file");
                std::fs::remove_file(path)?;
                removed = true;
            }
        }
        Ok(ShardOutcome {
            index,
            path,
            ops_written,
            removed,
        })
    })
}
