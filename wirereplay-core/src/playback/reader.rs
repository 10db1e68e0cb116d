//! Streaming playback reader and the repeat-generation sequence

use std::io::{self, Read};
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::record::{PlaybackFileMetadata, RecordedOp};
use super::source::{PlaybackSource, SeekCapability};
use crate::error::{Result, WireReplayError};
use crate::wire::{DecodeError, MAX_DOCUMENT_SIZE, MIN_DOCUMENT_SIZE};

/// Read one length-prefixed document
///
/// Returns `None` at a clean end of input and also when the final document is
/// cut short, since an interrupted writer leaves exactly that behind.
pub fn read_document<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    let got = read_full(reader, &mut prefix)?;
    if got == 0 {
        return Ok(None);
    }
    if got < prefix.len() {
        warn!(bytes = got, "Truncated document length at end of input");
        return Ok(None);
    }

    let len = i32::from_le_bytes(prefix);
    if len < MIN_DOCUMENT_SIZE as i32 || len as usize > MAX_DOCUMENT_SIZE {
        return Err(DecodeError::InvalidDocumentLength(len as i64).into());
    }

    let mut doc = vec![0u8; len as usize];
    doc[..4].copy_from_slice(&prefix);
    let got = read_full(reader, &mut doc[4..])?;
    if got < doc.len() - 4 {
        warn!(
            expected = len,
            available = got + 4,
            "Truncated document at end of input"
        );
        return Ok(None);
    }
    Ok(Some(doc))
}

fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Sequential reader over a playback file
pub struct PlaybackFileReader {
    source: PlaybackSource,
    metadata: PlaybackFileMetadata,
    pending: Option<RecordedOp>,
}

impl PlaybackFileReader {
    /// Open a playback file and read its header
    pub fn open(path: impl AsRef<Path>, gzip: bool) -> Result<Self> {
        let path = path.as_ref();
        let source = PlaybackSource::open(path, gzip).map_err(|e| {
            WireReplayError::Io(io::Error::new(
                e.kind(),
                format!("error opening playback file {}: {}", path.display(), e),
            ))
        })?;
        Self::from_source(source)
    }

    /// Wrap an already-open source
    pub fn from_source(source: PlaybackSource) -> Result<Self> {
        let mut reader = Self {
            source,
            metadata: PlaybackFileMetadata::default(),
            pending: None,
        };
        reader.read_header()?;
        Ok(reader)
    }

    fn read_header(&mut self) -> Result<()> {
        self.pending = None;
        let Some(bytes) = read_document(&mut self.source)? else {
            self.metadata = PlaybackFileMetadata::default();
            return Ok(());
        };
        let doc = bson::Document::from_reader(bytes.as_slice())?;
        if doc.contains_key("playback_file_version") && !doc.contains_key("raw_op") {
            self.metadata = bson::from_document(doc)?;
        } else {
            // headerless file: the first document is already an op
            self.metadata = PlaybackFileMetadata::default();
            self.pending = Some(bson::from_document(doc)?);
        }
        Ok(())
    }

    /// Header facts
    pub fn metadata(&self) -> &PlaybackFileMetadata {
        &self.metadata
    }

    /// Rewind capability of the underlying source
    pub fn capability(&self) -> SeekCapability {
        self.source.capability()
    }

    /// Read the next op, `None` at end of file
    pub fn next_op(&mut self) -> Result<Option<RecordedOp>> {
        if let Some(op) = self.pending.take() {
            return Ok(Some(op));
        }
        match read_document(&mut self.source)? {
            Some(bytes) => Ok(Some(RecordedOp::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Position at the first op again
    pub fn seek_to_start(&mut self) -> Result<()> {
        if self.source.capability() == SeekCapability::None {
            return Err(WireReplayError::SeekUnsupported(format!(
                "{} does not support seeking to start",
                self.source.label()
            )));
        }
        self.source.rewind()?;
        self.read_header()
    }

    /// Lazy `repeat`-pass sequence starting at the current position
    pub fn generations(&mut self, repeat: i32) -> Generations<'_> {
        Generations::new(self, repeat)
    }

    /// Produce the generation sequence on a blocking worker
    pub fn into_stream(self, repeat: i32, capacity: usize) -> OpStream {
        OpStream::spawn(self, repeat, capacity)
    }
}

/// The `repeat`-pass op sequence
///
/// Timestamps of pass `g` are shifted by the summed spans of passes `0..g`,
/// giving one continuous timeline. Connection-close markers only pass through
/// on the final pass. Iteration ends with `None` after the final pass.
pub struct Generations<'a> {
    reader: &'a mut PlaybackFileReader,
    repeat: i32,
    generation: i32,
    order: i64,
    loop_delta: TimeDelta,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    done: bool,
}

impl<'a> Generations<'a> {
    fn new(reader: &'a mut PlaybackFileReader, repeat: i32) -> Self {
        Self {
            reader,
            repeat,
            generation: 0,
            order: 0,
            loop_delta: TimeDelta::zero(),
            first_seen: None,
            last_seen: None,
            done: repeat < 1,
        }
    }

    fn end_pass(&mut self) -> Option<Result<RecordedOp>> {
        if let (Some(first), Some(last)) = (self.first_seen, self.last_seen) {
            self.loop_delta += last - first;
        }
        self.first_seen = None;
        self.last_seen = None;
        debug!(generation = self.generation, "Finished playback pass");

        self.generation += 1;
        self.order = 0;
        if self.generation >= self.repeat {
            self.done = true;
            return None;
        }
        if let Err(e) = self.reader.seek_to_start() {
            self.done = true;
            return Some(Err(e));
        }
        None
    }
}

impl Iterator for Generations<'_> {
    type Item = Result<RecordedOp>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let mut op = match self.reader.next_op() {
                Ok(Some(op)) => op,
                Ok(None) => {
                    if let Some(err) = self.end_pass() {
                        return Some(err);
                    }
                    continue;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let order = self.order;
            self.order += 1;
            if !op.has_zero_seen() {
                self.last_seen = Some(op.seen);
                if self.first_seen.is_none() {
                    self.first_seen = Some(op.seen);
                }
                op.seen += self.loop_delta;
            }
            op.generation = self.generation;
            op.order = order;

            if op.eof && self.generation != self.repeat - 1 {
                continue;
            }
            return Some(Ok(op));
        }
    }
}

/// How an op stream ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Every pass over the file completed
    EndOfFile,
    /// The producing side closed its channel
    InputClosed,
}

/// Ops delivered over a bounded channel, plus the producer's outcome
pub struct OpStream {
    receiver: mpsc::Receiver<RecordedOp>,
    worker: Option<JoinHandle<Result<StreamEnd>>>,
}

impl OpStream {
    fn spawn(mut reader: PlaybackFileReader, repeat: i32, capacity: usize) -> Self {
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || {
            for item in reader.generations(repeat) {
                if tx.blocking_send(item?).is_err() {
                    debug!("Op stream consumer went away");
                    break;
                }
            }
            Ok(StreamEnd::EndOfFile)
        });
        Self {
            receiver,
            worker: Some(worker),
        }
    }

    /// Ops pushed by another producer, e.g. the HTTP ingestion endpoint
    pub fn from_receiver(receiver: mpsc::Receiver<RecordedOp>) -> Self {
        Self {
            receiver,
            worker: None,
        }
    }

    /// Next op; `None` once the producer is done
    pub async fn recv(&mut self) -> Option<RecordedOp> {
        self.receiver.recv().await
    }

    /// Stop consuming and report how the producer ended
    pub async fn finish(self) -> Result<StreamEnd> {
        drop(self.receiver);
        match self.worker {
            Some(worker) => worker
                .await
                .map_err(|e| WireReplayError::Other(format!("playback reader task failed: {}", e)))?,
            None => Ok(StreamEnd::InputClosed),
        }
    }
}
