//! Append-only playback writer

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use super::record::{PlaybackFileMetadata, RecordedOp};
use crate::error::Result;

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Other(Box<dyn Write + Send>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w,
            Sink::Other(w) => w,
        }
    }
}

/// Writes a header followed by one document per op
///
/// A failed write leaves whatever reached the file in place; readers treat a
/// cut-short final document as end of file.
pub struct PlaybackWriter {
    sink: Sink,
    path: Option<PathBuf>,
    ops_written: usize,
}

impl PlaybackWriter {
    /// Create (or truncate) a file and write its header
    pub fn create(
        path: impl AsRef<Path>,
        gzip: bool,
        metadata: &PlaybackFileMetadata,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = BufWriter::new(File::create(path)?);
        let sink = if gzip {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };
        let mut writer = Self {
            sink,
            path: Some(path.to_path_buf()),
            ops_written: 0,
        };
        writer.write_header(metadata)?;
        Ok(writer)
    }

    /// Write into an arbitrary sink
    pub fn from_writer(
        writer: impl Write + Send + 'static,
        metadata: &PlaybackFileMetadata,
    ) -> Result<Self> {
        let mut writer = Self {
            sink: Sink::Other(Box::new(writer)),
            path: None,
            ops_written: 0,
        };
        writer.write_header(metadata)?;
        Ok(writer)
    }

    fn write_header(&mut self, metadata: &PlaybackFileMetadata) -> Result<()> {
        let bytes = bson::to_vec(metadata)?;
        self.sink.writer().write_all(&bytes)?;
        Ok(())
    }

    /// Append one op
    pub fn write(&mut self, op: &RecordedOp) -> Result<()> {
        let bytes = op.to_bytes()?;
        self.sink.writer().write_all(&bytes)?;
        self.ops_written += 1;
        Ok(())
    }

    /// Ops appended so far
    pub fn ops_written(&self) -> usize {
        self.ops_written
    }

    /// Output path, for file-backed writers
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flush everything (and the gzip trailer); returns the op count
    pub fn finish(self) -> Result<usize> {
        match self.sink {
            Sink::Plain(mut w) => w.flush()?,
            Sink::Gzip(w) => w.finish()?.flush()?,
            Sink::Other(mut w) => w.flush()?,
        }
        Ok(self.ops_written)
    }
}
