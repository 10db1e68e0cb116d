//! Byte sources for playback files
//!
//! Each source declares how far it can rewind. Plain files and in-memory
//! buffers seek freely; gzip files restart decompression from the raw file;
//! pipes and request bodies cannot rewind at all.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

/// How far a source can rewind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekCapability {
    /// Arbitrary seeks
    Full,
    /// Back to the start only, by reopening
    StartOnly,
    /// Forward only
    None,
}

enum Inner {
    File(BufReader<File>),
    Gzip {
        path: PathBuf,
        decoder: BufReader<MultiGzDecoder<File>>,
    },
    Memory(Cursor<Vec<u8>>),
    Stream(Box<dyn Read + Send>),
}

/// Readable playback input with an explicit rewind capability
pub struct PlaybackSource {
    inner: Inner,
    label: String,
}

impl PlaybackSource {
    /// Open a file, decompressing it when `gzip` is set
    pub fn open(path: impl AsRef<Path>, gzip: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let inner = if gzip {
            Inner::Gzip {
                path: path.to_path_buf(),
                decoder: BufReader::new(MultiGzDecoder::new(file)),
            }
        } else {
            Inner::File(BufReader::new(file))
        };
        Ok(Self {
            inner,
            label: path.display().to_string(),
        })
    }

    /// In-memory bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Inner::Memory(Cursor::new(bytes)),
            label: "<memory>".to_string(),
        }
    }

    /// A forward-only stream such as stdin
    pub fn from_reader(reader: impl Read + Send + 'static, label: impl Into<String>) -> Self {
        Self {
            inner: Inner::Stream(Box::new(reader)),
            label: label.into(),
        }
    }

    /// Rewind capability
    pub fn capability(&self) -> SeekCapability {
        match self.inner {
            Inner::File(_) | Inner::Memory(_) => SeekCapability::Full,
            Inner::Gzip { .. } => SeekCapability::StartOnly,
            Inner::Stream(_) => SeekCapability::None,
        }
    }

    /// Name used in logs and errors
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Return to byte zero of the (decompressed) content
    pub fn rewind(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::File(file) => file.seek(SeekFrom::Start(0)).map(|_| ()),
            Inner::Memory(cursor) => {
                cursor.set_position(0);
                Ok(())
            }
            Inner::Gzip { path, decoder } => {
                let file = File::open(&*path)?;
                *decoder = BufReader::new(MultiGzDecoder::new(file));
                Ok(())
            }
            Inner::Stream(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} cannot be rewound", self.label),
            )),
        }
    }
}

impl Read for PlaybackSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::File(file) => file.read(buf),
            Inner::Gzip { decoder, .. } => decoder.read(buf),
            Inner::Memory(cursor) => cursor.read(buf),
            Inner::Stream(stream) => stream.read(buf),
        }
    }
}
