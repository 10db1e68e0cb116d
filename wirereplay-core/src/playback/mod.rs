//! Playback file format
//!
//! A playback file is a flat concatenation of BSON documents: one
//! [`PlaybackFileMetadata`] header, then one [`RecordedOp`] envelope per
//! captured message. There is no index or trailer, so reading is sequential
//! and rewinding means going back to the first op.
//!
//! # Example
//!
//! ```rust,no_run
//! use wirereplay_core::playback::PlaybackFileReader;
//!
//! # fn demo() -> wirereplay_core::error::Result<()> {
//! let mut reader = PlaybackFileReader::open("capture.playback", false)?;
//! for op in reader.generations(2) {
//!     let op = op?;
//!     println!("{} {} {}", op.generation, op.order, op.seen);
//! }
//! # Ok(())
//! # }
//! ```

mod reader;
mod record;
mod source;
mod writer;

pub use reader::{Generations, OpStream, PlaybackFileReader, StreamEnd, read_document};
pub use record::{PLAYBACK_FILE_VERSION, PlaybackFileMetadata, RawOp, RecordedOp};
pub use source::{PlaybackSource, SeekCapability};
pub use writer::PlaybackWriter;
