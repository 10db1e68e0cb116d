//! Byte-level readers and writers shared by every op variant
//!
//! Decoding is strictly size-driven: every read is checked against the bytes
//! still available in the body, and the caller compares the total consumed
//! against the header's declared length.

use std::fmt;

use bson::Document;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the fixed message header
pub const HEADER_LEN: usize = 16;

/// Largest document accepted from a message body or a playback file
pub const MAX_DOCUMENT_SIZE: usize = 48 * 1024 * 1024;

/// Smallest well-formed BSON document (length prefix plus terminator)
pub const MIN_DOCUMENT_SIZE: usize = 5;

/// Errors raised while decoding (or rewriting) wire messages
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes remained than a field requires
    #[error("truncated {context}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Field being read
        context: &'static str,
        /// Bytes the field needs
        needed: usize,
        /// Bytes left in the body
        available: usize,
    },

    /// The decoder consumed a different number of bytes than the header declared
    #[error("message length mismatch: header declares {declared} body bytes, decoder consumed {consumed}")]
    LengthMismatch {
        /// Body length from the header
        declared: usize,
        /// Bytes actually consumed
        consumed: usize,
    },

    /// Header length smaller than the header itself, or absurdly large
    #[error("invalid message length {0}")]
    InvalidMessageLength(i32),

    /// Opcode outside the supported set
    #[error("unknown opcode {0}")]
    UnknownOpCode(i32),

    /// Document length prefix out of range
    #[error("invalid document length {0}")]
    InvalidDocumentLength(i64),

    /// Document bytes are not valid BSON
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Kill-cursors count does not match the bytes present
    #[error("kill-cursors declares {declared} cursor ids but {remaining} bytes remain")]
    CursorCountMismatch {
        /// Count from the body
        declared: i32,
        /// Bytes left after the count
        remaining: usize,
    },

    /// C string missing its terminator
    #[error("unterminated C string in {0}")]
    UnterminatedCString(&'static str),

    /// C string is not UTF-8
    #[error("C string in {0} is not valid UTF-8")]
    InvalidCString(&'static str),

    /// Sectioned message used an unknown section kind
    #[error("unknown section kind {0}")]
    UnknownSectionKind(u8),

    /// Sections did not line up with the declared sizes
    #[error("section overrun: declared {declared} bytes, read {read}")]
    SectionOverrun {
        /// Size the section (or section area) declared
        declared: usize,
        /// Bytes actually read
        read: usize,
    },

    /// Replacement cursor ids did not match the ids the op carries
    #[error("cursor rewrite expects {expected} ids, got {actual}")]
    CursorRewrite {
        /// Ids the op references
        expected: usize,
        /// Ids supplied
        actual: usize,
    },

    /// Underlying reader failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated, still-encoded BSON document
///
/// Kept as bytes so legacy ops re-encode byte-for-byte.
#[derive(Clone, PartialEq, Eq)]
pub struct RawDoc(Vec<u8>);

impl RawDoc {
    /// Wrap bytes after checking the length prefix and terminator
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DecodeError> {
        if bytes.len() < MIN_DOCUMENT_SIZE {
            return Err(DecodeError::InvalidDocumentLength(bytes.len() as i64));
        }
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if declared as i64 != bytes.len() as i64 {
            return Err(DecodeError::InvalidDocumentLength(declared as i64));
        }
        if bytes[bytes.len() - 1] != 0 {
            return Err(DecodeError::InvalidDocument(
                "document is missing its terminator".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Encode a document
    pub fn from_document(doc: &Document) -> Result<Self, DecodeError> {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes)
            .map_err(|e| DecodeError::InvalidDocument(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Parse into an owned document
    pub fn to_document(&self) -> Result<Document, DecodeError> {
        Document::from_reader(self.0.as_slice())
            .map_err(|e| DecodeError::InvalidDocument(e.to_string()))
    }

    /// Raw bytes, length prefix included
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded size
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a validated document, kept for API symmetry
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RawDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_document() {
            Ok(doc) => write!(f, "{}", doc),
            Err(_) => write!(f, "RawDoc({} bytes)", self.0.len()),
        }
    }
}

/// Cursor over a message body with exact byte accounting
pub struct BodyReader<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> BodyReader<'a> {
    /// Start reading a body
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, consumed: 0 }
    }

    /// Bytes consumed so far
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// True once every byte was consumed
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, needed: usize, context: &'static str) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                context,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read one byte
    pub fn read_u8(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        self.need(1, context)?;
        self.consumed += 1;
        Ok(self.buf.get_u8())
    }

    /// Read a little-endian i32
    pub fn read_i32(&mut self, context: &'static str) -> Result<i32, DecodeError> {
        self.need(4, context)?;
        self.consumed += 4;
        Ok(self.buf.get_i32_le())
    }

    /// Read a little-endian u32
    pub fn read_u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        self.need(4, context)?;
        self.consumed += 4;
        Ok(self.buf.get_u32_le())
    }

    /// Read a little-endian i64
    pub fn read_i64(&mut self, context: &'static str) -> Result<i64, DecodeError> {
        self.need(8, context)?;
        self.consumed += 8;
        Ok(self.buf.get_i64_le())
    }

    /// Read a NUL-terminated UTF-8 string; the terminator is consumed
    pub fn read_cstring(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::UnterminatedCString(context))?;
        let value = std::str::from_utf8(&self.buf[..end])
            .map_err(|_| DecodeError::InvalidCString(context))?
            .to_string();
        self.buf.advance(end + 1);
        self.consumed += end + 1;
        Ok(value)
    }

    /// Read one length-prefixed document
    pub fn read_document(&mut self, context: &'static str) -> Result<RawDoc, DecodeError> {
        self.need(4, context)?;
        let declared = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if declared < MIN_DOCUMENT_SIZE as i32 || declared as usize > MAX_DOCUMENT_SIZE {
            return Err(DecodeError::InvalidDocumentLength(declared as i64));
        }
        let len = declared as usize;
        self.need(len, context)?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        self.consumed += len;
        RawDoc::from_bytes(bytes)
    }
}

/// Append a NUL-terminated string
pub fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Append a document's bytes
pub fn put_document(buf: &mut BytesMut, doc: &RawDoc) {
    buf.put_slice(doc.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_reader_tracks_consumed_bytes() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(7);
        put_cstring(&mut buf, "db.coll");
        buf.put_i64_le(-42);
        let bytes = buf.freeze();

        let mut reader = BodyReader::new(&bytes);
        assert_eq!(reader.read_i32("flags").unwrap(), 7);
        assert_eq!(reader.read_cstring("namespace").unwrap(), "db.coll");
        assert_eq!(reader.read_i64("cursor").unwrap(), -42);
        assert_eq!(reader.consumed(), 4 + 8 + 8);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let bytes = [1u8, 2, 3];
        let mut reader = BodyReader::new(&bytes);
        let err = reader.read_i32("flags").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                needed: 4,
                available: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_unterminated_cstring() {
        let bytes = b"abc";
        let mut reader = BodyReader::new(bytes);
        assert!(matches!(
            reader.read_cstring("namespace"),
            Err(DecodeError::UnterminatedCString("namespace"))
        ));
    }

    #[test]
    fn test_document_roundtrip_through_raw() {
        let original = doc! { "find": "users", "filter": { "age": 30 } };
        let raw = RawDoc::from_document(&original).unwrap();
        assert_eq!(raw.to_document().unwrap(), original);

        let mut reader = BodyReader::new(raw.as_bytes());
        let read = reader.read_document("doc").unwrap();
        assert_eq!(read, raw);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_document_length_validation() {
        let mut bytes = vec![0u8; 8];
        bytes[0] = 3; // declares fewer bytes than the minimum
        let mut reader = BodyReader::new(&bytes);
        assert!(matches!(
            reader.read_document("doc"),
            Err(DecodeError::InvalidDocumentLength(3))
        ));

        let mut bytes = vec![0u8; 8];
        bytes[0] = 40; // declares more bytes than present
        let mut reader = BodyReader::new(&bytes);
        assert!(matches!(
            reader.read_document("doc"),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
