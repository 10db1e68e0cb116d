//! OP_MSG: the sectioned message format
//!
//! A flag word, then sections until the declared length (less the optional
//! checksum) is used up. Kind 0 holds one document; kind 1 holds a size, an
//! identifier and documents until the size is consumed. Nothing is counted,
//! so every byte is accounted for per section.

use bson::Document;
use bytes::{BufMut, BytesMut};

use super::OpMetadata;
use super::codec::{BodyReader, DecodeError, RawDoc, put_cstring, put_document};
use super::command;

/// A trailing CRC-32C word follows the sections
pub const CHECKSUM_PRESENT: u32 = 1 << 0;
/// The sender will not wait for a reply
pub const MORE_TO_COME: u32 = 1 << 1;
/// The client accepts several replies to one request
pub const EXHAUST_ALLOWED: u32 = 1 << 16;

const KIND_BODY: u8 = 0;
const KIND_SEQUENCE: u8 = 1;

/// One payload section
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Kind 0: the command or reply document
    Body(RawDoc),
    /// Kind 1: an identified batch of documents
    Sequence {
        /// Field the documents belong to, e.g. `documents`
        identifier: String,
        /// Batch contents
        documents: Vec<RawDoc>,
    },
}

impl Section {
    fn encoded_len(&self) -> usize {
        match self {
            Section::Body(doc) => 1 + doc.len(),
            Section::Sequence {
                identifier,
                documents,
            } => 1 + 4 + identifier.len() + 1 + documents.iter().map(RawDoc::len).sum::<usize>(),
        }
    }
}

/// Decoded OP_MSG body
#[derive(Debug, Clone, PartialEq)]
pub struct MsgOp {
    /// Flag bits
    pub flags: u32,
    /// Sections in wire order
    pub sections: Vec<Section>,
    /// Trailing checksum, when the flag is set
    pub checksum: Option<u32>,
}

impl MsgOp {
    /// Build a message holding a single body document
    pub fn from_document(doc: &Document) -> Result<Self, DecodeError> {
        Ok(Self {
            flags: 0,
            sections: vec![Section::Body(RawDoc::from_document(doc)?)],
            checksum: None,
        })
    }

    /// Decode `body_len` bytes of sections
    pub fn decode(reader: &mut BodyReader<'_>, body_len: usize) -> Result<Self, DecodeError> {
        let flags = reader.read_u32("msg flags")?;
        let checksum_len = if flags & CHECKSUM_PRESENT != 0 { 4 } else { 0 };
        if body_len < 4 + checksum_len {
            return Err(DecodeError::Truncated {
                context: "msg checksum",
                needed: 4 + checksum_len,
                available: body_len,
            });
        }
        let sections_end = body_len - checksum_len;

        let mut sections = Vec::new();
        while reader.consumed() < sections_end {
            let kind = reader.read_u8("msg section kind")?;
            match kind {
                KIND_BODY => {
                    let doc = reader.read_document("msg body section")?;
                    sections.push(Section::Body(doc));
                }
                KIND_SEQUENCE => {
                    let start = reader.consumed();
                    let size = reader.read_i32("msg sequence size")?;
                    if size < 4 || start + size as usize > sections_end {
                        return Err(DecodeError::SectionOverrun {
                            declared: size.max(0) as usize,
                            read: sections_end.saturating_sub(start),
                        });
                    }
                    let size = size as usize;
                    let identifier = reader.read_cstring("msg sequence identifier")?;
                    let mut documents = Vec::new();
                    while reader.consumed() - start < size {
                        documents.push(reader.read_document("msg sequence document")?);
                    }
                    let read = reader.consumed() - start;
                    if read != size {
                        return Err(DecodeError::SectionOverrun {
                            declared: size,
                            read,
                        });
                    }
                    sections.push(Section::Sequence {
                        identifier,
                        documents,
                    });
                }
                other => return Err(DecodeError::UnknownSectionKind(other)),
            }
        }
        if reader.consumed() != sections_end {
            return Err(DecodeError::SectionOverrun {
                declared: sections_end,
                read: reader.consumed(),
            });
        }

        let checksum = if checksum_len > 0 {
            Some(reader.read_u32("msg checksum")?)
        } else {
            None
        };
        Ok(Self {
            flags,
            sections,
            checksum,
        })
    }

    /// Encode sections in order, then the checksum if one is kept
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.flags);
        for section in &self.sections {
            match section {
                Section::Body(doc) => {
                    buf.put_u8(KIND_BODY);
                    put_document(buf, doc);
                }
                Section::Sequence {
                    identifier,
                    documents,
                } => {
                    buf.put_u8(KIND_SEQUENCE);
                    let size = section.encoded_len() - 1;
                    buf.put_i32_le(size as i32);
                    put_cstring(buf, identifier);
                    for doc in documents {
                        put_document(buf, doc);
                    }
                }
            }
        }
        if let Some(checksum) = self.checksum {
            buf.put_u32_le(checksum);
        }
    }

    /// The kind-0 section, if any
    pub fn body(&self) -> Option<&RawDoc> {
        self.sections.iter().find_map(|s| match s {
            Section::Body(doc) => Some(doc),
            Section::Sequence { .. } => None,
        })
    }

    fn body_document(&self) -> Result<Option<Document>, DecodeError> {
        self.body().map(RawDoc::to_document).transpose()
    }

    /// True unless the sender flagged more-to-come
    pub fn expects_reply(&self) -> bool {
        self.flags & MORE_TO_COME == 0
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        let doc = self.body_document().ok().flatten();
        let name = doc.as_ref().and_then(command::command_name).map(str::to_string);
        let db = doc
            .as_ref()
            .and_then(|d| d.get_str("$db").ok())
            .unwrap_or_default();
        let collection = doc
            .as_ref()
            .and_then(command::command_collection)
            .unwrap_or_default()
            .to_string();
        let namespace = match (db.is_empty(), collection.is_empty()) {
            (true, _) => collection.clone(),
            (false, true) => db.to_string(),
            (false, false) => format!("{}.{}", db, collection),
        };
        OpMetadata {
            op: "msg".to_string(),
            namespace,
            collection,
            command: name,
            cursor_ids: doc.as_ref().map(command::command_cursor_ids).unwrap_or_default(),
        }
    }

    /// Cursor ids referenced by the body document
    pub fn cursor_ids(&self) -> Result<Vec<i64>, DecodeError> {
        Ok(self
            .body_document()?
            .as_ref()
            .map(command::command_cursor_ids)
            .unwrap_or_default())
    }

    /// Rewrite the body; a stale checksum is dropped along with its flag
    pub fn rewrite_cursor_ids(&mut self, new_ids: &[i64]) -> Result<(), DecodeError> {
        let Some(mut doc) = self.body_document()? else {
            if new_ids.is_empty() {
                return Ok(());
            }
            return Err(DecodeError::CursorRewrite {
                expected: 0,
                actual: new_ids.len(),
            });
        };
        if !command::rewrite_command_cursor_ids(&mut doc, new_ids)? {
            return Ok(());
        }
        let rewritten = RawDoc::from_document(&doc)?;
        if let Some(Section::Body(body)) = self
            .sections
            .iter_mut()
            .find(|s| matches!(s, Section::Body(_)))
        {
            *body = rewritten;
        }
        self.flags &= !CHECKSUM_PRESENT;
        self.checksum = None;
        Ok(())
    }

    /// Errors reported by a reply body
    pub fn errors(&self) -> Vec<String> {
        match self.body_document() {
            Ok(Some(doc)) => command::reply_errors(&doc),
            Ok(None) => Vec::new(),
            Err(e) => vec![e.to_string()],
        }
    }

    /// Documents returned: a cursor batch, or the sequence sections
    pub fn num_returned(&self) -> usize {
        if let Ok(Some(doc)) = self.body_document() {
            if let Some(len) = command::reply_batch_len(&doc) {
                return len;
            }
        }
        self.sections
            .iter()
            .map(|s| match s {
                Section::Body(_) => 0,
                Section::Sequence { documents, .. } => documents.len(),
            })
            .sum()
    }
}
