//! Legacy opcode bodies: query, reply, insert, update, delete, get-more and
//! kill-cursors
//!
//! These bodies re-encode byte-for-byte; documents stay in their recorded
//! encoding unless a cursor rewrite touches them.

use bytes::{BufMut, BytesMut};

use super::OpMetadata;
use super::codec::{BodyReader, DecodeError, RawDoc, put_cstring, put_document};
use super::command;

/// Reply flag: the requested cursor no longer exists
pub const REPLY_CURSOR_NOT_FOUND: i32 = 1 << 0;
/// Reply flag: the query failed and the first document holds `$err`
pub const REPLY_QUERY_FAILURE: i32 = 1 << 1;

/// Split `db.collection` at the first dot
pub fn split_namespace(namespace: &str) -> (&str, &str) {
    match namespace.split_once('.') {
        Some((db, coll)) => (db, coll),
        None => (namespace, ""),
    }
}

fn namespace_metadata(op: &str, namespace: &str) -> OpMetadata {
    let (_, collection) = split_namespace(namespace);
    OpMetadata {
        op: op.to_string(),
        namespace: namespace.to_string(),
        collection: collection.to_string(),
        command: None,
        cursor_ids: Vec::new(),
    }
}

fn read_documents(reader: &mut BodyReader<'_>, context: &'static str) -> Result<Vec<RawDoc>, DecodeError> {
    let mut documents = Vec::new();
    while !reader.is_empty() {
        documents.push(reader.read_document(context)?);
    }
    Ok(documents)
}

/// OP_QUERY: a find, or a command when the namespace is `<db>.$cmd`
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOp {
    /// Query flags
    pub flags: i32,
    /// `db.collection` (or `db.$cmd`)
    pub full_collection_name: String,
    /// Documents to skip
    pub number_to_skip: i32,
    /// Batch size hint
    pub number_to_return: i32,
    /// Query or command document
    pub query: RawDoc,
    /// Optional projection
    pub return_fields_selector: Option<RawDoc>,
}

impl QueryOp {
    /// Decode a query body
    pub fn decode(reader: &mut BodyReader<'_>) -> Result<Self, DecodeError> {
        let flags = reader.read_i32("query flags")?;
        let full_collection_name = reader.read_cstring("query namespace")?;
        let number_to_skip = reader.read_i32("query skip")?;
        let number_to_return = reader.read_i32("query limit")?;
        let query = reader.read_document("query document")?;
        let return_fields_selector = if reader.is_empty() {
            None
        } else {
            Some(reader.read_document("query projection")?)
        };
        Ok(Self {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }

    /// Encode the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.flags);
        put_cstring(buf, &self.full_collection_name);
        buf.put_i32_le(self.number_to_skip);
        buf.put_i32_le(self.number_to_return);
        put_document(buf, &self.query);
        if let Some(selector) = &self.return_fields_selector {
            put_document(buf, selector);
        }
    }

    /// True when this query carries a command
    pub fn is_command(&self) -> bool {
        split_namespace(&self.full_collection_name).1 == "$cmd"
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        if !self.is_command() {
            return namespace_metadata("query", &self.full_collection_name);
        }
        let (db, _) = split_namespace(&self.full_collection_name);
        let doc = self.query.to_document().ok();
        let name = doc.as_ref().and_then(command::command_name).map(str::to_string);
        let collection = doc
            .as_ref()
            .and_then(command::command_collection)
            .unwrap_or_default()
            .to_string();
        let namespace = if collection.is_empty() {
            self.full_collection_name.clone()
        } else {
            format!("{}.{}", db, collection)
        };
        OpMetadata {
            op: "command".to_string(),
            namespace,
            collection,
            command: name,
            cursor_ids: doc.as_ref().map(command::command_cursor_ids).unwrap_or_default(),
        }
    }

    /// Cursor ids referenced by a command query
    pub fn cursor_ids(&self) -> Result<Vec<i64>, DecodeError> {
        if !self.is_command() {
            return Ok(Vec::new());
        }
        Ok(command::command_cursor_ids(&self.query.to_document()?))
    }

    /// Write remapped ids into the command document
    pub fn rewrite_cursor_ids(&mut self, new_ids: &[i64]) -> Result<(), DecodeError> {
        if !self.is_command() {
            return check_empty(new_ids);
        }
        let mut doc = self.query.to_document()?;
        if command::rewrite_command_cursor_ids(&mut doc, new_ids)? {
            self.query = RawDoc::from_document(&doc)?;
        }
        Ok(())
    }
}

/// OP_REPLY: the legacy server response
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyOp {
    /// Response flags
    pub flags: i32,
    /// Live cursor, zero when exhausted
    pub cursor_id: i64,
    /// Position of the first document in the cursor
    pub starting_from: i32,
    /// Documents in this batch
    pub number_returned: i32,
    /// Returned documents
    pub documents: Vec<RawDoc>,
}

impl ReplyOp {
    /// Decode a reply body
    pub fn decode(reader: &mut BodyReader<'_>) -> Result<Self, DecodeError> {
        let flags = reader.read_i32("reply flags")?;
        let cursor_id = reader.read_i64("reply cursor id")?;
        let starting_from = reader.read_i32("reply starting from")?;
        let number_returned = reader.read_i32("reply count")?;
        let documents = read_documents(reader, "reply document")?;
        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    /// Encode the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.flags);
        buf.put_i64_le(self.cursor_id);
        buf.put_i32_le(self.starting_from);
        buf.put_i32_le(self.number_returned);
        for doc in &self.documents {
            put_document(buf, doc);
        }
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        OpMetadata {
            op: "reply".to_string(),
            namespace: String::new(),
            collection: String::new(),
            command: None,
            cursor_ids: self.cursor_ids().unwrap_or_default(),
        }
    }

    /// Header cursor id, or the `cursor.id` of a command reply
    pub fn cursor_ids(&self) -> Result<Vec<i64>, DecodeError> {
        if self.cursor_id != 0 {
            return Ok(vec![self.cursor_id]);
        }
        match self.documents.first() {
            Some(first) => Ok(command::command_cursor_ids(&first.to_document()?)),
            None => Ok(Vec::new()),
        }
    }

    /// Write remapped ids back in `cursor_ids` order
    pub fn rewrite_cursor_ids(&mut self, new_ids: &[i64]) -> Result<(), DecodeError> {
        if self.cursor_id != 0 {
            return match new_ids {
                [id] => {
                    self.cursor_id = *id;
                    Ok(())
                }
                _ => Err(DecodeError::CursorRewrite {
                    expected: 1,
                    actual: new_ids.len(),
                }),
            };
        }
        let Some(first) = self.documents.first_mut() else {
            return check_empty(new_ids);
        };
        let mut doc = first.to_document()?;
        if command::rewrite_command_cursor_ids(&mut doc, new_ids)? {
            *first = RawDoc::from_document(&doc)?;
        }
        Ok(())
    }

    /// Errors the server reported in this reply
    pub fn errors(&self) -> Vec<String> {
        let first = self.documents.first().and_then(|d| d.to_document().ok());
        if self.flags & REPLY_QUERY_FAILURE != 0 {
            let msg = first
                .as_ref()
                .and_then(|d| d.get_str("$err").ok())
                .unwrap_or("query failure");
            return vec![msg.to_string()];
        }
        if self.flags & REPLY_CURSOR_NOT_FOUND != 0 {
            return vec!["cursor not found".to_string()];
        }
        first.as_ref().map(command::reply_errors).unwrap_or_default()
    }

    /// Documents returned, looking inside command cursor batches
    pub fn num_returned(&self) -> usize {
        if self.documents.len() == 1 {
            if let Some(len) = self.documents[0]
                .to_document()
                .ok()
                .as_ref()
                .and_then(command::reply_batch_len)
            {
                return len;
            }
        }
        self.number_returned.max(0) as usize
    }
}

/// OP_INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOp {
    /// Insert flags
    pub flags: i32,
    /// Target namespace
    pub full_collection_name: String,
    /// Documents to insert
    pub documents: Vec<RawDoc>,
}

impl InsertOp {
    /// Decode an insert body
    pub fn decode(reader: &mut BodyReader<'_>) -> Result<Self, DecodeError> {
        let flags = reader.read_i32("insert flags")?;
        let full_collection_name = reader.read_cstring("insert namespace")?;
        let documents = read_documents(reader, "insert document")?;
        Ok(Self {
            flags,
            full_collection_name,
            documents,
        })
    }

    /// Encode the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.flags);
        put_cstring(buf, &self.full_collection_name);
        for doc in &self.documents {
            put_document(buf, doc);
        }
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        namespace_metadata("insert", &self.full_collection_name)
    }
}

/// OP_UPDATE
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    /// Reserved word, carried through unchanged
    pub reserved: i32,
    /// Target namespace
    pub full_collection_name: String,
    /// Upsert/multi flags
    pub flags: i32,
    /// Match document
    pub selector: RawDoc,
    /// Update document
    pub update: RawDoc,
}

impl UpdateOp {
    /// Decode an update body
    pub fn decode(reader: &mut BodyReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            reserved: reader.read_i32("update reserved")?,
            full_collection_name: reader.read_cstring("update namespace")?,
            flags: reader.read_i32("update flags")?,
            selector: reader.read_document("update selector")?,
            update: reader.read_document("update document")?,
        })
    }

    /// Encode the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.reserved);
        put_cstring(buf, &self.full_collection_name);
        buf.put_i32_le(self.flags);
        put_document(buf, &self.selector);
        put_document(buf, &self.update);
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        namespace_metadata("update", &self.full_collection_name)
    }
}

/// OP_DELETE
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOp {
    /// Reserved word, carried through unchanged
    pub reserved: i32,
    /// Target namespace
    pub full_collection_name: String,
    /// Single-remove flag
    pub flags: i32,
    /// Match document
    pub selector: RawDoc,
}

impl DeleteOp {
    /// Decode a delete body
    pub fn decode(reader: &mut BodyReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            reserved: reader.read_i32("delete reserved")?,
            full_collection_name: reader.read_cstring("delete namespace")?,
            flags: reader.read_i32("delete flags")?,
            selector: reader.read_document("delete selector")?,
        })
    }

    /// Encode the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.reserved);
        put_cstring(buf, &self.full_collection_name);
        buf.put_i32_le(self.flags);
        put_document(buf, &self.selector);
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        namespace_metadata("delete", &self.full_collection_name)
    }
}

/// OP_GET_MORE
#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreOp {
    /// Reserved word, carried through unchanged
    pub reserved: i32,
    /// Namespace of the cursor
    pub full_collection_name: String,
    /// Batch size hint
    pub number_to_return: i32,
    /// Cursor to continue
    pub cursor_id: i64,
}

impl GetMoreOp {
    /// Decode a get-more body
    pub fn decode(reader: &mut BodyReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            reserved: reader.read_i32("getmore reserved")?,
            full_collection_name: reader.read_cstring("getmore namespace")?,
            number_to_return: reader.read_i32("getmore limit")?,
            cursor_id: reader.read_i64("getmore cursor id")?,
        })
    }

    /// Encode the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.reserved);
        put_cstring(buf, &self.full_collection_name);
        buf.put_i32_le(self.number_to_return);
        buf.put_i64_le(self.cursor_id);
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        let mut meta = namespace_metadata("getmore", &self.full_collection_name);
        meta.cursor_ids = self.cursor_ids();
        meta
    }

    /// The cursor being continued
    pub fn cursor_ids(&self) -> Vec<i64> {
        if self.cursor_id == 0 {
            Vec::new()
        } else {
            vec![self.cursor_id]
        }
    }

    /// Replace the cursor id
    pub fn rewrite_cursor_ids(&mut self, new_ids: &[i64]) -> Result<(), DecodeError> {
        if self.cursor_id == 0 {
            return check_empty(new_ids);
        }
        match new_ids {
            [id] => {
                self.cursor_id = *id;
                Ok(())
            }
            _ => Err(DecodeError::CursorRewrite {
                expected: 1,
                actual: new_ids.len(),
            }),
        }
    }
}

/// OP_KILL_CURSORS
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsOp {
    /// Reserved word, carried through unchanged
    pub reserved: i32,
    /// Cursors to close
    pub cursor_ids: Vec<i64>,
}

impl KillCursorsOp {
    /// Decode a kill-cursors body; the count must match the bytes present
    pub fn decode(reader: &mut BodyReader<'_>) -> Result<Self, DecodeError> {
        let reserved = reader.read_i32("killcursors reserved")?;
        let declared = reader.read_i32("killcursors count")?;
        let remaining = reader.remaining();
        if declared < 0 || declared as usize * 8 != remaining {
            return Err(DecodeError::CursorCountMismatch { declared, remaining });
        }
        let mut cursor_ids = Vec::with_capacity(declared as usize);
        for _ in 0..declared {
            cursor_ids.push(reader.read_i64("killcursors cursor id")?);
        }
        Ok(Self {
            reserved,
            cursor_ids,
        })
    }

    /// Encode the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.reserved);
        buf.put_i32_le(self.cursor_ids.len() as i32);
        for id in &self.cursor_ids {
            buf.put_i64_le(*id);
        }
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        OpMetadata {
            op: "killcursors".to_string(),
            namespace: String::new(),
            collection: String::new(),
            command: None,
            cursor_ids: self.live_ids(),
        }
    }

    fn live_ids(&self) -> Vec<i64> {
        self.cursor_ids.iter().copied().filter(|id| *id != 0).collect()
    }

    /// Non-zero cursor ids, in body order
    pub fn read_cursor_ids(&self) -> Vec<i64> {
        self.live_ids()
    }

    /// Replace the non-zero ids in body order
    pub fn rewrite_cursor_ids(&mut self, new_ids: &[i64]) -> Result<(), DecodeError> {
        let expected = self.live_ids().len();
        if expected != new_ids.len() {
            return Err(DecodeError::CursorRewrite {
                expected,
                actual: new_ids.len(),
            });
        }
        let mut replacements = new_ids.iter().copied();
        for id in self.cursor_ids.iter_mut().filter(|id| **id != 0) {
            if let Some(new_id) = replacements.next() {
                *id = new_id;
            }
        }
        Ok(())
    }
}

fn check_empty(new_ids: &[i64]) -> Result<(), DecodeError> {
    if new_ids.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::CursorRewrite {
            expected: 0,
            actual: new_ids.len(),
        })
    }
}
