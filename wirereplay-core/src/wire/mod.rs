//! Wire-protocol op model
//!
//! Every message starts with a 16-byte little-endian header (length, request
//! id, response-to id, opcode). The opcode selects one of a closed set of
//! body layouts, modelled here as the [`Op`] sum type.
//!
//! # Example
//!
//! ```rust,no_run
//! use wirereplay_core::wire::{MsgHeader, Op};
//!
//! # fn demo(message: &[u8]) -> Result<(), wirereplay_core::wire::DecodeError> {
//! let header = MsgHeader::parse(&message[..16])?;
//! let op = Op::decode(&header, &message[16..])?;
//! println!("{:?} {:?}", op.opcode(), op.metadata());
//! # Ok(())
//! # }
//! ```

mod codec;
pub mod command;
mod legacy;
mod msg;

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use tokio::time::Instant;

use crate::session::{SessionError, WireConnection};

pub use codec::{
    BodyReader, DecodeError, HEADER_LEN, MAX_DOCUMENT_SIZE, MIN_DOCUMENT_SIZE, RawDoc,
};
pub use legacy::{
    DeleteOp, GetMoreOp, InsertOp, KillCursorsOp, QueryOp, REPLY_CURSOR_NOT_FOUND,
    REPLY_QUERY_FAILURE, ReplyOp, UpdateOp, split_namespace,
};
pub use msg::{CHECKSUM_PRESENT, EXHAUST_ALLOWED, MORE_TO_COME, MsgOp, Section};

/// Largest message accepted from a peer or a recording
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Supported opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum OpCode {
    /// Legacy server reply
    Reply = 1,
    /// Legacy update
    Update = 2001,
    /// Legacy insert
    Insert = 2002,
    /// Legacy query or command
    Query = 2004,
    /// Legacy cursor continuation
    GetMore = 2005,
    /// Legacy delete
    Delete = 2006,
    /// Legacy cursor close
    KillCursors = 2007,
    /// Sectioned message
    Msg = 2013,
}

impl OpCode {
    /// Short lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Reply => "reply",
            OpCode::Update => "update",
            OpCode::Insert => "insert",
            OpCode::Query => "query",
            OpCode::GetMore => "getmore",
            OpCode::Delete => "delete",
            OpCode::KillCursors => "killcursors",
            OpCode::Msg => "msg",
        }
    }
}

impl TryFrom<i32> for OpCode {
    type Error = DecodeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2013 => OpCode::Msg,
            other => return Err(DecodeError::UnknownOpCode(other)),
        })
    }
}

/// Fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
pub struct MsgHeader {
    /// Total message size, header included
    pub message_length: i32,
    /// Sender-assigned id
    pub request_id: i32,
    /// Request this message answers, zero for requests
    pub response_to: i32,
    /// Raw opcode
    pub op_code: i32,
}

impl MsgHeader {
    /// Parse the first 16 bytes of a message
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BodyReader::new(bytes);
        let header = Self {
            message_length: reader.read_i32("header length")?,
            request_id: reader.read_i32("header request id")?,
            response_to: reader.read_i32("header response to")?,
            op_code: reader.read_i32("header opcode")?,
        };
        header.body_len()?;
        Ok(header)
    }

    /// Append the header
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }

    /// Body length the header declares
    pub fn body_len(&self) -> Result<usize, DecodeError> {
        let total = self.message_length;
        if total < HEADER_LEN as i32 || total as usize > MAX_MESSAGE_SIZE {
            return Err(DecodeError::InvalidMessageLength(total));
        }
        Ok(total as usize - HEADER_LEN)
    }

    /// True for messages a server sent: legacy replies, and sectioned
    /// messages answering a request
    pub fn is_server_reply(&self) -> bool {
        self.op_code == OpCode::Reply as i32
            || (self.op_code == OpCode::Msg as i32 && self.response_to != 0)
    }
}

/// Normalized summary used for filtering, stats and logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpMetadata {
    /// Operation kind, e.g. `query`, `command`, `msg`
    pub op: String,
    /// `db.collection` when known
    pub namespace: String,
    /// Collection part of the namespace
    pub collection: String,
    /// Command name for command-carrying ops
    pub command: Option<String>,
    /// Cursor ids the op references
    pub cursor_ids: Vec<i64>,
}

/// One decoded message body
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// OP_QUERY
    Query(QueryOp),
    /// OP_REPLY
    Reply(ReplyOp),
    /// OP_INSERT
    Insert(InsertOp),
    /// OP_UPDATE
    Update(UpdateOp),
    /// OP_DELETE
    Delete(DeleteOp),
    /// OP_GET_MORE
    GetMore(GetMoreOp),
    /// OP_KILL_CURSORS
    KillCursors(KillCursorsOp),
    /// OP_MSG
    Msg(MsgOp),
}

impl Op {
    /// Decode a body; it must be exactly as long as the header declares
    pub fn decode(header: &MsgHeader, body: &[u8]) -> Result<Self, DecodeError> {
        let declared = header.body_len()?;
        if body.len() < declared {
            return Err(DecodeError::Truncated {
                context: "message body",
                needed: declared,
                available: body.len(),
            });
        }
        if body.len() > declared {
            return Err(DecodeError::LengthMismatch {
                declared,
                consumed: body.len(),
            });
        }
        let mut reader = BodyReader::new(body);
        let op = match OpCode::try_from(header.op_code)? {
            OpCode::Query => Op::Query(QueryOp::decode(&mut reader)?),
            OpCode::Reply => Op::Reply(ReplyOp::decode(&mut reader)?),
            OpCode::Insert => Op::Insert(InsertOp::decode(&mut reader)?),
            OpCode::Update => Op::Update(UpdateOp::decode(&mut reader)?),
            OpCode::Delete => Op::Delete(DeleteOp::decode(&mut reader)?),
            OpCode::GetMore => Op::GetMore(GetMoreOp::decode(&mut reader)?),
            OpCode::KillCursors => Op::KillCursors(KillCursorsOp::decode(&mut reader)?),
            OpCode::Msg => Op::Msg(MsgOp::decode(&mut reader, declared)?),
        };
        if reader.consumed() != declared {
            return Err(DecodeError::LengthMismatch {
                declared,
                consumed: reader.consumed(),
            });
        }
        Ok(op)
    }

    /// Opcode of this variant
    pub fn opcode(&self) -> OpCode {
        match self {
            Op::Query(_) => OpCode::Query,
            Op::Reply(_) => OpCode::Reply,
            Op::Insert(_) => OpCode::Insert,
            Op::Update(_) => OpCode::Update,
            Op::Delete(_) => OpCode::Delete,
            Op::GetMore(_) => OpCode::GetMore,
            Op::KillCursors(_) => OpCode::KillCursors,
            Op::Msg(_) => OpCode::Msg,
        }
    }

    /// Append the body only
    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Op::Query(op) => op.encode(buf),
            Op::Reply(op) => op.encode(buf),
            Op::Insert(op) => op.encode(buf),
            Op::Update(op) => op.encode(buf),
            Op::Delete(op) => op.encode(buf),
            Op::GetMore(op) => op.encode(buf),
            Op::KillCursors(op) => op.encode(buf),
            Op::Msg(op) => op.encode(buf),
        }
    }

    /// Encode a full message with a freshly computed header
    pub fn encode(&self, request_id: i32, response_to: i32) -> Vec<u8> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id,
            response_to,
            op_code: self.opcode() as i32,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        header.write_to(&mut buf);
        buf.put_slice(&body);
        buf.to_vec()
    }

    /// Normalized summary
    pub fn metadata(&self) -> OpMetadata {
        match self {
            Op::Query(op) => op.metadata(),
            Op::Reply(op) => op.metadata(),
            Op::Insert(op) => op.metadata(),
            Op::Update(op) => op.metadata(),
            Op::Delete(op) => op.metadata(),
            Op::GetMore(op) => op.metadata(),
            Op::KillCursors(op) => op.metadata(),
            Op::Msg(op) => op.metadata(),
        }
    }

    /// Cursor ids this op reads, in rewrite order
    pub fn cursor_ids(&self) -> Result<Vec<i64>, DecodeError> {
        match self {
            Op::Query(op) => op.cursor_ids(),
            Op::Reply(op) => op.cursor_ids(),
            Op::GetMore(op) => Ok(op.cursor_ids()),
            Op::KillCursors(op) => Ok(op.read_cursor_ids()),
            Op::Msg(op) => op.cursor_ids(),
            Op::Insert(_) | Op::Update(_) | Op::Delete(_) => Ok(Vec::new()),
        }
    }

    /// Apply replacement ids; an op without cursors accepts an empty list
    pub fn rewrite_cursor_ids(&mut self, new_ids: &[i64]) -> Result<(), DecodeError> {
        match self {
            Op::Query(op) => op.rewrite_cursor_ids(new_ids),
            Op::Reply(op) => op.rewrite_cursor_ids(new_ids),
            Op::GetMore(op) => op.rewrite_cursor_ids(new_ids),
            Op::KillCursors(op) => op.rewrite_cursor_ids(new_ids),
            Op::Msg(op) => op.rewrite_cursor_ids(new_ids),
            Op::Insert(_) | Op::Update(_) | Op::Delete(_) => {
                if new_ids.is_empty() {
                    Ok(())
                } else {
                    Err(DecodeError::CursorRewrite {
                        expected: 0,
                        actual: new_ids.len(),
                    })
                }
            }
        }
    }

    /// Whether the protocol defines a reply for this op
    pub fn expects_reply(&self) -> bool {
        match self {
            Op::Query(_) | Op::GetMore(_) => true,
            Op::Msg(op) => op.expects_reply(),
            _ => false,
        }
    }

    /// Handshake, heartbeat and authentication commands issued by the driver
    pub fn is_driver_op(&self) -> bool {
        let name = match self {
            Op::Query(op) if op.is_command() => op.metadata().command,
            Op::Msg(op) => op.metadata().command,
            _ => None,
        };
        name.as_deref().is_some_and(command::is_driver_command)
    }

    /// Server-reported errors, for reply-shaped ops
    pub fn errors(&self) -> Vec<String> {
        match self {
            Op::Reply(op) => op.errors(),
            Op::Msg(op) => op.errors(),
            _ => Vec::new(),
        }
    }

    /// Documents a reply-shaped op returned
    pub fn num_returned(&self) -> usize {
        match self {
            Op::Reply(op) => op.num_returned(),
            Op::Msg(op) => op.num_returned(),
            _ => 0,
        }
    }

    /// Transmit this op and wait for the reply the protocol defines for it
    ///
    /// Replies are never sent. Ops without a reply return `Ok(None)` as soon
    /// as the bytes are written.
    pub async fn execute<C>(&self, conn: &mut C) -> Result<Option<Reply>, SessionError>
    where
        C: WireConnection + ?Sized,
    {
        if matches!(self, Op::Reply(_)) {
            return Ok(None);
        }
        let request_id = conn.next_request_id();
        let message = self.encode(request_id, 0);
        let started = Instant::now();
        conn.send(&message).await?;
        if !self.expects_reply() {
            return Ok(None);
        }
        loop {
            let (header, body) = conn.receive().await?;
            if header.response_to != request_id {
                tracing::debug!(
                    request_id,
                    response_to = header.response_to,
                    "Discarding unrelated reply"
                );
                continue;
            }
            let op = Op::decode(&header, &body)?;
            return Ok(Some(Reply {
                header,
                op,
                latency: started.elapsed(),
            }));
        }
    }
}

/// A live reply received by [`Op::execute`]
#[derive(Debug, Clone)]
pub struct Reply {
    /// Reply header
    pub header: MsgHeader,
    /// Decoded reply body
    pub op: Op,
    /// Time from send to receipt
    pub latency: Duration,
}

impl Reply {
    /// Cursor id the server handed out, zero when none
    pub fn cursor_id(&self) -> i64 {
        self.op
            .cursor_ids()
            .ok()
            .and_then(|ids| ids.first().copied())
            .unwrap_or(0)
    }

    /// Server-reported errors
    pub fn errors(&self) -> Vec<String> {
        self.op.errors()
    }

    /// Documents returned
    pub fn num_returned(&self) -> usize {
        self.op.num_returned()
    }
}

#[cfg(test)]
mod tests;
