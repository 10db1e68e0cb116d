//! Tests for the wire-protocol op model

use std::collections::VecDeque;

use async_trait::async_trait;
use bson::{Document, doc};
use bytes::{BufMut, BytesMut};

use super::*;
use crate::session::{SessionError, WireConnection};

fn raw(doc: Document) -> RawDoc {
    RawDoc::from_document(&doc).unwrap()
}

fn split(message: &[u8]) -> (MsgHeader, &[u8]) {
    let header = MsgHeader::parse(&message[..HEADER_LEN]).unwrap();
    (header, &message[HEADER_LEN..])
}

fn roundtrip(op: &Op) -> Op {
    let message = op.encode(17, 0);
    let (header, body) = split(&message);
    assert_eq!(header.message_length as usize, message.len());
    let decoded = Op::decode(&header, body).unwrap();
    assert_eq!(decoded.encode(17, 0), message, "re-encode must be byte-identical");
    decoded
}

fn find_query() -> Op {
    Op::Query(QueryOp {
        flags: 4,
        full_collection_name: "app.users".to_string(),
        number_to_skip: 0,
        number_to_return: 100,
        query: raw(doc! { "age": { "$gt": 21 } }),
        return_fields_selector: Some(raw(doc! { "name": 1 })),
    })
}

#[test]
fn test_legacy_ops_reencode_byte_for_byte() {
    let ops = vec![
        find_query(),
        Op::Reply(ReplyOp {
            flags: 8,
            cursor_id: 555,
            starting_from: 0,
            number_returned: 2,
            documents: vec![raw(doc! { "a": 1 }), raw(doc! { "a": 2 })],
        }),
        Op::Insert(InsertOp {
            flags: 0,
            full_collection_name: "app.users".to_string(),
            documents: vec![raw(doc! { "_id": 1 }), raw(doc! { "_id": 2 })],
        }),
        Op::Update(UpdateOp {
            reserved: 0,
            full_collection_name: "app.users".to_string(),
            flags: 2,
            selector: raw(doc! { "_id": 1 }),
            update: raw(doc! { "$set": { "x": 1 } }),
        }),
        Op::Delete(DeleteOp {
            reserved: 0,
            full_collection_name: "app.users".to_string(),
            flags: 1,
            selector: raw(doc! { "_id": 2 }),
        }),
        Op::GetMore(GetMoreOp {
            reserved: 0,
            full_collection_name: "app.users".to_string(),
            number_to_return: 50,
            cursor_id: 12345,
        }),
        Op::KillCursors(KillCursorsOp {
            reserved: 0,
            cursor_ids: vec![1, 2, 3],
        }),
    ];
    for op in &ops {
        assert_eq!(&roundtrip(op), op);
    }
}

#[test]
fn test_query_without_projection() {
    let op = Op::Query(QueryOp {
        flags: 0,
        full_collection_name: "app.$cmd".to_string(),
        number_to_skip: 0,
        number_to_return: -1,
        query: raw(doc! { "count": "users" }),
        return_fields_selector: None,
    });
    let decoded = roundtrip(&op);
    let meta = decoded.metadata();
    assert_eq!(meta.op, "command");
    assert_eq!(meta.command.as_deref(), Some("count"));
    assert_eq!(meta.namespace, "app.users");
    assert_eq!(meta.collection, "users");
}

#[test]
fn test_header_length_must_match_body() {
    let op = Op::GetMore(GetMoreOp {
        reserved: 0,
        full_collection_name: "app.users".to_string(),
        number_to_return: 0,
        cursor_id: 9,
    });
    let mut message = op.encode(1, 0);
    // declare (and supply) four more bytes than the body uses
    message.extend_from_slice(&[0, 0, 0, 0]);
    let len = message.len() as i32;
    message[..4].copy_from_slice(&len.to_le_bytes());

    let (header, body) = split(&message);
    let err = Op::decode(&header, body).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::LengthMismatch {
            declared: 30,
            consumed: 26
        }
    ));
}

#[test]
fn test_truncated_body() {
    let message = find_query().encode(1, 0);
    let (header, body) = split(&message);
    let err = Op::decode(&header, &body[..body.len() - 3]).unwrap_err();
    assert!(matches!(err, DecodeError::Truncated { .. }));
}

#[test]
fn test_unknown_opcode() {
    let header = MsgHeader {
        message_length: 16,
        request_id: 1,
        response_to: 0,
        op_code: 2010,
    };
    assert!(matches!(
        Op::decode(&header, &[]),
        Err(DecodeError::UnknownOpCode(2010))
    ));
}

#[test]
fn test_header_rejects_short_length() {
    let mut buf = BytesMut::new();
    MsgHeader {
        message_length: 8,
        request_id: 1,
        response_to: 0,
        op_code: 2013,
    }
    .write_to(&mut buf);
    assert!(matches!(
        MsgHeader::parse(&buf),
        Err(DecodeError::InvalidMessageLength(8))
    ));
}

#[test]
fn test_kill_cursors_count_mismatch() {
    let mut body = BytesMut::new();
    body.put_i32_le(0);
    body.put_i32_le(3); // claims three ids
    body.put_i64_le(1);
    body.put_i64_le(2);
    let header = MsgHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id: 1,
        response_to: 0,
        op_code: OpCode::KillCursors as i32,
    };
    let err = Op::decode(&header, &body).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::CursorCountMismatch {
            declared: 3,
            remaining: 16
        }
    ));
}

fn insert_msg(checksum: bool) -> Vec<u8> {
    let command = raw(doc! { "insert": "users", "$db": "app" });
    let docs = [raw(doc! { "_id": 1 }), raw(doc! { "_id": 2 })];

    let mut body = BytesMut::new();
    body.put_u32_le(if checksum { CHECKSUM_PRESENT } else { 0 });
    body.put_u8(0);
    body.put_slice(command.as_bytes());
    body.put_u8(1);
    let size = 4 + "documents".len() + 1 + docs.iter().map(RawDoc::len).sum::<usize>();
    body.put_i32_le(size as i32);
    body.put_slice(b"documents\0");
    for d in &docs {
        body.put_slice(d.as_bytes());
    }
    if checksum {
        body.put_u32_le(0xdead_beef);
    }

    let mut message = BytesMut::new();
    MsgHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id: 3,
        response_to: 0,
        op_code: OpCode::Msg as i32,
    }
    .write_to(&mut message);
    message.put_slice(&body);
    message.to_vec()
}

#[test]
fn test_msg_sections_decode() {
    let message = insert_msg(false);
    let (header, body) = split(&message);
    let op = Op::decode(&header, body).unwrap();
    let Op::Msg(msg) = &op else {
        panic!("expected msg, got {:?}", op);
    };
    assert_eq!(msg.sections.len(), 2);
    match &msg.sections[1] {
        Section::Sequence {
            identifier,
            documents,
        } => {
            assert_eq!(identifier, "documents");
            assert_eq!(documents.len(), 2);
        }
        other => panic!("expected sequence, got {:?}", other),
    }
    assert!(msg.checksum.is_none());
    assert!(op.expects_reply());
    assert_eq!(op.encode(3, 0), message);

    let meta = op.metadata();
    assert_eq!(meta.command.as_deref(), Some("insert"));
    assert_eq!(meta.namespace, "app.users");
}

#[test]
fn test_msg_checksum_is_kept() {
    let message = insert_msg(true);
    let (header, body) = split(&message);
    let Op::Msg(msg) = Op::decode(&header, body).unwrap() else {
        panic!("expected msg");
    };
    assert_eq!(msg.checksum, Some(0xdead_beef));
    assert_eq!(msg.sections.len(), 2);
}

#[test]
fn test_msg_sequence_overrun() {
    let mut message = insert_msg(false);
    // the sequence size field sits right after flags, kind 0, the command and kind 1
    let command_len = raw(doc! { "insert": "users", "$db": "app" }).len();
    let offset = HEADER_LEN + 4 + 1 + command_len + 1;
    let size = i32::from_le_bytes(message[offset..offset + 4].try_into().unwrap());
    message[offset..offset + 4].copy_from_slice(&(size + 10).to_le_bytes());

    let (header, body) = split(&message);
    assert!(matches!(
        Op::decode(&header, body),
        Err(DecodeError::SectionOverrun { .. })
    ));
}

#[test]
fn test_msg_unknown_section_kind() {
    let mut body = BytesMut::new();
    body.put_u32_le(0);
    body.put_u8(7);
    body.put_slice(raw(doc! { "ping": 1 }).as_bytes());
    let header = MsgHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id: 1,
        response_to: 0,
        op_code: OpCode::Msg as i32,
    };
    assert!(matches!(
        Op::decode(&header, &body),
        Err(DecodeError::UnknownSectionKind(7))
    ));
}

#[test]
fn test_cursor_ids_and_rewrite() {
    let mut get_more = Op::GetMore(GetMoreOp {
        reserved: 0,
        full_collection_name: "app.users".to_string(),
        number_to_return: 0,
        cursor_id: 12345,
    });
    assert_eq!(get_more.cursor_ids().unwrap(), vec![12345]);
    get_more.rewrite_cursor_ids(&[1]).unwrap();
    assert_eq!(get_more.cursor_ids().unwrap(), vec![1]);
    assert!(get_more.rewrite_cursor_ids(&[]).is_err());

    let mut kill = Op::KillCursors(KillCursorsOp {
        reserved: 0,
        cursor_ids: vec![10, 0, 20],
    });
    assert_eq!(kill.cursor_ids().unwrap(), vec![10, 20]);
    kill.rewrite_cursor_ids(&[1, 2]).unwrap();
    let Op::KillCursors(k) = &kill else { panic!() };
    assert_eq!(k.cursor_ids, vec![1, 0, 2]);

    let mut insert = Op::Insert(InsertOp {
        flags: 0,
        full_collection_name: "app.users".to_string(),
        documents: vec![],
    });
    assert!(insert.cursor_ids().unwrap().is_empty());
    insert.rewrite_cursor_ids(&[]).unwrap();
}

#[test]
fn test_reply_cursor_id_from_command_document() {
    let reply = Op::Reply(ReplyOp {
        flags: 0,
        cursor_id: 0,
        starting_from: 0,
        number_returned: 1,
        documents: vec![raw(
            doc! { "cursor": { "id": 777_i64, "ns": "app.users", "firstBatch": [{}, {}] }, "ok": 1.0 },
        )],
    });
    assert_eq!(reply.cursor_ids().unwrap(), vec![777]);
    assert_eq!(reply.num_returned(), 2);
}

#[test]
fn test_msg_rewrite_drops_checksum() {
    let body = doc! { "getMore": 4242_i64, "collection": "users", "$db": "app" };
    let mut msg = MsgOp::from_document(&body).unwrap();
    msg.flags |= CHECKSUM_PRESENT;
    msg.checksum = Some(1);
    let mut op = Op::Msg(msg);

    assert_eq!(op.cursor_ids().unwrap(), vec![4242]);
    op.rewrite_cursor_ids(&[3]).unwrap();
    assert_eq!(op.cursor_ids().unwrap(), vec![3]);
    let Op::Msg(msg) = &op else { panic!() };
    assert_eq!(msg.flags & CHECKSUM_PRESENT, 0);
    assert!(msg.checksum.is_none());

    // the rewritten message decodes cleanly
    let message = op.encode(9, 0);
    let (header, body) = split(&message);
    Op::decode(&header, body).unwrap();
}

#[test]
fn test_driver_op_classification() {
    let handshake = Op::Query(QueryOp {
        flags: 0,
        full_collection_name: "admin.$cmd".to_string(),
        number_to_skip: 0,
        number_to_return: -1,
        query: raw(doc! { "isMaster": 1, "client": { "driver": { "name": "x" } } }),
        return_fields_selector: None,
    });
    assert!(handshake.is_driver_op());

    let hello = Op::Msg(MsgOp::from_document(&doc! { "hello": 1, "$db": "admin" }).unwrap());
    assert!(hello.is_driver_op());

    let find = Op::Msg(MsgOp::from_document(&doc! { "find": "users", "$db": "app" }).unwrap());
    assert!(!find.is_driver_op());

    // a plain query for a collection named like a command is not a command
    let query = Op::Query(QueryOp {
        flags: 0,
        full_collection_name: "app.ping".to_string(),
        number_to_skip: 0,
        number_to_return: 0,
        query: raw(doc! { "ping": 1 }),
        return_fields_selector: None,
    });
    assert!(!query.is_driver_op());
}

#[test]
fn test_server_reply_direction() {
    let reply = MsgHeader {
        message_length: 16,
        request_id: 2,
        response_to: 1,
        op_code: OpCode::Msg as i32,
    };
    assert!(reply.is_server_reply());
    let request = MsgHeader {
        response_to: 0,
        ..reply
    };
    assert!(!request.is_server_reply());
    let legacy = MsgHeader {
        op_code: OpCode::Reply as i32,
        ..request
    };
    assert!(legacy.is_server_reply());
}

/// Records sent messages and answers from a script
struct ScriptedConnection {
    next_id: i32,
    sent: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
}

impl ScriptedConnection {
    fn new(replies: Vec<Vec<u8>>) -> Self {
        Self {
            next_id: 100,
            sent: Vec::new(),
            replies: replies.into(),
        }
    }
}

#[async_trait]
impl WireConnection for ScriptedConnection {
    fn next_request_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    async fn send(&mut self, message: &[u8]) -> Result<(), SessionError> {
        self.sent.push(message.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> Result<(MsgHeader, Vec<u8>), SessionError> {
        let message = self.replies.pop_front().ok_or(SessionError::Closed)?;
        let (header, body) = split(&message);
        Ok((header, body.to_vec()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

fn msg_reply(response_to: i32, body: Document) -> Vec<u8> {
    Op::Msg(MsgOp::from_document(&body).unwrap()).encode(900, response_to)
}

#[tokio::test]
async fn test_execute_waits_for_matching_reply() {
    let find = Op::Msg(MsgOp::from_document(&doc! { "find": "users", "$db": "app" }).unwrap());
    let mut conn = ScriptedConnection::new(vec![
        msg_reply(55, doc! { "ok": 1.0 }),
        msg_reply(
            101,
            doc! { "cursor": { "id": 31_i64, "ns": "app.users", "firstBatch": [{}] }, "ok": 1.0 },
        ),
    ]);

    let reply = find.execute(&mut conn).await.unwrap().unwrap();
    assert_eq!(reply.header.response_to, 101);
    assert_eq!(reply.cursor_id(), 31);
    assert_eq!(reply.num_returned(), 1);
    assert!(reply.errors().is_empty());

    let (header, _) = split(&conn.sent[0]);
    assert_eq!(header.request_id, 101);
}

#[tokio::test]
async fn test_execute_without_reply() {
    let kill = Op::KillCursors(KillCursorsOp {
        reserved: 0,
        cursor_ids: vec![5],
    });
    let mut conn = ScriptedConnection::new(vec![]);
    assert!(kill.execute(&mut conn).await.unwrap().is_none());
    assert_eq!(conn.sent.len(), 1);

    let mut msg = MsgOp::from_document(&doc! { "insert": "users", "$db": "app" }).unwrap();
    msg.flags |= MORE_TO_COME;
    assert!(Op::Msg(msg).execute(&mut conn).await.unwrap().is_none());
    assert_eq!(conn.sent.len(), 2);

    // recorded replies are never transmitted
    let reply = Op::Reply(ReplyOp {
        flags: 0,
        cursor_id: 0,
        starting_from: 0,
        number_returned: 0,
        documents: vec![],
    });
    assert!(reply.execute(&mut conn).await.unwrap().is_none());
    assert_eq!(conn.sent.len(), 2);
}

#[tokio::test]
async fn test_execute_surfaces_command_errors() {
    let op = Op::Msg(MsgOp::from_document(&doc! { "drop": "missing", "$db": "app" }).unwrap());
    let mut conn =
        ScriptedConnection::new(vec![msg_reply(101, doc! { "ok": 0.0, "errmsg": "ns not found" })]);
    let reply = op.execute(&mut conn).await.unwrap().unwrap();
    assert_eq!(reply.errors(), vec!["ns not found".to_string()]);
}
