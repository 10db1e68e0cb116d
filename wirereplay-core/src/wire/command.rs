//! Command-document inspection shared by query and sectioned ops
//!
//! Commands arrive either as a query against `<db>.$cmd` (possibly wrapped in
//! a `$query` envelope) or as the body section of a sectioned message. The
//! helpers here find the command name, the cursor ids a command references,
//! and write remapped ids back in the same traversal order.

use bson::{Bson, Document};

use super::codec::DecodeError;

/// Commands the client library issues on its own behalf
pub const DRIVER_COMMANDS: &[&str] = &[
    "isMaster",
    "ismaster",
    "hello",
    "getnonce",
    "ping",
    "saslStart",
    "saslContinue",
];

/// True when the command name belongs to connection housekeeping
pub fn is_driver_command(name: &str) -> bool {
    DRIVER_COMMANDS.contains(&name)
}

/// Unwrap a `$query` envelope when present
pub fn command_body(doc: &Document) -> &Document {
    match doc.get("$query") {
        Some(Bson::Document(inner)) => inner,
        _ => doc,
    }
}

fn command_body_mut(doc: &mut Document) -> Option<&mut Document> {
    if matches!(doc.get("$query"), Some(Bson::Document(_))) {
        match doc.get_mut("$query") {
            Some(Bson::Document(inner)) => Some(inner),
            _ => None,
        }
    } else {
        Some(doc)
    }
}

/// First key of the command body
pub fn command_name(doc: &Document) -> Option<&str> {
    command_body(doc).keys().next().map(String::as_str)
}

/// Collection argument of a command, when its first value is a string
pub fn command_collection(doc: &Document) -> Option<&str> {
    let body = command_body(doc);
    match body.iter().next() {
        Some((_, Bson::String(coll))) => Some(coll.as_str()),
        _ => {
            // getMore names its collection in a separate field
            body.get_str("collection").ok()
        }
    }
}

fn as_cursor_id(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int64(v) => Some(*v),
        Bson::Int32(v) => Some(*v as i64),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Cursor ids a command or command reply references, zeros omitted
pub fn command_cursor_ids(doc: &Document) -> Vec<i64> {
    let body = command_body(doc);
    let mut ids = Vec::new();
    match body.keys().next().map(String::as_str) {
        Some("getMore") => {
            if let Some(id) = body.get("getMore").and_then(as_cursor_id) {
                ids.push(id);
            }
        }
        Some("killCursors") => {
            if let Ok(cursors) = body.get_array("cursors") {
                ids.extend(cursors.iter().filter_map(as_cursor_id));
            }
        }
        _ => {
            if let Ok(cursor) = body.get_document("cursor") {
                if let Some(id) = cursor.get("id").and_then(as_cursor_id) {
                    ids.push(id);
                }
            }
        }
    }
    ids.retain(|id| *id != 0);
    ids
}

/// Write replacement ids into the positions `command_cursor_ids` reported
///
/// Returns whether the document changed.
pub fn rewrite_command_cursor_ids(doc: &mut Document, new_ids: &[i64]) -> Result<bool, DecodeError> {
    let expected = command_cursor_ids(doc).len();
    if expected != new_ids.len() {
        return Err(DecodeError::CursorRewrite {
            expected,
            actual: new_ids.len(),
        });
    }
    if expected == 0 {
        return Ok(false);
    }

    let Some(body) = command_body_mut(doc) else {
        return Ok(false);
    };
    let mut replacements = new_ids.iter().copied();
    let name = body.keys().next().cloned();
    match name.as_deref() {
        Some("getMore") => {
            if let Some(id) = replacements.next() {
                body.insert("getMore", Bson::Int64(id));
            }
        }
        Some("killCursors") => {
            if let Ok(cursors) = body.get_array_mut("cursors") {
                for value in cursors.iter_mut() {
                    if as_cursor_id(value).is_some_and(|id| id != 0) {
                        if let Some(id) = replacements.next() {
                            *value = Bson::Int64(id);
                        }
                    }
                }
            }
        }
        _ => {
            if let Ok(cursor) = body.get_document_mut("cursor") {
                if let Some(id) = replacements.next() {
                    cursor.insert("id", Bson::Int64(id));
                }
            }
        }
    }
    Ok(true)
}

/// Errors a command reply reports: `$err`, `ok: 0` with `errmsg`, write errors
pub fn reply_errors(doc: &Document) -> Vec<String> {
    let mut errors = Vec::new();
    if let Ok(err) = doc.get_str("$err") {
        errors.push(err.to_string());
    }
    let ok = doc.get("ok").and_then(|v| match v {
        Bson::Double(d) => Some(*d),
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    });
    if ok == Some(0.0) {
        let msg = doc.get_str("errmsg").unwrap_or("command failed");
        errors.push(msg.to_string());
    }
    if let Ok(write_errors) = doc.get_array("writeErrors") {
        for entry in write_errors {
            if let Bson::Document(entry) = entry {
                errors.push(entry.get_str("errmsg").unwrap_or("write error").to_string());
            }
        }
    }
    if let Ok(concern) = doc.get_document("writeConcernError") {
        errors.push(concern.get_str("errmsg").unwrap_or("write concern error").to_string());
    }
    errors
}

/// Documents returned in a command reply's cursor batch
pub fn reply_batch_len(doc: &Document) -> Option<usize> {
    let cursor = doc.get_document("cursor").ok()?;
    cursor
        .get_array("firstBatch")
        .or_else(|_| cursor.get_array("nextBatch"))
        .ok()
        .map(|batch| batch.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_driver_command_detection() {
        assert!(is_driver_command("isMaster"));
        assert!(is_driver_command("saslContinue"));
        assert!(!is_driver_command("find"));
        assert!(!is_driver_command("getMore"));
    }

    #[test]
    fn test_command_name_unwraps_query_envelope() {
        let wrapped = doc! { "$query": { "count": "users" }, "$readPreference": { "mode": "secondary" } };
        assert_eq!(command_name(&wrapped), Some("count"));
        assert_eq!(command_collection(&wrapped), Some("users"));
    }

    #[test]
    fn test_get_more_cursor_ids() {
        let cmd = doc! { "getMore": 12345_i64, "collection": "users", "$db": "app" };
        assert_eq!(command_cursor_ids(&cmd), vec![12345]);
        assert_eq!(command_collection(&cmd), Some("users"));

        let mut cmd = cmd;
        assert!(rewrite_command_cursor_ids(&mut cmd, &[7]).unwrap());
        assert_eq!(cmd.get_i64("getMore").unwrap(), 7);
    }

    #[test]
    fn test_kill_cursors_skips_zero_ids() {
        let mut cmd = doc! { "killCursors": "users", "cursors": [11_i64, 0_i64, 22_i64] };
        assert_eq!(command_cursor_ids(&cmd), vec![11, 22]);

        rewrite_command_cursor_ids(&mut cmd, &[1, 2]).unwrap();
        let cursors = cmd.get_array("cursors").unwrap();
        assert_eq!(cursors[0], Bson::Int64(1));
        assert_eq!(cursors[1], Bson::Int64(0));
        assert_eq!(cursors[2], Bson::Int64(2));
    }

    #[test]
    fn test_reply_cursor_id() {
        let reply = doc! { "cursor": { "id": 99_i64, "ns": "app.users", "firstBatch": [{ "a": 1 }] }, "ok": 1.0 };
        assert_eq!(command_cursor_ids(&reply), vec![99]);
        assert_eq!(reply_batch_len(&reply), Some(1));

        let exhausted = doc! { "cursor": { "id": 0_i64, "ns": "app.users", "nextBatch": [] }, "ok": 1.0 };
        assert!(command_cursor_ids(&exhausted).is_empty());
    }

    #[test]
    fn test_rewrite_count_mismatch() {
        let mut cmd = doc! { "getMore": 5_i64, "collection": "c" };
        let err = rewrite_command_cursor_ids(&mut cmd, &[]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::CursorRewrite {
                expected: 1,
                actual: 0
            }
        ));
    }

    #[test]
    fn test_reply_errors() {
        let failed = doc! { "ok": 0.0, "errmsg": "ns not found", "code": 26 };
        assert_eq!(reply_errors(&failed), vec!["ns not found".to_string()]);

        let write = doc! { "ok": 1.0, "n": 0, "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "duplicate key" }] };
        assert_eq!(reply_errors(&write), vec!["duplicate key".to_string()]);

        assert!(reply_errors(&doc! { "ok": 1 }).is_empty());
    }
}
