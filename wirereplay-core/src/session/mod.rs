//! Connections to the replay target
//!
//! The replay engine only needs to dial, send a framed message, read framed
//! messages back, and close. [`WireConnection`] captures that surface so the
//! scheduler can run against real sockets or scripted test doubles alike.
//! No read or write timeouts are applied: a slow cursor-bearing session must
//! not be aborted by the transport.

mod tcp;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{DecodeError, HEADER_LEN, MsgHeader};

pub use tcp::{DEFAULT_PORT, TcpDialer, parse_address};

/// Errors raised by a connection
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a message that does not decode
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Target URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The peer closed the connection
    #[error("Connection closed")]
    Closed,
}

impl SessionError {
    /// True for failures of the transport rather than of the data
    pub fn is_transport(&self) -> bool {
        !matches!(self, SessionError::Decode(_))
    }
}

/// One open session with the replay target
#[async_trait]
pub trait WireConnection: Send {
    /// Allocate the request id for the next outbound message
    fn next_request_id(&mut self) -> i32;

    /// Write one complete message
    async fn send(&mut self, message: &[u8]) -> Result<(), SessionError>;

    /// Read one complete message
    async fn receive(&mut self) -> Result<(MsgHeader, Vec<u8>), SessionError>;

    /// Close the session
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens sessions to the replay target
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a new session
    async fn dial(&self) -> Result<Box<dyn WireConnection>, SessionError>;
}

/// Read one length-framed message
pub async fn read_message<R>(reader: &mut R) -> Result<(MsgHeader, Vec<u8>), SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(SessionError::Closed);
        }
        return Err(e.into());
    }
    let header = MsgHeader::parse(&header)?;
    let mut body = vec![0u8; header.body_len()?];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

/// [`WireConnection`] over any byte stream
pub struct StreamConnection<S> {
    stream: S,
    request_id: i32,
}

impl<S> StreamConnection<S> {
    /// Wrap an open stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            request_id: 0,
        }
    }
}

#[async_trait]
impl<S> WireConnection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn next_request_id(&mut self) -> i32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    async fn send(&mut self, message: &[u8]) -> Result<(), SessionError> {
        self.stream.write_all(message).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<(MsgHeader, Vec<u8>), SessionError> {
        read_message(&mut self.stream).await
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MsgOp, Op};
    use bson::doc;

    #[tokio::test]
    async fn test_stream_connection_roundtrip() {
        let ping = Op::Msg(MsgOp::from_document(&doc! { "ping": 1, "$db": "admin" }).unwrap());
        let request = ping.encode(1, 0);
        let reply = Op::Msg(MsgOp::from_document(&doc! { "ok": 1.0 }).unwrap()).encode(77, 1);

        let mock = tokio_test::io::Builder::new()
            .write(&request)
            .read(&reply)
            .build();
        let mut conn = StreamConnection::new(mock);

        let reply = ping.execute(&mut conn).await.unwrap().unwrap();
        assert_eq!(reply.header.request_id, 77);
        assert_eq!(reply.header.response_to, 1);
        assert!(reply.errors().is_empty());
    }

    #[tokio::test]
    async fn test_read_message_reports_closed_peer() {
        let mut mock = tokio_test::io::Builder::new().read(&[1, 2, 3]).build();
        let err = read_message(&mut mock).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_read_message_rejects_bad_length() {
        let mut header = Vec::new();
        header.extend_from_slice(&4i32.to_le_bytes());
        header.extend_from_slice(&[0u8; 12]);
        let mut mock = tokio_test::io::Builder::new().read(&header).build();
        let err = read_message(&mut mock).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Decode(DecodeError::InvalidMessageLength(4))
        ));
        assert!(!err.is_transport());
    }
}
