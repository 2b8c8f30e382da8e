//! Length-framed message transport.
//!
//! Every message on the duplex link is encoded as
//! `[u32 message id][u32 payload length][payload bytes]`, both integers in
//! native-endian byte order. The two ends of the pipe are always built from
//! the same binary (or workspace), so the encoding is fixed at build time and
//! consistent on both sides. An empty payload is encoded as length 0 with no
//! payload bytes.

use std::io::Read;
use std::io::Write;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Size of the fixed frame header: two native-endian `u32`s.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single frame payload. Frames above this are treated the
/// same as frames with an unknown message id: the stream is no longer
/// trustworthy.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_id: u32,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&self.message_id.to_ne_bytes());
        buf[4..].copy_from_slice(&self.payload_length.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; HEADER_SIZE]) -> Self {
        let mut id = [0u8; 4];
        let mut len = [0u8; 4];
        id.copy_from_slice(&buf[..4]);
        len.copy_from_slice(&buf[4..]);
        Self {
            message_id: u32::from_ne_bytes(id),
            payload_length: u32::from_ne_bytes(len),
        }
    }
}

/// One raw frame as read off the stream. The payload is still JSON at this
/// point; dispatching on `message_id` decides its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u32,
    pub payload: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The peer sent a message id outside the range this side accepts. The
    /// stream must be considered poisoned afterwards: the payload length of a
    /// frame we don't know cannot be trusted to resynchronize on.
    #[error("received unknown message with id {message_id} and length {payload_length}")]
    InvalidMessageId { message_id: u32, payload_length: u32 },

    #[error("frame payload of {0} bytes exceeds the maximum of {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(u32),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serializes a message payload, mapping the empty JSON object to an empty
/// frame payload.
pub fn encode_payload<M: Serialize>(message: &M) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(message)?;
    if json == b"{}" {
        return Ok(Vec::new());
    }
    Ok(json)
}

/// Writes one frame to a blocking stream. Used by the worker runtime, which
/// is single-threaded and synchronous.
pub fn write_frame(stream: &mut impl Write, message_id: u32, payload: &[u8]) -> std::io::Result<()> {
    let header = FrameHeader {
        message_id,
        payload_length: payload.len() as u32,
    };
    stream.write_all(&header.to_bytes())?;
    if !payload.is_empty() {
        stream.write_all(payload)?;
    }
    stream.flush()
}

/// Reads one frame from a blocking stream.
///
/// A truncated header or payload surfaces as [`std::io::ErrorKind::UnexpectedEof`].
pub fn read_frame(stream: &mut impl Read) -> Result<Frame, CodecError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes)?;
    let header = FrameHeader::from_bytes(header_bytes);

    if header.payload_length > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(header.payload_length));
    }

    let mut payload = vec![0u8; header.payload_length as usize];
    stream.read_exact(&mut payload)?;
    Ok(Frame {
        message_id: header.message_id,
        payload,
    })
}

/// Writes one frame to an async stream. Used by the server side of the pipe.
pub async fn write_frame_async<W>(stream: &mut W, message_id: u32, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader {
        message_id,
        payload_length: payload.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await
}

/// Reads one frame from an async stream.
pub async fn read_frame_async<R>(stream: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(header_bytes);

    if header.payload_length > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(header.payload_length));
    }

    let mut payload = vec![0u8; header.payload_length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Frame {
        message_id: header.message_id,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            message_id: 1030,
            payload_length: 17,
        };
        assert_eq!(header, FrameHeader::from_bytes(header.to_bytes()));
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 40, br#"{"variant":1}"#).expect("write");

        let frame = read_frame(&mut Cursor::new(buf)).expect("read");
        assert_eq!(frame.message_id, 40);
        assert_eq!(frame.payload, br#"{"variant":1}"#);
    }

    #[test]
    fn empty_payload_has_no_body() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 3, &[]).expect("write");
        assert_eq!(buf.len(), HEADER_SIZE);

        let frame = read_frame(&mut Cursor::new(buf)).expect("read");
        assert_eq!(frame.payload, Vec::<u8>::new());
    }

    #[test]
    fn truncated_header_is_eof() {
        let err = read_frame(&mut Cursor::new(vec![0u8; 3])).expect_err("short header");
        match err {
            CodecError::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_payload_is_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 10, b"{}....").expect("write");
        buf.truncate(HEADER_SIZE + 2);

        let err = read_frame(&mut Cursor::new(buf)).expect_err("short payload");
        match err {
            CodecError::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn async_frame_round_trip() {
        let (mut left, mut right) = tokio::io::duplex(256);
        write_frame_async(&mut left, 1000, &[]).await.expect("write");
        write_frame_async(&mut left, 1020, br#"{"x":1}"#).await.expect("write");

        let first = read_frame_async(&mut right).await.expect("read");
        let second = read_frame_async(&mut right).await.expect("read");
        assert_eq!(first.message_id, 1000);
        assert!(first.payload.is_empty());
        assert_eq!(second.message_id, 1020);
        assert_eq!(second.payload, br#"{"x":1}"#);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let header = FrameHeader {
            message_id: 10,
            payload_length: MAX_PAYLOAD_SIZE + 1,
        };
        let err = read_frame(&mut Cursor::new(header.to_bytes().to_vec())).expect_err("too large");
        assert!(matches!(err, CodecError::PayloadTooLarge(_)));
    }
}
