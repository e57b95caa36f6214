//! Wire framing for the dispatch layer.
//!
//! Every frame is a fixed header followed by a payload, little-endian:
//!
//! ```text
//!   [4 bytes: magic "PGWF" = 0x50475746]
//!   [1 byte:  kind]
//!   [4 bytes: id]           call id, ping nonce or last accepted call id
//!   [4 bytes: payload_len]
//!   [payload_len bytes]
//!
//! Call   (1): [2 bytes: method_len] [method UTF-8] [body]
//! Reply  (2): [1 byte: status]      [body]
//! Ping   (3): empty
//! Pong   (4): empty
//! GoAway (5): empty
//! ```
//!
//! Bodies are opaque to the front-end.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_MAGIC: u32 = 0x5047_5746; // "PGWF"

/// Largest accepted payload.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

const HEADER_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Call = 1,
    Reply = 2,
    Ping = 3,
    Pong = 4,
    GoAway = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Call),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            5 => Ok(Self::GoAway),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Outcome of a call, as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    InvalidArgument = 1,
    Unimplemented = 2,
    /// The connection is shutting down and refused the call.
    Unavailable = 3,
    ResourceExhausted = 4,
    Internal = 5,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::InvalidArgument => "invalid_argument",
            Status::Unimplemented => "unimplemented",
            Status::Unavailable => "unavailable",
            Status::ResourceExhausted => "resource_exhausted",
            Status::Internal => "internal",
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Ok),
            1 => Ok(Self::InvalidArgument),
            2 => Ok(Self::Unimplemented),
            3 => Ok(Self::Unavailable),
            4 => Ok(Self::ResourceExhausted),
            5 => Ok(Self::Internal),
            _ => Err(FrameError::Malformed("unknown status")),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream at a frame boundary.
    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid magic: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("payload too large: {0} bytes")]
    TooLarge(u32),

    #[error("invalid UTF-8 in method name")]
    InvalidUtf8,

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Call { id: u32, method: String, body: Vec<u8> },
    Reply { id: u32, status: Status, body: Vec<u8> },
    Ping { nonce: u32 },
    Pong { nonce: u32 },
    /// No calls after `last_id` will be served on this connection.
    GoAway { last_id: u32 },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Call { .. } => FrameKind::Call,
            Frame::Reply { .. } => FrameKind::Reply,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::Pong { .. } => FrameKind::Pong,
            Frame::GoAway { .. } => FrameKind::GoAway,
        }
    }

    /// Read one frame.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, FrameError> {
        let magic = match reader.read_u32_le().await {
            Ok(magic) => magic,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
            Err(e) => return Err(e.into()),
        };
        if magic != FRAME_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: FRAME_MAGIC,
                got: magic,
            });
        }

        let kind = FrameKind::try_from(reader.read_u8().await?)?;
        let id = reader.read_u32_le().await?;
        let len = reader.read_u32_le().await?;
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(len));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;

        match kind {
            FrameKind::Call => {
                if payload.len() < 2 {
                    return Err(FrameError::Malformed("call payload shorter than method length"));
                }
                let method_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
                if payload.len() < 2 + method_len {
                    return Err(FrameError::Malformed("method name overruns payload"));
                }
                let body = payload.split_off(2 + method_len);
                let method = String::from_utf8(payload[2..].to_vec())
                    .map_err(|_| FrameError::InvalidUtf8)?;
                Ok(Frame::Call { id, method, body })
            }
            FrameKind::Reply => {
                if payload.is_empty() {
                    return Err(FrameError::Malformed("reply payload missing status"));
                }
                let status = Status::try_from(payload[0])?;
                let body = payload.split_off(1);
                Ok(Frame::Reply { id, status, body })
            }
            FrameKind::Ping => Ok(Frame::Ping { nonce: id }),
            FrameKind::Pong => Ok(Frame::Pong { nonce: id }),
            FrameKind::GoAway => Ok(Frame::GoAway { last_id: id }),
        }
    }

    /// Write this frame and flush.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), FrameError> {
        let (id, payload_len) = match self {
            Frame::Call { id, method, body } => {
                if method.len() > u16::MAX as usize {
                    return Err(FrameError::Malformed("method name longer than 65535 bytes"));
                }
                (*id, 2 + method.len() + body.len())
            }
            Frame::Reply { id, body, .. } => (*id, 1 + body.len()),
            Frame::Ping { nonce } | Frame::Pong { nonce } => (*nonce, 0),
            Frame::GoAway { last_id } => (*last_id, 0),
        };
        let payload_len = u32::try_from(payload_len)
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or(FrameError::TooLarge(u32::MAX))?;

        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        header[4] = self.kind() as u8;
        header[5..9].copy_from_slice(&id.to_le_bytes());
        header[9..13].copy_from_slice(&payload_len.to_le_bytes());
        writer.write_all(&header).await?;

        match self {
            Frame::Call { method, body, .. } => {
                writer.write_u16_le(method.len() as u16).await?;
                writer.write_all(method.as_bytes()).await?;
                writer.write_all(body).await?;
            }
            Frame::Reply { status, body, .. } => {
                writer.write_u8(*status as u8).await?;
                writer.write_all(body).await?;
            }
            Frame::Ping { .. } | Frame::Pong { .. } | Frame::GoAway { .. } => {}
        }

        writer.flush().await?;
        Ok(())
    }
}
