//! Frame model for the duplex session protocol.
//!
//! A frame is the decoded message unit exchanged between the duplex
//! connection and the session engine. On the wire each frame sits inside
//! one length-delimited chunk and starts with a fixed 6-byte header:
//!
//! ```text
//! stream_id u32 | kind u8 | flags u8
//! ```
//!
//! followed by a kind-specific body. All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol version carried by Setup frames.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed frame header size (stream id + kind + flags).
pub const HEADER_LEN: usize = 6;

/// Sender expects an echo of this frame (Keepalive only).
pub const FLAG_RESPOND: u8 = 0x01;
/// Terminal frame of its stream (always set on outgoing Responses).
pub const FLAG_COMPLETE: u8 = 0x02;
/// Payload carries a metadata section before the data.
pub const FLAG_METADATA: u8 = 0x04;

const KIND_SETUP: u8 = 0x01;
const KIND_KEEPALIVE: u8 = 0x02;
const KIND_REQUEST: u8 = 0x03;
const KIND_FIRE_FORGET: u8 = 0x04;
const KIND_RESPONSE: u8 = 0x05;
const KIND_ERROR: u8 = 0x06;

/// Wire-level error. Always scoped to one connection, never server-fatal.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("truncated frame body")]
    Truncated,

    #[error("invalid frame: {0}")]
    Invalid(&'static str),
}

/// Protocol error codes carried by Error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The first frame was not a well-formed Setup.
    InvalidSetup,
    /// Setup version not supported by this server.
    UnsupportedSetup,
    /// The setup handler declined the connection.
    RejectedSetup,
    /// Connection-scoped failure; the connection is about to close.
    ConnectionError,
    /// A request handler failed.
    ApplicationError,
    /// The frame was not acceptable on its stream.
    Rejected,
    /// Unrecognized code, preserved as received.
    Other(u32),
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::InvalidSetup => 0x0001,
            ErrorCode::UnsupportedSetup => 0x0002,
            ErrorCode::RejectedSetup => 0x0003,
            ErrorCode::ConnectionError => 0x0101,
            ErrorCode::ApplicationError => 0x0201,
            ErrorCode::Rejected => 0x0202,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0x0001 => ErrorCode::InvalidSetup,
            0x0002 => ErrorCode::UnsupportedSetup,
            0x0003 => ErrorCode::RejectedSetup,
            0x0101 => ErrorCode::ConnectionError,
            0x0201 => ErrorCode::ApplicationError,
            0x0202 => ErrorCode::Rejected,
            other => ErrorCode::Other(other),
        }
    }
}

/// Frame payload: application data with an optional metadata section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            metadata: None,
            data: data.into(),
        }
    }

    pub fn with_metadata(metadata: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            metadata: Some(metadata.into()),
            data: data.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        let md = self.metadata.as_ref().map(|m| 4 + m.len()).unwrap_or(0);
        md + self.data.len()
    }

    fn encode(&self, dst: &mut BytesMut) {
        if let Some(md) = &self.metadata {
            dst.put_u32(md.len() as u32);
            dst.extend_from_slice(md);
        }
        dst.extend_from_slice(&self.data);
    }

    fn decode(flags: u8, mut buf: Bytes) -> Result<Self, WireError> {
        let metadata = if flags & FLAG_METADATA != 0 {
            if buf.remaining() < 4 {
                return Err(WireError::Truncated);
            }
            let md_len = buf.get_u32() as usize;
            if buf.remaining() < md_len {
                return Err(WireError::Truncated);
            }
            Some(buf.split_to(md_len))
        } else {
            None
        };
        Ok(Self {
            metadata,
            data: buf,
        })
    }
}

/// Frame body, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// First frame of a connection, stream 0 only.
    Setup {
        version: u16,
        keepalive_interval_ms: u32,
        max_lifetime_ms: u32,
        payload: Payload,
    },
    /// Liveness probe on stream 0; `respond` asks for an echo.
    Keepalive { respond: bool, data: Bytes },
    /// Client-initiated stream expecting exactly one Response.
    Request { payload: Payload },
    /// Client-initiated stream expecting no response.
    FireForget { payload: Payload },
    /// Terminal server reply on a request stream.
    Response { payload: Payload },
    /// Stream-scoped (non-zero stream) or connection-scoped (stream 0) error.
    Error { code: ErrorCode, message: String },
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub body: FrameBody,
}

impl Frame {
    pub fn setup(
        keepalive_interval_ms: u32,
        max_lifetime_ms: u32,
        payload: Payload,
    ) -> Self {
        Self {
            stream_id: 0,
            body: FrameBody::Setup {
                version: PROTOCOL_VERSION,
                keepalive_interval_ms,
                max_lifetime_ms,
                payload,
            },
        }
    }

    pub fn keepalive(data: impl Into<Bytes>, respond: bool) -> Self {
        Self {
            stream_id: 0,
            body: FrameBody::Keepalive {
                respond,
                data: data.into(),
            },
        }
    }

    pub fn request(stream_id: u32, payload: Payload) -> Self {
        Self {
            stream_id,
            body: FrameBody::Request { payload },
        }
    }

    pub fn fire_forget(stream_id: u32, payload: Payload) -> Self {
        Self {
            stream_id,
            body: FrameBody::FireForget { payload },
        }
    }

    pub fn response(stream_id: u32, payload: Payload) -> Self {
        Self {
            stream_id,
            body: FrameBody::Response { payload },
        }
    }

    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stream_id,
            body: FrameBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.body {
            FrameBody::Setup { .. } => "setup",
            FrameBody::Keepalive { .. } => "keepalive",
            FrameBody::Request { .. } => "request",
            FrameBody::FireForget { .. } => "fire_forget",
            FrameBody::Response { .. } => "response",
            FrameBody::Error { .. } => "error",
        }
    }

    fn kind(&self) -> u8 {
        match &self.body {
            FrameBody::Setup { .. } => KIND_SETUP,
            FrameBody::Keepalive { .. } => KIND_KEEPALIVE,
            FrameBody::Request { .. } => KIND_REQUEST,
            FrameBody::FireForget { .. } => KIND_FIRE_FORGET,
            FrameBody::Response { .. } => KIND_RESPONSE,
            FrameBody::Error { .. } => KIND_ERROR,
        }
    }

    fn flags(&self) -> u8 {
        fn metadata_flag(payload: &Payload) -> u8 {
            if payload.metadata.is_some() {
                FLAG_METADATA
            } else {
                0
            }
        }

        match &self.body {
            FrameBody::Setup { payload, .. } => metadata_flag(payload),
            FrameBody::Keepalive { respond, .. } => {
                if *respond {
                    FLAG_RESPOND
                } else {
                    0
                }
            }
            FrameBody::Request { payload } | FrameBody::FireForget { payload } => {
                metadata_flag(payload)
            }
            FrameBody::Response { payload } => FLAG_COMPLETE | metadata_flag(payload),
            FrameBody::Error { .. } => 0,
        }
    }

    /// Exact size of the encoded frame, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match &self.body {
                FrameBody::Setup { payload, .. } => 10 + payload.encoded_len(),
                FrameBody::Keepalive { data, .. } => data.len(),
                FrameBody::Request { payload }
                | FrameBody::FireForget { payload }
                | FrameBody::Response { payload } => payload.encoded_len(),
                FrameBody::Error { message, .. } => 4 + message.len(),
            }
    }

    /// Encode the frame body into `dst` (length prefixing happens one
    /// stage below, in the codec).
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32(self.stream_id);
        dst.put_u8(self.kind());
        dst.put_u8(self.flags());

        match &self.body {
            FrameBody::Setup {
                version,
                keepalive_interval_ms,
                max_lifetime_ms,
                payload,
            } => {
                dst.put_u16(*version);
                dst.put_u32(*keepalive_interval_ms);
                dst.put_u32(*max_lifetime_ms);
                payload.encode(dst);
            }
            FrameBody::Keepalive { data, .. } => {
                dst.extend_from_slice(data);
            }
            FrameBody::Request { payload }
            | FrameBody::FireForget { payload }
            | FrameBody::Response { payload } => {
                payload.encode(dst);
            }
            FrameBody::Error { code, message } => {
                dst.put_u32(code.code());
                dst.extend_from_slice(message.as_bytes());
            }
        }
    }

    /// Decode one complete length-delimited chunk into a frame.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let stream_id = buf.get_u32();
        let kind = buf.get_u8();
        let flags = buf.get_u8();

        let body = match kind {
            KIND_SETUP => {
                if buf.remaining() < 10 {
                    return Err(WireError::Truncated);
                }
                let version = buf.get_u16();
                let keepalive_interval_ms = buf.get_u32();
                let max_lifetime_ms = buf.get_u32();
                FrameBody::Setup {
                    version,
                    keepalive_interval_ms,
                    max_lifetime_ms,
                    payload: Payload::decode(flags, buf)?,
                }
            }
            KIND_KEEPALIVE => FrameBody::Keepalive {
                respond: flags & FLAG_RESPOND != 0,
                data: buf,
            },
            KIND_REQUEST => FrameBody::Request {
                payload: Payload::decode(flags, buf)?,
            },
            KIND_FIRE_FORGET => FrameBody::FireForget {
                payload: Payload::decode(flags, buf)?,
            },
            KIND_RESPONSE => FrameBody::Response {
                payload: Payload::decode(flags, buf)?,
            },
            KIND_ERROR => {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                let code = ErrorCode::from_code(buf.get_u32());
                let message = String::from_utf8(buf.to_vec())
                    .map_err(|_| WireError::Invalid("error message is not UTF-8"))?;
                FrameBody::Error { code, message }
            }
            other => return Err(WireError::UnknownKind(other)),
        };

        Ok(Self { stream_id, body })
    }
}
