//! Versioned message codec.
//!
//! A frame body is one message:
//!
//! ```text
//! request: kind=0 (u8) | id (i64) | sender host (str) | sender port (u16) | subject (str) | payload (bytes)
//! reply:   kind=1 (u8) | id (i64) | status (u8) | payload (bytes)
//! ```
//!
//! `V1` prefixes strings and byte arrays with a big-endian `u32` length,
//! `V2` with an unsigned LEB128 varint.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Address, MessagingError, Result};

const KIND_REQUEST: u8 = 0;
const KIND_REPLY: u8 = 1;

/// Protocol versions, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 2] = [ProtocolVersion::V1, ProtocolVersion::V2];

    pub fn latest() -> Self {
        ProtocolVersion::V2
    }

    pub fn version(&self) -> u16 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    pub fn from_version(version: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.version() == version)
    }

    pub fn encode(&self, message: &ProtocolMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(message.payload().len() + 64);
        match message {
            ProtocolMessage::Request(request) => {
                buf.put_u8(KIND_REQUEST);
                buf.put_i64(request.id);
                self.put_bytes(&mut buf, request.sender.host().as_bytes());
                buf.put_u16(request.sender.port());
                self.put_bytes(&mut buf, request.subject.as_bytes());
                self.put_bytes(&mut buf, &request.payload);
            }
            ProtocolMessage::Reply(reply) => {
                buf.put_u8(KIND_REPLY);
                buf.put_i64(reply.id);
                buf.put_u8(reply.status.code());
                self.put_bytes(&mut buf, &reply.payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(&self, mut body: Bytes) -> Result<ProtocolMessage> {
        if body.remaining() < 9 {
            return Err(malformed("truncated message header"));
        }
        let kind = body.get_u8();
        let id = body.get_i64();
        let message = match kind {
            KIND_REQUEST => {
                let host = self.get_string(&mut body)?;
                if body.remaining() < 2 {
                    return Err(malformed("truncated sender port"));
                }
                let port = body.get_u16();
                let subject = self.get_string(&mut body)?;
                let payload = self.get_bytes(&mut body)?;
                ProtocolMessage::Request(ProtocolRequest {
                    id,
                    sender: Address::new(host, port),
                    subject,
                    payload,
                })
            }
            KIND_REPLY => {
                if !body.has_remaining() {
                    return Err(malformed("truncated reply status"));
                }
                let status = ReplyStatus::from_code(body.get_u8())
                    .ok_or_else(|| malformed("unknown reply status"))?;
                let payload = self.get_bytes(&mut body)?;
                ProtocolMessage::Reply(ProtocolReply {
                    id,
                    status,
                    payload,
                })
            }
            other => return Err(malformed(&format!("unknown message kind {other}"))),
        };
        if body.has_remaining() {
            return Err(malformed("trailing bytes after message"));
        }
        Ok(message)
    }

    fn put_bytes(&self, buf: &mut BytesMut, bytes: &[u8]) {
        match self {
            ProtocolVersion::V1 => buf.put_u32(bytes.len() as u32),
            ProtocolVersion::V2 => put_varint(buf, bytes.len() as u32),
        }
        buf.put_slice(bytes);
    }

    fn get_bytes(&self, body: &mut Bytes) -> Result<Bytes> {
        let len = match self {
            ProtocolVersion::V1 => {
                if body.remaining() < 4 {
                    return Err(malformed("truncated length"));
                }
                body.get_u32()
            }
            ProtocolVersion::V2 => get_varint(body)?,
        } as usize;
        if body.remaining() < len {
            return Err(malformed("length exceeds message"));
        }
        Ok(body.split_to(len))
    }

    fn get_string(&self, body: &mut Bytes) -> Result<String> {
        let bytes = self.get_bytes(body)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
    }
}

fn malformed(reason: &str) -> MessagingError {
    MessagingError::ProtocolException(reason.to_string())
}

fn put_varint(buf: &mut BytesMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(body: &mut Bytes) -> Result<u32> {
    let mut value = 0u32;
    for shift in (0..35).step_by(7) {
        if !body.has_remaining() {
            return Err(malformed("truncated varint"));
        }
        let byte = body.get_u8();
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(malformed("varint too long"))
}

/// Id of a request whose body could not be decoded, so it can still be
/// answered with [`ReplyStatus::ProtocolException`].
pub(crate) fn request_id(body: &[u8]) -> Option<i64> {
    if body.len() < 9 || body[0] != KIND_REQUEST {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&body[1..9]);
    Some(i64::from_be_bytes(id))
}

// ============================================================================
// Messages
// ============================================================================

/// Status carried by every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    ErrorNoHandler,
    ErrorHandlerException,
    ProtocolException,
}

impl ReplyStatus {
    pub fn code(&self) -> u8 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::ErrorNoHandler => 1,
            ReplyStatus::ErrorHandlerException => 2,
            ReplyStatus::ProtocolException => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReplyStatus::Ok),
            1 => Some(ReplyStatus::ErrorNoHandler),
            2 => Some(ReplyStatus::ErrorHandlerException),
            3 => Some(ReplyStatus::ProtocolException),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRequest {
    pub id: i64,
    pub sender: Address,
    pub subject: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolReply {
    pub id: i64,
    pub status: ReplyStatus,
    pub payload: Bytes,
}

impl ProtocolReply {
    pub fn ok(id: i64, payload: Bytes) -> Self {
        Self {
            id,
            status: ReplyStatus::Ok,
            payload,
        }
    }

    pub fn failure(id: i64, status: ReplyStatus, message: Option<String>) -> Self {
        Self {
            id,
            status,
            payload: message.map(Bytes::from).unwrap_or_default(),
        }
    }

    /// Turn the reply into the caller's result.
    pub fn into_result(self, subject: &str) -> Result<Bytes> {
        match self.status {
            ReplyStatus::Ok => Ok(self.payload),
            ReplyStatus::ErrorNoHandler => Err(MessagingError::NoRemoteHandler(subject.to_string())),
            ReplyStatus::ErrorHandlerException => Err(MessagingError::RemoteHandlerFailure(
                String::from_utf8_lossy(&self.payload).into_owned(),
            )),
            ReplyStatus::ProtocolException => Err(MessagingError::ProtocolException(format!(
                "peer could not decode request with subject '{subject}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Request(ProtocolRequest),
    Reply(ProtocolReply),
}

impl ProtocolMessage {
    pub fn id(&self) -> i64 {
        match self {
            ProtocolMessage::Request(request) => request.id,
            ProtocolMessage::Reply(reply) => reply.id,
        }
    }

    fn payload(&self) -> &Bytes {
        match self {
            ProtocolMessage::Request(request) => &request.payload,
            ProtocolMessage::Reply(reply) => &reply.payload,
        }
    }
}
