//! # Message codec
//!
//! Typed request/reply frames with multi-operation bodies. Length-prefixed,
//! little-endian framing, generalized from a single opaque payload (`u32`
//! length + blob) into the fixed header this wire protocol needs: a magic
//! number, a message type, safety/behavior flags, an operation count, and a
//! body length, followed by a body that is a concatenation of per-operation
//! payloads.
//!
//! Multi-byte integers are little-endian and unaligned; strings are
//! length-prefixed (a `u32` byte count followed by UTF-8 bytes, no NUL
//! terminator needed since Rust strings aren't NUL-terminated).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CoreError, CoreResult};

pub const MAGIC: u32 = 0x4653_4652; // "FSFR" (Fabric Store FRame)
pub const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 8;

/// Maximum body size accepted from the wire, guarding against a corrupt
/// or hostile length prefix causing an unbounded allocation.
pub const MAX_BODY_LEN: u64 = 64 * 1024 * 1024;

/// Set when the batch's safety semantics require the server to reply
/// (`safety ∈ {network, storage}`), or when a message kind forces it
/// regardless of the batch's semantics, such as an object create racing
/// with an object write.
pub const SAFETY_NETWORK: u32 = 1 << 0;

/// Request/reply message kinds. Values are stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Ping = 1,
    DataCreate = 2,
    DataDelete = 3,
    DataRead = 4,
    DataWrite = 5,
    DataStatus = 6,
    MetaGet = 7,
    MetaPut = 8,
    MetaDelete = 9,
    KvPut = 10,
    KvGet = 11,
    KvDelete = 12,
    DbInsert = 13,
    DbUpdate = 14,
    DbDelete = 15,
    DbIterate = 16,
}

impl MessageType {
    pub fn from_u32(value: u32) -> CoreResult<Self> {
        use MessageType::*;
        Ok(match value {
            1 => Ping,
            2 => DataCreate,
            3 => DataDelete,
            4 => DataRead,
            5 => DataWrite,
            6 => DataStatus,
            7 => MetaGet,
            8 => MetaPut,
            9 => MetaDelete,
            10 => KvPut,
            11 => KvGet,
            12 => KvDelete,
            13 => DbInsert,
            14 => DbUpdate,
            15 => DbDelete,
            16 => DbIterate,
            other => return Err(CoreError::Protocol(format!("unknown message type {other}"))),
        })
    }
}

/// Top bit of the on-wire `type` field marks a reply frame.
const REPLY_BIT: u32 = 1 << 31;

/// A framed message: header plus a body that is a concatenation of
/// operation payloads. `operation_count` on a reply may be less than the
/// request's; callers loop [`MessageReader`] until every expected
/// sub-reply has been consumed.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub is_reply: bool,
    pub type_modifiers: u32,
    pub operation_count: u32,
    pub body: BytesMut,
}

impl Message {
    pub fn request(message_type: MessageType, type_modifiers: u32) -> Self {
        Self {
            message_type,
            is_reply: false,
            type_modifiers,
            operation_count: 0,
            body: BytesMut::new(),
        }
    }

    pub fn reply_to(request: &Message) -> Self {
        Self {
            message_type: request.message_type,
            is_reply: true,
            type_modifiers: request.type_modifiers,
            operation_count: 0,
            body: BytesMut::new(),
        }
    }

    pub fn add_operation(&mut self, payload: &[u8]) -> &mut Self {
        self.body.put_slice(payload);
        self.operation_count += 1;
        self
    }

    pub fn has_safety_network(&self) -> bool {
        self.type_modifiers & SAFETY_NETWORK != 0
    }

    /// Serializes the header + body into a single frame ready to write.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        out.put_u32_le(MAGIC);
        let wire_type = self.message_type as u32 | if self.is_reply { REPLY_BIT } else { 0 };
        out.put_u32_le(wire_type);
        out.put_u32_le(self.type_modifiers);
        out.put_u32_le(self.operation_count);
        out.put_u64_le(self.body.len() as u64);
        out.put_slice(&self.body);
        out
    }

    /// Parses a header out of exactly [`HEADER_LEN`] bytes, returning the
    /// body length still to be read.
    pub fn decode_header(mut header: &[u8]) -> CoreResult<(Self, u64)> {
        if header.len() != HEADER_LEN {
            return Err(CoreError::Protocol(format!(
                "expected {HEADER_LEN} byte header, got {}",
                header.len()
            )));
        }
        let magic = header.get_u32_le();
        if magic != MAGIC {
            return Err(CoreError::Protocol(format!("bad magic: {magic:#x}")));
        }
        let wire_type = header.get_u32_le();
        let is_reply = wire_type & REPLY_BIT != 0;
        let message_type = MessageType::from_u32(wire_type & !REPLY_BIT)?;
        let type_modifiers = header.get_u32_le();
        let operation_count = header.get_u32_le();
        let body_length = header.get_u64_le();
        if body_length > MAX_BODY_LEN {
            return Err(CoreError::Protocol(format!(
                "body length {body_length} exceeds maximum {MAX_BODY_LEN}"
            )));
        }
        Ok((
            Message {
                message_type,
                is_reply,
                type_modifiers,
                operation_count,
                body: BytesMut::new(),
            },
            body_length,
        ))
    }

    pub fn with_body(mut self, body: BytesMut) -> Self {
        self.body = body;
        self
    }
}

/// Cursor-based reader over a message body, used by executors to pull
/// fixed-width fields and length-prefixed bytes/strings off the wire in
/// the order the codec wrote them.
pub struct MessageReader<'a> {
    cursor: &'a [u8],
}

impl<'a> MessageReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { cursor: body }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.len()
    }

    pub fn get_4(&mut self) -> CoreResult<u32> {
        if self.cursor.len() < 4 {
            return Err(CoreError::Protocol("truncated u32 field".into()));
        }
        Ok(self.cursor.get_u32_le())
    }

    pub fn get_8(&mut self) -> CoreResult<u64> {
        if self.cursor.len() < 8 {
            return Err(CoreError::Protocol("truncated u64 field".into()));
        }
        Ok(self.cursor.get_u64_le())
    }

    pub fn get_n(&mut self, len: usize) -> CoreResult<Vec<u8>> {
        if self.cursor.len() < len {
            return Err(CoreError::Protocol("truncated byte field".into()));
        }
        let mut out = vec![0u8; len];
        self.cursor.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Reads a `u32` length prefix followed by that many bytes.
    pub fn get_bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.get_4()? as usize;
        self.get_n(len)
    }

    pub fn get_string(&mut self) -> CoreResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|e| CoreError::Protocol(e.to_string()))
    }
}

/// Symmetric builder helpers mirroring [`MessageReader`]'s accessors.
pub trait MessageBuilderExt {
    fn append_4(&mut self, value: u32) -> &mut Self;
    fn append_8(&mut self, value: u64) -> &mut Self;
    fn append_bytes(&mut self, value: &[u8]) -> &mut Self;
    fn append_string(&mut self, value: &str) -> &mut Self;
}

impl MessageBuilderExt for BytesMut {
    fn append_4(&mut self, value: u32) -> &mut Self {
        self.put_u32_le(value);
        self
    }

    fn append_8(&mut self, value: u64) -> &mut Self {
        self.put_u64_le(value);
        self
    }

    fn append_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.put_u32_le(value.len() as u32);
        self.put_slice(value);
        self
    }

    fn append_string(&mut self, value: &str) -> &mut Self {
        self.append_bytes(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut msg = Message::request(MessageType::DataWrite, SAFETY_NETWORK);
        let mut body = BytesMut::new();
        body.append_8(4096).append_8(0).append_bytes(b"hello");
        msg.add_operation(&body);

        let encoded = msg.encode();
        let (decoded, body_len) = Message::decode_header(&encoded[..HEADER_LEN]).unwrap();
        assert_eq!(body_len as usize, encoded.len() - HEADER_LEN);
        assert_eq!(decoded.message_type, MessageType::DataWrite);
        assert!(!decoded.is_reply);
        assert!(decoded.has_safety_network());
        assert_eq!(decoded.operation_count, 1);
    }

    #[test]
    fn reply_sets_top_bit() {
        let request = Message::request(MessageType::KvGet, 0);
        let reply = Message::reply_to(&request);
        let encoded = reply.encode();
        let (decoded, _) = Message::decode_header(&encoded[..HEADER_LEN]).unwrap();
        assert!(decoded.is_reply);
        assert_eq!(decoded.message_type, MessageType::KvGet);
    }

    #[test]
    fn reader_reads_fields_in_order() {
        let mut body = BytesMut::new();
        body.append_4(7).append_8(99).append_string("ns");
        let mut reader = MessageReader::new(&body);
        assert_eq!(reader.get_4().unwrap(), 7);
        assert_eq!(reader.get_8().unwrap(), 99);
        assert_eq!(reader.get_string().unwrap(), "ns");
        assert_eq!(reader.remaining(), 0);
    }
}
