//! Length-prefixed, tag/varint encoded wire format used by the raft control rpcs.
//!
//! A frame is a 4 byte big-endian body length followed by `(tag, value)` pairs.
//! The low 3 bits of a tag select the wire type, the remaining bits are the
//! field index. Zero values and empty byte strings are not written.

mod parser;

pub use parser::PbParser;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RaftError, Result};

pub const TYPE_VAR_INT: u8 = 0;
pub const TYPE_FIX64: u8 = 1;
pub const TYPE_LENGTH_DELIMITED: u8 = 2;
pub const TYPE_FIX32: u8 = 5;

/// Receives decoded fields from [`PbParser`].
///
/// Returning `false` from a `read_*` method makes the parser skip the rest of
/// the current frame; `end` is not called for a skipped frame.
pub trait PbCallback {
    fn begin(&mut self, _len: usize) {}

    fn end(&mut self) {}

    fn read_varint(&mut self, _index: u32, _value: u64) -> bool {
        true
    }

    fn read_fixed32(&mut self, _index: u32, _value: u32) -> bool {
        true
    }

    fn read_fixed64(&mut self, _index: u32, _value: u64) -> bool {
        true
    }

    /// A length-delimited field may arrive in several chunks; `begin` marks the
    /// first one and `end` the last one. `total` is the full field length.
    fn read_bytes(
        &mut self,
        _index: u32,
        _chunk: &[u8],
        _total: usize,
        _begin: bool,
        _end: bool,
    ) -> bool {
        true
    }
}

/// Something that can write itself as a frame body.
pub trait PbEncode {
    fn encode(&self, buf: &mut BytesMut);

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Writes the length prefix followed by the body.
    fn encode_frame(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32(0);
        self.encode(buf);
        let len = (buf.len() - start - 4) as u32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// Decodes a complete body (no length prefix) into a message that collects
/// its own fields.
pub fn decode_body<M: PbCallback + Default>(body: &[u8]) -> Result<M> {
    let mut msg = M::default();
    let mut parser = PbParser::new(body.len());
    parser.parse(&(body.len() as u32).to_be_bytes(), &mut msg)?;
    parser.parse(body, &mut msg)?;
    if parser.completed_frames() != 1 {
        return Err(RaftError::Protocol("message rejected by decoder".to_string()));
    }
    Ok(msg)
}

/// Collects the chunks of one length-delimited field.
#[derive(Debug, Default)]
pub struct BytesAccumulator {
    buf: Vec<u8>,
}

impl BytesAccumulator {
    pub fn push(&mut self, chunk: &[u8], total: usize, begin: bool, end: bool) -> Option<Vec<u8>> {
        if begin {
            self.buf.clear();
            self.buf.reserve(total);
        }
        self.buf.extend_from_slice(chunk);
        if end {
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }
}

pub fn varint_size(mut value: u64) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

pub fn write_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn write_tag(buf: &mut BytesMut, index: u32, wire_type: u8) {
    write_varint(buf, ((index as u64) << 3) | wire_type as u64);
}

pub fn write_uint(buf: &mut BytesMut, index: u32, value: u64) {
    if value != 0 {
        write_tag(buf, index, TYPE_VAR_INT);
        write_varint(buf, value);
    }
}

pub fn write_bool(buf: &mut BytesMut, index: u32, value: bool) {
    write_uint(buf, index, value as u64);
}

pub fn write_fix32(buf: &mut BytesMut, index: u32, value: u32) {
    if value != 0 {
        write_tag(buf, index, TYPE_FIX32);
        buf.put_u32_le(value);
    }
}

pub fn write_fix64(buf: &mut BytesMut, index: u32, value: u64) {
    if value != 0 {
        write_tag(buf, index, TYPE_FIX64);
        buf.put_u64_le(value);
    }
}

pub fn write_bytes(buf: &mut BytesMut, index: u32, data: &[u8]) {
    if !data.is_empty() {
        write_tag(buf, index, TYPE_LENGTH_DELIMITED);
        write_varint(buf, data.len() as u64);
        buf.put_slice(data);
    }
}

/// Writes a nested message; unlike [`write_bytes`] an all-default message is
/// still written so repeated fields keep their element count.
pub fn write_message<M: PbEncode>(buf: &mut BytesMut, index: u32, msg: &M) {
    let body = msg.to_bytes();
    write_tag(buf, index, TYPE_LENGTH_DELIMITED);
    write_varint(buf, body.len() as u64);
    buf.put_slice(&body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug)]
    struct Sample {
        id: u64,
        flag: bool,
        crc: u32,
        pos: u64,
        name: Vec<u8>,
        acc: BytesAccumulator,
        ended: bool,
    }

    impl PbEncode for Sample {
        fn encode(&self, buf: &mut BytesMut) {
            write_uint(buf, 1, self.id);
            write_bool(buf, 2, self.flag);
            write_fix32(buf, 3, self.crc);
            write_fix64(buf, 4, self.pos);
            write_bytes(buf, 5, &self.name);
        }
    }

    impl PbCallback for Sample {
        fn end(&mut self) {
            self.ended = true;
        }

        fn read_varint(&mut self, index: u32, value: u64) -> bool {
            match index {
                1 => self.id = value,
                2 => self.flag = value != 0,
                _ => {}
            }
            true
        }

        fn read_fixed32(&mut self, index: u32, value: u32) -> bool {
            if index == 3 {
                self.crc = value;
            }
            true
        }

        fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
            if index == 4 {
                self.pos = value;
            }
            true
        }

        fn read_bytes(&mut self, index: u32, chunk: &[u8], total: usize, begin: bool, end: bool) -> bool {
            if index == 5 {
                if let Some(v) = self.acc.push(chunk, total, begin, end) {
                    self.name = v;
                }
            }
            true
        }
    }

    #[test]
    fn test_varint_size() {
        assert_eq!(varint_size(0), 1);
        assert_eq!(varint_size(127), 1);
        assert_eq!(varint_size(128), 2);
        assert_eq!(varint_size(u64::MAX), 10);
    }

    #[test]
    fn test_decode_body() {
        let msg = Sample {
            id: 300,
            flag: true,
            crc: 0xdead_beef,
            pos: u64::MAX - 1,
            name: b"raft".to_vec(),
            ..Default::default()
        };
        let decoded: Sample = decode_body(&msg.to_bytes()).unwrap();
        assert_eq!(decoded.id, 300);
        assert!(decoded.flag);
        assert_eq!(decoded.crc, 0xdead_beef);
        assert_eq!(decoded.pos, u64::MAX - 1);
        assert_eq!(decoded.name, b"raft");
        assert!(decoded.ended);
    }

    #[test]
    fn test_empty_message() {
        let decoded: Sample = decode_body(&[]).unwrap();
        assert!(decoded.ended);
        assert_eq!(decoded.id, 0);
    }

    #[test]
    fn test_encode_frame_prefix() {
        let msg = Sample {
            id: 1,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        msg.encode_frame(&mut buf);
        assert_eq!(&buf[0..4], &2u32.to_be_bytes());
        assert_eq!(buf.len(), 6);
    }
}
