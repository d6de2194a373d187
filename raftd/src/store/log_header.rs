use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RaftError, Result};
use crate::raft::{LogIndex, Term};

pub const ITEM_HEADER_SIZE: usize = 40;
pub const ITEM_TAIL_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogItemType {
    Normal = 1,
    Noop = 2,
    Config = 3,
}

impl LogItemType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(LogItemType::Normal),
            2 => Some(LogItemType::Noop),
            3 => Some(LogItemType::Config),
            _ => None,
        }
    }
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub item_type: LogItemType,
    pub term: Term,
    pub prev_log_term: Term,
    pub index: LogIndex,
    pub timestamp: u64,
    pub body: Bytes,
}

impl LogItem {
    pub fn stored_len(&self) -> usize {
        ITEM_HEADER_SIZE + self.body.len() + ITEM_TAIL_SIZE
    }
}

/// On disk item header, big endian:
///
/// ```text
/// header_crc u32 | total_len u32 | body_len u32 | type u8 | 3 reserved
/// term u32 | prev_log_term u32 | index u64 | timestamp u64
/// ```
///
/// `header_crc` covers bytes 4..40. The body follows, then the CRC32C of the
/// body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHeader {
    pub header_crc: u32,
    pub total_len: u32,
    pub body_len: u32,
    pub item_type: u8,
    pub term: Term,
    pub prev_log_term: Term,
    pub index: LogIndex,
    pub timestamp: u64,
    crc_ok: bool,
}

impl LogHeader {
    pub fn for_item(item: &LogItem) -> Self {
        LogHeader {
            header_crc: 0,
            total_len: item.stored_len() as u32,
            body_len: item.body.len() as u32,
            item_type: item.item_type as u8,
            term: item.term,
            prev_log_term: item.prev_log_term,
            index: item.index,
            timestamp: item.timestamp,
            crc_ok: true,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32(0);
        buf.put_u32(self.total_len);
        buf.put_u32(self.body_len);
        buf.put_u8(self.item_type);
        buf.put_bytes(0, 3);
        buf.put_u32(self.term);
        buf.put_u32(self.prev_log_term);
        buf.put_u64(self.index);
        buf.put_u64(self.timestamp);
        let crc = crc32c::crc32c(&buf[start + 4..start + ITEM_HEADER_SIZE]);
        buf[start..start + 4].copy_from_slice(&crc.to_be_bytes());
    }

    pub fn read_from(data: &[u8]) -> Self {
        debug_assert!(data.len() >= ITEM_HEADER_SIZE);
        let u32_at = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[i..i + 8]);
            u64::from_be_bytes(b)
        };
        let header_crc = u32_at(0);
        LogHeader {
            header_crc,
            total_len: u32_at(4),
            body_len: u32_at(8),
            item_type: data[12],
            term: u32_at(16),
            prev_log_term: u32_at(20),
            index: u64_at(24),
            timestamp: u64_at(32),
            crc_ok: crc32c::crc32c(&data[4..ITEM_HEADER_SIZE]) == header_crc,
        }
    }

    pub fn crc_match(&self) -> bool {
        self.crc_ok
    }

    /// An all zero header marks the end of written data (or the padding
    /// before a file boundary).
    pub fn is_zero(&self) -> bool {
        self.header_crc == 0 && self.total_len == 0 && self.body_len == 0 && self.index == 0
    }

    pub fn check(&self) -> Result<()> {
        if !self.crc_ok {
            return Err(RaftError::Checksum(format!(
                "log header crc mismatch, index={}",
                self.index
            )));
        }
        if self.total_len as usize != ITEM_HEADER_SIZE + self.body_len as usize + ITEM_TAIL_SIZE
            || LogItemType::from_u8(self.item_type).is_none()
            || self.index == 0
        {
            return Err(RaftError::Corrupted(format!("bad log header: {:?}", self)));
        }
        Ok(())
    }

    /// Builds the item once the body was read and its checksum verified.
    pub fn into_item(self, body: Bytes) -> Result<LogItem> {
        let item_type = LogItemType::from_u8(self.item_type)
            .ok_or_else(|| RaftError::Corrupted(format!("bad item type {}", self.item_type)))?;
        Ok(LogItem {
            item_type,
            term: self.term,
            prev_log_term: self.prev_log_term,
            index: self.index,
            timestamp: self.timestamp,
            body,
        })
    }
}

/// Serializes a whole item (header, body, body crc).
pub fn encode_item(item: &LogItem, buf: &mut BytesMut) {
    LogHeader::for_item(item).write_to(buf);
    buf.put_slice(&item.body);
    buf.put_u32(crc32c::crc32c(&item.body));
}

/// Parses a whole item, verifying both checksums.
pub fn decode_item(data: &[u8]) -> Result<LogItem> {
    if data.len() < ITEM_HEADER_SIZE {
        return Err(RaftError::Corrupted("log item too short".to_string()));
    }
    let header = LogHeader::read_from(data);
    header.check()?;
    let total = header.total_len as usize;
    if data.len() < total {
        return Err(RaftError::Corrupted(format!(
            "log item truncated, expect {} bytes, got {}",
            total,
            data.len()
        )));
    }
    let body = &data[ITEM_HEADER_SIZE..total - ITEM_TAIL_SIZE];
    let crc_bytes = &data[total - ITEM_TAIL_SIZE..total];
    let expect = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32c::crc32c(body) != expect {
        return Err(RaftError::Checksum(format!(
            "log body crc mismatch, index={}",
            header.index
        )));
    }
    header.into_item(Bytes::copy_from_slice(body))
}
