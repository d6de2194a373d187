use log::warn;

use super::{PbCallback, TYPE_FIX32, TYPE_FIX64, TYPE_LENGTH_DELIMITED, TYPE_VAR_INT};
use crate::error::{RaftError, Result};

// max 5 bytes for 32bit number, 10 bytes for 64bit number
const MAX_TAG_BYTES: usize = 5;
const MAX_VALUE_BYTES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    ParseFrameLen,
    ParseTag,
    ParseFieldLen,
    ParseFieldBody,
    SkipRest,
}

/// Incremental frame parser. Input may be split at any byte boundary; the
/// parser keeps enough state to resume on the next call.
#[derive(Debug)]
pub struct PbParser {
    max_frame: usize,
    status: Status,
    frame_len: usize,
    // bytes of the current frame consumed, not counting the length prefix
    parsed: usize,
    // bytes of the current multi-byte token read so far
    pending: usize,
    field_type: u8,
    field_index: u32,
    field_len: usize,
    temp: u64,
    completed_frames: u64,
    skipped_frames: u64,
}

fn protocol<T>(msg: String) -> Result<T> {
    Err(RaftError::Protocol(msg))
}

impl PbParser {
    pub fn new(max_frame: usize) -> Self {
        PbParser {
            max_frame,
            status: Status::ParseFrameLen,
            frame_len: 0,
            parsed: 0,
            pending: 0,
            field_type: 0,
            field_index: 0,
            field_len: 0,
            temp: 0,
            completed_frames: 0,
            skipped_frames: 0,
        }
    }

    pub fn completed_frames(&self) -> u64 {
        self.completed_frames
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    /// True when the parser sits between two frames.
    pub fn is_idle(&self) -> bool {
        self.status == Status::ParseFrameLen && self.pending == 0
    }

    /// Feeds `buf` to the parser. Any error leaves the parser unusable; the
    /// connection that produced the bytes should be dropped.
    pub fn parse<C: PbCallback + ?Sized>(&mut self, mut buf: &[u8], callback: &mut C) -> Result<()> {
        loop {
            match self.status {
                Status::ParseFrameLen => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    if self.pending == 0 {
                        self.frame_len = 0;
                    }
                    while self.pending < 4 && !buf.is_empty() {
                        self.frame_len = (self.frame_len << 8) | buf[0] as usize;
                        buf = &buf[1..];
                        self.pending += 1;
                    }
                    if self.pending < 4 {
                        return Ok(());
                    }
                    self.pending = 0;
                    if self.frame_len > self.max_frame {
                        return protocol(format!(
                            "max frame size exceed: max={}, actual={}",
                            self.max_frame, self.frame_len
                        ));
                    }
                    self.parsed = 0;
                    callback.begin(self.frame_len);
                    self.status = Status::ParseTag;
                    if self.frame_len == 0 {
                        self.finish_frame(callback);
                    }
                }
                Status::ParseTag => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    if let Some(tag) = self.parse_varint(&mut buf, MAX_TAG_BYTES)? {
                        self.after_tag(tag)?;
                    }
                }
                Status::ParseFieldLen => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    if let Some(len) = self.parse_varint(&mut buf, MAX_TAG_BYTES)? {
                        let len = len as usize;
                        if self.parsed + len > self.frame_len {
                            return protocol(format!("field length overflow frame length: {}", len));
                        }
                        if len == 0 {
                            let ok = callback.read_bytes(self.field_index, &[], 0, true, true);
                            self.after_field(ok, callback);
                        } else {
                            self.field_len = len;
                            self.status = Status::ParseFieldBody;
                        }
                    }
                }
                Status::ParseFieldBody => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    self.parse_field_body(&mut buf, callback)?;
                }
                Status::SkipRest => {
                    let n = (self.frame_len - self.parsed).min(buf.len());
                    buf = &buf[n..];
                    self.parsed += n;
                    if self.parsed == self.frame_len {
                        self.skipped_frames += 1;
                        self.status = Status::ParseFrameLen;
                    } else {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn parse_varint(&mut self, buf: &mut &[u8], max_bytes: usize) -> Result<Option<u64>> {
        while let Some((&b, rest)) = buf.split_first() {
            *buf = rest;
            self.parsed += 1;
            if self.parsed > self.frame_len {
                return protocol(format!("frame exceed {}", self.frame_len));
            }
            self.temp |= ((b & 0x7F) as u64) << (7 * self.pending);
            self.pending += 1;
            if b & 0x80 == 0 {
                let value = self.temp;
                self.temp = 0;
                self.pending = 0;
                return Ok(Some(value));
            }
            if self.pending >= max_bytes {
                return protocol(format!("var int too long, at least {}", self.pending + 1));
            }
        }
        Ok(None)
    }

    fn after_tag(&mut self, tag: u64) -> Result<()> {
        let wire_type = (tag & 0x07) as u8;
        let index = tag >> 3;
        if index == 0 || index > u32::MAX as u64 {
            return protocol(format!("bad field index: {}", index));
        }
        self.field_type = wire_type;
        self.field_index = index as u32;
        self.status = match wire_type {
            TYPE_VAR_INT | TYPE_FIX64 | TYPE_FIX32 => Status::ParseFieldBody,
            TYPE_LENGTH_DELIMITED => Status::ParseFieldLen,
            _ => return protocol(format!("type not support: {}", wire_type)),
        };
        Ok(())
    }

    fn parse_field_body<C: PbCallback + ?Sized>(&mut self, buf: &mut &[u8], callback: &mut C) -> Result<()> {
        match self.field_type {
            TYPE_VAR_INT => {
                if let Some(v) = self.parse_varint(buf, MAX_VALUE_BYTES)? {
                    let ok = callback.read_varint(self.field_index, v);
                    self.after_field(ok, callback);
                }
            }
            TYPE_FIX64 | TYPE_FIX32 => {
                let width = if self.field_type == TYPE_FIX64 { 8 } else { 4 };
                while self.pending < width && !buf.is_empty() {
                    self.parsed += 1;
                    if self.parsed > self.frame_len {
                        return protocol(format!("frame exceed {}", self.frame_len));
                    }
                    self.temp |= (buf[0] as u64) << (8 * self.pending);
                    *buf = &buf[1..];
                    self.pending += 1;
                }
                if self.pending == width {
                    let v = self.temp;
                    self.temp = 0;
                    self.pending = 0;
                    let ok = if width == 8 {
                        callback.read_fixed64(self.field_index, v)
                    } else {
                        callback.read_fixed32(self.field_index, v as u32)
                    };
                    self.after_field(ok, callback);
                }
            }
            TYPE_LENGTH_DELIMITED => {
                let need = self.field_len - self.pending;
                let n = need.min(buf.len());
                let begin = self.pending == 0;
                let end = n == need;
                let ok = callback.read_bytes(self.field_index, &buf[..n], self.field_len, begin, end);
                *buf = &buf[n..];
                self.parsed += n;
                self.pending += n;
                if !ok || end {
                    self.after_field(ok, callback);
                }
            }
            t => return protocol(format!("type not support: {}", t)),
        }
        Ok(())
    }

    fn after_field<C: PbCallback + ?Sized>(&mut self, ok: bool, callback: &mut C) {
        self.pending = 0;
        self.field_len = 0;
        if !ok {
            warn!("pb callback rejected field {}, skip rest of frame", self.field_index);
            self.status = Status::SkipRest;
            return;
        }
        self.status = Status::ParseTag;
        if self.parsed == self.frame_len {
            self.finish_frame(callback);
        }
    }

    fn finish_frame<C: PbCallback + ?Sized>(&mut self, callback: &mut C) {
        callback.end();
        self.completed_frames += 1;
        self.status = Status::ParseFrameLen;
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec::{write_bytes, write_fix32, write_fix64, write_tag, write_uint, write_varint, PbEncode};

    #[derive(Default, Debug, PartialEq)]
    struct Recorder {
        events: Vec<String>,
        reject_index: Option<u32>,
    }

    impl PbCallback for Recorder {
        fn begin(&mut self, len: usize) {
            self.events.push(format!("begin {}", len));
        }

        fn end(&mut self) {
            self.events.push("end".to_string());
        }

        fn read_varint(&mut self, index: u32, value: u64) -> bool {
            self.events.push(format!("varint {} {}", index, value));
            self.reject_index != Some(index)
        }

        fn read_fixed32(&mut self, index: u32, value: u32) -> bool {
            self.events.push(format!("fix32 {} {}", index, value));
            true
        }

        fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
            self.events.push(format!("fix64 {} {}", index, value));
            true
        }

        fn read_bytes(&mut self, index: u32, chunk: &[u8], total: usize, begin: bool, end: bool) -> bool {
            if begin {
                self.events.push(format!("bytes {} len {}", index, total));
            }
            self.events.push(String::from_utf8_lossy(chunk).to_string());
            if end {
                self.events.push(format!("bytes {} end", index));
            }
            true
        }
    }

    struct Body;

    impl PbEncode for Body {
        fn encode(&self, buf: &mut BytesMut) {
            write_uint(buf, 1, 150);
            write_fix32(buf, 2, 7);
            write_fix64(buf, 3, 1 << 40);
            write_bytes(buf, 4, b"hello");
            write_uint(buf, 5, u64::MAX);
        }
    }

    fn frames(count: usize) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for _ in 0..count {
            Body.encode_frame(&mut buf);
        }
        buf.to_vec()
    }

    /// Collapses chunked bytes events so whole and split input compare equal.
    fn normalize(events: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut in_bytes = false;
        for e in events {
            if e.starts_with("bytes") && e.ends_with("end") {
                in_bytes = false;
                out.push(e.clone());
            } else if e.starts_with("bytes") {
                in_bytes = true;
                out.push(e.clone());
                out.push(String::new());
            } else if in_bytes {
                out.last_mut().unwrap().push_str(e);
            } else {
                out.push(e.clone());
            }
        }
        out
    }

    #[test]
    fn test_parse_whole_frame() {
        let data = frames(1);
        let mut parser = PbParser::new(1024);
        let mut cb = Recorder::default();
        parser.parse(&data, &mut cb).unwrap();
        assert_eq!(parser.completed_frames(), 1);
        assert!(parser.is_idle());
        let ev = normalize(&cb.events);
        assert_eq!(ev[1], "varint 1 150");
        assert_eq!(ev[2], "fix32 2 7");
        assert_eq!(ev[3], format!("fix64 3 {}", 1u64 << 40));
        assert_eq!(ev[4], "bytes 4 len 5");
        assert_eq!(ev[5], "hello");
        assert_eq!(ev[7], format!("varint 5 {}", u64::MAX));
        assert_eq!(ev.last().unwrap(), "end");
    }

    #[test]
    fn test_parse_byte_by_byte_matches_whole() {
        let data = frames(3);
        let mut whole = Recorder::default();
        PbParser::new(1024).parse(&data, &mut whole).unwrap();

        let mut parser = PbParser::new(1024);
        let mut split = Recorder::default();
        for b in &data {
            parser.parse(std::slice::from_ref(b), &mut split).unwrap();
        }
        assert_eq!(parser.completed_frames(), 3);
        assert_eq!(normalize(&whole.events), normalize(&split.events));
    }

    #[test]
    fn test_frame_too_large() {
        let data = frames(1);
        let mut parser = PbParser::new(4);
        let err = parser.parse(&data, &mut Recorder::default()).unwrap_err();
        assert!(matches!(err, RaftError::Protocol(_)));
    }

    #[test]
    fn test_zero_length_frame() {
        let mut parser = PbParser::new(16);
        let mut cb = Recorder::default();
        parser.parse(&[0, 0, 0, 0], &mut cb).unwrap();
        assert_eq!(cb.events, vec!["begin 0".to_string(), "end".to_string()]);
        assert_eq!(parser.completed_frames(), 1);
    }

    #[test]
    fn test_rejected_field_skips_rest_of_frame() {
        let data = frames(2);
        let mut parser = PbParser::new(1024);
        let mut cb = Recorder {
            reject_index: Some(1),
            ..Default::default()
        };
        parser.parse(&data, &mut cb).unwrap();
        assert_eq!(parser.skipped_frames(), 2);
        assert_eq!(parser.completed_frames(), 0);
        assert!(!cb.events.iter().any(|e| e.starts_with("fix32")));
    }

    #[test]
    fn test_varint_too_long() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&20u32.to_be_bytes());
        write_tag(&mut buf, 1, 0);
        for _ in 0..11 {
            buf.extend_from_slice(&[0xFF]);
        }
        buf.extend_from_slice(&[0x01; 8]);
        let err = PbParser::new(1024)
            .parse(&buf, &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, RaftError::Protocol(_)));
    }

    #[test]
    fn test_field_length_overflow() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        write_tag(&mut buf, 1, 2);
        write_varint(&mut buf, 100);
        buf.extend_from_slice(&[0]);
        let err = PbParser::new(1024)
            .parse(&buf, &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, RaftError::Protocol(_)));
    }

    #[test]
    fn test_bad_wire_type() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        write_tag(&mut buf, 1, 3);
        let err = PbParser::new(1024)
            .parse(&buf, &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, RaftError::Protocol(_)));
    }
}
