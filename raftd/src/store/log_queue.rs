use std::path::Path;

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};

use super::file_queue::FileQueue;
use super::idx_queue::IdxFileQueue;
use super::log_header::{decode_item, encode_item, LogHeader, LogItem, ITEM_HEADER_SIZE, ITEM_TAIL_SIZE};
use super::status_file::StatusFile;
use crate::error::{RaftError, Result};
use crate::raft::{LogIndex, Term};

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub file_size: u64,
    pub sync_force: bool,
    pub max_write_buffer: usize,
}

/// Append only queue of log items.
///
/// An item never spans two files: when it does not fit in what is left of
/// the current file the writer skips to the next file boundary, leaving
/// zeros behind.
pub struct LogFileQueue {
    queue: FileQueue,
    opts: LogOptions,
    write_pos: u64,
    next_index: LogIndex,
    last_term: Term,
    write_buf: BytesMut,
    buf_start: u64,
}

impl LogFileQueue {
    pub fn open<P: AsRef<Path>>(dir: P, opts: LogOptions) -> Result<Self> {
        let queue = FileQueue::open(dir, opts.file_size)?;
        let mut q = LogFileQueue {
            queue,
            write_buf: BytesMut::with_capacity(opts.max_write_buffer),
            opts,
            write_pos: 0,
            next_index: 1,
            last_term: 0,
            buf_start: 0,
        };
        q.load_first_headers()?;
        Ok(q)
    }

    fn load_first_headers(&mut self) -> Result<()> {
        let mut buf = [0u8; ITEM_HEADER_SIZE];
        let starts: Vec<u64> = self.queue.files().iter().map(|f| f.start_pos).collect();
        for start in starts {
            self.queue.read_at(start, &mut buf)?;
            let header = LogHeader::read_from(&buf);
            if header.check().is_ok() {
                let f = self.queue.get_log_file_mut(start)?;
                f.first_index = header.index;
                f.first_term = header.term;
                f.first_timestamp = header.timestamp;
            }
        }
        Ok(())
    }

    pub fn write_pos(&self) -> u64 {
        self.write_pos
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index
    }

    pub fn last_term(&self) -> Term {
        self.last_term
    }

    pub fn first_index(&self) -> LogIndex {
        self.queue.files().front().map(|f| f.first_index).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn file_count(&self) -> usize {
        self.queue.len()
    }

    fn read_header(&mut self, pos: u64) -> Result<LogHeader> {
        let mut buf = [0u8; ITEM_HEADER_SIZE];
        self.queue.read_at(pos, &mut buf)?;
        Ok(LogHeader::read_from(&buf))
    }

    /// Reads the body and trailing crc of the item at `pos`, updating the
    /// crc chunk by chunk. Returns the body if the crc matches.
    fn read_body(&mut self, pos: u64, header: &LogHeader) -> Result<Option<Bytes>> {
        let body_len = header.body_len as usize;
        let mut body = vec![0u8; body_len + ITEM_TAIL_SIZE];
        let chunk = self.opts.max_write_buffer.max(ITEM_HEADER_SIZE);
        let mut crc = 0u32;
        let mut read = 0;
        let body_pos = pos + ITEM_HEADER_SIZE as u64;
        while read < body.len() {
            let n = chunk.min(body.len() - read);
            self.queue.read_at(body_pos + read as u64, &mut body[read..read + n])?;
            let crc_end = (read + n).min(body_len);
            if read < crc_end {
                crc = crc32c::crc32c_append(crc, &body[read..crc_end]);
            }
            read += n;
        }
        let t = &body[body_len..];
        let expect = u32::from_be_bytes([t[0], t[1], t[2], t[3]]);
        if crc != expect {
            return Ok(None);
        }
        body.truncate(body_len);
        Ok(Some(Bytes::from(body)))
    }

    /// Scans forward from the last item the index queue vouches for and
    /// rebuilds the unpersisted part of the index. Returns
    /// `(last_term, last_index)`.
    pub fn restore(
        &mut self,
        restore_index: LogIndex,
        restore_pos: u64,
        idx: &mut IdxFileQueue,
        commit_index: LogIndex,
        status: &mut StatusFile,
    ) -> Result<(Term, LogIndex)> {
        info!("start restore from {}, {}", restore_index, restore_pos);
        if self.queue.is_empty() {
            if restore_index > 0 {
                return Err(RaftError::Corrupted(format!(
                    "log files missing, restore index {}",
                    restore_index
                )));
            }
            let start = self.queue.queue_start();
            self.queue.ensure_write_pos_ready(start)?;
            self.set_next(idx.next_index().max(1), start, 0);
            return Ok((0, 0));
        }
        let mut pos = if restore_index == 0 {
            self.queue.queue_start()
        } else {
            restore_pos
        };
        if pos < self.queue.queue_start() || pos >= self.queue.queue_end() {
            return Err(RaftError::Corrupted(format!(
                "restore pos {} out of log files [{}, {})",
                pos,
                self.queue.queue_start(),
                self.queue.queue_end()
            )));
        }
        let mut expect_index = if restore_index == 0 {
            idx.next_index()
        } else {
            restore_index
        };
        let file_size = self.queue.file_size();
        let mut prev_term: Option<Term> = None;
        let mut last_index = 0;
        let mut restore_count = 0u64;
        loop {
            if pos >= self.queue.queue_end() {
                break;
            }
            if self.queue.file_pos(pos) + ITEM_HEADER_SIZE as u64 > file_size {
                pos = self.queue.next_file_pos(pos);
                continue;
            }
            let header = self.read_header(pos)?;
            let first = restore_index > 0 && expect_index == restore_index;
            if header.is_zero() {
                let next = self.queue.next_file_pos(pos);
                if !first
                    && next < self.queue.queue_end()
                    && self.queue.get_log_file(next)?.first_index == expect_index
                {
                    debug!("skip padding at {}", pos);
                    pos = next;
                    continue;
                }
                if first {
                    return Err(RaftError::Corrupted(format!(
                        "restore item {} missing at {}",
                        restore_index, pos
                    )));
                }
                break;
            }
            let mut reason = match header.check() {
                Err(e) => Some(e.to_string()),
                Ok(()) if header.index != expect_index => Some(format!(
                    "index not continuous, expect {}, got {}",
                    expect_index, header.index
                )),
                Ok(()) if self.queue.file_pos(pos) + header.total_len as u64 > file_size => {
                    Some("item crosses file boundary".to_string())
                }
                Ok(()) => match prev_term {
                    Some(pt) if header.prev_log_term != pt || header.term < pt => Some(format!(
                        "term not match, prev term {}, item prev term {}, item term {}",
                        pt, header.prev_log_term, header.term
                    )),
                    _ => None,
                },
            };
            if reason.is_none() && self.read_body(pos, &header)?.is_none() {
                reason = Some(format!("body crc mismatch, index {}", header.index));
            }
            if let Some(reason) = reason {
                if first {
                    return Err(RaftError::Corrupted(format!(
                        "restore item {} invalid: {}",
                        restore_index, reason
                    )));
                }
                warn!("restore stops at pos {}: {}", pos, reason);
                break;
            }

            if header.index >= idx.next_index() {
                idx.put(header.index, pos, commit_index, status)?;
            }
            let f = self.queue.get_log_file_mut(pos)?;
            if f.first_index == 0 || f.first_index > header.index {
                f.first_index = header.index;
                f.first_term = header.term;
                f.first_timestamp = header.timestamp;
            }
            prev_term = Some(header.term);
            last_index = header.index;
            expect_index = header.index + 1;
            pos += header.total_len as u64;
            restore_count += 1;
        }

        let next_index = if last_index == 0 { expect_index } else { last_index + 1 };
        for f in self.queue.files_mut().iter_mut() {
            if f.first_index >= next_index {
                f.reset_first();
            }
        }
        idx.set_next_index(next_index);
        self.queue.ensure_write_pos_ready(pos)?;
        let last_term = prev_term.unwrap_or(0);
        self.set_next(next_index, pos, last_term);
        info!(
            "restore finished. lastTerm={}, lastIndex={}, lastPos={}, totalRead={}",
            last_term, last_index, pos, restore_count
        );
        Ok((last_term, last_index))
    }

    fn set_next(&mut self, next_index: LogIndex, write_pos: u64, last_term: Term) {
        self.next_index = next_index;
        self.write_pos = write_pos;
        self.last_term = last_term;
        self.write_buf.clear();
        self.buf_start = write_pos;
    }

    fn flush_buf(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.queue.write_at(self.buf_start, &self.write_buf)?;
        if self.opts.sync_force {
            self.queue.sync(self.buf_start)?;
        }
        self.write_buf.clear();
        Ok(())
    }

    pub fn append(
        &mut self,
        items: &[LogItem],
        idx: &mut IdxFileQueue,
        commit_index: LogIndex,
        status: &mut StatusFile,
    ) -> Result<()> {
        let file_size = self.queue.file_size();
        for item in items {
            if item.index != self.next_index {
                return Err(RaftError::Invariant(format!(
                    "append index {}, expect {}",
                    item.index, self.next_index
                )));
            }
            let len = item.stored_len() as u64;
            if len > file_size {
                return Err(RaftError::Invariant(format!(
                    "log item too large: {} > file size {}",
                    len, file_size
                )));
            }
            if self.queue.file_pos(self.write_pos) + len > file_size {
                self.flush_buf()?;
                self.write_pos = self.queue.next_file_pos(self.write_pos);
            }
            self.queue.ensure_write_pos_ready(self.write_pos + len - 1)?;
            let f = self.queue.get_log_file_mut(self.write_pos)?;
            if f.first_index == 0 {
                f.first_index = item.index;
                f.first_term = item.term;
                f.first_timestamp = item.timestamp;
            }
            if !self.write_buf.is_empty()
                && (self.buf_start + self.write_buf.len() as u64 != self.write_pos
                    || self.write_buf.len() + len as usize > self.opts.max_write_buffer)
            {
                self.flush_buf()?;
            }
            if self.write_buf.is_empty() {
                self.buf_start = self.write_pos;
            }
            encode_item(item, &mut self.write_buf);
            idx.put(item.index, self.write_pos, commit_index, status)?;
            self.write_pos += len;
            self.next_index = item.index + 1;
            self.last_term = item.term;
        }
        self.flush_buf()
    }

    /// Loads and verifies the header at `pos`.
    pub fn load_header(&mut self, pos: u64) -> Result<LogHeader> {
        let header = self.read_header(pos)?;
        header
            .check()
            .map_err(|e| RaftError::Corrupted(format!("load header at {}: {}", pos, e)))?;
        Ok(header)
    }

    pub fn load_item(&mut self, pos: u64) -> Result<LogItem> {
        let header = self.load_header(pos)?;
        let total = header.total_len as usize;
        if self.queue.file_pos(pos) + total as u64 > self.queue.file_size() {
            return Err(RaftError::Corrupted(format!(
                "item at {} crosses file boundary",
                pos
            )));
        }
        let mut data = vec![0u8; total];
        self.queue.get_log_file_mut(pos)?.use_count += 1;
        let r = self.queue.read_at(pos, &mut data);
        self.queue.get_log_file_mut(pos)?.use_count -= 1;
        r?;
        decode_item(&data).map_err(|e| RaftError::Corrupted(format!("load item at {}: {}", pos, e)))
    }

    /// Loads items starting at `start`, at least one when available.
    pub fn load(
        &mut self,
        start: LogIndex,
        max_items: usize,
        max_bytes: usize,
        idx: &mut IdxFileQueue,
    ) -> Result<Vec<LogItem>> {
        let mut items = Vec::new();
        let mut bytes = 0;
        let mut index = start;
        while index < self.next_index && items.len() < max_items {
            let pos = idx.load_log_pos(index)?;
            let item = self.load_item(pos)?;
            if item.index != index {
                return Err(RaftError::Corrupted(format!(
                    "index file points {} to item {}",
                    index, item.index
                )));
            }
            bytes += item.body.len();
            if !items.is_empty() && bytes > max_bytes {
                break;
            }
            items.push(item);
            index += 1;
        }
        Ok(items)
    }

    pub fn term_at(&mut self, index: LogIndex, idx: &mut IdxFileQueue) -> Result<Term> {
        if index == 0 {
            return Ok(0);
        }
        let pos = idx.load_log_pos(index)?;
        Ok(self.load_header(pos)?.term)
    }

    /// Finds the greatest local `(term, index)` with `index <= suggest_index`
    /// and `term <= suggest_term`: first the file by its first item, then
    /// the item inside it, both by binary search.
    pub fn find_match_pos(
        &mut self,
        suggest_term: Term,
        suggest_index: LogIndex,
        idx: &mut IdxFileQueue,
    ) -> Result<Option<(Term, LogIndex)>> {
        let upper = suggest_index.min(self.next_index.saturating_sub(1));
        if upper == 0 {
            return Ok(None);
        }
        let firsts: Vec<(LogIndex, Term)> = self
            .queue
            .files()
            .iter()
            .filter(|f| f.first_index > 0)
            .map(|f| (f.first_index, f.first_term))
            .collect();
        let p = firsts.partition_point(|(i, t)| *i <= upper && *t <= suggest_term);
        if p == 0 {
            return Ok(None);
        }
        let mut lo = firsts[p - 1].0.max(idx.first_index());
        let mut hi = if p < firsts.len() {
            upper.min(firsts[p].0 - 1)
        } else {
            upper
        };
        if lo > hi {
            return Ok(None);
        }
        if self.term_at(lo, idx)? > suggest_term {
            return Ok(None);
        }
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.term_at(mid, idx)? <= suggest_term {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let term = self.term_at(lo, idx)?;
        debug!(
            "find match pos for ({}, {}) -> ({}, {})",
            suggest_term, suggest_index, term, lo
        );
        Ok(Some((term, lo)))
    }

    /// Zero fills `[start, end)` and moves the write position back to `start`.
    pub fn truncate_tail(&mut self, index: LogIndex, start: u64, end: u64, last_term: Term) -> Result<()> {
        self.write_buf.clear();
        self.queue.zero_range(start, end)?;
        for f in self.queue.files_mut().iter_mut() {
            if f.first_index >= index {
                f.reset_first();
            }
        }
        self.set_next(index, start, last_term);
        info!("truncate log tail to index {}, pos {}", index, start);
        Ok(())
    }

    /// Finishes a truncation interrupted by a crash.
    pub fn complete_truncate(&mut self, start: u64, end: u64) -> Result<()> {
        let start = start.max(self.queue.queue_start());
        if start < end {
            info!("complete pending truncate [{}, {})", start, end);
            self.queue.zero_range(start, end)?;
        }
        Ok(())
    }

    /// Marks files for deletion. A file is marked when every item in it is
    /// at or below `bound_index` and older than `timestamp_bound`.
    pub fn mark_delete(&mut self, bound_index: LogIndex, timestamp_bound: u64, delete_at: u64) {
        let files = self.queue.files_mut();
        let len = files.len();
        for i in 0..len.saturating_sub(1) {
            let (next_first_ts, next_first_index) = (files[i + 1].first_timestamp, files[i + 1].first_index);
            let result = next_first_ts > 0
                && timestamp_bound > next_first_ts
                && next_first_index > 0
                && bound_index >= next_first_index;
            debug!(
                "mark {} delete: {}. timestampBound={}, boundIndex={}, nextFileFirstIndex={}",
                files[i].path.display(),
                result,
                timestamp_bound,
                bound_index,
                next_first_index
            );
            if !result {
                return;
            }
            let f = &mut files[i];
            if f.should_delete() {
                f.delete_timestamp = f.delete_timestamp.min(delete_at);
            } else {
                f.delete_timestamp = delete_at;
            }
        }
    }

    pub fn do_delete(&mut self, now_millis: u64) -> Result<usize> {
        self.queue
            .delete_head(|f| f.should_delete() && f.delete_timestamp <= now_millis)
    }
}
