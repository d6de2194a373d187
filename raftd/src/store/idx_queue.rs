use std::path::Path;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};

use super::file_queue::FileQueue;
use super::seq_map::LongLongSeqMap;
use super::status_file::{StatusFile, KEY_IDX_PERSIST_INDEX};
use crate::error::{RaftError, Result};
use crate::raft::LogIndex;

const ITEM_LEN: u64 = 8;

fn index_to_pos(index: LogIndex) -> u64 {
    index << 3
}

fn pos_to_index(pos: u64) -> LogIndex {
    pos >> 3
}

#[derive(Debug, Clone)]
pub struct IdxOptions {
    pub items_per_file: u64,
    pub flush_items: u64,
    pub max_cache_items: usize,
    pub flush_interval: Duration,
}

/// Index `i` of the raft log lives at byte `i * 8` of the queue and holds the
/// absolute position of item `i` in the log queue.
///
/// New entries stay in memory until committed; [`maybe_flush`](Self::maybe_flush)
/// writes them out in batches and then records `idxPersistIndex` in the
/// status file.
pub struct IdxFileQueue {
    queue: FileQueue,
    opts: IdxOptions,
    tail: LongLongSeqMap,
    first_index: LogIndex,
    next_index: LogIndex,
    next_persist_index: LogIndex,
    last_flush: Instant,
    write_buf: BytesMut,
}

impl IdxFileQueue {
    pub fn open<P: AsRef<Path>>(dir: P, opts: IdxOptions) -> Result<Self> {
        let queue = FileQueue::open(dir, opts.items_per_file * ITEM_LEN)?;
        let write_buf = BytesMut::with_capacity(opts.flush_items as usize * ITEM_LEN as usize);
        Ok(IdxFileQueue {
            queue,
            tail: LongLongSeqMap::with_capacity(1024),
            first_index: 1,
            next_index: 1,
            next_persist_index: 1,
            last_flush: Instant::now(),
            write_buf,
            opts,
        })
    }

    /// Loads the persisted high water mark. Returns the last persisted index.
    pub fn init(&mut self, status: &StatusFile) -> Result<LogIndex> {
        let persisted: LogIndex = status.get_num(KEY_IDX_PERSIST_INDEX)?;
        self.first_index = pos_to_index(self.queue.queue_start()).max(1);
        if persisted > 0 && (persisted < self.first_index || index_to_pos(persisted) >= self.queue.queue_end()) {
            return Err(RaftError::Corrupted(format!(
                "idxPersistIndex {} out of index files, first index {}",
                persisted, self.first_index
            )));
        }
        if persisted == 0 && !self.queue.is_empty() && self.first_index > 1 {
            // everything persisted was deleted together with the log head
            self.next_index = self.first_index;
        } else {
            self.next_index = persisted + 1;
        }
        self.next_persist_index = self.next_index;
        info!(
            "idx queue init, first index {}, next index {}",
            self.first_index, self.next_index
        );
        Ok(self.next_index - 1)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index
    }

    pub fn next_persist_index(&self) -> LogIndex {
        self.next_persist_index
    }

    fn check_read_index(&self, index: LogIndex) -> Result<()> {
        if index == 0 || index >= self.next_index || index < self.first_index {
            return Err(RaftError::Invariant(format!(
                "index {} out of range [{}, {})",
                index, self.first_index, self.next_index
            )));
        }
        Ok(())
    }

    /// Log position of `index`, from memory if possible.
    pub fn load_log_pos(&mut self, index: LogIndex) -> Result<u64> {
        self.check_read_index(index)?;
        if let Some(pos) = self.tail.get(index) {
            return Ok(pos);
        }
        let mut buf = [0u8; 8];
        self.queue.read_at(index_to_pos(index), &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads a persisted entry straight from disk, used during restore before
    /// the in memory range is known.
    pub fn sync_load_log_pos(&mut self, index: LogIndex) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.queue.read_at(index_to_pos(index), &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn put(
        &mut self,
        index: LogIndex,
        log_pos: u64,
        commit_index: LogIndex,
        status: &mut StatusFile,
    ) -> Result<()> {
        if index > self.next_index {
            return Err(RaftError::Invariant(format!(
                "index not match: {}, {}",
                self.next_index, index
            )));
        }
        if index < self.next_index {
            if index < self.next_persist_index {
                return Err(RaftError::Invariant(format!(
                    "put index {} is persisted, next persist index {}",
                    index, self.next_persist_index
                )));
            }
            info!(
                "put index!=nextIndex, truncate tail cache: {}, {}",
                index, self.next_index
            );
            self.tail.truncate(index);
        }
        while self.tail.len() >= self.opts.max_cache_items {
            match self.tail.first_key() {
                Some(k) if k < self.next_persist_index => {
                    self.tail.remove();
                }
                _ => break,
            }
        }
        if self.tail.is_empty() && index != self.next_index {
            return Err(RaftError::Invariant(format!(
                "tail cache restart at {}, expect {}",
                index, self.next_index
            )));
        }
        self.tail.put(index, log_pos)?;
        self.next_index = index + 1;
        self.maybe_flush(commit_index, status)
    }

    /// Flushes committed entries when enough of them piled up or the flush
    /// interval elapsed.
    pub fn maybe_flush(&mut self, commit_index: LogIndex, status: &mut StatusFile) -> Result<()> {
        let bound = commit_index.min(self.next_index - 1);
        if bound < self.next_persist_index {
            return Ok(());
        }
        let pending = bound - self.next_persist_index + 1;
        if pending >= self.opts.flush_items || self.last_flush.elapsed() >= self.opts.flush_interval {
            self.flush(commit_index, status)?;
        }
        Ok(())
    }

    /// Writes every committed, unpersisted entry.
    pub fn flush(&mut self, commit_index: LogIndex, status: &mut StatusFile) -> Result<()> {
        self.last_flush = Instant::now();
        let bound = commit_index.min(self.next_index - 1);
        if bound < self.next_persist_index {
            return Ok(());
        }
        let start = self.next_persist_index;
        self.queue.ensure_write_pos_ready(index_to_pos(bound))?;
        let mut index = start;
        while index <= bound {
            self.write_buf.clear();
            let batch_start = index;
            let file_end = pos_to_index(self.queue.next_file_pos(index_to_pos(index)));
            while index <= bound && index < file_end && (index - batch_start) < self.opts.flush_items {
                let pos = self.tail.get(index).ok_or_else(|| {
                    RaftError::Invariant(format!("index {} missing in tail cache", index))
                })?;
                self.write_buf.put_u64(pos);
                index += 1;
            }
            self.queue.write_at(index_to_pos(batch_start), &self.write_buf)?;
            self.queue.sync(index_to_pos(batch_start))?;
        }
        self.next_persist_index = bound + 1;
        status.set(KEY_IDX_PERSIST_INDEX, bound);
        status.persist(true)?;
        debug!("idx flushed [{}, {}]", start, bound);
        Ok(())
    }

    /// Drops entries from `index` on and returns the log position of `index`.
    pub fn truncate_tail(&mut self, index: LogIndex, commit_index: LogIndex) -> Result<u64> {
        if index < self.first_index || index <= commit_index {
            return Err(RaftError::Invariant(format!(
                "truncateTail index is too small: {}, commit index {}",
                index, commit_index
            )));
        }
        let pos = self.load_log_pos(index)?;
        if index < self.next_persist_index {
            return Err(RaftError::Invariant(format!(
                "truncate persisted index {}",
                index
            )));
        }
        self.tail.truncate(index);
        self.next_index = index;
        Ok(pos)
    }

    /// Adopts the log's next index after a restore shorter than the index
    /// queue thought.
    pub fn set_next_index(&mut self, next_index: LogIndex) {
        if next_index < self.next_index {
            warn!(
                "idx next index moved back from {} to {}",
                self.next_index, next_index
            );
            self.tail.truncate(next_index);
        }
        self.next_index = next_index;
        if self.next_persist_index > next_index {
            self.next_persist_index = next_index;
        }
    }

    /// Removes index files whose entries are all below `first_log_index`.
    pub fn delete_before(&mut self, first_log_index: LogIndex) -> Result<usize> {
        let persist = self.next_persist_index;
        let n = self
            .queue
            .delete_head(|f| pos_to_index(f.end_pos) <= first_log_index && pos_to_index(f.end_pos) <= persist)?;
        if n > 0 {
            self.first_index = pos_to_index(self.queue.queue_start()).max(1);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> IdxOptions {
        IdxOptions {
            items_per_file: 16,
            flush_items: 4,
            max_cache_items: 8,
            flush_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_flush_only_committed_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut status = StatusFile::open(dir.path().join("status")).unwrap();
        {
            let mut idx = IdxFileQueue::open(dir.path().join("idx"), opts()).unwrap();
            assert_eq!(idx.init(&status).unwrap(), 0);
            for i in 1..=20u64 {
                idx.put(i, i * 100, 2, &mut status).unwrap();
            }
            // only 2 committed, not enough for a batch
            assert_eq!(idx.next_persist_index(), 1);
            idx.flush(18, &mut status).unwrap();
            assert_eq!(idx.next_persist_index(), 19);
            assert_eq!(idx.load_log_pos(20).unwrap(), 2000);
        }
        let status = StatusFile::open(dir.path().join("status")).unwrap();
        assert_eq!(status.get_num::<u64>(KEY_IDX_PERSIST_INDEX).unwrap(), 18);
        let mut idx = IdxFileQueue::open(dir.path().join("idx"), opts()).unwrap();
        assert_eq!(idx.init(&status).unwrap(), 18);
        assert_eq!(idx.load_log_pos(17).unwrap(), 1700);
        assert_eq!(idx.load_log_pos(18).unwrap(), 1800);
        assert!(idx.load_log_pos(19).is_err());
    }

    #[test]
    fn test_batch_flush_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut status = StatusFile::open(dir.path().join("status")).unwrap();
        let mut idx = IdxFileQueue::open(dir.path().join("idx"), opts()).unwrap();
        idx.init(&status).unwrap();
        for i in 1..=3u64 {
            idx.put(i, i, 3, &mut status).unwrap();
        }
        assert_eq!(idx.next_persist_index(), 1);
        idx.put(4, 4, 4, &mut status).unwrap();
        assert_eq!(idx.next_persist_index(), 5);
    }

    #[test]
    fn test_truncate_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut status = StatusFile::open(dir.path().join("status")).unwrap();
        let mut idx = IdxFileQueue::open(dir.path().join("idx"), opts()).unwrap();
        idx.init(&status).unwrap();
        for i in 1..=6u64 {
            idx.put(i, i * 10, 0, &mut status).unwrap();
        }
        assert!(matches!(
            idx.truncate_tail(3, 3),
            Err(RaftError::Invariant(_))
        ));
        assert_eq!(idx.truncate_tail(4, 2).unwrap(), 40);
        assert_eq!(idx.next_index(), 4);
        idx.put(4, 41, 2, &mut status).unwrap();
        assert_eq!(idx.load_log_pos(4).unwrap(), 41);
    }

    #[test]
    fn test_cache_eviction_keeps_unpersisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut status = StatusFile::open(dir.path().join("status")).unwrap();
        let mut idx = IdxFileQueue::open(dir.path().join("idx"), opts()).unwrap();
        idx.init(&status).unwrap();
        for i in 1..=12u64 {
            idx.put(i, i, 0, &mut status).unwrap();
        }
        // nothing committed so nothing can be evicted
        assert_eq!(idx.tail.len(), 12);
        idx.flush(12, &mut status).unwrap();
        idx.put(13, 13, 12, &mut status).unwrap();
        assert!(idx.tail.len() <= 8);
        assert_eq!(idx.load_log_pos(2).unwrap(), 2);
    }
}
