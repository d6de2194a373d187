use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};

use super::idx_queue::{IdxFileQueue, IdxOptions};
use super::log_header::LogItem;
use super::log_queue::{LogFileQueue, LogOptions};
use super::status_file::{StatusFile, KEY_COMMIT_INDEX, KEY_TRUNCATE};
use super::now_millis;
use crate::config::RaftGroupConfig;
use crate::error::{RaftError, Result};
use crate::raft::{LogIndex, Term};

/// The durable raft log of one group: segment files under `log/` and the
/// index under `idx/`. Persistent raft state lives in the group's
/// [`StatusFile`], passed in by the caller wherever a method persists.
pub struct DefaultRaftLog {
    dir: PathBuf,
    log: LogFileQueue,
    idx: IdxFileQueue,
    delete_check_interval: Duration,
    last_delete_check: Instant,
}

impl DefaultRaftLog {
    pub fn open<P: AsRef<Path>>(dir: P, config: &RaftGroupConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let log = LogFileQueue::open(
            dir.join("log"),
            LogOptions {
                file_size: config.log_file_size,
                sync_force: config.sync_force,
                max_write_buffer: config.max_write_buffer,
            },
        )?;
        let idx = IdxFileQueue::open(
            dir.join("idx"),
            IdxOptions {
                items_per_file: config.idx_items_per_file,
                flush_items: config.idx_flush_items,
                max_cache_items: config.idx_max_cache_items,
                flush_interval: config.idx_flush_interval(),
            },
        )?;
        Ok(DefaultRaftLog {
            dir,
            log,
            idx,
            delete_check_interval: config.delete_check_interval(),
            last_delete_check: Instant::now(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Completes a pending truncation, then restores the log tail. Returns
    /// `(last_term, last_index)`.
    pub fn init(&mut self, status: &mut StatusFile) -> Result<(Term, LogIndex)> {
        if let Some(marker) = status.get(KEY_TRUNCATE).map(|s| s.to_string()) {
            let (start, end) = parse_truncate_marker(&marker)?;
            self.log.complete_truncate(start, end)?;
            status.remove(KEY_TRUNCATE);
            status.persist(true)?;
        }
        let commit_index: LogIndex = status.get_num(KEY_COMMIT_INDEX)?;
        let restore_index = self.idx.init(status)?;
        let restore_pos = if restore_index > 0 {
            self.idx.sync_load_log_pos(restore_index)?
        } else {
            0
        };
        let (last_term, last_index) =
            self.log
                .restore(restore_index, restore_pos, &mut self.idx, commit_index, status)?;
        if last_index < commit_index {
            warn!(
                "last log index {} is behind commit index {}",
                last_index, commit_index
            );
        }
        Ok((last_term, last_index))
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.next_index() - 1
    }

    pub fn last_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn first_index(&self) -> LogIndex {
        match self.log.first_index() {
            0 => self.log.next_index(),
            i => i.max(self.idx.first_index()),
        }
    }

    /// Appends items, truncating a conflicting tail first when the batch
    /// starts below the current end.
    pub fn append(
        &mut self,
        items: &[LogItem],
        commit_index: LogIndex,
        status: &mut StatusFile,
    ) -> Result<()> {
        let first = match items.first() {
            Some(item) => item.index,
            None => return Ok(()),
        };
        let next = self.log.next_index();
        if first < next {
            self.truncate_tail(first, commit_index, status)?;
        } else if first > next {
            return Err(RaftError::Invariant(format!(
                "append index {} leaves a gap after {}",
                first,
                next - 1
            )));
        }
        self.log.append(items, &mut self.idx, commit_index, status)
    }

    /// Drops `index` and everything after it.
    pub fn truncate_tail(
        &mut self,
        index: LogIndex,
        commit_index: LogIndex,
        status: &mut StatusFile,
    ) -> Result<()> {
        if index >= self.log.next_index() {
            return Ok(());
        }
        let last_term = self.term_at(index - 1)?;
        let start = self.idx.truncate_tail(index, commit_index)?;
        let end = self.log.write_pos();
        status.set(KEY_TRUNCATE, format!("{},{}", start, end));
        status.persist(true)?;

        fail::fail_point!("raft-log-truncate-marker-written", |_| {
            Err(RaftError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected crash after truncate marker",
            )))
        });

        self.log.truncate_tail(index, start, end, last_term)?;
        status.remove(KEY_TRUNCATE);
        status.persist(true)?;
        info!("log truncated from index {}", index);
        Ok(())
    }

    /// Lets the index queue persist entries up to the new commit index.
    pub fn on_commit(&mut self, commit_index: LogIndex, status: &mut StatusFile) -> Result<()> {
        self.idx.maybe_flush(commit_index, status)
    }

    pub fn load(&mut self, index: LogIndex, max_items: usize, max_bytes: usize) -> Result<Vec<LogItem>> {
        self.log.load(index, max_items, max_bytes, &mut self.idx)
    }

    pub fn term_at(&mut self, index: LogIndex) -> Result<Term> {
        if index == self.last_index() {
            return Ok(self.last_term());
        }
        self.log.term_at(index, &mut self.idx)
    }

    pub fn find_match_pos(
        &mut self,
        suggest_term: Term,
        suggest_index: LogIndex,
    ) -> Result<Option<(Term, LogIndex)>> {
        self.log
            .find_match_pos(suggest_term, suggest_index, &mut self.idx)
    }

    /// Marks files whose items are all at or below `bound_index` (and
    /// persisted in the index) for deletion after `delay`.
    pub fn mark_delete_by_index(&mut self, bound_index: LogIndex, delay: Duration) {
        let bound = bound_index.min(self.idx.next_persist_index().saturating_sub(1));
        self.log
            .mark_delete(bound, u64::MAX, now_millis() + delay.as_millis() as u64);
    }

    pub fn mark_delete_by_timestamp(
        &mut self,
        timestamp_bound: u64,
        bound_index: LogIndex,
        delay: Duration,
    ) {
        let bound = bound_index.min(self.idx.next_persist_index().saturating_sub(1));
        self.log
            .mark_delete(bound, timestamp_bound, now_millis() + delay.as_millis() as u64);
    }

    /// Removes expired files, at most once per check interval.
    pub fn do_delete(&mut self) -> Result<usize> {
        if self.last_delete_check.elapsed() < self.delete_check_interval {
            return Ok(0);
        }
        self.last_delete_check = Instant::now();
        let n = self.log.do_delete(now_millis())?;
        if n > 0 {
            let first = self.log.first_index();
            let idx_files = self.idx.delete_before(first)?;
            info!(
                "deleted {} log files and {} index files, first index now {}",
                n, idx_files, first
            );
        }
        Ok(n)
    }

    /// Persists whatever the index queue may persist.
    pub fn close(&mut self, commit_index: LogIndex, status: &mut StatusFile) -> Result<()> {
        self.idx.flush(commit_index, status)
    }
}

fn parse_truncate_marker(marker: &str) -> Result<(u64, u64)> {
    let bad = || RaftError::Corrupted(format!("bad truncate marker: {}", marker));
    let (start, end) = marker.split_once(',').ok_or_else(bad)?;
    let start = start.trim().parse().map_err(|_| bad())?;
    let end = end.trim().parse().map_err(|_| bad())?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::log_queue::tests::item;

    fn config() -> RaftGroupConfig {
        RaftGroupConfig {
            log_file_size: 1024,
            idx_items_per_file: 64,
            idx_flush_items: 4,
            idx_max_cache_items: 64,
            max_write_buffer: 256,
            delete_check_interval_ms: 0,
            ..Default::default()
        }
    }

    fn open(dir: &Path) -> (DefaultRaftLog, StatusFile, (Term, LogIndex)) {
        let mut status = StatusFile::open(dir.join("status")).unwrap();
        let mut log = DefaultRaftLog::open(dir, &config()).unwrap();
        let r = log.init(&mut status).unwrap();
        (log, status, r)
    }

    fn items(range: std::ops::RangeInclusive<u64>, term: Term, first_prev_term: Term) -> Vec<LogItem> {
        let start = *range.start();
        range
            .map(|i| item(i, term, if i == start { first_prev_term } else { term }, b"some data"))
            .collect()
    }

    #[test]
    fn test_append_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, mut status, r) = open(dir.path());
            assert_eq!(r, (0, 0));
            log.append(&items(1..=5, 1, 0), 0, &mut status).unwrap();
            status.set(KEY_COMMIT_INDEX, 3);
            log.close(3, &mut status).unwrap();
        }
        let (mut log, _status, r) = open(dir.path());
        assert_eq!(r, (1, 5));
        assert_eq!(log.term_at(4).unwrap(), 1);
        assert_eq!(log.load(1, 10, 1 << 20).unwrap().len(), 5);
        // a second restart over the untouched files gives the same answer
        drop(log);
        let (_, _, r2) = open(dir.path());
        assert_eq!(r2, r);
    }

    #[test]
    fn test_conflicting_append_truncates() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, mut status, _) = open(dir.path());
            log.append(&items(1..=5, 1, 0), 1, &mut status).unwrap();
            log.append(&items(3..=4, 2, 1), 1, &mut status).unwrap();
            assert_eq!(log.last_index(), 4);
            assert_eq!(log.last_term(), 2);
            assert_eq!(log.term_at(2).unwrap(), 1);
            assert_eq!(log.term_at(3).unwrap(), 2);
            assert!(status.get(KEY_TRUNCATE).is_none());
        }
        let (mut log, _, r) = open(dir.path());
        assert_eq!(r, (2, 4));
        assert_eq!(log.term_at(3).unwrap(), 2);
    }

    #[test]
    fn test_truncate_committed_is_invariant_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, mut status, _) = open(dir.path());
        log.append(&items(1..=5, 1, 0), 3, &mut status).unwrap();
        assert!(matches!(
            log.truncate_tail(3, 3, &mut status),
            Err(RaftError::Invariant(_))
        ));
        assert!(matches!(
            log.append(&items(7..=7, 1, 1), 3, &mut status),
            Err(RaftError::Invariant(_))
        ));
    }

    #[test]
    fn test_pending_truncate_completed_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, mut status, _) = open(dir.path());
            log.append(&items(1..=6, 1, 0), 2, &mut status).unwrap();
            status.set(KEY_COMMIT_INDEX, 2);
            log.close(2, &mut status).unwrap();
            // crash after the marker was written, before the data was zeroed
            let start = log.idx.load_log_pos(4).unwrap();
            status.set(KEY_TRUNCATE, format!("{},{}", start, log.log.write_pos()));
            status.persist(true).unwrap();
        }
        let (mut log, status, r) = open(dir.path());
        assert_eq!(r, (1, 3));
        assert!(status.get(KEY_TRUNCATE).is_none());
        assert_eq!(log.load(1, 100, 1 << 20).unwrap().len(), 3);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn test_crash_between_marker_and_truncate() {
        let scenario = fail::FailScenario::setup();
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, mut status, _) = open(dir.path());
            log.append(&items(1..=6, 1, 0), 2, &mut status).unwrap();
            status.set(KEY_COMMIT_INDEX, 2);
            log.close(2, &mut status).unwrap();
            fail::cfg("raft-log-truncate-marker-written", "return").unwrap();
            assert!(log.truncate_tail(4, 2, &mut status).is_err());
            fail::remove("raft-log-truncate-marker-written");
        }
        let (log, _, r) = open(dir.path());
        assert_eq!(r, (1, 3));
        assert_eq!(log.last_index(), 3);
        scenario.teardown();
    }

    #[test]
    fn test_delete_after_persist() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, mut status, _) = open(dir.path());
        let big: Vec<LogItem> = (1..=9)
            .map(|i| item(i, 1, if i == 1 { 0 } else { 1 }, &[7u8; 290]))
            .collect();
        log.append(&big, 0, &mut status).unwrap();
        // nothing persisted in the index yet, so nothing may go
        log.mark_delete_by_index(9, Duration::ZERO);
        assert_eq!(log.do_delete().unwrap(), 0);

        log.close(9, &mut status).unwrap();
        log.mark_delete_by_index(9, Duration::ZERO);
        assert_eq!(log.do_delete().unwrap(), 2);
        assert_eq!(log.first_index(), 7);
        assert_eq!(log.load(7, 10, 1 << 20).unwrap().len(), 3);
    }
}
