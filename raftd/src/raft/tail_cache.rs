use std::collections::VecDeque;
use std::time::Instant;

use super::proposal::RaftInput;
use super::LogIndex;
use crate::error::{RaftError, Result};
use crate::store::LogItem;

/// An entry of the log tail kept in memory.
#[derive(Debug)]
pub struct RaftTask {
    pub item: LogItem,
    /// The submitter's input; only on the leader that proposed the entry.
    pub input: Option<RaftInput>,
    pub size: usize,
    pub created: Instant,
    /// Lease reads served once this entry is applied.
    pub readers: Vec<RaftInput>,
}

impl RaftTask {
    pub fn new(item: LogItem, input: Option<RaftInput>, created: Instant) -> Self {
        let size = item.body.len();
        RaftTask {
            item,
            input,
            size,
            created,
            readers: Vec::new(),
        }
    }

    pub fn index(&self) -> LogIndex {
        self.item.index
    }

    /// Fails the submitter and every attached reader.
    pub fn fail_all(&mut self, e: impl Fn() -> RaftError) {
        if let Some(input) = self.input.as_mut() {
            input.fail(e());
        }
        for r in self.readers.iter_mut() {
            r.fail(e());
        }
        self.readers.clear();
    }
}

/// Contiguous window of the log tail, indexed from `first_index`.
#[derive(Debug, Default)]
pub struct TailCache {
    first_index: LogIndex,
    tasks: VecDeque<RaftTask>,
    pending_bytes: u64,
}

impl TailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn first_index(&self) -> Option<LogIndex> {
        if self.tasks.is_empty() {
            None
        } else {
            Some(self.first_index)
        }
    }

    pub fn last_index(&self) -> Option<LogIndex> {
        self.first_index().map(|f| f + self.tasks.len() as u64 - 1)
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub fn put(&mut self, task: RaftTask) -> Result<()> {
        let index = task.index();
        match self.last_index() {
            None => self.first_index = index,
            Some(last) if last + 1 == index => {}
            Some(last) => {
                return Err(RaftError::Invariant(format!(
                    "tail cache put {} after {}",
                    index, last
                )))
            }
        }
        self.pending_bytes += task.size as u64;
        self.tasks.push_back(task);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&RaftTask> {
        if index < self.first_index {
            return None;
        }
        self.tasks.get((index - self.first_index) as usize)
    }

    pub fn get_mut(&mut self, index: LogIndex) -> Option<&mut RaftTask> {
        if index < self.first_index {
            return None;
        }
        self.tasks.get_mut((index - self.first_index) as usize)
    }

    /// Removes `index` and everything after it, returning the removed tasks
    /// in index order.
    pub fn truncate(&mut self, index: LogIndex) -> Vec<RaftTask> {
        let keep = if index <= self.first_index {
            0
        } else {
            ((index - self.first_index) as usize).min(self.tasks.len())
        };
        let removed: Vec<RaftTask> = self.tasks.drain(keep..).collect();
        for t in &removed {
            self.pending_bytes -= t.size as u64;
        }
        removed
    }

    /// Removes the head.
    pub fn remove(&mut self) -> Option<RaftTask> {
        let t = self.tasks.pop_front()?;
        self.first_index += 1;
        self.pending_bytes -= t.size as u64;
        Some(t)
    }

    /// Evicts applied tasks from the head while the cache is over either
    /// bound or the head was created before `stale_before`. Never evicts
    /// past `last_applied`.
    pub fn clean_pending(
        &mut self,
        max_pending: usize,
        max_pending_bytes: u64,
        last_applied: LogIndex,
        stale_before: Instant,
    ) -> usize {
        let mut count = 0;
        while let Some(head) = self.tasks.front() {
            if head.index() > last_applied {
                break;
            }
            let over = self.tasks.len() > max_pending || self.pending_bytes > max_pending_bytes;
            if !over && head.created >= stale_before {
                break;
            }
            self.remove();
            count += 1;
        }
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &RaftTask> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RaftTask> {
        self.tasks.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LogItemType;
    use bytes::Bytes;
    use std::time::Duration;

    fn task(index: LogIndex, size: usize, created: Instant) -> RaftTask {
        RaftTask::new(
            LogItem {
                item_type: LogItemType::Normal,
                term: 1,
                prev_log_term: 1,
                index,
                timestamp: 0,
                body: Bytes::from(vec![0u8; size]),
            },
            None,
            created,
        )
    }

    #[test]
    fn test_clean_pending_stops_at_last_applied() {
        let now = Instant::now();
        let mut c = TailCache::new();
        for i in 1..=3 {
            c.put(task(i, 600, now)).unwrap();
        }
        let evicted = c.clean_pending(2, 1000, 1, now);
        assert_eq!(evicted, 1);
        assert_eq!(c.first_index(), Some(2));
        assert_eq!(c.pending(), 2);
        assert_eq!(c.pending_bytes(), 1200);
    }

    #[test]
    fn test_clean_pending_stale_head() {
        let old = Instant::now();
        let now = old + Duration::from_secs(30);
        let mut c = TailCache::new();
        c.put(task(5, 10, old)).unwrap();
        c.put(task(6, 10, now)).unwrap();
        c.put(task(7, 10, now)).unwrap();
        // within bounds, only the stale head goes
        let stale_before = old + Duration::from_secs(20);
        assert_eq!(c.clean_pending(100, 1 << 20, 7, stale_before), 1);
        assert_eq!(c.first_index(), Some(6));
        assert_eq!(c.clean_pending(100, 1 << 20, 7, stale_before), 0);
    }

    #[test]
    fn test_put_get_truncate() {
        let now = Instant::now();
        let mut c = TailCache::new();
        assert!(c.get(1).is_none());
        for i in 10..15 {
            c.put(task(i, 1, now)).unwrap();
        }
        assert!(c.put(task(16, 1, now)).is_err());
        for i in 0..20 {
            assert_eq!(c.get(i).is_some(), (10..15).contains(&i), "index {}", i);
        }
        let removed = c.truncate(12);
        assert_eq!(removed.iter().map(|t| t.index()).collect::<Vec<_>>(), vec![12, 13, 14]);
        assert_eq!(c.last_index(), Some(11));
        assert_eq!(c.pending_bytes(), 2);
        c.put(task(12, 1, now)).unwrap();
        assert_eq!(c.remove().map(|t| t.index()), Some(10));
        assert_eq!(c.first_index(), Some(11));
    }
}
