use std::mem;
use std::time::{Duration, Instant};

use log::{error, info};

use super::node::Raft;
use super::proposal::{RaftInput, RaftInputKind};
use super::{LogIndex, LogItemType, StateMachine};
use crate::error::{RaftError, Result};
use crate::metrics;
use crate::store::{LogItem, Snapshot};

/// Applied tasks older than this leave the tail cache even when it is within
/// its bounds.
pub(super) const TAIL_CACHE_STALE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ApplyManager {
    /// Body bytes of entries appended but not yet applied.
    pub(super) unapplied_bytes: u64,
    pub(super) last_snapshot_index: LogIndex,
    pub(super) last_snapshot_time: Instant,
    pub(super) snapshot_running: bool,
}

impl ApplyManager {
    pub fn new(now: Instant) -> Self {
        ApplyManager {
            unapplied_bytes: 0,
            last_snapshot_index: 0,
            last_snapshot_time: now,
            snapshot_running: false,
        }
    }
}

impl<S: StateMachine> Raft<S> {
    fn apply_item(&mut self, item: &LogItem) -> Result<Vec<u8>> {
        match item.item_type {
            LogItemType::Normal => self.sm.apply(item.index, &item.body).map_err(|e| {
                error!(
                    "group {} apply index {} failed: {}",
                    self.status.group_id, item.index, e
                );
                RaftError::StateMachine(format!("apply index {}: {}", item.index, e))
            }),
            // config items are reserved for membership changes
            LogItemType::Noop | LogItemType::Config => Ok(Vec::new()),
        }
    }

    /// Applies committed entries out of the tail cache, completing their
    /// submitters and the lease reads waiting on them.
    pub(super) fn apply_committed(&mut self, now: Instant) -> Result<()> {
        while self.status.last_applied < self.status.commit_index {
            let index = self.status.last_applied + 1;
            let item = match self.tail_cache.get(index) {
                Some(t) => t.item.clone(),
                None => {
                    return Err(RaftError::Invariant(format!(
                        "committed index {} is not in the tail cache",
                        index
                    )))
                }
            };
            let result = self.apply_item(&item)?;
            self.status.last_applied = index;
            self.apply.unapplied_bytes = self.apply.unapplied_bytes.saturating_sub(item.body.len() as u64);
            metrics::inc_raft_event("apply");

            let readers = match self.tail_cache.get_mut(index) {
                Some(task) => {
                    if let Some(input) = task.input.as_mut() {
                        input.complete(Ok(result));
                    }
                    task.input = None;
                    mem::take(&mut task.readers)
                }
                None => Vec::new(),
            };
            for r in readers {
                self.serve_read(r);
            }
        }
        let stale_before = now.checked_sub(TAIL_CACHE_STALE_TIMEOUT).unwrap_or(now);
        self.tail_cache.clean_pending(
            self.config.max_pending_writes,
            self.config.max_pending_bytes,
            self.status.last_applied,
            stale_before,
        );
        Ok(())
    }

    /// Replays committed entries from the log during startup.
    pub(super) fn replay_committed(&mut self) -> Result<()> {
        let start = self.status.last_applied;
        while self.status.last_applied < self.status.commit_index {
            let items = self.log.load(
                self.status.last_applied + 1,
                self.config.max_replicate_items,
                self.config.max_replicate_bytes,
            )?;
            if items.is_empty() {
                return Err(RaftError::Corrupted(format!(
                    "can not load committed index {}",
                    self.status.last_applied + 1
                )));
            }
            for item in items {
                if item.index > self.status.commit_index {
                    break;
                }
                self.apply_item(&item)?;
                self.status.last_applied = item.index;
            }
        }
        if self.status.last_applied > start {
            info!(
                "group {} replayed log {}..={}",
                self.status.group_id,
                start + 1,
                self.status.last_applied
            );
        }
        Ok(())
    }

    pub(super) fn serve_read(&mut self, mut input: RaftInput) {
        let result = match &input.kind {
            RaftInputKind::Read(query) => self.sm.query(query),
            _ => Err(RaftError::Invariant("not a read".to_string())),
        };
        input.complete(result);
    }

    /// Attaches a read to the current commit index: served now when that is
    /// applied, otherwise once it is.
    pub(super) fn attach_read(&mut self, mut input: RaftInput) {
        let read_index = self.status.commit_index;
        if self.status.last_applied >= read_index {
            self.serve_read(input);
            return;
        }
        match self.tail_cache.get_mut(read_index) {
            Some(task) => task.readers.push(input),
            None => input.fail(RaftError::Invariant(format!(
                "read index {} is not in the tail cache",
                read_index
            ))),
        }
    }

    pub fn snapshot_due(&self, now: Instant) -> bool {
        match self.config.save_snapshot_interval() {
            Some(interval) => {
                !self.apply.snapshot_running
                    && self.status.last_applied > self.apply.last_snapshot_index
                    && now.saturating_duration_since(self.apply.last_snapshot_time) >= interval
            }
            None => false,
        }
    }

    /// Captures the state machine at `last_applied`. The caller writes the
    /// file and reports back through [`Raft::on_snapshot_saved`].
    pub fn take_snapshot(&mut self, now: Instant) -> Result<Snapshot> {
        let last_index = self.status.last_applied;
        let last_term = self.term_of(last_index)?;
        self.apply.snapshot_running = true;
        self.apply.last_snapshot_time = now;
        Ok(Snapshot {
            last_index,
            last_term,
            data: self.sm.snapshot(),
        })
    }

    /// Log files below the snapshot that every member already stores become
    /// deletable.
    pub fn on_snapshot_saved(&mut self, index: Option<LogIndex>) {
        self.apply.snapshot_running = false;
        let index = match index {
            Some(i) => i,
            None => return,
        };
        self.apply.last_snapshot_index = index;
        let mut bound = index;
        if self.status.is_leader() {
            for m in self.members.peers() {
                bound = bound.min(m.match_index);
            }
        }
        info!(
            "group {} snapshot at {} saved, log deletable up to {}",
            self.status.group_id, index, bound
        );
        self.log.mark_delete_by_index(bound, self.config.delete_delay());
    }
}
