use std::time::{Duration, Instant};

use log::{debug, warn};

use super::node::Raft;
use super::{LogIndex, StateMachine};
use crate::error::Result;
use crate::metrics;
use crate::store::KEY_COMMIT_INDEX;

/// Quorum arithmetic over the voting members.
pub(super) struct CommitManager;

impl CommitManager {
    /// Largest index stored on at least `quorum` of the given match indexes.
    pub fn quorum_index(mut matches: Vec<LogIndex>, quorum: usize) -> LogIndex {
        matches.sort_unstable_by(|a, b| b.cmp(a));
        match quorum.checked_sub(1).and_then(|i| matches.get(i)) {
            Some(v) => *v,
            None => 0,
        }
    }

    /// Latest time at which `quorum` voters had confirmed the leader.
    pub fn lease_start(mut confirms: Vec<Option<Instant>>, quorum: usize) -> Option<Instant> {
        confirms.sort_unstable_by(|a, b| b.cmp(a));
        quorum.checked_sub(1).and_then(|i| confirms.get(i).copied().flatten())
    }

    /// How long a lease read stays valid after the lease start. Followers
    /// can not elect another leader before `elect_timeout` passed since they
    /// last heard from this one; one heartbeat interval is kept as margin.
    pub fn lease_time(elect_timeout: Duration, heartbeat_interval: Duration) -> Duration {
        elect_timeout.saturating_sub(heartbeat_interval)
    }
}

impl<S: StateMachine> Raft<S> {
    /// Advances the commit index of a leader to what a quorum has stored.
    /// Entries of earlier terms are only committed together with one of the
    /// current term.
    pub(super) fn try_commit(&mut self, now: Instant) -> Result<()> {
        let mut matches = vec![self.status.last_log_index];
        matches.extend(self.members.voting_peers().map(|m| m.match_index));
        let index = CommitManager::quorum_index(matches, self.members.quorum());
        if index <= self.status.commit_index || index < self.status.first_index_of_current_term {
            return Ok(());
        }
        self.commit_to(index, now)
    }

    pub(super) fn commit_to(&mut self, index: LogIndex, now: Instant) -> Result<()> {
        if index <= self.status.commit_index {
            return Ok(());
        }
        debug!(
            "group {} commit index {} -> {}",
            self.status.group_id, self.status.commit_index, index
        );
        metrics::add_raft_events("commit", index - self.status.commit_index);
        self.status.commit_index = index;
        self.status_file.set(KEY_COMMIT_INDEX, index);
        self.log.on_commit(index, &mut self.status_file)?;
        self.apply_committed(now)
    }

    pub(super) fn update_lease(&mut self, now: Instant) {
        let mut confirms = vec![Some(now)];
        confirms.extend(self.members.voting_peers().map(|m| m.last_confirm));
        self.status.lease_start = CommitManager::lease_start(confirms, self.members.quorum());
    }

    pub(crate) fn lease_valid(&mut self, now: Instant) -> bool {
        if !self.status.is_leader() {
            return false;
        }
        self.update_lease(now);
        let lease_time =
            CommitManager::lease_time(self.config.elect_timeout(), self.config.heartbeat_interval());
        match self.status.lease_start {
            Some(start) => now < start + lease_time,
            None => false,
        }
    }

    /// A leader that heard from no quorum within the election timeout steps
    /// down; a new leader may already exist.
    pub(super) fn check_leader_contact(&mut self, now: Instant) -> Result<bool> {
        let elect_timeout = self.config.elect_timeout();
        let in_office = match self.leader_since {
            Some(t) => now.saturating_duration_since(t) >= elect_timeout,
            None => false,
        };
        if !in_office {
            return Ok(true);
        }
        self.update_lease(now);
        let lost = match self.status.lease_start {
            Some(start) => now.saturating_duration_since(start) >= elect_timeout,
            None => true,
        };
        if lost {
            warn!(
                "group {} leader {} lost contact with the quorum, step down",
                self.status.group_id, self.status.self_id
            );
            self.become_follower(None, now);
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_index() {
        assert_eq!(CommitManager::quorum_index(vec![10], 1), 10);
        assert_eq!(CommitManager::quorum_index(vec![10, 5, 7], 2), 7);
        assert_eq!(CommitManager::quorum_index(vec![10, 5, 7, 9, 1], 3), 7);
        assert_eq!(CommitManager::quorum_index(vec![10, 0, 0], 2), 0);
        assert_eq!(CommitManager::quorum_index(vec![], 1), 0);
    }

    #[test]
    fn test_lease_start() {
        let t = Instant::now();
        let ms = |v| Some(t + Duration::from_millis(v));
        assert_eq!(CommitManager::lease_start(vec![ms(300), ms(100), None], 2), ms(100));
        assert_eq!(CommitManager::lease_start(vec![ms(300), None, None], 2), None);
        assert_eq!(
            CommitManager::lease_start(vec![ms(300), ms(100), ms(200), None, ms(50)], 3),
            ms(100)
        );
    }

    #[test]
    fn test_lease_time() {
        assert_eq!(
            CommitManager::lease_time(Duration::from_millis(1000), Duration::from_millis(100)),
            Duration::from_millis(900)
        );
    }
}
