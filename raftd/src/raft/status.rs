use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use super::{GroupId, LogIndex, NodeId, RaftRole, Term};

/// Mutable state of a raft group, owned by the group thread.
#[derive(Debug)]
pub struct RaftStatus {
    pub group_id: GroupId,
    pub self_id: NodeId,

    pub current_term: Term,
    /// 0 when no vote was cast in `current_term`.
    pub voted_for: NodeId,
    pub role: RaftRole,
    pub leader_id: Option<NodeId>,

    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,

    pub members: Vec<NodeId>,
    pub observers: Vec<NodeId>,

    /// Index of the noop a leader appended when it took office.
    pub first_index_of_current_term: LogIndex,
    pub lease_start: Option<Instant>,
    pub last_leader_contact: Option<Instant>,
}

impl RaftStatus {
    pub fn new(group_id: GroupId, self_id: NodeId, members: Vec<NodeId>, observers: Vec<NodeId>) -> Self {
        let role = if observers.contains(&self_id) {
            RaftRole::Observer
        } else {
            RaftRole::Follower
        };
        RaftStatus {
            group_id,
            self_id,
            current_term: 0,
            voted_for: 0,
            role,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
            members,
            observers,
            first_index_of_current_term: 0,
            lease_start: None,
            last_leader_contact: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn is_observer(&self) -> bool {
        self.observers.contains(&self.self_id)
    }

    pub fn check_invariant(&self) -> bool {
        self.last_applied <= self.commit_index && self.commit_index <= self.last_log_index
    }
}

/// Thread safe snapshot of a [`RaftStatus`], refreshed by the group thread.
#[derive(Debug, Default)]
pub struct SharedStatus {
    role: AtomicU8,
    term: AtomicU32,
    leader: AtomicU32,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    last_log_index: AtomicU64,
    fatal: AtomicBool,
    closed: AtomicBool,
}

impl SharedStatus {
    pub fn update(&self, s: &RaftStatus) {
        self.role.store(s.role as u8, Ordering::Release);
        self.term.store(s.current_term, Ordering::Release);
        self.leader.store(s.leader_id.unwrap_or(0), Ordering::Release);
        self.commit_index.store(s.commit_index, Ordering::Release);
        self.last_applied.store(s.last_applied, Ordering::Release);
        self.last_log_index.store(s.last_log_index, Ordering::Release);
    }

    pub fn role(&self) -> RaftRole {
        RaftRole::from_u8(self.role.load(Ordering::Acquire)).unwrap_or(RaftRole::Follower)
    }

    pub fn term(&self) -> Term {
        self.term.load(Ordering::Acquire)
    }

    pub fn leader(&self) -> Option<NodeId> {
        match self.leader.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::Acquire)
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.last_log_index.load(Ordering::Acquire)
    }

    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Stopped or failed: the group takes no more work.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.is_fatal()
    }
}
