//! Raft consensus for one group.
//!
//! [`Raft`] is the deterministic core: it owns the log, the status file and
//! the state machine, consumes requests, responses and ticks, and leaves the
//! requests it wants sent in an outbound queue. [`RaftGroup`] drives a core
//! from a fiber on the group's own dispatcher thread.

use std::fmt;

use crate::error::Result;

mod apply;
mod commit;
mod group;
mod member;
mod node;
mod proposal;
mod replicate;
pub mod rpc;
mod status;
mod tail_cache;
#[cfg(test)]
mod tests;
mod vote;

pub use self::node::{Outbound, Raft};
pub use self::group::{GroupContext, RaftGroup};
pub use self::proposal::{RaftInput, RaftInputKind};
pub use self::status::{RaftStatus, SharedStatus};
pub use self::tail_cache::{RaftTask, TailCache};
pub use crate::store::{LogItem, LogItemType};

pub type NodeId = u32;
pub type GroupId = u32;
pub type Term = u32;
pub type LogIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower = 0,
    PreCandidate = 1,
    Candidate = 2,
    Leader = 3,
    Observer = 4,
}

impl RaftRole {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RaftRole::Follower),
            1 => Some(RaftRole::PreCandidate),
            2 => Some(RaftRole::Candidate),
            3 => Some(RaftRole::Leader),
            4 => Some(RaftRole::Observer),
            _ => None,
        }
    }
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaftRole::Follower => "follower",
            RaftRole::PreCandidate => "pre-candidate",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
            RaftRole::Observer => "observer",
        };
        f.write_str(s)
    }
}

/// The replicated application. Called on the group thread only, strictly in
/// log order.
pub trait StateMachine: Send + 'static {
    /// Applies a committed entry. An error stops the group.
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<Vec<u8>>;

    /// Serves a lease read against the applied state.
    fn query(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn snapshot(&self) -> Vec<u8>;

    fn install_snapshot(&mut self, last_index: LogIndex, last_term: Term, data: &[u8]) -> Result<()>;
}

impl<T: StateMachine + ?Sized> StateMachine for Box<T> {
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<Vec<u8>> {
        (**self).apply(index, data)
    }

    fn query(&self, data: &[u8]) -> Result<Vec<u8>> {
        (**self).query(data)
    }

    fn snapshot(&self) -> Vec<u8> {
        (**self).snapshot()
    }

    fn install_snapshot(&mut self, last_index: LogIndex, last_term: Term, data: &[u8]) -> Result<()> {
        (**self).install_snapshot(last_index, last_term, data)
    }
}
