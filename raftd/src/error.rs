//! Error taxonomy for the raft engine.
//!
//! Every error carries a [`ErrorScope`] telling the caller how far the damage
//! reaches: only the current operation, the whole raft group, or the process.

use std::io;

use thiserror::Error;

use crate::raft::{GroupId, NodeId};

pub type Result<T> = std::result::Result<T, RaftError>;

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Abort the current request; the group keeps running.
    Operation,
    /// Stop the raft group; sibling groups are not affected.
    Group,
    /// The process can not continue (bad configuration and the like).
    Process,
}

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not leader, current leader: {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(NodeId),

    #[error("flow control: {0}")]
    FlowControl(String),

    #[error("group is stopping")]
    Stopping,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("checksum mismatch: {0}")]
    Checksum(String),

    #[error("storage corrupted: {0}")]
    Corrupted(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("state machine failure: {0}")]
    StateMachine(String),

    #[error("admin operation rejected: {0}")]
    AdminConflict(String),

    #[error("raft group {0} is stopped")]
    GroupStopped(GroupId),

    #[error("raft group {0} not found")]
    GroupNotFound(GroupId),

    #[error("fiber dispatcher is shut down")]
    DispatcherShutdown,

    #[error("bad config: {0}")]
    Config(String),

    #[error("remote error code {code}: {msg}")]
    Remote { code: u32, msg: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RaftError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            RaftError::Corrupted(_)
            | RaftError::Invariant(_)
            | RaftError::StateMachine(_)
            | RaftError::Io(_) => ErrorScope::Group,
            RaftError::Config(_) => ErrorScope::Process,
            _ => ErrorScope::Operation,
        }
    }

    /// Whether the caller may simply try again later (possibly on another node).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader(_)
                | RaftError::Timeout(_)
                | RaftError::PeerUnreachable(_)
                | RaftError::FlowControl(_)
                | RaftError::Stopping
        )
    }

    /// Builds the error kept by a group that stopped on a fatal failure.
    pub(crate) fn copy_for_waiter(&self, group_id: GroupId) -> RaftError {
        match self {
            RaftError::NotLeader(l) => RaftError::NotLeader(*l),
            RaftError::Timeout(s) => RaftError::Timeout(s.clone()),
            RaftError::FlowControl(s) => RaftError::FlowControl(s.clone()),
            RaftError::Stopping => RaftError::Stopping,
            _ => RaftError::GroupStopped(group_id),
        }
    }
}
