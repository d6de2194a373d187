use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot::{self, Receiver, Sender};

use super::NodeId;
use crate::error::{RaftError, Result};

#[derive(Debug)]
pub enum RaftInputKind {
    /// Appended to the log and applied once committed.
    Write(Bytes),
    /// Served from the leader's applied state under a valid lease.
    Read(Bytes),
    TransferLeader(NodeId),
}

/// A request submitted to a raft group, completed through a oneshot channel.
#[derive(Debug)]
pub struct RaftInput {
    pub kind: RaftInputKind,
    pub deadline: Instant,
    done: Option<Sender<Result<Vec<u8>>>>,
}

impl RaftInput {
    pub fn new(kind: RaftInputKind, deadline: Instant) -> (Self, Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        let input = RaftInput {
            kind,
            deadline,
            done: Some(tx),
        };
        (input, rx)
    }

    pub fn write(data: Bytes, deadline: Instant) -> (Self, Receiver<Result<Vec<u8>>>) {
        Self::new(RaftInputKind::Write(data), deadline)
    }

    pub fn read(query: Bytes, deadline: Instant) -> (Self, Receiver<Result<Vec<u8>>>) {
        Self::new(RaftInputKind::Read(query), deadline)
    }

    pub fn transfer_leader(new_leader: NodeId, deadline: Instant) -> (Self, Receiver<Result<Vec<u8>>>) {
        Self::new(RaftInputKind::TransferLeader(new_leader), deadline)
    }

    /// Encoded size used for flow control.
    pub fn size(&self) -> usize {
        match &self.kind {
            RaftInputKind::Write(b) | RaftInputKind::Read(b) => b.len(),
            RaftInputKind::TransferLeader(_) => 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Completes the caller's future. Later calls are ignored.
    pub fn complete(&mut self, result: Result<Vec<u8>>) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(result);
        }
    }

    pub fn fail(&mut self, e: RaftError) {
        self.complete(Err(e));
    }
}

impl Drop for RaftInput {
    fn drop(&mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Err(RaftError::Stopping));
        }
    }
}
