use std::fs;
use std::mem;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, warn};

use super::apply::ApplyManager;
use super::member::MemberManager;
use super::proposal::{RaftInput, RaftInputKind};
use super::rpc::{
    QueryStatusResp, RaftRequest, RaftResponse, TransferLeaderReq, TransferLeaderResp,
};
use super::status::{RaftStatus, SharedStatus};
use super::tail_cache::{RaftTask, TailCache};
use super::vote::VoteManager;
use super::{LogIndex, LogItem, LogItemType, NodeId, RaftRole, StateMachine, Term};
use crate::config::RaftGroupConfig;
use crate::error::{RaftError, Result};
use crate::metrics;
use crate::store::{
    load_snapshot, now_millis, DefaultRaftLog, StatusFile, KEY_COMMIT_INDEX, KEY_CURRENT_TERM,
    KEY_VOTED_FOR, STATUS_FILE,
};

/// A request the core wants delivered to another member.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: NodeId,
    pub req: RaftRequest,
    pub sent: Instant,
}

struct LeaderTransfer {
    target: NodeId,
    input: RaftInput,
    sent: bool,
}

/// Deterministic raft state machine of one group on one node.
///
/// Time only enters through the `now` arguments and network traffic only
/// leaves through [`Raft::take_outbound`], so the whole protocol can be
/// driven step by step.
pub struct Raft<S: StateMachine> {
    pub(super) config: RaftGroupConfig,
    pub(super) status: RaftStatus,
    shared: Arc<SharedStatus>,
    pub(super) status_file: StatusFile,
    pub(super) log: DefaultRaftLog,
    pub(super) sm: S,
    pub(super) members: MemberManager,
    pub(super) tail_cache: TailCache,
    pub(super) vote: VoteManager,
    pub(super) apply: ApplyManager,
    pub(super) leader_since: Option<Instant>,
    pending_reads: Vec<RaftInput>,
    transfer: Option<LeaderTransfer>,
    outbound: Vec<Outbound>,
}

impl<S: StateMachine> Raft<S> {
    /// Recovers the group from `dir`: status file, snapshot, log, then
    /// replays what was committed.
    pub fn open(
        config: RaftGroupConfig,
        self_id: NodeId,
        dir: &Path,
        mut sm: S,
        shared: Arc<SharedStatus>,
        now: Instant,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let status_file = StatusFile::open(dir.join(STATUS_FILE))?;
        let mut status = RaftStatus::new(
            config.group_id,
            self_id,
            config.members.clone(),
            config.observers.clone(),
        );
        status.current_term = status_file.get_num(KEY_CURRENT_TERM)?;
        status.voted_for = status_file.get_num(KEY_VOTED_FOR)?;
        let persisted_commit: LogIndex = status_file.get_num(KEY_COMMIT_INDEX)?;

        let mut apply = ApplyManager::new(now);
        if let Some(snapshot) = load_snapshot(dir)? {
            info!(
                "group {} install snapshot, lastIndex={}, lastTerm={}",
                config.group_id, snapshot.last_index, snapshot.last_term
            );
            sm.install_snapshot(snapshot.last_index, snapshot.last_term, &snapshot.data)?;
            status.last_applied = snapshot.last_index;
            apply.last_snapshot_index = snapshot.last_index;
        }

        let log = DefaultRaftLog::open(dir, &config)?;
        let members = MemberManager::new(config.group_id, self_id, &config.members, &config.observers);
        let mut raft = Raft {
            config,
            status,
            shared,
            status_file,
            log,
            sm,
            members,
            tail_cache: TailCache::new(),
            vote: VoteManager::new(now),
            apply,
            leader_since: None,
            pending_reads: Vec::new(),
            transfer: None,
            outbound: Vec::new(),
        };
        let (last_term, last_index) = raft.log.init(&mut raft.status_file)?;
        if last_index < raft.status.last_applied {
            return Err(RaftError::Corrupted(format!(
                "log ends at {} but the snapshot is at {}",
                last_index, raft.status.last_applied
            )));
        }
        raft.status.last_log_index = last_index;
        raft.status.last_log_term = last_term;
        raft.status.commit_index = persisted_commit.min(last_index).max(raft.status.last_applied);
        raft.replay_committed()?;
        raft.load_tail(now)?;
        raft.reset_elect_timer(now);
        info!(
            "group {} node {} opened: term={}, votedFor={}, commit={}, lastLog=({}, {})",
            raft.status.group_id,
            self_id,
            raft.status.current_term,
            raft.status.voted_for,
            raft.status.commit_index,
            last_term,
            last_index
        );
        raft.sync_shared();
        Ok(raft)
    }

    /// Puts the uncommitted tail into the cache.
    fn load_tail(&mut self, now: Instant) -> Result<()> {
        let mut index = self.status.commit_index + 1;
        while index <= self.status.last_log_index {
            let items = self.log.load(
                index,
                self.config.max_replicate_items,
                self.config.max_replicate_bytes,
            )?;
            if items.is_empty() {
                return Err(RaftError::Corrupted(format!("can not load index {}", index)));
            }
            for item in items {
                index = item.index + 1;
                let task = RaftTask::new(item, None, now);
                self.apply.unapplied_bytes += task.size as u64;
                self.tail_cache.put(task)?;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> &RaftStatus {
        &self.status
    }

    pub fn state_machine(&self) -> &S {
        &self.sm
    }

    pub fn is_leader(&self) -> bool {
        self.status.is_leader()
    }

    pub fn sync_shared(&self) {
        self.shared.update(&self.status);
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        mem::take(&mut self.outbound)
    }

    pub(super) fn send(&mut self, to: NodeId, req: RaftRequest, now: Instant) {
        self.outbound.push(Outbound { to, req, sent: now });
    }

    pub(super) fn persist_status(&mut self) -> Result<()> {
        self.status_file.set(KEY_CURRENT_TERM, self.status.current_term);
        self.status_file.set(KEY_VOTED_FOR, self.status.voted_for);
        self.status_file.set(KEY_COMMIT_INDEX, self.status.commit_index);
        self.status_file.persist(true)
    }

    pub(super) fn term_of(&mut self, index: LogIndex) -> Result<Term> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.status.last_log_index {
            return Ok(self.status.last_log_term);
        }
        if let Some(task) = self.tail_cache.get(index) {
            return Ok(task.item.term);
        }
        self.log.term_at(index)
    }

    /// Adopts a higher term, clearing the vote, and becomes a follower.
    pub(super) fn update_term(&mut self, term: Term, leader: Option<NodeId>, now: Instant) -> Result<()> {
        info!(
            "group {} node {} term {} -> {}",
            self.status.group_id, self.status.self_id, self.status.current_term, term
        );
        self.status.current_term = term;
        self.status.voted_for = 0;
        self.persist_status()?;
        self.become_follower(leader, now);
        Ok(())
    }

    pub(super) fn become_follower(&mut self, leader: Option<NodeId>, now: Instant) {
        let was_leader = self.status.role == RaftRole::Leader;
        self.status.role = if self.members.self_is_voter() {
            RaftRole::Follower
        } else {
            RaftRole::Observer
        };
        self.status.leader_id = leader;
        self.status.lease_start = None;
        self.leader_since = None;
        self.vote.cancel();
        if was_leader {
            info!(
                "group {} node {} is no longer leader",
                self.status.group_id, self.status.self_id
            );
            for mut r in mem::take(&mut self.pending_reads) {
                r.fail(RaftError::NotLeader(leader));
            }
            if let Some(mut t) = self.transfer.take() {
                t.input.fail(RaftError::NotLeader(leader));
            }
        }
        self.reset_elect_timer(now);
    }

    pub(super) fn become_leader(&mut self, now: Instant) -> Result<()> {
        info!(
            "group {} node {} becomes leader of term {}",
            self.status.group_id, self.status.self_id, self.status.current_term
        );
        self.status.role = RaftRole::Leader;
        self.status.leader_id = Some(self.status.self_id);
        self.status.lease_start = None;
        self.leader_since = Some(now);
        self.vote.cancel();
        let next = self.status.last_log_index + 1;
        for m in self.members.peers_mut() {
            m.reset_replicate(next);
        }
        let noop = LogItem {
            item_type: LogItemType::Noop,
            term: self.status.current_term,
            prev_log_term: self.status.last_log_term,
            index: next,
            timestamp: now_millis(),
            body: Bytes::new(),
        };
        self.log.append(
            std::slice::from_ref(&noop),
            self.status.commit_index,
            &mut self.status_file,
        )?;
        self.status.last_log_index = next;
        self.status.last_log_term = self.status.current_term;
        self.status.first_index_of_current_term = next;
        self.tail_cache.put(RaftTask::new(noop, None, now))?;
        metrics::inc_raft_event("leader");
        self.try_commit(now)?;
        self.replicate_all(now, true)
    }

    pub fn on_node_ready(&mut self, id: NodeId, ready: bool) {
        self.members.on_node_ready(id, ready);
    }

    /// Accepts a batch of client inputs. Writes of one batch go to the log
    /// in a single append.
    pub fn propose(&mut self, inputs: Vec<RaftInput>, now: Instant) -> Result<()> {
        let mut writes = Vec::new();
        for input in inputs {
            match input.kind {
                RaftInputKind::Write(_) => writes.push(input),
                RaftInputKind::Read(_) => self.handle_read(input, now)?,
                RaftInputKind::TransferLeader(target) => self.start_transfer(input, target, now)?,
            }
        }
        if !writes.is_empty() {
            self.propose_writes(writes, now)?;
        }
        self.sync_shared();
        Ok(())
    }

    fn propose_writes(&mut self, writes: Vec<RaftInput>, now: Instant) -> Result<()> {
        let mut accepted: Vec<(LogItem, RaftInput)> = Vec::new();
        let mut batch_bytes = 0u64;
        for mut input in writes {
            if self.status.role != RaftRole::Leader {
                input.fail(RaftError::NotLeader(self.status.leader_id));
                continue;
            }
            if self.transfer.is_some() {
                input.fail(RaftError::FlowControl("leader transfer in progress".to_string()));
                continue;
            }
            if input.is_expired(now) {
                input.fail(RaftError::Timeout("write expired before append".to_string()));
                continue;
            }
            let index = self.status.last_log_index + accepted.len() as u64 + 1;
            let pending = index - 1 - self.status.last_applied;
            let size = input.size() as u64;
            if pending >= self.config.max_pending_writes as u64
                || self.apply.unapplied_bytes + batch_bytes + size > self.config.max_pending_bytes
            {
                input.fail(RaftError::FlowControl(format!(
                    "{} writes pending, {} bytes",
                    pending,
                    self.apply.unapplied_bytes + batch_bytes
                )));
                continue;
            }
            let body = match &input.kind {
                RaftInputKind::Write(b) => b.clone(),
                _ => Bytes::new(),
            };
            let prev_log_term = match accepted.last() {
                Some(_) => self.status.current_term,
                None => self.status.last_log_term,
            };
            let item = LogItem {
                item_type: LogItemType::Normal,
                term: self.status.current_term,
                prev_log_term,
                index,
                timestamp: now_millis(),
                body,
            };
            batch_bytes += size;
            accepted.push((item, input));
        }
        if accepted.is_empty() {
            return Ok(());
        }
        let items: Vec<LogItem> = accepted.iter().map(|(item, _)| item.clone()).collect();
        self.log
            .append(&items, self.status.commit_index, &mut self.status_file)?;
        metrics::add_raft_events("write", items.len() as u64);
        for (item, input) in accepted {
            self.status.last_log_index = item.index;
            self.status.last_log_term = item.term;
            let task = RaftTask::new(item, Some(input), now);
            self.apply.unapplied_bytes += task.size as u64;
            self.tail_cache.put(task)?;
        }
        self.try_commit(now)?;
        self.replicate_all(now, false)
    }

    fn handle_read(&mut self, mut input: RaftInput, now: Instant) -> Result<()> {
        if self.status.role != RaftRole::Leader {
            input.fail(RaftError::NotLeader(self.status.leader_id));
            return Ok(());
        }
        if input.is_expired(now) {
            input.fail(RaftError::Timeout("read expired".to_string()));
            return Ok(());
        }
        if self.lease_valid(now)
            && self.status.commit_index >= self.status.first_index_of_current_term
        {
            self.attach_read(input);
            return Ok(());
        }
        // confirm leadership with a heartbeat round first
        self.pending_reads.push(input);
        self.replicate_all(now, true)
    }

    pub(super) fn check_pending_reads(&mut self, now: Instant) {
        if self.pending_reads.is_empty() {
            return;
        }
        let ready = self.lease_valid(now)
            && self.status.commit_index >= self.status.first_index_of_current_term;
        for mut r in mem::take(&mut self.pending_reads) {
            if ready {
                self.attach_read(r);
            } else if r.is_expired(now) {
                r.fail(RaftError::Timeout("no valid lease for read".to_string()));
            } else {
                self.pending_reads.push(r);
            }
        }
    }

    fn start_transfer(&mut self, mut input: RaftInput, target: NodeId, now: Instant) -> Result<()> {
        if self.status.role != RaftRole::Leader {
            input.fail(RaftError::NotLeader(self.status.leader_id));
            return Ok(());
        }
        if target == self.status.self_id {
            input.complete(Ok(Vec::new()));
            return Ok(());
        }
        if self.transfer.is_some() {
            input.fail(RaftError::AdminConflict("leader transfer in progress".to_string()));
            return Ok(());
        }
        match self.members.get(target) {
            Some(m) if !m.observer && m.ready => {}
            Some(m) if !m.observer => {
                input.fail(RaftError::PeerUnreachable(target));
                return Ok(());
            }
            _ => {
                input.fail(RaftError::AdminConflict(format!(
                    "node {} is not a voting member",
                    target
                )));
                return Ok(());
            }
        }
        info!(
            "group {} transfer leadership from {} to {}",
            self.status.group_id, self.status.self_id, target
        );
        self.transfer = Some(LeaderTransfer {
            target,
            input,
            sent: false,
        });
        self.check_transfer(now)?;
        self.replicate_to(target, now, false)
    }

    /// Sends the transfer request once the target stores the whole log.
    pub(super) fn check_transfer(&mut self, now: Instant) -> Result<()> {
        let (target, sent, expired) = match &self.transfer {
            Some(t) => (t.target, t.sent, t.input.is_expired(now)),
            None => return Ok(()),
        };
        if expired {
            if let Some(mut t) = self.transfer.take() {
                warn!("group {} leader transfer to {} timed out", self.status.group_id, target);
                t.input.fail(RaftError::Timeout(format!("transfer leader to {}", target)));
            }
            return Ok(());
        }
        if sent {
            return Ok(());
        }
        let caught_up = match self.members.get(target) {
            Some(m) => m.match_index == self.status.last_log_index,
            None => false,
        };
        if !caught_up {
            return Ok(());
        }
        let req = TransferLeaderReq {
            group_id: self.status.group_id,
            term: self.status.current_term,
            old_leader_id: self.status.self_id,
            log_index: self.status.last_log_index,
        };
        if let Some(t) = self.transfer.as_mut() {
            t.sent = true;
        }
        self.send(target, RaftRequest::TransferLeader(req), now);
        Ok(())
    }

    fn on_transfer_resp(&mut self, result: Result<RaftResponse>, now: Instant) -> Result<()> {
        let mut t = match self.transfer.take() {
            Some(t) => t,
            None => return Ok(()),
        };
        match result {
            Ok(RaftResponse::TransferLeader(r)) if r.success => {
                info!(
                    "group {} node {} accepted the leadership",
                    self.status.group_id, t.target
                );
                t.input.complete(Ok(Vec::new()));
                if self.status.role == RaftRole::Leader {
                    self.become_follower(Some(t.target), now);
                }
            }
            Ok(RaftResponse::TransferLeader(r)) => {
                t.input.fail(RaftError::AdminConflict(format!(
                    "node {} refused the leadership",
                    t.target
                )));
                if r.term > self.status.current_term {
                    self.update_term(r.term, None, now)?;
                }
            }
            Ok(other) => t.input.fail(RaftError::Protocol(format!(
                "unexpected transfer response {:?}",
                other
            ))),
            Err(e) => t.input.fail(e),
        }
        Ok(())
    }

    /// A follower whose log equals the old leader's starts a binding vote
    /// right away.
    fn handle_transfer_req(&mut self, req: &TransferLeaderReq, now: Instant) -> Result<TransferLeaderResp> {
        let mut resp = TransferLeaderResp {
            term: self.status.current_term,
            success: false,
        };
        if req.term == self.status.current_term
            && self.status.role == RaftRole::Follower
            && req.log_index == self.status.last_log_index
        {
            self.start_vote(now)?;
            resp.term = req.term;
            resp.success = true;
        } else {
            warn!(
                "refuse leader transfer from {}: term {}/{}, log index {}/{}",
                req.old_leader_id,
                req.term,
                self.status.current_term,
                req.log_index,
                self.status.last_log_index
            );
        }
        Ok(resp)
    }

    pub fn query_status(&self) -> QueryStatusResp {
        QueryStatusResp {
            group_id: self.status.group_id,
            node_id: self.status.self_id,
            role: self.status.role,
            term: self.status.current_term,
            leader_id: self.status.leader_id.unwrap_or(0),
            commit_index: self.status.commit_index,
            last_applied: self.status.last_applied,
            last_log_index: self.status.last_log_index,
        }
    }

    /// Serves a request from the same group on node `from`.
    pub fn handle_request(&mut self, from: NodeId, req: RaftRequest, now: Instant) -> Result<RaftResponse> {
        let resp = match req {
            RaftRequest::Vote(r) => RaftResponse::Vote(self.handle_vote_req(&r, now)?),
            RaftRequest::Append(r) => RaftResponse::Append(self.handle_append_req(r, now)?),
            RaftRequest::Ping(r) => {
                if !r.same_members(self.members.members(), self.members.observers()) {
                    warn!("raft ping from {} with different members: {:?}", from, r.members);
                }
                RaftResponse::Ping(self.members.ping_message())
            }
            RaftRequest::QueryStatus(_) => RaftResponse::QueryStatus(self.query_status()),
            RaftRequest::TransferLeader(r) => {
                RaftResponse::TransferLeader(self.handle_transfer_req(&r, now)?)
            }
        };
        self.sync_shared();
        Ok(resp)
    }

    /// Feeds back the outcome of a request taken from the outbound queue.
    pub fn handle_response(&mut self, out: Outbound, result: Result<RaftResponse>, now: Instant) -> Result<()> {
        let Outbound { to, req, sent } = out;
        match &req {
            RaftRequest::Vote(r) => match result {
                Ok(RaftResponse::Vote(resp)) => self.on_vote_resp(to, r, &resp, now)?,
                Ok(other) => warn!("unexpected response to vote: {:?}", other),
                Err(e) => debug!("vote request to {} failed: {}", to, e),
            },
            RaftRequest::Append(r) => self.on_append_resp(to, r, sent, result, now)?,
            RaftRequest::Ping(_) => {
                let ping = match &result {
                    Ok(RaftResponse::Ping(p)) => Some(p),
                    _ => None,
                };
                let ok = ping.is_some();
                self.members.on_ping_result(to, ping);
                if ok {
                    self.replicate_to(to, now, true)?;
                }
            }
            RaftRequest::QueryStatus(_) => {}
            RaftRequest::TransferLeader(_) => self.on_transfer_resp(result, now)?,
        }
        self.sync_shared();
        Ok(())
    }

    /// Timer driven work: elections, heartbeats, read and transfer deadlines,
    /// pings and log file deletion.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        match self.status.role {
            RaftRole::Leader => {
                self.check_pending_reads(now);
                if self.check_leader_contact(now)? {
                    self.check_transfer(now)?;
                    self.replicate_all(now, false)?;
                }
            }
            RaftRole::Observer => {}
            _ => {
                if now >= self.vote.elect_deadline {
                    self.campaign(now)?;
                }
            }
        }
        let targets = self
            .members
            .take_ping_targets(now, self.config.heartbeat_interval());
        for to in targets {
            let ping = self.members.ping_message();
            self.send(to, RaftRequest::Ping(ping), now);
        }
        self.log.do_delete()?;
        self.sync_shared();
        Ok(())
    }

    /// Fails every waiting caller with the error built by `e`.
    pub fn fail_all(&mut self, e: impl Fn() -> RaftError) {
        for mut r in mem::take(&mut self.pending_reads) {
            r.fail(e());
        }
        if let Some(mut t) = self.transfer.take() {
            t.input.fail(e());
        }
        for task in self.tail_cache.iter_mut() {
            task.fail_all(&e);
        }
    }

    /// Fails all waiters and persists what the index may persist.
    pub fn close(&mut self) -> Result<()> {
        self.fail_all(|| RaftError::Stopping);
        self.log
            .close(self.status.commit_index, &mut self.status_file)?;
        self.persist_status()
    }
}
