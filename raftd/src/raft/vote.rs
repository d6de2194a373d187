use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use super::node::Raft;
use super::rpc::{RaftRequest, VoteReq, VoteResp};
use super::{NodeId, RaftRole, StateMachine, Term};
use crate::error::Result;
use crate::metrics;

/// Election bookkeeping of the current (pre-)vote round.
#[derive(Debug)]
pub struct VoteManager {
    pub(super) elect_deadline: Instant,
    active: bool,
    pre_vote: bool,
    vote_term: Term,
    votes: Vec<NodeId>,
}

impl VoteManager {
    pub fn new(now: Instant) -> Self {
        VoteManager {
            elect_deadline: now,
            active: false,
            pre_vote: false,
            vote_term: 0,
            votes: Vec::new(),
        }
    }

    pub fn cancel(&mut self) {
        self.active = false;
        self.votes.clear();
    }

    fn begin(&mut self, term: Term, pre_vote: bool, self_id: NodeId) {
        self.active = true;
        self.pre_vote = pre_vote;
        self.vote_term = term;
        self.votes.clear();
        self.votes.push(self_id);
    }

    fn add_vote(&mut self, id: NodeId) {
        if !self.votes.contains(&id) {
            self.votes.push(id);
        }
    }
}

/// Election timeout plus up to half of it again, so that nodes rarely time
/// out together.
pub(super) fn random_elect_timeout(elect_timeout: Duration) -> Duration {
    let jitter = elect_timeout.as_millis() as u64 / 2;
    elect_timeout + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter))
}

impl<S: StateMachine> Raft<S> {
    pub(super) fn reset_elect_timer(&mut self, now: Instant) {
        self.vote.elect_deadline = now + random_elect_timeout(self.config.elect_timeout());
    }

    fn has_live_leader(&self, now: Instant) -> bool {
        if self.status.role == RaftRole::Leader {
            return true;
        }
        match (self.status.leader_id, self.status.last_leader_contact) {
            (Some(_), Some(t)) => now.saturating_duration_since(t) < self.config.elect_timeout(),
            _ => false,
        }
    }

    fn log_up_to_date(&self, req: &VoteReq) -> bool {
        (req.last_log_term, req.last_log_index)
            >= (self.status.last_log_term, self.status.last_log_index)
    }

    /// Starts an election: a pre-vote round first when enabled.
    pub(crate) fn campaign(&mut self, now: Instant) -> Result<()> {
        if !self.members.self_is_voter() || self.status.role == RaftRole::Leader {
            return Ok(());
        }
        if self.config.pre_vote {
            self.start_pre_vote(now)
        } else {
            self.start_vote(now)
        }
    }

    fn start_pre_vote(&mut self, now: Instant) -> Result<()> {
        let term = self.status.current_term + 1;
        info!(
            "group {} node {} start pre vote, term {}",
            self.status.group_id, self.status.self_id, term
        );
        self.status.role = RaftRole::PreCandidate;
        self.vote.begin(term, true, self.status.self_id);
        self.reset_elect_timer(now);
        self.send_vote_requests(term, true, now);
        self.check_votes(now)
    }

    pub(super) fn start_vote(&mut self, now: Instant) -> Result<()> {
        self.status.current_term += 1;
        self.status.voted_for = self.status.self_id;
        self.status.role = RaftRole::Candidate;
        self.status.leader_id = None;
        self.persist_status()?;
        metrics::inc_raft_event("election");
        let term = self.status.current_term;
        info!(
            "group {} node {} start vote, term {}",
            self.status.group_id, self.status.self_id, term
        );
        self.vote.begin(term, false, self.status.self_id);
        self.reset_elect_timer(now);
        self.send_vote_requests(term, false, now);
        self.check_votes(now)
    }

    fn send_vote_requests(&mut self, term: Term, pre_vote: bool, now: Instant) {
        let req = VoteReq {
            group_id: self.status.group_id,
            term,
            candidate_id: self.status.self_id,
            last_log_index: self.status.last_log_index,
            last_log_term: self.status.last_log_term,
            pre_vote,
        };
        let targets: Vec<NodeId> = self
            .members
            .voting_peers()
            .filter(|m| m.ready)
            .map(|m| m.node_id)
            .collect();
        for to in targets {
            self.send(to, RaftRequest::Vote(req.clone()), now);
        }
    }

    fn check_votes(&mut self, now: Instant) -> Result<()> {
        if !self.vote.active || self.vote.votes.len() < self.members.quorum() {
            return Ok(());
        }
        if self.vote.pre_vote {
            self.start_vote(now)
        } else {
            self.become_leader(now)
        }
    }

    pub(super) fn handle_vote_req(&mut self, req: &VoteReq, now: Instant) -> Result<VoteResp> {
        let mut resp = VoteResp {
            term: self.status.current_term,
            vote_granted: false,
        };
        if !self.members.self_is_voter() || !self.members.is_voter(req.candidate_id) {
            return Ok(resp);
        }
        if req.pre_vote {
            resp.vote_granted = req.term > self.status.current_term
                && self.log_up_to_date(req)
                && !self.has_live_leader(now);
            debug!(
                "pre vote of {} for term {}: {}",
                req.candidate_id, req.term, resp.vote_granted
            );
            return Ok(resp);
        }
        if req.term < self.status.current_term {
            return Ok(resp);
        }
        if req.term > self.status.current_term {
            self.update_term(req.term, None, now)?;
        }
        let can_vote =
            self.status.voted_for == 0 || self.status.voted_for == req.candidate_id;
        if can_vote && self.log_up_to_date(req) {
            self.status.voted_for = req.candidate_id;
            // must reach the disk before the grant leaves this node
            self.persist_status()?;
            self.reset_elect_timer(now);
            resp.vote_granted = true;
        }
        resp.term = self.status.current_term;
        info!(
            "vote of {} for term {}: {}",
            req.candidate_id, req.term, resp.vote_granted
        );
        Ok(resp)
    }

    pub(super) fn on_vote_resp(
        &mut self,
        from: NodeId,
        req: &VoteReq,
        resp: &VoteResp,
        now: Instant,
    ) -> Result<()> {
        if resp.term > self.status.current_term {
            return self.update_term(resp.term, None, now);
        }
        if !self.vote.active || req.term != self.vote.vote_term || req.pre_vote != self.vote.pre_vote {
            return Ok(());
        }
        let expected_role = if req.pre_vote {
            RaftRole::PreCandidate
        } else {
            RaftRole::Candidate
        };
        if self.status.role != expected_role {
            return Ok(());
        }
        if !req.pre_vote && req.term != self.status.current_term {
            return Ok(());
        }
        if resp.vote_granted {
            self.vote.add_vote(from);
            self.check_votes(now)?;
        }
        Ok(())
    }
}
