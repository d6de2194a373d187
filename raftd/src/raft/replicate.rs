use std::time::Instant;

use log::{debug, warn};

use super::node::Raft;
use super::rpc::{AppendCode, AppendReq, AppendResp, RaftRequest, RaftResponse};
use super::tail_cache::RaftTask;
use super::{LogIndex, NodeId, RaftRole, StateMachine};
use crate::error::{RaftError, Result};
use crate::store::LogItem;

impl<S: StateMachine> Raft<S> {
    /// Entries from `start` on, within the replicate limits. Served from the
    /// tail cache when it holds `start`.
    fn entries_from(&mut self, start: LogIndex) -> Result<Vec<LogItem>> {
        let max_items = self.config.max_replicate_items;
        let max_bytes = self.config.max_replicate_bytes;
        if self.tail_cache.get(start).is_some() {
            let mut items = Vec::new();
            let mut bytes = 0;
            let mut index = start;
            while let Some(task) = self.tail_cache.get(index) {
                if items.len() >= max_items || (!items.is_empty() && bytes + task.size > max_bytes) {
                    break;
                }
                bytes += task.size;
                items.push(task.item.clone());
                index += 1;
            }
            return Ok(items);
        }
        self.log.load(start, max_items, max_bytes)
    }

    pub(super) fn replicate_all(&mut self, now: Instant, force: bool) -> Result<()> {
        let ids: Vec<NodeId> = self.members.peers().map(|m| m.node_id).collect();
        for id in ids {
            self.replicate_to(id, now, force)?;
        }
        Ok(())
    }

    /// Sends the next append to `id` unless one is outstanding. Without new
    /// entries only a heartbeat goes out, when one is due or `force` is set.
    pub(super) fn replicate_to(&mut self, id: NodeId, now: Instant, force: bool) -> Result<()> {
        if self.status.role != RaftRole::Leader {
            return Ok(());
        }
        let heartbeat = self.config.heartbeat_interval();
        let (next_index, heartbeat_due) = match self.members.get(id) {
            Some(m) if m.ready && !m.in_flight => {
                let due = match m.last_append {
                    Some(t) => now.saturating_duration_since(t) >= heartbeat,
                    None => true,
                };
                (m.next_index, due)
            }
            _ => return Ok(()),
        };
        let has_entries = next_index <= self.status.last_log_index;
        if !has_entries && !heartbeat_due && !force {
            return Ok(());
        }
        let prev_index = next_index - 1;
        if prev_index > 0 && prev_index < self.log.first_index() && self.tail_cache.get(prev_index).is_none() {
            warn!(
                "group {} member {} needs index {} which was deleted, install a snapshot manually",
                self.status.group_id, id, next_index
            );
            return Ok(());
        }
        let prev_term = self.term_of(prev_index)?;
        let entries = if has_entries {
            self.entries_from(next_index)?
        } else {
            Vec::new()
        };
        let req = AppendReq {
            group_id: self.status.group_id,
            term: self.status.current_term,
            leader_id: self.status.self_id,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            leader_commit: self.status.commit_index,
            entries,
        };
        if let Some(m) = self.members.get_mut(id) {
            m.in_flight = true;
            m.last_append = Some(now);
        }
        self.send(id, RaftRequest::Append(req), now);
        Ok(())
    }

    pub(super) fn on_append_resp(
        &mut self,
        to: NodeId,
        req: &AppendReq,
        sent: Instant,
        result: Result<RaftResponse>,
        now: Instant,
    ) -> Result<()> {
        if let Some(m) = self.members.get_mut(to) {
            m.in_flight = false;
        }
        let resp: AppendResp = match result {
            Ok(RaftResponse::Append(r)) => r,
            Ok(other) => {
                warn!("unexpected response to append: {:?}", other);
                return Ok(());
            }
            Err(e) => {
                debug!("append to {} failed: {}", to, e);
                return Ok(());
            }
        };
        if resp.term > self.status.current_term {
            return self.update_term(resp.term, None, now);
        }
        if self.status.role != RaftRole::Leader || req.term != self.status.current_term {
            return Ok(());
        }
        match resp.code {
            AppendCode::Success if resp.success => {
                if let Some(m) = self.members.get_mut(to) {
                    m.match_index = m.match_index.max(req.last_index());
                    m.next_index = m.match_index + 1;
                    m.last_confirm = m.last_confirm.max(Some(sent));
                }
                self.try_commit(now)?;
                self.check_pending_reads(now);
                self.check_transfer(now)?;
                self.replicate_to(to, now, false)
            }
            AppendCode::LogNotMatch => {
                let next = if resp.suggest_index == 0 {
                    self.log.first_index().max(1)
                } else {
                    match self.log.find_match_pos(resp.suggest_term, resp.suggest_index)? {
                        Some((_, index)) => index + 1,
                        None => self.log.first_index().max(1),
                    }
                };
                // always make progress towards the start of the log
                let next = next.min(req.prev_log_index).max(1);
                debug!(
                    "member {} log not match at {}, suggest ({}, {}), next index {}",
                    to, req.prev_log_index, resp.suggest_term, resp.suggest_index, next
                );
                if let Some(m) = self.members.get_mut(to) {
                    m.next_index = next;
                    m.last_confirm = m.last_confirm.max(Some(sent));
                }
                self.replicate_to(to, now, true)
            }
            AppendCode::NotMember => {
                warn!("node {} says it is not a member of group {}", to, self.status.group_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Follower side of append: matches the leader's log and appends what is
    /// new, truncating a conflicting tail.
    pub(super) fn handle_append_req(&mut self, req: AppendReq, now: Instant) -> Result<AppendResp> {
        req.check_entries()?;
        let mut resp = AppendResp {
            term: self.status.current_term,
            ..Default::default()
        };
        if !self.members.is_voter(req.leader_id) {
            resp.code = AppendCode::NotMember;
            return Ok(resp);
        }
        if req.term < self.status.current_term {
            resp.code = AppendCode::TermLower;
            return Ok(resp);
        }
        if req.term > self.status.current_term {
            self.update_term(req.term, Some(req.leader_id), now)?;
        } else if self.status.role == RaftRole::Leader {
            return Err(RaftError::Invariant(format!(
                "two leaders in term {}: {} and {}",
                req.term, self.status.self_id, req.leader_id
            )));
        } else if matches!(self.status.role, RaftRole::PreCandidate | RaftRole::Candidate) {
            self.become_follower(Some(req.leader_id), now);
        }
        resp.term = self.status.current_term;
        self.status.leader_id = Some(req.leader_id);
        self.status.last_leader_contact = Some(now);
        self.reset_elect_timer(now);

        let commit_index = self.status.commit_index;
        let last_log_index = self.status.last_log_index;
        // committed entries match by definition
        if req.prev_log_index > commit_index {
            let matched = req.prev_log_index <= last_log_index
                && self.term_of(req.prev_log_index)? == req.prev_log_term;
            if !matched {
                let pos = self
                    .log
                    .find_match_pos(req.prev_log_term, req.prev_log_index.min(last_log_index))?;
                if let Some((term, index)) = pos {
                    resp.suggest_term = term;
                    resp.suggest_index = index;
                }
                resp.code = AppendCode::LogNotMatch;
                return Ok(resp);
            }
        }

        let leader_commit = req.leader_commit;
        let last_new = req.last_index();
        let mut skip = 0;
        for e in &req.entries {
            if e.index <= commit_index {
                skip += 1;
                continue;
            }
            if e.index > self.status.last_log_index || self.term_of(e.index)? != e.term {
                break;
            }
            skip += 1;
        }
        let mut entries = req.entries;
        let new_entries = entries.split_off(skip.min(entries.len()));
        if let Some(first) = new_entries.first() {
            self.follower_append(first.index, new_entries, now)?;
        }

        let commit = leader_commit.min(last_new);
        if commit > self.status.commit_index {
            self.commit_to(commit, now)?;
        }
        resp.success = true;
        resp.code = AppendCode::Success;
        Ok(resp)
    }

    fn follower_append(&mut self, first: LogIndex, items: Vec<LogItem>, now: Instant) -> Result<()> {
        if first <= self.status.last_log_index {
            if first <= self.status.commit_index {
                return Err(RaftError::Invariant(format!(
                    "leader overwrites committed index {}",
                    first
                )));
            }
            warn!(
                "group {} truncate conflicting log from {} to {}",
                self.status.group_id, first, self.status.last_log_index
            );
            let leader = self.status.leader_id;
            for mut t in self.tail_cache.truncate(first) {
                self.apply.unapplied_bytes = self.apply.unapplied_bytes.saturating_sub(t.size as u64);
                t.fail_all(|| RaftError::NotLeader(leader));
            }
        }
        self.log
            .append(&items, self.status.commit_index, &mut self.status_file)?;
        for item in items {
            self.status.last_log_index = item.index;
            self.status.last_log_term = item.term;
            let task = RaftTask::new(item, None, now);
            self.apply.unapplied_bytes += task.size as u64;
            self.tail_cache.put(task)?;
        }
        Ok(())
    }
}
