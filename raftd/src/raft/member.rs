use std::time::{Duration, Instant};

use log::{info, warn};

use super::rpc::RaftPing;
use super::{GroupId, LogIndex, NodeId};

/// Replication state of one member or observer as seen by this node.
#[derive(Debug)]
pub struct RaftMember {
    pub node_id: NodeId,
    pub observer: bool,
    /// The transport reached the node and its identity checked out.
    pub node_ready: bool,
    /// A raft ping showed the node runs this group with the same members.
    pub ready: bool,
    pub pinging: bool,
    pub last_ping: Option<Instant>,

    pub match_index: LogIndex,
    pub next_index: LogIndex,
    /// An append request is outstanding.
    pub in_flight: bool,
    pub last_append: Option<Instant>,
    /// Send time of the newest append this node acknowledged.
    pub last_confirm: Option<Instant>,
}

impl RaftMember {
    fn new(node_id: NodeId, observer: bool) -> Self {
        RaftMember {
            node_id,
            observer,
            node_ready: false,
            ready: false,
            pinging: false,
            last_ping: None,
            match_index: 0,
            next_index: 1,
            in_flight: false,
            last_append: None,
            last_confirm: None,
        }
    }

    pub fn reset_replicate(&mut self, next_index: LogIndex) {
        self.match_index = 0;
        self.next_index = next_index;
        self.in_flight = false;
        self.last_append = None;
        self.last_confirm = None;
    }
}

/// Members and observers of a group other than this node, plus the quorum
/// math over the voting members.
#[derive(Debug)]
pub struct MemberManager {
    group_id: GroupId,
    self_id: NodeId,
    self_observer: bool,
    voters: usize,
    peers: Vec<RaftMember>,
    members: Vec<NodeId>,
    observers: Vec<NodeId>,
}

impl MemberManager {
    pub fn new(group_id: GroupId, self_id: NodeId, members: &[NodeId], observers: &[NodeId]) -> Self {
        let mut peers = Vec::new();
        for id in members.iter().filter(|id| **id != self_id) {
            peers.push(RaftMember::new(*id, false));
        }
        for id in observers.iter().filter(|id| **id != self_id) {
            peers.push(RaftMember::new(*id, true));
        }
        MemberManager {
            group_id,
            self_id,
            self_observer: observers.contains(&self_id),
            voters: members.len(),
            peers,
            members: members.to_vec(),
            observers: observers.to_vec(),
        }
    }

    /// `floor(N/2) + 1` over voting members.
    pub fn quorum(&self) -> usize {
        self.voters / 2 + 1
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    pub fn self_is_voter(&self) -> bool {
        !self.self_observer
    }

    pub fn peers(&self) -> impl Iterator<Item = &RaftMember> {
        self.peers.iter()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut RaftMember> {
        self.peers.iter_mut()
    }

    pub fn voting_peers(&self) -> impl Iterator<Item = &RaftMember> {
        self.peers.iter().filter(|m| !m.observer)
    }

    pub fn get(&self, id: NodeId) -> Option<&RaftMember> {
        self.peers.iter().find(|m| m.node_id == id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut RaftMember> {
        self.peers.iter_mut().find(|m| m.node_id == id)
    }

    pub fn on_node_ready(&mut self, id: NodeId, ready: bool) {
        if let Some(m) = self.get_mut(id) {
            if m.node_ready != ready {
                info!("node {} ready changed to {}", id, ready);
            }
            m.node_ready = ready;
            if !ready {
                m.ready = false;
                m.pinging = false;
                m.last_ping = None;
            }
        }
    }

    pub fn ping_message(&self) -> RaftPing {
        RaftPing {
            group_id: self.group_id,
            node_id: self.self_id,
            members: self.members.clone(),
            observers: self.observers.clone(),
        }
    }

    /// Peers that should be pinged now; marks them as pinging.
    pub fn take_ping_targets(&mut self, now: Instant, retry_interval: Duration) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for m in self.peers.iter_mut() {
            if !m.node_ready || m.ready || m.pinging {
                continue;
            }
            if let Some(last) = m.last_ping {
                if now.saturating_duration_since(last) < retry_interval {
                    continue;
                }
            }
            m.pinging = true;
            m.last_ping = Some(now);
            targets.push(m.node_id);
        }
        targets
    }

    pub fn on_ping_result(&mut self, id: NodeId, resp: Option<&RaftPing>) {
        let (members, observers) = (self.members.clone(), self.observers.clone());
        if let Some(m) = self.get_mut(id) {
            m.pinging = false;
            match resp {
                Some(p) if p.node_id == id && p.same_members(&members, &observers) => {
                    if !m.ready {
                        info!("raft member {} is ready", id);
                    }
                    m.ready = true;
                }
                Some(p) => {
                    warn!(
                        "raft ping of node {} returned different members: {:?} / {:?}",
                        id, p.members, p.observers
                    );
                    m.ready = false;
                }
                None => m.ready = false,
            }
        }
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn observers(&self) -> &[NodeId] {
        &self.observers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_excludes_observers() {
        assert_eq!(MemberManager::new(1, 1, &[1], &[]).quorum(), 1);
        assert_eq!(MemberManager::new(1, 1, &[1, 2], &[]).quorum(), 2);
        assert_eq!(MemberManager::new(1, 1, &[1, 2, 3], &[4, 5]).quorum(), 2);
        assert_eq!(MemberManager::new(1, 1, &[1, 2, 3, 4], &[]).quorum(), 3);
        let m = MemberManager::new(1, 4, &[1, 2, 3], &[4]);
        assert!(!m.self_is_voter());
        assert_eq!(m.voting_peers().count(), 3);
    }

    #[test]
    fn test_ping_marks_ready() {
        let mut m = MemberManager::new(1, 1, &[1, 2, 3], &[]);
        let now = Instant::now();
        assert!(m.take_ping_targets(now, Duration::from_secs(1)).is_empty());
        m.on_node_ready(2, true);
        m.on_node_ready(3, true);
        assert_eq!(m.take_ping_targets(now, Duration::from_secs(1)), vec![2, 3]);
        // in flight, no second ping
        assert!(m.take_ping_targets(now, Duration::from_secs(1)).is_empty());

        let mut ok = m.ping_message();
        ok.node_id = 2;
        m.on_ping_result(2, Some(&ok));
        let mut bad = m.ping_message();
        bad.node_id = 3;
        bad.members = vec![1, 3];
        m.on_ping_result(3, Some(&bad));
        assert!(m.get(2).unwrap().ready);
        assert!(!m.get(3).unwrap().ready);

        let later = now + Duration::from_secs(2);
        assert_eq!(m.take_ping_targets(later, Duration::from_secs(1)), vec![3]);
        m.on_node_ready(2, false);
        assert!(!m.get(2).unwrap().ready);
    }
}
