//! Multi-node scenarios driven through an in-memory message pump with a
//! virtual clock.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::oneshot::{error::TryRecvError, Receiver};

use super::rpc::{AppendReq, RaftRequest};
use super::*;
use crate::config::RaftGroupConfig;
use crate::error::{ErrorScope, RaftError};
use crate::store::save_snapshot;

#[derive(Default)]
struct ListSm {
    entries: Vec<(LogIndex, Vec<u8>)>,
}

impl StateMachine for ListSm {
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<Vec<u8>> {
        self.entries.push((index, data.to_vec()));
        Ok(index.to_be_bytes().to_vec())
    }

    fn query(&self, _data: &[u8]) -> Result<Vec<u8>> {
        Ok((self.entries.len() as u64).to_be_bytes().to_vec())
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.entries).unwrap()
    }

    fn install_snapshot(&mut self, _last_index: LogIndex, _last_term: Term, data: &[u8]) -> Result<()> {
        self.entries = bincode::deserialize(data).map_err(|e| RaftError::Corrupted(e.to_string()))?;
        Ok(())
    }
}

type Reply = Receiver<Result<Vec<u8>>>;

fn group_config(n: NodeId) -> RaftGroupConfig {
    RaftGroupConfig {
        members: (1..=n).collect(),
        elect_timeout_ms: 1000,
        heartbeat_interval_ms: 100,
        log_file_size: 1 << 20,
        idx_items_per_file: 1024,
        idx_flush_items: 16,
        sync_force: false,
        save_snapshot_interval_ms: 0,
        ..Default::default()
    }
}

struct Cluster {
    dir: TempDir,
    config: RaftGroupConfig,
    nodes: BTreeMap<NodeId, Raft<ListSm>>,
    now: Instant,
    cut: HashSet<(NodeId, NodeId)>,
    appends: Vec<(NodeId, AppendReq)>,
    leaders: BTreeMap<Term, NodeId>,
}

impl Cluster {
    fn new(n: NodeId) -> Self {
        let mut c = Cluster {
            dir: tempfile::tempdir().unwrap(),
            config: group_config(n),
            nodes: BTreeMap::new(),
            now: Instant::now(),
            cut: HashSet::new(),
            appends: Vec::new(),
            leaders: BTreeMap::new(),
        };
        for id in 1..=n {
            c.start(id);
        }
        // early nodes pinged peers that were not up yet; let the pings retry
        c.advance(c.config.heartbeat_interval() + Duration::from_millis(50));
        for id in 1..=n {
            assert!(
                c.node(id).members.peers().all(|m| m.ready),
                "node {} has peers not ready",
                id
            );
        }
        c
    }

    fn node_dir(&self, id: NodeId) -> PathBuf {
        self.dir.path().join(format!("node-{}", id))
    }

    fn start(&mut self, id: NodeId) {
        let dir = self.node_dir(id);
        let mut raft = Raft::open(
            self.config.clone(),
            id,
            &dir,
            ListSm::default(),
            Arc::new(SharedStatus::default()),
            self.now,
        )
        .unwrap();
        for peer in self.config.members.clone() {
            if peer != id {
                raft.on_node_ready(peer, true);
            }
        }
        raft.tick(self.now).unwrap();
        self.nodes.insert(id, raft);
        self.pump();
    }

    fn restart(&mut self, id: NodeId) {
        let mut raft = self.nodes.remove(&id).unwrap();
        raft.close().unwrap();
        drop(raft);
        self.start(id);
    }

    fn node(&self, id: NodeId) -> &Raft<ListSm> {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Raft<ListSm> {
        self.nodes.get_mut(&id).unwrap()
    }

    fn is_cut(&self, a: NodeId, b: NodeId) -> bool {
        self.cut.contains(&(a, b)) || self.cut.contains(&(b, a))
    }

    fn isolate(&mut self, id: NodeId) {
        for peer in self.config.members.clone() {
            if peer != id {
                self.cut.insert((id, peer));
            }
        }
    }

    fn heal(&mut self) {
        self.cut.clear();
    }

    /// Delivers outbound requests and their responses until all queues are
    /// empty.
    fn pump(&mut self) {
        loop {
            let mut batch = Vec::new();
            for (id, node) in self.nodes.iter_mut() {
                for out in node.take_outbound() {
                    batch.push((*id, out));
                }
            }
            if batch.is_empty() {
                break;
            }
            for (from, out) in batch {
                if let RaftRequest::Append(r) = &out.req {
                    self.appends.push((out.to, r.clone()));
                }
                let now = self.now;
                let result = if self.is_cut(from, out.to) || !self.nodes.contains_key(&out.to) {
                    Err(RaftError::PeerUnreachable(out.to))
                } else {
                    Ok(self
                        .node_mut(out.to)
                        .handle_request(from, out.req.clone(), now)
                        .unwrap())
                };
                if let Some(node) = self.nodes.get_mut(&from) {
                    node.handle_response(out, result, now).unwrap();
                }
            }
            self.observe_leaders();
        }
    }

    fn observe_leaders(&mut self) {
        for (id, node) in &self.nodes {
            if node.is_leader() {
                let term = node.status().current_term;
                let prev = *self.leaders.entry(term).or_insert(*id);
                assert_eq!(prev, *id, "two leaders in term {}", term);
            }
        }
    }

    fn step(&mut self) {
        self.now += Duration::from_millis(10);
        let now = self.now;
        for node in self.nodes.values_mut() {
            node.tick(now).unwrap();
        }
        self.pump();
    }

    fn advance(&mut self, d: Duration) {
        let end = self.now + d;
        while self.now < end {
            self.step();
        }
    }

    fn elect(&mut self, id: NodeId) {
        let now = self.now;
        self.node_mut(id).campaign(now).unwrap();
        self.pump();
        assert!(self.node(id).is_leader(), "node {} not elected", id);
    }

    fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_leader())
            .max_by_key(|(_, n)| n.status().current_term)
            .map(|(id, _)| *id)
    }

    fn submit(&mut self, id: NodeId, input: RaftInput) {
        let now = self.now;
        self.node_mut(id).propose(vec![input], now).unwrap();
        self.pump();
    }

    fn write(&mut self, id: NodeId, data: &str) -> Reply {
        let (input, rx) = RaftInput::write(Bytes::from(data.to_string()), self.now + Duration::from_secs(5));
        self.submit(id, input);
        rx
    }

    fn read(&mut self, id: NodeId, timeout: Duration) -> Reply {
        let (input, rx) = RaftInput::read(Bytes::new(), self.now + timeout);
        self.submit(id, input);
        rx
    }

    fn applied(&self, id: NodeId) -> Vec<(LogIndex, Vec<u8>)> {
        self.node(id).state_machine().entries.clone()
    }
}

fn index_of(reply: Vec<u8>) -> LogIndex {
    let mut b = [0u8; 8];
    b.copy_from_slice(&reply);
    u64::from_be_bytes(b)
}

#[test]
fn test_single_node_commits_alone() {
    let mut c = Cluster::new(1);
    c.elect(1);
    assert_eq!(c.node(1).status().current_term, 1);
    // noop of the new term is index 1
    let mut rx = c.write(1, "a");
    assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), 2);
    let mut rx = c.read(1, Duration::from_secs(1));
    assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), 1);
    assert_eq!(c.node(1).status().commit_index, 2);
}

#[test]
fn test_lagging_follower_catches_up_from_next_index() {
    let mut c = Cluster::new(3);
    c.elect(1);
    for i in 2..=5 {
        let mut rx = c.write(1, &format!("v{}", i));
        assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), i);
    }
    c.advance(Duration::from_millis(200));
    assert_eq!(c.node(2).status().last_log_index, 5);

    c.cut.insert((1, 2));
    for i in 6..=10 {
        // node 3 completes the quorum
        let mut rx = c.write(1, &format!("v{}", i));
        assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), i);
    }
    assert_eq!(c.node(2).status().last_log_index, 5);

    let mark = c.appends.len();
    c.heal();
    c.advance(Duration::from_millis(300));
    let s = c.node(2).status();
    assert_eq!((s.last_log_index, s.commit_index, s.last_applied), (10, 10, 10));
    assert_eq!(c.applied(2), c.applied(1));
    assert_eq!(c.applied(3), c.applied(1));

    let resent: Vec<_> = c.appends[mark..]
        .iter()
        .filter(|(to, _)| *to == 2)
        .flat_map(|(_, r)| r.entries.iter().map(|e| e.index))
        .collect();
    assert_eq!(resent.first(), Some(&6));
    assert!(resent.iter().all(|i| *i > 5), "resent {:?}", resent);
}

#[test]
fn test_partitioned_node_does_not_inflate_term() {
    let mut c = Cluster::new(3);
    c.elect(1);
    c.write(1, "x");
    c.advance(Duration::from_millis(200));
    let term = c.node(1).status().current_term;

    c.isolate(3);
    c.advance(Duration::from_secs(5));
    assert_eq!(c.node(3).status().current_term, term);
    assert_eq!(c.node(3).status().role, RaftRole::PreCandidate);
    assert_eq!(c.leader(), Some(1));

    c.heal();
    c.advance(Duration::from_millis(500));
    assert_eq!(c.leader(), Some(1));
    assert_eq!(c.node(1).status().current_term, term);
    assert_eq!(c.node(3).status().role, RaftRole::Follower);
    assert_eq!(c.node(3).status().leader_id, Some(1));
    assert_eq!(c.applied(3), c.applied(1));
}

#[test]
fn test_isolated_leader_is_replaced() {
    let mut c = Cluster::new(3);
    c.elect(1);
    c.write(1, "before");
    c.advance(Duration::from_millis(200));

    c.isolate(1);
    c.advance(Duration::from_secs(4));
    assert!(!c.node(1).is_leader(), "isolated leader must step down");
    let new_leader = c.leader().unwrap();
    assert_ne!(new_leader, 1);
    let mut rx = c.write(new_leader, "after");
    assert!(rx.try_recv().unwrap().is_ok());

    c.heal();
    c.advance(Duration::from_secs(1));
    assert_eq!(c.leader(), Some(new_leader));
    let term = c.node(new_leader).status().current_term;
    for id in 1..=3 {
        assert_eq!(c.node(id).status().current_term, term);
        assert_eq!(c.applied(id), c.applied(new_leader));
    }
    assert!(c.leaders.len() >= 2);
}

#[test]
fn test_write_waits_for_quorum() {
    let mut c = Cluster::new(3);
    c.elect(1);
    c.advance(Duration::from_millis(200));
    let commit = c.node(1).status().commit_index;

    c.isolate(1);
    let mut rx = c.write(1, "pending");
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(c.node(1).status().commit_index, commit);
    assert_eq!(c.node(1).status().last_log_index, commit + 1);

    c.heal();
    c.advance(Duration::from_millis(200));
    assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), commit + 1);
    assert_eq!(c.node(2).status().commit_index, commit + 1);
}

#[test]
fn test_conflicting_tail_is_truncated() {
    let mut c = Cluster::new(3);
    c.elect(1);
    c.write(1, "shared");
    c.advance(Duration::from_millis(200));

    c.isolate(1);
    let mut stray = c.write(1, "stray");
    c.advance(Duration::from_secs(4));
    let new_leader = c.leader().unwrap();
    assert_ne!(new_leader, 1);
    c.write(new_leader, "winner");

    c.heal();
    c.advance(Duration::from_secs(1));
    assert!(matches!(
        stray.try_recv(),
        Ok(Err(RaftError::NotLeader(_)))
    ));
    assert_eq!(c.applied(1), c.applied(new_leader));
    assert!(c.applied(1).iter().all(|(_, v)| v != b"stray"));
}

#[test]
fn test_transfer_leader() {
    let mut c = Cluster::new(3);
    c.elect(1);
    c.write(1, "x");
    c.advance(Duration::from_millis(200));
    let term = c.node(1).status().current_term;

    let (input, mut rx) = RaftInput::transfer_leader(2, c.now + Duration::from_secs(3));
    c.submit(1, input);
    assert!(rx.try_recv().unwrap().is_ok());
    assert_eq!(c.leader(), Some(2));
    assert_eq!(c.node(2).status().current_term, term + 1);
    assert!(!c.node(1).is_leader());

    let mut rx = c.write(2, "y");
    assert!(rx.try_recv().unwrap().is_ok());
    c.advance(Duration::from_millis(200));
    assert_eq!(c.applied(1), c.applied(2));
}

#[test]
fn test_transfer_to_observer_is_rejected() {
    let mut c = Cluster::new(3);
    c.elect(1);
    let (input, mut rx) = RaftInput::transfer_leader(9, c.now + Duration::from_secs(3));
    c.submit(1, input);
    assert!(matches!(rx.try_recv(), Ok(Err(RaftError::AdminConflict(_)))));
}

#[test]
fn test_lease_read_times_out_without_quorum() {
    let mut c = Cluster::new(3);
    c.elect(1);
    c.write(1, "a");
    c.advance(Duration::from_millis(300));
    let mut rx = c.read(1, Duration::from_millis(100));
    assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), 1);

    c.isolate(1);
    let mut steps = 0;
    loop {
        let now = c.now;
        if !c.node_mut(1).lease_valid(now) {
            break;
        }
        c.step();
        steps += 1;
        assert!(steps < 200);
    }
    assert!(c.node(1).is_leader());

    let mut rx = c.read(1, Duration::from_millis(30));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    for _ in 0..4 {
        c.step();
    }
    assert!(matches!(rx.try_recv(), Ok(Err(RaftError::Timeout(_)))));
    assert!(c.node(1).is_leader());
}

#[test]
fn test_follower_rejects_writes() {
    let mut c = Cluster::new(3);
    c.elect(1);
    let mut rx = c.write(2, "x");
    assert!(matches!(rx.try_recv(), Ok(Err(RaftError::NotLeader(Some(1))))));
}

#[test]
fn test_flow_control() {
    let mut c = Cluster::new(3);
    c.config.max_pending_writes = 3;
    c.restart(1);
    c.elect(1);
    c.advance(Duration::from_millis(200));
    c.isolate(1);
    let mut replies: Vec<Reply> = (0..4).map(|i| c.write(1, &format!("w{}", i))).collect();
    // the noop is applied, three writes fill the window
    assert!(matches!(replies[3].try_recv(), Ok(Err(RaftError::FlowControl(_)))));
    for rx in replies.iter_mut().take(3) {
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}

#[test]
fn test_restart_replays_committed_entries() {
    let mut c = Cluster::new(3);
    c.elect(1);
    for i in 0..5 {
        c.write(1, &format!("v{}", i));
    }
    c.advance(Duration::from_millis(200));
    let before = c.applied(2);
    let term = c.node(2).status().current_term;

    for id in 1..=3 {
        c.restart(id);
    }
    for id in 1..=3 {
        let s = c.node(id).status();
        assert_eq!(s.current_term, term);
        assert_eq!(s.last_log_index, 6);
        assert_eq!(c.applied(id), before);
    }
    c.elect(3);
    let mut rx = c.write(3, "after restart");
    assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), 8);
}

#[test]
fn test_snapshot_survives_restart() {
    let mut c = Cluster::new(1);
    c.elect(1);
    for i in 0..5 {
        c.write(1, &format!("v{}", i));
    }
    let now = c.now;
    let snapshot = c.node_mut(1).take_snapshot(now).unwrap();
    assert_eq!(snapshot.last_index, 6);
    save_snapshot(c.node_dir(1), &snapshot).unwrap();
    c.node_mut(1).on_snapshot_saved(Some(snapshot.last_index));

    let before = c.applied(1);
    c.restart(1);
    assert_eq!(c.applied(1), before);
    assert_eq!(c.node(1).status().last_applied, 6);
}

#[test]
fn test_gapped_append_is_rejected_and_group_keeps_working() {
    let mut c = Cluster::new(3);
    c.elect(1);
    c.write(1, "a");
    c.advance(Duration::from_millis(200));

    let term = c.node(1).status().current_term;
    let last = c.node(2).status().last_log_index;
    let req = AppendReq {
        group_id: c.config.group_id,
        term,
        leader_id: 1,
        prev_log_index: last,
        prev_log_term: term,
        leader_commit: last,
        entries: vec![LogItem {
            item_type: LogItemType::Normal,
            term,
            prev_log_term: term,
            index: last + 40,
            timestamp: 0,
            body: Bytes::from_static(b"gap"),
        }],
    };
    let now = c.now;
    let e = c
        .node_mut(2)
        .handle_request(1, RaftRequest::Append(req), now)
        .unwrap_err();
    assert!(matches!(e, RaftError::Protocol(_)), "{}", e);
    assert_eq!(e.scope(), ErrorScope::Operation);
    assert_eq!(c.node(2).status().last_log_index, last);

    let mut rx = c.write(1, "b");
    c.advance(Duration::from_millis(200));
    assert_eq!(index_of(rx.try_recv().unwrap().unwrap()), last + 1);
    assert_eq!(c.node(2).status().commit_index, last + 1);
    assert_eq!(c.applied(2), c.applied(1));
    assert!(c.applied(2).iter().all(|(_, v)| v != b"gap"));
}
