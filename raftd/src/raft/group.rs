use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use super::node::{Outbound, Raft};
use super::proposal::RaftInput;
use super::rpc::{RaftRequest, RaftResponse};
use super::status::SharedStatus;
use super::{GroupId, LogIndex, NodeId, StateMachine};
use crate::config::RaftGroupConfig;
use crate::error::{ErrorScope, RaftError, Result};
use crate::fiber::{Dispatcher, FiberChannel, FiberGroup};
use crate::net::RaftTransport;
use crate::pool::{GlobalPool, GroupPool};
use crate::store::{encode_snapshot, write_snapshot_file};

const MIN_TICK: Duration = Duration::from_millis(10);

pub(super) enum GroupEvent {
    Input(RaftInput),
    Request {
        from: NodeId,
        req: RaftRequest,
        reply: oneshot::Sender<Result<RaftResponse>>,
    },
    Response {
        out: Outbound,
        result: Result<RaftResponse>,
    },
    NodeReady {
        node: NodeId,
        ready: bool,
    },
    SnapshotSaved(Option<LogIndex>),
    Stop(oneshot::Sender<()>),
}

/// Thread safe handle to a running group.
#[derive(Clone)]
pub struct GroupContext {
    group_id: GroupId,
    events: FiberChannel<GroupEvent>,
    shared: Arc<SharedStatus>,
    rpc_timeout: Duration,
}

impl GroupContext {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn status(&self) -> &Arc<SharedStatus> {
        &self.shared
    }

    fn submit(&self, event: GroupEvent) -> Result<()> {
        if self.shared.is_closed() {
            return Err(RaftError::GroupStopped(self.group_id));
        }
        self.events
            .fire_offer(event)
            .map_err(|_| RaftError::GroupStopped(self.group_id))
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<Result<T>>, timeout: Duration, what: &str) -> Result<T> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(RaftError::Stopping),
            Err(_) => Err(RaftError::Timeout(format!("group {} {}", self.group_id, what))),
        }
    }

    async fn submit_input(
        &self,
        input: RaftInput,
        rx: oneshot::Receiver<Result<Vec<u8>>>,
        timeout: Duration,
        what: &str,
    ) -> Result<Vec<u8>> {
        self.submit(GroupEvent::Input(input))?;
        self.wait(rx, timeout, what).await
    }

    /// Replicates `data` and returns the state machine output once it is
    /// applied on this node.
    pub async fn write(&self, data: Bytes, timeout: Duration) -> Result<Vec<u8>> {
        let (input, rx) = RaftInput::write(data, Instant::now() + timeout);
        self.submit_input(input, rx, timeout, "write").await
    }

    /// Lease read on the leader.
    pub async fn read(&self, query: Bytes, timeout: Duration) -> Result<Vec<u8>> {
        let (input, rx) = RaftInput::read(query, Instant::now() + timeout);
        self.submit_input(input, rx, timeout, "read").await
    }

    pub async fn transfer_leader(&self, new_leader: NodeId, timeout: Duration) -> Result<()> {
        let (input, rx) = RaftInput::transfer_leader(new_leader, Instant::now() + timeout);
        self.submit_input(input, rx, timeout, "transfer leader")
            .await
            .map(|_| ())
    }

    /// Serves a raft rpc from node `from`.
    pub async fn handle_request(&self, from: NodeId, req: RaftRequest) -> Result<RaftResponse> {
        let (reply, rx) = oneshot::channel();
        self.submit(GroupEvent::Request { from, req, reply })?;
        self.wait(rx, self.rpc_timeout, "request").await
    }

    pub fn on_node_ready(&self, node: NodeId, ready: bool) -> Result<()> {
        self.submit(GroupEvent::NodeReady { node, ready })
    }
}

/// A raft group running on a dispatcher.
pub struct RaftGroup {
    ctx: GroupContext,
    fibers: FiberGroup,
}

impl RaftGroup {
    /// Opens the group's storage on the calling thread, then starts the
    /// group fiber on `dispatcher`.
    pub fn start<S: StateMachine>(
        config: RaftGroupConfig,
        self_id: NodeId,
        dir: PathBuf,
        sm: S,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn RaftTransport>,
        pool: Arc<GlobalPool>,
        pool_max_per_class: usize,
    ) -> Result<Self> {
        let group_id = config.group_id;
        let shared = Arc::new(SharedStatus::default());
        let raft = Raft::open(config.clone(), self_id, &dir, sm, shared.clone(), Instant::now())?;
        let fibers = FiberGroup::new(&format!("group-{}", group_id), dispatcher.clone());
        let events: FiberChannel<GroupEvent> = fibers.new_channel("raft-events");
        let ctx = GroupContext {
            group_id,
            events: events.clone(),
            shared: shared.clone(),
            rpc_timeout: config.rpc_timeout(),
        };
        let tick = (config.heartbeat_interval() / 4).max(MIN_TICK);
        let runner_fibers = fibers.clone();
        fibers.fire_fiber("raft-loop", move || {
            let runner = GroupRunner {
                group_id,
                raft,
                pool: GroupPool::new(pool, dispatcher, pool_max_per_class),
                fibers: runner_fibers,
                events,
                transport,
                shared,
                dir,
                rpc_timeout: config.rpc_timeout(),
                tick,
                next_tick: Instant::now(),
            };
            runner.run()
        })?;
        info!("raft group {} started on node {}", group_id, self_id);
        Ok(RaftGroup { ctx, fibers })
    }

    pub fn group_id(&self) -> GroupId {
        self.ctx.group_id
    }

    pub fn context(&self) -> GroupContext {
        self.ctx.clone()
    }

    /// Stops the group loop and closes its storage.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.fibers.request_shutdown();
        if self.ctx.shared.is_closed() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.ctx.events.fire_offer(GroupEvent::Stop(tx)) {
            debug!("stop group {}: {}", self.ctx.group_id, e);
            return Ok(());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RaftError::Timeout(format!("stop group {}", self.ctx.group_id))),
        }
    }
}

struct GroupRunner<S: StateMachine> {
    group_id: GroupId,
    raft: Raft<S>,
    pool: GroupPool,
    fibers: FiberGroup,
    events: FiberChannel<GroupEvent>,
    transport: Arc<dyn RaftTransport>,
    shared: Arc<SharedStatus>,
    dir: PathBuf,
    rpc_timeout: Duration,
    tick: Duration,
    next_tick: Instant,
}

impl<S: StateMachine> GroupRunner<S> {
    async fn run(mut self) {
        let mut stops = Vec::new();
        loop {
            let events = self.events.take_all_timeout(self.tick).await;
            let now = Instant::now();
            if let Err(e) = self.process(events, now, &mut stops) {
                self.on_fatal(e);
                break;
            }
            if !stops.is_empty() {
                break;
            }
        }
        if !self.shared.is_fatal() {
            if let Err(e) = self.raft.close() {
                error!("close raft group {} failed: {}", self.group_id, e);
            }
        }
        self.shared.set_closed();
        // nothing is processed from here on
        for ev in self.events.take_all_timeout(Duration::ZERO).await {
            self.reject(ev, &mut stops);
        }
        info!("raft group {} stopped", self.group_id);
        for tx in stops {
            let _ = tx.send(());
        }
        if self.shared.is_fatal() {
            self.fibers.dispatcher().shutdown();
        }
    }

    fn process(&mut self, events: Vec<GroupEvent>, now: Instant, stops: &mut Vec<oneshot::Sender<()>>) -> Result<()> {
        let mut inputs = Vec::new();
        for ev in events {
            match ev {
                GroupEvent::Input(input) => inputs.push(input),
                GroupEvent::Request { from, req, reply } => match self.raft.handle_request(from, req, now) {
                    Ok(resp) => {
                        let _ = reply.send(Ok(resp));
                    }
                    Err(e) if e.scope() == ErrorScope::Operation => {
                        warn!("group {} rejected request from {}: {}", self.group_id, from, e);
                        let _ = reply.send(Err(e));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.copy_for_waiter(self.group_id)));
                        return Err(e);
                    }
                },
                GroupEvent::Response { out, result } => self.raft.handle_response(out, result, now)?,
                GroupEvent::NodeReady { node, ready } => self.raft.on_node_ready(node, ready),
                GroupEvent::SnapshotSaved(index) => self.raft.on_snapshot_saved(index),
                GroupEvent::Stop(tx) => stops.push(tx),
            }
        }
        if !inputs.is_empty() {
            self.raft.propose(inputs, now)?;
        }
        if now >= self.next_tick {
            self.raft.tick(now)?;
            self.next_tick = now + self.tick;
        }
        if self.raft.snapshot_due(now) {
            self.save_snapshot(now)?;
        }
        self.flush_outbound();
        Ok(())
    }

    /// One fiber per request; the response comes back as an event.
    fn flush_outbound(&mut self) {
        for out in self.raft.take_outbound() {
            let transport = self.transport.clone();
            let events = self.events.clone();
            let timeout = self.rpc_timeout;
            self.fibers.spawn("raft-rpc", async move {
                let code = out.req.command();
                let result = match transport.send(out.to, code, out.req.to_bytes(), timeout).await {
                    Ok(body) => out.req.decode_response(&body),
                    Err(e) => Err(e),
                };
                events.offer(GroupEvent::Response { out, result });
            });
        }
    }

    /// Encodes the snapshot on the group thread, writes it on the blocking
    /// pool.
    fn save_snapshot(&mut self, now: Instant) -> Result<()> {
        let snapshot = self.raft.take_snapshot(now)?;
        let mut buf = self.pool.borrow(snapshot.data.len() + 64);
        if let Err(e) = encode_snapshot(&snapshot, &mut buf) {
            self.pool.release(buf);
            self.raft.on_snapshot_saved(None);
            return Err(e);
        }
        let releaser = self.pool.releaser();
        let dir = self.dir.clone();
        let events = self.events.clone();
        let index = snapshot.last_index;
        let group_id = self.group_id;
        self.fibers.spawn("save-snapshot", async move {
            let saved = tokio::task::spawn_blocking(move || {
                let r = write_snapshot_file(&dir, &buf);
                releaser.release(buf);
                r
            })
            .await;
            let index = match saved {
                Ok(Ok(())) => {
                    info!("group {} snapshot at {} written", group_id, index);
                    Some(index)
                }
                Ok(Err(e)) => {
                    error!("group {} write snapshot failed: {}", group_id, e);
                    None
                }
                Err(e) => {
                    error!("group {} snapshot task failed: {}", group_id, e);
                    None
                }
            };
            events.offer(GroupEvent::SnapshotSaved(index));
        });
        Ok(())
    }

    fn on_fatal(&mut self, e: RaftError) {
        error!(
            "raft group {} stopped on {:?} error: {}",
            self.group_id,
            e.scope(),
            e
        );
        self.shared.set_fatal();
        let group_id = self.group_id;
        self.raft.fail_all(|| e.copy_for_waiter(group_id));
    }

    fn reject(&self, ev: GroupEvent, stops: &mut Vec<oneshot::Sender<()>>) {
        let e = RaftError::GroupStopped(self.group_id);
        match ev {
            GroupEvent::Input(mut input) => input.fail(e),
            GroupEvent::Request { reply, .. } => {
                let _ = reply.send(Err(e));
            }
            GroupEvent::Stop(tx) => stops.push(tx),
            GroupEvent::Response { .. } | GroupEvent::NodeReady { .. } | GroupEvent::SnapshotSaved(_) => {
                warn!("group {} dropped event after stop", self.group_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::net::{BoxFuture, ConnectionListener};
    use crate::raft::rpc::AppendReq;
    use crate::raft::{RaftRole, Term};
    use crate::store::{load_snapshot, LogItem, LogItemType};

    #[derive(Default)]
    struct CountSm {
        values: Vec<Vec<u8>>,
    }

    impl StateMachine for CountSm {
        fn apply(&mut self, _index: LogIndex, data: &[u8]) -> Result<Vec<u8>> {
            if data == b"boom" {
                return Err(RaftError::StateMachine("boom".to_string()));
            }
            self.values.push(data.to_vec());
            Ok((self.values.len() as u64).to_be_bytes().to_vec())
        }

        fn query(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Ok((self.values.len() as u64).to_be_bytes().to_vec())
        }

        fn snapshot(&self) -> Vec<u8> {
            bincode::serialize(&self.values).unwrap_or_default()
        }

        fn install_snapshot(&mut self, _last_index: LogIndex, _last_term: Term, data: &[u8]) -> Result<()> {
            self.values = bincode::deserialize(data).map_err(|e| RaftError::StateMachine(e.to_string()))?;
            Ok(())
        }
    }

    struct NoNetwork;

    impl RaftTransport for NoNetwork {
        fn send(&self, to: NodeId, _command: u32, _body: Bytes, _timeout: Duration) -> BoxFuture<Result<Bytes>> {
            Box::pin(async move { Err(RaftError::PeerUnreachable(to)) })
        }

        fn add_node(&self, _node: &NodeConfig) -> Result<()> {
            Ok(())
        }

        fn remove_node(&self, _id: NodeId) -> Result<()> {
            Ok(())
        }

        fn set_listener(&self, _listener: Arc<dyn ConnectionListener>) {}
    }

    fn single_node_config(snapshot_ms: u64) -> RaftGroupConfig {
        RaftGroupConfig {
            group_id: 5,
            members: vec![1],
            elect_timeout_ms: 100,
            heartbeat_interval_ms: 20,
            log_file_size: 1 << 20,
            idx_items_per_file: 1024,
            sync_force: false,
            save_snapshot_interval_ms: snapshot_ms,
            ..Default::default()
        }
    }

    async fn start_group(dir: PathBuf, snapshot_ms: u64) -> (Arc<Dispatcher>, RaftGroup) {
        let dispatcher = Arc::new(Dispatcher::start("group-test").unwrap());
        let group = RaftGroup::start(
            single_node_config(snapshot_ms),
            1,
            dir,
            CountSm::default(),
            dispatcher.clone(),
            Arc::new(NoNetwork),
            Arc::new(GlobalPool::new(4)),
            4,
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while group.context().status().role() != RaftRole::Leader {
            assert!(Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (dispatcher, group)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, group) = start_group(dir.path().to_path_buf(), 0).await;
        let ctx = group.context();
        let timeout = Duration::from_secs(3);
        for i in 1..=3u64 {
            let out = ctx.write(Bytes::from(vec![i as u8]), timeout).await.unwrap();
            assert_eq!(out, i.to_be_bytes().to_vec());
        }
        let out = ctx.read(Bytes::new(), timeout).await.unwrap();
        assert_eq!(out, 3u64.to_be_bytes().to_vec());
        assert!(ctx.status().commit_index() >= 4);

        group.stop(timeout).await.unwrap();
        assert!(matches!(
            ctx.write(Bytes::from_static(b"late"), timeout).await,
            Err(RaftError::GroupStopped(5))
        ));
        dispatcher.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_machine_failure_stops_group() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, group) = start_group(dir.path().to_path_buf(), 0).await;
        let ctx = group.context();
        let timeout = Duration::from_secs(3);
        ctx.write(Bytes::from_static(b"ok"), timeout).await.unwrap();
        let e = ctx.write(Bytes::from_static(b"boom"), timeout).await;
        assert!(matches!(e, Err(RaftError::GroupStopped(5))), "{:?}", e);
        assert!(ctx.status().is_fatal());
        assert!(matches!(
            ctx.read(Bytes::new(), timeout).await,
            Err(RaftError::GroupStopped(5))
        ));
        dispatcher.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_request_does_not_stop_group() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, group) = start_group(dir.path().to_path_buf(), 0).await;
        let ctx = group.context();
        let timeout = Duration::from_secs(3);
        ctx.write(Bytes::from_static(b"a"), timeout).await.unwrap();

        let term = ctx.status().term();
        let req = AppendReq {
            group_id: 5,
            term: term + 1,
            leader_id: 2,
            prev_log_index: 2,
            prev_log_term: term,
            leader_commit: 2,
            entries: vec![LogItem {
                item_type: LogItemType::Normal,
                term: term + 1,
                prev_log_term: term,
                index: 9,
                timestamp: 0,
                body: Bytes::from_static(b"gap"),
            }],
        };
        let r = ctx.handle_request(2, RaftRequest::Append(req)).await;
        assert!(matches!(r, Err(RaftError::Protocol(_))), "{:?}", r);
        assert!(!ctx.status().is_fatal());
        assert_eq!(ctx.status().term(), term);
        assert_eq!(ctx.status().role(), RaftRole::Leader);

        let out = ctx.write(Bytes::from_static(b"b"), timeout).await.unwrap();
        assert_eq!(out, 2u64.to_be_bytes().to_vec());
        group.stop(timeout).await.unwrap();
        dispatcher.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_periodic_snapshot_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, group) = start_group(dir.path().to_path_buf(), 50).await;
        let ctx = group.context();
        let timeout = Duration::from_secs(3);
        ctx.write(Bytes::from_static(b"a"), timeout).await.unwrap();
        ctx.write(Bytes::from_static(b"b"), timeout).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let snapshot = loop {
            if let Ok(Some(s)) = load_snapshot(dir.path()) {
                if s.last_index >= 3 {
                    break s;
                }
            }
            assert!(Instant::now() < deadline, "snapshot not written");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        let values: Vec<Vec<u8>> = bincode::deserialize(&snapshot.data).unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
        group.stop(timeout).await.unwrap();
        dispatcher.shutdown();
    }
}
