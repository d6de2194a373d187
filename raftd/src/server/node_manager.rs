//! Tracks which configured nodes are reachable and really are who the
//! configuration says they are.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fxhash::FxHashMap;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{decode_body, write_bytes, write_uint, BytesAccumulator, PbCallback, PbEncode};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::net::{command, ConnectionListener, RaftTransport};
use crate::raft::NodeId;

/// Identity exchanged by NODE_PING. The uuid is generated per process, so a
/// node pinging itself through a misconfigured address is detected.
#[derive(Debug, Default)]
pub struct NodePing {
    pub node_id: NodeId,
    pub uuid: Vec<u8>,
    acc: BytesAccumulator,
}

impl NodePing {
    pub fn new(node_id: NodeId, uuid: &Uuid) -> Self {
        NodePing {
            node_id,
            uuid: uuid.as_bytes().to_vec(),
            acc: BytesAccumulator::default(),
        }
    }
}

impl PbEncode for NodePing {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.node_id as u64);
        write_bytes(buf, 2, &self.uuid);
    }
}

impl PbCallback for NodePing {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        if index == 1 {
            self.node_id = value as NodeId;
        }
        true
    }

    fn read_bytes(&mut self, index: u32, chunk: &[u8], total: usize, begin: bool, end: bool) -> bool {
        if let Some(v) = self.acc.push(chunk, total, begin, end) {
            if index == 2 {
                self.uuid = v;
            }
        }
        true
    }
}

pub type ReadyListener = Arc<dyn Fn(NodeId, bool) + Send + Sync>;

#[derive(Debug)]
struct NodeState {
    config: NodeConfig,
    ready: bool,
    pinging: bool,
}

pub struct NodeManager {
    self_id: NodeId,
    uuid: Uuid,
    transport: Arc<dyn RaftTransport>,
    nodes: Mutex<FxHashMap<NodeId, NodeState>>,
    on_ready_change: ReadyListener,
    ping_timeout: Duration,
}

impl NodeManager {
    pub fn new(
        self_id: NodeId,
        transport: Arc<dyn RaftTransport>,
        ping_timeout: Duration,
        on_ready_change: ReadyListener,
    ) -> Self {
        let uuid = Uuid::new_v4();
        info!("node {} uuid {}", self_id, uuid);
        NodeManager {
            self_id,
            uuid,
            transport,
            nodes: Mutex::new(FxHashMap::default()),
            on_ready_change,
            ping_timeout,
        }
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    /// Answers a NODE_PING with our own identity.
    pub fn handle_ping(&self, from: NodeId, body: &[u8]) -> Result<Bytes> {
        let ping: NodePing = decode_body(body)?;
        if ping.node_id != from {
            warn!("node ping claims id {} but came from {}", ping.node_id, from);
        }
        Ok(NodePing::new(self.self_id, &self.uuid).to_bytes())
    }

    pub fn add_node(&self, node: NodeConfig) -> Result<()> {
        let id = node.id();
        if id == self.self_id {
            return Ok(());
        }
        if let Ok(nodes) = self.nodes.lock() {
            if nodes.contains_key(&id) {
                return Ok(());
            }
        }
        self.transport.add_node(&node)?;
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.entry(id).or_insert(NodeState {
                config: node,
                ready: false,
                pinging: false,
            });
        }
        info!("node {} added", id);
        Ok(())
    }

    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        let removed = self.nodes.lock().ok().and_then(|mut n| n.remove(&id));
        if let Some(state) = removed {
            self.transport.remove_node(id)?;
            if state.ready {
                (self.on_ready_change)(id, false);
            }
            info!("node {} removed", id);
        }
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id == self.self_id || self.nodes.lock().map(|n| n.contains_key(&id)).unwrap_or(false)
    }

    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .lock()
            .map(|n| n.iter().filter(|(_, s)| s.ready).map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    pub fn node_config(&self, id: NodeId) -> Option<NodeConfig> {
        self.nodes.lock().ok().and_then(|n| n.get(&id).map(|s| s.config.clone()))
    }

    fn set_ready(&self, id: NodeId, ready: bool) {
        let changed = match self.nodes.lock() {
            Ok(mut nodes) => match nodes.get_mut(&id) {
                Some(s) => {
                    s.pinging = false;
                    let changed = s.ready != ready;
                    s.ready = ready;
                    changed
                }
                None => false,
            },
            Err(_) => false,
        };
        if changed {
            info!("node {} ready: {}", id, ready);
            (self.on_ready_change)(id, ready);
        }
    }

    fn begin_ping(&self, id: NodeId) -> bool {
        match self.nodes.lock() {
            Ok(mut nodes) => match nodes.get_mut(&id) {
                Some(s) if !s.pinging => {
                    s.pinging = true;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// Pings `id` and updates its readiness from the answer.
    pub async fn ping(&self, id: NodeId) {
        if !self.begin_ping(id) {
            return;
        }
        let body = NodePing::new(self.self_id, &self.uuid).to_bytes();
        let result = self
            .transport
            .send(id, command::NODE_PING, body, self.ping_timeout)
            .await
            .and_then(|resp| decode_body::<NodePing>(&resp));
        let ready = match result {
            Ok(p) if p.node_id != id => {
                error!("node {} answered ping as node {}, check the config", id, p.node_id);
                false
            }
            Ok(p) if p.uuid == self.uuid.as_bytes() => {
                error!("node {} answered ping with our own uuid, check the config", id);
                false
            }
            Ok(_) => true,
            Err(e) => {
                debug!("ping node {} failed: {}", id, e);
                false
            }
        };
        self.set_ready(id, ready);
    }

    pub async fn ping_all(&self) {
        let ids: Vec<NodeId> = self
            .nodes
            .lock()
            .map(|n| n.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.ping(id).await;
        }
    }

    /// Pings every node each `interval` until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, interval: Duration, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            self.ping_all().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("node ping loop of {} stopped", self.self_id);
    }
}

/// Transport notifications, forwarded by the server.
pub struct NodeConnectionListener {
    manager: Weak<NodeManager>,
}

impl NodeConnectionListener {
    pub fn new(manager: &Arc<NodeManager>) -> Self {
        NodeConnectionListener {
            manager: Arc::downgrade(manager),
        }
    }
}

impl ConnectionListener for NodeConnectionListener {
    fn on_connected(&self, node: NodeId) {
        let manager = match self.manager.upgrade() {
            Some(m) => m,
            None => return,
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { manager.ping(node).await });
        }
    }

    fn on_disconnected(&self, node: NodeId) {
        if let Some(m) = self.manager.upgrade() {
            m.set_ready(node, false);
        }
    }
}
