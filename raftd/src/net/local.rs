//! In-process network used by tests and the benchmark. Links can be cut to
//! simulate partitions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use fxhash::FxHashMap;
use log::debug;

use super::{with_timeout, BoxFuture, ConnectionListener, HandlerTable, RaftTransport};
use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::NodeId;

#[derive(Default)]
struct NetworkState {
    nodes: FxHashMap<NodeId, HandlerTable>,
    // unordered pairs, smaller id first
    cut: HashSet<(NodeId, NodeId)>,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, handlers: HandlerTable) {
        if let Ok(mut s) = self.state.lock() {
            s.nodes.insert(id, handlers);
        }
    }

    pub fn unregister(&self, id: NodeId) {
        if let Ok(mut s) = self.state.lock() {
            s.nodes.remove(&id);
        }
    }

    pub fn transport(&self, self_id: NodeId) -> LocalTransport {
        LocalTransport {
            self_id,
            network: self.clone(),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cut(&self, a: NodeId, b: NodeId) {
        if let Ok(mut s) = self.state.lock() {
            s.cut.insert(link(a, b));
        }
    }

    pub fn heal(&self, a: NodeId, b: NodeId) {
        if let Ok(mut s) = self.state.lock() {
            s.cut.remove(&link(a, b));
        }
    }

    /// Cuts every link of `id`.
    pub fn isolate(&self, id: NodeId) {
        if let Ok(mut s) = self.state.lock() {
            let others: Vec<NodeId> = s.nodes.keys().copied().filter(|n| *n != id).collect();
            for o in others {
                s.cut.insert(link(id, o));
            }
        }
    }

    pub fn heal_all(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.cut.clear();
        }
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<HandlerTable> {
        let s = self
            .state
            .lock()
            .map_err(|_| RaftError::PeerUnreachable(to))?;
        if s.cut.contains(&link(from, to)) {
            return Err(RaftError::PeerUnreachable(to));
        }
        s.nodes
            .get(&to)
            .cloned()
            .ok_or(RaftError::PeerUnreachable(to))
    }
}

#[derive(Clone)]
pub struct LocalTransport {
    self_id: NodeId,
    network: LocalNetwork,
    listener: Arc<Mutex<Option<Arc<dyn ConnectionListener>>>>,
}

impl LocalTransport {
    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.lock().ok().and_then(|l| l.clone())
    }
}

impl RaftTransport for LocalTransport {
    fn send(&self, to: NodeId, command: u32, body: Bytes, timeout: Duration) -> BoxFuture<Result<Bytes>> {
        let from = self.self_id;
        let routed = self.network.route(from, to);
        let fut = async move {
            let handlers = routed?;
            handlers.dispatch(command, from, body).await
        };
        let network = self.network.clone();
        with_timeout(
            async move {
                let resp = fut.await?;
                // the response can be lost on the way back
                network.route(from, to)?;
                Ok(resp)
            },
            timeout,
            format!("command {} to node {}", command, to),
        )
    }

    fn add_node(&self, node: &NodeConfig) -> Result<()> {
        debug!("local transport {} add node {}", self.self_id, node.id());
        if let Some(l) = self.listener() {
            l.on_connected(node.id());
        }
        Ok(())
    }

    fn remove_node(&self, id: NodeId) -> Result<()> {
        if let Some(l) = self.listener() {
            l.on_disconnected(id);
        }
        Ok(())
    }

    fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        if let Ok(mut l) = self.listener.lock() {
            *l = Some(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{command, RpcHandler};

    fn echo_table() -> HandlerTable {
        let table = HandlerTable::new();
        let echo: Arc<dyn RpcHandler> =
            Arc::new(|_from: NodeId, body: Bytes| -> BoxFuture<Result<Bytes>> { Box::pin(async move { Ok(body) }) });
        table.register(command::NODE_PING, echo);
        table
    }

    #[tokio::test]
    async fn test_cut_link_is_unreachable() {
        let net = LocalNetwork::new();
        net.register(1, echo_table());
        net.register(2, echo_table());
        let t = net.transport(1);
        let timeout = Duration::from_millis(100);

        let r = t
            .send(2, command::NODE_PING, Bytes::from_static(b"hi"), timeout)
            .await
            .unwrap();
        assert_eq!(&r[..], b"hi");

        net.isolate(2);
        let e = t.send(2, command::NODE_PING, Bytes::new(), timeout).await;
        assert!(matches!(e, Err(RaftError::PeerUnreachable(2))));

        net.heal(1, 2);
        assert!(t.send(2, command::NODE_PING, Bytes::new(), timeout).await.is_ok());

        let e = t.send(3, command::NODE_PING, Bytes::new(), timeout).await;
        assert!(matches!(e, Err(RaftError::PeerUnreachable(3))));
    }
}
