//! Transports carrying raft and node rpcs between processes.
//!
//! A request is a command code plus a protobuf-style body; the answer is a
//! body or an error. Servers dispatch incoming requests through a
//! [`HandlerTable`] keyed by command code.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use fxhash::FxHashMap;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::NodeId;

pub mod local;
pub mod tcp;

pub use local::{LocalNetwork, LocalTransport};
pub use tcp::TcpTransport;

/// Stable command codes.
pub mod command {
    pub const NODE_PING: u32 = 40;
    pub const RAFT_PING: u32 = 41;
    pub const RAFT_APPEND_ENTRIES: u32 = 42;
    pub const RAFT_REQUEST_VOTE: u32 = 43;
    pub const RAFT_QUERY_STATUS: u32 = 45;
    pub const RAFT_LEADER_TRANSFER: u32 = 46;
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Client side of the network as seen by raft groups and the node manager.
pub trait RaftTransport: Send + Sync + 'static {
    /// Sends a request and resolves to the response body.
    fn send(&self, to: NodeId, command: u32, body: Bytes, timeout: Duration) -> BoxFuture<Result<Bytes>>;

    fn add_node(&self, node: &NodeConfig) -> Result<()>;

    fn remove_node(&self, id: NodeId) -> Result<()>;

    fn set_listener(&self, listener: Arc<dyn ConnectionListener>);
}

/// Notified when the connection to a node comes up or goes down.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_connected(&self, node: NodeId);

    fn on_disconnected(&self, node: NodeId);
}

pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, from: NodeId, body: Bytes) -> BoxFuture<Result<Bytes>>;
}

impl<F> RpcHandler for F
where
    F: Fn(NodeId, Bytes) -> BoxFuture<Result<Bytes>> + Send + Sync + 'static,
{
    fn handle(&self, from: NodeId, body: Bytes) -> BoxFuture<Result<Bytes>> {
        self(from, body)
    }
}

/// Command code to handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<RwLock<FxHashMap<u32, Arc<dyn RpcHandler>>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, command: u32, handler: Arc<dyn RpcHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(command, handler);
        }
    }

    pub fn get(&self, command: u32) -> Option<Arc<dyn RpcHandler>> {
        self.handlers
            .read()
            .ok()
            .and_then(|h| h.get(&command).cloned())
    }

    pub fn dispatch(&self, command: u32, from: NodeId, body: Bytes) -> BoxFuture<Result<Bytes>> {
        match self.get(command) {
            Some(handler) => handler.handle(from, body),
            None => Box::pin(async move {
                Err(RaftError::Protocol(format!("no handler for command {}", command)))
            }),
        }
    }
}

/// Error codes carried in response frames. 0 is success.
pub fn error_code(e: &RaftError) -> u32 {
    match e {
        RaftError::NotLeader(_) => 1,
        RaftError::Timeout(_) => 2,
        RaftError::FlowControl(_) => 3,
        RaftError::Stopping => 4,
        RaftError::Protocol(_) => 5,
        RaftError::GroupNotFound(_) => 6,
        RaftError::GroupStopped(_) => 7,
        RaftError::Remote { code, .. } if *code != 0 => *code,
        _ => 99,
    }
}

pub(crate) fn with_timeout<F>(fut: F, timeout: Duration, what: String) -> BoxFuture<Result<Bytes>>
where
    F: Future<Output = Result<Bytes>> + Send + 'static,
{
    Box::pin(async move {
        match tokio::time::timeout(timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(RaftError::Timeout(what)),
        }
    })
}
