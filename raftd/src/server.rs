//! A raft node: the raft groups of this process, the rpc handlers serving
//! them and the node manager watching the other nodes.

pub mod node_manager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use fxhash::FxHashMap;
use log::{debug, info, warn};
use tokio::sync::oneshot;

use self::node_manager::{NodeConnectionListener, NodeManager};
use crate::config::{NodeConfig, RaftGroupConfig, RaftServerConfig};
use crate::error::{RaftError, Result};
use crate::fiber::Dispatcher;
use crate::metrics;
use crate::net::{command, BoxFuture, HandlerTable, RaftTransport, RpcHandler};
use crate::pool::GlobalPool;
use crate::raft::rpc::{QueryStatusReq, QueryStatusResp, RaftRequest, RaftResponse};
use crate::raft::{GroupContext, GroupId, NodeId, RaftGroup, StateMachine};

/// Builds the state machine of a group when it is added.
pub type StateMachineFactory = Arc<dyn Fn(&RaftGroupConfig) -> Box<dyn StateMachine> + Send + Sync>;

const RAFT_COMMANDS: [u32; 5] = [
    command::RAFT_PING,
    command::RAFT_APPEND_ENTRIES,
    command::RAFT_REQUEST_VOTE,
    command::RAFT_QUERY_STATUS,
    command::RAFT_LEADER_TRANSFER,
];

struct GroupEntry {
    group: RaftGroup,
    dispatcher: Arc<Dispatcher>,
    nodes: Vec<NodeId>,
}

type GroupTable = Arc<RwLock<FxHashMap<GroupId, Arc<GroupEntry>>>>;

fn find_group(groups: &GroupTable, group_id: GroupId) -> Result<GroupContext> {
    groups
        .read()
        .ok()
        .and_then(|g| g.get(&group_id).map(|e| e.group.context()))
        .ok_or(RaftError::GroupNotFound(group_id))
}

fn all_groups(groups: &GroupTable) -> Vec<GroupContext> {
    groups
        .read()
        .map(|g| g.values().map(|e| e.group.context()).collect())
        .unwrap_or_default()
}

/// Held while a topology change runs; a second change fails immediately.
struct AdminGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> AdminGuard<'a> {
    fn acquire(flag: &'a AtomicBool, what: &str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RaftError::AdminConflict(format!("{}: another admin operation is running", what)))?;
        Ok(AdminGuard { flag })
    }
}

impl Drop for AdminGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct RaftServer {
    config: RwLock<RaftServerConfig>,
    self_id: NodeId,
    transport: Arc<dyn RaftTransport>,
    handlers: HandlerTable,
    node_manager: Arc<NodeManager>,
    groups: GroupTable,
    pool: Arc<GlobalPool>,
    sm_factory: StateMachineFactory,
    admin_running: AtomicBool,
    stop_ping: Mutex<Option<oneshot::Sender<()>>>,
}

impl RaftServer {
    /// Registers the rpc handlers and the configured nodes. Groups are
    /// started by [`start`](Self::start).
    pub fn new(
        config: RaftServerConfig,
        transport: Arc<dyn RaftTransport>,
        sm_factory: StateMachineFactory,
    ) -> Result<Arc<Self>> {
        let groups: GroupTable = Arc::new(RwLock::new(FxHashMap::default()));
        let notify = groups.clone();
        let node_manager = Arc::new(NodeManager::new(
            config.node_id,
            transport.clone(),
            config.rpc_timeout(),
            Arc::new(move |node, ready| {
                for ctx in all_groups(&notify) {
                    if let Err(e) = ctx.on_node_ready(node, ready) {
                        debug!("notify group {} of node {}: {}", ctx.group_id(), node, e);
                    }
                }
            }),
        ));
        transport.set_listener(Arc::new(NodeConnectionListener::new(&node_manager)));

        let handlers = HandlerTable::new();
        register_handlers(&handlers, &groups, &node_manager);
        for node in &config.nodes {
            node_manager.add_node(node.clone())?;
        }
        let pool = Arc::new(GlobalPool::new(config.pool_max_per_class));
        info!("raft server {} created", config.node_id);
        Ok(Arc::new(RaftServer {
            self_id: config.node_id,
            config: RwLock::new(config),
            transport,
            handlers,
            node_manager,
            groups,
            pool,
            sm_factory,
            admin_running: AtomicBool::new(false),
            stop_ping: Mutex::new(None),
        }))
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Handlers to serve on the transport's server side.
    pub fn handlers(&self) -> HandlerTable {
        self.handlers.clone()
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    fn server_config(&self) -> Result<RaftServerConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| RaftError::Invariant("server config lock poisoned".to_string()))
    }

    /// Starts `groups` and the node ping loop. Must be called inside a tokio
    /// runtime.
    pub fn start(&self, groups: &[RaftGroupConfig]) -> Result<()> {
        for g in groups {
            self.add_group(g.clone())?;
        }
        let (tx, rx) = oneshot::channel::<()>();
        if let Ok(mut stop) = self.stop_ping.lock() {
            *stop = Some(tx);
        }
        let interval = self.server_config()?.node_ping_interval();
        tokio::spawn(self.node_manager.clone().run(interval, async move {
            let _ = rx.await;
        }));
        info!("raft server {} started with {} groups", self.self_id, groups.len());
        Ok(())
    }

    pub fn group(&self, group_id: GroupId) -> Result<GroupContext> {
        find_group(&self.groups, group_id)
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self
            .groups
            .read()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Opens and starts a group on its own dispatcher. Adding a running
    /// group again succeeds without doing anything.
    pub fn add_group(&self, config: RaftGroupConfig) -> Result<()> {
        let _guard = AdminGuard::acquire(&self.admin_running, "add group")?;
        let group_id = config.group_id;
        if self.groups.read().map(|g| g.contains_key(&group_id)).unwrap_or(false) {
            info!("raft group {} already exists", group_id);
            return Ok(());
        }
        let server_config = self.server_config()?;
        config.validate(&server_config)?;
        let dir = config.data_dir(&server_config);
        let nodes: Vec<NodeId> = config
            .members
            .iter()
            .chain(config.observers.iter())
            .copied()
            .collect();
        let dispatcher = Arc::new(Dispatcher::start(&format!("raft-group-{}", group_id))?);
        let sm = (self.sm_factory)(&config);
        let group = match RaftGroup::start(
            config,
            self.self_id,
            dir,
            sm,
            dispatcher.clone(),
            self.transport.clone(),
            self.pool.clone(),
            server_config.pool_max_per_class,
        ) {
            Ok(g) => g,
            Err(e) => {
                dispatcher.shutdown();
                return Err(e);
            }
        };
        let ctx = group.context();
        if let Ok(mut groups) = self.groups.write() {
            groups.insert(
                group_id,
                Arc::new(GroupEntry {
                    group,
                    dispatcher,
                    nodes,
                }),
            );
        }
        for node in self.node_manager.ready_nodes() {
            ctx.on_node_ready(node, true)?;
        }
        Ok(())
    }

    /// Stops a group and its dispatcher. Removing an unknown group succeeds.
    pub async fn remove_group(&self, group_id: GroupId, timeout: Duration) -> Result<()> {
        let _guard = AdminGuard::acquire(&self.admin_running, "remove group")?;
        let entry = self.groups.write().ok().and_then(|mut g| g.remove(&group_id));
        match entry {
            Some(e) => stop_group(e, timeout).await,
            None => Ok(()),
        }
    }

    pub fn add_node(&self, node: NodeConfig) -> Result<()> {
        let _guard = AdminGuard::acquire(&self.admin_running, "add node")?;
        self.node_manager.add_node(node.clone())?;
        if let Ok(mut config) = self.config.write() {
            if config.node(node.id()).is_none() {
                config.nodes.push(node);
            }
        }
        Ok(())
    }

    /// Fails with `AdminConflict` while a group still uses the node.
    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        let _guard = AdminGuard::acquire(&self.admin_running, "remove node")?;
        if id == self.self_id {
            return Err(RaftError::AdminConflict("can not remove self".to_string()));
        }
        let used_by = self.groups.read().ok().and_then(|g| {
            g.iter()
                .find(|(_, e)| e.nodes.contains(&id))
                .map(|(gid, _)| *gid)
        });
        if let Some(gid) = used_by {
            return Err(RaftError::AdminConflict(format!(
                "node {} is used by group {}",
                id, gid
            )));
        }
        self.node_manager.remove_node(id)?;
        if let Ok(mut config) = self.config.write() {
            config.nodes.retain(|n| n.id() != id);
        }
        Ok(())
    }

    /// Status of `group_id` as seen by node `node_id`.
    pub async fn query_status(&self, node_id: NodeId, group_id: GroupId) -> Result<QueryStatusResp> {
        let req = RaftRequest::QueryStatus(QueryStatusReq { group_id });
        let resp = if node_id == self.self_id {
            self.group(group_id)?.handle_request(node_id, req).await?
        } else {
            let timeout = self.server_config()?.rpc_timeout();
            let body = self
                .transport
                .send(node_id, req.command(), req.to_bytes(), timeout)
                .await?;
            req.decode_response(&body)?
        };
        match resp {
            RaftResponse::QueryStatus(s) => Ok(s),
            other => Err(RaftError::Protocol(format!("unexpected query status response {:?}", other))),
        }
    }

    /// Stops every group and the ping loop.
    pub async fn stop(&self, timeout: Duration) {
        if let Some(tx) = self.stop_ping.lock().ok().and_then(|mut s| s.take()) {
            let _ = tx.send(());
        }
        let entries: Vec<Arc<GroupEntry>> = self
            .groups
            .write()
            .map(|mut g| g.drain().map(|(_, e)| e).collect())
            .unwrap_or_default();
        for e in entries {
            let group_id = e.group.group_id();
            if let Err(err) = stop_group(e, timeout).await {
                warn!("stop group {} failed: {}", group_id, err);
            }
        }
        info!("raft server {} stopped", self.self_id);
    }
}

async fn stop_group(entry: Arc<GroupEntry>, timeout: Duration) -> Result<()> {
    let r = entry.group.stop(timeout).await;
    entry.dispatcher.shutdown();
    let dispatcher = entry.dispatcher.clone();
    let _ = tokio::task::spawn_blocking(move || dispatcher.join(timeout)).await;
    r
}

fn register_handlers(handlers: &HandlerTable, groups: &GroupTable, node_manager: &Arc<NodeManager>) {
    let nm = node_manager.clone();
    let ping: Arc<dyn RpcHandler> = Arc::new(move |from: NodeId, body: Bytes| -> BoxFuture<Result<Bytes>> {
        let r = nm.handle_ping(from, &body);
        Box::pin(async move { r })
    });
    handlers.register(command::NODE_PING, ping);

    for code in RAFT_COMMANDS {
        let groups = groups.clone();
        let handler: Arc<dyn RpcHandler> = Arc::new(move |from: NodeId, body: Bytes| -> BoxFuture<Result<Bytes>> {
            let groups = groups.clone();
            Box::pin(metrics::record_metrics(metrics::command_name(code), move || async move {
                let req = RaftRequest::decode(code, &body)?;
                let ctx = find_group(&groups, req.group_id())?;
                let resp = ctx.handle_request(from, req).await?;
                Ok(resp.to_bytes())
            }))
        });
        handlers.register(code, handler);
    }
}
