use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use getset::{CopyGetters, Getters};
use log::{error, warn};
use serde_derive::Deserialize;

use crate::error::{RaftError, Result};
use crate::raft::{GroupId, NodeId};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct NodeConfig {
    #[getset(get_copy = "pub")]
    id: NodeId,
    #[getset(get = "pub")]
    addr: String,
}

impl NodeConfig {
    pub fn new(id: NodeId, addr: &str) -> Self {
        NodeConfig {
            id,
            addr: addr.to_string(),
        }
    }
}

/// Process wide settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftServerConfig {
    pub node_id: NodeId,
    pub bind_addr: String,
    pub metrics_addr: String,
    pub data_dir: String,
    pub nodes: Vec<NodeConfig>,
    pub rpc_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub node_ping_interval_ms: u64,
    pub max_frame_size: usize,
    pub pool_max_per_class: usize,
}

impl Default for RaftServerConfig {
    fn default() -> Self {
        RaftServerConfig {
            node_id: 1,
            bind_addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            data_dir: "target/raftd-data".to_string(),
            nodes: vec![NodeConfig::new(1, "127.0.0.1:4000")],
            rpc_timeout_ms: 5000,
            connect_timeout_ms: 2000,
            node_ping_interval_ms: 2000,
            max_frame_size: 16 * 1024 * 1024,
            pool_max_per_class: 16,
        }
    }
}

impl RaftServerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn node_ping_interval(&self) -> Duration {
        Duration::from_millis(self.node_ping_interval_ms)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Settings of one raft group.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftGroupConfig {
    pub group_id: GroupId,
    pub members: Vec<NodeId>,
    pub observers: Vec<NodeId>,
    /// Defaults to `<server data_dir>/group-<group_id>`.
    pub data_dir: Option<String>,

    pub elect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub pre_vote: bool,

    pub max_replicate_items: usize,
    pub max_replicate_bytes: usize,
    pub max_pending_writes: usize,
    pub max_pending_bytes: u64,

    pub log_file_size: u64,
    pub idx_items_per_file: u64,
    pub idx_flush_items: u64,
    pub idx_max_cache_items: usize,
    pub idx_flush_interval_ms: u64,
    pub sync_force: bool,
    pub max_write_buffer: usize,

    pub save_snapshot_interval_ms: u64,
    pub delete_delay_ms: u64,
    pub delete_check_interval_ms: u64,
}

impl Default for RaftGroupConfig {
    fn default() -> Self {
        RaftGroupConfig {
            group_id: 1,
            members: vec![1],
            observers: Vec::new(),
            data_dir: None,
            elect_timeout_ms: 3000,
            heartbeat_interval_ms: 500,
            rpc_timeout_ms: 3000,
            pre_vote: true,
            max_replicate_items: 1000,
            max_replicate_bytes: 16 * 1024 * 1024,
            max_pending_writes: 10_000,
            max_pending_bytes: 256 * 1024 * 1024,
            log_file_size: 64 * 1024 * 1024,
            idx_items_per_file: 1024 * 1024,
            idx_flush_items: 1024,
            idx_max_cache_items: 16 * 1024,
            idx_flush_interval_ms: 1000,
            sync_force: true,
            max_write_buffer: 128 * 1024,
            save_snapshot_interval_ms: 3_600_000,
            delete_delay_ms: 3_600_000,
            delete_check_interval_ms: 10_000,
        }
    }
}

impl RaftGroupConfig {
    pub fn elect_timeout(&self) -> Duration {
        Duration::from_millis(self.elect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn idx_flush_interval(&self) -> Duration {
        Duration::from_millis(self.idx_flush_interval_ms)
    }

    pub fn delete_delay(&self) -> Duration {
        Duration::from_millis(self.delete_delay_ms)
    }

    pub fn delete_check_interval(&self) -> Duration {
        Duration::from_millis(self.delete_check_interval_ms)
    }

    pub fn save_snapshot_interval(&self) -> Option<Duration> {
        if self.save_snapshot_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.save_snapshot_interval_ms))
        }
    }

    pub fn data_dir(&self, server: &RaftServerConfig) -> PathBuf {
        match &self.data_dir {
            Some(d) => PathBuf::from(d),
            None => PathBuf::from(&server.data_dir).join(format!("group-{}", self.group_id)),
        }
    }

    pub fn validate(&self, server: &RaftServerConfig) -> Result<()> {
        if self.members.is_empty() {
            return Err(RaftError::Config(format!(
                "group {} has no members",
                self.group_id
            )));
        }
        let members: HashSet<_> = self.members.iter().collect();
        if members.len() != self.members.len() {
            return Err(RaftError::Config(format!(
                "group {} has duplicated members",
                self.group_id
            )));
        }
        for id in self.members.iter().chain(self.observers.iter()) {
            if server.node(*id).is_none() {
                return Err(RaftError::Config(format!(
                    "group {} references unknown node {}",
                    self.group_id, id
                )));
            }
        }
        if let Some(id) = self.observers.iter().find(|o| members.contains(o)) {
            return Err(RaftError::Config(format!(
                "node {} is both member and observer of group {}",
                id, self.group_id
            )));
        }
        if !self.log_file_size.is_power_of_two() || !self.idx_items_per_file.is_power_of_two() {
            return Err(RaftError::Config(
                "log_file_size and idx_items_per_file must be power of 2".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.elect_timeout_ms {
            return Err(RaftError::Config(
                "heartbeat_interval_ms must be in (0, elect_timeout_ms)".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: RaftServerConfig,
    #[serde(default)]
    pub groups: Vec<RaftGroupConfig>,
}

impl RuntimeConfig {
    /// Single node, single group configuration.
    pub fn new() -> Self {
        RuntimeConfig {
            server: RaftServerConfig::default(),
            groups: vec![RaftGroupConfig::default()],
        }
    }

    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return RuntimeConfig::new();
            }
        };
        Self::from_toml_str(&contents).unwrap_or_else(|e| {
            error!("Something went wrong parsing the runtime config file, {}", e);
            RuntimeConfig::new()
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| RaftError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.node(server.node_id).is_none() {
            return Err(RaftError::Config(format!(
                "self node {} is not in node list",
                server.node_id
            )));
        }
        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        for n in &server.nodes {
            if !ids.insert(n.id) {
                return Err(RaftError::Config(format!("duplicated node id {}", n.id)));
            }
            if !addrs.insert(n.addr.as_str()) {
                return Err(RaftError::Config(format!("duplicated node addr {}", n.addr)));
            }
        }
        let mut group_ids = HashSet::new();
        for g in &self.groups {
            if !group_ids.insert(g.group_id) {
                return Err(RaftError::Config(format!(
                    "duplicated group id {}",
                    g.group_id
                )));
            }
            g.validate(server)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_NODES: &str = r#"
[server]
node_id = 2
bind_addr = "127.0.0.1:5002"
nodes = [
    { id = 1, addr = "127.0.0.1:5001" },
    { id = 2, addr = "127.0.0.1:5002" },
    { id = 3, addr = "127.0.0.1:5003" },
]

[[groups]]
group_id = 7
members = [1, 2, 3]
elect_timeout_ms = 1000
heartbeat_interval_ms = 100
"#;

    #[test]
    fn test_parse_and_validate() {
        let cfg = RuntimeConfig::from_toml_str(THREE_NODES).unwrap();
        assert_eq!(cfg.server.node_id, 2);
        assert_eq!(cfg.server.nodes.len(), 3);
        assert_eq!(cfg.server.nodes[2].addr(), "127.0.0.1:5003");
        assert_eq!(cfg.groups[0].group_id, 7);
        assert_eq!(cfg.groups[0].elect_timeout(), Duration::from_millis(1000));
        // untouched fields keep their defaults
        assert!(cfg.groups[0].sync_force);
        assert_eq!(
            cfg.groups[0].data_dir(&cfg.server),
            PathBuf::from("target/raftd-data/group-7")
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let cfg = RuntimeConfig::from_toml("/definitely/not/here.toml");
        assert_eq!(cfg.groups.len(), 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_groups() {
        let mut cfg = RuntimeConfig::from_toml_str(THREE_NODES).unwrap();
        cfg.groups[0].observers = vec![3];
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));

        let mut cfg = RuntimeConfig::from_toml_str(THREE_NODES).unwrap();
        cfg.groups[0].members.push(9);
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));

        let mut cfg = RuntimeConfig::from_toml_str(THREE_NODES).unwrap();
        cfg.groups[0].log_file_size = 1000;
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));

        let mut cfg = RuntimeConfig::from_toml_str(THREE_NODES).unwrap();
        cfg.server.nodes.push(NodeConfig::new(3, "127.0.0.1:6000"));
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));
    }
}
