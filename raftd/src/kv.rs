//! Sample replicated key-value store used by the server binary and the
//! benchmark.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::{LogIndex, StateMachine, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvQuery {
    Get { key: Vec<u8> },
    Len,
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RaftError::Protocol(format!("encode kv command: {}", e)))
    }
}

impl KvQuery {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RaftError::Protocol(format!("encode kv query: {}", e)))
    }
}

/// Decodes the output of a `Get` query.
pub fn decode_value(data: &[u8]) -> Result<Option<Vec<u8>>> {
    bincode::deserialize(data).map_err(|e| RaftError::Protocol(format!("decode kv value: {}", e)))
}

#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    last_index: LogIndex,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KvStateMachine {
    /// Returns the previous value of the key, bincode encoded.
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<Vec<u8>> {
        let cmd: KvCommand = bincode::deserialize(data)
            .map_err(|e| RaftError::StateMachine(format!("bad kv command at {}: {}", index, e)))?;
        let prev = match cmd {
            KvCommand::Put { key, value } => self.data.insert(key, value),
            KvCommand::Delete { key } => self.data.remove(&key),
        };
        self.last_index = index;
        bincode::serialize(&prev).map_err(|e| RaftError::StateMachine(e.to_string()))
    }

    fn query(&self, data: &[u8]) -> Result<Vec<u8>> {
        let query: KvQuery =
            bincode::deserialize(data).map_err(|e| RaftError::Protocol(format!("bad kv query: {}", e)))?;
        let out = match query {
            KvQuery::Get { key } => bincode::serialize(&self.data.get(&key)),
            KvQuery::Len => bincode::serialize(&(self.data.len() as u64)),
        };
        out.map_err(|e| RaftError::StateMachine(e.to_string()))
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.data).unwrap_or_default()
    }

    fn install_snapshot(&mut self, last_index: LogIndex, _last_term: Term, data: &[u8]) -> Result<()> {
        self.data = bincode::deserialize(data)
            .map_err(|e| RaftError::Corrupted(format!("kv snapshot at {}: {}", last_index, e)))?;
        self.last_index = last_index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(k: &str, v: &str) -> Vec<u8> {
        KvCommand::Put {
            key: k.as_bytes().to_vec(),
            value: v.as_bytes().to_vec(),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_apply_and_query() {
        let mut sm = KvStateMachine::new();
        let prev = sm.apply(1, &put("a", "1")).unwrap();
        assert_eq!(decode_value(&prev).unwrap(), None);
        let prev = sm.apply(2, &put("a", "2")).unwrap();
        assert_eq!(decode_value(&prev).unwrap(), Some(b"1".to_vec()));

        let q = KvQuery::Get { key: b"a".to_vec() }.encode().unwrap();
        assert_eq!(decode_value(&sm.query(&q).unwrap()).unwrap(), Some(b"2".to_vec()));

        let del = KvCommand::Delete { key: b"a".to_vec() }.encode().unwrap();
        sm.apply(3, &del).unwrap();
        assert!(sm.is_empty());
        assert!(matches!(sm.apply(4, b"\xff\xff"), Err(RaftError::StateMachine(_))));
    }

    #[test]
    fn test_snapshot_install() {
        let mut sm = KvStateMachine::new();
        sm.apply(1, &put("x", "y")).unwrap();
        let data = sm.snapshot();
        let mut other = KvStateMachine::new();
        other.install_snapshot(1, 1, &data).unwrap();
        assert_eq!(other.get(b"x"), Some(&b"y".to_vec()));
    }
}
