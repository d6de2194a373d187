//! Raft control rpc messages and their wire encoding.

use bytes::{Bytes, BytesMut};

use super::{GroupId, LogIndex, NodeId, RaftRole, Term};
use crate::codec::{
    decode_body, write_bool, write_bytes, write_fix64, write_message, write_uint, BytesAccumulator,
    PbCallback, PbEncode,
};
use crate::error::{RaftError, Result};
use crate::net::command;
use crate::store::{LogItem, LogItemType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteReq {
    pub group_id: GroupId,
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub pre_vote: bool,
}

impl PbEncode for VoteReq {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.group_id as u64);
        write_uint(buf, 2, self.term as u64);
        write_uint(buf, 3, self.candidate_id as u64);
        write_fix64(buf, 4, self.last_log_index);
        write_uint(buf, 5, self.last_log_term as u64);
        write_bool(buf, 6, self.pre_vote);
    }
}

impl PbCallback for VoteReq {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.group_id = value as GroupId,
            2 => self.term = value as Term,
            3 => self.candidate_id = value as NodeId,
            5 => self.last_log_term = value as Term,
            6 => self.pre_vote = value != 0,
            _ => {}
        }
        true
    }

    fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
        if index == 4 {
            self.last_log_index = value;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteResp {
    pub term: Term,
    pub vote_granted: bool,
}

impl PbEncode for VoteResp {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.term as u64);
        write_bool(buf, 2, self.vote_granted);
    }
}

impl PbCallback for VoteResp {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.term = value as Term,
            2 => self.vote_granted = value != 0,
            _ => {}
        }
        true
    }
}

/// Log item as carried inside an append request.
#[derive(Debug, Default)]
struct LogItemMsg {
    item_type: u8,
    term: Term,
    prev_log_term: Term,
    index: LogIndex,
    timestamp: u64,
    body: Vec<u8>,
    acc: BytesAccumulator,
}

impl LogItemMsg {
    fn into_item(self) -> Option<LogItem> {
        Some(LogItem {
            item_type: LogItemType::from_u8(self.item_type)?,
            term: self.term,
            prev_log_term: self.prev_log_term,
            index: self.index,
            timestamp: self.timestamp,
            body: Bytes::from(self.body),
        })
    }
}

struct LogItemRef<'a>(&'a LogItem);

impl PbEncode for LogItemRef<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        let item = self.0;
        write_uint(buf, 1, item.item_type as u64);
        write_uint(buf, 2, item.term as u64);
        write_uint(buf, 3, item.prev_log_term as u64);
        write_fix64(buf, 4, item.index);
        write_fix64(buf, 5, item.timestamp);
        write_bytes(buf, 6, &item.body);
    }
}

impl PbCallback for LogItemMsg {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.item_type = value as u8,
            2 => self.term = value as Term,
            3 => self.prev_log_term = value as Term,
            _ => {}
        }
        true
    }

    fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
        match index {
            4 => self.index = value,
            5 => self.timestamp = value,
            _ => {}
        }
        true
    }

    fn read_bytes(&mut self, index: u32, chunk: &[u8], total: usize, begin: bool, end: bool) -> bool {
        if index == 6 {
            if let Some(v) = self.acc.push(chunk, total, begin, end) {
                self.body = v;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendReq {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<LogItem>,
}

impl AppendReq {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Only meaningful once [`AppendReq::check_entries`] passed.
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }

    /// Entries must follow `prev_log_index` without gaps, with terms that
    /// never go down and never exceed the request term.
    pub fn check_entries(&self) -> Result<()> {
        let mut prev_term = self.prev_log_term;
        for (i, e) in self.entries.iter().enumerate() {
            let expect = self.prev_log_index + 1 + i as u64;
            if e.index != expect {
                return Err(RaftError::Protocol(format!(
                    "append entry index {}, expect {}",
                    e.index, expect
                )));
            }
            if e.term < prev_term || e.term > self.term {
                return Err(RaftError::Protocol(format!(
                    "append entry {} has term {} after term {} in request term {}",
                    e.index, e.term, prev_term, self.term
                )));
            }
            prev_term = e.term;
        }
        Ok(())
    }
}

impl PbEncode for AppendReq {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.group_id as u64);
        write_uint(buf, 2, self.term as u64);
        write_uint(buf, 3, self.leader_id as u64);
        write_fix64(buf, 4, self.prev_log_index);
        write_uint(buf, 5, self.prev_log_term as u64);
        write_fix64(buf, 6, self.leader_commit);
        for item in &self.entries {
            write_message(buf, 7, &LogItemRef(item));
        }
    }
}

/// Decoding state of an [`AppendReq`].
#[derive(Debug, Default)]
pub struct AppendReqDecoder {
    pub req: AppendReq,
    acc: BytesAccumulator,
}

impl PbCallback for AppendReqDecoder {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.req.group_id = value as GroupId,
            2 => self.req.term = value as Term,
            3 => self.req.leader_id = value as NodeId,
            5 => self.req.prev_log_term = value as Term,
            _ => {}
        }
        true
    }

    fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
        match index {
            4 => self.req.prev_log_index = value,
            6 => self.req.leader_commit = value,
            _ => {}
        }
        true
    }

    fn read_bytes(&mut self, index: u32, chunk: &[u8], total: usize, begin: bool, end: bool) -> bool {
        if index != 7 {
            return true;
        }
        match self.acc.push(chunk, total, begin, end) {
            None => true,
            Some(v) => match decode_body::<LogItemMsg>(&v).ok().and_then(LogItemMsg::into_item) {
                Some(item) => {
                    self.req.entries.push(item);
                    true
                }
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendCode {
    Success = 0,
    LogNotMatch = 1,
    TermLower = 2,
    NotMember = 3,
}

impl AppendCode {
    fn from_u64(v: u64) -> Self {
        match v {
            0 => AppendCode::Success,
            1 => AppendCode::LogNotMatch,
            2 => AppendCode::TermLower,
            _ => AppendCode::NotMember,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResp {
    pub term: Term,
    pub success: bool,
    pub code: AppendCode,
    pub suggest_term: Term,
    pub suggest_index: LogIndex,
}

impl Default for AppendResp {
    fn default() -> Self {
        AppendResp {
            term: 0,
            success: false,
            code: AppendCode::Success,
            suggest_term: 0,
            suggest_index: 0,
        }
    }
}

impl PbEncode for AppendResp {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.term as u64);
        write_bool(buf, 2, self.success);
        write_uint(buf, 3, self.code as u64);
        write_uint(buf, 4, self.suggest_term as u64);
        write_fix64(buf, 5, self.suggest_index);
    }
}

impl PbCallback for AppendResp {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.term = value as Term,
            2 => self.success = value != 0,
            3 => self.code = AppendCode::from_u64(value),
            4 => self.suggest_term = value as Term,
            _ => {}
        }
        true
    }

    fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
        if index == 5 {
            self.suggest_index = value;
        }
        true
    }
}

/// Request and response of RAFT_PING: both sides exchange their view of the
/// group's members and observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftPing {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub members: Vec<NodeId>,
    pub observers: Vec<NodeId>,
}

impl RaftPing {
    /// Whether both sides agree on the member and observer sets.
    pub fn same_members(&self, members: &[NodeId], observers: &[NodeId]) -> bool {
        fn sorted(v: &[NodeId]) -> Vec<NodeId> {
            let mut v = v.to_vec();
            v.sort_unstable();
            v
        }
        sorted(&self.members) == sorted(members) && sorted(&self.observers) == sorted(observers)
    }
}

impl PbEncode for RaftPing {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.group_id as u64);
        write_uint(buf, 2, self.node_id as u64);
        for id in &self.members {
            write_uint(buf, 3, *id as u64);
        }
        for id in &self.observers {
            write_uint(buf, 4, *id as u64);
        }
    }
}

impl PbCallback for RaftPing {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.group_id = value as GroupId,
            2 => self.node_id = value as NodeId,
            3 => self.members.push(value as NodeId),
            4 => self.observers.push(value as NodeId),
            _ => {}
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStatusReq {
    pub group_id: GroupId,
}

impl PbEncode for QueryStatusReq {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.group_id as u64);
    }
}

impl PbCallback for QueryStatusReq {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        if index == 1 {
            self.group_id = value as GroupId;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatusResp {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: NodeId,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

impl Default for QueryStatusResp {
    fn default() -> Self {
        QueryStatusResp {
            group_id: 0,
            node_id: 0,
            role: RaftRole::Follower,
            term: 0,
            leader_id: 0,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
        }
    }
}

impl PbEncode for QueryStatusResp {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.group_id as u64);
        write_uint(buf, 2, self.node_id as u64);
        write_uint(buf, 3, self.role as u64);
        write_uint(buf, 4, self.term as u64);
        write_uint(buf, 5, self.leader_id as u64);
        write_fix64(buf, 6, self.commit_index);
        write_fix64(buf, 7, self.last_applied);
        write_fix64(buf, 8, self.last_log_index);
    }
}

impl PbCallback for QueryStatusResp {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.group_id = value as GroupId,
            2 => self.node_id = value as NodeId,
            3 => match RaftRole::from_u8(value as u8) {
                Some(r) => self.role = r,
                None => return false,
            },
            4 => self.term = value as Term,
            5 => self.leader_id = value as NodeId,
            _ => {}
        }
        true
    }

    fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
        match index {
            6 => self.commit_index = value,
            7 => self.last_applied = value,
            8 => self.last_log_index = value,
            _ => {}
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferLeaderReq {
    pub group_id: GroupId,
    pub term: Term,
    pub old_leader_id: NodeId,
    pub log_index: LogIndex,
}

impl PbEncode for TransferLeaderReq {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.group_id as u64);
        write_uint(buf, 2, self.term as u64);
        write_uint(buf, 3, self.old_leader_id as u64);
        write_fix64(buf, 4, self.log_index);
    }
}

impl PbCallback for TransferLeaderReq {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.group_id = value as GroupId,
            2 => self.term = value as Term,
            3 => self.old_leader_id = value as NodeId,
            _ => {}
        }
        true
    }

    fn read_fixed64(&mut self, index: u32, value: u64) -> bool {
        if index == 4 {
            self.log_index = value;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferLeaderResp {
    pub term: Term,
    pub success: bool,
}

impl PbEncode for TransferLeaderResp {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.term as u64);
        write_bool(buf, 2, self.success);
    }
}

impl PbCallback for TransferLeaderResp {
    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.term = value as Term,
            2 => self.success = value != 0,
            _ => {}
        }
        true
    }
}

/// Requests one raft group sends to the same group on another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftRequest {
    Vote(VoteReq),
    Append(AppendReq),
    Ping(RaftPing),
    QueryStatus(QueryStatusReq),
    TransferLeader(TransferLeaderReq),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftResponse {
    Vote(VoteResp),
    Append(AppendResp),
    Ping(RaftPing),
    QueryStatus(QueryStatusResp),
    TransferLeader(TransferLeaderResp),
}

impl RaftRequest {
    pub fn group_id(&self) -> GroupId {
        match self {
            RaftRequest::Vote(m) => m.group_id,
            RaftRequest::Append(m) => m.group_id,
            RaftRequest::Ping(m) => m.group_id,
            RaftRequest::QueryStatus(m) => m.group_id,
            RaftRequest::TransferLeader(m) => m.group_id,
        }
    }

    pub fn command(&self) -> u32 {
        match self {
            RaftRequest::Vote(_) => command::RAFT_REQUEST_VOTE,
            RaftRequest::Append(_) => command::RAFT_APPEND_ENTRIES,
            RaftRequest::Ping(_) => command::RAFT_PING,
            RaftRequest::QueryStatus(_) => command::RAFT_QUERY_STATUS,
            RaftRequest::TransferLeader(_) => command::RAFT_LEADER_TRANSFER,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            RaftRequest::Vote(m) => m.to_bytes(),
            RaftRequest::Append(m) => m.to_bytes(),
            RaftRequest::Ping(m) => m.to_bytes(),
            RaftRequest::QueryStatus(m) => m.to_bytes(),
            RaftRequest::TransferLeader(m) => m.to_bytes(),
        }
    }

    pub fn decode(code: u32, body: &[u8]) -> Result<Self> {
        let req = match code {
            command::RAFT_REQUEST_VOTE => RaftRequest::Vote(decode_body(body)?),
            command::RAFT_APPEND_ENTRIES => {
                RaftRequest::Append(decode_body::<AppendReqDecoder>(body)?.req)
            }
            command::RAFT_PING => RaftRequest::Ping(decode_body(body)?),
            command::RAFT_QUERY_STATUS => RaftRequest::QueryStatus(decode_body(body)?),
            command::RAFT_LEADER_TRANSFER => RaftRequest::TransferLeader(decode_body(body)?),
            other => {
                return Err(RaftError::Protocol(format!(
                    "command {} is not a raft request",
                    other
                )))
            }
        };
        Ok(req)
    }

    /// Decodes the response body of this request.
    pub fn decode_response(&self, body: &[u8]) -> Result<RaftResponse> {
        let resp = match self {
            RaftRequest::Vote(_) => RaftResponse::Vote(decode_body(body)?),
            RaftRequest::Append(_) => RaftResponse::Append(decode_body(body)?),
            RaftRequest::Ping(_) => RaftResponse::Ping(decode_body(body)?),
            RaftRequest::QueryStatus(_) => RaftResponse::QueryStatus(decode_body(body)?),
            RaftRequest::TransferLeader(_) => RaftResponse::TransferLeader(decode_body(body)?),
        };
        Ok(resp)
    }
}

impl RaftResponse {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            RaftResponse::Vote(m) => m.to_bytes(),
            RaftResponse::Append(m) => m.to_bytes(),
            RaftResponse::Ping(m) => m.to_bytes(),
            RaftResponse::QueryStatus(m) => m.to_bytes(),
            RaftResponse::TransferLeader(m) => m.to_bytes(),
        }
    }
}
