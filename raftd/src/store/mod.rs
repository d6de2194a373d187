//! Durable storage of a raft group.
//!
//! ```text
//! <group dir>/status          raft metadata, see StatusFile
//! <group dir>/log/<pos>       log segments, named by absolute start position
//! <group dir>/idx/<pos>       8 bytes of log position per log index
//! <group dir>/snapshot        last local snapshot
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

mod file_queue;
mod idx_queue;
mod log_header;
mod log_queue;
mod raft_log;
mod seq_map;
mod snapshot;
mod status_file;

pub use log_header::{decode_item, encode_item, LogHeader, LogItem, LogItemType};
pub use raft_log::DefaultRaftLog;
pub use seq_map::LongLongSeqMap;
pub use snapshot::{encode_snapshot, load_snapshot, save_snapshot, write_snapshot_file, Snapshot};
pub use status_file::{
    StatusFile, KEY_COMMIT_INDEX, KEY_CURRENT_TERM, KEY_IDX_PERSIST_INDEX, KEY_TRUNCATE,
    KEY_VOTED_FOR,
};

pub const STATUS_FILE: &str = "status";

/// Wall clock milliseconds, as stored in log item timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
