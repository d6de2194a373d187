use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use bytes::{BufMut, BytesMut};
use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::{LogIndex, Term};

pub const SNAPSHOT_FILE: &str = "snapshot";
const SNAPSHOT_TMP_FILE: &str = "snapshot.tmp";

/// State machine image together with the log position it reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub data: Vec<u8>,
}

/// Serializes `snapshot` into `buf` as `crc32c(be u32) | bincode`.
pub fn encode_snapshot(snapshot: &Snapshot, buf: &mut BytesMut) -> Result<()> {
    buf.clear();
    buf.put_u32(0);
    bincode::serialize_into((&mut *buf).writer(), snapshot)
        .map_err(|e| RaftError::Invariant(format!("serialize snapshot: {}", e)))?;
    let crc = crc32c::crc32c(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Replaces the snapshot file in `dir` with `data`. The new content is
/// written to a temporary file and synced before the rename.
pub fn write_snapshot_file<P: AsRef<Path>>(dir: P, data: &[u8]) -> Result<()> {
    let dir = dir.as_ref();
    let tmp = dir.join(SNAPSHOT_TMP_FILE);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

pub fn save_snapshot<P: AsRef<Path>>(dir: P, snapshot: &Snapshot) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_snapshot(snapshot, &mut buf)?;
    write_snapshot_file(dir, &buf)?;
    info!(
        "snapshot saved, lastIndex={}, lastTerm={}, {} bytes",
        snapshot.last_index,
        snapshot.last_term,
        buf.len()
    );
    Ok(())
}

/// Loads the snapshot of `dir`, if any. A leftover temporary file from an
/// interrupted save is removed.
pub fn load_snapshot<P: AsRef<Path>>(dir: P) -> Result<Option<Snapshot>> {
    let dir = dir.as_ref();
    let tmp = dir.join(SNAPSHOT_TMP_FILE);
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(&path)?;
    if data.len() < 4 {
        return Err(RaftError::Corrupted(format!(
            "snapshot file {} too short",
            path.display()
        )));
    }
    let expect = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if crc32c::crc32c(&data[4..]) != expect {
        return Err(RaftError::Corrupted(format!(
            "snapshot file {} checksum mismatch",
            path.display()
        )));
    }
    let snapshot = bincode::deserialize(&data[4..])
        .map_err(|e| RaftError::Corrupted(format!("decode snapshot: {}", e)))?;
    Ok(Some(snapshot))
}
