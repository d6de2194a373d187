use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};

use crate::error::{RaftError, Result};

pub const FILE_LENGTH: usize = 4096;
const CRC_HEX_LENGTH: usize = 8;
const CONTENT_START_POS: usize = CRC_HEX_LENGTH + 2;

pub const KEY_CURRENT_TERM: &str = "currentTerm";
pub const KEY_VOTED_FOR: &str = "votedFor";
pub const KEY_COMMIT_INDEX: &str = "commitIndex";
pub const KEY_IDX_PERSIST_INDEX: &str = "idxPersistIndex";
pub const KEY_TRUNCATE: &str = "truncate";

/// Fixed size, checksummed property file. Layout:
///
/// ```text
/// 0..8     lowercase hex CRC32C of bytes 10..4096
/// 8..10    "\r\n"
/// 10..4096 key=value lines, padded with spaces
/// ```
///
/// Every update rewrites the whole 4096 bytes in one write.
pub struct StatusFile {
    path: PathBuf,
    file: File,
    props: BTreeMap<String, String>,
    data: Vec<u8>,
}

impl StatusFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let mut status = StatusFile {
            path,
            file: file.try_clone()?,
            props: BTreeMap::new(),
            data: vec![b' '; FILE_LENGTH],
        };
        if len != 0 {
            info!("loading status file: {}", status.path.display());
            if len != FILE_LENGTH as u64 {
                return Err(RaftError::Corrupted(format!(
                    "bad status file length: {}",
                    len
                )));
            }
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut status.data)?;
            status.props = Self::parse(&status.data)?;
        }
        Ok(status)
    }

    fn parse(data: &[u8]) -> Result<BTreeMap<String, String>> {
        let expect = crc32c::crc32c(&data[CONTENT_START_POS..]);
        let actual = hex::decode(&data[..CRC_HEX_LENGTH])
            .ok()
            .and_then(|b| <[u8; 4]>::try_from(b.as_slice()).ok())
            .map(u32::from_be_bytes);
        if actual != Some(expect) {
            return Err(RaftError::Checksum(format!(
                "bad status file crc: {:?}, expect: {:08x}",
                actual, expect
            )));
        }
        let content = std::str::from_utf8(&data[CONTENT_START_POS..])
            .map_err(|e| RaftError::Corrupted(format!("status file is not utf8: {}", e)))?;
        let mut props = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((k, v)) => {
                    props.insert(k.to_string(), v.to_string());
                }
                None => {
                    return Err(RaftError::Corrupted(format!(
                        "bad status file line: {}",
                        line
                    )))
                }
            }
        }
        Ok(props)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(|s| s.as_str())
    }

    /// Parses a numeric value; a missing key reads as the type's default.
    pub fn get_num<T: FromStr + Default>(&self, key: &str) -> Result<T> {
        match self.props.get(key) {
            None => Ok(T::default()),
            Some(v) => v
                .parse()
                .map_err(|_| RaftError::Corrupted(format!("bad value of {}: {}", key, v))),
        }
    }

    pub fn set<V: ToString>(&mut self, key: &str, value: V) {
        self.props.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.props.remove(key)
    }

    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.props
    }

    /// Writes the current property set. With `flush` the call returns only
    /// after the data reached the disk.
    pub fn persist(&mut self, flush: bool) -> Result<()> {
        let mut content = String::new();
        for (k, v) in &self.props {
            content.push_str(k);
            content.push('=');
            content.push_str(v);
            content.push('\n');
        }
        if content.len() > FILE_LENGTH - CONTENT_START_POS {
            return Err(RaftError::Invariant(format!(
                "status content too large: {}",
                content.len()
            )));
        }
        let data = &mut self.data;
        data.fill(b' ');
        data[CONTENT_START_POS..CONTENT_START_POS + content.len()]
            .copy_from_slice(content.as_bytes());
        data[CONTENT_START_POS - 2] = b'\r';
        data[CONTENT_START_POS - 1] = b'\n';
        let crc = crc32c::crc32c(&data[CONTENT_START_POS..]);
        data[..CRC_HEX_LENGTH].copy_from_slice(hex::encode(crc.to_be_bytes()).as_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(data)?;
        if flush {
            self.file.sync_data()?;
        }
        debug!("saving status file success: {}", self.path.display());
        Ok(())
    }
}
