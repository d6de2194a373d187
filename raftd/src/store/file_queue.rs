use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{RaftError, Result};
use crate::raft::{LogIndex, Term};

const FILE_NAME_LEN: usize = 20;

/// One preallocated file of a queue, named by the absolute position of its
/// first byte.
#[derive(Debug)]
pub struct LogFile {
    pub path: PathBuf,
    file: File,
    pub start_pos: u64,
    pub end_pos: u64,
    pub first_index: LogIndex,
    pub first_term: Term,
    pub first_timestamp: u64,
    /// Wall clock millis after which the file may be removed, 0 when not marked.
    pub delete_timestamp: u64,
    /// Readers currently holding the file.
    pub use_count: u32,
}

impl LogFile {
    pub fn should_delete(&self) -> bool {
        self.delete_timestamp > 0
    }

    pub fn reset_first(&mut self) {
        self.first_index = 0;
        self.first_term = 0;
        self.first_timestamp = 0;
    }
}

/// Ordered run of same size files covering the absolute byte range
/// `[queue_start, queue_end)`.
#[derive(Debug)]
pub struct FileQueue {
    dir: PathBuf,
    file_size: u64,
    shift: u32,
    mask: u64,
    files: VecDeque<LogFile>,
    queue_start: u64,
    queue_end: u64,
}

impl FileQueue {
    pub fn open<P: AsRef<Path>>(dir: P, file_size: u64) -> Result<Self> {
        if !file_size.is_power_of_two() {
            return Err(RaftError::Config(format!(
                "file size {} is not power of 2",
                file_size
            )));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut starts: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.len() != FILE_NAME_LEN || !name.bytes().all(|b| b.is_ascii_digit()) {
                warn!("ignore unknown file in {}: {}", dir.display(), name);
                continue;
            }
            let start = name
                .parse::<u64>()
                .map_err(|e| RaftError::Corrupted(format!("bad file name {}: {}", name, e)))?;
            starts.push(start);
        }
        starts.sort_unstable();

        let mut queue = FileQueue {
            dir,
            file_size,
            shift: file_size.trailing_zeros(),
            mask: file_size - 1,
            files: VecDeque::new(),
            queue_start: 0,
            queue_end: 0,
        };
        for (i, start) in starts.iter().enumerate() {
            if start & queue.mask != 0 {
                return Err(RaftError::Corrupted(format!(
                    "file start {} not aligned to {}",
                    start, file_size
                )));
            }
            if i > 0 && *start != starts[i - 1] + file_size {
                return Err(RaftError::Corrupted(format!(
                    "files not continuous: {} after {}",
                    start,
                    starts[i - 1]
                )));
            }
            let path = queue.file_path(*start);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let len = file.metadata()?.len();
            if len != file_size {
                return Err(RaftError::Corrupted(format!(
                    "bad file length {}: {}",
                    path.display(),
                    len
                )));
            }
            queue.files.push_back(Self::new_log_file(path, file, *start, file_size));
        }
        if let (Some(first), Some(last)) = (queue.files.front(), queue.files.back()) {
            queue.queue_start = first.start_pos;
            queue.queue_end = last.end_pos;
        }
        info!(
            "open file queue {}, {} files, range [{}, {})",
            queue.dir.display(),
            queue.files.len(),
            queue.queue_start,
            queue.queue_end
        );
        Ok(queue)
    }

    fn new_log_file(path: PathBuf, file: File, start: u64, size: u64) -> LogFile {
        LogFile {
            path,
            file,
            start_pos: start,
            end_pos: start + size,
            first_index: 0,
            first_term: 0,
            first_timestamp: 0,
            delete_timestamp: 0,
            use_count: 0,
        }
    }

    fn file_path(&self, start: u64) -> PathBuf {
        self.dir.join(format!("{:020}", start))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn queue_start(&self) -> u64 {
        self.queue_start
    }

    pub fn queue_end(&self) -> u64 {
        self.queue_end
    }

    pub fn file_pos(&self, absolute_pos: u64) -> u64 {
        absolute_pos & self.mask
    }

    pub fn next_file_pos(&self, absolute_pos: u64) -> u64 {
        ((absolute_pos >> self.shift) + 1) << self.shift
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &VecDeque<LogFile> {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut VecDeque<LogFile> {
        &mut self.files
    }

    /// Allocates files until `pos` is covered.
    pub fn ensure_write_pos_ready(&mut self, pos: u64) -> Result<()> {
        while pos >= self.queue_end {
            let start = self.queue_end;
            let path = self.file_path(start);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.set_len(self.file_size)?;
            file.sync_all()?;
            info!("allocate file {}", path.display());
            self.files
                .push_back(Self::new_log_file(path, file, start, self.file_size));
            self.queue_end += self.file_size;
        }
        Ok(())
    }

    fn index_of(&self, pos: u64) -> Result<usize> {
        if pos < self.queue_start || pos >= self.queue_end {
            return Err(RaftError::Invariant(format!(
                "pos {} out of queue range [{}, {})",
                pos, self.queue_start, self.queue_end
            )));
        }
        Ok(((pos - self.queue_start) >> self.shift) as usize)
    }

    pub fn get_log_file(&self, pos: u64) -> Result<&LogFile> {
        let i = self.index_of(pos)?;
        Ok(&self.files[i])
    }

    pub fn get_log_file_mut(&mut self, pos: u64) -> Result<&mut LogFile> {
        let i = self.index_of(pos)?;
        Ok(&mut self.files[i])
    }

    /// Writes `data` at `pos`; the range must not cross a file boundary.
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let file_pos = self.file_pos(pos);
        if file_pos + data.len() as u64 > self.file_size {
            return Err(RaftError::Invariant(format!(
                "write {} bytes at {} cross file boundary",
                data.len(),
                pos
            )));
        }
        let f = self.get_log_file_mut(pos)?;
        f.file.seek(SeekFrom::Start(file_pos))?;
        f.file.write_all(data)?;
        Ok(())
    }

    /// Fills `buf` from `pos`; the range must not cross a file boundary.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let file_pos = self.file_pos(pos);
        if file_pos + buf.len() as u64 > self.file_size {
            return Err(RaftError::Invariant(format!(
                "read {} bytes at {} cross file boundary",
                buf.len(),
                pos
            )));
        }
        let f = self.get_log_file_mut(pos)?;
        f.file.seek(SeekFrom::Start(file_pos))?;
        f.file.read_exact(buf)?;
        Ok(())
    }

    pub fn sync(&mut self, pos: u64) -> Result<()> {
        self.get_log_file(pos)?.file.sync_data()?;
        Ok(())
    }

    /// Zero fills `[start, end)` and syncs every touched file.
    pub fn zero_range(&mut self, start: u64, end: u64) -> Result<()> {
        const ZERO: [u8; 64 * 1024] = [0u8; 64 * 1024];
        let end = end.min(self.queue_end);
        let mut pos = start;
        while pos < end {
            let file_end = self.next_file_pos(pos).min(end);
            while pos < file_end {
                let n = ((file_end - pos) as usize).min(ZERO.len());
                self.write_at(pos, &ZERO[..n])?;
                pos += n as u64;
            }
            self.sync(pos - 1)?;
        }
        Ok(())
    }

    /// Removes files from the head while `predicate` holds and nobody uses
    /// them. The last file is always kept.
    pub fn delete_head<F: FnMut(&LogFile) -> bool>(&mut self, mut predicate: F) -> Result<usize> {
        let mut count = 0;
        while self.files.len() > 1 {
            let head = &self.files[0];
            if head.use_count > 0 || !predicate(head) {
                break;
            }
            if let Some(f) = self.files.pop_front() {
                info!("delete file {}", f.path.display());
                drop(f.file);
                fs::remove_file(&f.path)?;
                self.queue_start = f.end_pos;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_read_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut q = FileQueue::open(dir.path(), 1024).unwrap();
            assert!(q.is_empty());
            q.ensure_write_pos_ready(1500).unwrap();
            assert_eq!(q.len(), 2);
            assert_eq!(q.queue_end(), 2048);
            q.write_at(1030, b"hello").unwrap();
            assert!(q.write_at(1020, b"too long").is_err());
            q.sync(1030).unwrap();
        }
        let mut q = FileQueue::open(dir.path(), 1024).unwrap();
        assert_eq!(q.len(), 2);
        let mut buf = [0u8; 5];
        q.read_at(1030, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(dir.path().join("00000000000000001024").exists());
    }

    #[test]
    fn test_pos_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::open(dir.path(), 1024).unwrap();
        assert_eq!(q.file_pos(1030), 6);
        assert_eq!(q.next_file_pos(1030), 2048);
        assert_eq!(q.next_file_pos(1024), 2048);
        assert_eq!(q.file_pos(2047), 1023);
    }

    #[test]
    fn test_zero_range_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = FileQueue::open(dir.path(), 1024).unwrap();
        q.ensure_write_pos_ready(2047).unwrap();
        q.write_at(1000, &[7u8; 24]).unwrap();
        q.write_at(1024, &[7u8; 100]).unwrap();
        q.zero_range(1010, 1100).unwrap();
        let mut buf = [0u8; 24];
        q.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[7u8; 10]);
        assert_eq!(&buf[10..], &[0u8; 14]);
        let mut buf = [0u8; 100];
        q.read_at(1024, &mut buf).unwrap();
        assert!(buf[..76].iter().all(|b| *b == 0));
        assert!(buf[76..].iter().all(|b| *b == 7));
    }

    #[test]
    fn test_delete_head_keeps_used_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = FileQueue::open(dir.path(), 1024).unwrap();
        q.ensure_write_pos_ready(3 * 1024).unwrap();
        assert_eq!(q.len(), 4);
        q.files_mut()[1].use_count = 1;
        assert_eq!(q.delete_head(|_| true).unwrap(), 1);
        assert_eq!(q.queue_start(), 1024);
        q.files_mut()[0].use_count = 0;
        assert_eq!(q.delete_head(|_| true).unwrap(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.queue_start(), 3 * 1024);
    }

    #[test]
    fn test_gap_in_files_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut q = FileQueue::open(dir.path(), 1024).unwrap();
            q.ensure_write_pos_ready(2048).unwrap();
        }
        fs::remove_file(dir.path().join("00000000000000001024")).unwrap();
        assert!(matches!(
            FileQueue::open(dir.path(), 1024),
            Err(RaftError::Corrupted(_))
        ));
    }
}
