use std::collections::VecDeque;

use crate::error::{RaftError, Result};

/// Map from a gapless ascending `u64` key range to `u64` values.
#[derive(Debug, Default)]
pub struct LongLongSeqMap {
    first_key: u64,
    values: VecDeque<u64>,
}

impl LongLongSeqMap {
    pub fn with_capacity(capacity: usize) -> Self {
        LongLongSeqMap {
            first_key: 0,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn first_key(&self) -> Option<u64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.first_key)
        }
    }

    pub fn last_key(&self) -> Option<u64> {
        self.first_key().map(|k| k + self.values.len() as u64 - 1)
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        if key < self.first_key {
            return None;
        }
        self.values.get((key - self.first_key) as usize).copied()
    }

    /// `key` must follow the last key, or start a new range when empty.
    pub fn put(&mut self, key: u64, value: u64) -> Result<()> {
        match self.last_key() {
            None => self.first_key = key,
            Some(last) if last + 1 == key => {}
            Some(last) => {
                return Err(RaftError::Invariant(format!(
                    "seq map put {} after {}",
                    key, last
                )))
            }
        }
        self.values.push_back(value);
        Ok(())
    }

    /// Removes `key` and everything after it.
    pub fn truncate(&mut self, key: u64) {
        if key <= self.first_key {
            self.values.clear();
        } else {
            self.values.truncate((key - self.first_key) as usize);
        }
    }

    /// Removes the first entry.
    pub fn remove(&mut self) -> Option<u64> {
        let v = self.values.pop_front()?;
        self.first_key += 1;
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_only_inside_range() {
        let mut m = LongLongSeqMap::with_capacity(4);
        assert_eq!(m.get(0), None);
        for k in 10..20 {
            m.put(k, k * 100).unwrap();
        }
        for k in 0..30 {
            let expect = if (10..20).contains(&k) { Some(k * 100) } else { None };
            assert_eq!(m.get(k), expect, "key {}", k);
        }
        m.remove();
        m.remove();
        assert_eq!(m.first_key(), Some(12));
        assert_eq!(m.get(11), None);
        m.truncate(15);
        assert_eq!(m.last_key(), Some(14));
        assert_eq!(m.get(15), None);
        m.put(15, 1).unwrap();
        assert_eq!(m.get(15), Some(1));
    }

    #[test]
    fn test_put_with_gap_fails() {
        let mut m = LongLongSeqMap::default();
        m.put(1, 1).unwrap();
        assert!(m.put(3, 3).is_err());
        m.truncate(0);
        assert!(m.is_empty());
        m.put(7, 7).unwrap();
        assert_eq!(m.first_key(), Some(7));
    }
}
