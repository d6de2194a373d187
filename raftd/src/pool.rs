//! Two tier byte buffer pool.
//!
//! [`GlobalPool`] is shared by the whole server and guarded by a mutex.
//! Each raft group owns a [`GroupPool`] that caches a few buffers per size
//! class without locking and falls back to the global pool. A buffer that
//! travels to another thread goes back through [`PoolReleaser`], which hands
//! it to the owning dispatcher first.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use log::debug;

use crate::fiber::Dispatcher;

const MIN_CLASS_SHIFT: u32 = 10; // 1 KiB
const MAX_CLASS_SHIFT: u32 = 24; // 16 MiB
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

fn class_of(capacity: usize) -> Option<usize> {
    let size = capacity.max(1 << MIN_CLASS_SHIFT).next_power_of_two();
    let shift = size.trailing_zeros();
    if shift > MAX_CLASS_SHIFT {
        None
    } else {
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}

fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub borrowed: u64,
    pub reused: u64,
    pub released: u64,
    pub dropped: u64,
}

struct GlobalInner {
    free: Vec<Vec<BytesMut>>,
    stats: PoolStats,
}

pub struct GlobalPool {
    max_per_class: usize,
    inner: Mutex<GlobalInner>,
}

impl GlobalPool {
    pub fn new(max_per_class: usize) -> Self {
        GlobalPool {
            max_per_class,
            inner: Mutex::new(GlobalInner {
                free: (0..CLASS_COUNT).map(|_| Vec::new()).collect(),
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn borrow(&self, min_capacity: usize) -> BytesMut {
        let Some(class) = class_of(min_capacity) else {
            return BytesMut::with_capacity(min_capacity);
        };
        if let Ok(mut inner) = self.inner.lock() {
            inner.stats.borrowed += 1;
            if let Some(buf) = inner.free[class].pop() {
                inner.stats.reused += 1;
                return buf;
            }
        }
        BytesMut::with_capacity(class_size(class))
    }

    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let class = match class_of(buf.capacity()) {
            Some(c) if class_size(c) == buf.capacity() => c,
            _ => return,
        };
        if let Ok(mut inner) = self.inner.lock() {
            if inner.free[class].len() < self.max_per_class {
                inner.free[class].push(buf);
                inner.stats.released += 1;
            } else {
                inner.stats.dropped += 1;
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().map(|i| i.stats).unwrap_or_default()
    }
}

/// Per group cache. Only used on the group's dispatcher thread.
pub struct GroupPool {
    global: Arc<GlobalPool>,
    free: Vec<Vec<BytesMut>>,
    max_per_class: usize,
    // filled only by tasks running on the owner dispatcher
    returned: Arc<Mutex<Vec<BytesMut>>>,
    owner: Arc<Dispatcher>,
}

impl GroupPool {
    pub fn new(global: Arc<GlobalPool>, owner: Arc<Dispatcher>, max_per_class: usize) -> Self {
        GroupPool {
            global,
            free: (0..CLASS_COUNT).map(|_| Vec::new()).collect(),
            max_per_class,
            returned: Arc::new(Mutex::new(Vec::new())),
            owner,
        }
    }

    fn reclaim_returned(&mut self) {
        let returned: Vec<BytesMut> = match self.returned.lock() {
            Ok(mut r) if !r.is_empty() => r.drain(..).collect(),
            _ => return,
        };
        debug!("group pool reclaim {} returned buffers", returned.len());
        for buf in returned {
            self.release(buf);
        }
    }

    pub fn borrow(&mut self, min_capacity: usize) -> BytesMut {
        self.reclaim_returned();
        match class_of(min_capacity) {
            Some(class) => match self.free[class].pop() {
                Some(buf) => buf,
                None => self.global.borrow(min_capacity),
            },
            None => BytesMut::with_capacity(min_capacity),
        }
    }

    pub fn release(&mut self, mut buf: BytesMut) {
        buf.clear();
        match class_of(buf.capacity()) {
            Some(class) if class_size(class) == buf.capacity() => {
                if self.free[class].len() < self.max_per_class {
                    self.free[class].push(buf);
                } else {
                    self.global.release(buf);
                }
            }
            _ => {}
        }
    }

    pub fn releaser(&self) -> PoolReleaser {
        PoolReleaser {
            returned: self.returned.clone(),
            owner: self.owner.clone(),
        }
    }

    pub fn cached(&self) -> usize {
        self.free.iter().map(|v| v.len()).sum()
    }
}

/// Sendable handle giving buffers back to a [`GroupPool`] through its owner
/// dispatcher.
#[derive(Clone)]
pub struct PoolReleaser {
    returned: Arc<Mutex<Vec<BytesMut>>>,
    owner: Arc<Dispatcher>,
}

impl PoolReleaser {
    pub fn release(&self, buf: BytesMut) {
        if self.owner.in_dispatcher_thread() {
            if let Ok(mut r) = self.returned.lock() {
                r.push(buf);
            }
            return;
        }
        let returned = self.returned.clone();
        // after shutdown the buffer is simply dropped
        let _ = self.owner.schedule(Box::new(move || {
            if let Ok(mut r) = returned.lock() {
                r.push(buf);
            }
        }));
    }
}
