use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Dispatcher, FiberCondition};
use crate::error::{RaftError, Result};

struct ChannelInner<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: FiberCondition,
}

/// Unbounded queue with a single consuming fiber. Producers on the owning
/// dispatcher call [`offer`](Self::offer); anyone else goes through
/// [`fire_offer`](Self::fire_offer).
pub struct FiberChannel<T> {
    inner: Arc<ChannelInner<T>>,
    dispatcher: Arc<Dispatcher>,
}

impl<T> Clone for FiberChannel<T> {
    fn clone(&self) -> Self {
        FiberChannel {
            inner: self.inner.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<T: Send + 'static> FiberChannel<T> {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, name: &str) -> Self {
        FiberChannel {
            inner: Arc::new(ChannelInner {
                queue: Mutex::new(VecDeque::new()),
                not_empty: FiberCondition::new(name),
            }),
            dispatcher,
        }
    }

    pub fn offer(&self, item: T) {
        debug_assert!(self.dispatcher.in_dispatcher_thread());
        if let Ok(mut q) = self.inner.queue.lock() {
            q.push_back(item);
        }
        self.inner.not_empty.signal0();
    }

    /// Offers from any thread. Fails if the dispatcher is shut down.
    pub fn fire_offer(&self, item: T) -> Result<()> {
        if self.dispatcher.is_shutdown() {
            return Err(RaftError::DispatcherShutdown);
        }
        let ch = self.clone();
        self.dispatcher.schedule(Box::new(move || ch.offer(item)))
    }

    fn pop(&self) -> Option<T> {
        self.inner.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn drain(&self) -> Vec<T> {
        self.inner
            .queue
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn take(&self) -> T {
        loop {
            if let Some(item) = self.pop() {
                return item;
            }
            self.inner.not_empty.await_signal().await;
        }
    }

    pub async fn take_all(&self) -> Vec<T> {
        loop {
            let items = self.drain();
            if !items.is_empty() {
                return items;
            }
            self.inner.not_empty.await_signal().await;
        }
    }

    /// Like [`take_all`](Self::take_all) but returns an empty vec once the
    /// timeout elapses.
    pub async fn take_all_timeout(&self, timeout: Duration) -> Vec<T> {
        let items = self.drain();
        if !items.is_empty() {
            return items;
        }
        self.inner.not_empty.await_timeout(timeout).await;
        self.drain()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::fiber::FiberGroup;

    #[test]
    fn test_fire_offer_from_other_thread() {
        let dispatcher = Arc::new(Dispatcher::start("chan-test").unwrap());
        let group = FiberGroup::new("g", dispatcher.clone());
        let channel: FiberChannel<u32> = group.new_channel("events");
        let (tx, rx) = mpsc::channel();
        let ch = channel.clone();
        group
            .fire_fiber("consumer", move || async move {
                let mut got = Vec::new();
                while got.len() < 5 {
                    got.extend(ch.take_all().await);
                }
                let _ = tx.send(got);
            })
            .unwrap();
        let producers: Vec<_> = (0..5)
            .map(|i| {
                let ch = channel.clone();
                std::thread::spawn(move || ch.fire_offer(i).unwrap())
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let mut got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        dispatcher.shutdown();
        assert!(dispatcher.join(Duration::from_secs(5)));
    }

    #[test]
    fn test_fire_offer_after_shutdown() {
        let dispatcher = Arc::new(Dispatcher::start("chan-shutdown").unwrap());
        let group = FiberGroup::new("g", dispatcher.clone());
        let channel: FiberChannel<u32> = group.new_channel("events");
        dispatcher.shutdown();
        assert!(dispatcher.join(Duration::from_secs(5)));
        assert!(matches!(
            channel.fire_offer(1),
            Err(RaftError::DispatcherShutdown)
        ));
    }

    #[test]
    fn test_take_all_timeout_returns_empty() {
        let dispatcher = Arc::new(Dispatcher::start("chan-timeout").unwrap());
        let group = FiberGroup::new("g", dispatcher.clone());
        let channel: FiberChannel<u32> = group.new_channel("events");
        let (tx, rx) = mpsc::channel();
        group
            .fire_fiber("consumer", move || async move {
                let items = channel.take_all_timeout(Duration::from_millis(20)).await;
                let _ = tx.send(items.len());
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        dispatcher.shutdown();
    }
}
