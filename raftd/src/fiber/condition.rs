use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// Wait set for fibers of one dispatcher. A waiter that gave up (timeout or
/// cancelled fiber) is skipped by the signal calls.
#[derive(Clone)]
pub struct FiberCondition {
    name: Arc<str>,
    waiters: Arc<Mutex<VecDeque<oneshot::Sender<()>>>>,
}

impl FiberCondition {
    pub fn new(name: &str) -> Self {
        FiberCondition {
            name: Arc::from(name),
            waiters: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn register(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.push_back(tx);
        }
        rx
    }

    pub async fn await_signal(&self) {
        let rx = self.register();
        let _ = rx.await;
    }

    /// Returns true if signalled, false if the timeout elapsed first.
    pub async fn await_timeout(&self, timeout: Duration) -> bool {
        let rx = self.register();
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    /// Wakes exactly one live waiter.
    pub fn signal0(&self) -> bool {
        let Ok(mut waiters) = self.waiters.lock() else {
            return false;
        };
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    pub fn signal_all(&self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            for tx in waiters.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters
            .lock()
            .map(|w| w.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use tokio::task::LocalSet;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn test_signal0_wakes_one_waiter() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let cond = FiberCondition::new("c");
                let woke = Rc::new(Cell::new(0));
                for _ in 0..2 {
                    let cond = cond.clone();
                    let woke = woke.clone();
                    tokio::task::spawn_local(async move {
                        cond.await_signal().await;
                        woke.set(woke.get() + 1);
                    });
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(cond.waiter_count(), 2);
                assert!(cond.signal0());
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(woke.get(), 1);
                cond.signal_all();
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(woke.get(), 2);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_await_timeout_and_dead_waiter_skipped() {
        let cond = FiberCondition::new("t");
        assert!(!cond.await_timeout(Duration::from_millis(10)).await);
        // the timed out waiter is dead, nobody else is waiting
        assert!(!cond.signal0());
        assert_eq!(cond.waiter_count(), 0);
    }
}
