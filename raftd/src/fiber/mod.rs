//! Cooperative scheduling for raft groups.
//!
//! A [`Dispatcher`] owns one thread. Fibers are local tasks on that thread:
//! they only give up control at an `.await` (channel take, condition wait,
//! timer, rpc), so no two fibers of a group ever run at the same time.

mod channel;
mod condition;
mod dispatcher;

pub use channel::FiberChannel;
pub use condition::FiberCondition;
pub use dispatcher::{Dispatcher, Task};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Named set of fibers sharing one dispatcher.
#[derive(Clone)]
pub struct FiberGroup {
    name: Arc<str>,
    dispatcher: Arc<Dispatcher>,
    should_stop: Arc<AtomicBool>,
}

impl FiberGroup {
    pub fn new(name: &str, dispatcher: Arc<Dispatcher>) -> Self {
        FiberGroup {
            name: Arc::from(name),
            dispatcher,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Starts a fiber from any thread. The factory runs on the dispatcher
    /// thread, so the future it builds does not need to be `Send`.
    pub fn fire_fiber<F, Fut>(&self, fiber_name: &str, factory: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let group = self.name.clone();
        let fiber_name = fiber_name.to_string();
        self.dispatcher.schedule(Box::new(move || {
            debug!("fiber {}/{} started", group, fiber_name);
            tokio::task::spawn_local(factory());
        }))
    }

    /// Starts a fiber from a fiber of the same dispatcher.
    pub fn spawn<Fut>(&self, fiber_name: &str, fut: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = ()> + 'static,
    {
        debug_assert!(self.dispatcher.in_dispatcher_thread());
        debug!("fiber {}/{} spawned", self.name, fiber_name);
        tokio::task::spawn_local(fut)
    }

    /// Polled by long running fibers at each resumption.
    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    pub fn new_condition(&self, name: &str) -> FiberCondition {
        FiberCondition::new(name)
    }

    pub fn new_channel<T: Send + 'static>(&self, name: &str) -> FiberChannel<T> {
        FiberChannel::new(self.dispatcher.clone(), name)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_fibers_interleave_only_at_await() {
        let dispatcher = Arc::new(Dispatcher::start("fiber-test").unwrap());
        let group = FiberGroup::new("g1", dispatcher.clone());
        let (tx, rx) = mpsc::channel();
        let g = group.clone();
        group
            .fire_fiber("main", move || async move {
                let trace = Rc::new(RefCell::new(Vec::new()));
                let cond = g.new_condition("step");
                let t = trace.clone();
                let c = cond.clone();
                let child = g.spawn("child", async move {
                    t.borrow_mut().push("child-begin");
                    c.await_signal().await;
                    t.borrow_mut().push("child-end");
                });
                tokio::time::sleep(Duration::from_millis(10)).await;
                trace.borrow_mut().push("main-signal");
                cond.signal0();
                let _ = child.await;
                let _ = tx.send(trace.borrow().clone());
            })
            .unwrap();
        let trace = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(trace, vec!["child-begin", "main-signal", "child-end"]);
        assert!(!group.should_stop());
        group.request_shutdown();
        assert!(group.should_stop());
        dispatcher.shutdown();
        assert!(dispatcher.join(Duration::from_secs(5)));
    }
}
