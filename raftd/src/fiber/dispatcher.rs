use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::error::{RaftError, Result};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum DispatchMsg {
    Run(Task),
    Shutdown,
}

/// One OS thread running a single threaded tokio runtime. Everything scheduled
/// on it runs strictly one at a time, so state owned by the thread needs no
/// locking.
pub struct Dispatcher {
    name: String,
    sender: mpsc::UnboundedSender<DispatchMsg>,
    shutdown: AtomicBool,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<std_mpsc::Receiver<()>>,
}

impl Dispatcher {
    pub fn start(name: &str) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<DispatchMsg>();
        let (done_tx, done_rx) = std_mpsc::channel();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&rt, async move {
                    while let Some(msg) = receiver.recv().await {
                        match msg {
                            DispatchMsg::Run(task) => task(),
                            DispatchMsg::Shutdown => break,
                        }
                    }
                });
                {
                    // fibers still parked are dropped here, inside the runtime
                    let _guard = rt.enter();
                    drop(local);
                }
                info!("dispatcher {} exit", thread_name);
                let _ = done_tx.send(());
            })?;
        let thread_id = handle.thread().id();
        info!("dispatcher {} started", name);
        Ok(Dispatcher {
            name: name.to_string(),
            sender,
            shutdown: AtomicBool::new(false),
            thread_id,
            handle: Mutex::new(Some(handle)),
            done: Mutex::new(done_rx),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hands a task to the dispatcher thread. Safe to call from any thread.
    pub fn schedule(&self, task: Task) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RaftError::DispatcherShutdown);
        }
        self.sender
            .send(DispatchMsg::Run(task))
            .map_err(|_| RaftError::DispatcherShutdown)
    }

    pub fn in_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting tasks. Tasks already queued run first, then every
    /// remaining fiber is dropped.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("dispatcher {} shutdown requested", self.name);
            let _ = self.sender.send(DispatchMsg::Shutdown);
        }
    }

    /// Waits for the thread to exit. Returns false on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        if self.in_dispatcher_thread() {
            warn!("dispatcher {} can not join itself", self.name);
            return false;
        }
        let finished = match self.done.lock() {
            Ok(done) => done.recv_timeout(timeout).is_ok(),
            Err(_) => false,
        };
        if finished {
            if let Ok(mut handle) = self.handle.lock() {
                if let Some(h) = handle.take() {
                    let _ = h.join();
                }
            }
        } else if !self.handle.lock().map(|h| h.is_none()).unwrap_or(false) {
            warn!("dispatcher {} join timeout", self.name);
            return false;
        }
        true
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
