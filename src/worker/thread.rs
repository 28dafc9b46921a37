//! Worker thread wrapper.
//!
//! A single-consumer channel feeds one dedicated thread; delayed
//! flushes are the thread's own receive deadline, so a timer is just
//! the mailbox timing out. Producers never block: submission is a
//! channel send, nothing more.

use crate::error::Result;
use crate::worker::core::{Flow, WorkerCore};
use crate::worker::Message;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, warn};

/// Handle to the spawned serialization worker.
pub struct QueueWorker {
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
    dead: Arc<AtomicBool>,
}

impl QueueWorker {
    /// Spawn the worker thread around a core.
    pub fn spawn(core: WorkerCore) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let dead = Arc::new(AtomicBool::new(false));
        let dead_flag = Arc::clone(&dead);

        let handle = thread::Builder::new()
            .name("beacon-worker".into())
            .spawn(move || run_loop(core, receiver, dead_flag))?;

        Ok(Self {
            sender,
            handle: Some(handle),
            dead,
        })
    }

    /// Submit a message. Fire-and-forget: a dead or terminated worker
    /// drops it, and no error reaches the caller.
    pub fn post(&self, msg: Message) {
        if self.sender.send(msg).is_err() {
            warn!("worker terminated, message dropped");
        }
    }

    /// Whether the worker hit a fatal fault and stopped processing.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Post a hard kill and wait for the thread to finish.
    pub fn shutdown_and_join(&mut self) {
        self.post(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(mut core: WorkerCore, receiver: Receiver<Message>, dead: Arc<AtomicBool>) {
    loop {
        // Dead is terminal: log and drop everything. Shutdown still
        // terminates the thread, but performs no processing.
        if dead.load(Ordering::Relaxed) {
            match receiver.recv() {
                Ok(Message::Shutdown) => {
                    warn!("shutdown received by dead worker, terminating");
                    break;
                }
                Ok(msg) => {
                    warn!(?msg, "worker dead, dropping message");
                    continue;
                }
                Err(_) => break,
            }
        }

        let msg = match core.wake_after() {
            Some(wait) => match receiver.recv_timeout(wait) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            },
        };

        let step = panic::catch_unwind(AssertUnwindSafe(|| match msg {
            Some(msg) => core.handle(msg),
            None => core.on_timer(),
        }));

        match step {
            Ok(Ok(Flow::Continue)) => {}
            Ok(Ok(Flow::Stop)) => break,
            Ok(Err(e)) => {
                error!(error = %e, "fatal fault while processing message, worker is dead");
                dead.store(true, Ordering::Relaxed);
            }
            Err(_) => {
                error!("panic while processing message, worker is dead");
                dead.store(true, Ordering::Relaxed);
            }
        }
    }
}
