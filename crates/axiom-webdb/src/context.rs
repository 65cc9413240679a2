//! Script contexts
//!
//! Callbacks never run on a connection worker. The worker posts them to the
//! script context that scheduled the work and waits for the acknowledgement
//! before it moves on, so every suspension point of a transaction is an
//! explicit message round trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

type ScriptTask = Box<dyn FnOnce() + Send>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Sending side of a script thread's task queue
#[derive(Clone)]
pub struct ScriptContext {
    id: u64,
    sender: mpsc::UnboundedSender<ScriptTask>,
}

/// Receiving side; whoever owns it is the script thread
pub struct ScriptEventLoop {
    id: u64,
    receiver: mpsc::UnboundedReceiver<ScriptTask>,
}

impl ScriptContext {
    pub fn new() -> (Self, ScriptEventLoop) {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { id, sender }, ScriptEventLoop { id, receiver })
    }

    /// Start a dedicated script thread running the event loop
    pub fn spawn(name: &str) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (context, event_loop) = Self::new();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || event_loop.run())?;
        Ok((context, handle))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `task` on the script thread. Returns false once the event loop
    /// has gone away.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Box::new(task)).is_ok()
    }

    /// Run `task` on the script thread and wait for its result.
    ///
    /// Returns `None` when the context stopped before the task ran. Must not
    /// be called from the script thread itself.
    pub fn call<F, R>(&self, task: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (ack, done) = oneshot::channel();
        let posted = self.post(move || {
            let _ = ack.send(task());
        });
        if !posted {
            return None;
        }
        done.blocking_recv().ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptContext").field("id", &self.id).finish()
    }
}

impl ScriptEventLoop {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Dispatch tasks until every `ScriptContext` clone has been dropped
    pub fn run(mut self) {
        tracing::debug!(context = self.id, "Script event loop started");
        while let Some(task) = self.receiver.blocking_recv() {
            task();
        }
        tracing::debug!(context = self.id, "Script event loop finished");
    }

    /// Dispatch whatever is queued right now; returns the number of tasks run
    pub fn run_until_idle(&mut self) -> usize {
        let mut dispatched = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            dispatched += 1;
        }
        dispatched
    }

    /// Stop accepting tasks. Pending ones are dropped undelivered.
    pub fn stop(mut self) {
        self.receiver.close();
        tracing::debug!(context = self.id, "Script event loop stopped");
    }
}
