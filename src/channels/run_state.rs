//! Worker lifecycle flag shared between the control task and the worker loop.
//!
//! `Stopped → Running → Stopping → Stopped`. Only `start`, `stop` and
//! `finish` mutate it; the loop reads it at its suspension points.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// Lifecycle of a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Stopping,
}

/// Atomic run flag plus a wake-up signal for interruptible waits.
#[derive(Debug)]
pub struct RunState {
    state: AtomicU8,
    wake: Notify,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STOPPED),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => WorkerState::Running,
            STOPPING => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// `Stopped → Running`. Returns false if the worker was not stopped.
    pub fn start(&self) -> bool {
        self.state
            .compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `Running → Stopping`, waking any interruptible wait.
    ///
    /// Returns false if the worker was not running.
    pub fn stop(&self) -> bool {
        let changed = self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            self.wake.notify_one();
        }
        changed
    }

    /// Mark the loop as exited.
    pub fn finish(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
    }

    /// Resolves as soon as the state is no longer `Running`.
    pub async fn stopped(&self) {
        loop {
            if !self.is_running() {
                return;
            }
            self.wake.notified().await;
        }
    }

    /// Sleep for `duration` unless a stop request arrives first.
    ///
    /// Returns true if the full duration elapsed and the worker is still running.
    pub async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = self.stopped() => false,
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a spawned worker loop.
pub struct WorkerHandle {
    run_state: Arc<RunState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(run_state: Arc<RunState>, task: JoinHandle<()>) -> Self {
        Self { run_state, task }
    }

    pub fn state(&self) -> WorkerState {
        self.run_state.state()
    }

    /// Request a graceful stop. The in-flight message is always completed.
    pub fn stop(&self) -> bool {
        self.run_state.stop()
    }

    /// Wait for the loop task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("Worker task panicked: {e}");
        }
    }
}
