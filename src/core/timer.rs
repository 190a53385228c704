//! Cancelable Task Slot
//!
//! Holds at most one background task. Arming a new task aborts the previous
//! one, and dropping the slot aborts whatever is still running.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A single cancelable task handle.
#[derive(Debug, Default)]
pub struct TaskSlot {
    handle: Option<JoinHandle<()>>,
}

impl TaskSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Spawn `task`, replacing and aborting any task already in the slot.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(task));
    }

    /// Run `then` once `delay` after this call, replacing any pending task.
    pub fn arm<F>(&mut self, delay: Duration, then: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        self.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            then.await;
        });
    }

    /// Abort the task, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether a task is armed and has not finished.
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
