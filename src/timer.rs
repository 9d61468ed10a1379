//! Cancellable timer handles over tokio tasks.
//!
//! Every scheduled callback in this crate runs behind a [`TimerHandle`] so
//! that termination or supersession can always cancel it before it fires.

use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a scheduled callback. Dropping the handle cancels the timer,
/// so whoever stores it decides how long the callback may stay pending.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Runs `f` once after `delay`.
    pub fn once<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self { task }
    }

    /// Runs `f` every `period`, first firing one period from now.
    pub fn repeating<F>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                f();
            }
        });
        Self { task }
    }

    /// Cancels the timer. A callback that has already started is not
    /// interrupted; one that has not will never run.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
