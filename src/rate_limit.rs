//! Burst-then-steady-rate admission control for outbound polling requests.
//!
//! [`RateLimiter`] answers "may this request go now?" synchronously;
//! [`QueueingRateLimiter`] additionally defers rejected requests and runs
//! them, in FIFO order, as slots free up.

use crate::queue::Queue;
use crate::timer::TimerHandle;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Admits up to `trigger_threshold` requests immediately, then throttles to
/// a steady `requests_per_second`, chaining each new slot-free time off the
/// previous one so the average rate holds even across bursts.
#[derive(Debug)]
pub struct RateLimiter {
    /// Future "slot-free" timestamps, oldest first. Holding at most
    /// `trigger_threshold` of them is what bounds the burst.
    slots: Queue<Instant>,
    spacing: Duration,
}

impl RateLimiter {
    /// # Panics
    ///
    /// Panics if `trigger_threshold` is zero or `requests_per_second` is not
    /// a positive finite number; both are caller misconfiguration.
    pub fn new(trigger_threshold: usize, requests_per_second: f64) -> Self {
        assert!(trigger_threshold > 0, "trigger_threshold must be positive");
        assert!(
            requests_per_second > 0.0 && requests_per_second.is_finite(),
            "requests_per_second must be positive and finite"
        );
        Self {
            slots: Queue::new(trigger_threshold),
            spacing: Duration::from_secs_f64(1.0 / requests_per_second),
        }
    }

    /// Returns whether a request may proceed right now, claiming a slot if so.
    pub fn accept(&mut self) -> bool {
        let now = Instant::now();
        // A request arriving exactly at a freed slot's timestamp is accepted.
        while self.slots.peek().is_some_and(|&t| t <= now) {
            self.slots.poll();
        }
        if self.slots.is_full() {
            return false;
        }
        let last = self.slots.peek_last().copied().unwrap_or(now);
        let _ = self.slots.offer(last.max(now) + self.spacing);
        true
    }

    /// Like [`accept`](Self::accept), invoking `cb` only when admitted.
    pub fn accept_with<F: FnOnce()>(&mut self, cb: F) -> bool {
        if self.accept() {
            cb();
            true
        } else {
            false
        }
    }

    /// Earliest pending slot-free time, if any slot is claimed.
    pub fn next_slot_free(&self) -> Option<Instant> {
        self.slots.peek().copied()
    }

    pub fn pending_slots(&self) -> usize {
        self.slots.len()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Waiter {
    job: Job,
    done: oneshot::Sender<()>,
}

struct Inner {
    limiter: RateLimiter,
    waiting: VecDeque<Waiter>,
    /// At most one wake-up timer is ever scheduled; it tracks the earliest
    /// pending slot-free time while anything is waiting.
    wake: Option<TimerHandle>,
}

/// A [`RateLimiter`] with fair deferred execution: callbacks that cannot run
/// immediately wait in a FIFO and are promoted one per freed slot.
#[derive(Clone)]
pub struct QueueingRateLimiter {
    inner: Arc<Mutex<Inner>>,
}

impl QueueingRateLimiter {
    pub fn new(trigger_threshold: usize, requests_per_second: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                limiter: RateLimiter::new(trigger_threshold, requests_per_second),
                waiting: VecDeque::new(),
                wake: None,
            })),
        }
    }

    /// Runs `job` now if a slot is free, otherwise defers it behind any
    /// earlier waiters. The returned [`Admission`] resolves once `job` has
    /// executed (or the limiter was dropped with the job still pending).
    pub fn queue<F>(&self, job: F) -> Admission
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.limiter.accept() {
            drop(inner);
            job();
            let _ = tx.send(());
        } else {
            inner.waiting.push_back(Waiter {
                job: Box::new(job),
                done: tx,
            });
            Self::ensure_wake(&self.inner, &mut inner);
        }
        Admission { rx }
    }

    pub fn waiting_len(&self) -> usize {
        self.inner.lock().unwrap().waiting.len()
    }

    fn ensure_wake(shared: &Arc<Mutex<Inner>>, inner: &mut Inner) {
        if inner.wake.is_some() || inner.waiting.is_empty() {
            return;
        }
        let Some(next) = inner.limiter.next_slot_free() else {
            return;
        };
        let delay = next.saturating_duration_since(Instant::now());
        let shared = shared.clone();
        inner.wake = Some(TimerHandle::once(delay, move || Self::on_wake(shared)));
    }

    fn on_wake(shared: Arc<Mutex<Inner>>) {
        let promoted = {
            let mut inner = shared.lock().unwrap();
            inner.wake = None;
            let promoted = match inner.waiting.pop_front() {
                Some(w) if inner.limiter.accept() => Some(w),
                Some(w) => {
                    // Slot not actually free yet; keep FIFO position.
                    inner.waiting.push_front(w);
                    None
                }
                None => None,
            };
            Self::ensure_wake(&shared, &mut inner);
            promoted
        };
        if let Some(w) = promoted {
            (w.job)();
            let _ = w.done.send(());
        }
    }
}

/// Future returned by [`QueueingRateLimiter::queue`].
pub struct Admission {
    rx: oneshot::Receiver<()>,
}

impl Future for Admission {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}
