//! C2 — Task Queue (§4.2): a bounded MPMC queue with two admission
//! classes sharing one logical ring — external admission (rate-limited,
//! back-pressured) and internally-emitted follow-up work (prioritized for
//! forward progress, never blocked by admission pressure).

use crossbeam::channel::{bounded, Receiver, Select, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::stop_token::StopToken;

/// Bounded MPMC queue parameterized by task type `T`.
///
/// Internally this is two crossbeam-channel rings: one admission-lane ring
/// of `capacity` slots, and one internal-lane ring sized to absorb
/// worst-case per-task fan-out (`internal_capacity`, default `4 * capacity`)
/// so that a burst of emitted follow-up tasks never has to wait on the
/// admission lane's back-pressure. The spec leaves cross-lane ordering
/// unspecified (§4.2 Algorithm); this implementation drains the internal
/// lane first on every poll, which is what keeps internal work making
/// forward progress under contention.
pub struct TaskQueue<T> {
    admission_tx: Sender<T>,
    admission_rx: Receiver<T>,
    internal_tx: Sender<T>,
    internal_rx: Receiver<T>,
    successful_adds: AtomicU64,
    successful_gets: AtomicU64,
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_internal_capacity(capacity, capacity.saturating_mul(4).max(1))
    }

    pub fn with_internal_capacity(capacity: usize, internal_capacity: usize) -> Self {
        let (admission_tx, admission_rx) = bounded(capacity.max(1));
        let (internal_tx, internal_rx) = bounded(internal_capacity.max(1));
        Self {
            admission_tx,
            admission_rx,
            internal_tx,
            internal_rx,
            successful_adds: AtomicU64::new(0),
            successful_gets: AtomicU64::new(0),
        }
    }

    /// Blocks until a slot is free or `stop` is tripped. Returns `false` iff
    /// stop was requested before the task could be enqueued.
    pub fn add_admission_task_blocking(&self, stop: &StopToken, task: T) -> bool {
        let mut task = task;
        loop {
            match self.admission_tx.try_send(task) {
                Ok(()) => {
                    self.successful_adds.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(TrySendError::Full(back)) => {
                    task = back;
                    if stop.is_stopped() {
                        return false;
                    }
                    // Wait for a slot to open, but wake periodically to re-check
                    // the stop token: the channel has no "closed-for-stop" signal.
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Attempts to enqueue without blocking. May return `false` under
    /// extreme contention if the internal lane's capacity is exceeded; the
    /// admission lane is never consulted.
    pub fn add_internal_task_non_blocking(&self, task: T) -> bool {
        match self.internal_tx.try_send(task) {
            Ok(()) => {
                self.successful_adds.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Blocks until a task is available or `stop` is tripped. The internal
    /// lane is always polled first.
    pub fn get_next_task_blocking(&self, stop: &StopToken) -> Option<T> {
        loop {
            if let Some(t) = self.get_next_task_non_blocking() {
                return Some(t);
            }
            if stop.is_stopped() {
                // One last drain in case a task landed between the check above
                // and the stop becoming visible (§4.2: no task lost across stop
                // provided the non-blocking variant is drained after join).
                return self.get_next_task_non_blocking();
            }
            let mut select = Select::new();
            let internal_idx = select.recv(&self.internal_rx);
            let admission_idx = select.recv(&self.admission_rx);
            if let Ok(op) = select.select_timeout(POLL_INTERVAL) {
                let idx = op.index();
                let result = if idx == internal_idx {
                    op.recv(&self.internal_rx)
                } else {
                    debug_assert_eq!(idx, admission_idx);
                    op.recv(&self.admission_rx)
                };
                if let Ok(t) = result {
                    self.successful_gets.fetch_add(1, Ordering::Relaxed);
                    return Some(t);
                }
            }
        }
    }

    /// Returns `None` immediately if neither lane has a ready task.
    pub fn get_next_task_non_blocking(&self) -> Option<T> {
        match self.internal_rx.try_recv() {
            Ok(t) => {
                self.successful_gets.fetch_add(1, Ordering::Relaxed);
                return Some(t);
            }
            Err(TryRecvError::Disconnected) | Err(TryRecvError::Empty) => {}
        }
        match self.admission_rx.try_recv() {
            Ok(t) => {
                self.successful_gets.fetch_add(1, Ordering::Relaxed);
                Some(t)
            }
            Err(_) => None,
        }
    }

    /// Current combined occupancy of both lanes.
    pub fn len(&self) -> usize {
        self.admission_rx.len() + self.internal_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn successful_adds(&self) -> u64 {
        self.successful_adds.load(Ordering::Relaxed)
    }

    pub fn successful_gets(&self) -> u64 {
        self.successful_gets.load(Ordering::Relaxed)
    }
}
