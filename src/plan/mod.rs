//! C9 — Executable Query Plan Lifecycle (§4.9).
//!
//! ```text
//! Created --setup()-->  Deployed --start()--> Running
//! Running --graceful EoS of all producers--> Stopped
//! Running --hardStop() | fail()------------>  ErrorState
//! Running --reconfigure(upd)---------------> Running (new version)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::buffer::BufferPool;
use crate::error::{Result, RuntimeError};
use crate::handler::{HandlerRegistry, TerminationType};
use crate::pipeline::Pipeline;
use crate::stop_token::StopToken;
use crate::task_queue::TaskQueue;
use crate::worker::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Created,
    Deployed,
    Running,
    Stopped,
    ErrorState,
}

#[derive(Debug, Clone)]
pub enum PlanResult {
    Ok,
    Error(String),
}

/// Owns every handler and pipeline for one decomposed query plan
/// instance. The ownership chain is Plan → Pipeline → handler index, so
/// handler destructors only run once every pipeline referencing them has
/// terminated (§5 Memory reclamation).
pub struct ExecutableQueryPlan {
    state: Mutex<PlanState>,
    handlers: Arc<HandlerRegistry>,
    pipelines: Vec<Arc<Pipeline>>,
    producer_count: AtomicU64,
    terminated: AtomicBool,
    completion_tx: Mutex<Option<Sender<PlanResult>>>,
    completion_rx: Receiver<PlanResult>,
    buffer_pool: Mutex<Option<Arc<BufferPool>>>,
    worker_queue: Mutex<Option<Arc<TaskQueue<Task>>>>,
}

impl ExecutableQueryPlan {
    pub fn new(pipelines: Vec<Arc<Pipeline>>, handlers: Arc<HandlerRegistry>) -> Self {
        let (tx, rx) = bounded(1);
        Self {
            state: Mutex::new(PlanState::Created),
            handlers,
            pipelines,
            producer_count: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            completion_tx: Mutex::new(Some(tx)),
            completion_rx: rx,
            buffer_pool: Mutex::new(None),
            worker_queue: Mutex::new(None),
        }
    }

    /// Lets whoever wires up the worker pool hand the plan its task queue,
    /// so a final slice-merge/join-probe flush at `stop()` can requeue
    /// whatever it produces instead of dropping it. Optional: a plan
    /// without one attached still flushes handler state for correctness,
    /// but discards (and logs) any records that flush produces.
    pub fn attach_worker_queue(&self, queue: Arc<TaskQueue<Task>>) {
        *self.worker_queue.lock() = Some(queue);
    }

    pub fn state(&self) -> PlanState {
        *self.state.lock()
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Validates handler indices, starts every handler, and moves
    /// Created→Deployed. Rolls back to ErrorState on failure.
    pub fn setup(&self, buffer_pool: &Arc<crate::buffer::BufferPool>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != PlanState::Created {
            return Err(RuntimeError::InvalidQueryStatus(format!("setup() requires Created, got {state:?}")));
        }
        if let Err(e) = self.handlers.start_all() {
            warn!(error = %e, "plan setup failed, rolling back");
            *state = PlanState::ErrorState;
            return Err(e);
        }
        for pipeline in &self.pipelines {
            if let Err(e) = pipeline.setup(buffer_pool) {
                let _ = self.handlers.stop_all(TerminationType::Failure);
                *state = PlanState::ErrorState;
                return Err(e);
            }
        }
        *self.buffer_pool.lock() = Some(buffer_pool.clone());
        *state = PlanState::Deployed;
        info!("plan deployed");
        Ok(())
    }

    /// Moves Deployed→Running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != PlanState::Deployed {
            return Err(RuntimeError::InvalidQueryStatus(format!("start() requires Deployed, got {state:?}")));
        }
        *state = PlanState::Running;
        info!("plan running");
        Ok(())
    }

    /// Registers a new source producer; must be called once per source
    /// before it begins emitting.
    pub fn attach_producer(&self) -> u64 {
        self.producer_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current count of still-attached producers. A `NetworkSinkHandler`
    /// fed by this plan uses this as its `num_sending_threads` — the count
    /// a downstream `FramedReceiver` must see that many `EndOfStream`
    /// frames for before treating the channel as fully drained.
    pub fn producer_count(&self) -> u64 {
        self.producer_count.load(Ordering::Acquire)
    }

    /// Called on every EoS received from a producer. Decrement-to-zero is
    /// the acquire-release hand-off that triggers `stop()`; only the
    /// thread observing the transition to zero drives it.
    pub fn on_producer_eos(&self) -> Result<()> {
        let previous = self.producer_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.stop()?;
        } else if previous == 0 {
            // defensive: fetch_sub underflowed because EoS arrived without
            // a matching attach_producer; restore and surface as an error
            // rather than wrapping around to u64::MAX.
            self.producer_count.store(0, Ordering::Release);
            return Err(RuntimeError::Internal("on_producer_eos called with no attached producers".into()));
        }
        Ok(())
    }

    /// Graceful drain: notify sinks, release handlers, publish `Ok`.
    pub fn stop(&self) -> Result<()> {
        if self.terminated.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(()); // another thread already drove the terminal transition
        }
        {
            let mut state = self.state.lock();
            *state = PlanState::Stopped;
        }
        self.flush_pending_merges();
        for pipeline in &self.pipelines {
            let _ = pipeline.terminate();
        }
        self.handlers.stop_all(TerminationType::Graceful)?;
        self.publish(PlanResult::Ok);
        info!("plan stopped gracefully");
        Ok(())
    }

    /// Drives any still-pending slice-merge/join-probe work to completion
    /// before handlers are torn down, so a range or window short of its
    /// full contributor count at end-of-stream still resolves rather than
    /// leaking staged fragments. Best-effort: a failure here is logged, not
    /// propagated, since the plan is already committed to stopping.
    fn flush_pending_merges(&self) {
        let Some(buffer_pool) = self.buffer_pool.lock().clone() else {
            return;
        };
        let queue = self.worker_queue.lock().clone();
        for pipeline in &self.pipelines {
            let output = match pipeline.flush_pending_merges(buffer_pool.clone(), StopToken::new()) {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, "failed to flush pending slice-merge/join-probe work during stop");
                    continue;
                }
            };
            if !output.internal_signals.is_empty() {
                warn!(count = output.internal_signals.len(), "flush produced further internal signals, dropping");
            }
            match &queue {
                Some(queue) => {
                    for buffer in output.emitted_buffers {
                        if !queue.add_internal_task_non_blocking(Task::new(pipeline.clone(), buffer)) {
                            warn!("internal lane full, dropping flushed buffer produced at stop");
                        }
                    }
                }
                None if !output.emitted_buffers.is_empty() => {
                    warn!(count = output.emitted_buffers.len(), "no worker queue attached, dropping flushed output buffers");
                }
                None => {}
            }
        }
    }

    /// Bypasses draining: releases handlers and publishes `Error`.
    pub fn fail(&self, reason: RuntimeError) -> Result<()> {
        if self.terminated.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            *state = PlanState::ErrorState;
        }
        error!(error = %reason, "plan entering ErrorState");
        let _ = self.handlers.stop_all(TerminationType::Failure);
        self.publish(PlanResult::Error(reason.to_string()));
        Ok(())
    }

    pub fn hard_stop(&self) -> Result<()> {
        self.fail(RuntimeError::Internal("hard stop requested".into()))
    }

    /// Swaps in a new plan version built from `new_pipelines`, carrying
    /// over the current handler registry (valid when the update is
    /// additive, per §4.9). The caller is responsible for having already
    /// quiesced in-flight tasks against the old pipelines.
    pub fn reconfigure(&self, new_pipelines: Vec<Arc<Pipeline>>) -> Result<ExecutableQueryPlan> {
        let state = self.state.lock();
        if *state != PlanState::Running {
            return Err(RuntimeError::InvalidQueryStatus(format!(
                "reconfigure() requires Running, got {state:?}"
            )));
        }
        let mut new_plan = ExecutableQueryPlan::new(new_pipelines, self.handlers.clone());
        *new_plan.state.get_mut() = PlanState::Running;
        new_plan
            .producer_count
            .store(self.producer_count.load(Ordering::Acquire), Ordering::Release);
        *new_plan.buffer_pool.get_mut() = self.buffer_pool.lock().clone();
        *new_plan.worker_queue.get_mut() = self.worker_queue.lock().clone();
        Ok(new_plan)
    }

    fn publish(&self, result: PlanResult) {
        if let Some(tx) = self.completion_tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    /// Blocks until the plan terminates, returning its final result.
    pub fn wait_for_completion(&self) -> PlanResult {
        self.completion_rx
            .recv()
            .unwrap_or(PlanResult::Error("completion channel closed without a result".into()))
    }
}
