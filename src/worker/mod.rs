//! C10 — Worker Pool / Query Manager (§4.10): a fixed pool of OS threads
//! pulling tasks from the queue, driving pipeline invocations to
//! completion, and feeding follow-up work (merge/probe signals, emitted
//! buffers) back into the system.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::buffer::{BufferPool, TupleBuffer};
use crate::error::Result;
use crate::pipeline::{InternalSignal, Pipeline};
use crate::plan::ExecutableQueryPlan;
use crate::stop_token::StopToken;
use crate::task_queue::TaskQueue;

/// A unit of work a worker thread dequeues: invoke `pipeline` over
/// `buffer`. Follow-up `Task`s produced from a [`InternalSignal`] are
/// pushed back onto the internal lane by [`dispatch_signal`].
pub struct Task {
    pub pipeline: Arc<Pipeline>,
    pub buffer: TupleBuffer,
}

impl Task {
    pub fn new(pipeline: Arc<Pipeline>, buffer: TupleBuffer) -> Self {
        Self { pipeline, buffer }
    }
}

/// Converts an operator-produced [`InternalSignal`] into an actual probe
/// invocation and pushes whatever it emits back onto the internal lane.
/// `pipelines` is searched in order for the one carrying the
/// `AggregationProbe`/`JoinProbe` for the signaled handler index — usually
/// the same pipeline that produced the signal (probe operators typically
/// sit after their build counterpart in one straight-line chain), but the
/// search is not restricted to it, in case a plan wires build and probe
/// into separate pipelines.
fn dispatch_signal(
    worker_id: usize,
    pipelines: &[Arc<Pipeline>],
    signal: InternalSignal,
    buffer_pool: &Arc<BufferPool>,
    stop: &StopToken,
    queue: &TaskQueue<Task>,
) {
    let result = match &signal {
        InternalSignal::SliceMergeReady { handler_index, start, end, fragments } => {
            let outcome = pipelines.iter().find_map(|pipeline| {
                pipeline
                    .drive_aggregation_probe(worker_id, *handler_index, fragments.clone(), buffer_pool.clone(), stop.clone())
                    .transpose()
                    .map(|r| r.map(|output| (pipeline.clone(), output)))
            });
            match outcome {
                Some(r) => r,
                None => {
                    warn!(worker_id, handler_index, start, end, "no aggregation probe found for signaled handler");
                    return;
                }
            }
        }
        InternalSignal::JoinReady { handler_index, window_id, partition, keys } => {
            let outcome = pipelines.iter().find_map(|pipeline| {
                pipeline
                    .drive_join_probe(worker_id, *handler_index, *window_id, *partition, keys, buffer_pool.clone(), stop.clone())
                    .transpose()
                    .map(|r| r.map(|output| (pipeline.clone(), output)))
            });
            match outcome {
                Some(r) => r,
                None => {
                    warn!(worker_id, handler_index, window_id, partition, "no join probe found for signaled handler");
                    return;
                }
            }
        }
    };

    let (pipeline, output) = match result {
        Ok(found) => found,
        Err(e) => {
            error!(worker_id, error = %e, "probe invocation failed");
            return;
        }
    };

    debug!(worker_id, buffers = output.emitted_buffers.len(), "probe produced output");
    for buffer in output.emitted_buffers {
        let follow_up = Task::new(pipeline.clone(), buffer);
        if !queue.add_internal_task_non_blocking(follow_up) {
            warn!(worker_id, "internal lane full, dropping probe output follow-up");
        }
    }
    // Probes are not expected to themselves emit further merge/join
    // signals; surface it if one ever does rather than silently dropping.
    for stray in output.internal_signals {
        warn!(worker_id, ?stray, "probe unexpectedly produced a further internal signal, dropping");
    }
}

/// Owns the queue, buffer pool, and the join handles for every worker
/// thread. Dropping it does not stop the workers; call [`WorkerPool::stop`]
/// (or trip the shared [`StopToken`]) first.
pub struct WorkerPool {
    queue: Arc<TaskQueue<Task>>,
    buffer_pool: Arc<BufferPool>,
    stop: StopToken,
    handles: Vec<JoinHandle<()>>,
    tasks_completed: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawns `number_of_threads` worker threads immediately. Each loops
    /// per §4.10's pseudocode: blocking dequeue, invoke, requeue
    /// follow-up work, until `stop` is requested and the queue runs dry.
    /// `pipelines` is every pipeline in the plan these workers serve — not
    /// just the one a given task targets — so a merge/join signal produced
    /// by one pipeline can be dispatched to whichever pipeline carries the
    /// matching probe operator.
    pub fn start(
        number_of_threads: usize,
        queue: Arc<TaskQueue<Task>>,
        buffer_pool: Arc<BufferPool>,
        stop: StopToken,
        pipelines: Vec<Arc<Pipeline>>,
    ) -> Self {
        let tasks_completed = Arc::new(AtomicUsize::new(0));
        let pipelines = Arc::new(pipelines);
        let mut handles = Vec::with_capacity(number_of_threads);
        for worker_id in 0..number_of_threads {
            let queue = queue.clone();
            let buffer_pool = buffer_pool.clone();
            let stop = stop.clone();
            let tasks_completed = tasks_completed.clone();
            let pipelines = pipelines.clone();
            let handle = std::thread::Builder::new()
                .name(format!("nebula-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, queue, buffer_pool, stop, tasks_completed, pipelines))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self { queue, buffer_pool, stop, handles, tasks_completed }
    }

    pub fn queue(&self) -> &Arc<TaskQueue<Task>> {
        &self.queue
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn tasks_completed(&self) -> usize {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    /// Graceful stop: trips the shared token so sources cease admission
    /// and the queue drains naturally, then joins every worker thread.
    pub fn stop(self) {
        self.stop.request_stop();
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    /// Hard stop: identical token trip, but callers typically pair this
    /// with [`ExecutableQueryPlan::hard_stop`] to also abandon in-flight
    /// plan state rather than waiting for a graceful drain.
    pub fn hard_stop(self, plan: &ExecutableQueryPlan) -> Result<()> {
        plan.hard_stop()?;
        self.stop();
        Ok(())
    }
}

/// Selects between blocking and non-blocking dequeue so a worker stays
/// responsive to both fresh admission and follow-up work without busy
/// spinning (§4.10: "selects between blocking and non-blocking dequeue,
/// random or round-robin"). A small random chance of a non-blocking poll
/// keeps follow-up work from queuing behind a long blocking wait when the
/// internal lane is bursty.
fn next_task(queue: &TaskQueue<Task>, stop: &StopToken) -> Option<Task> {
    if rand::rng().random_bool(0.1) {
        if let Some(task) = queue.get_next_task_non_blocking() {
            return Some(task);
        }
    }
    queue.get_next_task_blocking(stop)
}

fn worker_loop(
    worker_id: usize,
    queue: Arc<TaskQueue<Task>>,
    buffer_pool: Arc<BufferPool>,
    stop: StopToken,
    tasks_completed: Arc<AtomicUsize>,
    pipelines: Arc<Vec<Arc<Pipeline>>>,
) {
    while !stop.is_stopped() {
        let task = match next_task(&queue, &stop) {
            Some(t) => t,
            None => continue,
        };
        let output = match task.pipeline.invoke(worker_id, &task.buffer, buffer_pool.clone(), stop.clone()) {
            Ok(output) => output,
            Err(e) => {
                error!(worker_id, error = %e, "pipeline invocation failed");
                continue;
            }
        };

        for signal in output.internal_signals {
            dispatch_signal(worker_id, &pipelines, signal, &buffer_pool, &stop, &queue);
        }

        for buffer in output.emitted_buffers {
            let follow_up = Task::new(task.pipeline.clone(), buffer);
            if !queue.add_internal_task_non_blocking(follow_up) {
                warn!(worker_id, "internal lane full, dropping emitted buffer follow-up");
            }
        }

        tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    // final drain: a task may have landed on the queue between the stop
    // check above and becoming visible here; run it to completion rather
    // than lose it (graceful stop, §4.10).
    while let Some(task) = queue.get_next_task_non_blocking() {
        if let Ok(output) = task.pipeline.invoke(worker_id, &task.buffer, buffer_pool.clone(), stop.clone()) {
            for signal in output.internal_signals {
                dispatch_signal(worker_id, &pipelines, signal, &buffer_pool, &stop, &queue);
            }
            tasks_completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Field, FieldType, MemoryLayout, Schema};
    use crate::handler::HandlerRegistry;
    use crate::pipeline::{Emit, Pipeline, Scan};

    fn int_schema() -> Schema {
        Schema::new(vec![Field { name: "a".into(), field_type: FieldType::I32 }]).unwrap()
    }

    #[test]
    fn worker_pool_drains_admitted_tasks() {
        let schema = int_schema();
        let layout = MemoryLayout::RowMajor;
        let pool = Arc::new(BufferPool::new(4096, 8));
        let handlers = Arc::new(HandlerRegistry::new());

        let scan = Scan::new(schema.clone(), layout);
        let emit = Emit::new(0, schema.clone(), layout);
        let pipeline = Arc::new(Pipeline::new(scan, vec![Box::new(emit)], handlers));
        pipeline.setup(&pool).unwrap();

        let queue = Arc::new(TaskQueue::new(16));
        let stop = StopToken::new();

        for row in 0..4u32 {
            let buffer = pool.get_buffer_no_blocking().unwrap();
            let offset = layout.field_offset(&schema, buffer.buffer_size(), 0, 0).unwrap();
            buffer.write_at(offset, &(row as i32).to_le_bytes()).unwrap();
            buffer.set_number_of_tuples(1);
            buffer.set_origin_id(1);
            buffer.set_sequence_number(row as u64 + 1);
            queue.add_admission_task_blocking(&stop, Task::new(pipeline.clone(), buffer));
        }

        let worker_pool = WorkerPool::start(2, queue.clone(), pool.clone(), stop.clone(), vec![pipeline.clone()]);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while worker_pool.tasks_completed() < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(worker_pool.tasks_completed(), 4);

        worker_pool.stop();
    }

    #[test]
    fn stop_token_halts_workers_promptly() {
        let queue: Arc<TaskQueue<Task>> = Arc::new(TaskQueue::new(4));
        let pool = Arc::new(BufferPool::new(1024, 4));
        let stop = StopToken::new();
        let worker_pool = WorkerPool::start(3, queue, pool, stop.clone(), Vec::new());
        std::thread::sleep(std::time::Duration::from_millis(20));
        worker_pool.stop();
        assert!(stop.is_stopped());
    }
}
