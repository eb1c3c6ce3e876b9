//! Minimal demo binary: wires a toy counting source through a
//! single-pipeline plan (Scan -> Selection -> Emit) into a stdout sink,
//! using the library end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nebula_runtime::buffer::{BufferPool, Field, FieldType, MemoryLayout, Schema};
use nebula_runtime::handler::HandlerRegistry;
use nebula_runtime::pipeline::{Emit, Pipeline, Record, Scan, Selection, Value};
use nebula_runtime::plan::ExecutableQueryPlan;
use nebula_runtime::stop_token::StopToken;
use nebula_runtime::task_queue::TaskQueue;
use nebula_runtime::worker::{Task, WorkerPool};
use nebula_runtime::RuntimeConfig;

fn main() {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let config = RuntimeConfig::default().apply_env_overrides();
    config.validate().expect("invalid runtime configuration");
    tracing::info!(
        workers = config.number_of_worker_threads,
        buffer_size = config.buffer_size,
        "starting nebula-worker"
    );

    let schema = Schema::new(vec![Field { name: "value".into(), field_type: FieldType::I64 }]).unwrap();
    let layout = MemoryLayout::RowMajor;
    let buffer_pool = Arc::new(BufferPool::new(config.buffer_size, config.number_of_buffers_in_global_pool));
    let handlers = Arc::new(HandlerRegistry::new());

    let scan = Scan::new(schema.clone(), layout);
    let selection = Selection::new(Arc::new(|r: &Record| r.get("value").and_then(Value::as_i64).unwrap_or(0) % 2 == 0));
    let emit = Emit::new(0, schema.clone(), layout);
    let pipeline = Arc::new(Pipeline::new(scan, vec![Box::new(selection), Box::new(emit)], handlers.clone()));

    let plan = Arc::new(ExecutableQueryPlan::new(vec![pipeline.clone()], handlers));
    plan.setup(&buffer_pool).expect("plan setup failed");
    plan.start().expect("plan start failed");
    plan.attach_producer();

    let queue = Arc::new(TaskQueue::new(config.task_queue_capacity));
    plan.attach_worker_queue(queue.clone());
    let stop = StopToken::new();
    let worker_pool = WorkerPool::start(
        config.number_of_worker_threads,
        queue.clone(),
        buffer_pool.clone(),
        stop.clone(),
        plan.pipelines().to_vec(),
    );

    let source_stop = stop.clone();
    let source_queue = queue.clone();
    let source_pool = buffer_pool.clone();
    let source_pipeline = pipeline.clone();
    let source_plan = plan.clone();
    let source = std::thread::spawn(move || {
        run_counting_source(source_pipeline, source_queue, source_pool, source_stop, source_plan);
    });

    let sink_buffer_pool = buffer_pool.clone();
    let sink_stop = stop.clone();
    let sink = std::thread::spawn(move || run_stdout_sink(sink_buffer_pool, sink_stop));

    source.join().expect("source thread panicked");
    let result = plan.wait_for_completion();
    tracing::info!(?result, "plan finished");

    stop.request_stop();
    worker_pool.stop();
    let _ = sink.join();
}

/// Emits ten tuples `0..10` as a toy source, tagging them with a single
/// origin so the demo exercises the full scan -> filter -> emit chain,
/// then reports end-of-stream to the plan.
fn run_counting_source(
    pipeline: Arc<Pipeline>,
    queue: Arc<TaskQueue<Task>>,
    buffer_pool: Arc<BufferPool>,
    stop: StopToken,
    plan: Arc<ExecutableQueryPlan>,
) {
    let schema = Schema::new(vec![Field { name: "value".into(), field_type: FieldType::I64 }]).unwrap();
    let layout = MemoryLayout::RowMajor;
    let sequence = AtomicU64::new(0);

    for value in 0..10i64 {
        if stop.is_stopped() {
            return;
        }
        let buffer = match buffer_pool.get_buffer_blocking(&stop) {
            Some(b) => b,
            None => return,
        };
        let offset = layout.field_offset(&schema, buffer.buffer_size(), 0, 0).unwrap();
        buffer.write_at(offset, &value.to_le_bytes()).unwrap();
        buffer.set_number_of_tuples(1);
        buffer.set_origin_id(1);
        buffer.set_sequence_number(sequence.fetch_add(1, Ordering::Relaxed) + 1);
        buffer.set_watermark_ts(value as u64);

        if !queue.add_admission_task_blocking(&stop, Task::new(pipeline.clone(), buffer)) {
            return;
        }
    }

    if let Err(e) = plan.on_producer_eos() {
        tracing::warn!(error = %e, "source failed to report end of stream");
    }
}

/// The worker pool requeues emitted buffers as follow-up tasks rather
/// than handing them to a sink channel directly, so this demo sink just
/// reports pool occupancy on an interval to show the pipeline running.
fn run_stdout_sink(buffer_pool: Arc<BufferPool>, stop: StopToken) {
    while !stop.is_stopped() {
        println!("buffer pool available: {}/{}", buffer_pool.available(), buffer_pool.capacity());
        std::thread::sleep(Duration::from_millis(200));
    }
}
