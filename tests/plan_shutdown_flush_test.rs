// Plan shutdown flush (§8 scenario 3 extended to the worker-pool level):
// an aggregation window whose second configured worker never sees a
// qualifying record before EoS must still resolve when the plan stops,
// instead of leaving the slice staged forever.

use std::sync::Arc;

use nebula_runtime::buffer::{BufferPool, Field, FieldType, MemoryLayout, Schema};
use nebula_runtime::handler::{AggregationHandler, HandlerRegistry, HandlerVariant};
use nebula_runtime::pipeline::{AggregationBuild, AggregationProbe, Emit, Pipeline, Scan, Value};
use nebula_runtime::plan::{ExecutableQueryPlan, PlanResult, PlanState};
use nebula_runtime::stop_token::StopToken;
use nebula_runtime::task_queue::TaskQueue;
use nebula_runtime::worker::Task;

fn sum_merge(existing: Option<&[u8]>, record: &nebula_runtime::pipeline::Record) -> Vec<u8> {
    let current = existing.map(|b| u64::from_le_bytes(b.try_into().unwrap())).unwrap_or(0);
    let delta = record.get("value").and_then(Value::as_u64).unwrap();
    (current + delta).to_le_bytes().to_vec()
}

fn lower(key: &[u8], value: &[u8]) -> nebula_runtime::pipeline::Record {
    let mut record = nebula_runtime::pipeline::Record::new();
    record.insert("key".into(), Value::U64(u64::from_le_bytes(key.try_into().unwrap())));
    record.insert("total".into(), Value::U64(u64::from_le_bytes(value.try_into().unwrap())));
    record
}

#[test]
fn stop_resolves_a_window_the_second_worker_never_touched() {
    let layout = MemoryLayout::RowMajor;
    let input_schema = Schema::new(vec![
        Field { name: "key".into(), field_type: FieldType::U64 },
        Field { name: "ts".into(), field_type: FieldType::U64 },
        Field { name: "value".into(), field_type: FieldType::U64 },
    ])
    .unwrap();
    let output_schema = Schema::new(vec![
        Field { name: "key".into(), field_type: FieldType::U64 },
        Field { name: "total".into(), field_type: FieldType::U64 },
    ])
    .unwrap();

    let mut registry = HandlerRegistry::new();
    let handler_index = registry.register(HandlerVariant::Aggregation(AggregationHandler::new(2, 1000, Arc::new(|_| {}))));
    let handlers = Arc::new(registry);

    let operators: Vec<Box<dyn nebula_runtime::pipeline::Operator>> = vec![
        Box::new(AggregationBuild::new(handler_index, vec!["key".into()], "ts".into(), Arc::new(sum_merge))),
        Box::new(AggregationProbe::new(handler_index, Arc::new(lower))),
        Box::new(Emit::new(0, output_schema.clone(), layout)),
    ];
    let pipeline = Arc::new(Pipeline::new(Scan::new(input_schema.clone(), layout), operators, handlers.clone()));

    let plan = ExecutableQueryPlan::new(vec![pipeline.clone()], handlers);
    let pool = Arc::new(BufferPool::new(1024, 16));
    plan.setup(&pool).unwrap();
    plan.start().unwrap();
    assert_eq!(plan.state(), PlanState::Running);

    let queue = Arc::new(TaskQueue::<Task>::new(8));
    plan.attach_worker_queue(queue.clone());
    plan.attach_producer();

    let stop = StopToken::new();
    let buffer = pool.get_buffer_blocking(&stop).unwrap();
    for (field_index, value) in [(0usize, 42u64), (1, 5), (2, 7)] {
        let offset = layout.field_offset(&input_schema, buffer.buffer_size(), 0, field_index).unwrap();
        buffer.write_at(offset, &value.to_le_bytes()).unwrap();
    }
    buffer.set_number_of_tuples(1);

    // Only worker 0 ever runs a build invocation; worker 1 is configured
    // on the handler but never contributes a record for this window.
    let output = pipeline.invoke(0, &buffer, pool.clone(), stop.clone()).unwrap();
    assert!(output.emitted_buffers.is_empty(), "watermark is 0, nothing should fire yet");
    drop(buffer);

    // Last producer's EoS drives the plan to Stopped, which must flush
    // worker 1's missing contribution and run the probe.
    plan.on_producer_eos().unwrap();
    assert_eq!(plan.state(), PlanState::Stopped);
    assert!(matches!(plan.wait_for_completion(), PlanResult::Ok));

    let flushed = queue.get_next_task_non_blocking().expect("flush should have requeued the merged output buffer");
    let scan = Scan::new(output_schema, layout);
    let records = scan.read_records(&flushed.buffer).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("key").and_then(Value::as_u64), Some(42));
    assert_eq!(records[0].get("total").and_then(Value::as_u64), Some(7));
}
