// Graceful stop (§8 scenario 5): a plan with 2 sources, each signaling
// EoS, resolves its completion future to Ok; every buffer taken from the
// pool is returned (refcount audit nets to zero) once the pipeline has
// run to completion.

use nebula_runtime::buffer::{BufferPool, Field, FieldType, MemoryLayout, Schema};
use nebula_runtime::handler::HandlerRegistry;
use nebula_runtime::pipeline::{Emit, Pipeline, Scan};
use nebula_runtime::plan::{ExecutableQueryPlan, PlanResult, PlanState};
use nebula_runtime::stop_token::StopToken;
use std::sync::Arc;

#[test]
fn two_sources_drain_to_ok_with_no_leaked_buffers() {
    let schema = Schema::new(vec![Field { name: "v".into(), field_type: FieldType::I64 }]).unwrap();
    let layout = MemoryLayout::RowMajor;
    let pool = Arc::new(BufferPool::new(1024, 16));
    let handlers = Arc::new(HandlerRegistry::new());

    let scan = Scan::new(schema.clone(), layout);
    let emit = Emit::new(0, schema.clone(), layout);
    let pipeline = Arc::new(Pipeline::new(scan, vec![Box::new(emit)], handlers.clone()));

    let plan = ExecutableQueryPlan::new(vec![pipeline.clone()], handlers);
    plan.setup(&pool).unwrap();
    plan.start().unwrap();
    assert_eq!(plan.state(), PlanState::Running);

    plan.attach_producer();
    plan.attach_producer();

    let stop = StopToken::new();
    for source_id in 0..2u64 {
        let buffer = pool.get_buffer_blocking(&stop).unwrap();
        buffer.set_number_of_tuples(1);
        buffer.set_origin_id(source_id);
        buffer.set_sequence_number(1);
        let output = pipeline.invoke(0, &buffer, pool.clone(), stop.clone()).unwrap();
        // the invocation's own buffer (buffer) and whatever it emitted
        // must both be released once we drop them here.
        drop(output.emitted_buffers);
        drop(buffer);
    }

    plan.on_producer_eos().unwrap();
    assert_eq!(plan.state(), PlanState::Running, "one producer remains");
    plan.on_producer_eos().unwrap();
    assert_eq!(plan.state(), PlanState::Stopped);

    assert!(matches!(plan.wait_for_completion(), PlanResult::Ok));
    assert_eq!(pool.available(), pool.capacity(), "every pooled buffer must have been returned");
}
