//! C4 — Physical Operator Pipeline (§4.4): a linear chain of operators
//! with a single scan leaf driving execution.

pub mod context;
pub mod operators;
pub mod record;

pub use context::{ExecutionContext, InternalSignal};
pub use operators::{
    AggregationBuild, AggregationProbe, Emit, JoinBuild, JoinProbe, Map, Operator, Projection, ProjectionExpr, Scan,
    Selection,
};
pub use record::{Record, Value};

use std::sync::Arc;

use crate::buffer::{BufferPool, TupleBuffer};
use crate::error::{Result, RuntimeError};
use crate::handler::HandlerRegistry;
use crate::stop_token::StopToken;

/// Everything one pipeline invocation produced: buffers to dispatch
/// downstream, and internal signals for the worker pool to turn into
/// follow-up tasks (§4.10).
pub struct InvocationOutput {
    pub emitted_buffers: Vec<TupleBuffer>,
    pub internal_signals: Vec<InternalSignal>,
}

/// A compiled pipeline: `scan` is the single leaf driving execution;
/// `operators` is the straight-line chain every decoded record flows
/// through top-down (§4.4). Execution of one invocation is single-
/// threaded; multiple threads may invoke the same `Pipeline` concurrently
/// since all mutable per-invocation state lives on [`ExecutionContext`],
/// never on the operators themselves.
pub struct Pipeline {
    scan: Scan,
    operators: Vec<Box<dyn Operator>>,
    handlers: Arc<HandlerRegistry>,
}

impl Pipeline {
    pub fn new(scan: Scan, operators: Vec<Box<dyn Operator>>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { scan, operators, handlers }
    }

    /// Runs `setup` on every operator once, at plan build time.
    pub fn setup(&self, buffer_pool: &Arc<BufferPool>) -> Result<()> {
        let ctx = ExecutionContext::new(0, self.handlers.clone(), buffer_pool.clone(), StopToken::new());
        for op in &self.operators {
            op.setup(&ctx)?;
        }
        Ok(())
    }

    /// `open` top-down, `execute` per record, `close` bottom-up — the
    /// worker loop body described in §4.10.
    pub fn invoke(&self, worker_id: usize, buffer: &TupleBuffer, buffer_pool: Arc<BufferPool>, stop: StopToken) -> Result<InvocationOutput> {
        let mut ctx = ExecutionContext::new(worker_id, self.handlers.clone(), buffer_pool, stop);
        self.scan.open(&mut ctx, buffer)?;
        for op in &self.operators {
            op.open(&mut ctx, buffer)?;
        }

        let records = self.scan.read_records(buffer)?;
        for record in records {
            let mut batch = vec![record];
            for op in &self.operators {
                if batch.is_empty() {
                    break;
                }
                let mut next_batch = Vec::with_capacity(batch.len());
                for r in batch {
                    next_batch.extend(op.execute(&mut ctx, r)?);
                }
                batch = next_batch;
            }
        }

        for op in self.operators.iter().rev() {
            op.close(&mut ctx, buffer)?;
        }

        Ok(InvocationOutput {
            emitted_buffers: ctx.take_emitted_buffers(),
            internal_signals: ctx.take_internal_signals(),
        })
    }

    /// Finds this pipeline's `AggregationProbe` for `handler_index` (if
    /// any), runs it against `fragments`, and folds the resulting records
    /// through whatever operators follow the probe in the chain — the same
    /// open/execute/close shape `invoke` uses, just starting mid-chain
    /// since there is no scan buffer driving this invocation. Returns
    /// `None` if this pipeline has no probe for that handler (the worker
    /// pool tries every pipeline in the plan).
    pub fn drive_aggregation_probe(
        &self,
        worker_id: usize,
        handler_index: usize,
        fragments: Vec<std::collections::HashMap<Vec<u8>, Vec<u8>>>,
        buffer_pool: Arc<BufferPool>,
        stop: StopToken,
    ) -> Result<Option<InvocationOutput>> {
        let Some(op_index) = self
            .operators
            .iter()
            .position(|op| op.as_aggregation_probe().map_or(false, |p| p.handler_index() == handler_index))
        else {
            return Ok(None);
        };
        let mut ctx = ExecutionContext::new(worker_id, self.handlers.clone(), buffer_pool.clone(), stop);
        let probe = self.operators[op_index].as_aggregation_probe().expect("checked above");
        let batch = probe.probe(&ctx, fragments)?;
        let output = self.drive_downstream(&mut ctx, op_index, batch, &buffer_pool)?;
        Ok(Some(output))
    }

    /// Symmetric to [`Self::drive_aggregation_probe`] for `JoinProbe`.
    pub fn drive_join_probe(
        &self,
        worker_id: usize,
        handler_index: usize,
        window_id: u64,
        partition: u64,
        keys: &[Vec<u8>],
        buffer_pool: Arc<BufferPool>,
        stop: StopToken,
    ) -> Result<Option<InvocationOutput>> {
        let Some(op_index) = self
            .operators
            .iter()
            .position(|op| op.as_join_probe().map_or(false, |p| p.handler_index() == handler_index))
        else {
            return Ok(None);
        };
        let mut ctx = ExecutionContext::new(worker_id, self.handlers.clone(), buffer_pool.clone(), stop);
        let probe = self.operators[op_index].as_join_probe().expect("checked above");
        let batch = probe.probe(&ctx, window_id, partition, keys)?;
        let output = self.drive_downstream(&mut ctx, op_index, batch, &buffer_pool)?;
        Ok(Some(output))
    }

    /// Folds `batch` through every operator after `op_index`, then closes
    /// that suffix of the chain bottom-up (mirrors the tail half of
    /// `invoke`, starting from a probe's output instead of a scan).
    fn drive_downstream(
        &self,
        ctx: &mut ExecutionContext,
        op_index: usize,
        mut batch: Vec<Record>,
        buffer_pool: &Arc<BufferPool>,
    ) -> Result<InvocationOutput> {
        for op in &self.operators[op_index + 1..] {
            if batch.is_empty() {
                break;
            }
            let mut next_batch = Vec::with_capacity(batch.len());
            for record in batch {
                next_batch.extend(op.execute(ctx, record)?);
            }
            batch = next_batch;
        }

        // `close` on the probe-and-after suffix; nothing downstream of a
        // probe reads the buffer argument (only `Emit::close` does, and it
        // ignores it), so an unpooled placeholder is sufficient.
        let dummy = buffer_pool.get_unpooled_buffer(1)?;
        for op in self.operators[op_index..].iter().rev() {
            op.close(ctx, &dummy)?;
        }

        Ok(InvocationOutput {
            emitted_buffers: ctx.take_emitted_buffers(),
            internal_signals: ctx.take_internal_signals(),
        })
    }

    /// Drives any slice-merge/join-probe work this pipeline's handlers
    /// still hold to completion, regardless of watermark. Called once at
    /// plan shutdown so a range or window short of its full contributor
    /// count at end-of-stream still resolves instead of staying staged
    /// forever; ordinary operation never needs this since `AggregationBuild`
    /// and `JoinBuild` already drive completion off the live watermark.
    pub fn flush_pending_merges(&self, buffer_pool: Arc<BufferPool>, stop: StopToken) -> Result<InvocationOutput> {
        let mut emitted_buffers = Vec::new();
        let mut internal_signals = Vec::new();

        for op in &self.operators {
            if let Some(probe) = op.as_aggregation_probe() {
                let handler = self
                    .handlers
                    .get(probe.handler_index())?
                    .as_aggregation()
                    .ok_or_else(|| RuntimeError::NotImplemented("handler is not an AggregationHandler".into()))?;
                for task in handler.flush_all() {
                    if let Some(output) = self.drive_aggregation_probe(
                        0,
                        probe.handler_index(),
                        task.fragments,
                        buffer_pool.clone(),
                        stop.clone(),
                    )? {
                        emitted_buffers.extend(output.emitted_buffers);
                        internal_signals.extend(output.internal_signals);
                    }
                }
            }
            if let Some(probe) = op.as_join_probe() {
                let handler = self
                    .handlers
                    .get(probe.handler_index())?
                    .as_join()
                    .ok_or_else(|| RuntimeError::NotImplemented("handler is not a JoinHandler".into()))?;
                for (window_id, partition) in handler.flush_all() {
                    let keys = handler.all_keys(window_id, partition);
                    if let Some(output) =
                        self.drive_join_probe(0, probe.handler_index(), window_id, partition, &keys, buffer_pool.clone(), stop.clone())?
                    {
                        emitted_buffers.extend(output.emitted_buffers);
                        internal_signals.extend(output.internal_signals);
                    }
                }
            }
        }

        Ok(InvocationOutput { emitted_buffers, internal_signals })
    }

    pub fn terminate(&self) -> Result<()> {
        let ctx = ExecutionContext::new(0, self.handlers.clone(), self.dummy_pool(), StopToken::new());
        for op in &self.operators {
            op.terminate(&ctx)?;
        }
        Ok(())
    }

    fn dummy_pool(&self) -> Arc<BufferPool> {
        // terminate() needs a context but never touches the pool; a
        // zero-capacity pool is sufficient and cheap.
        Arc::new(BufferPool::new(1, 0))
    }
}
