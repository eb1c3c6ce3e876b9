//! The explicit context threaded through every operator call, replacing
//! the global singletons (logger, state manager, id generators) the
//! original design used (§9 design notes).

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{BufferPool, TupleBuffer};
use crate::handler::HandlerRegistry;
use crate::stop_token::StopToken;

/// An `Emit` operator's in-progress output buffer, scoped to one
/// invocation. Kept on the context rather than the operator since the
/// same `Emit` instance is shared (behind an `Arc`) across concurrent
/// invocations on different worker threads.
pub struct ActiveOutput {
    pub buffer: TupleBuffer,
    pub rows_written: usize,
}

/// A follow-up unit of work an operator produced while executing, to be
/// turned into a task and pushed back onto the queue by the worker pool
/// (§4.10: "an emit operator may push zero or more internally-generated
/// tasks back onto the queue").
#[derive(Debug, Clone)]
pub enum InternalSignal {
    /// A window's slice-merge task for `(handler_index, start, end)` is
    /// ready to run in the probe pipeline, carrying the completed
    /// multiset of per-worker state fragments to merge (§4.6).
    SliceMergeReady {
        handler_index: usize,
        start: u64,
        end: u64,
        fragments: Vec<std::collections::HashMap<Vec<u8>, Vec<u8>>>,
    },
    /// A join partition has both sides sealed and is ready to be probed.
    JoinReady {
        handler_index: usize,
        window_id: u64,
        partition: u64,
        keys: Vec<Vec<u8>>,
    },
}

/// Per-invocation execution state: metadata carried from the scan leaf,
/// plus the output this invocation accumulates. One `ExecutionContext` is
/// constructed per pipeline invocation and discarded at `close`; it is
/// never shared across worker threads.
pub struct ExecutionContext {
    pub worker_id: usize,
    pub handlers: Arc<HandlerRegistry>,
    pub buffer_pool: Arc<BufferPool>,
    pub stop_token: StopToken,

    pub origin_id: u64,
    pub sequence_number: u64,
    pub watermark_ts: u64,

    emitted_buffers: Vec<TupleBuffer>,
    internal_signals: Vec<InternalSignal>,
    next_chunk_number: u32,
    active_outputs: HashMap<usize, ActiveOutput>,
}

impl ExecutionContext {
    pub fn new(
        worker_id: usize,
        handlers: Arc<HandlerRegistry>,
        buffer_pool: Arc<BufferPool>,
        stop_token: StopToken,
    ) -> Self {
        Self {
            worker_id,
            handlers,
            buffer_pool,
            stop_token,
            origin_id: 0,
            sequence_number: 0,
            watermark_ts: 0,
            emitted_buffers: Vec::new(),
            internal_signals: Vec::new(),
            next_chunk_number: 1,
            active_outputs: HashMap::new(),
        }
    }

    pub fn take_active_output(&mut self, emit_id: usize) -> Option<ActiveOutput> {
        self.active_outputs.remove(&emit_id)
    }

    pub fn put_active_output(&mut self, emit_id: usize, active: ActiveOutput) {
        self.active_outputs.insert(emit_id, active);
    }

    /// Returns the handler registered at `index`, typed by the caller via
    /// `HandlerVariant::as_*`.
    pub fn handler(&self, index: usize) -> crate::error::Result<&crate::handler::HandlerVariant> {
        self.handlers.get(index)
    }

    /// Assigns the next `chunkNumber` for a buffer emitted by this
    /// invocation (§4.4: "the engine assigns `chunkNumber = 1..k`").
    pub fn next_chunk_number(&mut self) -> u32 {
        let n = self.next_chunk_number;
        self.next_chunk_number += 1;
        n
    }

    pub fn emit(&mut self, buffer: TupleBuffer) {
        self.emitted_buffers.push(buffer);
    }

    pub fn signal(&mut self, signal: InternalSignal) {
        self.internal_signals.push(signal);
    }

    pub fn take_emitted_buffers(&mut self) -> Vec<TupleBuffer> {
        std::mem::take(&mut self.emitted_buffers)
    }

    pub fn take_internal_signals(&mut self) -> Vec<InternalSignal> {
        std::mem::take(&mut self.internal_signals)
    }
}
