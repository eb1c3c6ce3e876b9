//! The physical operator catalog (§4.4). Rather than a virtual-dispatch
//! class hierarchy, each operator is a capability record implementing one
//! shared trait (§9 design notes); a pipeline composes them top-down at
//! build time and drives them through a straight-line loop instead of a
//! recursive `executeChild` callback chain — each operator returns the
//! zero-or-more output records it produces, and the pipeline driver folds
//! that over the operator chain.

use std::sync::Arc;

use crate::buffer::{Field, FieldType, MemoryLayout, Schema, TupleBuffer};
use crate::error::{Result, RuntimeError};
use crate::handler::{AggregationHandler, JoinHandler, JoinSide};

use super::context::{ActiveOutput, ExecutionContext, InternalSignal};
use super::record::{record_key, Record, Value};

/// Shared capability surface for every non-leaf operator in a pipeline.
/// Default no-ops match §4.4's lifecycle for operators that don't need a
/// given hook (e.g. `Selection` has nothing to do at `setup`).
pub trait Operator: Send + Sync {
    fn setup(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn open(&self, _ctx: &mut ExecutionContext, _buffer: &TupleBuffer) -> Result<()> {
        Ok(())
    }

    /// Consumes one record, producing the records to feed to the next
    /// operator in the chain (0 for a filtered-out record, 1 for a normal
    /// transform, N for fan-out).
    fn execute(&self, ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>>;

    fn close(&self, _ctx: &mut ExecutionContext, _buffer: &TupleBuffer) -> Result<()> {
        Ok(())
    }

    fn terminate(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Downcast hook so the worker pool can find the `AggregationProbe`
    /// for a signaled handler index without a trait-object registry of its
    /// own. `None` for every operator but `AggregationProbe`.
    fn as_aggregation_probe(&self) -> Option<&AggregationProbe> {
        None
    }

    /// Symmetric downcast hook for `JoinProbe`.
    fn as_join_probe(&self) -> Option<&JoinProbe> {
        None
    }
}

/// The leaf that drives execution: decodes a record buffer according to
/// its memory layout and propagates watermark/sequence metadata into the
/// context (§4.4 Scan).
pub struct Scan {
    schema: Schema,
    layout: MemoryLayout,
}

impl Scan {
    pub fn new(schema: Schema, layout: MemoryLayout) -> Self {
        Self { schema, layout }
    }

    pub fn open(&self, ctx: &mut ExecutionContext, buffer: &TupleBuffer) -> Result<()> {
        ctx.origin_id = buffer.origin_id();
        ctx.sequence_number = buffer.sequence_number();
        ctx.watermark_ts = buffer.watermark_ts();
        Ok(())
    }

    pub fn read_records(&self, buffer: &TupleBuffer) -> Result<Vec<Record>> {
        let number_of_tuples = buffer.number_of_tuples() as usize;
        let mut records = Vec::with_capacity(number_of_tuples);
        for row in 0..number_of_tuples {
            let mut record = Record::new();
            for (field_index, field) in self.schema.fields().iter().enumerate() {
                let offset = self
                    .layout
                    .field_offset(&self.schema, buffer.buffer_size(), row, field_index)?;
                let value = self.decode_field(buffer, field, offset)?;
                record.insert(field.name.clone(), value);
            }
            records.push(record);
        }
        Ok(records)
    }

    fn decode_field(&self, buffer: &TupleBuffer, field: &Field, offset: usize) -> Result<Value> {
        use FieldType::*;
        Ok(match field.field_type {
            I8 => Value::I8(buffer.read_at(offset, 1)?[0] as i8),
            U8 => Value::U8(buffer.read_at(offset, 1)?[0]),
            I16 => Value::I16(i16::from_le_bytes(buffer.read_at(offset, 2)?.try_into().unwrap())),
            U16 => Value::U16(u16::from_le_bytes(buffer.read_at(offset, 2)?.try_into().unwrap())),
            I32 => Value::I32(i32::from_le_bytes(buffer.read_at(offset, 4)?.try_into().unwrap())),
            U32 => Value::U32(u32::from_le_bytes(buffer.read_at(offset, 4)?.try_into().unwrap())),
            I64 => Value::I64(i64::from_le_bytes(buffer.read_at(offset, 8)?.try_into().unwrap())),
            U64 => Value::U64(u64::from_le_bytes(buffer.read_at(offset, 8)?.try_into().unwrap())),
            F32 => Value::F32(f32::from_le_bytes(buffer.read_at(offset, 4)?.try_into().unwrap())),
            F64 => Value::F64(f64::from_le_bytes(buffer.read_at(offset, 8)?.try_into().unwrap())),
            Bool => Value::Bool(buffer.read_at(offset, 1)?[0] != 0),
            Char => Value::U8(buffer.read_at(offset, 1)?[0]),
            VarSized => {
                let descriptor = buffer.read_at(offset, 8)?;
                let child_index = u32::from_le_bytes(descriptor[0..4].try_into().unwrap());
                let child_offset = u32::from_le_bytes(descriptor[4..8].try_into().unwrap()) as usize;
                let child = buffer.load_child_buffer(child_index)?;
                let length_prefix = child.read_at(child_offset, 4)?;
                let length = u32::from_le_bytes(length_prefix.try_into().unwrap()) as usize;
                Value::Bytes(child.read_at(child_offset + 4, length)?)
            }
        })
    }
}

/// Evaluates a boolean predicate; only records it passes continue
/// downstream (§4.4 Selection).
pub struct Selection {
    predicate: Arc<dyn Fn(&Record) -> bool + Send + Sync>,
}

impl Selection {
    pub fn new(predicate: Arc<dyn Fn(&Record) -> bool + Send + Sync>) -> Self {
        Self { predicate }
    }
}

impl Operator for Selection {
    fn execute(&self, _ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>> {
        if (self.predicate)(&record) {
            Ok(vec![record])
        } else {
            Ok(vec![])
        }
    }
}

pub enum ProjectionExpr {
    Rename(String),
    Derive(Arc<dyn Fn(&Record) -> Value + Send + Sync>),
}

/// Rewrites record fields: rename, derive, or implicitly drop anything
/// not named in `exprs` (§4.4 Projection).
pub struct Projection {
    exprs: Vec<(String, ProjectionExpr)>,
}

impl Projection {
    pub fn new(exprs: Vec<(String, ProjectionExpr)>) -> Self {
        Self { exprs }
    }
}

impl Operator for Projection {
    fn execute(&self, _ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>> {
        let mut out = Record::new();
        for (output_name, expr) in &self.exprs {
            let value = match expr {
                ProjectionExpr::Rename(source) => record
                    .get(source)
                    .cloned()
                    .ok_or_else(|| RuntimeError::NotImplemented(format!("missing source field {source}")))?,
                ProjectionExpr::Derive(f) => f(&record),
            };
            out.insert(output_name.clone(), value);
        }
        Ok(vec![out])
    }
}

/// Field-assignment expressions applied in place (§4.4 Map).
pub struct Map {
    assignments: Vec<(String, Arc<dyn Fn(&Record) -> Value + Send + Sync>)>,
}

impl Map {
    pub fn new(assignments: Vec<(String, Arc<dyn Fn(&Record) -> Value + Send + Sync>)>) -> Self {
        Self { assignments }
    }
}

impl Operator for Map {
    fn execute(&self, _ctx: &mut ExecutionContext, mut record: Record) -> Result<Vec<Record>> {
        for (field, f) in &self.assignments {
            let value = f(&record);
            record.insert(field.clone(), value);
        }
        Ok(vec![record])
    }
}

/// Packs outgoing records into output buffers using the output memory
/// layout, dispatching a buffer to the context's emit list whenever it
/// fills and on `close` for whatever remains (§4.4 Emit).
pub struct Emit {
    id: usize,
    schema: Schema,
    layout: MemoryLayout,
}

impl Emit {
    /// `id` must be unique among the `Emit` operators of one pipeline; it
    /// keys the invocation-scoped in-progress buffer on the context.
    pub fn new(id: usize, schema: Schema, layout: MemoryLayout) -> Self {
        Self { id, schema, layout }
    }

    fn encode_field(&self, buffer: &TupleBuffer, offset: usize, field: &Field, value: &Value) -> Result<()> {
        use FieldType::*;
        let bytes: Vec<u8> = match (field.field_type, value) {
            (I8, Value::I8(v)) => v.to_le_bytes().to_vec(),
            (U8, Value::U8(v)) => v.to_le_bytes().to_vec(),
            (I16, Value::I16(v)) => v.to_le_bytes().to_vec(),
            (U16, Value::U16(v)) => v.to_le_bytes().to_vec(),
            (I32, Value::I32(v)) => v.to_le_bytes().to_vec(),
            (U32, Value::U32(v)) => v.to_le_bytes().to_vec(),
            (I64, Value::I64(v)) => v.to_le_bytes().to_vec(),
            (U64, Value::U64(v)) => v.to_le_bytes().to_vec(),
            (F32, Value::F32(v)) => v.to_le_bytes().to_vec(),
            (F64, Value::F64(v)) => v.to_le_bytes().to_vec(),
            (Bool, Value::Bool(v)) => vec![*v as u8],
            (Char, Value::U8(v)) => vec![*v],
            _ => {
                return Err(RuntimeError::NotImplemented(format!(
                    "cannot encode value into field {} of type {:?}",
                    field.name, field.field_type
                )))
            }
        };
        buffer.write_at(offset, &bytes)
    }

    fn finalize(&self, ctx: &mut ExecutionContext, mut active: ActiveOutput, last_chunk: bool) {
        active.buffer.set_number_of_tuples(active.rows_written as u64);
        active.buffer.set_origin_id(ctx.origin_id);
        active.buffer.set_sequence_number(ctx.sequence_number);
        active.buffer.set_watermark_ts(ctx.watermark_ts);
        active.buffer.set_chunk_number(ctx.next_chunk_number());
        active.buffer.set_last_chunk(last_chunk);
        ctx.emit(active.buffer);
    }
}

impl Operator for Emit {
    fn execute(&self, ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>> {
        let mut active = match ctx.take_active_output(self.id) {
            Some(a) => a,
            None => ActiveOutput {
                buffer: ctx
                    .buffer_pool
                    .get_buffer_blocking(&ctx.stop_token)
                    .ok_or_else(|| RuntimeError::CannotAllocateBuffer("emit buffer pool exhausted".into()))?,
                rows_written: 0,
            },
        };
        let capacity = self.schema.capacity(active.buffer.buffer_size()).max(1);
        if active.rows_written >= capacity {
            self.finalize(ctx, active, false);
            active = ActiveOutput {
                buffer: ctx
                    .buffer_pool
                    .get_buffer_blocking(&ctx.stop_token)
                    .ok_or_else(|| RuntimeError::CannotAllocateBuffer("emit buffer pool exhausted".into()))?,
                rows_written: 0,
            };
        }
        for (field_index, field) in self.schema.fields().iter().enumerate() {
            let offset = self
                .layout
                .field_offset(&self.schema, active.buffer.buffer_size(), active.rows_written, field_index)?;
            let value = record
                .get(&field.name)
                .ok_or_else(|| RuntimeError::NotImplemented(format!("emit missing field {}", field.name)))?;
            self.encode_field(&active.buffer, offset, field, value)?;
        }
        active.rows_written += 1;
        ctx.put_active_output(self.id, active);
        Ok(vec![])
    }

    fn close(&self, ctx: &mut ExecutionContext, _buffer: &TupleBuffer) -> Result<()> {
        if let Some(active) = ctx.take_active_output(self.id) {
            self.finalize(ctx, active, true);
        }
        Ok(())
    }
}

/// Per record, computes the time-slice via the pipeline's time function,
/// updates the per-key accumulator in the slice's chained hash map, and
/// on watermark advance signals the shared staging area (§4.4
/// AggregationBuild, §4.6).
pub struct AggregationBuild {
    handler_index: usize,
    key_fields: Vec<String>,
    time_field: String,
    merge: Arc<dyn Fn(Option<&[u8]>, &Record) -> Vec<u8> + Send + Sync>,
}

impl AggregationBuild {
    pub fn new(
        handler_index: usize,
        key_fields: Vec<String>,
        time_field: String,
        merge: Arc<dyn Fn(Option<&[u8]>, &Record) -> Vec<u8> + Send + Sync>,
    ) -> Self {
        Self {
            handler_index,
            key_fields,
            time_field,
            merge,
        }
    }

    fn handler<'a>(&self, ctx: &'a ExecutionContext) -> Result<&'a AggregationHandler> {
        ctx.handler(self.handler_index)?
            .as_aggregation()
            .ok_or_else(|| RuntimeError::NotImplemented("handler is not an AggregationHandler".into()))
    }
}

impl Operator for AggregationBuild {
    fn execute(&self, ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>> {
        let ts = record
            .get(&self.time_field)
            .and_then(Value::as_u64)
            .ok_or_else(|| RuntimeError::NotImplemented(format!("missing/non-integer time field {}", self.time_field)))?;
        let key = record_key(&record, &self.key_fields);
        let worker_id = ctx.worker_id;
        let merge = self.merge.clone();
        let record_ref = &record;
        self.handler(ctx)?
            .update_slice(worker_id, ts, key, |prev| merge(prev, record_ref));
        if ctx.watermark_ts > 0 {
            let tasks = self.handler(ctx)?.drain_and_contribute(worker_id, ctx.watermark_ts);
            for task in tasks {
                ctx.signal(InternalSignal::SliceMergeReady {
                    handler_index: self.handler_index,
                    start: task.start,
                    end: task.end,
                    fragments: task.fragments,
                });
            }
        }
        Ok(vec![])
    }
}

/// On watermark advance, iterates completed slices and lowers per-key
/// state into output records (§4.4 AggregationProbe).
pub struct AggregationProbe {
    handler_index: usize,
    lower: Arc<dyn Fn(&[u8], &[u8]) -> Record + Send + Sync>,
}

impl AggregationProbe {
    pub fn new(handler_index: usize, lower: Arc<dyn Fn(&[u8], &[u8]) -> Record + Send + Sync>) -> Self {
        Self { handler_index, lower }
    }

    pub fn handler_index(&self) -> usize {
        self.handler_index
    }

    /// Called by the worker pool when it dequeues a `SliceMergeReady`
    /// internal task, rather than through the per-record `execute` path:
    /// a merge task already carries the full multiset of fragments, there
    /// is no per-record input left to drive it.
    pub fn probe(&self, ctx: &ExecutionContext, fragments: Vec<std::collections::HashMap<Vec<u8>, Vec<u8>>>) -> Result<Vec<Record>> {
        let _ = ctx.handler(self.handler_index)?; // validates the index exists
        let mut merged: std::collections::HashMap<Vec<u8>, Vec<u8>> = std::collections::HashMap::new();
        for fragment in fragments {
            for (key, value) in fragment {
                merged
                    .entry(key)
                    .and_modify(|existing| {
                        let a = u64::from_le_bytes(existing.as_slice().try_into().unwrap_or([0; 8]));
                        let b = u64::from_le_bytes(value.as_slice().try_into().unwrap_or([0; 8]));
                        *existing = (a + b).to_le_bytes().to_vec();
                    })
                    .or_insert(value);
            }
        }
        Ok(merged.iter().map(|(k, v)| (self.lower)(k, v)).collect())
    }
}

impl Operator for AggregationProbe {
    fn execute(&self, _ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>> {
        // Not driven through the per-record path; records arrive only via
        // `probe` above.
        Ok(vec![record])
    }

    fn as_aggregation_probe(&self) -> Option<&AggregationProbe> {
        Some(self)
    }
}

/// Stores tuples in a paged vector keyed by the join key, symmetric per
/// side (§4.4 JoinBuild).
pub struct JoinBuild {
    handler_index: usize,
    side: JoinSide,
    key_fields: Vec<String>,
    window_size: u64,
    time_field: String,
    encode: Arc<dyn Fn(&Record) -> Vec<u8> + Send + Sync>,
}

impl JoinBuild {
    pub fn new(
        handler_index: usize,
        side: JoinSide,
        key_fields: Vec<String>,
        window_size: u64,
        time_field: String,
        encode: Arc<dyn Fn(&Record) -> Vec<u8> + Send + Sync>,
    ) -> Self {
        Self {
            handler_index,
            side,
            key_fields,
            window_size,
            time_field,
            encode,
        }
    }

    fn handler<'a>(&self, ctx: &'a ExecutionContext) -> Result<&'a JoinHandler> {
        ctx.handler(self.handler_index)?
            .as_join()
            .ok_or_else(|| RuntimeError::NotImplemented("handler is not a JoinHandler".into()))
    }
}

impl Operator for JoinBuild {
    fn execute(&self, ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>> {
        let ts = record
            .get(&self.time_field)
            .and_then(Value::as_u64)
            .ok_or_else(|| RuntimeError::NotImplemented(format!("missing/non-integer time field {}", self.time_field)))?;
        let window_id = ts / self.window_size;
        let key = record_key(&record, &self.key_fields);
        let tuple = (self.encode)(&record);
        self.handler(ctx)?.insert(self.side, window_id, 0, key, tuple);
        if ctx.watermark_ts >= (window_id + 1) * self.window_size {
            let handler = self.handler(ctx)?;
            if handler.seal_side(self.side, window_id, 0) {
                let keys = handler.all_keys(window_id, 0);
                ctx.signal(InternalSignal::JoinReady {
                    handler_index: self.handler_index,
                    window_id,
                    partition: 0,
                    keys,
                });
            }
        }
        Ok(vec![])
    }
}

/// Emits matches once both sides' slices are sealed (§4.4 JoinProbe).
pub struct JoinProbe {
    handler_index: usize,
    key_fields: Vec<String>,
    decode_left: Arc<dyn Fn(&[u8]) -> Record + Send + Sync>,
    decode_right: Arc<dyn Fn(&[u8]) -> Record + Send + Sync>,
    combine: Arc<dyn Fn(&Record, &Record) -> Record + Send + Sync>,
}

impl JoinProbe {
    pub fn new(
        handler_index: usize,
        key_fields: Vec<String>,
        decode_left: Arc<dyn Fn(&[u8]) -> Record + Send + Sync>,
        decode_right: Arc<dyn Fn(&[u8]) -> Record + Send + Sync>,
        combine: Arc<dyn Fn(&Record, &Record) -> Record + Send + Sync>,
    ) -> Self {
        Self {
            handler_index,
            key_fields,
            decode_left,
            decode_right,
            combine,
        }
    }

    pub fn handler_index(&self) -> usize {
        self.handler_index
    }

    pub fn probe(&self, ctx: &ExecutionContext, window_id: u64, partition: u64, keys: &[Vec<u8>]) -> Result<Vec<Record>> {
        let handler = ctx
            .handler(self.handler_index)?
            .as_join()
            .ok_or_else(|| RuntimeError::NotImplemented("handler is not a JoinHandler".into()))?;
        let mut out = Vec::new();
        for key in keys {
            let left_bucket = handler.get_bucket(JoinSide::Left, window_id, partition, key);
            let right_bucket = handler.get_bucket(JoinSide::Right, window_id, partition, key);
            for left_bytes in &left_bucket {
                let left_record = (self.decode_left)(left_bytes);
                for right_bytes in &right_bucket {
                    let right_record = (self.decode_right)(right_bytes);
                    out.push((self.combine)(&left_record, &right_record));
                }
            }
        }
        handler.evict(window_id, partition);
        Ok(out)
    }
}

impl Operator for JoinProbe {
    fn execute(&self, _ctx: &mut ExecutionContext, record: Record) -> Result<Vec<Record>> {
        Ok(vec![record])
    }

    fn as_join_probe(&self) -> Option<&JoinProbe> {
        Some(self)
    }
}
