//! `TupleBuffer` (§3) — an owned reference into a fixed-capacity region,
//! reference counted, with child buffers for variable-sized payloads.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::pool::PoolInner;
use crate::error::{Result, RuntimeError};

/// A `(childIndex, offset)` pair locating a value inside a child buffer,
/// optionally prefixed by a 32-bit length when the written value itself
/// needs delimiting (strings, nested records).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableSizedAccess {
    pub child_index: u32,
    pub offset: u32,
}

struct Inner {
    mem: Mutex<Vec<u8>>,
    buffer_size: usize,
    number_of_tuples: AtomicU64,
    sequence_number: AtomicU64,
    chunk_number: AtomicU32,
    last_chunk: AtomicBool,
    origin_id: AtomicU64,
    watermark_ts: AtomicU64,
    creation_ts: u64,
    used_memory_size: AtomicUsize,
    children: Mutex<Vec<TupleBuffer>>,
    /// `Some` for pooled buffers: notified on drop so the slot can be reused.
    /// `None` for unpooled (direct-allocated) buffers, which are simply freed.
    home_pool: Option<Weak<PoolInner>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pool) = self.home_pool.as_ref().and_then(Weak::upgrade) {
            pool.reclaim();
        }
    }
}

/// A cheaply cloneable handle to a tuple buffer. Cloning increments the
/// reference count (`Arc`); the underlying region is released back to its
/// home pool (or freed, for unpooled allocations) when the last handle and
/// all buffers holding it as a child are dropped.
#[derive(Clone)]
pub struct TupleBuffer {
    inner: Arc<Inner>,
}

impl TupleBuffer {
    pub(crate) fn new_pooled(buffer_size: usize, home_pool: Weak<PoolInner>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mem: Mutex::new(vec![0u8; buffer_size]),
                buffer_size,
                number_of_tuples: AtomicU64::new(0),
                sequence_number: AtomicU64::new(0),
                chunk_number: AtomicU32::new(1),
                last_chunk: AtomicBool::new(true),
                origin_id: AtomicU64::new(0),
                watermark_ts: AtomicU64::new(0),
                creation_ts: now_millis(),
                used_memory_size: AtomicUsize::new(0),
                children: Mutex::new(Vec::new()),
                home_pool: Some(home_pool),
            }),
        }
    }

    pub(crate) fn new_unpooled(size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                mem: Mutex::new(vec![0u8; size]),
                buffer_size: size,
                number_of_tuples: AtomicU64::new(0),
                sequence_number: AtomicU64::new(0),
                chunk_number: AtomicU32::new(1),
                last_chunk: AtomicBool::new(true),
                origin_id: AtomicU64::new(0),
                watermark_ts: AtomicU64::new(0),
                creation_ts: now_millis(),
                used_memory_size: AtomicUsize::new(0),
                children: Mutex::new(Vec::new()),
                home_pool: None,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn number_of_tuples(&self) -> u64 {
        self.inner.number_of_tuples.load(Ordering::Acquire)
    }

    pub fn set_number_of_tuples(&self, n: u64) {
        self.inner.number_of_tuples.store(n, Ordering::Release);
    }

    pub fn sequence_number(&self) -> u64 {
        self.inner.sequence_number.load(Ordering::Acquire)
    }

    pub fn set_sequence_number(&self, sn: u64) {
        self.inner.sequence_number.store(sn, Ordering::Release);
    }

    pub fn chunk_number(&self) -> u32 {
        self.inner.chunk_number.load(Ordering::Acquire)
    }

    pub fn set_chunk_number(&self, n: u32) {
        self.inner.chunk_number.store(n, Ordering::Release);
    }

    pub fn last_chunk(&self) -> bool {
        self.inner.last_chunk.load(Ordering::Acquire)
    }

    pub fn set_last_chunk(&self, v: bool) {
        self.inner.last_chunk.store(v, Ordering::Release);
    }

    pub fn origin_id(&self) -> u64 {
        self.inner.origin_id.load(Ordering::Acquire)
    }

    pub fn set_origin_id(&self, id: u64) {
        self.inner.origin_id.store(id, Ordering::Release);
    }

    pub fn watermark_ts(&self) -> u64 {
        self.inner.watermark_ts.load(Ordering::Acquire)
    }

    pub fn set_watermark_ts(&self, ts: u64) {
        self.inner.watermark_ts.store(ts, Ordering::Release);
    }

    pub fn creation_ts(&self) -> u64 {
        self.inner.creation_ts
    }

    pub fn used_memory_size(&self) -> usize {
        self.inner.used_memory_size.load(Ordering::Acquire)
    }

    /// Identity for refcount/lifetime audits (§8 buffer-lifetime safety).
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Copy `data` into the buffer at `offset`. The caller (the single
    /// thread currently mutating the buffer, per §4.1) is responsible for
    /// not writing past `numberOfTuples * recordSize`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut mem = self.inner.mem.lock();
        if offset + data.len() > mem.len() {
            return Err(RuntimeError::Internal(format!(
                "write at {offset}..{} exceeds buffer size {}",
                offset + data.len(),
                mem.len()
            )));
        }
        mem[offset..offset + data.len()].copy_from_slice(data);
        self.inner
            .used_memory_size
            .fetch_max(offset + data.len(), Ordering::AcqRel);
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mem = self.inner.mem.lock();
        if offset + len > mem.len() {
            return Err(RuntimeError::Internal(format!(
                "read at {offset}..{} exceeds buffer size {}",
                offset + len,
                mem.len()
            )));
        }
        Ok(mem[offset..offset + len].to_vec())
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.inner.mem.lock().clone()
    }

    /// Append `child` to this buffer's child list, transferring ownership.
    /// Returns the index the child can be retrieved with.
    pub fn store_child_buffer(&self, child: TupleBuffer) -> u32 {
        let mut children = self.inner.children.lock();
        children.push(child);
        (children.len() - 1) as u32
    }

    pub fn load_child_buffer(&self, index: u32) -> Result<TupleBuffer> {
        let children = self.inner.children.lock();
        children
            .get(index as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::Internal(format!("no child buffer at index {index}")))
    }

    pub fn number_of_child_buffers(&self) -> usize {
        self.inner.children.lock().len()
    }

    /// Append `data` to the tail of the last child buffer (creating the
    /// first one if none exist), allocating a new child on overflow. The
    /// caller supplies a fresh unpooled or pooled buffer factory for the
    /// overflow case, mirroring §4.1's "writes append to the tail; overflow
    /// allocates a new child" contract.
    pub fn append_variable_sized(
        &self,
        data: &[u8],
        length_prefixed: bool,
        new_child: impl FnOnce() -> TupleBuffer,
    ) -> Result<VariableSizedAccess> {
        let needed = data.len() + if length_prefixed { 4 } else { 0 };
        let child_index;
        let offset;
        {
            let mut children = self.inner.children.lock();
            if let Some(last) = children.last() {
                let used = last.used_memory_size();
                if used + needed <= last.buffer_size() {
                    child_index = (children.len() - 1) as u32;
                    offset = used;
                } else {
                    let fresh = new_child();
                    children.push(fresh);
                    child_index = (children.len() - 1) as u32;
                    offset = 0;
                }
            } else {
                let fresh = new_child();
                children.push(fresh);
                child_index = 0;
                offset = 0;
            }
        }
        let child = self.load_child_buffer(child_index)?;
        let mut cursor = offset;
        if length_prefixed {
            child.write_at(cursor, &(data.len() as u32).to_le_bytes())?;
            cursor += 4;
        }
        child.write_at(cursor, data)?;
        Ok(VariableSizedAccess { child_index, offset })
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_buffers_are_owned_by_parent() {
        let parent = TupleBuffer::new_unpooled(64);
        let child = TupleBuffer::new_unpooled(64);
        let idx = parent.store_child_buffer(child.clone());
        assert_eq!(idx, 0);
        assert_eq!(parent.number_of_child_buffers(), 1);
        let loaded = parent.load_child_buffer(0).unwrap();
        assert_eq!(loaded.id(), child.id());
    }

    #[test]
    fn write_and_read_round_trip() {
        let buf = TupleBuffer::new_unpooled(64);
        buf.write_at(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.read_at(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn write_past_capacity_errors() {
        let buf = TupleBuffer::new_unpooled(4);
        assert!(buf.write_at(0, &[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn variable_sized_overflow_allocates_new_child() {
        let parent = TupleBuffer::new_unpooled(64);
        let first = parent
            .append_variable_sized(&[0u8; 10], false, || TupleBuffer::new_unpooled(12))
            .unwrap();
        assert_eq!(first.child_index, 0);
        assert_eq!(first.offset, 0);
        // second write doesn't fit in the remaining 2 bytes of the 12-byte child
        let second = parent
            .append_variable_sized(&[0u8; 10], false, || TupleBuffer::new_unpooled(12))
            .unwrap();
        assert_eq!(second.child_index, 1);
        assert_eq!(second.offset, 0);
    }
}
