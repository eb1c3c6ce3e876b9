//! Buffer Manager (§4.1): pooled fixed-size allocation plus a direct
//! unpooled allocator for oversized child buffers.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::tuple_buffer::TupleBuffer;
use crate::error::{Result, RuntimeError};
use crate::stop_token::StopToken;

/// Shared pool state. Buffers hold a [`Weak`] reference back here so that
/// dropping the last [`TupleBuffer`] handle returns its slot automatically.
pub(crate) struct PoolInner {
    available: AtomicUsize,
    capacity: usize,
    cond: Condvar,
    cond_lock: Mutex<()>,
}

impl PoolInner {
    pub(crate) fn reclaim(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
        let _guard = self.cond_lock.lock();
        self.cond.notify_one();
    }
}

/// A pool of identically-sized pooled buffers, plus a pass-through to the
/// unpooled allocator for oversized allocations.
pub struct BufferPool {
    inner: Arc<PoolInner>,
    buffer_size: usize,
    unpooled_limit: Option<usize>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, number_of_buffers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                available: AtomicUsize::new(number_of_buffers),
                capacity: number_of_buffers,
                cond: Condvar::new(),
                cond_lock: Mutex::new(()),
            }),
            buffer_size,
            unpooled_limit: None,
        }
    }

    /// Cap the size of `get_unpooled_buffer` requests; `None` means no cap.
    pub fn with_unpooled_limit(mut self, limit: usize) -> Self {
        self.unpooled_limit = Some(limit);
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }

    fn try_take(&self) -> Option<TupleBuffer> {
        let mut current = self.inner.available.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.inner.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(TupleBuffer::new_pooled(
                        self.buffer_size,
                        Arc::downgrade(&self.inner),
                    ))
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Block until a pooled buffer becomes available, or the stop token is
    /// tripped. Never fails otherwise (§4.1).
    pub fn get_buffer_blocking(&self, stop: &StopToken) -> Option<TupleBuffer> {
        loop {
            if let Some(buf) = self.try_take() {
                return Some(buf);
            }
            if stop.is_stopped() {
                return None;
            }
            let guard = self.inner.cond_lock.lock();
            if self.available() > 0 || stop.is_stopped() {
                continue;
            }
            let mut guard = guard;
            self.inner
                .cond
                .wait_for(&mut guard, std::time::Duration::from_millis(50));
        }
    }

    /// Returns `None` immediately on exhaustion rather than blocking.
    pub fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        self.try_take()
    }

    /// Direct allocation outside the pool, independently released on drop.
    pub fn get_unpooled_buffer(&self, size: usize) -> Result<TupleBuffer> {
        if let Some(limit) = self.unpooled_limit {
            if size > limit {
                return Err(RuntimeError::CannotAllocateBuffer(format!(
                    "unpooled request of {size} bytes exceeds limit of {limit}"
                )));
            }
        }
        Ok(TupleBuffer::new_unpooled(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_blocking_returns_none_on_exhaustion() {
        let pool = BufferPool::new(64, 1);
        let _a = pool.get_buffer_no_blocking().unwrap();
        assert!(pool.get_buffer_no_blocking().is_none());
    }

    #[test]
    fn releasing_a_buffer_makes_it_available_again() {
        let pool = BufferPool::new(64, 1);
        let a = pool.get_buffer_no_blocking().unwrap();
        assert!(pool.get_buffer_no_blocking().is_none());
        drop(a);
        assert!(pool.get_buffer_no_blocking().is_some());
    }

    #[test]
    fn blocking_wakes_once_a_slot_frees_up() {
        let pool = Arc::new(BufferPool::new(64, 1));
        let held = pool.get_buffer_no_blocking().unwrap();
        let stop = StopToken::new();
        let pool2 = pool.clone();
        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || pool2.get_buffer_blocking(&stop2));
        std::thread::sleep(std::time::Duration::from_millis(100));
        drop(held);
        let result = handle.join().unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn unpooled_allocation_bypasses_pool_capacity() {
        let pool = BufferPool::new(64, 0).with_unpooled_limit(1024);
        let buf = pool.get_unpooled_buffer(512).unwrap();
        assert_eq!(buf.buffer_size(), 512);
        assert!(pool.get_unpooled_buffer(2048).is_err());
    }
}
