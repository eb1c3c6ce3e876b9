//! C6 — Slice / Window Store (§4.6): thread-local slices draining into a
//! shared staging area, from which slice-merge tasks are emitted exactly
//! once per completed range.
//!
//! Slices are non-overlapping intervals of fixed width (`windowSize` for
//! tumbling windows, `slide` for sliding windows — §4.6); a sliding window
//! is reassembled at probe time by merging `windowSize / slide` consecutive
//! slices, which is the probe operator's concern, not the store's. A given
//! timestamp therefore always falls in exactly one slice of a given store;
//! the "multiple" case in §4.6 refers to multiple concurrently active
//! window definitions, each backed by its own store.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// One time-bounded aggregation slice owned by a single worker thread until
/// it drains into shared staging.
pub struct Slice<S> {
    pub start: u64,
    pub end: u64,
    pub state: S,
}

/// A single worker's view of slices for one window definition, ordered by
/// `sliceEnd`.
pub struct ThreadLocalSliceStore<S> {
    slice_length: u64,
    slices: BTreeMap<u64, Slice<S>>,
}

impl<S> ThreadLocalSliceStore<S> {
    pub fn new(slice_length: u64) -> Self {
        assert!(slice_length > 0, "slice_length must be positive");
        Self {
            slice_length,
            slices: BTreeMap::new(),
        }
    }

    fn slice_start_for(&self, ts: u64) -> u64 {
        (ts / self.slice_length) * self.slice_length
    }

    /// Returns the slice containing `ts`, creating it via `create_fn` if
    /// absent.
    pub fn get_slice_or_create(&mut self, ts: u64, create_fn: impl FnOnce(u64, u64) -> S) -> &mut Slice<S> {
        let start = self.slice_start_for(ts);
        let end = start + self.slice_length;
        self.slices.entry(start).or_insert_with(|| Slice {
            start,
            end,
            state: create_fn(start, end),
        })
    }

    /// Removes and returns every slice whose `end <= watermark`, in
    /// ascending order of `start`.
    pub fn drain_completed(&mut self, watermark: u64) -> Vec<Slice<S>> {
        let completed_starts: Vec<u64> = self
            .slices
            .range(..)
            .filter(|(_, slice)| slice.end <= watermark)
            .map(|(start, _)| *start)
            .collect();
        completed_starts
            .into_iter()
            .filter_map(|start| self.slices.remove(&start))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

struct StagingEntry<S> {
    fragments: Vec<S>,
    contributors: usize,
}

/// A completed, immutable batch of per-worker state fragments for one
/// slice range, ready to be merged by the probe pipeline.
pub struct SliceMergeTask<S> {
    pub start: u64,
    pub end: u64,
    pub fragments: Vec<S>,
}

/// Shared staging area that a fixed population of worker threads drain
/// their thread-local completed slices into. Emits a [`SliceMergeTask`]
/// for a given `(start, end)` exactly once, when every worker has
/// contributed (§4.6 invariant).
pub struct SharedSliceStaging<S> {
    number_of_workers: usize,
    staging: DashMap<(u64, u64), Mutex<StagingEntry<S>>>,
    emitted: DashMap<(u64, u64), ()>,
}

impl<S> SharedSliceStaging<S> {
    pub fn new(number_of_workers: usize) -> Self {
        Self {
            number_of_workers: number_of_workers.max(1),
            staging: DashMap::new(),
            emitted: DashMap::new(),
        }
    }

    pub fn number_of_workers(&self) -> usize {
        self.number_of_workers
    }

    /// Contribute one worker's drained slice state for `[start, end)`.
    /// Returns `Some(task)` iff this contribution was the one that
    /// completed the range (every worker has now contributed); the task
    /// is never returned twice for the same range.
    pub fn contribute(&self, start: u64, end: u64, state: S) -> Option<SliceMergeTask<S>> {
        if self.emitted.contains_key(&(start, end)) {
            // Range already resolved (can happen if a worker had nothing
            // to drain for this range and never calls contribute, while a
            // late straggler still does after merge has fired); drop it.
            return None;
        }
        let entry_lock = self
            .staging
            .entry((start, end))
            .or_insert_with(|| {
                Mutex::new(StagingEntry {
                    fragments: Vec::new(),
                    contributors: 0,
                })
            });
        let mut entry = entry_lock.lock();
        entry.fragments.push(state);
        entry.contributors += 1;
        if entry.contributors >= self.number_of_workers {
            let fragments = std::mem::take(&mut entry.fragments);
            drop(entry);
            if self.emitted.insert((start, end), ()).is_some() {
                return None;
            }
            self.staging.remove(&(start, end));
            return Some(SliceMergeTask { start, end, fragments });
        }
        None
    }
}

/// Compiled per-operator cleanup closure run over a merge task's fragments
/// once the merge result has been emitted, releasing any variable-sized or
/// paged-vector memory the aggregation state holds.
pub type CleanupFn<S> = Arc<dyn Fn(&mut S) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_slice_assignment() {
        let mut store: ThreadLocalSliceStore<u64> = ThreadLocalSliceStore::new(10);
        store.get_slice_or_create(3, |_, _| 0);
        store.get_slice_or_create(7, |_, _| 0); // same slice as ts=3
        store.get_slice_or_create(15, |_, _| 0); // different slice
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn drain_only_removes_completed_slices() {
        let mut store: ThreadLocalSliceStore<u64> = ThreadLocalSliceStore::new(10);
        store.get_slice_or_create(3, |_, _| 1);
        store.get_slice_or_create(15, |_, _| 2);
        let drained = store.drain_completed(10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].start, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn merge_task_fires_exactly_once_when_all_workers_contribute() {
        let staging: SharedSliceStaging<i64> = SharedSliceStaging::new(3);
        assert!(staging.contribute(0, 10, 1).is_none());
        assert!(staging.contribute(0, 10, 2).is_none());
        let task = staging.contribute(0, 10, 3).expect("third contribution completes the range");
        assert_eq!(task.start, 0);
        assert_eq!(task.end, 10);
        assert_eq!(task.fragments.iter().sum::<i64>(), 6);
    }

    #[test]
    fn concurrent_contributions_emit_exactly_one_task() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::thread;

        let staging = Arc::new(SharedSliceStaging::<i64>::new(16));
        let emitted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let staging = staging.clone();
                let emitted = emitted.clone();
                thread::spawn(move || {
                    if staging.contribute(0, 10, i as i64).is_some() {
                        emitted.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(emitted.load(Ordering::Relaxed), 1);
    }
}
