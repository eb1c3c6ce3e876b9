//! Aggregation handler: owns the shared slice-and-window store plus the
//! compiled cleanup closure (§4.7).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use super::TerminationType;
use crate::error::Result;
use crate::window::{SharedSliceStaging, SliceMergeTask, ThreadLocalSliceStore};

/// One key's accumulator state, kept as opaque bytes so the handler does
/// not need to be generic over every aggregation function's result type;
/// operators serialize/deserialize their own accumulators (Open Questions:
/// a plain chained hash map keyed by the key-field bytes is sufficient —
/// the tagged-pointer optimization in the legacy header is correctness-
/// neutral and omitted).
pub type AggregationSlice = HashMap<Vec<u8>, Vec<u8>>;

pub type CleanupFn = Arc<dyn Fn(&mut AggregationSlice) + Send + Sync>;

pub struct AggregationHandler {
    staging: SharedSliceStaging<AggregationSlice>,
    local_stores: DashMap<usize, Mutex<ThreadLocalSliceStore<AggregationSlice>>>,
    /// Every `(start, end)` range any worker has ever created a slice for,
    /// independent of which worker. Lets a worker that never itself saw a
    /// record in a given range still contribute an empty fragment for it
    /// once the watermark passes that range's end (§4.6 invariant requires
    /// literally `number_of_workers` contributions, not "however many
    /// workers happened to see qualifying records").
    known_ranges: DashSet<(u64, u64)>,
    /// Per-worker set of range starts already contributed (real or empty),
    /// so a worker invoked repeatedly after a range completes doesn't
    /// contribute to it more than once.
    contributed_ranges: DashMap<usize, Mutex<BTreeSet<u64>>>,
    slice_length: u64,
    cleanup: CleanupFn,
    started: AtomicBool,
}

impl AggregationHandler {
    pub fn new(number_of_workers: usize, slice_length: u64, cleanup: CleanupFn) -> Self {
        Self {
            staging: SharedSliceStaging::new(number_of_workers),
            local_stores: DashMap::new(),
            known_ranges: DashSet::new(),
            contributed_ranges: DashMap::new(),
            slice_length,
            cleanup,
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self, _termination: TerminationType) -> Result<()> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    /// Looks up (creating if absent) the slice containing `ts` in the
    /// calling worker's thread-local store, runs `update` against its key
    /// map, and returns. The closure decides how to merge a new record
    /// into the per-key accumulator bytes.
    pub fn update_slice(
        &self,
        worker_id: usize,
        ts: u64,
        key: Vec<u8>,
        update: impl FnOnce(Option<&[u8]>) -> Vec<u8>,
    ) {
        let store_lock = self
            .local_stores
            .entry(worker_id)
            .or_insert_with(|| Mutex::new(ThreadLocalSliceStore::new(self.slice_length)));
        let mut store = store_lock.lock();
        let slice = store.get_slice_or_create(ts, |start, end| {
            self.known_ranges.insert((start, end));
            HashMap::new()
        });
        let new_value = update(slice.state.get(&key).map(|v| v.as_slice()));
        slice.state.insert(key, new_value);
    }

    /// Drains `worker_id`'s own completed slices (`end <= watermark`), then
    /// walks every range any worker has ever created (`known_ranges`) that
    /// has also completed and contributes an empty fragment on `worker_id`'s
    /// behalf for whichever of those it didn't itself populate — so a
    /// range reaches its required `number_of_workers` contributions purely
    /// from the watermark advancing, never from requiring every worker to
    /// have seen a qualifying record. Returns any slice-merge tasks this
    /// call completed.
    pub fn drain_and_contribute(&self, worker_id: usize, watermark: u64) -> Vec<SliceMergeTask<AggregationSlice>> {
        let store_lock = self
            .local_stores
            .entry(worker_id)
            .or_insert_with(|| Mutex::new(ThreadLocalSliceStore::new(self.slice_length)));
        let mut completed_by_worker: HashMap<(u64, u64), AggregationSlice> = {
            let mut store = store_lock.lock();
            store
                .drain_completed(watermark)
                .into_iter()
                .map(|slice| ((slice.start, slice.end), slice.state))
                .collect()
        };

        let contributed_lock = self
            .contributed_ranges
            .entry(worker_id)
            .or_insert_with(|| Mutex::new(BTreeSet::new()));
        let mut contributed = contributed_lock.lock();

        let mut tasks = Vec::new();
        for entry in self.known_ranges.iter() {
            let (start, end) = *entry.key();
            if end > watermark || contributed.contains(&start) {
                continue;
            }
            let state = completed_by_worker.remove(&(start, end)).unwrap_or_default();
            contributed.insert(start);
            if let Some(task) = self.staging.contribute(start, end, state) {
                tasks.push(task);
            }
        }
        tasks
    }

    /// Runs the compiled cleanup closure over every fragment of a
    /// completed merge task, releasing variable-sized/paged-vector memory
    /// (§4.6 Cleanup).
    pub fn cleanup(&self, task: &mut SliceMergeTask<AggregationSlice>) {
        for fragment in &mut task.fragments {
            (self.cleanup)(fragment);
        }
    }

    pub fn number_of_local_stores(&self) -> usize {
        self.local_stores.len()
    }

    pub fn number_of_workers(&self) -> usize {
        self.staging.number_of_workers()
    }

    /// Forces every configured worker — not just the ones that actually ran
    /// — to contribute its completed slices for every known range,
    /// regardless of watermark. Used at plan shutdown to resolve any range
    /// still short of its full contributor count (because a worker's local
    /// store never saw a qualifying record, or the worker never ran at
    /// all) rather than leaving it staged forever.
    pub fn flush_all(&self) -> Vec<SliceMergeTask<AggregationSlice>> {
        let mut tasks = Vec::new();
        for worker_id in 0..self.number_of_workers() {
            tasks.extend(self.drain_and_contribute(worker_id, u64::MAX));
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_merge(existing: Option<&[u8]>, delta: u64) -> Vec<u8> {
        let current = existing
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or(0);
        (current + delta).to_le_bytes().to_vec()
    }

    #[test]
    fn two_workers_both_must_contribute_before_merge_fires() {
        let handler = AggregationHandler::new(2, 10, Arc::new(|_| {}));
        handler.update_slice(0, 3, b"x".to_vec(), |prev| sum_merge(prev, 1));
        handler.update_slice(1, 4, b"x".to_vec(), |prev| sum_merge(prev, 10));

        let mut tasks = handler.drain_and_contribute(0, 10);
        assert!(tasks.is_empty(), "first contributor must not yet complete the range");
        tasks.extend(handler.drain_and_contribute(1, 10));
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        let total: u64 = task
            .fragments
            .iter()
            .flat_map(|frag| frag.get(b"x".as_slice()))
            .map(|bytes| u64::from_le_bytes(bytes.as_slice().try_into().unwrap()))
            .sum();
        assert_eq!(total, 11);
    }
}
