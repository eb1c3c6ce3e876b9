//! Join handler: owns per-side paged vectors and slice stores (§4.7), and
//! the per-(window, partition) completion counter used to decide when a
//! `JoinProbe` may run (Open Questions: `performJoin` is modeled as a
//! property of the probe operator, with the handler exposing `getBucket`
//! plus a claim-based completion counter rather than the legacy direct
//! handler access).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::TerminationType;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    Left,
    Right,
}

const LEFT_SEALED: u8 = 0b01;
const RIGHT_SEALED: u8 = 0b10;
const BOTH_SEALED: u8 = LEFT_SEALED | RIGHT_SEALED;

type Bucket = HashMap<Vec<u8>, Vec<Vec<u8>>>;

pub struct JoinHandler {
    left: DashMap<(u64, u64), Mutex<Bucket>>,
    right: DashMap<(u64, u64), Mutex<Bucket>>,
    completion: DashMap<(u64, u64), AtomicU8>,
    started: AtomicBool,
}

impl JoinHandler {
    pub fn new() -> Self {
        Self {
            left: DashMap::new(),
            right: DashMap::new(),
            completion: DashMap::new(),
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

    fn side_map(&self, side: JoinSide) -> &DashMap<(u64, u64), Mutex<Bucket>> {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    /// Appends a serialized tuple to the per-key bucket for `(window_id,
    /// partition)` on the given side.
    pub fn insert(&self, side: JoinSide, window_id: u64, partition: u64, key: Vec<u8>, tuple: Vec<u8>) {
        let map = self.side_map(side);
        let bucket_lock = map.entry((window_id, partition)).or_insert_with(|| Mutex::new(HashMap::new()));
        bucket_lock.lock().entry(key).or_insert_with(Vec::new).push(tuple);
    }

    /// Returns a snapshot of the tuples under `key` for `(window_id,
    /// partition)` on the given side.
    pub fn get_bucket(&self, side: JoinSide, window_id: u64, partition: u64, key: &[u8]) -> Vec<Vec<u8>> {
        let map = self.side_map(side);
        map.get(&(window_id, partition))
            .and_then(|bucket_lock| bucket_lock.lock().get(key).cloned())
            .unwrap_or_default()
    }

    /// Marks `side` sealed for `(window_id, partition)` (its slice has
    /// passed the watermark and will receive no further inserts). Returns
    /// true exactly once per `(window_id, partition)`: for the call that
    /// observes both sides sealed, signaling the `JoinProbe` operator that
    /// it alone should run the match.
    pub fn seal_side(&self, side: JoinSide, window_id: u64, partition: u64) -> bool {
        let bit = match side {
            JoinSide::Left => LEFT_SEALED,
            JoinSide::Right => RIGHT_SEALED,
        };
        let counter = self
            .completion
            .entry((window_id, partition))
            .or_insert_with(|| AtomicU8::new(0));
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current & bit != 0 {
                // already sealed by a racing caller on the same side
                return false;
            }
            let new_val = current | bit;
            match counter.compare_exchange_weak(current, new_val, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return new_val == BOTH_SEALED,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns the union of keys present on either side for `(window_id,
    /// partition)`, so a probe can enumerate what to look up.
    pub fn all_keys(&self, window_id: u64, partition: u64) -> Vec<Vec<u8>> {
        let mut keys: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
        if let Some(bucket) = self.left.get(&(window_id, partition)) {
            keys.extend(bucket.lock().keys().cloned());
        }
        if let Some(bucket) = self.right.get(&(window_id, partition)) {
            keys.extend(bucket.lock().keys().cloned());
        }
        keys.into_iter().collect()
    }

    /// Force-seals both sides for every `(window_id, partition)` that
    /// still has data on either side, regardless of watermark, so a side
    /// that never sees a final record after the other's watermark passes
    /// doesn't leave the pair stuck half-sealed forever. Returns the pairs
    /// this call newly completed (i.e. a probe should run for them).
    pub fn flush_all(&self) -> Vec<(u64, u64)> {
        let mut keys: std::collections::HashSet<(u64, u64)> = std::collections::HashSet::new();
        for entry in self.left.iter() {
            keys.insert(*entry.key());
        }
        for entry in self.right.iter() {
            keys.insert(*entry.key());
        }
        let mut completed = Vec::new();
        for (window_id, partition) in keys {
            let mut newly_completed = self.seal_side(JoinSide::Left, window_id, partition);
            newly_completed |= self.seal_side(JoinSide::Right, window_id, partition);
            if newly_completed {
                completed.push((window_id, partition));
            }
        }
        completed
    }

    /// Releases per-partition storage once the probe has consumed it.
    pub fn evict(&self, window_id: u64, partition: u64) {
        self.left.remove(&(window_id, partition));
        self.right.remove(&(window_id, partition));
        self.completion.remove(&(window_id, partition));
    }
}

impl Default for JoinHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_fires_only_once_both_sides_sealed() {
        let handler = JoinHandler::new();
        assert!(!handler.seal_side(JoinSide::Left, 1, 0));
        assert!(handler.seal_side(JoinSide::Right, 1, 0));
        // a second, racing seal of the same side must not re-signal
        assert!(!handler.seal_side(JoinSide::Right, 1, 0));
    }

    #[test]
    fn bucket_round_trip() {
        let handler = JoinHandler::new();
        handler.insert(JoinSide::Left, 1, 0, b"k".to_vec(), b"tuple-1".to_vec());
        handler.insert(JoinSide::Left, 1, 0, b"k".to_vec(), b"tuple-2".to_vec());
        let bucket = handler.get_bucket(JoinSide::Left, 1, 0, b"k");
        assert_eq!(bucket, vec![b"tuple-1".to_vec(), b"tuple-2".to_vec()]);
        assert!(handler.get_bucket(JoinSide::Right, 1, 0, b"k").is_empty());
    }

    #[test]
    fn concurrent_seals_yield_exactly_one_winner() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        use std::thread;

        let handler = Arc::new(JoinHandler::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for side in [JoinSide::Left, JoinSide::Right] {
            for _ in 0..8 {
                let handler = handler.clone();
                let winners = winners.clone();
                handles.push(thread::spawn(move || {
                    if handler.seal_side(side, 9, 1) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                }));
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::Relaxed), 1);
    }
}
