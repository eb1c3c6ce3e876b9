//! C5 — Watermark Processor (§4.5): per-origin monotone merge into a
//! single global watermark.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;

/// Per-origin tracking of in-order arrival. `nextExpectedSeq` advances only
/// when contiguous sequence numbers have arrived; out-of-order arrivals sit
/// in `pending` until the gap closes.
struct OriginState {
    next_expected_seq: u64,
    latest_in_order_ts: u64,
    pending: BTreeSet<(u64, u64)>,
    terminated: bool,
}

impl OriginState {
    fn new() -> Self {
        Self {
            next_expected_seq: 1,
            latest_in_order_ts: 0,
            pending: BTreeSet::new(),
            terminated: false,
        }
    }

    /// Returns true if `latest_in_order_ts` advanced. A no-op once the
    /// origin is terminated — a terminated origin's contribution is fixed
    /// at `u64::MAX` and never revisits the ordered-sequence gate.
    fn update(&mut self, sequence_number: u64, watermark_ts: u64) -> bool {
        if self.terminated {
            return false;
        }
        self.pending.insert((sequence_number, watermark_ts));
        let mut advanced = false;
        while let Some(&(seq, ts)) = self.pending.iter().next() {
            if seq != self.next_expected_seq {
                break;
            }
            self.pending.remove(&(seq, ts));
            self.latest_in_order_ts = ts;
            self.next_expected_seq += 1;
            advanced = true;
        }
        advanced
    }

    /// Force this origin's contribution to the ceiling, bypassing the
    /// ordered-sequence gate entirely — termination must unblock the
    /// global minimum regardless of what sequence numbers are still
    /// pending.
    fn terminate(&mut self) {
        self.terminated = true;
        self.pending.clear();
        self.latest_in_order_ts = u64::MAX;
    }
}

/// Merges per-origin watermark updates into one monotone global watermark
/// (§4.5: `min over origins(latest_in_order_ts)`).
///
/// Origin termination (§4.5 tie-break note) pins that origin's
/// contribution to the minimum at `u64::MAX` directly, bypassing the
/// ordered-sequence gate, so it never again holds the global watermark
/// back once it has ended — even with sequence numbers still pending.
pub struct WatermarkProcessor {
    origins: Mutex<HashMap<u64, OriginState>>,
    global_watermark: AtomicU64,
}

impl WatermarkProcessor {
    pub fn new(known_origins: impl IntoIterator<Item = u64>) -> Self {
        let mut origins = HashMap::new();
        for origin in known_origins {
            origins.insert(origin, OriginState::new());
        }
        Self {
            origins: Mutex::new(origins),
            global_watermark: AtomicU64::new(0),
        }
    }

    /// Record an `(originId, sequenceNumber, watermarkTs)` update and
    /// return the new global watermark.
    pub fn update(&self, origin_id: u64, sequence_number: u64, watermark_ts: u64) -> u64 {
        let mut origins = self.origins.lock();
        let state = origins.entry(origin_id).or_insert_with(OriginState::new);
        state.update(sequence_number, watermark_ts);
        let global = origins
            .values()
            .map(|o| o.latest_in_order_ts)
            .min()
            .unwrap_or(0);
        drop(origins);
        // Monotone publish: never let a racing update move the watermark
        // backwards, even though per-origin state only ever moves forward.
        let mut current = self.global_watermark.load(Ordering::Acquire);
        while global > current {
            match self.global_watermark.compare_exchange_weak(
                current,
                global,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.global_watermark.load(Ordering::Acquire)
    }

    /// Signal that `origin_id` has ended; it no longer constrains the
    /// global minimum. Bypasses the ordered-sequence gate entirely — an
    /// origin can terminate with sequence numbers still pending.
    pub fn terminate_origin(&self, origin_id: u64) -> u64 {
        let mut origins = self.origins.lock();
        let state = origins.entry(origin_id).or_insert_with(OriginState::new);
        state.terminate();
        let global = origins
            .values()
            .map(|o| o.latest_in_order_ts)
            .min()
            .unwrap_or(0);
        drop(origins);
        let mut current = self.global_watermark.load(Ordering::Acquire);
        while global > current {
            match self.global_watermark.compare_exchange_weak(
                current,
                global,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.global_watermark.load(Ordering::Acquire)
    }

    pub fn global_watermark(&self) -> u64 {
        self.global_watermark.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_origin_advances_only_in_order() {
        let wp = WatermarkProcessor::new([1]);
        assert_eq!(wp.update(1, 2, 20), 0); // sn 2 arrives before sn 1
        assert_eq!(wp.update(1, 1, 10), 20); // gap closes, drains both
    }

    #[test]
    fn global_is_min_across_origins() {
        let wp = WatermarkProcessor::new([1, 2]);
        assert_eq!(wp.update(1, 1, 6), 0); // origin 2 hasn't reported
        assert_eq!(wp.update(2, 1, 11), 6); // min(6, 11) = 6
        assert_eq!(wp.update(1, 2, 11), 11); // min(11, 11) = 11
    }

    #[test]
    fn monotonicity_under_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let wp = Arc::new(WatermarkProcessor::new([1, 2, 3, 4]));
        let mut handles = Vec::new();
        for origin in 1u64..=4 {
            let wp = wp.clone();
            handles.push(thread::spawn(move || {
                for seq in 1u64..=50 {
                    wp.update(origin, seq, seq * 10);
                }
            }));
        }
        let mut last = 0;
        for h in handles {
            h.join().unwrap();
            let now = wp.global_watermark();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn termination_releases_the_minimum() {
        let wp = WatermarkProcessor::new([1, 2]);
        wp.update(1, 1, 100);
        assert_eq!(wp.update(2, 1, 5), 5);
        assert_eq!(wp.terminate_origin(2), 100);
    }
}
