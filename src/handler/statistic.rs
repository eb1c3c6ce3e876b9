//! Statistic handler: owns preallocated counter arrays for sketch-style
//! statistics collection (§4.7).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::TerminationType;
use crate::error::Result;

pub struct StatisticHandler {
    counters: Vec<AtomicU64>,
    started: AtomicBool,
}

impl StatisticHandler {
    pub fn new(number_of_counters: usize) -> Self {
        let mut counters = Vec::with_capacity(number_of_counters);
        counters.resize_with(number_of_counters, || AtomicU64::new(0));
        Self {
            counters,
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

    pub fn increment(&self, index: usize, delta: u64) {
        if let Some(counter) = self.counters.get(index) {
            counter.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.counters.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate_per_bucket() {
        let handler = StatisticHandler::new(4);
        handler.increment(1, 3);
        handler.increment(1, 4);
        handler.increment(2, 1);
        assert_eq!(handler.snapshot(), vec![0, 7, 1, 0]);
    }
}
