//! Cooperative cancellation (§5): every blocking primitive in this crate —
//! task queue acquisition, buffer pool acquisition, network channel
//! receive — accepts a [`StopToken`] and returns promptly once it is
//! tripped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
