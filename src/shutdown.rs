//! Cooperative shutdown flag shared by the poller, the context, and lifecycle handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once, observed everywhere. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
