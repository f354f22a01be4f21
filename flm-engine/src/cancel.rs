//! Cooperative cancellation.
//!
//! One atomic flag per request; handlers poll it at the start of prefill,
//! at every decode step and before each streaming chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_sticky_and_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.cancelled());
        handle.cancel();
        assert!(clone.cancelled());
        assert!(handle.cancelled());
    }
}
