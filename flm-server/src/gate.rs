//! Accelerator admission control.
//!
//! One process-wide gate serializes every accelerator-exclusive request.
//! While the gate is held, new arrivals queue as deferred tasks up to a
//! bound; past the bound they are refused. Releasing pops the next task
//! under the same lock, so exactly one handler ever faces the device.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tracing::debug;

/// A deferred request: everything needed to run the handler and write the
/// response out-of-line.
pub type DeferredTask = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct GateInner {
    in_use: bool,
    queue: VecDeque<DeferredTask>,
}

pub struct NpuGate {
    inner: Mutex<GateInner>,
    max_queue: usize,
}

impl NpuGate {
    pub fn new(max_queue: usize) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                in_use: false,
                queue: VecDeque::new(),
            }),
            max_queue,
        }
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    /// Atomically take the gate if it is free.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_use {
            return false;
        }
        inner.in_use = true;
        true
    }

    /// Queue a task behind the current holder. `false` means the queue is
    /// at its bound and the request must be refused.
    pub fn try_enqueue(&self, task: DeferredTask) -> bool {
        let mut inner = self.inner.lock();
        if !inner.in_use {
            // Lost a race with release: take the gate and run inline.
            // Callers treat an enqueue on a free gate as immediate.
            inner.in_use = true;
            inner.queue.push_front(task);
            return true;
        }
        if inner.queue.len() >= self.max_queue {
            return false;
        }
        inner.queue.push_back(task);
        debug!(
            target: "flm::server",
            depth = inner.queue.len(),
            bound = self.max_queue,
            "request deferred"
        );
        true
    }

    /// Finish the current holder's turn: either hand the gate to the next
    /// queued task (the gate stays held) or mark it free.
    pub fn release_and_pop(&self) -> Option<DeferredTask> {
        let mut inner = self.inner.lock();
        match inner.queue.pop_front() {
            Some(task) => {
                debug!(
                    target: "flm::server",
                    remaining = inner.queue.len(),
                    "dequeuing deferred request"
                );
                Some(task)
            }
            None => {
                inner.in_use = false;
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().in_use
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop_task() -> DeferredTask {
        Box::new(|| Box::pin(async {}))
    }

    fn counting_task(counter: Arc<AtomicUsize>, tag: usize) -> DeferredTask {
        Box::new(move || {
            Box::pin(async move {
                counter.store(tag, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let gate = NpuGate::new(4);
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert!(gate.release_and_pop().is_none());
        assert!(gate.try_acquire());
    }

    #[test]
    fn test_queue_bound_holds() {
        let gate = NpuGate::new(2);
        assert!(gate.try_acquire());
        assert!(gate.try_enqueue(noop_task()));
        assert!(gate.try_enqueue(noop_task()));
        // The bound is hard: every arrival past it is refused.
        assert!(!gate.try_enqueue(noop_task()));
        assert!(!gate.try_enqueue(noop_task()));
        assert_eq!(gate.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_release_hands_off_in_fifo_order() {
        let gate = NpuGate::new(4);
        let slot = Arc::new(AtomicUsize::new(0));
        assert!(gate.try_acquire());
        assert!(gate.try_enqueue(counting_task(slot.clone(), 1)));
        assert!(gate.try_enqueue(counting_task(slot.clone(), 2)));

        let first = gate.release_and_pop().expect("first waiter");
        // The gate stays held while a dequeued task runs.
        assert!(gate.is_busy());
        first().await;
        assert_eq!(slot.load(Ordering::SeqCst), 1);

        let second = gate.release_and_pop().expect("second waiter");
        second().await;
        assert_eq!(slot.load(Ordering::SeqCst), 2);

        assert!(gate.release_and_pop().is_none());
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_enqueue_on_free_gate_takes_it() {
        let gate = NpuGate::new(1);
        assert!(gate.try_enqueue(noop_task()));
        assert!(gate.is_busy());
        assert!(gate.release_and_pop().is_some());
    }
}
