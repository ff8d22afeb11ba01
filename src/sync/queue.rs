//! FIFO queue of suspended waiters.
//!
//! Enqueue order is wake order. Arbitrary removal (the cancellation path)
//! is O(n) by rental identity; queues here are expected to stay small, so a
//! ring buffer beats an intrusive list.

use std::collections::VecDeque;

use super::waiter::WaiterRef;

/// Ordered waiter queue owned by one primitive's critical section.
#[derive(Debug)]
pub(crate) struct WaitQueue<R> {
    entries: VecDeque<WaiterRef<R>>,
}

impl<R> WaitQueue<R> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn push_back(&mut self, waiter: WaiterRef<R>) {
        self.entries.push_back(waiter);
    }

    pub(crate) fn pop_front(&mut self) -> Option<WaiterRef<R>> {
        self.entries.pop_front()
    }

    /// Removes a specific waiter by rental identity.
    ///
    /// Returns false if the waiter was already dequeued, which tells the
    /// cancellation path it lost the race to a release and must repair the
    /// primitive's state instead.
    pub(crate) fn remove(&mut self, waiter: &WaiterRef<R>) -> bool {
        if let Some(pos) = self.entries.iter().position(|w| w.same_rental(waiter)) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drains every queued waiter in FIFO order (broadcast release).
    pub(crate) fn drain_all(&mut self) -> Vec<WaiterRef<R>> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all queued entries without resolving them.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
