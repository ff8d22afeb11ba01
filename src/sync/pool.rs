//! Bounded free list of waiter slots.
//!
//! Renting pops an idle slot (or allocates on a cold start); returning
//! pushes it back unless the list is full. Under steady load every acquire
//! after warmup reuses a slot, so the slow path allocates nothing.
//!
//! The pool has no synchronization of its own: for the locks it lives
//! inside the primitive's critical-section state, and for the events it
//! sits beside the queue under the queue mutex.

use std::sync::Arc;

use super::waiter::{WaitSlot, WaiterRef};

/// Idle slots kept for reuse per primitive.
const MAX_IDLE: usize = 64;

#[derive(Debug)]
pub(crate) struct WaiterPool<R> {
    idle: Vec<Arc<WaitSlot<R>>>,
}

impl<R> WaiterPool<R> {
    pub(crate) fn new() -> Self {
        Self { idle: Vec::new() }
    }

    /// Hands out a freshly reset slot pinned to its current version.
    pub(crate) fn rent(&mut self) -> WaiterRef<R> {
        let slot = self
            .idle
            .pop()
            .unwrap_or_else(|| Arc::new(WaitSlot::new()));
        WaiterRef::new(slot)
    }

    /// Returns a recycled slot; full pools drop the slot instead.
    pub(crate) fn put_back(&mut self, slot: Arc<WaitSlot<R>>) {
        if self.idle.len() < MAX_IDLE {
            self.idle.push(slot);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Drops every idle slot (primitive shutdown).
    pub(crate) fn clear(&mut self) {
        self.idle.clear();
    }
}
