//! Synchronization primitives built on a pooled-waiter backbone.
//!
//! # Primitives
//!
//! - [`Mutex`]: exclusive async lock with strict FIFO handoff
//! - [`RwLock`]: shared/exclusive lock with writer preference
//! - [`AutoResetEvent`]: signal that releases exactly one waiter per set
//! - [`ManualResetEvent`]: signal that releases all waiters until reset
//! - [`Lazy`]: single-initialization cell with five publication modes
//!
//! # The Backbone
//!
//! Every primitive follows the same shape. An acquire operation either
//! completes synchronously under a short critical section (fast path) or
//! rents a waiter from the primitive's free list, appends it to a FIFO
//! queue, binds the caller's cancellation token, and suspends. A release
//! operation selects zero or more waiters under the same critical section
//! and resolves them *outside* it, so no waiter callback ever re-enters the
//! primitive while its lock is held.
//!
//! Resolution is a single-bit claim: the wakeup path and the cancellation
//! path race through one CAS, and the loser backs off. When the loser is
//! the wakeup path, the cancellation callback repairs the primitive's state
//! so the resource is never stranded.
//!
//! # Cancel Safety
//!
//! - Cancellation while queued: the waiter is removed, no resource is held.
//! - Cancellation racing a grant: the claim CAS decides; a lost grant is
//!   re-routed to the next waiter.
//! - Dropping a pending acquire future behaves like cancellation; dropping
//!   one that already won a lock releases the lock.

mod event;
mod lazy;
mod mutex;
mod pool;
mod queue;
mod rwlock;
mod waiter;

pub use event::{AutoResetEvent, AutoWait, EventClosed, ManualResetEvent, ManualWait, WaitError};
pub use lazy::{InitError, Lazy, LazyError, LazyMode};
pub use mutex::{Lock, LockError, Mutex, MutexGuard, TryLockError};
pub use rwlock::{
    Read, RwLock, RwLockError, RwLockReadGuard, RwLockWriteGuard, TryReadError, TryWriteError,
    Write,
};
pub use waiter::WakeMode;
