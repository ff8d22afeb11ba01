//! Latchkit: cancel-aware async synchronization primitives.
//!
//! # Overview
//!
//! Latchkit provides a small family of synchronization primitives for code
//! running under a cooperative task runtime: an exclusive [`sync::Mutex`], a
//! writer-preferring [`sync::RwLock`], auto- and manual-reset events
//! ([`sync::AutoResetEvent`], [`sync::ManualResetEvent`]), and a
//! lazy-initialization cell ([`sync::Lazy`]) with five publication modes.
//!
//! All five share one backbone: a short critical section guarding the
//! primitive's state, a FIFO queue of suspended waiters, a pooled one-shot
//! waiter cell that a caller awaits, and a cancellation protocol that keeps
//! the primitive live when a waiter is cancelled while enqueued or while
//! racing a wakeup.
//!
//! # Core Guarantees
//!
//! - **Claim-once**: a waiter's outcome is decided by exactly one of the
//!   wakeup path and the cancellation path, interlocked by a single CAS.
//! - **No stranded locks**: a cancelled (or dropped) waiter never leaves a
//!   lock permanently held; the loser of the claim race repairs the state.
//! - **FIFO fairness**: waiters of one queue are woken in arrival order; the
//!   rwlock adds writer preference between its two queues.
//! - **No fast-path allocation**: waiters are rented from a bounded free
//!   list after warmup.
//!
//! # Module Structure
//!
//! - [`cancel`]: the cancellation token and its registration primitive
//! - [`sync`]: the five primitives and their shared waiter backbone
//! - [`test_utils`]: logging setup and assertion macros shared by tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_const_for_fn)]

pub mod cancel;
pub mod sync;
pub mod test_utils;

pub use cancel::{CancelRegistration, CancelToken};
pub use sync::{
    AutoResetEvent, EventClosed, InitError, Lazy, LazyError, LazyMode, LockError, ManualResetEvent,
    Mutex, MutexGuard, RwLock, RwLockError, RwLockReadGuard, RwLockWriteGuard, TryLockError,
    TryReadError, TryWriteError, WaitError, WakeMode,
};
