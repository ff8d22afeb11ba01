//! Async mutex with FIFO handoff and cancel-aware acquisition.
//!
//! # Cancel Safety
//!
//! Locking is split into a wait phase and a hold phase:
//! - **Wait**: cancel-safe. A cancelled (or dropped) waiter is removed from
//!   the queue; if it was already selected by a release, the grant is
//!   re-routed to the next waiter so the lock is never stranded.
//! - **Hold**: the guard releases on drop, exactly once.
//!
//! # Fairness
//!
//! Strict FIFO: a release hands the lock directly to the longest-waiting
//! task, and `try_lock` fails while waiters are queued so late arrivals
//! cannot barge.
//!
//! # Example
//!
//! ```ignore
//! use latchkit::{CancelToken, Mutex};
//!
//! let mutex = Mutex::new(42);
//! let mut guard = mutex.lock(&CancelToken::never()).await?;
//! *guard += 1;
//! // guard dropped, lock handed to the next waiter
//! ```

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::task::{Context, Poll};

use crate::cancel::CancelToken;

use super::pool::WaiterPool;
use super::queue::WaitQueue;
use super::waiter::{Claim, WaitOutcome, WaiterRef, WakeBatch, WakeMode};

/// Error returned when an async lock acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The caller's cancellation token fired before the lock was granted.
    Cancelled,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lock acquisition cancelled"),
        }
    }
}

impl std::error::Error for LockError {}

/// Error returned when trying to lock without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockError {
    /// The mutex is held, or waiters are queued ahead of the caller.
    Locked,
}

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "mutex is locked"),
        }
    }
}

impl std::error::Error for TryLockError {}

#[derive(Debug)]
struct MutexState {
    locked: bool,
    waiters: WaitQueue<()>,
    pool: WaiterPool<()>,
}

/// Queue, flag, and pool behind one critical section. Shared with
/// cancellation callbacks, which need to repair state after the acquire
/// future is gone.
#[derive(Debug)]
pub(crate) struct MutexShared {
    state: StdMutex<MutexState>,
    wake_mode: WakeMode,
}

impl MutexShared {
    fn new(wake_mode: WakeMode) -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(MutexState {
                locked: false,
                waiters: WaitQueue::new(),
                pool: WaiterPool::new(),
            }),
            wake_mode,
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MutexState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Release algorithm: hand the lock to the queue head, or clear the
    /// flag. The claim happens outside the critical section; a lost claim
    /// is repaired by the winning cancellation path.
    fn release(&self) {
        let mut batch = WakeBatch::new(self.wake_mode);
        let next = {
            let mut state = self.lock_state();
            match state.waiters.pop_front() {
                Some(waiter) => Some(waiter),
                None => {
                    state.locked = false;
                    None
                }
            }
        };
        if let Some(waiter) = next {
            tracing::trace!("mutex release: handing off to queue head");
            match waiter.try_claim_granted(()) {
                Claim::Won(waker) => batch.push(waker),
                Claim::Lost => {
                    tracing::trace!("mutex release: head was cancelled, claim lost");
                }
            }
        }
    }

    /// Cancellation repair. If the waiter is still queued, removing it is
    /// the whole job. If a release already dequeued it (and lost the claim
    /// race), the lock is effectively unowned: run the release algorithm to
    /// pick the next beneficiary.
    fn repair_after_cancel(&self, waiter: &WaiterRef<()>) {
        let removed = self.lock_state().waiters.remove(waiter);
        if !removed {
            tracing::trace!("mutex cancel: waiter already selected, re-releasing");
            self.release();
        }
    }

    /// Consumed rental goes back to the free list.
    fn finish_rental(&self, waiter: WaiterRef<()>) {
        let slot = waiter.recycle();
        self.lock_state().pool.put_back(slot);
    }
}

/// Ownership of the lock flag, independent of the guarded data. Releases
/// on drop, exactly once.
#[derive(Debug)]
pub(crate) struct Permit {
    shared: Arc<MutexShared>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

enum AcquirePhase {
    Init,
    Waiting(WaiterRef<()>),
    Done,
}

/// Protocol half of a lock acquisition: resolves to a [`Permit`].
///
/// Self-contained (no borrow of the owning mutex), so it can be embedded
/// both in the public [`Lock`] future and in internal serialization gates.
pub(crate) struct Acquire {
    shared: Arc<MutexShared>,
    token: CancelToken,
    phase: AcquirePhase,
}

impl Future for Acquire {
    type Output = Result<Permit, LockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.phase {
            AcquirePhase::Init => {
                if this.token.is_cancelled() {
                    this.phase = AcquirePhase::Done;
                    return Poll::Ready(Err(LockError::Cancelled));
                }

                let waiter = {
                    let mut state = this.shared.lock_state();
                    if !state.locked && state.waiters.is_empty() {
                        state.locked = true;
                        None
                    } else {
                        let waiter = state.pool.rent();
                        waiter.prime(cx.waker());
                        state.waiters.push_back(waiter.clone());
                        Some(waiter)
                    }
                };

                match waiter {
                    None => {
                        tracing::trace!("mutex lock: fast path");
                        this.phase = AcquirePhase::Done;
                        Poll::Ready(Ok(Permit {
                            shared: Arc::clone(&this.shared),
                        }))
                    }
                    Some(waiter) => {
                        tracing::trace!("mutex lock: queued");
                        if this.token.can_be_cancelled() {
                            let shared = Arc::clone(&this.shared);
                            let cb_waiter = waiter.clone();
                            let registration = this.token.register(move || {
                                if let Claim::Won(waker) = cb_waiter.try_claim_cancelled() {
                                    let mut batch = WakeBatch::new(shared.wake_mode);
                                    shared.repair_after_cancel(&cb_waiter);
                                    batch.push(waker);
                                }
                            });
                            waiter.attach_registration(registration);
                        }
                        this.phase = AcquirePhase::Waiting(waiter);
                        Poll::Pending
                    }
                }
            }
            AcquirePhase::Waiting(waiter) => match waiter.poll_outcome(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(outcome) => {
                    let AcquirePhase::Waiting(waiter) =
                        std::mem::replace(&mut this.phase, AcquirePhase::Done)
                    else {
                        unreachable!("phase changed during poll");
                    };
                    this.shared.finish_rental(waiter);
                    match outcome {
                        WaitOutcome::Granted(()) => Poll::Ready(Ok(Permit {
                            shared: Arc::clone(&this.shared),
                        })),
                        WaitOutcome::Cancelled => Poll::Ready(Err(LockError::Cancelled)),
                    }
                }
            },
            AcquirePhase::Done => panic!("lock future polled after completion"),
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let phase = std::mem::replace(&mut self.phase, AcquirePhase::Done);
        let AcquirePhase::Waiting(waiter) = phase else {
            return;
        };

        match waiter.try_claim_cancelled() {
            Claim::Won(_own_waker) => {
                // Nobody resolved us: behave exactly like a fired token.
                self.shared.repair_after_cancel(&waiter);
                let _ = waiter.take_outcome();
                self.shared.finish_rental(waiter);
            }
            Claim::Lost => {
                // A release (or token) beat us. A grant we will never
                // consume must be released again, or the lock is stranded.
                let outcome = waiter.take_outcome();
                self.shared.finish_rental(waiter);
                if matches!(outcome, WaitOutcome::Granted(())) {
                    self.shared.release();
                }
            }
        }
    }
}

/// An async mutex for mutual exclusion.
///
/// Unlike `std::sync::Mutex`, this mutex is held across await points and
/// provides cancel-safe acquisition: cancelling a pending `lock` never
/// leaks the lock or skips a waiter.
#[derive(Debug)]
pub struct Mutex<T> {
    shared: Arc<MutexShared>,
    data: StdRwLock<T>,
}

impl<T> Mutex<T> {
    /// Creates a new unlocked mutex with the default (deferred) wake mode.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_wake_mode(value, WakeMode::default())
    }

    /// Creates a new unlocked mutex with an explicit wake mode.
    #[must_use]
    pub fn with_wake_mode(value: T, wake_mode: WakeMode) -> Self {
        Self {
            shared: MutexShared::new(wake_mode),
            data: StdRwLock::new(value),
        }
    }

    /// Returns true if the mutex is currently locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.shared.lock_state().locked
    }

    /// Returns the number of tasks queued for the lock.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.shared.lock_state().waiters.len()
    }

    /// Protocol-only acquisition used by internal serialization gates.
    pub(crate) fn acquire(&self, token: &CancelToken) -> Acquire {
        Acquire {
            shared: Arc::clone(&self.shared),
            token: token.clone(),
            phase: AcquirePhase::Init,
        }
    }

    /// Acquires the mutex, waiting in FIFO order if necessary.
    ///
    /// If `token` is already cancelled the future fails immediately without
    /// touching the lock state.
    ///
    /// # Errors
    ///
    /// Resolves to [`LockError::Cancelled`] if `token` fires while waiting.
    pub fn lock<'a>(&'a self, token: &CancelToken) -> Lock<'a, T> {
        Lock {
            mutex: self,
            acquire: self.acquire(token),
        }
    }

    /// Tries to acquire the mutex without waiting.
    ///
    /// Fails while waiters are queued, preserving FIFO fairness.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError::Locked`] if the mutex is unavailable.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, TryLockError> {
        {
            let mut state = self.shared.lock_state();
            if state.locked || !state.waiters.is_empty() {
                return Err(TryLockError::Locked);
            }
            state.locked = true;
        }
        Ok(self.guard(Permit {
            shared: Arc::clone(&self.shared),
        }))
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// No locking is needed: `&mut self` proves exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consumes the mutex, returning the underlying data.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds the guard for a caller that owns the permit.
    fn guard(&self, permit: Permit) -> MutexGuard<'_, T> {
        let data = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        MutexGuard { data, permit }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for a held [`Mutex`].
///
/// Dropping the guard releases the lock exactly once and hands it to the
/// next queued waiter. The data borrow is declared first so it is released
/// before the handoff runs.
#[must_use = "the lock is released immediately if the guard is not held"]
pub struct MutexGuard<'a, T> {
    data: std::sync::RwLockWriteGuard<'a, T>,
    permit: Permit,
}

impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard")
            .field("data", &*self.data)
            .finish()
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Future returned by [`Mutex::lock`].
///
/// Dropping a pending `Lock` cleanly abandons the wait; dropping one whose
/// waiter was already granted the lock releases it again.
#[must_use = "futures do nothing unless polled"]
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,
    acquire: Acquire,
}

impl<T> fmt::Debug for Lock<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").finish_non_exhaustive()
    }
}

impl<'a, T> Future for Lock<'a, T> {
    type Output = Result<MutexGuard<'a, T>, LockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.acquire).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(permit)) => Poll::Ready(Ok(this.mutex.guard(permit))),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }
}
