//! Async read-write lock with writer preference and cancel-aware waiting.
//!
//! Multiple readers share the lock; a writer holds it exclusively. The
//! policy is **writer-preference**: a reader is only admitted on the fast
//! path while no writer is active *or queued*, so a steady stream of
//! readers cannot starve a writer.
//!
//! | Scenario                  | Behavior                                   |
//! |---------------------------|--------------------------------------------|
//! | No writers around         | Readers acquire immediately                |
//! | Writer queued             | New readers queue behind it                |
//! | Readers active + writer   | Writer waits for the readers to release    |
//! | Multiple writers          | Writers are granted in FIFO order          |
//!
//! # Cancel Safety
//!
//! Cancelling a queued waiter removes it from its queue. If the waiter had
//! already been selected by a release (the claim race), the cancellation
//! path behaves as if the waiter had acquired and instantly released:
//! it repairs the reader count or writer flag and re-runs the release
//! algorithm so the lock can never be left permanently held.
//!
//! # Wake Delivery
//!
//! Reader and writer wakeups carry independent [`WakeMode`] flags, set at
//! construction.

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

/// Error returned when an async read or write acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwLockError {
    /// The caller's cancellation token fired before the lock was granted.
    Cancelled,
}

impl fmt::Display for RwLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "rwlock acquisition cancelled"),
        }
    }
}

impl std::error::Error for RwLockError {}

/// Error returned when trying to read without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryReadError {
    /// A writer is active or queued.
    Locked,
}

impl fmt::Display for TryReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "rwlock is write-locked or a writer is queued"),
        }
    }
}

impl std::error::Error for TryReadError {}

/// Error returned when trying to write without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryWriteError {
    /// Readers or a writer currently hold the lock.
    Locked,
}

impl fmt::Display for TryWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "rwlock is locked"),
        }
    }
}

impl std::error::Error for TryWriteError {}

/// Which side of the lock a waiter belongs to. Decides both the repair
/// applied on a lost claim race and the wake mode of its wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterClass {
    Reader,
    Writer,
}

#[derive(Debug)]
struct RwState {
    reader_count: u32,
    writer_active: bool,
    reader_queue: WaitQueue<()>,
    writer_queue: WaitQueue<()>,
    pool: WaiterPool<()>,
}

/// Waiters selected by one pass of the release algorithm; claims happen
/// after the critical section is exited.
enum Handoff {
    Nobody,
    Writer(WaiterRef<()>),
    Readers(Vec<WaiterRef<()>>),
}

#[derive(Debug)]
struct RwShared {
    state: StdMutex<RwState>,
    reader_wake: WakeMode,
    writer_wake: WakeMode,
}

impl RwShared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, RwState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Release algorithm. Applies `adjust` (the releasing side's bookkeeping)
    /// and picks the next beneficiaries, all under the critical section;
    /// claims and wakes happen outside it.
    fn run_release(&self, adjust: impl FnOnce(&mut RwState)) {
        let handoff = {
            let mut state = self.lock_state();
            adjust(&mut state);
            Self::select(&mut state)
        };
        match handoff {
            Handoff::Nobody => {}
            Handoff::Writer(waiter) => {
                tracing::trace!("rwlock release: granting queued writer");
                let mut batch = WakeBatch::new(self.writer_wake);
                match waiter.try_claim_granted(()) {
                    Claim::Won(waker) => batch.push(waker),
                    Claim::Lost => {}
                }
            }
            Handoff::Readers(waiters) => {
                tracing::trace!(count = waiters.len(), "rwlock release: admitting readers");
                let mut batch = WakeBatch::new(self.reader_wake);
                for waiter in waiters {
                    match waiter.try_claim_granted(()) {
                        Claim::Won(waker) => batch.push(waker),
                        Claim::Lost => {}
                    }
                }
            }
        }
    }

    /// Selection half of the release algorithm. Writer preference: queued
    /// writers go first once the reader count drains; readers are admitted
    /// in one batch only while no writer is queued.
    fn select(state: &mut RwState) -> Handoff {
        if state.writer_active {
            return Handoff::Nobody;
        }
        if state.reader_count == 0 {
            if let Some(waiter) = state.writer_queue.pop_front() {
                state.writer_active = true;
                return Handoff::Writer(waiter);
            }
        }
        if state.writer_queue.is_empty() && !state.reader_queue.is_empty() {
            let drained = state.reader_queue.drain_all();
            state.reader_count += u32::try_from(drained.len()).unwrap_or(u32::MAX);
            return Handoff::Readers(drained);
        }
        Handoff::Nobody
    }

    fn release_reader(&self) {
        self.run_release(|state| {
            debug_assert!(state.reader_count > 0, "reader release without readers");
            state.reader_count = state.reader_count.saturating_sub(1);
        });
    }

    fn release_writer(&self) {
        self.run_release(|state| {
            debug_assert!(state.writer_active, "writer release without writer");
            state.writer_active = false;
        });
    }

    /// Cancellation repair for a waiter whose cancel claim won. Removal from
    /// its queue is the whole job unless a release already selected it; then
    /// its admission is rolled back as if it had acquired and released.
    fn repair_after_cancel(&self, class: WaiterClass, waiter: &WaiterRef<()>) {
        let removed = {
            let mut state = self.lock_state();
            match class {
                WaiterClass::Reader => state.reader_queue.remove(waiter),
                WaiterClass::Writer => state.writer_queue.remove(waiter),
            }
        };
        if !removed {
            tracing::trace!(?class, "rwlock cancel: waiter already admitted, rolling back");
            match class {
                WaiterClass::Reader => self.release_reader(),
                WaiterClass::Writer => self.release_writer(),
            }
        }
    }

    fn wake_mode(&self, class: WaiterClass) -> WakeMode {
        match class {
            WaiterClass::Reader => self.reader_wake,
            WaiterClass::Writer => self.writer_wake,
        }
    }

    fn finish_rental(&self, waiter: WaiterRef<()>) {
        let slot = waiter.recycle();
        self.lock_state().pool.put_back(slot);
    }
}

/// An async read-write lock with writer-preference fairness.
///
/// See the [module docs](self) for the fairness and cancellation protocol.
#[derive(Debug)]
pub struct RwLock<T> {
    shared: Arc<RwShared>,
    data: StdRwLock<T>,
}

impl<T> RwLock<T> {
    /// Creates a new unlocked lock with deferred wakes on both sides.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_wake_modes(value, WakeMode::default(), WakeMode::default())
    }

    /// Creates a new unlocked lock with independent reader and writer wake
    /// modes.
    #[must_use]
    pub fn with_wake_modes(value: T, reader_wake: WakeMode, writer_wake: WakeMode) -> Self {
        Self {
            shared: Arc::new(RwShared {
                state: StdMutex::new(RwState {
                    reader_count: 0,
                    writer_active: false,
                    reader_queue: WaitQueue::new(),
                    writer_queue: WaitQueue::new(),
                    pool: WaiterPool::new(),
                }),
                reader_wake,
                writer_wake,
            }),
            data: StdRwLock::new(value),
        }
    }

    /// Number of readers currently holding the lock.
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.shared.lock_state().reader_count
    }

    /// True if a writer currently holds the lock.
    #[must_use]
    pub fn is_writer_active(&self) -> bool {
        self.shared.lock_state().writer_active
    }

    /// Number of queued readers.
    #[must_use]
    pub fn queued_readers(&self) -> usize {
        self.shared.lock_state().reader_queue.len()
    }

    /// Number of queued writers.
    #[must_use]
    pub fn queued_writers(&self) -> usize {
        self.shared.lock_state().writer_queue.len()
    }

    /// Acquires a read guard, waiting if a writer is active or queued.
    ///
    /// # Errors
    ///
    /// Resolves to [`RwLockError::Cancelled`] if `token` fires first.
    pub fn read<'a>(&'a self, token: &CancelToken) -> Read<'a, T> {
        Read {
            inner: AcquireState::init(self, token.clone()),
        }
    }

    /// Acquires a write guard, waiting for exclusivity.
    ///
    /// # Errors
    ///
    /// Resolves to [`RwLockError::Cancelled`] if `token` fires first.
    pub fn write<'a>(&'a self, token: &CancelToken) -> Write<'a, T> {
        Write {
            inner: AcquireState::init(self, token.clone()),
        }
    }

    /// Tries to acquire a read guard without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryReadError::Locked`] if a writer is active or queued.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, TryReadError> {
        {
            let mut state = self.shared.lock_state();
            if state.writer_active || !state.writer_queue.is_empty() {
                return Err(TryReadError::Locked);
            }
            state.reader_count += 1;
        }
        Ok(self.read_guard())
    }

    /// Tries to acquire a write guard without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryWriteError::Locked`] if the lock is held at all.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, TryWriteError> {
        {
            let mut state = self.shared.lock_state();
            if state.writer_active || state.reader_count > 0 {
                return Err(TryWriteError::Locked);
            }
            state.writer_active = true;
        }
        Ok(self.write_guard())
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consumes the lock, returning the underlying data.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, T> {
        let data = match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        RwLockReadGuard {
            data,
            release: ReleaseReaderOnDrop {
                shared: &self.shared,
            },
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, T> {
        let data = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        RwLockWriteGuard {
            data,
            release: ReleaseWriterOnDrop {
                shared: &self.shared,
            },
        }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

struct ReleaseReaderOnDrop<'a> {
    shared: &'a RwShared,
}

impl Drop for ReleaseReaderOnDrop<'_> {
    fn drop(&mut self) {
        self.shared.release_reader();
    }
}

struct ReleaseWriterOnDrop<'a> {
    shared: &'a RwShared,
}

impl Drop for ReleaseWriterOnDrop<'_> {
    fn drop(&mut self) {
        self.shared.release_writer();
    }
}

/// RAII guard for shared read access.
#[must_use = "the read lock is released immediately if the guard is not held"]
pub struct RwLockReadGuard<'a, T> {
    data: std::sync::RwLockReadGuard<'a, T>,
    release: ReleaseReaderOnDrop<'a>,
}

impl<T: fmt::Debug> fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLockReadGuard")
            .field("data", &*self.data)
            .finish()
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

/// RAII guard for exclusive write access.
#[must_use = "the write lock is released immediately if the guard is not held"]
pub struct RwLockWriteGuard<'a, T> {
    data: std::sync::RwLockWriteGuard<'a, T>,
    release: ReleaseWriterOnDrop<'a>,
}

impl<T: fmt::Debug> fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLockWriteGuard")
            .field("data", &*self.data)
            .finish()
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Shared wait-state machine for both acquire futures.
struct AcquireState<'a, T> {
    lock: &'a RwLock<T>,
    token: CancelToken,
    phase: AcquirePhase,
}

enum AcquirePhase {
    Init,
    Waiting(WaiterRef<()>),
    Done,
}

impl<'a, T> AcquireState<'a, T> {
    fn init(lock: &'a RwLock<T>, token: CancelToken) -> Self {
        Self {
            lock,
            token,
            phase: AcquirePhase::Init,
        }
    }

    /// Fast-path admission test and bookkeeping per class.
    fn try_admit(class: WaiterClass, state: &mut RwState) -> bool {
        match class {
            WaiterClass::Reader => {
                if state.writer_active || !state.writer_queue.is_empty() {
                    return false;
                }
                state.reader_count += 1;
                true
            }
            WaiterClass::Writer => {
                if state.writer_active || state.reader_count > 0 {
                    return false;
                }
                state.writer_active = true;
                true
            }
        }
    }

    fn poll_acquire(&mut self, class: WaiterClass, cx: &mut Context<'_>) -> Poll<Result<(), RwLockError>> {
        match &self.phase {
            AcquirePhase::Init => {
                if self.token.is_cancelled() {
                    self.phase = AcquirePhase::Done;
                    return Poll::Ready(Err(RwLockError::Cancelled));
                }

                let shared = &self.lock.shared;
                let waiter = {
                    let mut state = shared.lock_state();
                    if Self::try_admit(class, &mut state) {
                        None
                    } else {
                        let waiter = state.pool.rent();
                        waiter.prime(cx.waker());
                        match class {
                            WaiterClass::Reader => state.reader_queue.push_back(waiter.clone()),
                            WaiterClass::Writer => state.writer_queue.push_back(waiter.clone()),
                        }
                        Some(waiter)
                    }
                };

                match waiter {
                    None => {
                        tracing::trace!(?class, "rwlock acquire: fast path");
                        self.phase = AcquirePhase::Done;
                        Poll::Ready(Ok(()))
                    }
                    Some(waiter) => {
                        tracing::trace!(?class, "rwlock acquire: queued");
                        if self.token.can_be_cancelled() {
                            let shared = Arc::clone(shared);
                            let cb_waiter = waiter.clone();
                            let registration = self.token.register(move || {
                                if let Claim::Won(waker) = cb_waiter.try_claim_cancelled() {
                                    let mut batch = WakeBatch::new(shared.wake_mode(class));
                                    shared.repair_after_cancel(class, &cb_waiter);
                                    batch.push(waker);
                                }
                            });
                            waiter.attach_registration(registration);
                        }
                        self.phase = AcquirePhase::Waiting(waiter);
                        Poll::Pending
                    }
                }
            }
            AcquirePhase::Waiting(waiter) => match waiter.poll_outcome(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(outcome) => {
                    let AcquirePhase::Waiting(waiter) =
                        std::mem::replace(&mut self.phase, AcquirePhase::Done)
                    else {
                        unreachable!("phase changed during poll");
                    };
                    self.lock.shared.finish_rental(waiter);
                    match outcome {
                        WaitOutcome::Granted(()) => Poll::Ready(Ok(())),
                        WaitOutcome::Cancelled => Poll::Ready(Err(RwLockError::Cancelled)),
                    }
                }
            },
            AcquirePhase::Done => panic!("rwlock acquire future polled after completion"),
        }
    }

    /// Shared drop protocol: abandoning a pending wait is a cancellation;
    /// abandoning a granted one releases the grant.
    fn abandon(&mut self, class: WaiterClass) {
        let phase = std::mem::replace(&mut self.phase, AcquirePhase::Done);
        let AcquirePhase::Waiting(waiter) = phase else {
            return;
        };

        match waiter.try_claim_cancelled() {
            Claim::Won(_own_waker) => {
                self.lock.shared.repair_after_cancel(class, &waiter);
                let _ = waiter.take_outcome();
                self.lock.shared.finish_rental(waiter);
            }
            Claim::Lost => {
                let outcome = waiter.take_outcome();
                self.lock.shared.finish_rental(waiter);
                if matches!(outcome, WaitOutcome::Granted(())) {
                    match class {
                        WaiterClass::Reader => self.lock.shared.release_reader(),
                        WaiterClass::Writer => self.lock.shared.release_writer(),
                    }
                }
            }
        }
    }
}

/// Future returned by [`RwLock::read`].
#[must_use = "futures do nothing unless polled"]
pub struct Read<'a, T> {
    inner: AcquireState<'a, T>,
}

impl<T> fmt::Debug for Read<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Read").finish_non_exhaustive()
    }
}

impl<'a, T> Future for Read<'a, T> {
    type Output = Result<RwLockReadGuard<'a, T>, RwLockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.poll_acquire(WaiterClass::Reader, cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => Poll::Ready(Ok(this.inner.lock.read_guard())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }
}

impl<T> Drop for Read<'_, T> {
    fn drop(&mut self) {
        self.inner.abandon(WaiterClass::Reader);
    }
}

/// Future returned by [`RwLock::write`].
#[must_use = "futures do nothing unless polled"]
pub struct Write<'a, T> {
    inner: AcquireState<'a, T>,
}

impl<T> fmt::Debug for Write<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Write").finish_non_exhaustive()
    }
}

impl<'a, T> Future for Write<'a, T> {
    type Output = Result<RwLockWriteGuard<'a, T>, RwLockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.poll_acquire(WaiterClass::Writer, cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => Poll::Ready(Ok(this.inner.lock.write_guard())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }
}

impl<T> Drop for Write<'_, T> {
    fn drop(&mut self) {
        self.inner.abandon(WaiterClass::Writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, poll_once};
    use futures_lite::future::block_on;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn never() -> CancelToken {
        CancelToken::never()
    }

    #[test]
    fn readers_share_the_lock() {
        init_test("readers_share_the_lock");
        let lock = RwLock::new(5);
        let r1 = block_on(lock.read(&never())).expect("first read");
        let r2 = block_on(lock.read(&never())).expect("second read");
        crate::assert_with_log!(lock.reader_count() == 2, "two readers", 2u32, lock.reader_count());
        crate::assert_with_log!(*r1 == 5 && *r2 == 5, "both observe", true, *r1 == 5);
        drop((r1, r2));
        crate::assert_with_log!(lock.reader_count() == 0, "drained", 0u32, lock.reader_count());
        crate::test_complete!("readers_share_the_lock");
    }

    #[test]
    fn writer_gets_exclusive_access() {
        init_test("writer_gets_exclusive_access");
        let lock = RwLock::new(0);
        let mut w = block_on(lock.write(&never())).expect("write");
        *w = 9;
        crate::assert_with_log!(lock.is_writer_active(), "writer active", true, lock.is_writer_active());

        let blocked_read = matches!(lock.try_read(), Err(TryReadError::Locked));
        let blocked_write = matches!(lock.try_write(), Err(TryWriteError::Locked));
        crate::assert_with_log!(blocked_read, "readers blocked", true, blocked_read);
        crate::assert_with_log!(blocked_write, "writers blocked", true, blocked_write);

        drop(w);
        let r = block_on(lock.read(&never())).expect("read after write");
        crate::assert_with_log!(*r == 9, "write visible", 9, *r);
        drop(r);
        crate::test_complete!("writer_gets_exclusive_access");
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        init_test("queued_writer_blocks_new_readers");
        let lock = RwLock::new(());
        let r1 = block_on(lock.read(&never())).expect("first read");

        let mut pending_writer = lock.write(&never());
        assert!(poll_once(&mut pending_writer).is_pending());
        crate::assert_with_log!(lock.queued_writers() == 1, "writer queued", 1usize, lock.queued_writers());

        // Writer preference: a new reader must queue, not join.
        let mut pending_reader = lock.read(&never());
        assert!(poll_once(&mut pending_reader).is_pending());
        let fast_read_blocked = matches!(lock.try_read(), Err(TryReadError::Locked));
        crate::assert_with_log!(fast_read_blocked, "fast read blocked", true, fast_read_blocked);

        // Releasing the reader admits the writer first.
        drop(r1);
        let writer_granted = matches!(poll_once(&mut pending_writer), Poll::Ready(Ok(_)));
        crate::assert_with_log!(writer_granted, "writer first", true, writer_granted);
        // (guard dropped immediately: Poll::Ready(Ok(guard)) binding is temp)

        // Now the queued reader gets in.
        let reader_granted = matches!(poll_once(&mut pending_reader), Poll::Ready(Ok(_)));
        crate::assert_with_log!(reader_granted, "reader after writer", true, reader_granted);
        crate::test_complete!("queued_writer_blocks_new_readers");
    }

    #[test]
    fn writer_release_admits_reader_batch() {
        init_test("writer_release_admits_reader_batch");
        let lock = RwLock::new(());
        let w = block_on(lock.write(&never())).expect("write");

        let mut r1 = lock.read(&never());
        let mut r2 = lock.read(&never());
        let mut r3 = lock.read(&never());
        assert!(poll_once(&mut r1).is_pending());
        assert!(poll_once(&mut r2).is_pending());
        assert!(poll_once(&mut r3).is_pending());
        crate::assert_with_log!(lock.queued_readers() == 3, "three queued", 3usize, lock.queued_readers());

        drop(w);
        let g1 = match poll_once(&mut r1) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("reader one not granted: {other:?}"),
        };
        let g2 = match poll_once(&mut r2) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("reader two not granted: {other:?}"),
        };
        let g3 = match poll_once(&mut r3) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("reader three not granted: {other:?}"),
        };
        crate::assert_with_log!(lock.reader_count() == 3, "batch admitted", 3u32, lock.reader_count());
        drop((g1, g2, g3));
        crate::test_complete!("writer_release_admits_reader_batch");
    }

    #[test]
    fn cancelled_queued_writer_unblocks_readers() {
        init_test("cancelled_queued_writer_unblocks_readers");
        let lock = RwLock::new(());
        let r1 = block_on(lock.read(&never())).expect("read");

        let token = CancelToken::new();
        let mut pending_writer = lock.write(&token);
        assert!(poll_once(&mut pending_writer).is_pending());

        let mut pending_reader = lock.read(&never());
        assert!(poll_once(&mut pending_reader).is_pending());

        token.cancel();
        let cancelled = matches!(
            poll_once(&mut pending_writer),
            Poll::Ready(Err(RwLockError::Cancelled))
        );
        crate::assert_with_log!(cancelled, "writer cancelled", true, cancelled);

        // With the writer gone the queued reader is admitted on the next
        // release pass.
        drop(r1);
        let granted = matches!(poll_once(&mut pending_reader), Poll::Ready(Ok(_)));
        crate::assert_with_log!(granted, "reader admitted", true, granted);
        crate::test_complete!("cancelled_queued_writer_unblocks_readers");
    }

    #[test]
    fn cancel_racing_writer_grant_never_strands_lock() {
        init_test("cancel_racing_writer_grant_never_strands_lock");
        for _ in 0..200 {
            let lock = Arc::new(RwLock::new(()));
            let r1 = block_on(lock.read(&never())).expect("read");

            let token = CancelToken::new();
            let mut doomed_writer = lock.write(&token);
            assert!(poll_once(&mut doomed_writer).is_pending());

            let mut next_writer = lock.write(&never());
            assert!(poll_once(&mut next_writer).is_pending());

            let canceller = {
                let token = token.clone();
                thread::spawn(move || token.cancel())
            };
            drop(r1);
            canceller.join().expect("canceller panicked");

            match block_on(doomed_writer) {
                Err(RwLockError::Cancelled) => {
                    let guard = block_on(next_writer).expect("next writer acquires");
                    drop(guard);
                }
                Ok(guard) => {
                    drop(guard);
                    let guard = block_on(next_writer).expect("next writer after handoff");
                    drop(guard);
                }
            }
            assert!(!lock.is_writer_active(), "writer flag stranded");
            assert_eq!(lock.reader_count(), 0, "reader count stranded");
        }
        crate::test_complete!("cancel_racing_writer_grant_never_strands_lock");
    }

    #[test]
    fn dropped_pending_futures_clean_up() {
        init_test("dropped_pending_futures_clean_up");
        let lock = RwLock::new(());
        let w = block_on(lock.write(&never())).expect("write");

        {
            let mut pending_reader = lock.read(&never());
            let mut pending_writer = lock.write(&never());
            assert!(poll_once(&mut pending_reader).is_pending());
            assert!(poll_once(&mut pending_writer).is_pending());
        }

        crate::assert_with_log!(lock.queued_readers() == 0, "reader gone", 0usize, lock.queued_readers());
        crate::assert_with_log!(lock.queued_writers() == 0, "writer gone", 0usize, lock.queued_writers());
        drop(w);
        let guard = lock.try_write().expect("lock reusable");
        drop(guard);
        crate::test_complete!("dropped_pending_futures_clean_up");
    }

    #[test]
    fn concurrent_readers_and_writers_stay_consistent() {
        init_test("concurrent_readers_and_writers_stay_consistent");
        const WRITERS: usize = 4;
        const READERS: usize = 4;
        const ROUNDS: usize = 200;

        let lock = Arc::new(RwLock::new(0u64));
        let active_writers = Arc::new(AtomicU32::new(0));
        let max_writers = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..WRITERS {
            let lock = Arc::clone(&lock);
            let active = Arc::clone(&active_writers);
            let max = Arc::clone(&max_writers);
            handles.push(thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let mut guard = block_on(lock.write(&never())).expect("write");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    *guard += 1;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for _ in 0..READERS {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let guard = block_on(lock.read(&never())).expect("read");
                    let _ = *guard;
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        let total = *block_on(lock.read(&never())).expect("final read");
        crate::assert_with_log!(
            total == (WRITERS * ROUNDS) as u64,
            "no lost writes",
            (WRITERS * ROUNDS) as u64,
            total
        );
        let max = max_writers.load(Ordering::SeqCst);
        crate::assert_with_log!(max == 1, "single writer", 1u32, max);
        crate::test_complete!("concurrent_readers_and_writers_stay_consistent");
    }

    #[test]
    fn error_display() {
        init_test("error_display");
        crate::assert_with_log!(
            RwLockError::Cancelled.to_string() == "rwlock acquisition cancelled",
            "error text",
            "rwlock acquisition cancelled",
            RwLockError::Cancelled.to_string()
        );
        crate::test_complete!("error_display");
    }
}
