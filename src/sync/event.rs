//! Auto- and manual-reset events with cancel-aware waiting.
//!
//! Both events pair an atomic `signaled` flag with a FIFO waiter queue and
//! differ only in their release discipline:
//!
//! - [`ManualResetEvent`]: `set` latches the flag and releases every queued
//!   waiter; all current and future waits complete until `reset`.
//! - [`AutoResetEvent`]: `set` releases exactly one waiter, or latches a
//!   single pending signal if nobody can be released. Each completed wait
//!   consumes one signal.
//!
//! # The Re-Check
//!
//! The waiting side enqueues first and only then re-examines the flag, so a
//! `set` that lands between the fast-path check and the enqueue is never
//! lost. For the auto event the re-check consumes the flag and, if its own
//! waiter was meanwhile resolved through the queue, passes the surplus
//! signal to the next waiter (or restores the flag). Cancelled waiters are
//! skipped by `set`, never costing a signal.
//!
//! # Closing
//!
//! [`close`] rejects subsequent operations. Waits already queued at close
//! time are not failed; they stay suspended (their cancellation tokens
//! still work), matching conventional reset-event disposal semantics.
//!
//! [`close`]: ManualResetEvent::close

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crate::cancel::CancelToken;

use super::pool::WaiterPool;
use super::queue::WaitQueue;
use super::waiter::{Claim, WaitOutcome, WaiterRef, WakeBatch, WakeMode};

/// Error returned when operating on a closed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventClosed;

impl fmt::Display for EventClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event is closed")
    }
}

impl std::error::Error for EventClosed {}

/// Error returned when a wait on an event fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The caller's cancellation token fired before the event signaled.
    Cancelled,
    /// The wait was started after the event was closed.
    Closed,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "event wait cancelled"),
            Self::Closed => write!(f, "event is closed"),
        }
    }
}

impl std::error::Error for WaitError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Auto,
    Manual,
}

#[derive(Debug)]
struct EventWaiters {
    waiters: WaitQueue<()>,
    pool: WaiterPool<()>,
}

/// State shared by an event and the callbacks/futures it hands out.
#[derive(Debug)]
struct EventCore {
    kind: EventKind,
    signaled: AtomicBool,
    closed: AtomicBool,
    wake_mode: WakeMode,
    queue: StdMutex<EventWaiters>,
}

impl EventCore {
    fn new(kind: EventKind, initially_set: bool, wake_mode: WakeMode) -> Arc<Self> {
        Arc::new(Self {
            kind,
            signaled: AtomicBool::new(initially_set),
            closed: AtomicBool::new(false),
            wake_mode,
            queue: StdMutex::new(EventWaiters {
                waiters: WaitQueue::new(),
                pool: WaiterPool::new(),
            }),
        })
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, EventWaiters> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Auto-reset delivery: release the first waiter whose claim wins
    /// (skipping cancelled entries), or latch the signal if none can be
    /// released.
    fn deliver_one(&self) {
        let mut batch = WakeBatch::new(self.wake_mode);
        loop {
            let next = self.lock_queue().waiters.pop_front();
            match next {
                Some(waiter) => match waiter.try_claim_granted(()) {
                    Claim::Won(waker) => {
                        tracing::trace!("auto event: released one waiter");
                        batch.push(waker);
                        return;
                    }
                    // A cancelled head never consumes the signal.
                    Claim::Lost => {}
                },
                None => {
                    self.signaled.store(true, Ordering::Release);
                    tracing::trace!("auto event: latched pending signal");
                    return;
                }
            }
        }
    }

    /// Manual-reset delivery: latch the flag, then drain and release every
    /// queued waiter.
    fn broadcast(&self) {
        self.signaled.store(true, Ordering::Release);
        let drained = self.lock_queue().waiters.drain_all();
        tracing::trace!(count = drained.len(), "manual event: broadcast");
        let mut batch = WakeBatch::new(self.wake_mode);
        for waiter in drained {
            match waiter.try_claim_granted(()) {
                Claim::Won(waker) => batch.push(waker),
                Claim::Lost => {}
            }
        }
    }

    fn set(&self) -> Result<(), EventClosed> {
        if self.is_closed() {
            return Err(EventClosed);
        }
        match self.kind {
            EventKind::Auto => self.deliver_one(),
            EventKind::Manual => self.broadcast(),
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), EventClosed> {
        if self.is_closed() {
            return Err(EventClosed);
        }
        self.signaled.store(false, Ordering::Release);
        Ok(())
    }

    /// Marks the event closed and drops its queue and free list. Waiters
    /// queued before the close are left suspended, never resolved by the
    /// event itself.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut queue = self.lock_queue();
        queue.waiters.clear();
        queue.pool.clear();
    }

    fn waiter_count(&self) -> usize {
        self.lock_queue().waiters.len()
    }

    fn finish_rental(&self, waiter: WaiterRef<()>) {
        let slot = waiter.recycle();
        self.lock_queue().pool.put_back(slot);
    }

    /// Consume-and-finish for a waiter this caller resolved or observed
    /// resolved outside the normal poll path.
    fn consume_rental(&self, waiter: WaiterRef<()>) -> WaitOutcome<()> {
        let outcome = waiter.take_outcome();
        self.finish_rental(waiter);
        outcome
    }
}

/// Shared waiting state machine for both event kinds.
struct EventWaitState {
    core: Arc<EventCore>,
    token: CancelToken,
    phase: WaitPhase,
}

enum WaitPhase {
    Init,
    Waiting(WaiterRef<()>),
    Done,
}

impl EventWaitState {
    fn new(core: Arc<EventCore>, token: CancelToken) -> Self {
        Self {
            core,
            token,
            phase: WaitPhase::Init,
        }
    }

    /// Fast path: consume (auto) or observe (manual) the signal.
    fn try_take_signal(&self) -> bool {
        match self.core.kind {
            EventKind::Auto => self
                .core
                .signaled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            EventKind::Manual => self.core.is_set(),
        }
    }

    fn poll_wait(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), WaitError>> {
        match &self.phase {
            WaitPhase::Init => {
                if self.core.is_closed() {
                    self.phase = WaitPhase::Done;
                    return Poll::Ready(Err(WaitError::Closed));
                }
                if self.token.is_cancelled() {
                    self.phase = WaitPhase::Done;
                    return Poll::Ready(Err(WaitError::Cancelled));
                }
                if self.try_take_signal() {
                    self.phase = WaitPhase::Done;
                    return Poll::Ready(Ok(()));
                }

                // Enqueue, then re-check: a set landing in between must not
                // be lost.
                let waiter = {
                    let mut queue = self.core.lock_queue();
                    if self.core.is_closed() {
                        self.phase = WaitPhase::Done;
                        return Poll::Ready(Err(WaitError::Closed));
                    }
                    let waiter = queue.pool.rent();
                    waiter.prime(cx.waker());
                    queue.waiters.push_back(waiter.clone());
                    waiter
                };

                if self.try_take_signal() {
                    match waiter.try_claim_granted(()) {
                        Claim::Won(_own_waker) => {
                            // We resolved ourselves; leave the queue quietly.
                            self.core.lock_queue().waiters.remove(&waiter);
                            let _ = self.core.consume_rental(waiter);
                            self.phase = WaitPhase::Done;
                            return Poll::Ready(Ok(()));
                        }
                        Claim::Lost => {
                            // A set already resolved us through the queue, so
                            // the signal this re-check consumed is surplus.
                            // For the auto event, pass it on.
                            if self.core.kind == EventKind::Auto {
                                self.core.deliver_one();
                            }
                            let _ = self.core.consume_rental(waiter);
                            self.phase = WaitPhase::Done;
                            return Poll::Ready(Ok(()));
                        }
                    }
                }

                // Only now is cancellation bound; the re-checks above cannot
                // race a callback.
                if self.token.can_be_cancelled() {
                    let core = Arc::clone(&self.core);
                    let cb_waiter = waiter.clone();
                    let registration = self.token.register(move || {
                        if let Claim::Won(waker) = cb_waiter.try_claim_cancelled() {
                            let mut batch = WakeBatch::new(core.wake_mode);
                            core.lock_queue().waiters.remove(&cb_waiter);
                            batch.push(waker);
                        }
                    });
                    waiter.attach_registration(registration);
                }
                self.phase = WaitPhase::Waiting(waiter);
                Poll::Pending
            }
            WaitPhase::Waiting(waiter) => match waiter.poll_outcome(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(outcome) => {
                    let WaitPhase::Waiting(waiter) =
                        std::mem::replace(&mut self.phase, WaitPhase::Done)
                    else {
                        unreachable!("phase changed during poll");
                    };
                    self.core.finish_rental(waiter);
                    match outcome {
                        WaitOutcome::Granted(()) => Poll::Ready(Ok(())),
                        WaitOutcome::Cancelled => Poll::Ready(Err(WaitError::Cancelled)),
                    }
                }
            },
            WaitPhase::Done => panic!("event wait future polled after completion"),
        }
    }

    /// Drop protocol. A pending wait cancels itself; a wait that was already
    /// granted hands an auto-reset signal onward instead of losing it.
    fn abandon(&mut self) {
        let phase = std::mem::replace(&mut self.phase, WaitPhase::Done);
        let WaitPhase::Waiting(waiter) = phase else {
            return;
        };

        match waiter.try_claim_cancelled() {
            Claim::Won(_own_waker) => {
                self.core.lock_queue().waiters.remove(&waiter);
                let _ = self.core.consume_rental(waiter);
            }
            Claim::Lost => {
                let outcome = self.core.consume_rental(waiter);
                if matches!(outcome, WaitOutcome::Granted(()))
                    && self.core.kind == EventKind::Auto
                {
                    self.core.deliver_one();
                }
            }
        }
    }
}

/// An event that stays signaled until explicitly reset.
///
/// While signaled, every current and future wait completes immediately.
///
/// # Example
///
/// ```ignore
/// use latchkit::{CancelToken, ManualResetEvent};
///
/// let gate = ManualResetEvent::new(false);
/// // many tasks: gate.wait(&token).await?;
/// gate.set()?; // releases all of them
/// ```
#[derive(Debug)]
pub struct ManualResetEvent {
    core: Arc<EventCore>,
}

impl ManualResetEvent {
    /// Creates the event, optionally already signaled.
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self::with_wake_mode(initially_set, WakeMode::default())
    }

    /// Creates the event with an explicit wake mode.
    #[must_use]
    pub fn with_wake_mode(initially_set: bool, wake_mode: WakeMode) -> Self {
        Self {
            core: EventCore::new(EventKind::Manual, initially_set, wake_mode),
        }
    }

    /// Latches the signal and releases every queued waiter.
    pub fn set(&self) -> Result<(), EventClosed> {
        self.core.set()
    }

    /// Clears the signal; queued waiters are unaffected.
    pub fn reset(&self) -> Result<(), EventClosed> {
        self.core.reset()
    }

    /// Returns true while the event is signaled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.core.is_set()
    }

    /// Number of waiters currently queued.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.core.waiter_count()
    }

    /// Closes the event. Subsequent `set`, `reset`, and `wait` calls fail
    /// with a closed error; waits queued before the close stay suspended.
    pub fn close(&self) {
        self.core.close();
    }

    /// Waits until the event is signaled.
    ///
    /// # Errors
    ///
    /// Resolves to [`WaitError::Cancelled`] if `token` fires first, or
    /// [`WaitError::Closed`] if the event was closed before the wait began.
    pub fn wait(&self, token: &CancelToken) -> ManualWait {
        ManualWait {
            state: EventWaitState::new(Arc::clone(&self.core), token.clone()),
        }
    }
}

/// An event that releases exactly one waiter per signal.
///
/// An unmatched `set` latches a single pending signal, consumed by the next
/// wait; further `set` calls while signaled are no-ops.
///
/// # Example
///
/// ```ignore
/// use latchkit::{AutoResetEvent, CancelToken};
///
/// let turnstile = AutoResetEvent::new(false);
/// // one task passes per set:
/// turnstile.set()?;
/// ```
#[derive(Debug)]
pub struct AutoResetEvent {
    core: Arc<EventCore>,
}

impl AutoResetEvent {
    /// Creates the event, optionally with one pending signal.
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self::with_wake_mode(initially_set, WakeMode::default())
    }

    /// Creates the event with an explicit wake mode.
    #[must_use]
    pub fn with_wake_mode(initially_set: bool, wake_mode: WakeMode) -> Self {
        Self {
            core: EventCore::new(EventKind::Auto, initially_set, wake_mode),
        }
    }

    /// Releases one queued waiter, or latches a pending signal if none can
    /// be released. Cancelled waiters at the head of the queue are skipped,
    /// never consuming the signal.
    pub fn set(&self) -> Result<(), EventClosed> {
        self.core.set()
    }

    /// Clears a pending signal; queued waiters are unaffected.
    pub fn reset(&self) -> Result<(), EventClosed> {
        self.core.reset()
    }

    /// Returns true while a signal is pending.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.core.is_set()
    }

    /// Number of waiters currently queued.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.core.waiter_count()
    }

    /// Closes the event. Subsequent `set`, `reset`, and `wait` calls fail
    /// with a closed error; waits queued before the close stay suspended.
    pub fn close(&self) {
        self.core.close();
    }

    /// Waits for a signal, consuming it.
    ///
    /// # Errors
    ///
    /// Resolves to [`WaitError::Cancelled`] if `token` fires first, or
    /// [`WaitError::Closed`] if the event was closed before the wait began.
    pub fn wait(&self, token: &CancelToken) -> AutoWait {
        AutoWait {
            state: EventWaitState::new(Arc::clone(&self.core), token.clone()),
        }
    }
}

/// Future returned by [`ManualResetEvent::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct ManualWait {
    state: EventWaitState,
}

impl fmt::Debug for ManualWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualWait").finish_non_exhaustive()
    }
}

impl Future for ManualWait {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().state.poll_wait(cx)
    }
}

impl Drop for ManualWait {
    fn drop(&mut self) {
        self.state.abandon();
    }
}

/// Future returned by [`AutoResetEvent::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct AutoWait {
    state: EventWaitState,
}

impl fmt::Debug for AutoWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoWait").finish_non_exhaustive()
    }
}

impl Future for AutoWait {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().state.poll_wait(cx)
    }
}

impl Drop for AutoWait {
    fn drop(&mut self) {
        self.state.abandon();
    }
}
