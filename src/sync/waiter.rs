//! Reusable one-shot waiter cells.
//!
//! A [`WaitSlot`] is the completion cell a suspended acquirer parks on. Its
//! lifecycle is rent → enqueue → resolve → consume → recycle, and two
//! properties make reuse safe across that cycle:
//!
//! - **Claim-once.** Resolution (grant or cancellation) goes through a
//!   single CAS on a packed `version | claimed` word. Exactly one of the
//!   wakeup path and the cancellation path wins; the loser backs off.
//! - **Versioning.** The claim CAS carries the version the claimant rented
//!   against, so a stale reference held by a slow release path can never
//!   claim a recycled slot that has since been re-rented.
//!
//! Consumption takes the stored outcome exactly once and then drops the
//! cancellation registration, which blocks until any in-flight callback has
//! returned. Only after that is the slot recycled and returned to its pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll, Waker};

use crate::cancel::CancelRegistration;

/// How a primitive delivers wakeups to waiters it resolves.
///
/// Resolution itself always happens outside the primitive's critical
/// section; this mode only controls *when* the woken task is scheduled
/// relative to the rest of the release operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WakeMode {
    /// Collect wakers during a release operation and invoke them only after
    /// all claims and state repair for that operation have completed. The
    /// safe default: a woken task can never observe a half-finished release.
    #[default]
    Deferred,
    /// Invoke each waker immediately after the claim that resolved it, on
    /// the releasing thread. Slightly lower latency; callers accept that a
    /// woken task may start running before the release call has returned.
    Inline,
}

/// Outcome stored into a waiter by the claim winner.
#[derive(Debug)]
pub(crate) enum WaitOutcome<R> {
    /// The resource was granted.
    Granted(R),
    /// The waiter's cancellation fired first.
    Cancelled,
}

/// Result of a claim attempt.
#[derive(Debug)]
pub(crate) enum Claim {
    /// This caller resolved the waiter; the stored waker (if the consumer
    /// has polled) is handed back for delivery per the primitive's
    /// [`WakeMode`].
    Won(Option<Waker>),
    /// The other path resolved the waiter first.
    Lost,
}

/// Mutable interior of a slot, guarded by its own short mutex.
#[derive(Debug)]
struct SlotInner<R> {
    outcome: Option<WaitOutcome<R>>,
    waker: Option<Waker>,
    registration: Option<CancelRegistration>,
}

/// A pooled one-shot completion cell.
///
/// The packed `state` word is `(version << 1) | claimed`. Recycling
/// advances the version, which atomically invalidates any stale claim.
#[derive(Debug)]
pub(crate) struct WaitSlot<R> {
    state: AtomicU64,
    inner: StdMutex<SlotInner<R>>,
}

impl<R> WaitSlot<R> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            inner: StdMutex::new(SlotInner {
                outcome: None,
                waker: None,
                registration: None,
            }),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SlotInner<R>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current version of this slot (claim bit stripped).
    pub(crate) fn version(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 1
    }
}

/// Handle to a rented slot, pinned to the version it was rented at.
///
/// Clones of one `WaiterRef` refer to the same rental: the queue holds one,
/// the acquire future holds one, and a cancellation callback may hold a
/// third. Identity comparison is slot pointer plus version.
#[derive(Debug)]
pub(crate) struct WaiterRef<R> {
    slot: Arc<WaitSlot<R>>,
    version: u64,
}

impl<R> Clone for WaiterRef<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            version: self.version,
        }
    }
}

impl<R> WaiterRef<R> {
    pub(crate) fn new(slot: Arc<WaitSlot<R>>) -> Self {
        let version = slot.version();
        Self { slot, version }
    }

    /// True if both refs name the same rental of the same slot.
    pub(crate) fn same_rental(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot) && self.version == other.version
    }

    fn try_claim(&self, outcome: WaitOutcome<R>) -> Claim {
        let unclaimed = self.version << 1;
        if self
            .slot
            .state
            .compare_exchange(unclaimed, unclaimed | 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Claim::Lost;
        }
        let mut inner = self.slot.lock_inner();
        inner.outcome = Some(outcome);
        let waker = inner.waker.take();
        drop(inner);
        Claim::Won(waker)
    }

    /// CAS-claims the waiter with a grant. On failure the cancellation path
    /// already owns the waiter and nothing is stored.
    pub(crate) fn try_claim_granted(&self, grant: R) -> Claim {
        self.try_claim(WaitOutcome::Granted(grant))
    }

    /// CAS-claims the waiter with a cancellation outcome. On failure the
    /// wakeup path already owns the waiter and nothing is stored.
    pub(crate) fn try_claim_cancelled(&self) -> Claim {
        self.try_claim(WaitOutcome::Cancelled)
    }

    /// Stores the consumer's waker ahead of enqueueing, so a claim that
    /// lands immediately after the critical section still finds it.
    pub(crate) fn prime(&self, waker: &Waker) {
        let mut inner = self.slot.lock_inner();
        inner.waker = Some(waker.clone());
    }

    /// Attaches the cancellation registration created after enqueue.
    pub(crate) fn attach_registration(&self, registration: CancelRegistration) {
        let mut inner = self.slot.lock_inner();
        inner.registration = Some(registration);
    }

    /// Consumer-side poll. Takes the outcome exactly once; while pending,
    /// refreshes the stored waker.
    ///
    /// On `Ready` the cancellation registration has been dropped, i.e. any
    /// in-flight cancellation callback has finished.
    pub(crate) fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<WaitOutcome<R>> {
        let mut inner = self.slot.lock_inner();
        if let Some(outcome) = inner.outcome.take() {
            let registration = inner.registration.take();
            drop(inner);
            drop(registration);
            return Poll::Ready(outcome);
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Takes the outcome of a waiter known to be claimed.
    ///
    /// The claim winner stores the outcome immediately after its CAS, so
    /// the wait here is at most that store; the spin is bounded.
    pub(crate) fn take_outcome(&self) -> WaitOutcome<R> {
        loop {
            let mut inner = self.slot.lock_inner();
            if let Some(outcome) = inner.outcome.take() {
                let registration = inner.registration.take();
                drop(inner);
                drop(registration);
                return outcome;
            }
            drop(inner);
            std::thread::yield_now();
        }
    }

    /// Resets the slot for reuse and invalidates this rental.
    ///
    /// Must only be called after the outcome was consumed (which also
    /// dropped the registration). Returns the slot for pooling.
    pub(crate) fn recycle(self) -> Arc<WaitSlot<R>> {
        let mut inner = self.slot.lock_inner();
        debug_assert!(inner.outcome.is_none(), "recycled with unconsumed outcome");
        debug_assert!(
            inner.registration.is_none(),
            "recycled with live cancellation registration"
        );
        inner.waker = None;
        drop(inner);
        self.slot
            .state
            .store((self.version + 1) << 1, Ordering::Release);
        self.slot
    }
}

/// Collects wakers during one release operation and delivers them per the
/// primitive's [`WakeMode`].
#[derive(Debug)]
pub(crate) struct WakeBatch {
    mode: WakeMode,
    pending: Vec<Waker>,
}

impl WakeBatch {
    pub(crate) fn new(mode: WakeMode) -> Self {
        Self {
            mode,
            pending: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, waker: Option<Waker>) {
        let Some(waker) = waker else { return };
        match self.mode {
            WakeMode::Inline => waker.wake(),
            WakeMode::Deferred => self.pending.push(waker),
        }
    }
}

impl Drop for WakeBatch {
    fn drop(&mut self) {
        for waker in self.pending.drain(..) {
            waker.wake();
        }
    }
}
