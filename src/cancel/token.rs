//! Cancellation token with synchronized callback registration.
//!
//! A [`CancelToken`] is a lightweight handle to shared cancellation state.
//! Tokens are cloned and handed to acquire operations; firing the token
//! resolves pending waiters with a cancellation outcome.
//!
//! # Callback Lifecycle
//!
//! Registration follows a strict lifecycle so that callers can reason about
//! reuse:
//!
//! - A callback runs at most once, on the thread that calls [`cancel`].
//! - Registering on an already-cancelled token runs the callback inline on
//!   the registering thread.
//! - Dropping a [`CancelRegistration`] revokes a callback that has not
//!   started, and **blocks** until a callback that is mid-flight has
//!   returned. After the drop returns, the callback can no longer observe
//!   any state the registration referenced.
//!
//! [`cancel`]: CancelToken::cancel

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::task::{Context, Poll, Waker};

type Callback = Box<dyn FnOnce() + Send>;

/// Phase of a registered callback, guarded by the entry's mutex.
enum CallbackPhase {
    /// Registered, not yet started. Holds the callback itself.
    Armed(Callback),
    /// Currently executing on the cancelling thread.
    Running,
    /// Finished executing.
    Done,
    /// Revoked by dropping the registration before it started.
    Revoked,
}

impl std::fmt::Debug for CallbackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Armed(_) => "Armed",
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Revoked => "Revoked",
        };
        f.write_str(name)
    }
}

/// One registered callback, shared between the token and its registration.
#[derive(Debug)]
struct CallbackCell {
    phase: StdMutex<CallbackPhase>,
    finished: Condvar,
}

impl CallbackCell {
    fn new(callback: Callback) -> Self {
        Self {
            phase: StdMutex::new(CallbackPhase::Armed(callback)),
            finished: Condvar::new(),
        }
    }

    /// Runs the callback if it is still armed. Safe to call from multiple
    /// paths; only the first caller executes it.
    fn fire(&self) {
        let callback = {
            let mut phase = match self.phase.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match std::mem::replace(&mut *phase, CallbackPhase::Running) {
                CallbackPhase::Armed(cb) => cb,
                // Already handled (or revoked); restore the observed phase.
                other => {
                    *phase = other;
                    return;
                }
            }
        };

        callback();

        let mut phase = match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *phase = CallbackPhase::Done;
        drop(phase);
        self.finished.notify_all();
    }

    /// Revokes an armed callback, or waits out a running one.
    fn revoke_or_wait(&self) {
        let mut phase = match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*phase {
            CallbackPhase::Armed(_) => {
                *phase = CallbackPhase::Revoked;
            }
            CallbackPhase::Running => {
                while matches!(&*phase, CallbackPhase::Running) {
                    phase = match self.finished.wait(phase) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
            CallbackPhase::Done | CallbackPhase::Revoked => {}
        }
    }
}

#[derive(Debug)]
struct Listener {
    id: u64,
    cell: Arc<CallbackCell>,
}

/// Shared state behind a cancellable token.
#[derive(Debug)]
struct TokenState {
    cancelled: AtomicBool,
    next_listener_id: AtomicU64,
    listeners: StdMutex<Vec<Listener>>,
}

/// A cancellation token.
///
/// Cloning a token yields another handle to the same cancellation state.
/// [`CancelToken::never`] produces a token that can never fire; acquire
/// operations skip registration entirely for such tokens.
///
/// # Example
///
/// ```ignore
/// let token = CancelToken::new();
/// let guard = mutex.lock(&token).await?;
/// // elsewhere:
/// token.cancel();
/// ```
#[derive(Clone, Debug)]
pub struct CancelToken {
    state: Option<Arc<TokenState>>,
}

impl CancelToken {
    /// Creates a new cancellable token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Some(Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                next_listener_id: AtomicU64::new(0),
                listeners: StdMutex::new(Vec::new()),
            })),
        }
    }

    /// Returns a token that can never be cancelled.
    ///
    /// Registration against this token is a no-op.
    #[must_use]
    pub fn never() -> Self {
        Self { state: None }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.cancelled.load(Ordering::Acquire))
    }

    /// Returns true if this token can ever fire.
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        self.state.is_some()
    }

    /// Requests cancellation.
    ///
    /// Registered callbacks run on this thread, outside the listener lock.
    /// Returns true if this call transitioned the token (first caller wins);
    /// later calls are no-ops.
    pub fn cancel(&self) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        if state
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        tracing::trace!("cancel token fired");

        // The flag is set before the drain, and registration checks the flag
        // under the listener lock, so no callback can be stranded.
        let drained: Vec<Listener> = {
            let mut listeners = match state.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *listeners)
        };

        for listener in drained {
            listener.cell.fire();
        }
        true
    }

    /// Registers a callback to run when the token fires.
    ///
    /// If the token is already cancelled the callback runs inline before
    /// this method returns. If the token can never fire, the callback is
    /// dropped and a no-op registration is returned.
    pub fn register<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = &self.state else {
            return CancelRegistration { entry: None };
        };

        let cell = Arc::new(CallbackCell::new(Box::new(callback)));
        let id = state.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let run_inline = {
            let mut listeners = match state.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.cancelled.load(Ordering::Acquire) {
                true
            } else {
                listeners.push(Listener {
                    id,
                    cell: Arc::clone(&cell),
                });
                false
            }
        };

        if run_inline {
            cell.fire();
        }

        CancelRegistration {
            entry: Some(RegistrationEntry {
                token: Arc::clone(state),
                id,
                cell,
            }),
        }
    }

    /// Returns a future that resolves when the token fires.
    ///
    /// For a [`CancelToken::never`] token the future is forever pending.
    #[must_use]
    pub fn cancelled(&self) -> WaitCancelled {
        WaitCancelled {
            token: self.clone(),
            registration: None,
            waker_slot: Arc::new(StdMutex::new(None)),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct RegistrationEntry {
    token: Arc<TokenState>,
    id: u64,
    cell: Arc<CallbackCell>,
}

/// Scoped handle to a registered cancellation callback.
///
/// Dropping the registration revokes a callback that has not started, and
/// blocks until a callback that is currently executing has returned. This
/// is the synchronization point that lets a waiter be recycled safely.
#[derive(Debug)]
#[must_use = "dropping the registration is what revokes the callback"]
pub struct CancelRegistration {
    entry: Option<RegistrationEntry>,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        // Remove our listener so an uncancelled token does not accumulate
        // dead entries across waiter reuse cycles.
        {
            let mut listeners = match entry.token.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(pos) = listeners.iter().position(|l| l.id == entry.id) {
                listeners.swap_remove(pos);
            }
        }

        entry.cell.revoke_or_wait();
    }
}

/// Future returned by [`CancelToken::cancelled`].
///
/// Resolves with `()` once the token fires. The embedded registration is
/// released when the future is dropped.
#[derive(Debug)]
pub struct WaitCancelled {
    token: CancelToken,
    registration: Option<CancelRegistration>,
    waker_slot: Arc<StdMutex<Option<Waker>>>,
}

impl Future for WaitCancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        if !self.token.can_be_cancelled() {
            return Poll::Pending;
        }

        {
            let mut slot = match self.waker_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(cx.waker().clone());
        }

        if self.registration.is_none() {
            let slot = Arc::clone(&self.waker_slot);
            let registration = self.token.register(move || {
                let waker = {
                    let mut slot = match slot.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    slot.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
            self.registration = Some(registration);
        }

        // The callback may have fired between the fast check and the
        // registration; the flag is authoritative.
        if self.token.is_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
