//! Lazy-initialization cell with selectable publication modes.
//!
//! A [`Lazy`] owns an async factory and publishes its result as a task that
//! every caller observes. Five [`LazyMode`]s cover the spectrum from "first
//! caller wins, failures stick" to "serialize every attempt, publish only
//! success":
//!
//! | Mode                          | Factory runs      | Failures        |
//! |-------------------------------|-------------------|-----------------|
//! | `Unsynchronized`              | once, ever        | published       |
//! | `UnsynchronizedRetry`         | until success     | cleared, retried|
//! | `PublicationOnly`             | concurrently      | private, retried|
//! | `ExecutionAndPublication`     | once, serialized  | published       |
//! | `ExecutionAndPublicationRetry`| until success, serialized | private, retried |
//!
//! The two `ExecutionAndPublication` modes serialize through an internal
//! async mutex. The non-retry one releases that mutex *before* awaiting the
//! factory's task, so a slow initialization never blocks later callers from
//! attaching to it; the retry one holds it for the whole attempt.
//!
//! # Cancellation
//!
//! A token cancelled before the call begins aborts without invoking the
//! factory. Cancelling the caller that is driving the factory marks the
//! published task cancelled: permanently in the non-retry modes, cleared
//! for retry in the others. An observer's cancellation is its own and
//! leaves the shared task unaffected.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crate::cancel::{CancelToken, WaitCancelled};

use super::mutex::Mutex;
use super::pool::WaiterPool;
use super::queue::WaitQueue;
use super::waiter::{Claim, WaitOutcome, WaiterRef, WakeBatch, WakeMode};

/// Error type produced by a failing factory, shared between observers.
pub type InitError = Arc<dyn std::error::Error + Send + Sync>;

/// Publication discipline of a [`Lazy`] cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyMode {
    /// First caller invokes the factory and publishes the resulting task
    /// unconditionally; the factory is dropped immediately. Faulted and
    /// cancelled outcomes are permanent.
    Unsynchronized,
    /// Like `Unsynchronized`, but a failed or cancelled attempt clears the
    /// published task (the factory is retained) so a later caller retries.
    UnsynchronizedRetry,
    /// No mutual exclusion: every caller that finds nothing published runs
    /// its own attempt. The first success is published; later successes are
    /// discarded and their callers observe the published value. Failures
    /// are never published and surface only to their own caller.
    PublicationOnly,
    /// Attempts serialize on an internal mutex; the running task is
    /// published before it is awaited, and the mutex is released first, so
    /// concurrent callers attach to the same task. All callers observe one
    /// outcome, including failure or cancellation.
    ExecutionAndPublication,
    /// Attempts serialize on the internal mutex, held across the whole
    /// attempt. Only success publishes; each failed caller observes its own
    /// failure and the next caller retries.
    ExecutionAndPublicationRetry,
}

impl LazyMode {
    /// True if a failed attempt leaves the cell ready to try again.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::UnsynchronizedRetry | Self::PublicationOnly | Self::ExecutionAndPublicationRetry
        )
    }
}

/// Error returned by [`Lazy::get`].
#[derive(Debug, Clone)]
pub enum LazyError {
    /// The caller's token fired, or the driving caller was cancelled
    /// mid-initialization (non-retry modes share that outcome).
    Cancelled,
    /// The factory failed. In shared-outcome modes every caller sees the
    /// same underlying error.
    Faulted(InitError),
}

impl fmt::Display for LazyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lazy initialization cancelled"),
            Self::Faulted(err) => write!(f, "lazy initialization failed: {err}"),
        }
    }
}

impl std::error::Error for LazyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Faulted(err) => Some(err.as_ref()),
        }
    }
}

/// Terminal state of a published initialization task.
#[derive(Debug)]
enum InitOutcome<T> {
    Ready(T),
    Faulted(InitError),
    Cancelled,
}

impl<T: Clone> Clone for InitOutcome<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Ready(value) => Self::Ready(value.clone()),
            Self::Faulted(err) => Self::Faulted(Arc::clone(err)),
            Self::Cancelled => Self::Cancelled,
        }
    }
}

impl<T> InitOutcome<T> {
    fn into_result(self) -> Result<T, LazyError> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Faulted(err) => Err(LazyError::Faulted(err)),
            Self::Cancelled => Err(LazyError::Cancelled),
        }
    }
}

#[derive(Debug)]
struct TaskCellState<T> {
    outcome: Option<InitOutcome<T>>,
    waiters: WaitQueue<InitOutcome<T>>,
    pool: WaiterPool<InitOutcome<T>>,
}

/// A published initialization task: a completion cell whose waiters receive
/// the outcome by value. Built on the same queue/pool backbone as the other
/// primitives; observers bind their own cancellation.
#[derive(Debug)]
struct TaskCell<T> {
    state: StdMutex<TaskCellState<T>>,
}

impl<T> TaskCell<T> {
    fn new() -> Self {
        Self {
            state: StdMutex::new(TaskCellState {
                outcome: None,
                waiters: WaitQueue::new(),
                pool: WaiterPool::new(),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TaskCellState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_completed(&self) -> bool {
        self.lock_state().outcome.is_some()
    }

    fn finish_rental(&self, waiter: WaiterRef<InitOutcome<T>>) {
        let slot = waiter.recycle();
        self.lock_state().pool.put_back(slot);
    }
}

impl<T: Clone> TaskCell<T> {
    fn completed(outcome: InitOutcome<T>) -> Self {
        let cell = Self::new();
        cell.lock_state().outcome = Some(outcome);
        cell
    }

    /// Resolves the task. First completion wins; the outcome is broadcast
    /// to every queued observer outside the cell's lock.
    fn complete(&self, outcome: InitOutcome<T>) {
        let drained = {
            let mut state = self.lock_state();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            state.waiters.drain_all()
        };
        tracing::trace!(observers = drained.len(), "lazy task resolved");
        let mut batch = WakeBatch::new(WakeMode::Deferred);
        for waiter in drained {
            match waiter.try_claim_granted(outcome.clone()) {
                Claim::Won(waker) => batch.push(waker),
                Claim::Lost => {}
            }
        }
    }
}

/// Factory slot and published task behind the cell's short critical section.
struct LazyState<T> {
    factory: Option<Arc<FactoryFn<T>>>,
    value: Option<Arc<TaskCell<T>>>,
}

struct LazyShared<T> {
    state: StdMutex<LazyState<T>>,
}

impl<T> LazyShared<T> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, LazyState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Unpublishes a failed attempt, unless a different task was published
    /// in the meantime.
    fn clear_value_if(&self, cell: &Arc<TaskCell<T>>) {
        let mut state = self.lock_state();
        if let Some(current) = &state.value {
            if Arc::ptr_eq(current, cell) {
                state.value = None;
            }
        }
    }
}

type FactoryFuture<T> = Pin<Box<dyn Future<Output = Result<T, InitError>> + Send>>;
type FactoryFn<T> = dyn Fn() -> FactoryFuture<T> + Send + Sync;

/// What a `get` call turned out to be: the caller driving a fresh attempt,
/// or an observer of an already-published task.
enum Role<T> {
    Driver(Arc<TaskCell<T>>, Arc<FactoryFn<T>>),
    Observer(Arc<TaskCell<T>>),
}

/// An async lazy-initialization cell.
///
/// The factory is supplied at construction and invoked according to the
/// cell's [`LazyMode`]. `T` must be `Clone` because every caller receives
/// the value; use an `Arc<T>` payload for share-by-reference semantics.
///
/// # Example
///
/// ```ignore
/// use latchkit::{CancelToken, Lazy, LazyMode};
///
/// let lazy = Lazy::new(LazyMode::ExecutionAndPublication, || async {
///     Ok(expensive_setup().await)
/// });
/// let value = lazy.get(&CancelToken::never()).await?;
/// ```
pub struct Lazy<T> {
    mode: LazyMode,
    shared: Arc<LazyShared<T>>,
    exec_gate: Mutex<()>,
}

impl<T> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("mode", &self.mode)
            .field("value_created", &self.is_value_created())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Lazy<T> {
    /// Creates a new cell in `mode` around `factory`.
    #[must_use]
    pub fn new<F, Fut>(mode: LazyMode, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, InitError>> + Send + 'static,
    {
        let factory: Arc<FactoryFn<T>> = Arc::new(move || Box::pin(factory()));
        Self {
            mode,
            shared: Arc::new(LazyShared {
                state: StdMutex::new(LazyState {
                    factory: Some(factory),
                    value: None,
                }),
            }),
            exec_gate: Mutex::new(()),
        }
    }

    /// Returns the configured publication mode.
    #[must_use]
    pub fn mode(&self) -> LazyMode {
        self.mode
    }

    /// Gets the value, initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - [`LazyError::Cancelled`] if `token` fired, or (in non-retry modes)
    ///   if the driving caller was cancelled mid-initialization.
    /// - [`LazyError::Faulted`] if the factory failed, per the mode's
    ///   publication rules.
    pub async fn get(&self, token: &CancelToken) -> Result<T, LazyError> {
        if token.is_cancelled() {
            return Err(LazyError::Cancelled);
        }
        match self.mode {
            LazyMode::Unsynchronized => self.get_unsynchronized(token, false).await,
            LazyMode::UnsynchronizedRetry => self.get_unsynchronized(token, true).await,
            LazyMode::PublicationOnly => self.get_publication_only(token).await,
            LazyMode::ExecutionAndPublication => self.get_serialized(token).await,
            LazyMode::ExecutionAndPublicationRetry => self.get_serialized_retry(token).await,
        }
    }

    /// Shared start logic: publish a fresh running task or attach to the
    /// published one. `retain_factory` keeps the factory alive for retries.
    fn claim_role(&self, retain_factory: bool) -> Role<T> {
        let mut state = self.shared.lock_state();
        if let Some(cell) = &state.value {
            return Role::Observer(Arc::clone(cell));
        }
        let factory = if retain_factory {
            state
                .factory
                .clone()
                .expect("factory retained until a success is published")
        } else {
            state
                .factory
                .take()
                .expect("factory present until the task is published")
        };
        let cell = Arc::new(TaskCell::new());
        state.value = Some(Arc::clone(&cell));
        Role::Driver(cell, factory)
    }

    async fn get_unsynchronized(&self, token: &CancelToken, retry: bool) -> Result<T, LazyError> {
        match self.claim_role(retry) {
            Role::Observer(cell) => Observe::new(cell, token.clone()).await,
            Role::Driver(cell, factory) => {
                let fut = factory();
                let retry_home = retry.then(|| Arc::clone(&self.shared));
                Drive::new(cell, fut, token.clone(), retry_home).await
            }
        }
    }

    async fn get_publication_only(&self, token: &CancelToken) -> Result<T, LazyError> {
        loop {
            // Unsynchronized entry: concurrent callers may each start their
            // own attempt; publication is the only synchronization point.
            // Ok = published task to observe, Err = factory for a private
            // attempt; one lock so the factory cannot vanish in between.
            let entry = {
                let state = self.shared.lock_state();
                match &state.value {
                    Some(cell) => Ok(Arc::clone(cell)),
                    None => Err(state
                        .factory
                        .clone()
                        .expect("factory retained until a success is published")),
                }
            };

            match entry {
                Ok(cell) => return Observe::new(cell, token.clone()).await,
                Err(factory) => {
                    let value = Attempt::new(factory(), token.clone()).await?;

                    let published = {
                        let mut state = self.shared.lock_state();
                        if state.value.is_none() {
                            state.value =
                                Some(Arc::new(TaskCell::completed(InitOutcome::Ready(
                                    value.clone(),
                                ))));
                            state.factory = None;
                            true
                        } else {
                            false
                        }
                    };
                    if published {
                        tracing::trace!("lazy publication-only: attempt published");
                        return Ok(value);
                    }
                    // Lost the publication race: discard our result and
                    // observe the winner on the next pass.
                    tracing::trace!("lazy publication-only: concurrent success discarded");
                }
            }
        }
    }

    async fn get_serialized(&self, token: &CancelToken) -> Result<T, LazyError> {
        let permit = self
            .exec_gate
            .acquire(token)
            .await
            .map_err(|_| LazyError::Cancelled)?;

        let role = self.claim_role(false);
        match role {
            Role::Observer(cell) => {
                drop(permit);
                Observe::new(cell, token.clone()).await
            }
            Role::Driver(cell, factory) => {
                // Factory invocation happens under the gate; the await does
                // not, so later callers attach instead of queueing here.
                let fut = factory();
                drop(permit);
                Drive::new(cell, fut, token.clone(), None).await
            }
        }
    }

    async fn get_serialized_retry(&self, token: &CancelToken) -> Result<T, LazyError> {
        let permit = self
            .exec_gate
            .acquire(token)
            .await
            .map_err(|_| LazyError::Cancelled)?;

        let existing = {
            let state = self.shared.lock_state();
            state.value.as_ref().map(Arc::clone)
        };
        if let Some(cell) = existing {
            drop(permit);
            return Observe::new(cell, token.clone()).await;
        }

        let factory = {
            let state = self.shared.lock_state();
            state
                .factory
                .clone()
                .expect("factory retained until a success is published")
        };

        // The whole attempt runs under the gate; only success publishes.
        let result = Attempt::new(factory(), token.clone()).await;
        if let Ok(value) = &result {
            let mut state = self.shared.lock_state();
            state.value = Some(Arc::new(TaskCell::completed(InitOutcome::Ready(
                value.clone(),
            ))));
            state.factory = None;
        }
        drop(permit);
        result
    }
}

impl<T> Lazy<T> {
    /// True once a task has been published (it may still be running).
    #[must_use]
    pub fn is_value_created(&self) -> bool {
        self.shared.lock_state().value.is_some()
    }

    /// True if the published task has reached a terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.published(|cell| cell.is_completed())
    }

    /// True if the published task completed with a value.
    #[must_use]
    pub fn is_completed_successfully(&self) -> bool {
        self.published(|cell| {
            matches!(cell.lock_state().outcome, Some(InitOutcome::Ready(_)))
        })
    }

    /// True if the published task failed.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.published(|cell| {
            matches!(cell.lock_state().outcome, Some(InitOutcome::Faulted(_)))
        })
    }

    /// True if the published task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.published(|cell| {
            matches!(cell.lock_state().outcome, Some(InitOutcome::Cancelled))
        })
    }

    /// True if a failed attempt would be retried by the next caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.mode.is_retryable()
    }

    /// Snapshot helper over the currently published task; best-effort under
    /// the retry modes, where the published task can change.
    fn published(&self, probe: impl FnOnce(&TaskCell<T>) -> bool) -> bool {
        let cell = {
            let state = self.shared.lock_state();
            state.value.as_ref().map(Arc::clone)
        };
        cell.is_some_and(|cell| probe(&cell))
    }
}

/// Future observing a published task with the caller's own cancellation.
struct Observe<T> {
    cell: Arc<TaskCell<T>>,
    token: CancelToken,
    phase: ObservePhase<T>,
}

enum ObservePhase<T> {
    Init,
    Waiting(WaiterRef<InitOutcome<T>>),
    Done,
}

impl<T: Clone + Send + 'static> Observe<T> {
    fn new(cell: Arc<TaskCell<T>>, token: CancelToken) -> Self {
        Self {
            cell,
            token,
            phase: ObservePhase::Init,
        }
    }
}

impl<T: Clone + Send + 'static> Future for Observe<T> {
    type Output = Result<T, LazyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.phase {
            ObservePhase::Init => {
                if this.token.is_cancelled() {
                    this.phase = ObservePhase::Done;
                    return Poll::Ready(Err(LazyError::Cancelled));
                }

                // Outcome and queue live under one lock, so a completion
                // cannot slip between the check and the enqueue.
                let waiter = {
                    let mut state = this.cell.lock_state();
                    if let Some(outcome) = &state.outcome {
                        let outcome = outcome.clone();
                        drop(state);
                        this.phase = ObservePhase::Done;
                        return Poll::Ready(outcome.into_result());
                    }
                    let waiter = state.pool.rent();
                    waiter.prime(cx.waker());
                    state.waiters.push_back(waiter.clone());
                    waiter
                };

                if this.token.can_be_cancelled() {
                    let cell = Arc::clone(&this.cell);
                    let cb_waiter = waiter.clone();
                    let registration = this.token.register(move || {
                        if let Claim::Won(waker) = cb_waiter.try_claim_cancelled() {
                            let mut batch = WakeBatch::new(WakeMode::Deferred);
                            cell.lock_state().waiters.remove(&cb_waiter);
                            batch.push(waker);
                        }
                    });
                    waiter.attach_registration(registration);
                }
                this.phase = ObservePhase::Waiting(waiter);
                Poll::Pending
            }
            ObservePhase::Waiting(waiter) => match waiter.poll_outcome(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(resolution) => {
                    let ObservePhase::Waiting(waiter) =
                        std::mem::replace(&mut this.phase, ObservePhase::Done)
                    else {
                        unreachable!("phase changed during poll");
                    };
                    this.cell.finish_rental(waiter);
                    match resolution {
                        WaitOutcome::Granted(outcome) => Poll::Ready(outcome.into_result()),
                        WaitOutcome::Cancelled => Poll::Ready(Err(LazyError::Cancelled)),
                    }
                }
            },
            ObservePhase::Done => panic!("lazy observer polled after completion"),
        }
    }
}

impl<T> Drop for Observe<T> {
    fn drop(&mut self) {
        let phase = std::mem::replace(&mut self.phase, ObservePhase::Done);
        let ObservePhase::Waiting(waiter) = phase else {
            return;
        };
        match waiter.try_claim_cancelled() {
            Claim::Won(_own_waker) => {
                self.cell.lock_state().waiters.remove(&waiter);
                let _ = waiter.take_outcome();
                self.cell.finish_rental(waiter);
            }
            Claim::Lost => {
                // Outcome delivered but never consumed; values are clones,
                // so dropping it is harmless.
                let _ = waiter.take_outcome();
                self.cell.finish_rental(waiter);
            }
        }
    }
}

/// Future that drives the factory and publishes the outcome into a shared
/// task, translating the driver's cancellation into the task state.
struct Drive<T: Clone> {
    cell: Arc<TaskCell<T>>,
    fut: FactoryFuture<T>,
    cancel: WaitCancelled,
    /// Present for retry modes: the home to unpublish a failure from (and
    /// to drop the factory in once a success is final).
    retry_home: Option<Arc<LazyShared<T>>>,
    finished: bool,
}

impl<T: Clone> Drive<T> {
    fn new(
        cell: Arc<TaskCell<T>>,
        fut: FactoryFuture<T>,
        token: CancelToken,
        retry_home: Option<Arc<LazyShared<T>>>,
    ) -> Self {
        Self {
            cell,
            fut,
            cancel: token.cancelled(),
            retry_home,
            finished: false,
        }
    }

    fn settle_failure(&self) {
        if let Some(shared) = &self.retry_home {
            shared.clear_value_if(&self.cell);
        }
    }
}

impl<T: Clone + Send + 'static> Future for Drive<T> {
    type Output = Result<T, LazyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.finished, "drive future polled after completion");

        if Pin::new(&mut this.cancel).poll(cx).is_ready() {
            this.finished = true;
            this.cell.complete(InitOutcome::Cancelled);
            this.settle_failure();
            return Poll::Ready(Err(LazyError::Cancelled));
        }

        match this.fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => {
                this.finished = true;
                this.cell.complete(InitOutcome::Ready(value.clone()));
                if let Some(shared) = &this.retry_home {
                    // Success is final: the factory can be dropped now.
                    shared.lock_state().factory = None;
                }
                Poll::Ready(Ok(value))
            }
            Poll::Ready(Err(err)) => {
                this.finished = true;
                this.cell.complete(InitOutcome::Faulted(Arc::clone(&err)));
                this.settle_failure();
                Poll::Ready(Err(LazyError::Faulted(err)))
            }
        }
    }
}

impl<T: Clone> Drop for Drive<T> {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned mid-flight: observers must not hang.
            self.cell.complete(InitOutcome::Cancelled);
            self.settle_failure();
        }
    }
}

/// Future for a private, unpublished attempt: factory raced against the
/// caller's cancellation, nothing shared on failure.
struct Attempt<T> {
    fut: FactoryFuture<T>,
    cancel: WaitCancelled,
}

impl<T> Attempt<T> {
    fn new(fut: FactoryFuture<T>, token: CancelToken) -> Self {
        Self {
            fut,
            cancel: token.cancelled(),
        }
    }
}

impl<T> Future for Attempt<T> {
    type Output = Result<T, LazyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if Pin::new(&mut this.cancel).poll(cx).is_ready() {
            return Poll::Ready(Err(LazyError::Cancelled));
        }
        match this.fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(LazyError::Faulted(err))),
        }
    }
}
