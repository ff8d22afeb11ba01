#![allow(missing_docs)]
//! End-to-end lazy-cell behavior across the five publication modes, with
//! real thread contention on the factory.

#[macro_use]
mod common;

use common::*;
use futures_lite::future::block_on;
use latchkit::{CancelToken, InitError, Lazy, LazyError, LazyMode};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct Boom;

impl fmt::Display for Boom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factory failure")
    }
}

impl std::error::Error for Boom {}

/// Factory that sleeps, then returns a distinct instance id per invocation.
fn slow_counting_factory(
    calls: Arc<AtomicUsize>,
    delay: Duration,
) -> impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize, InitError>> + Send>>
       + Send
       + Sync
       + 'static {
    move || {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            let instance = calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(delay);
            Ok(instance)
        })
    }
}

#[test]
fn serialized_mode_runs_factory_once_for_ten_callers() {
    init_test("serialized_mode_runs_factory_once_for_ten_callers");
    const CALLERS: usize = 10;

    let calls = Arc::new(AtomicUsize::new(0));
    let lazy = Arc::new(Lazy::new(LazyMode::ExecutionAndPublication, {
        let factory = slow_counting_factory(Arc::clone(&calls), Duration::from_millis(30));
        move || factory()
    }));

    let start = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let lazy = Arc::clone(&lazy);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                block_on(lazy.get(&CancelToken::never()))
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("caller thread").expect("get succeeds"))
        .collect();

    assert_with_log!(
        calls.load(Ordering::SeqCst) == 1,
        "exactly one factory invocation",
        1usize,
        calls.load(Ordering::SeqCst)
    );
    let all_same = results.iter().all(|value| *value == results[0]);
    assert_with_log!(all_same, "all callers observe the same instance", true, all_same);
    test_complete!("serialized_mode_runs_factory_once_for_ten_callers");
}

#[test]
fn serialized_retry_gives_each_caller_its_own_failure() {
    init_test("serialized_retry_gives_each_caller_its_own_failure");
    const CALLERS: usize = 10;

    let calls = Arc::new(AtomicUsize::new(0));
    let lazy = Arc::new(Lazy::new(LazyMode::ExecutionAndPublicationRetry, {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<usize, _>(Arc::new(Boom) as InitError)
            })
        }
    }));

    let start = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let lazy = Arc::clone(&lazy);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                block_on(lazy.get(&CancelToken::never()))
            })
        })
        .collect();

    let mut failures = 0usize;
    for handle in handles {
        match handle.join().expect("caller thread") {
            Err(LazyError::Faulted(_)) => failures += 1,
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    let invocations = calls.load(Ordering::SeqCst);
    assert_with_log!(failures == CALLERS, "every caller fails", CALLERS, failures);
    assert_with_log!(
        (2..=CALLERS).contains(&invocations),
        "attempts serialized, one per caller",
        CALLERS,
        invocations
    );
    // The factory is still live: another caller triggers another attempt.
    let retry = block_on(lazy.get(&CancelToken::never()));
    assert_with_log!(retry.is_err(), "still failing", true, retry.is_err());
    assert_with_log!(
        calls.load(Ordering::SeqCst) == invocations + 1,
        "factory not dropped",
        invocations + 1,
        calls.load(Ordering::SeqCst)
    );
    test_complete!("serialized_retry_gives_each_caller_its_own_failure");
}

#[test]
fn publication_only_discards_concurrent_successes() {
    init_test("publication_only_discards_concurrent_successes");
    const CALLERS: usize = 10;

    let calls = Arc::new(AtomicUsize::new(0));
    let lazy = Arc::new(Lazy::new(LazyMode::PublicationOnly, {
        let factory = slow_counting_factory(Arc::clone(&calls), Duration::from_millis(30));
        move || factory()
    }));

    let start = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let lazy = Arc::clone(&lazy);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                block_on(lazy.get(&CancelToken::never()))
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("caller thread").expect("get succeeds"))
        .collect();

    let invocations = calls.load(Ordering::SeqCst);
    assert_with_log!(
        (2..=CALLERS).contains(&invocations),
        "contending callers each attempted",
        CALLERS,
        invocations
    );
    let all_same = results.iter().all(|value| *value == results[0]);
    assert_with_log!(
        all_same,
        "exactly one published instance observed by all",
        true,
        all_same
    );
    assert_with_log!(
        lazy.is_completed_successfully(),
        "published task successful",
        true,
        lazy.is_completed_successfully()
    );
    test_complete!("publication_only_discards_concurrent_successes");
}

#[test]
fn publication_only_failures_never_publish() {
    init_test("publication_only_failures_never_publish");
    const CALLERS: usize = 4;

    let calls = Arc::new(AtomicUsize::new(0));
    let lazy = Arc::new(Lazy::new(LazyMode::PublicationOnly, {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                Err::<usize, _>(Arc::new(Boom) as InitError)
            })
        }
    }));

    let start = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let lazy = Arc::clone(&lazy);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                block_on(lazy.get(&CancelToken::never()))
            })
        })
        .collect();

    for handle in handles {
        let result = handle.join().expect("caller thread");
        assert_with_log!(
            matches!(result, Err(LazyError::Faulted(_))),
            "each caller observes its own failure",
            true,
            result.is_err()
        );
    }
    assert_with_log!(
        !lazy.is_value_created(),
        "no task published on failure",
        false,
        lazy.is_value_created()
    );
    test_complete!("publication_only_failures_never_publish");
}

#[test]
fn unsynchronized_cancellation_is_permanent() {
    init_test("unsynchronized_cancellation_is_permanent");
    let calls = Arc::new(AtomicUsize::new(0));
    let lazy = Arc::new(Lazy::new(LazyMode::Unsynchronized, {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Never completes on its own; cancellation must win.
                futures_lite::future::pending::<()>().await;
                Ok(0usize)
            })
        }
    }));

    let token = CancelToken::new();
    cancel_after(&token, Duration::from_millis(10));
    let driver = block_on(lazy.get(&token));
    assert_with_log!(
        matches!(driver, Err(LazyError::Cancelled)),
        "driver observes cancellation",
        true,
        driver.is_err()
    );

    // Non-retry: the cancelled task is the permanent published state.
    assert_with_log!(lazy.is_cancelled(), "task cancelled", true, lazy.is_cancelled());
    let later = block_on(lazy.get(&CancelToken::never()));
    assert_with_log!(
        matches!(later, Err(LazyError::Cancelled)),
        "later callers observe the cancelled task",
        true,
        later.is_err()
    );
    assert_with_log!(
        calls.load(Ordering::SeqCst) == 1,
        "factory never re-invoked",
        1usize,
        calls.load(Ordering::SeqCst)
    );
    test_complete!("unsynchronized_cancellation_is_permanent");
}

#[test]
fn unsynchronized_retry_recovers_after_cancellation() {
    init_test("unsynchronized_retry_recovers_after_cancellation");
    let calls = Arc::new(AtomicUsize::new(0));
    let lazy = Arc::new(Lazy::new(LazyMode::UnsynchronizedRetry, {
        let calls = Arc::clone(&calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    // First attempt hangs until cancelled.
                    futures_lite::future::pending::<()>().await;
                }
                Ok(42usize)
            })
        }
    }));

    let token = CancelToken::new();
    cancel_after(&token, Duration::from_millis(10));
    let first = block_on(lazy.get(&token));
    assert_with_log!(
        matches!(first, Err(LazyError::Cancelled)),
        "first caller cancelled",
        true,
        first.is_err()
    );
    assert_with_log!(
        !lazy.is_value_created(),
        "cancelled attempt unpublished",
        false,
        lazy.is_value_created()
    );

    let second = block_on(lazy.get(&CancelToken::never())).expect("retry succeeds");
    assert_with_log!(second == 42, "value from retry", 42usize, second);
    assert_with_log!(
        calls.load(Ordering::SeqCst) == 2,
        "two attempts",
        2usize,
        calls.load(Ordering::SeqCst)
    );
    test_complete!("unsynchronized_retry_recovers_after_cancellation");
}

#[test]
fn observers_share_one_running_attempt() {
    init_test("observers_share_one_running_attempt");
    const OBSERVERS: usize = 6;

    let calls = Arc::new(AtomicUsize::new(0));
    let lazy = Arc::new(Lazy::new(LazyMode::ExecutionAndPublication, {
        let factory = slow_counting_factory(Arc::clone(&calls), Duration::from_millis(40));
        move || factory()
    }));

    // One driver starts, then observers pile in while the factory sleeps.
    let driver = {
        let lazy = Arc::clone(&lazy);
        thread::spawn(move || block_on(lazy.get(&CancelToken::never())))
    };
    thread::sleep(Duration::from_millis(10));

    let observers: Vec<_> = (0..OBSERVERS)
        .map(|_| {
            let lazy = Arc::clone(&lazy);
            thread::spawn(move || block_on(lazy.get(&CancelToken::never())))
        })
        .collect();

    let driver_value = driver.join().expect("driver").expect("driver succeeds");
    for observer in observers {
        let value = observer.join().expect("observer").expect("observer succeeds");
        assert_with_log!(value == driver_value, "same instance", driver_value, value);
    }
    assert_with_log!(
        calls.load(Ordering::SeqCst) == 1,
        "one factory run shared by everyone",
        1usize,
        calls.load(Ordering::SeqCst)
    );
    test_complete!("observers_share_one_running_attempt");
}
