#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

pub use latchkit::test_utils::{cancel_after, init_test_logging, noop_waker, poll_once, yield_now};
pub use latchkit::{assert_with_log, test_complete, test_phase, test_section};

/// Small deterministic RNG (xorshift64*) so fuzz-style tests are
/// reproducible without extra dependencies.
#[derive(Debug, Clone)]
pub struct TestRng {
    state: u64,
}

impl TestRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `0..bound`.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }
}

pub fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}
