//! Cancellation tokens for pending acquisitions.
//!
//! This module provides [`CancelToken`] for requesting cancellation of a
//! pending acquire, [`CancelRegistration`] for callback lifecycle
//! management, and [`WaitCancelled`] for awaiting a token from async code.
//!
//! Cancellation is a protocol, not a silent drop: a registered callback runs
//! at most once, and disposing a registration blocks until an in-flight
//! callback has returned. That last property is load-bearing for waiter
//! reuse: a primitive may only recycle a waiter once it knows no
//! cancellation callback can still touch it.

mod token;

pub use token::{CancelRegistration, CancelToken, WaitCancelled};
