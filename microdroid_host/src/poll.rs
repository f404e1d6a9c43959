// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded polling.

use crate::error::HarnessError;
use std::cell::Cell;
use std::fmt::Debug;
use std::time::Duration;
use std::time::Instant;

/// Default interval between polls.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// A source of elapsed time that can also be slept on.
pub trait Clock {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
    /// Blocks for `duration`.
    fn sleep(&self, duration: Duration);
}

/// The wall clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only advances when slept on.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    /// Creates a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock without sleeping.
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Calls `fetch` every `interval` until `predicate` holds for its result,
/// for at most `timeout`.
///
/// After the deadline passes one final fetch is made, so a value that became
/// ready during the last sleep is not lost. Errors from `fetch` are returned
/// immediately. On timeout the error carries the last fetched value.
pub fn poll_until<T: Debug>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    mut fetch: impl FnMut() -> Result<T, HarnessError>,
    mut predicate: impl FnMut(&T) -> bool,
) -> Result<T, HarnessError> {
    let start = clock.now();
    while clock.now() - start < timeout {
        let value = fetch()?;
        if predicate(&value) {
            return Ok(value);
        }
        clock.sleep(interval);
    }
    let value = fetch()?;
    if predicate(&value) {
        return Ok(value);
    }
    Err(HarnessError::Timeout {
        elapsed: clock.now() - start,
        last: format!("{value:?}"),
    })
}
