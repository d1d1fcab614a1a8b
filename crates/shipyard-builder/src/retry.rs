// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-budget retry for dock and network allocator calls.
//!
//! There is no overall deadline: an operation that always fails is attempted
//! exactly `attempts` times and the last error is returned.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Attempt budget and pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    /// Create a policy. A zero attempt count is treated as one attempt.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Single attempt, no pause.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Attempt budget.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pause between attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => {
                    error!(
                        operation,
                        attempt_count = attempt,
                        error = %e,
                        "Final failure"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        operation,
                        attempt_count = attempt,
                        error = %e,
                        "Attempt failure"
                    );
                    attempt += 1;
                    if !self.interval.is_zero() {
                        tokio::time::sleep(self.interval).await;
                    }
                }
            }
        }
    }
}
