// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Retry with exponential backoff and a per-attempt deadline.
//!
//! Gateway calls go through [`retry_with_predicate`]: each attempt runs under
//! `attempt_timeout`, an elapsed deadline counts as a network failure, and
//! only errors accepted by the predicate are retried.

use crate::error::PaymentError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for the exponential delay.
    pub max_delay: Duration,
    pub multiplier: u32,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy that makes a single attempt.
    pub fn no_retry(attempt_timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            attempt_timeout,
            ..Self::default()
        }
    }

    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.multiplier
            .checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retriable error, or
/// the retry budget is spent. The last error is returned.
pub async fn retry_with_predicate<F, Fut, T, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retriable: P,
) -> Result<T, PaymentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PaymentError>>,
    P: Fn(&PaymentError) -> bool,
{
    let mut attempt = 0;
    loop {
        let outcome = match timeout(policy.attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::GatewayNetwork(format!(
                "deadline of {}ms elapsed",
                policy.attempt_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "gateway call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && is_retriable(&err) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "gateway call failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if attempt > 0 {
                    tracing::error!(attempt, error = %err, "gateway call failed after retries");
                }
                return Err(err);
            }
        }
    }
}

/// Retries only transient gateway failures.
pub async fn retry_gateway<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, PaymentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PaymentError>>,
{
    retry_with_predicate(policy, operation, |err| {
        matches!(err, PaymentError::GatewayNetwork(_))
    })
    .await
}
