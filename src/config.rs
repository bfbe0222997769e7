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

//! Engine configuration.
//!
//! Durations serialize as integer milliseconds so the struct can be loaded
//! from any serde format the host already uses for its settings.

use crate::error::PaymentError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a segment may sit in `ORDERED` before the sweep looks at it.
    #[serde(with = "duration_ms")]
    pub order_ttl: Duration,
    /// Deadline applied to every individual gateway call.
    #[serde(with = "duration_ms")]
    pub gateway_timeout: Duration,
    /// Retries on transient gateway failures, after the first attempt.
    pub gateway_retries: u32,
    /// Delay before the first retry; doubled on each subsequent one.
    #[serde(with = "duration_ms")]
    pub gateway_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Longest wait for a booking lock before an operation gives up with
    /// `Conflict`.
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    /// Minor units per major unit (100 for paise per rupee).
    pub currency_minor_unit_factor: u32,
    pub currency: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            order_ttl: Duration::from_secs(15 * 60),
            gateway_timeout: Duration::from_secs(10),
            gateway_retries: 3,
            gateway_backoff: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(2),
            currency_minor_unit_factor: 100,
            currency: "INR".to_string(),
        }
    }
}

impl Config {
    /// # Errors
    ///
    /// [`PaymentError::BadRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.currency_minor_unit_factor == 0 {
            return Err(PaymentError::BadRequest(
                "currency_minor_unit_factor must be positive".into(),
            ));
        }
        if self.gateway_timeout.is_zero() {
            return Err(PaymentError::BadRequest(
                "gateway_timeout must be positive".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(PaymentError::BadRequest(
                "sweep_interval must be positive".into(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(PaymentError::BadRequest(
                "lock_timeout must be positive".into(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(PaymentError::BadRequest("currency must be set".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.gateway_retries,
            initial_delay: self.gateway_backoff,
            max_delay: self.gateway_timeout,
            multiplier: 2,
            attempt_timeout: self.gateway_timeout,
        }
    }

    #[must_use]
    pub fn with_order_ttl(mut self, ttl: Duration) -> Self {
        self.order_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_gateway_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.gateway_retries = retries;
        self.gateway_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
