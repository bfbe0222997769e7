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

//! Integer money in the smallest currency unit.
//!
//! Amounts never touch floating point. Arithmetic is checked: overflowing an
//! addition or taking a subtraction below zero is an
//! [`PaymentError::Arithmetic`] rather than a wrapped or saturated value.
//!
//! # Example
//!
//! ```
//! use segment_ledger::Money;
//!
//! let advance = Money::new(200_000);
//! let rest = Money::new(800_000);
//! let total = advance.add(rest).unwrap();
//! assert_eq!(total.format(100), "10000.00");
//! ```

use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Non-negative amount in minor units (paise, cents).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn new(minor: u64) -> Self {
        Self(minor)
    }

    pub const fn minor(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// # Errors
    ///
    /// [`PaymentError::Arithmetic`] on `u64` overflow.
    pub fn add(self, other: Money) -> Result<Money, PaymentError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(PaymentError::Arithmetic)
    }

    /// # Errors
    ///
    /// [`PaymentError::Arithmetic`] if `other` is larger than `self`.
    pub fn sub(self, other: Money) -> Result<Money, PaymentError> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or(PaymentError::Arithmetic)
    }

    /// Sums amounts, failing on the first overflow.
    pub fn sum<I>(amounts: I) -> Result<Money, PaymentError>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, amount| acc.add(amount))
    }

    /// Signed view used by the cash/bank balance.
    pub fn as_signed(&self) -> Result<i64, PaymentError> {
        i64::try_from(self.0).map_err(|_| PaymentError::Arithmetic)
    }

    /// Renders the amount in major units.
    ///
    /// `factor` is the number of minor units per major unit. The number of
    /// decimal places is the number of digits needed to print `factor - 1`.
    pub fn format(&self, factor: u32) -> String {
        format_minor(i128::from(self.0), factor)
    }

    /// The amount in major units, for reports that feed spreadsheets.
    pub fn to_major(&self, factor: u32) -> Decimal {
        Decimal::from(self.0) / Decimal::from(factor.max(1))
    }
}

/// Renders a signed minor-unit value in major units.
pub(crate) fn format_minor(minor: i128, factor: u32) -> String {
    let factor = factor.max(1);
    let places = (factor - 1).checked_ilog10().map_or(0, |d| d + 1);
    let Ok(minor) = i64::try_from(minor) else {
        return minor.to_string();
    };
    let mut value = Decimal::from(minor) / Decimal::from(factor);
    value.rescale(places);
    value.to_string()
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Money {
    fn from(minor: u64) -> Self {
        Money(minor)
    }
}
