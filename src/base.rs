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

//! Core identifier types for bookings, segments, ledger entries and gateway references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a booking owned by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct BookingId(pub u64);

/// Identifier of a payment segment.
///
/// Allocated from a monotonically increasing counter, so a larger id was
/// created later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

/// Identifier of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

/// Identifier of a platform user (customer, worker or admin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Order id issued by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

/// Payment id issued by the payment gateway once an order is captured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PaymentId(pub String);

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_inner!(BookingId, SegmentId, EntryId, UserId, OrderId, PaymentId);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PaymentId {
    const SWEPT_PREFIX: &'static str = "sweep:";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Placeholder for a capture found by the sweep when the gateway did not
    /// name the payment.
    pub fn swept(order_id: &OrderId) -> Self {
        Self(format!("{}{order_id}", Self::SWEPT_PREFIX))
    }

    pub fn is_swept(&self) -> bool {
        self.0.starts_with(Self::SWEPT_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SegmentId {
    /// Idempotency key handed to the gateway when ordering this segment.
    pub fn reference_tag(&self) -> String {
        format!("seg:{}", self.0)
    }
}

/// Monotonic id allocator shared by the stores.
#[derive(Debug)]
pub(crate) struct IdSequence(AtomicU64);

impl IdSequence {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_tag_is_derived_from_segment_id() {
        assert_eq!(SegmentId(42).reference_tag(), "seg:42");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&BookingId(7)).unwrap();
        assert_eq!(json, "7");
        let json = serde_json::to_string(&OrderId::new("order_1")).unwrap();
        assert_eq!(json, "\"order_1\"");
    }

    #[test]
    fn sequence_starts_at_one_and_increases() {
        let seq = IdSequence::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }
}
