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

//! Thread-safe log of captured gateway payments.
//!
//! A gateway payment id may settle exactly one segment. The log reserves the
//! payment id before the ledger posting, commits it once the segment is
//! `PAID`, and queues committed captures for whoever notifies customers.

use crate::base::{BookingId, EntryId, OrderId, PaymentId, SegmentId};
use crate::error::PaymentError;
use crate::money::Money;
use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

/// A committed capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capture {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub booking_id: BookingId,
    pub segment_id: SegmentId,
    pub entry_id: EntryId,
    pub amount: Money,
    pub captured_at: DateTime<Utc>,
}

/// Payment-id registry with an ordered outbox of committed captures.
///
/// Combines a [`DashMap`] for atomic check-and-reserve with a [`SegQueue`]
/// that preserves commit order.
#[derive(Debug)]
pub struct CaptureLog {
    /// Payment id to the segment it settles.
    owners: DashMap<PaymentId, SegmentId>,

    /// Committed captures not yet drained, in commit order.
    outbox: SegQueue<Capture>,
}

impl CaptureLog {
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
            outbox: SegQueue::new(),
        }
    }

    /// Claims `payment_id` for `segment_id`.
    ///
    /// Claiming again for the same segment succeeds.
    ///
    /// # Errors
    ///
    /// [`PaymentError::OrderMismatch`] if the payment id already settles a
    /// different segment.
    pub fn reserve(&self, payment_id: &PaymentId, segment_id: SegmentId) -> Result<(), PaymentError> {
        match self.owners.entry(payment_id.clone()) {
            Entry::Occupied(owner) if *owner.get() != segment_id => {
                Err(PaymentError::OrderMismatch)
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(segment_id);
                Ok(())
            }
        }
    }

    /// Drops a reservation whose posting was abandoned.
    pub fn release(&self, payment_id: &PaymentId, segment_id: SegmentId) {
        self.owners
            .remove_if(payment_id, |_, owner| *owner == segment_id);
    }

    pub fn commit(&self, capture: Capture) {
        self.outbox.push(capture);
    }

    pub fn owner(&self, payment_id: &PaymentId) -> Option<SegmentId> {
        self.owners.get(payment_id).map(|o| *o.value())
    }

    /// Takes every committed capture queued so far, oldest first.
    pub fn drain(&self) -> Vec<Capture> {
        std::iter::from_fn(|| self.outbox.pop()).collect()
    }
}

impl Default for CaptureLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(payment: &str, segment: u64) -> Capture {
        Capture {
            payment_id: PaymentId::new(payment),
            order_id: OrderId::new("order_1"),
            booking_id: BookingId(1),
            segment_id: SegmentId(segment),
            entry_id: EntryId(1),
            amount: Money::new(100),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn payment_id_settles_one_segment() {
        let log = CaptureLog::new();
        let payment = PaymentId::new("pay_1");
        log.reserve(&payment, SegmentId(1)).unwrap();
        log.reserve(&payment, SegmentId(1)).unwrap();
        assert_eq!(
            log.reserve(&payment, SegmentId(2)),
            Err(PaymentError::OrderMismatch)
        );
        assert_eq!(log.owner(&payment), Some(SegmentId(1)));
    }

    #[test]
    fn release_frees_only_own_reservation() {
        let log = CaptureLog::new();
        let payment = PaymentId::new("pay_1");
        log.reserve(&payment, SegmentId(1)).unwrap();
        log.release(&payment, SegmentId(2));
        assert_eq!(log.owner(&payment), Some(SegmentId(1)));
        log.release(&payment, SegmentId(1));
        assert_eq!(log.owner(&payment), None);
    }

    #[test]
    fn drain_preserves_commit_order() {
        let log = CaptureLog::new();
        log.commit(capture("pay_1", 1));
        log.commit(capture("pay_2", 2));
        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payment_id, PaymentId::new("pay_1"));
        assert_eq!(drained[1].payment_id, PaymentId::new("pay_2"));
        assert!(log.drain().is_empty());
    }
}
