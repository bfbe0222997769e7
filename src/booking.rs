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

//! Booking lookups.
//!
//! Bookings belong to the host application. The payment core only reads who
//! owns a booking and what it costs, through [`BookingResolver`], and treats
//! the answer as valid for the current operation only.

use crate::base::{BookingId, UserId};
use crate::error::PaymentError;
use crate::money::Money;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Snapshot of the booking fields the payment core depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRef {
    pub booking_id: BookingId,
    pub customer_id: UserId,
    pub worker_id: Option<UserId>,
    pub total_amount: Money,
    pub is_finalized: bool,
}

#[async_trait]
pub trait BookingResolver: Send + Sync {
    /// # Errors
    ///
    /// [`PaymentError::BookingNotFound`] for an unknown booking, or
    /// [`PaymentError::StoreUnavailable`] if the host cannot answer.
    async fn resolve(&self, booking_id: BookingId) -> Result<BookingRef, PaymentError>;
}

/// Resolver backed by a concurrent map, for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct InMemoryBookings {
    bookings: DashMap<BookingId, BookingRef>,
}

impl InMemoryBookings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, booking: BookingRef) {
        self.bookings.insert(booking.booking_id, booking);
    }

    /// Registers a finalized booking for `customer_id`.
    pub fn add_finalized(&self, booking_id: BookingId, customer_id: UserId, total: Money) {
        self.insert(BookingRef {
            booking_id,
            customer_id,
            worker_id: None,
            total_amount: total,
            is_finalized: true,
        });
    }

    pub fn assign_worker(&self, booking_id: BookingId, worker_id: UserId) -> bool {
        self.bookings
            .get_mut(&booking_id)
            .map(|mut b| b.worker_id = Some(worker_id))
            .is_some()
    }

    pub fn remove(&self, booking_id: BookingId) -> Option<BookingRef> {
        self.bookings.remove(&booking_id).map(|(_, b)| b)
    }
}

#[async_trait]
impl BookingResolver for InMemoryBookings {
    async fn resolve(&self, booking_id: BookingId) -> Result<BookingRef, PaymentError> {
        self.bookings
            .get(&booking_id)
            .map(|b| b.value().clone())
            .ok_or(PaymentError::BookingNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_bookings() {
        let bookings = InMemoryBookings::new();
        bookings.add_finalized(BookingId(1), UserId(10), Money::new(500));
        assert!(bookings.assign_worker(BookingId(1), UserId(20)));

        let booking = bookings.resolve(BookingId(1)).await.unwrap();
        assert_eq!(booking.customer_id, UserId(10));
        assert_eq!(booking.worker_id, Some(UserId(20)));
        assert!(booking.is_finalized);

        assert_eq!(
            bookings.resolve(BookingId(2)).await,
            Err(PaymentError::BookingNotFound)
        );
    }
}
