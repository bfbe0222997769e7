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

//! Read-side projections over segments and the ledger.
//!
//! Nothing here takes a write lock. Segment views are snapshots cloned under
//! the booking's read lock and may trail a concurrent capture by one commit.

use crate::authz::{self, Actor};
use crate::base::BookingId;
use crate::engine::SegmentEngine;
use crate::error::PaymentError;
use crate::ledger::LedgerSummary;
use crate::money::Money;
use crate::segment::{PaymentSegment, SegmentState};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentProgress {
    pub booking_id: BookingId,
    pub total: Money,
    pub paid: Money,
    /// Still collectable: segments not yet paid or cancelled.
    pub pending: Money,
    pub cancelled: Money,
    /// Lowest-index segment waiting to be ordered.
    pub next_due: Option<PaymentSegment>,
    pub segments: Vec<PaymentSegment>,
}

impl PaymentProgress {
    pub fn is_settled(&self) -> bool {
        self.pending.is_zero()
    }
}

fn total_in<'a, I>(segments: I, states: &[SegmentState]) -> Result<Money, PaymentError>
where
    I: IntoIterator<Item = &'a PaymentSegment>,
{
    Money::sum(
        segments
            .into_iter()
            .filter(|s| states.contains(&s.state))
            .map(|s| s.amount),
    )
}

const OPEN_STATES: [SegmentState; 3] = [
    SegmentState::Pending,
    SegmentState::Ordered,
    SegmentState::Failed,
];

impl SegmentEngine {
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] unless the actor owns the booking or is
    /// an admin; [`PaymentError::BookingNotFound`] for unknown bookings.
    pub async fn payment_progress(
        &self,
        booking_id: BookingId,
        actor: &Actor,
    ) -> Result<PaymentProgress, PaymentError> {
        let (booking, _) = self.authorize(booking_id, actor).await?;
        let segments = self.segments().list(booking_id);
        let paid = total_in(&segments, &[SegmentState::Paid])?;
        let pending = total_in(&segments, &OPEN_STATES)?;
        let cancelled = total_in(&segments, &[SegmentState::Cancelled])?;
        let next_due = segments
            .iter()
            .find(|s| s.state == SegmentState::Pending)
            .cloned();
        tracing::debug!(booking_id = %booking_id, segments = segments.len(), "payment progress read");
        Ok(PaymentProgress {
            booking_id,
            total: booking.total_amount,
            paid,
            pending,
            cancelled,
            next_due,
            segments,
        })
    }

    /// Segments that still expect money: `PENDING`, `ORDERED` or `FAILED`.
    ///
    /// # Errors
    ///
    /// As [`SegmentEngine::payment_progress`].
    pub async fn pending_segments(
        &self,
        booking_id: BookingId,
        actor: &Actor,
    ) -> Result<Vec<PaymentSegment>, PaymentError> {
        self.authorize(booking_id, actor).await?;
        Ok(self
            .segments()
            .list(booking_id)
            .into_iter()
            .filter(|s| OPEN_STATES.contains(&s.state))
            .collect())
    }

    /// # Errors
    ///
    /// As [`SegmentEngine::payment_progress`].
    pub async fn paid_segments(
        &self,
        booking_id: BookingId,
        actor: &Actor,
    ) -> Result<Vec<PaymentSegment>, PaymentError> {
        self.authorize(booking_id, actor).await?;
        Ok(self
            .segments()
            .list(booking_id)
            .into_iter()
            .filter(|s| s.state == SegmentState::Paid)
            .collect())
    }

    /// Ledger-wide totals. Admin only.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins.
    pub fn financial_summary(&self, actor: &Actor) -> Result<LedgerSummary, PaymentError> {
        authz::require_admin(actor)?;
        self.ledger().summary()
    }
}
