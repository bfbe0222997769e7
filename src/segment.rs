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

//! Payment segments and their store.
//!
//! A booking's price is split into an ordered, dense list of segments. Each
//! segment follows a small state machine:
//!
//! ```text
//!  PENDING ──order──► ORDERED ──capture──► PAID
//!     │                  │
//!     └─cancel─► CANCELLED └─fail─► FAILED ──retry──► PENDING
//! ```
//!
//! All segments of one booking sit behind a single [`RwLock`]. Its write
//! guard is the booking's advisory lock: every state change happens inside
//! [`SegmentStore::with_booking`], and readers take the read side only long
//! enough to clone a snapshot.

use crate::base::{BookingId, EntryId, IdSequence, OrderId, PaymentId, SegmentId};
use crate::error::PaymentError;
use crate::money::Money;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentState {
    Pending,
    Ordered,
    Paid,
    Failed,
    Cancelled,
}

impl SegmentState {
    /// Edges of the segment state machine.
    pub fn can_transition_to(self, next: SegmentState) -> bool {
        use SegmentState::*;
        matches!(
            (self, next),
            (Pending, Ordered)
                | (Pending, Cancelled)
                | (Ordered, Paid)
                | (Ordered, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentState::Paid | SegmentState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentState::Pending => "PENDING",
            SegmentState::Ordered => "ORDERED",
            SegmentState::Paid => "PAID",
            SegmentState::Failed => "FAILED",
            SegmentState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentKind {
    Advance,
    Milestone,
    Final,
}

/// One line of a segment plan as submitted when a booking is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPlanItem {
    pub amount: Money,
    pub label: String,
    pub kind: SegmentKind,
    pub due_at: Option<DateTime<Utc>>,
}

impl SegmentPlanItem {
    pub fn new(amount: u64, label: impl Into<String>, kind: SegmentKind) -> Self {
        Self {
            amount: Money::new(amount),
            label: label.into(),
            kind,
            due_at: None,
        }
    }

    #[must_use]
    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSegment {
    pub id: SegmentId,
    pub booking_id: BookingId,
    pub index: u32,
    pub amount: Money,
    pub label: String,
    pub kind: SegmentKind,
    pub due_at: Option<DateTime<Utc>>,
    pub state: SegmentState,
    pub gateway_order_id: Option<OrderId>,
    pub gateway_payment_id: Option<PaymentId>,
    pub ledger_entry_id: Option<EntryId>,
    /// Why the segment last went to `FAILED` or `CANCELLED`.
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ordered_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Checks the shape of a plan against the booking total.
///
/// # Errors
///
/// - [`PaymentError::BadRequest`] for an empty plan, a zero amount, a missing
///   or misplaced `FINAL` segment, or an `ADVANCE` after a `MILESTONE`.
/// - [`PaymentError::SumMismatch`] if the amounts do not add up to `total`.
/// - [`PaymentError::Arithmetic`] if the amounts overflow.
pub fn validate_plan(total: Money, items: &[SegmentPlanItem]) -> Result<(), PaymentError> {
    let Some(last) = items.last() else {
        return Err(PaymentError::BadRequest("segment plan is empty".into()));
    };
    if items.iter().any(|item| item.amount.is_zero()) {
        return Err(PaymentError::BadRequest(
            "segment amounts must be positive".into(),
        ));
    }
    if last.kind != SegmentKind::Final
        || items.iter().filter(|i| i.kind == SegmentKind::Final).count() != 1
    {
        return Err(PaymentError::BadRequest(
            "plan must end with exactly one FINAL segment".into(),
        ));
    }
    let first_milestone = items
        .iter()
        .position(|i| i.kind == SegmentKind::Milestone)
        .unwrap_or(items.len());
    if items[first_milestone..]
        .iter()
        .any(|i| i.kind == SegmentKind::Advance)
    {
        return Err(PaymentError::BadRequest(
            "ADVANCE segments must precede milestones".into(),
        ));
    }

    let planned = Money::sum(items.iter().map(|i| i.amount))?;
    if planned != total {
        return Err(PaymentError::SumMismatch {
            expected: total,
            planned,
        });
    }
    Ok(())
}

#[derive(Debug)]
struct BookingSegments {
    segments: Vec<PaymentSegment>,
}

/// Write access to one booking's segments, handed out under the booking lock.
pub struct BookingTxn<'a> {
    booking_id: BookingId,
    data: &'a mut BookingSegments,
    by_order: &'a DashMap<OrderId, SegmentId>,
}

impl BookingTxn<'_> {
    pub fn booking_id(&self) -> BookingId {
        self.booking_id
    }

    pub fn segments(&self) -> &[PaymentSegment] {
        &self.data.segments
    }

    pub fn get(&self, id: SegmentId) -> Result<&PaymentSegment, PaymentError> {
        self.data
            .segments
            .iter()
            .find(|s| s.id == id)
            .ok_or(PaymentError::SegmentNotFound)
    }

    pub fn by_index(&self, index: u32) -> Result<&PaymentSegment, PaymentError> {
        self.data
            .segments
            .get(index as usize)
            .ok_or(PaymentError::SegmentNotFound)
    }

    /// The segment currently holding an open gateway order, if any.
    pub fn in_flight(&self) -> Option<&PaymentSegment> {
        self.data
            .segments
            .iter()
            .find(|s| s.state == SegmentState::Ordered)
    }

    /// Compare-and-set on the segment state.
    ///
    /// `mutator` runs on a copy; the copy replaces the stored segment only if
    /// every check passes, so a failed transition leaves nothing behind.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::StaleState`] if the stored state is not `expected`.
    /// - [`PaymentError::AnotherInFlight`] if `new` is `ORDERED` and another
    ///   segment of the booking already is.
    /// - [`PaymentError::OrderMismatch`] if the new gateway order id is
    ///   already linked to a different segment.
    /// - [`PaymentError::BadRequest`] for an edge the state machine lacks.
    pub fn transition<F>(
        &mut self,
        id: SegmentId,
        expected: SegmentState,
        new: SegmentState,
        mutator: F,
    ) -> Result<PaymentSegment, PaymentError>
    where
        F: FnOnce(&mut PaymentSegment),
    {
        if !expected.can_transition_to(new) {
            return Err(PaymentError::BadRequest(format!(
                "illegal segment transition {expected} -> {new}"
            )));
        }
        let position = self
            .data
            .segments
            .iter()
            .position(|s| s.id == id)
            .ok_or(PaymentError::SegmentNotFound)?;
        let current = &self.data.segments[position];
        if current.state != expected {
            return Err(PaymentError::StaleState {
                expected,
                actual: current.state,
            });
        }
        if new == SegmentState::Ordered
            && self
                .data
                .segments
                .iter()
                .any(|s| s.id != id && s.state == SegmentState::Ordered)
        {
            return Err(PaymentError::AnotherInFlight);
        }

        let mut updated = current.clone();
        mutator(&mut updated);
        updated.state = new;

        let old_order = current.gateway_order_id.clone();
        if updated.gateway_order_id != old_order {
            if let Some(order_id) = &updated.gateway_order_id {
                match self.by_order.entry(order_id.clone()) {
                    Entry::Occupied(linked) if *linked.get() != id => {
                        return Err(PaymentError::OrderMismatch);
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(slot) => {
                        slot.insert(id);
                    }
                }
            }
            if let Some(order_id) = old_order {
                self.by_order.remove(&order_id);
            }
        }

        self.data.segments[position] = updated.clone();
        Ok(updated)
    }

    /// Swaps the sweep's placeholder payment id on a `PAID` segment for the
    /// id the gateway later reported.
    ///
    /// # Errors
    ///
    /// [`PaymentError::OrderMismatch`] unless the segment is `PAID` under a
    /// placeholder id.
    pub fn adopt_payment_id(
        &mut self,
        id: SegmentId,
        payment_id: &PaymentId,
    ) -> Result<PaymentSegment, PaymentError> {
        let segment = self
            .data
            .segments
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(PaymentError::SegmentNotFound)?;
        let swept = segment.state == SegmentState::Paid
            && segment
                .gateway_payment_id
                .as_ref()
                .is_some_and(PaymentId::is_swept);
        if !swept {
            return Err(PaymentError::OrderMismatch);
        }
        segment.gateway_payment_id = Some(payment_id.clone());
        Ok(segment.clone())
    }
}

/// In-memory segment store with per-booking locking.
#[derive(Debug)]
pub struct SegmentStore {
    bookings: DashMap<BookingId, Arc<RwLock<BookingSegments>>>,
    by_id: DashMap<SegmentId, BookingId>,
    by_order: DashMap<OrderId, SegmentId>,
    ids: IdSequence,
    lock_timeout: Duration,
}

impl SegmentStore {
    /// `lock_timeout` bounds the wait for a booking lock; waiting longer is
    /// reported as [`PaymentError::Conflict`].
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            bookings: DashMap::new(),
            by_id: DashMap::new(),
            by_order: DashMap::new(),
            ids: IdSequence::new(),
            lock_timeout,
        }
    }

    /// Creates the dense, sum-checked plan for a booking.
    ///
    /// # Errors
    ///
    /// [`PaymentError::SegmentsExist`] if the booking already has segments,
    /// plus everything [`validate_plan`] rejects.
    pub fn plan(
        &self,
        booking_id: BookingId,
        total: Money,
        items: &[SegmentPlanItem],
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentSegment>, PaymentError> {
        validate_plan(total, items)?;

        match self.bookings.entry(booking_id) {
            Entry::Occupied(_) => Err(PaymentError::SegmentsExist),
            Entry::Vacant(slot) => {
                let segments: Vec<PaymentSegment> = items
                    .iter()
                    .zip(0u32..)
                    .map(|(item, index)| PaymentSegment {
                        id: SegmentId(self.ids.next()),
                        booking_id,
                        index,
                        amount: item.amount,
                        label: item.label.clone(),
                        kind: item.kind,
                        due_at: item.due_at,
                        state: SegmentState::Pending,
                        gateway_order_id: None,
                        gateway_payment_id: None,
                        ledger_entry_id: None,
                        status_reason: None,
                        created_at: now,
                        ordered_at: None,
                        paid_at: None,
                    })
                    .collect();
                for segment in &segments {
                    self.by_id.insert(segment.id, booking_id);
                }
                slot.insert(Arc::new(RwLock::new(BookingSegments {
                    segments: segments.clone(),
                })));
                Ok(segments)
            }
        }
    }

    fn booking(&self, booking_id: BookingId) -> Option<Arc<RwLock<BookingSegments>>> {
        self.bookings.get(&booking_id).map(|b| Arc::clone(b.value()))
    }

    /// Runs `f` while holding the booking's write lock.
    ///
    /// # Errors
    ///
    /// [`PaymentError::SegmentNotFound`] if the booking has no plan,
    /// [`PaymentError::Conflict`] if the lock is not obtained within the
    /// configured timeout, or whatever `f` returns.
    pub fn with_booking<T, F>(&self, booking_id: BookingId, f: F) -> Result<T, PaymentError>
    where
        F: FnOnce(&mut BookingTxn<'_>) -> Result<T, PaymentError>,
    {
        let booking = self
            .booking(booking_id)
            .ok_or(PaymentError::SegmentNotFound)?;
        let mut guard = booking
            .try_write_for(self.lock_timeout)
            .ok_or(PaymentError::Conflict)?;
        let mut txn = BookingTxn {
            booking_id,
            data: &mut *guard,
            by_order: &self.by_order,
        };
        f(&mut txn)
    }

    /// Atomic compare-and-set over a segment's state.
    ///
    /// # Errors
    ///
    /// See [`BookingTxn::transition`].
    pub fn transition<F>(
        &self,
        id: SegmentId,
        expected: SegmentState,
        new: SegmentState,
        mutator: F,
    ) -> Result<PaymentSegment, PaymentError>
    where
        F: FnOnce(&mut PaymentSegment),
    {
        let booking_id = self.booking_of(id)?;
        self.with_booking(booking_id, |txn| txn.transition(id, expected, new, mutator))
    }

    /// Segments of a booking ordered by index; empty if none were planned.
    pub fn list(&self, booking_id: BookingId) -> Vec<PaymentSegment> {
        self.booking(booking_id)
            .map(|b| b.read().segments.clone())
            .unwrap_or_default()
    }

    /// Smallest-index segment still in `PENDING`.
    pub fn find_next_pending(&self, booking_id: BookingId) -> Option<PaymentSegment> {
        let booking = self.booking(booking_id)?;
        let data = booking.read();
        data.segments
            .iter()
            .find(|s| s.state == SegmentState::Pending)
            .cloned()
    }

    /// # Errors
    ///
    /// [`PaymentError::SegmentNotFound`] for unknown ids,
    /// [`PaymentError::Conflict`] if a writer holds the booking past the
    /// lock timeout.
    pub fn get(&self, id: SegmentId) -> Result<PaymentSegment, PaymentError> {
        let booking_id = self.booking_of(id)?;
        let booking = self
            .booking(booking_id)
            .ok_or(PaymentError::SegmentNotFound)?;
        let data = booking
            .try_read_for(self.lock_timeout)
            .ok_or(PaymentError::Conflict)?;
        data.segments
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(PaymentError::SegmentNotFound)
    }

    pub fn get_by_index(
        &self,
        booking_id: BookingId,
        index: u32,
    ) -> Result<PaymentSegment, PaymentError> {
        let booking = self
            .booking(booking_id)
            .ok_or(PaymentError::SegmentNotFound)?;
        let data = booking
            .try_read_for(self.lock_timeout)
            .ok_or(PaymentError::Conflict)?;
        data.segments
            .get(index as usize)
            .cloned()
            .ok_or(PaymentError::SegmentNotFound)
    }

    pub fn get_by_order_id(&self, order_id: &OrderId) -> Result<PaymentSegment, PaymentError> {
        let id = self
            .by_order
            .get(order_id)
            .map(|s| *s.value())
            .ok_or(PaymentError::SegmentNotFound)?;
        self.get(id)
    }

    /// `ORDERED` segments whose order was placed at or before `cutoff`.
    pub fn ordered_before(&self, cutoff: DateTime<Utc>) -> Vec<PaymentSegment> {
        let bookings: Vec<_> = self
            .bookings
            .iter()
            .map(|b| Arc::clone(b.value()))
            .collect();
        let mut stale: Vec<PaymentSegment> = bookings
            .iter()
            .flat_map(|booking| {
                booking
                    .read()
                    .segments
                    .iter()
                    .filter(|s| {
                        s.state == SegmentState::Ordered
                            && s.ordered_at.is_some_and(|at| at <= cutoff)
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        stale.sort_by_key(|s| (s.ordered_at, s.id));
        stale
    }

    pub fn booking_of(&self, id: SegmentId) -> Result<BookingId, PaymentError> {
        self.by_id
            .get(&id)
            .map(|b| *b.value())
            .ok_or(PaymentError::SegmentNotFound)
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}

impl Default for SegmentStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_items() -> Vec<SegmentPlanItem> {
        vec![
            SegmentPlanItem::new(200_000, "advance", SegmentKind::Advance),
            SegmentPlanItem::new(500_000, "milestone", SegmentKind::Milestone),
            SegmentPlanItem::new(300_000, "final", SegmentKind::Final),
        ]
    }

    fn planned_store() -> (SegmentStore, Vec<PaymentSegment>) {
        let store = SegmentStore::default();
        let segments = store
            .plan(BookingId(1), Money::new(1_000_000), &plan_items(), Utc::now())
            .unwrap();
        (store, segments)
    }

    #[test]
    fn state_machine_edges() {
        use SegmentState::*;
        assert!(Pending.can_transition_to(Ordered));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Ordered.can_transition_to(Paid));
        assert!(Ordered.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Paid));
        assert!(Paid.is_terminal() && Cancelled.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn plan_creates_dense_pending_segments() {
        let (_, segments) = planned_store();
        assert_eq!(segments.len(), 3);
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index as usize, i);
            assert_eq!(segment.state, SegmentState::Pending);
        }
    }

    #[test]
    fn plan_twice_is_rejected() {
        let (store, _) = planned_store();
        let result = store.plan(BookingId(1), Money::new(1_000_000), &plan_items(), Utc::now());
        assert_eq!(result, Err(PaymentError::SegmentsExist));
    }

    #[test]
    fn plan_sum_must_match_total() {
        let store = SegmentStore::default();
        let result = store.plan(BookingId(2), Money::new(999_999), &plan_items(), Utc::now());
        assert_eq!(
            result,
            Err(PaymentError::SumMismatch {
                expected: Money::new(999_999),
                planned: Money::new(1_000_000),
            })
        );
        assert!(store.list(BookingId(2)).is_empty());
    }

    #[test]
    fn plan_shape_rules() {
        let total = Money::new(300);
        assert!(matches!(
            validate_plan(total, &[]),
            Err(PaymentError::BadRequest(_))
        ));
        let no_final = [SegmentPlanItem::new(300, "a", SegmentKind::Advance)];
        assert!(matches!(
            validate_plan(total, &no_final),
            Err(PaymentError::BadRequest(_))
        ));
        let advance_after_milestone = [
            SegmentPlanItem::new(100, "m", SegmentKind::Milestone),
            SegmentPlanItem::new(100, "a", SegmentKind::Advance),
            SegmentPlanItem::new(100, "f", SegmentKind::Final),
        ];
        assert!(matches!(
            validate_plan(total, &advance_after_milestone),
            Err(PaymentError::BadRequest(_))
        ));
        let zero = [
            SegmentPlanItem::new(0, "a", SegmentKind::Advance),
            SegmentPlanItem::new(300, "f", SegmentKind::Final),
        ];
        assert!(matches!(
            validate_plan(total, &zero),
            Err(PaymentError::BadRequest(_))
        ));
    }

    #[test]
    fn transition_is_compare_and_set() {
        let (store, segments) = planned_store();
        let id = segments[0].id;
        let ordered = store
            .transition(id, SegmentState::Pending, SegmentState::Ordered, |s| {
                s.gateway_order_id = Some(OrderId::new("order_1"));
            })
            .unwrap();
        assert_eq!(ordered.state, SegmentState::Ordered);

        let again = store.transition(id, SegmentState::Pending, SegmentState::Ordered, |_| {});
        assert_eq!(
            again,
            Err(PaymentError::StaleState {
                expected: SegmentState::Pending,
                actual: SegmentState::Ordered,
            })
        );
        assert_eq!(
            store.get_by_order_id(&OrderId::new("order_1")).unwrap().id,
            id
        );
    }

    #[test]
    fn only_one_segment_may_be_ordered() {
        let (store, segments) = planned_store();
        store
            .transition(segments[0].id, SegmentState::Pending, SegmentState::Ordered, |s| {
                s.gateway_order_id = Some(OrderId::new("order_1"));
            })
            .unwrap();
        let second = store.transition(
            segments[1].id,
            SegmentState::Pending,
            SegmentState::Ordered,
            |s| s.gateway_order_id = Some(OrderId::new("order_2")),
        );
        assert_eq!(second, Err(PaymentError::AnotherInFlight));
        assert!(store.get_by_order_id(&OrderId::new("order_2")).is_err());
    }

    #[test]
    fn clearing_order_id_drops_index() {
        let (store, segments) = planned_store();
        let id = segments[0].id;
        store
            .transition(id, SegmentState::Pending, SegmentState::Ordered, |s| {
                s.gateway_order_id = Some(OrderId::new("order_1"));
            })
            .unwrap();
        store
            .transition(id, SegmentState::Ordered, SegmentState::Failed, |_| {})
            .unwrap();
        store
            .transition(id, SegmentState::Failed, SegmentState::Pending, |s| {
                s.gateway_order_id = None;
            })
            .unwrap();
        assert_eq!(
            store.get_by_order_id(&OrderId::new("order_1")),
            Err(PaymentError::SegmentNotFound)
        );
    }

    #[test]
    fn illegal_edge_is_rejected() {
        let (store, segments) = planned_store();
        let result = store.transition(
            segments[0].id,
            SegmentState::Pending,
            SegmentState::Paid,
            |_| {},
        );
        assert!(matches!(result, Err(PaymentError::BadRequest(_))));
    }

    #[test]
    fn next_pending_skips_non_pending() {
        let (store, segments) = planned_store();
        store
            .transition(segments[0].id, SegmentState::Pending, SegmentState::Cancelled, |_| {})
            .unwrap();
        let next = store.find_next_pending(BookingId(1)).unwrap();
        assert_eq!(next.index, 1);
    }

    #[test]
    fn ordered_before_filters_by_age() {
        let (store, segments) = planned_store();
        let placed = Utc::now();
        store
            .transition(segments[0].id, SegmentState::Pending, SegmentState::Ordered, |s| {
                s.gateway_order_id = Some(OrderId::new("order_1"));
                s.ordered_at = Some(placed);
            })
            .unwrap();
        assert_eq!(store.ordered_before(placed).len(), 1);
        assert!(
            store
                .ordered_before(placed - chrono::Duration::seconds(1))
                .is_empty()
        );
    }
}
