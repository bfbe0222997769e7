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

//! Segment engine.
//!
//! [`SegmentEngine`] owns the segment state machine and the only path that
//! posts gateway money into the ledger. It is constructed once with its
//! resolver, gateway, clock and config and shared behind an [`Arc`].
//!
//! # Locking
//!
//! Every state change runs inside [`SegmentStore::with_booking`], which holds
//! the booking's write lock. Ledger postings for a capture happen under that
//! same guard, so the lock order is always booking then ledger. Gateway
//! calls are made with no lock held.

use crate::authz::{self, Access, Actor};
use crate::base::{BookingId, OrderId, PaymentId, SegmentId, UserId};
use crate::booking::{BookingRef, BookingResolver};
use crate::capture_log::{Capture, CaptureLog};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{ErrorKind, PaymentError};
use crate::gateway::{CallbackCheck, OrderStatus, PaymentGateway};
use crate::ledger::{BalanceDrift, Ledger};
use crate::money::Money;
use crate::retry::{RetryPolicy, retry_gateway};
use crate::segment::{PaymentSegment, SegmentPlanItem, SegmentState, SegmentStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What a client needs to open the provider's checkout for a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentOrder {
    pub segment_id: SegmentId,
    pub order_id: OrderId,
    pub amount: Money,
    pub client_hint: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// `ORDERED` segments older than the order TTL.
    pub examined: usize,
    pub captured: usize,
    pub failed: usize,
    /// Orders the gateway still reports as payable.
    pub still_open: usize,
    /// Segments that changed state while the sweep looked at them.
    pub skipped: usize,
    pub errors: usize,
    /// Set when the recorded balance disagrees with the entries.
    pub drift: Option<BalanceDrift>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaleOutcome {
    Captured,
    Failed,
    StillOpen,
}

enum Readiness {
    Ready(PaymentSegment),
    Blocked(PaymentSegment),
}

pub struct SegmentEngine {
    config: Config,
    retry: RetryPolicy,
    bookings: Arc<dyn BookingResolver>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    segments: SegmentStore,
    ledger: Ledger,
    captures: CaptureLog,
}

impl SegmentEngine {
    /// # Errors
    ///
    /// [`PaymentError::BadRequest`] if `config` does not validate.
    pub fn new(
        config: Config,
        bookings: Arc<dyn BookingResolver>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, PaymentError> {
        Self::with_clock(config, bookings, gateway, Arc::new(SystemClock))
    }

    /// Like [`SegmentEngine::new`] with an explicit time source.
    ///
    /// # Errors
    ///
    /// [`PaymentError::BadRequest`] if `config` does not validate.
    pub fn with_clock(
        config: Config,
        bookings: Arc<dyn BookingResolver>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PaymentError> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            retry: config.retry_policy(),
            segments: SegmentStore::new(config.lock_timeout),
            ledger: Ledger::new(now),
            captures: CaptureLog::new(),
            config,
            bookings,
            gateway,
            clock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn segments(&self) -> &SegmentStore {
        &self.segments
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Captures committed since the last drain, oldest first.
    pub fn drain_captures(&self) -> Vec<Capture> {
        self.captures.drain()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) async fn authorize(
        &self,
        booking_id: BookingId,
        actor: &Actor,
    ) -> Result<(BookingRef, Access), PaymentError> {
        let booking = self.bookings.resolve(booking_id).await?;
        let access = authz::check(actor, &booking).require()?;
        Ok((booking, access))
    }

    /// Runs a transactional section, retrying it once if it lost a lock race.
    fn with_conflict_retry<T, F>(&self, mut section: F) -> Result<T, PaymentError>
    where
        F: FnMut() -> Result<T, PaymentError>,
    {
        match section() {
            Err(PaymentError::Conflict) => {
                tracing::warn!("booking lock contended, retrying section once");
                section()
            }
            outcome => outcome,
        }
    }

    /// Creates the segment plan for a finalized booking.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::Forbidden`] unless the actor owns the booking or is
    ///   an admin.
    /// - [`PaymentError::BadRequest`] if the booking is not finalized or the
    ///   plan is malformed.
    /// - [`PaymentError::SumMismatch`] and [`PaymentError::SegmentsExist`]
    ///   from the segment store.
    pub async fn plan(
        &self,
        booking_id: BookingId,
        items: &[SegmentPlanItem],
        actor: &Actor,
    ) -> Result<Vec<PaymentSegment>, PaymentError> {
        let (booking, _) = self.authorize(booking_id, actor).await?;
        if !booking.is_finalized {
            return Err(PaymentError::BadRequest(
                "booking is not finalized".into(),
            ));
        }
        let segments = self
            .segments
            .plan(booking_id, booking.total_amount, items, self.now())?;
        tracing::info!(
            booking_id = %booking_id,
            segments = segments.len(),
            total = booking.total_amount.minor(),
            "segment plan created"
        );
        Ok(segments)
    }

    /// Opens a gateway order for one segment and moves it to `ORDERED`.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::Forbidden`] for actors other than the owner or an
    ///   admin.
    /// - [`PaymentError::NotPayable`] if the segment is not `PENDING`.
    /// - [`PaymentError::AnotherInFlight`] if the booking already has an
    ///   open order.
    /// - [`PaymentError::StaleState`] if another request moved the segment
    ///   while the order was being created.
    /// - Gateway errors once retries are exhausted.
    pub async fn start_payment(
        &self,
        booking_id: BookingId,
        segment_index: u32,
        actor: &Actor,
    ) -> Result<PaymentOrder, PaymentError> {
        self.authorize(booking_id, actor).await?;

        let mut swept = false;
        let segment = loop {
            let readiness = self.with_conflict_retry(|| {
                self.segments.with_booking(booking_id, |txn| {
                    let segment = txn.by_index(segment_index)?;
                    let blocker = match segment.state {
                        SegmentState::Pending => txn.in_flight(),
                        SegmentState::Ordered => Some(segment),
                        state => return Err(PaymentError::NotPayable(state)),
                    };
                    Ok(match blocker {
                        None => Readiness::Ready(segment.clone()),
                        Some(blocker) => Readiness::Blocked(blocker.clone()),
                    })
                })
            })?;
            match readiness {
                Readiness::Ready(segment) => break segment,
                Readiness::Blocked(blocker) if !swept && self.is_expired(&blocker) => {
                    swept = true;
                    tracing::info!(
                        booking_id = %booking_id,
                        segment_id = %blocker.id,
                        "in-flight order past ttl, reconciling before new order"
                    );
                    match self.resolve_stale(&blocker).await {
                        Ok(_) | Err(PaymentError::StaleState { .. }) => {}
                        Err(err) if err.kind() == ErrorKind::External => return Err(err),
                        Err(err) => {
                            tracing::warn!(
                                segment_id = %blocker.id,
                                error = %err,
                                "could not reconcile in-flight order"
                            );
                            return Err(PaymentError::AnotherInFlight);
                        }
                    }
                }
                Readiness::Blocked(_) => return Err(PaymentError::AnotherInFlight),
            }
        };

        let gateway: &dyn PaymentGateway = self.gateway.as_ref();
        let tag = segment.id.reference_tag();
        let reference_tag = tag.as_str();
        let amount = segment.amount;
        tracing::debug!(segment_id = %segment.id, reference_tag, "creating gateway order");
        let order = retry_gateway(&self.retry, move || {
            gateway.create_order(amount, reference_tag)
        })
        .await?;

        let now = self.now();
        let committed = self.with_conflict_retry(|| {
            self.segments.transition(
                segment.id,
                SegmentState::Pending,
                SegmentState::Ordered,
                |s| {
                    s.gateway_order_id = Some(order.order_id.clone());
                    s.ordered_at = Some(now);
                    s.status_reason = None;
                },
            )
        });

        match committed {
            Ok(ordered) => {
                tracing::info!(
                    booking_id = %booking_id,
                    segment_id = %ordered.id,
                    order_id = %order.order_id,
                    amount = amount.minor(),
                    "segment ordered"
                );
                Ok(PaymentOrder {
                    segment_id: ordered.id,
                    order_id: order.order_id,
                    amount,
                    client_hint: order.client_hint,
                })
            }
            Err(err) => {
                // An idempotent gateway hands every racer the same order;
                // that order now belongs to the winner.
                let held_by_segment = self
                    .segments
                    .get(segment.id)
                    .is_ok_and(|s| s.gateway_order_id.as_ref() == Some(&order.order_id));
                if !held_by_segment {
                    tracing::warn!(
                        segment_id = %segment.id,
                        order_id = %order.order_id,
                        error = %err,
                        "segment moved during order creation, cancelling order"
                    );
                    if let Err(cancel) = self.gateway.cancel_order(&order.order_id).await {
                        tracing::warn!(
                            order_id = %order.order_id,
                            error = %cancel,
                            "compensating cancel failed"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Accepts a signed payment callback and captures the segment.
    ///
    /// Repeating a successful call with the same arguments returns the paid
    /// segment without posting again, as does a late callback for a segment
    /// the sweep already captured.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::SignatureMismatch`] for a forged callback.
    /// - [`PaymentError::OrderMismatch`] if the order does not belong to
    ///   `(booking_id, segment_index)` or the segment is not awaiting it.
    /// - [`PaymentError::AmountMismatch`] if the charged amount differs from
    ///   the segment amount; the segment stays `ORDERED`.
    /// - [`PaymentError::Conflict`] if the booking stayed locked through the
    ///   internal retry.
    pub async fn verify_payment(
        &self,
        booking_id: BookingId,
        segment_index: u32,
        order_id: &OrderId,
        payment_id: &PaymentId,
        signature: &str,
        actor: &Actor,
    ) -> Result<PaymentSegment, PaymentError> {
        self.authorize(booking_id, actor).await?;

        let gateway: &dyn PaymentGateway = self.gateway.as_ref();
        let check = retry_gateway(&self.retry, move || {
            gateway.verify_callback(order_id, payment_id, signature)
        })
        .await?;

        self.with_conflict_retry(|| {
            self.settle_callback(
                booking_id,
                segment_index,
                order_id,
                payment_id,
                &check,
                actor.admin_id(),
            )
        })
    }

    /// Matches a verified callback to its segment and captures it.
    fn settle_callback(
        &self,
        booking_id: BookingId,
        segment_index: u32,
        order_id: &OrderId,
        payment_id: &PaymentId,
        check: &CallbackCheck,
        created_by: Option<UserId>,
    ) -> Result<PaymentSegment, PaymentError> {
        let segment = self
            .segments
            .get_by_order_id(order_id)
            .map_err(|err| match err {
                PaymentError::SegmentNotFound => PaymentError::OrderMismatch,
                other => other,
            })?;
        if segment.booking_id != booking_id || segment.index != segment_index {
            return Err(PaymentError::OrderMismatch);
        }
        if segment.state == SegmentState::Paid
            && segment.gateway_payment_id.as_ref() == Some(payment_id)
        {
            tracing::debug!(segment_id = %segment.id, payment_id = %payment_id, "duplicate callback");
            return Ok(segment);
        }
        if segment.state == SegmentState::Paid
            && segment.gateway_payment_id.as_ref().is_some_and(PaymentId::is_swept)
        {
            return self.adopt_swept_payment(booking_id, segment.id, order_id, payment_id);
        }
        if segment.state != SegmentState::Ordered {
            return Err(PaymentError::OrderMismatch);
        }
        if check.amount_charged != segment.amount {
            tracing::warn!(
                segment_id = %segment.id,
                order_id = %order_id,
                expected = segment.amount.minor(),
                charged = check.amount_charged.minor(),
                "charged amount differs from segment amount"
            );
            return Err(PaymentError::AmountMismatch {
                expected: segment.amount,
                charged: check.amount_charged,
            });
        }

        self.capture_segment(
            booking_id,
            segment.id,
            order_id,
            payment_id,
            check.amount_charged,
            created_by,
        )
    }

    /// Records the real payment id of a segment the sweep captured before its
    /// callback arrived. Nothing is posted again.
    fn adopt_swept_payment(
        &self,
        booking_id: BookingId,
        segment_id: SegmentId,
        order_id: &OrderId,
        payment_id: &PaymentId,
    ) -> Result<PaymentSegment, PaymentError> {
        self.segments.with_booking(booking_id, |txn| {
            let current = txn.get(segment_id)?;
            if current.gateway_payment_id.as_ref() == Some(payment_id) {
                return Ok(current.clone());
            }
            if current.gateway_order_id.as_ref() != Some(order_id) {
                return Err(PaymentError::OrderMismatch);
            }
            self.captures.reserve(payment_id, segment_id)?;
            let adopted = txn.adopt_payment_id(segment_id, payment_id);
            match &adopted {
                Ok(_) => tracing::info!(
                    booking_id = %booking_id,
                    segment_id = %segment_id,
                    order_id = %order_id,
                    payment_id = %payment_id,
                    "late callback named the swept payment"
                ),
                Err(_) => self.captures.release(payment_id, segment_id),
            }
            adopted
        })
    }

    /// Posts the receipt and moves the segment to `PAID` under one booking
    /// guard. A failed transition rolls the posting back before the guard is
    /// released.
    fn capture_segment(
        &self,
        booking_id: BookingId,
        segment_id: SegmentId,
        order_id: &OrderId,
        payment_id: &PaymentId,
        amount: Money,
        created_by: Option<UserId>,
    ) -> Result<PaymentSegment, PaymentError> {
        let now = self.now();
        self.segments.with_booking(booking_id, |txn| {
            let current = txn.get(segment_id)?.clone();
            if current.state == SegmentState::Paid
                && current.gateway_payment_id.as_ref() == Some(payment_id)
            {
                return Ok(current);
            }
            if current.state != SegmentState::Ordered {
                return Err(PaymentError::StaleState {
                    expected: SegmentState::Ordered,
                    actual: current.state,
                });
            }
            if current.gateway_order_id.as_ref() != Some(order_id) {
                return Err(PaymentError::OrderMismatch);
            }

            self.captures.reserve(payment_id, segment_id)?;
            let entry = match self
                .ledger
                .post_segment_receive(&current, amount, created_by, now)
            {
                Ok(entry) => entry,
                Err(err) => {
                    self.captures.release(payment_id, segment_id);
                    return Err(err);
                }
            };

            let paid = txn.transition(
                segment_id,
                SegmentState::Ordered,
                SegmentState::Paid,
                |s| {
                    s.gateway_payment_id = Some(payment_id.clone());
                    s.ledger_entry_id = Some(entry.id);
                    s.paid_at = Some(now);
                    s.status_reason = None;
                },
            );
            match paid {
                Ok(segment) => {
                    self.captures.commit(Capture {
                        payment_id: payment_id.clone(),
                        order_id: order_id.clone(),
                        booking_id,
                        segment_id,
                        entry_id: entry.id,
                        amount,
                        captured_at: now,
                    });
                    tracing::info!(
                        booking_id = %booking_id,
                        segment_id = %segment_id,
                        order_id = %order_id,
                        payment_id = %payment_id,
                        entry_id = %entry.id,
                        amount = amount.minor(),
                        "segment paid"
                    );
                    Ok(segment)
                }
                Err(err) => {
                    if let Err(rollback) = self.ledger.rollback_segment_receive(entry.id, now) {
                        tracing::error!(
                            entry_id = %entry.id,
                            error = %rollback,
                            "could not roll back segment posting"
                        );
                    }
                    self.captures.release(payment_id, segment_id);
                    Err(err)
                }
            }
        })
    }

    /// Fails an `ORDERED` segment whose order the gateway has not captured.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::Forbidden`] for non-admins.
    /// - [`PaymentError::StaleState`] if the segment is not `ORDERED`.
    /// - [`PaymentError::AlreadyCaptured`] if the gateway reports the order
    ///   as paid.
    pub async fn cancel_ordered(
        &self,
        segment_id: SegmentId,
        reason: &str,
        actor: &Actor,
    ) -> Result<PaymentSegment, PaymentError> {
        authz::require_admin(actor)?;
        let segment = self.segments.get(segment_id)?;
        if segment.state != SegmentState::Ordered {
            return Err(PaymentError::StaleState {
                expected: SegmentState::Ordered,
                actual: segment.state,
            });
        }
        let order_id = segment
            .gateway_order_id
            .clone()
            .ok_or(PaymentError::OrderMismatch)?;

        let status = self.order_status(&order_id).await?;
        if status.paid {
            tracing::warn!(
                segment_id = %segment_id,
                order_id = %order_id,
                "cancel refused, gateway reports the order as paid"
            );
            return Err(PaymentError::AlreadyCaptured);
        }
        if let Err(err) = self.gateway.cancel_order(&order_id).await {
            tracing::warn!(order_id = %order_id, error = %err, "gateway cancel failed");
        }

        let failed = self.fail_ordered(&segment, &order_id, reason)?;
        tracing::info!(
            segment_id = %segment_id,
            order_id = %order_id,
            admin_id = %actor.id,
            reason,
            "ordered segment cancelled"
        );
        Ok(failed)
    }

    /// Returns a `FAILED` segment to `PENDING` with its gateway linkage
    /// cleared.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for actors other than the owner or an
    /// admin; [`PaymentError::StaleState`] if the segment is not `FAILED`.
    pub async fn retry(
        &self,
        segment_id: SegmentId,
        actor: &Actor,
    ) -> Result<PaymentSegment, PaymentError> {
        let booking_id = self.segments.booking_of(segment_id)?;
        self.authorize(booking_id, actor).await?;
        let pending = self.with_conflict_retry(|| {
            self.segments.transition(
                segment_id,
                SegmentState::Failed,
                SegmentState::Pending,
                |s| {
                    s.gateway_order_id = None;
                    s.gateway_payment_id = None;
                    s.ordered_at = None;
                    s.status_reason = None;
                },
            )
        })?;
        tracing::info!(booking_id = %booking_id, segment_id = %segment_id, "segment reset to pending");
        Ok(pending)
    }

    /// Moves a `PENDING` segment to `CANCELLED`. Terminal.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins;
    /// [`PaymentError::StaleState`] if the segment is not `PENDING`.
    pub fn cancel_pending(
        &self,
        segment_id: SegmentId,
        reason: &str,
        actor: &Actor,
    ) -> Result<PaymentSegment, PaymentError> {
        authz::require_admin(actor)?;
        let cancelled = self.with_conflict_retry(|| {
            self.segments.transition(
                segment_id,
                SegmentState::Pending,
                SegmentState::Cancelled,
                |s| s.status_reason = Some(reason.to_string()),
            )
        })?;
        tracing::info!(
            segment_id = %segment_id,
            admin_id = %actor.id,
            reason,
            "pending segment cancelled"
        );
        Ok(cancelled)
    }

    /// One reconciliation pass over orders older than the order TTL,
    /// followed by a balance check.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.now();
        let mut report = SweepReport::default();

        for segment in self.segments.ordered_before(self.order_cutoff(now)) {
            report.examined += 1;
            match self.resolve_stale(&segment).await {
                Ok(StaleOutcome::Captured) => report.captured += 1,
                Ok(StaleOutcome::Failed) => report.failed += 1,
                Ok(StaleOutcome::StillOpen) => report.still_open += 1,
                Err(PaymentError::StaleState { .. }) => report.skipped += 1,
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(
                        segment_id = %segment.id,
                        error = %err,
                        code = err.code(),
                        "sweep could not reconcile segment"
                    );
                }
            }
        }

        match self.ledger.reconcile() {
            Ok(drift) if !drift.is_balanced() => {
                tracing::warn!(
                    recorded = drift.recorded,
                    expected = drift.expected,
                    "cash/bank balance drifted from ledger entries"
                );
                report.drift = Some(drift);
            }
            Ok(_) => {}
            Err(err) => {
                report.errors += 1;
                tracing::error!(error = %err, "balance reconciliation failed");
            }
        }

        tracing::info!(
            examined = report.examined,
            captured = report.captured,
            failed = report.failed,
            still_open = report.still_open,
            errors = report.errors,
            "reconciliation sweep finished"
        );
        report
    }

    /// Runs [`SegmentEngine::sweep`] every `sweep_interval`, starting
    /// immediately.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    fn order_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.order_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn is_expired(&self, segment: &PaymentSegment) -> bool {
        let cutoff = self.order_cutoff(self.now());
        segment.ordered_at.is_some_and(|at| at <= cutoff)
    }

    async fn order_status(&self, order_id: &OrderId) -> Result<OrderStatus, PaymentError> {
        let gateway: &dyn PaymentGateway = self.gateway.as_ref();
        retry_gateway(&self.retry, move || gateway.fetch_order_status(order_id)).await
    }

    /// Settles an expired `ORDERED` segment from the gateway's view of its
    /// order.
    async fn resolve_stale(&self, segment: &PaymentSegment) -> Result<StaleOutcome, PaymentError> {
        let order_id = segment
            .gateway_order_id
            .clone()
            .ok_or(PaymentError::OrderMismatch)?;
        let status = self.order_status(&order_id).await?;

        if status.paid {
            let amount = status.amount.unwrap_or(Money::ZERO);
            if amount != segment.amount {
                tracing::warn!(
                    segment_id = %segment.id,
                    order_id = %order_id,
                    expected = segment.amount.minor(),
                    charged = amount.minor(),
                    "paid order amount differs from segment amount, failing segment"
                );
                let reason = format!(
                    "gateway charged {} against expected {}",
                    amount.minor(),
                    segment.amount.minor()
                );
                self.fail_ordered(segment, &order_id, &reason)?;
                return Ok(StaleOutcome::Failed);
            }
            let payment_id = status
                .payment_id
                .unwrap_or_else(|| PaymentId::swept(&order_id));
            self.with_conflict_retry(|| {
                self.capture_segment(
                    segment.booking_id,
                    segment.id,
                    &order_id,
                    &payment_id,
                    amount,
                    None,
                )
            })?;
            return Ok(StaleOutcome::Captured);
        }

        if status.terminal {
            self.fail_ordered(segment, &order_id, "order closed unpaid at gateway")?;
            tracing::info!(
                segment_id = %segment.id,
                order_id = %order_id,
                "expired order failed"
            );
            return Ok(StaleOutcome::Failed);
        }

        tracing::debug!(segment_id = %segment.id, order_id = %order_id, "order still open at gateway");
        Ok(StaleOutcome::StillOpen)
    }

    /// `ORDERED -> FAILED`, provided the segment still holds `order_id`.
    fn fail_ordered(
        &self,
        segment: &PaymentSegment,
        order_id: &OrderId,
        reason: &str,
    ) -> Result<PaymentSegment, PaymentError> {
        self.with_conflict_retry(|| {
            self.segments.with_booking(segment.booking_id, |txn| {
                let current = txn.get(segment.id)?;
                if current.state == SegmentState::Ordered
                    && current.gateway_order_id.as_ref() != Some(order_id)
                {
                    return Err(PaymentError::OrderMismatch);
                }
                txn.transition(
                    segment.id,
                    SegmentState::Ordered,
                    SegmentState::Failed,
                    |s| s.status_reason = Some(reason.to_string()),
                )
            })
        })
    }
}
