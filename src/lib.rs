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

//! # Segment Ledger
//!
//! Segmented payment and cash/bank ledger core for a services marketplace.
//! A booking's price is split into ordered payment segments (advance,
//! milestones, final). Each segment is ordered at a payment gateway, verified
//! from a signed callback and posted to the ledger together with its balance
//! movement.
//!
//! ## Core Components
//!
//! - [`SegmentEngine`]: the segment state machine, reconciliation sweep and
//!   read projections
//! - [`SegmentStore`]: segments with a per-booking advisory lock
//! - [`Ledger`]: receive/pay entries and the cash/bank balance row
//! - [`PaymentGateway`]: provider interface, with [`MockGateway`] and (feature
//!   `razorpay`) [`RazorpayGateway`]
//! - [`PaymentError`]: every failure the core reports
//!
//! ## Example
//!
//! ```
//! use segment_ledger::{
//!     Actor, BookingId, Config, InMemoryBookings, MockGateway, PaymentId, SegmentEngine,
//!     SegmentKind, SegmentPlanItem, SegmentState, UserId, Money,
//! };
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let bookings = Arc::new(InMemoryBookings::new());
//! bookings.add_finalized(BookingId(1), UserId(10), Money::new(1_000));
//! let gateway = Arc::new(MockGateway::new("secret"));
//! let engine = SegmentEngine::new(Config::default(), bookings, gateway.clone()).unwrap();
//!
//! let customer = Actor::customer(10);
//! let plan = [
//!     SegmentPlanItem::new(400, "advance", SegmentKind::Advance),
//!     SegmentPlanItem::new(600, "final", SegmentKind::Final),
//! ];
//! engine.plan(BookingId(1), &plan, &customer).await.unwrap();
//!
//! let order = engine.start_payment(BookingId(1), 0, &customer).await.unwrap();
//! let payment = PaymentId::new("pay_1");
//! let signature = gateway.pay(&order.order_id, &payment).unwrap();
//! let segment = engine
//!     .verify_payment(BookingId(1), 0, &order.order_id, &payment, &signature, &customer)
//!     .await
//!     .unwrap();
//!
//! assert_eq!(segment.state, SegmentState::Paid);
//! assert_eq!(engine.ledger().balance().current_balance, 400);
//! # });
//! ```
//!
//! ## Thread Safety
//!
//! Operations on different bookings run in parallel. Operations on one
//! booking serialize on that booking's lock, and no lock is held while a
//! gateway call is awaited.

mod admin;
pub mod authz;
mod base;
pub mod booking;
pub mod capture_log;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod money;
pub mod query;
pub mod retry;
pub mod segment;

pub use authz::{Access, Actor, UserType};
pub use base::{BookingId, EntryId, OrderId, PaymentId, SegmentId, UserId};
pub use booking::{BookingRef, BookingResolver, InMemoryBookings};
pub use capture_log::{Capture, CaptureLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{PaymentOrder, SegmentEngine, SweepReport};
pub use error::{ErrorKind, PaymentError};
pub use gateway::{
    CallbackCheck, MockGateway, OrderHandle, OrderStatus, PaymentGateway, sign_callback,
};
#[cfg(feature = "razorpay")]
pub use gateway::RazorpayGateway;
pub use ledger::{
    BalanceDrift, CashBankBalance, EntryDraft, EntryFilter, EntryKind, EntryOrigin, EntryPatch,
    EntryStatus, Ledger, LedgerEntry, LedgerSummary, Page,
};
pub use money::Money;
pub use query::PaymentProgress;
pub use retry::{RetryPolicy, retry_with_predicate};
pub use segment::{
    PaymentSegment, SegmentKind, SegmentPlanItem, SegmentState, SegmentStore, validate_plan,
};
