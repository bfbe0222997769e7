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

//! Error types for segment payments and ledger operations.
//!
//! Every error carries a stable machine code ([`PaymentError::code`]) and is
//! classified into an [`ErrorKind`] family. Boundary handlers translate the
//! family into a transport status with [`PaymentError::http_status`]; the core
//! itself never renders user-facing text.

use crate::money::Money;
use crate::segment::SegmentState;
use thiserror::Error;

/// Segment payment and ledger errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// Malformed or semantically invalid input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Gateway charged a different amount than the segment is worth
    #[error("charged amount {charged} does not match segment amount {expected}")]
    AmountMismatch { expected: Money, charged: Money },

    /// Segment plan does not add up to the booking total
    #[error("planned amount {planned} does not match booking total {expected}")]
    SumMismatch { expected: Money, planned: Money },

    /// Actor may not act on this booking
    #[error("forbidden")]
    Forbidden,

    /// Booking resolver has no such booking
    #[error("booking not found")]
    BookingNotFound,

    #[error("segment not found")]
    SegmentNotFound,

    #[error("ledger entry not found")]
    EntryNotFound,

    /// Segment state changed under the caller
    #[error("stale segment state: expected {expected}, found {actual}")]
    StaleState {
        expected: SegmentState,
        actual: SegmentState,
    },

    /// Segment is not in a state that accepts a new payment
    #[error("segment is not payable in state {0}")]
    NotPayable(SegmentState),

    /// Another segment of the booking already has an open gateway order
    #[error("another segment of this booking is awaiting payment")]
    AnotherInFlight,

    /// Booking already has a segment plan
    #[error("payment segments already exist for this booking")]
    SegmentsExist,

    /// Gateway reports the order as captured; it cannot be failed
    #[error("gateway order already captured")]
    AlreadyCaptured,

    /// Order or payment id does not belong to the addressed segment
    #[error("gateway order does not match the segment")]
    OrderMismatch,

    /// Entry is completed or was posted by the payment path
    #[error("ledger entry is immutable")]
    EntryImmutable,

    /// Transient network failure talking to the gateway
    #[error("payment gateway unreachable: {0}")]
    GatewayNetwork(String),

    /// Gateway refused the request
    #[error("payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    /// Callback signature does not verify against the shared secret
    #[error("callback signature mismatch")]
    SignatureMismatch,

    /// Money arithmetic overflowed or went negative
    #[error("arithmetic overflow or underflow")]
    Arithmetic,

    /// Optimistic concurrency check lost
    #[error("concurrent modification conflict")]
    Conflict,

    /// Backing store cannot be reached
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Error families used for boundary mapping and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Authorization,
    NotFound,
    State,
    External,
    Arithmetic,
    Store,
}

impl PaymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) | Self::AmountMismatch { .. } | Self::SumMismatch { .. } => {
                ErrorKind::Input
            }
            Self::Forbidden => ErrorKind::Authorization,
            Self::BookingNotFound | Self::SegmentNotFound | Self::EntryNotFound => {
                ErrorKind::NotFound
            }
            Self::StaleState { .. }
            | Self::NotPayable(_)
            | Self::AnotherInFlight
            | Self::SegmentsExist
            | Self::AlreadyCaptured
            | Self::OrderMismatch
            | Self::EntryImmutable => ErrorKind::State,
            Self::GatewayNetwork(_) | Self::GatewayRejected(_) | Self::SignatureMismatch => {
                ErrorKind::External
            }
            Self::Arithmetic => ErrorKind::Arithmetic,
            Self::Conflict | Self::StoreUnavailable(_) => ErrorKind::Store,
        }
    }

    /// Stable code attached to the error for callers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "ERR_BAD_REQUEST",
            Self::AmountMismatch { .. } => "ERR_AMOUNT_MISMATCH",
            Self::SumMismatch { .. } => "ERR_SUM_MISMATCH",
            Self::Forbidden => "ERR_FORBIDDEN",
            Self::BookingNotFound => "ERR_BOOKING_NOT_FOUND",
            Self::SegmentNotFound => "ERR_SEGMENT_NOT_FOUND",
            Self::EntryNotFound => "ERR_ENTRY_NOT_FOUND",
            Self::StaleState { .. } => "ERR_STALE_STATE",
            Self::NotPayable(_) => "ERR_NOT_PAYABLE",
            Self::AnotherInFlight => "ERR_ANOTHER_IN_FLIGHT",
            Self::SegmentsExist => "ERR_SEGMENTS_EXIST",
            Self::AlreadyCaptured => "ERR_ALREADY_CAPTURED",
            Self::OrderMismatch => "ERR_ORDER_MISMATCH",
            Self::EntryImmutable => "ERR_ENTRY_IMMUTABLE",
            Self::GatewayNetwork(_) => "ERR_GATEWAY_NETWORK",
            Self::GatewayRejected(_) => "ERR_GATEWAY_REJECTED",
            Self::SignatureMismatch => "ERR_SIGNATURE_MISMATCH",
            Self::Arithmetic => "ERR_ARITHMETIC",
            Self::Conflict => "ERR_CONFLICT",
            Self::StoreUnavailable(_) => "ERR_STORE_UNAVAILABLE",
        }
    }

    /// Status code a boundary handler should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::SignatureMismatch => 401,
            Self::BookingNotFound | Self::SegmentNotFound | Self::EntryNotFound => 404,
            Self::GatewayRejected(_) | Self::GatewayNetwork(_) => 502,
            Self::StoreUnavailable(_) => 503,
            Self::Conflict => 409,
            _ => match self.kind() {
                ErrorKind::Input => 400,
                ErrorKind::State => 409,
                _ => 500,
            },
        }
    }

    /// Only transient network failures and lost optimistic locks are retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::GatewayNetwork(_) | Self::Conflict)
    }
}
