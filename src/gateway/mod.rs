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

//! Payment gateway adapters.
//!
//! The engine talks to a provider only through [`PaymentGateway`]. Adapters
//! are stateless from the engine's point of view and never write to the
//! segment or ledger stores.
//!
//! Callback signatures are HMAC-SHA256 over `"{order_id}|{payment_id}"`,
//! keyed with the shared secret and hex encoded.

pub mod mock;
#[cfg(feature = "razorpay")]
pub mod razorpay;

use crate::base::{OrderId, PaymentId};
use crate::error::PaymentError;
use crate::money::Money;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub use mock::MockGateway;
#[cfg(feature = "razorpay")]
pub use razorpay::RazorpayGateway;

type HmacSha256 = Hmac<Sha256>;

/// An order created at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: OrderId,
    /// Opaque value the client needs to open the provider's checkout.
    pub client_hint: String,
}

/// Result of a successful callback verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackCheck {
    pub amount_charged: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatus {
    /// The order will not change any more.
    pub terminal: bool,
    pub paid: bool,
    pub amount: Option<Money>,
    pub payment_id: Option<PaymentId>,
}

impl OrderStatus {
    pub fn open() -> Self {
        Self {
            terminal: false,
            paid: false,
            amount: None,
            payment_id: None,
        }
    }

    pub fn unpaid_terminal() -> Self {
        Self {
            terminal: true,
            ..Self::open()
        }
    }

    pub fn paid(amount: Money, payment_id: PaymentId) -> Self {
        Self {
            terminal: true,
            paid: true,
            amount: Some(amount),
            payment_id: Some(payment_id),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates an intent to charge `amount`. Providers that support it return
    /// the same order for a repeated `reference_tag`.
    async fn create_order(
        &self,
        amount: Money,
        reference_tag: &str,
    ) -> Result<OrderHandle, PaymentError>;

    /// Checks a client callback. Must not change anything at the provider.
    ///
    /// # Errors
    ///
    /// [`PaymentError::SignatureMismatch`] if the signature does not verify.
    async fn verify_callback(
        &self,
        order_id: &OrderId,
        payment_id: &PaymentId,
        signature: &str,
    ) -> Result<CallbackCheck, PaymentError>;

    async fn fetch_order_status(&self, order_id: &OrderId) -> Result<OrderStatus, PaymentError>;

    /// Best-effort release of an order nobody will pay.
    async fn cancel_order(&self, _order_id: &OrderId) -> Result<(), PaymentError> {
        Ok(())
    }
}

/// Signature a provider attaches to a payment callback.
pub fn sign_callback(secret: &str, order_id: &OrderId, payment_id: &PaymentId) -> String {
    callback_mac(secret, order_id, payment_id)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Constant-time check of a callback signature.
pub fn verify_signature(
    secret: &str,
    order_id: &OrderId,
    payment_id: &PaymentId,
    signature: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    callback_mac(secret, order_id, payment_id)
        .is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

fn callback_mac(secret: &str, order_id: &OrderId, payment_id: &PaymentId) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(order_id.as_str().as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_str().as_bytes());
    Some(mac)
}
