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

//! Razorpay REST adapter.
//!
//! Orders are created with `receipt` set to the reference tag. Verification
//! checks the callback signature locally and then reads the payment back to
//! learn the amount actually charged; nothing is written at the provider.

use super::{CallbackCheck, OrderHandle, OrderStatus, PaymentGateway, verify_signature};
use crate::base::{OrderId, PaymentId};
use crate::error::PaymentError;
use crate::money::Money;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.razorpay.com";

#[derive(Debug, Clone)]
pub struct RazorpayGateway {
    client: Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    currency: String,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    #[serde(default)]
    amount_paid: u64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayPayment {
    id: String,
    amount: u64,
    status: String,
    #[serde(default)]
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentCollection {
    items: Vec<RazorpayPayment>,
}

impl RazorpayPayment {
    fn is_captured(&self) -> bool {
        self.status == "captured"
    }
}

impl RazorpayGateway {
    /// # Errors
    ///
    /// [`PaymentError::StoreUnavailable`] if the HTTP client cannot be built.
    pub fn new(
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        currency: impl Into<String>,
    ) -> Result<Self, PaymentError> {
        let client = Client::builder()
            .build()
            .map_err(|e| PaymentError::StoreUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
            currency: currency.into(),
        })
    }

    /// Points the adapter at another host, such as a local stub.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, PaymentError> {
        let response = request
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(|e| PaymentError::GatewayNetwork(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PaymentError::GatewayNetwork(format!("razorpay returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body, "razorpay rejected request");
            return Err(PaymentError::GatewayRejected(format!("razorpay returned {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| PaymentError::GatewayRejected(format!("malformed razorpay response: {e}")))
    }

    async fn fetch_payment(&self, payment_id: &PaymentId) -> Result<RazorpayPayment, PaymentError> {
        let path = format!("/v1/payments/{}", payment_id.as_str());
        self.send(self.client.get(self.url(&path))).await
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(
        &self,
        amount: Money,
        reference_tag: &str,
    ) -> Result<OrderHandle, PaymentError> {
        let body = CreateOrderRequest {
            amount: amount.minor(),
            currency: &self.currency,
            receipt: reference_tag,
        };
        let order: RazorpayOrder = self
            .send(self.client.post(self.url("/v1/orders")).json(&body))
            .await?;
        tracing::debug!(order_id = %order.id, reference_tag, "razorpay order created");
        Ok(OrderHandle {
            order_id: OrderId(order.id),
            client_hint: self.key_id.clone(),
        })
    }

    async fn verify_callback(
        &self,
        order_id: &OrderId,
        payment_id: &PaymentId,
        signature: &str,
    ) -> Result<CallbackCheck, PaymentError> {
        if !verify_signature(&self.key_secret, order_id, payment_id, signature) {
            return Err(PaymentError::SignatureMismatch);
        }
        let payment = self.fetch_payment(payment_id).await?;
        if payment.order_id.as_deref() != Some(order_id.as_str()) {
            return Err(PaymentError::GatewayRejected(
                "payment belongs to another order".into(),
            ));
        }
        if !matches!(payment.status.as_str(), "captured" | "authorized") {
            return Err(PaymentError::GatewayRejected(format!(
                "payment is {}",
                payment.status
            )));
        }
        Ok(CallbackCheck {
            amount_charged: Money::new(payment.amount),
        })
    }

    async fn fetch_order_status(&self, order_id: &OrderId) -> Result<OrderStatus, PaymentError> {
        let path = format!("/v1/orders/{}", order_id.as_str());
        let order: RazorpayOrder = self.send(self.client.get(self.url(&path))).await?;
        if order.status != "paid" {
            // "created" and "attempted" orders can still be paid.
            return Ok(OrderStatus::open());
        }

        let path = format!("/v1/orders/{}/payments", order_id.as_str());
        let payments: PaymentCollection = self.send(self.client.get(self.url(&path))).await?;
        let captured = payments.items.into_iter().find(RazorpayPayment::is_captured);
        Ok(match captured {
            Some(payment) => OrderStatus::paid(Money::new(payment.amount), PaymentId(payment.id)),
            None => OrderStatus {
                terminal: true,
                paid: true,
                amount: Some(Money::new(order.amount_paid)),
                payment_id: None,
            },
        })
    }
}
