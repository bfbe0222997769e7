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

//! In-memory payment provider.
//!
//! Behaves like a hosted checkout: orders are created by the engine, the
//! "customer" pays through [`MockGateway::capture`], which hands back the
//! callback signature a real checkout would deliver to the client. Faults
//! can be injected to exercise retries and reconciliation.

use super::{CallbackCheck, OrderHandle, OrderStatus, PaymentGateway, sign_callback, verify_signature};
use crate::base::{IdSequence, OrderId, PaymentId};
use crate::error::PaymentError;
use crate::money::Money;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MockOrderState {
    Open,
    Captured { payment_id: PaymentId, amount: Money },
    Expired,
    Cancelled,
}

#[derive(Debug, Clone)]
struct MockOrder {
    amount: Money,
    reference_tag: String,
    state: MockOrderState,
}

#[derive(Debug, Default)]
struct Faults {
    create_network_failures: u32,
    reject_next_create: bool,
    status_network_failures: u32,
    hide_payment_ids: bool,
    latency: Option<Duration>,
}

#[derive(Debug)]
pub struct MockGateway {
    secret: String,
    orders: DashMap<OrderId, MockOrder>,
    /// Reference tag to its currently open order.
    open_by_tag: DashMap<String, OrderId>,
    ids: IdSequence,
    faults: Mutex<Faults>,
    cancelled: Mutex<Vec<OrderId>>,
}

impl MockGateway {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            orders: DashMap::new(),
            open_by_tag: DashMap::new(),
            ids: IdSequence::new(),
            faults: Mutex::new(Faults::default()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Records a payment of `amount` against an open order and returns the
    /// callback signature.
    ///
    /// # Errors
    ///
    /// [`PaymentError::GatewayRejected`] for unknown or closed orders.
    pub fn capture(
        &self,
        order_id: &OrderId,
        payment_id: &PaymentId,
        amount: Money,
    ) -> Result<String, PaymentError> {
        let closed_tag = {
            let mut order = self
                .orders
                .get_mut(order_id)
                .ok_or_else(|| PaymentError::GatewayRejected("unknown order".into()))?;
            match &order.state {
                MockOrderState::Open => {
                    order.state = MockOrderState::Captured {
                        payment_id: payment_id.clone(),
                        amount,
                    };
                    Some(order.reference_tag.clone())
                }
                MockOrderState::Captured { payment_id: paid, .. } if paid == payment_id => None,
                _ => return Err(PaymentError::GatewayRejected("order is closed".into())),
            }
        };
        if let Some(tag) = closed_tag {
            self.release_tag(&tag, order_id);
        }
        Ok(self.signature(order_id, payment_id))
    }

    /// Captures the full order amount.
    pub fn pay(&self, order_id: &OrderId, payment_id: &PaymentId) -> Result<String, PaymentError> {
        let amount = self
            .order_amount(order_id)
            .ok_or_else(|| PaymentError::GatewayRejected("unknown order".into()))?;
        self.capture(order_id, payment_id, amount)
    }

    /// Closes an open order without payment, as an expired checkout would.
    pub fn expire(&self, order_id: &OrderId) -> bool {
        let tag = {
            let Some(mut order) = self.orders.get_mut(order_id) else {
                return false;
            };
            if order.state != MockOrderState::Open {
                return false;
            }
            order.state = MockOrderState::Expired;
            order.reference_tag.clone()
        };
        self.release_tag(&tag, order_id);
        true
    }

    pub fn signature(&self, order_id: &OrderId, payment_id: &PaymentId) -> String {
        sign_callback(&self.secret, order_id, payment_id)
    }

    /// The next `n` order creations fail with a network error.
    pub fn fail_next_creates(&self, n: u32) {
        self.faults.lock().create_network_failures = n;
    }

    pub fn reject_next_create(&self) {
        self.faults.lock().reject_next_create = true;
    }

    /// The next `n` status lookups fail with a network error.
    pub fn fail_next_status(&self, n: u32) {
        self.faults.lock().status_network_failures = n;
    }

    /// Status lookups report captures without naming the payment.
    pub fn hide_payment_ids(&self, hide: bool) {
        self.faults.lock().hide_payment_ids = hide;
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    pub fn order_amount(&self, order_id: &OrderId) -> Option<Money> {
        self.orders.get(order_id).map(|o| o.amount)
    }

    pub fn orders_created(&self) -> usize {
        self.orders.len()
    }

    pub fn open_orders(&self) -> Vec<OrderId> {
        self.orders
            .iter()
            .filter(|o| o.state == MockOrderState::Open)
            .map(|o| o.key().clone())
            .collect()
    }

    pub fn cancelled_orders(&self) -> Vec<OrderId> {
        self.cancelled.lock().clone()
    }

    /// Forgets `tag`'s open order. Never called with an `orders` guard held,
    /// since `create_order` locks the two maps in the opposite order.
    fn release_tag(&self, tag: &str, order_id: &OrderId) {
        self.open_by_tag.remove_if(tag, |_, open| open == order_id);
    }

    async fn simulate_latency(&self) {
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(
        &self,
        amount: Money,
        reference_tag: &str,
    ) -> Result<OrderHandle, PaymentError> {
        self.simulate_latency().await;
        {
            let mut faults = self.faults.lock();
            if faults.create_network_failures > 0 {
                faults.create_network_failures -= 1;
                return Err(PaymentError::GatewayNetwork("connection reset".into()));
            }
            if faults.reject_next_create {
                faults.reject_next_create = false;
                return Err(PaymentError::GatewayRejected("order rejected".into()));
            }
        }

        let new_order = || {
            let order_id = OrderId(format!("order_{}", self.ids.next()));
            self.orders.insert(
                order_id.clone(),
                MockOrder {
                    amount,
                    reference_tag: reference_tag.to_string(),
                    state: MockOrderState::Open,
                },
            );
            order_id
        };

        let order_id = match self.open_by_tag.entry(reference_tag.to_string()) {
            Entry::Occupied(mut open) => {
                let reusable = self
                    .orders
                    .get(open.get())
                    .is_some_and(|o| o.state == MockOrderState::Open && o.amount == amount);
                if reusable {
                    open.get().clone()
                } else {
                    let order_id = new_order();
                    open.insert(order_id.clone());
                    order_id
                }
            }
            Entry::Vacant(slot) => {
                let order_id = new_order();
                slot.insert(order_id.clone());
                order_id
            }
        };

        tracing::debug!(order_id = %order_id, reference_tag, amount = amount.minor(), "mock order created");
        Ok(OrderHandle {
            order_id,
            client_hint: format!("mock:{reference_tag}"),
        })
    }

    async fn verify_callback(
        &self,
        order_id: &OrderId,
        payment_id: &PaymentId,
        signature: &str,
    ) -> Result<CallbackCheck, PaymentError> {
        self.simulate_latency().await;
        if !verify_signature(&self.secret, order_id, payment_id, signature) {
            return Err(PaymentError::SignatureMismatch);
        }
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| PaymentError::GatewayRejected("unknown order".into()))?;
        match &order.state {
            MockOrderState::Captured {
                payment_id: paid,
                amount,
            } if paid == payment_id => Ok(CallbackCheck {
                amount_charged: *amount,
            }),
            MockOrderState::Captured { .. } => Err(PaymentError::GatewayRejected(
                "payment belongs to another capture".into(),
            )),
            _ => Err(PaymentError::GatewayRejected("payment not captured".into())),
        }
    }

    async fn fetch_order_status(&self, order_id: &OrderId) -> Result<OrderStatus, PaymentError> {
        self.simulate_latency().await;
        let hide_payment_ids = {
            let mut faults = self.faults.lock();
            if faults.status_network_failures > 0 {
                faults.status_network_failures -= 1;
                return Err(PaymentError::GatewayNetwork("connection reset".into()));
            }
            faults.hide_payment_ids
        };
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| PaymentError::GatewayRejected("unknown order".into()))?;
        Ok(match &order.state {
            MockOrderState::Open => OrderStatus::open(),
            MockOrderState::Captured { payment_id, amount } => {
                let mut status = OrderStatus::paid(*amount, payment_id.clone());
                if hide_payment_ids {
                    status.payment_id = None;
                }
                status
            }
            MockOrderState::Expired | MockOrderState::Cancelled => OrderStatus::unpaid_terminal(),
        })
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), PaymentError> {
        self.cancelled.lock().push(order_id.clone());
        let tag = {
            let mut order = self
                .orders
                .get_mut(order_id)
                .ok_or_else(|| PaymentError::GatewayRejected("unknown order".into()))?;
            match order.state {
                MockOrderState::Open => {
                    order.state = MockOrderState::Cancelled;
                    order.reference_tag.clone()
                }
                MockOrderState::Captured { .. } => {
                    return Err(PaymentError::GatewayRejected(
                        "order already captured".into(),
                    ));
                }
                MockOrderState::Expired | MockOrderState::Cancelled => return Ok(()),
            }
        };
        self.release_tag(&tag, order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_tag_reuses_open_order() {
        let gateway = MockGateway::new("secret");
        let first = gateway.create_order(Money::new(100), "seg:1").await.unwrap();
        let second = gateway.create_order(Money::new(100), "seg:1").await.unwrap();
        assert_eq!(first.order_id, second.order_id);

        gateway.expire(&first.order_id);
        let third = gateway.create_order(Money::new(100), "seg:1").await.unwrap();
        assert_ne!(first.order_id, third.order_id);
    }

    #[tokio::test]
    async fn capture_then_verify() {
        let gateway = MockGateway::new("secret");
        let order = gateway.create_order(Money::new(100), "seg:1").await.unwrap();
        let payment = PaymentId::new("pay_1");
        let signature = gateway.pay(&order.order_id, &payment).unwrap();

        let check = gateway
            .verify_callback(&order.order_id, &payment, &signature)
            .await
            .unwrap();
        assert_eq!(check.amount_charged, Money::new(100));

        let status = gateway.fetch_order_status(&order.order_id).await.unwrap();
        assert!(status.paid && status.terminal);
        assert_eq!(status.payment_id, Some(payment));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let gateway = MockGateway::new("secret");
        let order = gateway.create_order(Money::new(100), "seg:1").await.unwrap();
        let payment = PaymentId::new("pay_1");
        gateway.pay(&order.order_id, &payment).unwrap();
        assert_eq!(
            gateway
                .verify_callback(&order.order_id, &payment, "deadbeef")
                .await,
            Err(PaymentError::SignatureMismatch)
        );
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let gateway = MockGateway::new("secret");
        gateway.fail_next_creates(1);
        assert!(matches!(
            gateway.create_order(Money::new(1), "seg:1").await,
            Err(PaymentError::GatewayNetwork(_))
        ));
        assert!(gateway.create_order(Money::new(1), "seg:1").await.is_ok());

        gateway.reject_next_create();
        assert!(matches!(
            gateway.create_order(Money::new(1), "seg:2").await,
            Err(PaymentError::GatewayRejected(_))
        ));
    }

    #[tokio::test]
    async fn cancel_closes_open_orders_only() {
        let gateway = MockGateway::new("secret");
        let open = gateway.create_order(Money::new(1), "seg:1").await.unwrap();
        gateway.cancel_order(&open.order_id).await.unwrap();
        let status = gateway.fetch_order_status(&open.order_id).await.unwrap();
        assert!(status.terminal && !status.paid);

        let paid = gateway.create_order(Money::new(1), "seg:2").await.unwrap();
        gateway.pay(&paid.order_id, &PaymentId::new("pay_9")).unwrap();
        assert!(gateway.cancel_order(&paid.order_id).await.is_err());
        assert_eq!(gateway.cancelled_orders().len(), 2);
    }
}
