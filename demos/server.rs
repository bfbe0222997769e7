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

//! REST API demo for the segment engine.
//!
//! Run with: cargo run --example server
//!
//! The server seeds booking 1 (customer 10, total 1000.00) and uses the mock
//! gateway, so a whole payment can be driven with curl. Callers identify
//! themselves with `X-User-Id` and `X-User-Type` headers. Set
//! `SEGMENT_LEDGER_CONFIG` to a JSON file to override the engine defaults and
//! `RUST_LOG` to change the log filter.
//!
//! # Example requests
//!
//! ```bash
//! # Plan the booking
//! curl -X POST http://localhost:3000/bookings/1/segments \
//!   -H "Content-Type: application/json" -H "X-User-Id: 10" -H "X-User-Type: customer" \
//!   -d '[{"amount": 40000, "label": "advance", "kind": "ADVANCE", "due_at": null},
//!        {"amount": 60000, "label": "final", "kind": "FINAL", "due_at": null}]'
//!
//! # Open a gateway order for segment 0
//! curl -X POST http://localhost:3000/bookings/1/segments/0/orders \
//!   -H "X-User-Id: 10" -H "X-User-Type: customer"
//!
//! # Pretend the customer paid it (mock gateway only)
//! curl -X POST http://localhost:3000/mock/orders/order_1/pay/pay_1
//!
//! # Report the callback
//! curl -X POST http://localhost:3000/bookings/1/segments/0/verify \
//!   -H "Content-Type: application/json" -H "X-User-Id: 10" -H "X-User-Type: customer" \
//!   -d '{"order_id": "order_1", "payment_id": "pay_1", "signature": "<from previous call>"}'
//!
//! # Progress and the admin summary
//! curl http://localhost:3000/bookings/1/progress -H "X-User-Id: 10" -H "X-User-Type: customer"
//! curl http://localhost:3000/admin/summary -H "X-User-Id: 1" -H "X-User-Type: admin"
//! ```

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use segment_ledger::{
    Actor, BookingId, Config, InMemoryBookings, LedgerSummary, MockGateway, Money, OrderId,
    PaymentError, PaymentId, PaymentOrder, PaymentProgress, PaymentSegment, SegmentEngine,
    SegmentPlanItem, UserId, UserType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

// === Request/Response DTOs ===

/// Callback fields the client forwards after checkout.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct MockPaymentResponse {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SegmentEngine>,
    pub gateway: Arc<MockGateway>,
}

// === Error Handling ===

/// Wrapper for converting `PaymentError` into HTTP responses.
pub struct AppError(PaymentError);

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

/// Reads the caller from `X-User-Id` and `X-User-Type`.
fn actor(headers: &HeaderMap) -> Result<Actor, AppError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let id = header("x-user-id")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(PaymentError::Forbidden)?;
    let user_type = match header("x-user-type") {
        Some("admin") => UserType::Admin,
        Some("customer") => UserType::Customer,
        Some("worker") => UserType::Worker,
        Some("vendor") => UserType::Vendor,
        _ => return Err(PaymentError::Forbidden.into()),
    };
    Ok(Actor {
        id: UserId(id),
        user_type,
    })
}

// === Handlers ===

/// POST /bookings/{id}/segments - Create the segment plan.
async fn plan_segments(
    State(state): State<AppState>,
    Path(booking_id): Path<u64>,
    headers: HeaderMap,
    Json(items): Json<Vec<SegmentPlanItem>>,
) -> Result<(StatusCode, Json<Vec<PaymentSegment>>), AppError> {
    let actor = actor(&headers)?;
    let segments = state
        .engine
        .plan(BookingId(booking_id), &items, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(segments)))
}

/// POST /bookings/{id}/segments/{index}/orders - Open a gateway order.
async fn start_payment(
    State(state): State<AppState>,
    Path((booking_id, index)): Path<(u64, u32)>,
    headers: HeaderMap,
) -> Result<Json<PaymentOrder>, AppError> {
    let actor = actor(&headers)?;
    let order = state
        .engine
        .start_payment(BookingId(booking_id), index, &actor)
        .await?;
    Ok(Json(order))
}

/// POST /bookings/{id}/segments/{index}/verify - Report a payment callback.
async fn verify_payment(
    State(state): State<AppState>,
    Path((booking_id, index)): Path<(u64, u32)>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<PaymentSegment>, AppError> {
    let actor = actor(&headers)?;
    let segment = state
        .engine
        .verify_payment(
            BookingId(booking_id),
            index,
            &OrderId::new(request.order_id),
            &PaymentId::new(request.payment_id),
            &request.signature,
            &actor,
        )
        .await?;
    Ok(Json(segment))
}

/// GET /bookings/{id}/progress - Paid and outstanding amounts.
async fn progress(
    State(state): State<AppState>,
    Path(booking_id): Path<u64>,
    headers: HeaderMap,
) -> Result<Json<PaymentProgress>, AppError> {
    let actor = actor(&headers)?;
    let progress = state
        .engine
        .payment_progress(BookingId(booking_id), &actor)
        .await?;
    Ok(Json(progress))
}

/// GET /admin/summary - Ledger totals and the cash/bank balance.
async fn summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LedgerSummary>, AppError> {
    let actor = actor(&headers)?;
    Ok(Json(state.engine.financial_summary(&actor)?))
}

/// POST /mock/orders/{order_id}/pay/{payment_id} - Settle a mock order.
async fn mock_pay(
    State(state): State<AppState>,
    Path((order_id, payment_id)): Path<(String, String)>,
) -> Result<Json<MockPaymentResponse>, AppError> {
    let order = OrderId::new(order_id);
    let payment = PaymentId::new(payment_id);
    let signature = state.gateway.pay(&order, &payment)?;
    Ok(Json(MockPaymentResponse {
        order_id: order.to_string(),
        payment_id: payment.to_string(),
        signature,
    }))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/bookings/{id}/segments", post(plan_segments))
        .route("/bookings/{id}/segments/{index}/orders", post(start_payment))
        .route("/bookings/{id}/segments/{index}/verify", post(verify_payment))
        .route("/bookings/{id}/progress", get(progress))
        .route("/admin/summary", get(summary))
        .route("/mock/orders/{order_id}/pay/{payment_id}", post(mock_pay))
        .with_state(state)
}

fn load_config() -> Config {
    let Ok(path) = std::env::var("SEGMENT_LEDGER_CONFIG") else {
        return Config::default();
    };
    match std::fs::read_to_string(&path).map(|raw| serde_json::from_str::<Config>(&raw)) {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            tracing::warn!(%path, error = %e, "invalid config, using defaults");
            Config::default()
        }
        Err(e) => {
            tracing::warn!(%path, error = %e, "unreadable config, using defaults");
            Config::default()
        }
    }
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bookings = Arc::new(InMemoryBookings::new());
    bookings.add_finalized(BookingId(1), UserId(10), Money::new(100_000));
    let gateway = Arc::new(MockGateway::new("demo-secret"));
    let engine = Arc::new(
        SegmentEngine::new(load_config(), bookings, gateway.clone())
            .expect("engine configuration is valid"),
    );
    let sweeper = Arc::clone(&engine).spawn_sweeper();

    let app = create_router(AppState { engine, gateway });

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Segment payment API running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /bookings/:id/segments                - Plan segments");
    println!("  POST /bookings/:id/segments/:index/orders  - Start a segment payment");
    println!("  POST /bookings/:id/segments/:index/verify  - Verify a payment callback");
    println!("  GET  /bookings/:id/progress                - Payment progress");
    println!("  GET  /admin/summary                        - Financial summary");
    println!("  POST /mock/orders/:order/pay/:payment      - Settle a mock order");

    axum::serve(listener, app).await.unwrap();
    sweeper.abort();
}
