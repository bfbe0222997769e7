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

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the real segment store, ledger and engine from many
//! threads and check that the booking-then-ledger lock order never forms a
//! cycle.

use parking_lot::deadlock;
use segment_ledger::{
    Actor, BookingId, Config, EntryDraft, EntryFilter, EntryKind, InMemoryBookings, Ledger,
    MockGateway, Money, OrderId, PaymentError, PaymentId, SegmentEngine, SegmentKind,
    SegmentPlanItem, SegmentState, SegmentStore, UserId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// === Deadlock Detection Infrastructure ===

struct Detector {
    running: Arc<AtomicBool>,
    found: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Starts a background thread that checks for deadlocks.
fn start_deadlock_detector() -> Detector {
    let running = Arc::new(AtomicBool::new(true));
    let found = Arc::new(AtomicBool::new(false));
    let (running_clone, found_clone) = (running.clone(), found.clone());

    let handle = thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                found_clone.store(true, Ordering::SeqCst);
                return;
            }
        }
    });

    Detector {
        running,
        found,
        handle,
    }
}

/// Stops the detector and fails the test if it saw a cycle.
fn stop_deadlock_detector(detector: Detector) {
    detector.running.store(false, Ordering::SeqCst);
    detector.handle.join().unwrap();
    assert!(
        !detector.found.load(Ordering::SeqCst),
        "deadlock detected, see stderr"
    );
}

fn plan() -> Vec<SegmentPlanItem> {
    vec![
        SegmentPlanItem::new(100, "advance", SegmentKind::Advance),
        SegmentPlanItem::new(100, "milestone 1", SegmentKind::Milestone),
        SegmentPlanItem::new(100, "milestone 2", SegmentKind::Milestone),
        SegmentPlanItem::new(100, "final", SegmentKind::Final),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// === Tests ===

#[test]
fn no_deadlock_transitions_and_snapshots_on_one_booking() {
    let detector = start_deadlock_detector();
    let store = Arc::new(SegmentStore::default());
    let segments = store
        .plan(BookingId(1), Money::new(400), &plan(), chrono::Utc::now())
        .unwrap();

    let mut handles = Vec::new();
    for worker in 0..8usize {
        let store = Arc::clone(&store);
        let id = segments[worker % segments.len()].id;
        handles.push(thread::spawn(move || {
            for round in 0..500 {
                let order = OrderId::new(format!("order_{worker}_{round}"));
                let ordered = store.transition(id, SegmentState::Pending, SegmentState::Ordered, |s| {
                    s.gateway_order_id = Some(order);
                });
                if ordered.is_ok() {
                    store
                        .transition(id, SegmentState::Ordered, SegmentState::Failed, |_| {})
                        .unwrap();
                    store
                        .transition(id, SegmentState::Failed, SegmentState::Pending, |s| {
                            s.gateway_order_id = None;
                        })
                        .unwrap();
                }
            }
        }));
    }
    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                let snapshot = store.list(BookingId(1));
                let ordered = snapshot
                    .iter()
                    .filter(|s| s.state == SegmentState::Ordered)
                    .count();
                assert!(ordered <= 1);
                let _ = store.ordered_before(chrono::Utc::now());
                let _ = store.find_next_pending(BookingId(1));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(
        store
            .list(BookingId(1))
            .iter()
            .all(|s| s.state == SegmentState::Pending)
    );
    stop_deadlock_detector(detector);
}

#[test]
fn no_deadlock_captures_alongside_admin_ledger_work() {
    let detector = start_deadlock_detector();
    let bookings = Arc::new(InMemoryBookings::new());
    for id in 1..=8 {
        bookings.add_finalized(BookingId(id), UserId(100 + id), Money::new(400));
    }
    let gateway = Arc::new(MockGateway::new("secret"));
    let engine = Arc::new(SegmentEngine::new(Config::default(), bookings, gateway.clone()).unwrap());

    let mut handles = Vec::new();
    for id in 1..=8u64 {
        let engine = Arc::clone(&engine);
        let gateway = Arc::clone(&gateway);
        handles.push(thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let booking = BookingId(id);
                let actor = Actor::customer(100 + id);
                engine.plan(booking, &plan(), &actor).await.unwrap();
                for index in 0..4 {
                    let order = engine.start_payment(booking, index, &actor).await.unwrap();
                    let payment_id = PaymentId::new(format!("pay_{id}_{index}"));
                    let signature = gateway.pay(&order.order_id, &payment_id).unwrap();
                    engine
                        .verify_payment(booking, index, &order.order_id, &payment_id, &signature, &actor)
                        .await
                        .unwrap();
                }
            });
        }));
    }
    for worker in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let admin = Actor::admin(1);
            for round in 0..200u64 {
                let draft = EntryDraft::new(EntryKind::Pay, Money::new(50), format!("vendor {worker}"));
                let entry = engine.create_entry(draft, &admin).unwrap();
                engine.apply_payment(entry.id, Money::new(20), &admin).unwrap();
                if round % 50 == 0 {
                    let balance = engine.balance(&admin).unwrap().current_balance;
                    let _ = engine.set_balance(balance + 10, "float top-up", &admin);
                }
                engine.financial_summary(&admin).unwrap();
                let mut sink = Vec::new();
                engine
                    .export_statement(&mut sink, &EntryFilter::default(), &admin)
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.ledger().reconcile().unwrap().is_balanced());
    assert_eq!(engine.drain_captures().len(), 32);
    stop_deadlock_detector(detector);
}

#[test]
fn lock_timeout_surfaces_as_conflict() {
    let store = Arc::new(SegmentStore::new(Duration::from_millis(20)));
    store
        .plan(BookingId(1), Money::new(400), &plan(), chrono::Utc::now())
        .unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let holder = {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            store
                .with_booking(BookingId(1), |_| {
                    barrier.wait();
                    thread::sleep(Duration::from_millis(200));
                    Ok(())
                })
                .unwrap();
        })
    };
    barrier.wait();
    let contended = store.with_booking(BookingId(1), |txn| Ok(txn.segments().len()));
    assert_eq!(contended, Err(PaymentError::Conflict));
    holder.join().unwrap();

    // Readers were never blocked out for good.
    assert_eq!(store.list(BookingId(1)).len(), 4);
}

/// An engine with one booking whose first segment is ordered and paid at
/// the gateway, waiting for its callback.
fn engine_awaiting_callback(
    lock_timeout: Duration,
    rt: &tokio::runtime::Runtime,
) -> (Arc<SegmentEngine>, OrderId, PaymentId, String) {
    let bookings = Arc::new(InMemoryBookings::new());
    bookings.add_finalized(BookingId(1), UserId(10), Money::new(400));
    let gateway = Arc::new(MockGateway::new("lock-secret"));
    let config = Config::default()
        .with_lock_timeout(lock_timeout)
        .with_gateway_retries(0, Duration::from_millis(1));
    let engine = Arc::new(SegmentEngine::new(config, bookings, gateway.clone()).unwrap());
    let actor = Actor::customer(10);
    let order = rt.block_on(async {
        engine.plan(BookingId(1), &plan(), &actor).await.unwrap();
        engine.start_payment(BookingId(1), 0, &actor).await.unwrap()
    });
    let payment_id = PaymentId::new("pay_locked");
    let signature = gateway.pay(&order.order_id, &payment_id).unwrap();
    (engine, order.order_id, payment_id, signature)
}

/// Holds booking 1's write lock for `hold` on another thread, returning once
/// the lock is taken.
fn hold_booking(engine: &Arc<SegmentEngine>, hold: Duration) -> thread::JoinHandle<()> {
    let barrier = Arc::new(Barrier::new(2));
    let holder = {
        let engine = Arc::clone(engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            engine
                .segments()
                .with_booking(BookingId(1), |_| {
                    barrier.wait();
                    thread::sleep(hold);
                    Ok(())
                })
                .unwrap();
        })
    };
    barrier.wait();
    holder
}

#[test]
fn verify_retries_once_after_losing_the_booking_lock() {
    let rt = runtime();
    let (engine, order_id, payment_id, signature) =
        engine_awaiting_callback(Duration::from_millis(250), &rt);

    // Outlasts the first lock wait but not the retry.
    let holder = hold_booking(&engine, Duration::from_millis(400));
    let paid = rt.block_on(engine.verify_payment(
        BookingId(1),
        0,
        &order_id,
        &payment_id,
        &signature,
        &Actor::customer(10),
    ));
    holder.join().unwrap();

    assert_eq!(paid.unwrap().state, SegmentState::Paid);
    assert_eq!(engine.ledger().entry_count(), 1);
    assert_eq!(engine.ledger().balance().current_balance, 100);
}

#[test]
fn verify_reports_conflict_when_the_retry_also_loses() {
    let rt = runtime();
    let (engine, order_id, payment_id, signature) =
        engine_awaiting_callback(Duration::from_millis(100), &rt);
    let customer = Actor::customer(10);

    let holder = hold_booking(&engine, Duration::from_millis(800));
    let contended = rt.block_on(engine.verify_payment(
        BookingId(1),
        0,
        &order_id,
        &payment_id,
        &signature,
        &customer,
    ));
    assert_eq!(contended, Err(PaymentError::Conflict));
    holder.join().unwrap();

    assert_eq!(engine.ledger().entry_count(), 0);
    assert_eq!(engine.ledger().balance().current_balance, 0);
    let segment = engine.segments().get_by_index(BookingId(1), 0).unwrap();
    assert_eq!(segment.state, SegmentState::Ordered);

    // Nothing was half-applied, so the caller's retry goes through.
    let paid = rt
        .block_on(engine.verify_payment(BookingId(1), 0, &order_id, &payment_id, &signature, &customer))
        .unwrap();
    assert_eq!(paid.state, SegmentState::Paid);
    assert_eq!(engine.ledger().entry_count(), 1);
}

#[test]
fn no_deadlock_ledger_readers_and_writers() {
    let detector = start_deadlock_detector();
    let ledger = Arc::new(Ledger::new(chrono::Utc::now()));

    let mut handles = Vec::new();
    for worker in 0..6u64 {
        let ledger = Arc::clone(&ledger);
        handles.push(thread::spawn(move || {
            for round in 0..300u64 {
                let now = chrono::Utc::now();
                let kind = if round % 2 == 0 {
                    EntryKind::Receive
                } else {
                    EntryKind::Pay
                };
                let entry = ledger
                    .create_entry(EntryDraft::new(kind, Money::new(10), "cash"), UserId(worker), now)
                    .unwrap();
                ledger.apply_payment(entry.id, Money::new(4), now).unwrap();
                if round % 3 == 0 {
                    ledger.delete_entry(entry.id, now).unwrap();
                }
            }
        }));
    }
    for _ in 0..3 {
        let ledger = Arc::clone(&ledger);
        handles.push(thread::spawn(move || {
            for _ in 0..300 {
                ledger.summary().unwrap();
                let _ = ledger.pending(EntryKind::Receive);
                let _ = ledger.reconcile().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(ledger.reconcile().unwrap().is_balanced());
    stop_deadlock_detector(detector);
}
