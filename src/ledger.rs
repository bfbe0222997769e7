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

//! Cash/bank ledger.
//!
//! Entries record money the business receives (`RECEIVE`) or pays out
//! (`PAY`). Each entry tracks how much of its gross amount has actually moved
//! and derives its status from that:
//!
//! ```text
//!  PENDING (paid = 0) ──pay──► PARTIAL (0 < paid < gross) ──pay──► COMPLETED (paid = gross)
//! ```
//!
//! Every change to a paid amount moves the single cash/bank balance row in
//! the same critical section, so the reconciliation identity
//! `balance = Σ RECEIVE.paid − Σ PAY.paid` holds whenever the lock is free.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use segment_ledger::{EntryDraft, EntryKind, Ledger, Money, UserId};
//!
//! let ledger = Ledger::new(Utc::now());
//! let draft = EntryDraft::new(EntryKind::Pay, Money::new(5_000), "Plumbing supplies");
//! let entry = ledger.create_entry(draft, UserId(1), Utc::now()).unwrap();
//! ledger.apply_payment(entry.id, Money::new(5_000), Utc::now()).unwrap();
//! assert_eq!(ledger.balance().current_balance, -5_000);
//! ```

use crate::base::{BookingId, EntryId, IdSequence, SegmentId, UserId};
use crate::error::PaymentError;
use crate::money::{Money, format_minor};
use crate::segment::PaymentSegment;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Receive,
    Pay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Partial,
    Completed,
}

impl EntryStatus {
    fn derive(paid: Money, gross: Money) -> Self {
        if paid.is_zero() {
            EntryStatus::Pending
        } else if paid == gross {
            EntryStatus::Completed
        } else {
            EntryStatus::Partial
        }
    }
}

/// Where an entry came from; decides whether admins may edit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryOrigin {
    Manual,
    Segment,
    BalanceAdjustment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub gross_amount: Money,
    pub paid_amount: Money,
    pub status: EntryStatus,
    pub origin: EntryOrigin,
    pub counterparty: String,
    pub narration: String,
    pub booking_id: Option<BookingId>,
    pub segment_id: Option<SegmentId>,
    /// Admin who created the entry; `None` when a customer paid a segment.
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl LedgerEntry {
    pub fn outstanding(&self) -> Money {
        Money::new(
            self.gross_amount
                .minor()
                .saturating_sub(self.paid_amount.minor()),
        )
    }

    fn is_editable(&self) -> bool {
        self.origin == EntryOrigin::Manual
            && self.segment_id.is_none()
            && self.status != EntryStatus::Completed
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.paid_amount <= self.gross_amount,
            "Invariant violated: paid {} exceeds gross {} on entry {}",
            self.paid_amount,
            self.gross_amount,
            self.id
        );
        debug_assert_eq!(
            self.status,
            EntryStatus::derive(self.paid_amount, self.gross_amount),
            "Invariant violated: status out of sync on entry {}",
            self.id
        );
    }
}

/// Admin input for a manual entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub kind: EntryKind,
    pub gross_amount: Money,
    #[serde(default)]
    pub paid_amount: Money,
    pub counterparty: String,
    #[serde(default)]
    pub narration: String,
    #[serde(default)]
    pub booking_id: Option<BookingId>,
}

impl EntryDraft {
    pub fn new(kind: EntryKind, gross_amount: Money, counterparty: impl Into<String>) -> Self {
        Self {
            kind,
            gross_amount,
            paid_amount: Money::ZERO,
            counterparty: counterparty.into(),
            narration: String::new(),
            booking_id: None,
        }
    }

    #[must_use]
    pub fn paid(mut self, amount: Money) -> Self {
        self.paid_amount = amount;
        self
    }

    #[must_use]
    pub fn narration(mut self, narration: impl Into<String>) -> Self {
        self.narration = narration.into();
        self
    }

    #[must_use]
    pub fn booking(mut self, booking_id: BookingId) -> Self {
        self.booking_id = Some(booking_id);
        self
    }
}

/// Admin edit of a manual entry. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPatch {
    pub counterparty: Option<String>,
    pub narration: Option<String>,
    pub gross_amount: Option<Money>,
    /// Rejects the patch with [`PaymentError::Conflict`] if the entry moved on.
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    pub kind: Option<EntryKind>,
    pub status: Option<EntryStatus>,
    pub booking_id: Option<BookingId>,
    /// Only entries posted by segment payments.
    #[serde(default)]
    pub segment_only: bool,
}

impl EntryFilter {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        self.kind.is_none_or(|k| entry.kind == k)
            && self.status.is_none_or(|s| entry.status == s)
            && self.booking_id.is_none_or(|b| entry.booking_id == Some(b))
            && (!self.segment_only || entry.segment_id.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 500;

    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, 50)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashBankBalance {
    pub current_balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_received: Money,
    pub total_paid: Money,
    pub net: i64,
    pub pending_receivables: Money,
    pub pending_payables: Money,
    pub balance: i64,
}

/// Recorded balance next to the one implied by the entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDrift {
    pub recorded: i64,
    pub expected: i64,
}

impl BalanceDrift {
    pub fn is_balanced(&self) -> bool {
        self.recorded == self.expected
    }
}

#[derive(Debug)]
struct LedgerData {
    entries: BTreeMap<EntryId, LedgerEntry>,
    balance: CashBankBalance,
}

impl LedgerData {
    /// Moves the balance by a paid amount of the given kind; `reverse`
    /// undoes an earlier movement.
    fn shift_balance(
        &mut self,
        kind: EntryKind,
        amount: Money,
        reverse: bool,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        let amount = amount.as_signed()?;
        let credit = (kind == EntryKind::Receive) != reverse;
        let next = if credit {
            self.balance.current_balance.checked_add(amount)
        } else {
            self.balance.current_balance.checked_sub(amount)
        }
        .ok_or(PaymentError::Arithmetic)?;
        self.balance.current_balance = next;
        self.balance.updated_at = now;
        Ok(())
    }

    fn get_mut(&mut self, id: EntryId) -> Result<&mut LedgerEntry, PaymentError> {
        self.entries.get_mut(&id).ok_or(PaymentError::EntryNotFound)
    }

    fn expected_balance(&self) -> Result<i64, PaymentError> {
        self.entries.values().try_fold(0i64, |acc, entry| {
            let paid = entry.paid_amount.as_signed()?;
            match entry.kind {
                EntryKind::Receive => acc.checked_add(paid),
                EntryKind::Pay => acc.checked_sub(paid),
            }
            .ok_or(PaymentError::Arithmetic)
        })
    }
}

/// In-memory ledger store holding entries and the cash/bank balance row.
#[derive(Debug)]
pub struct Ledger {
    inner: RwLock<LedgerData>,
    ids: IdSequence,
}

impl Ledger {
    /// Creates an empty ledger with the balance row initialized to zero.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: RwLock::new(LedgerData {
                entries: BTreeMap::new(),
                balance: CashBankBalance {
                    current_balance: 0,
                    updated_at: now,
                },
            }),
            ids: IdSequence::new(),
        }
    }

    /// Records a manual entry.
    ///
    /// # Errors
    ///
    /// [`PaymentError::BadRequest`] for a zero gross amount, a paid amount
    /// above gross, or an empty counterparty.
    pub fn create_entry(
        &self,
        draft: EntryDraft,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, PaymentError> {
        if draft.gross_amount.is_zero() {
            return Err(PaymentError::BadRequest(
                "gross amount must be positive".into(),
            ));
        }
        if draft.paid_amount > draft.gross_amount {
            return Err(PaymentError::BadRequest(
                "paid amount exceeds gross amount".into(),
            ));
        }
        if draft.counterparty.trim().is_empty() {
            return Err(PaymentError::BadRequest("counterparty is required".into()));
        }

        let entry = LedgerEntry {
            id: EntryId(self.ids.next()),
            kind: draft.kind,
            gross_amount: draft.gross_amount,
            paid_amount: draft.paid_amount,
            status: EntryStatus::derive(draft.paid_amount, draft.gross_amount),
            origin: EntryOrigin::Manual,
            counterparty: draft.counterparty,
            narration: draft.narration,
            booking_id: draft.booking_id,
            segment_id: None,
            created_by: Some(created_by),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        entry.assert_invariants();

        let mut data = self.inner.write();
        if !entry.paid_amount.is_zero() {
            data.shift_balance(entry.kind, entry.paid_amount, false, now)?;
        }
        data.entries.insert(entry.id, entry.clone());
        tracing::info!(
            entry_id = %entry.id,
            kind = ?entry.kind,
            gross = entry.gross_amount.minor(),
            paid = entry.paid_amount.minor(),
            "ledger entry created"
        );
        Ok(entry)
    }

    /// Edits a manual entry that is not yet completed.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::EntryImmutable`] for completed or segment entries.
    /// - [`PaymentError::Conflict`] if `expected_version` is stale.
    /// - [`PaymentError::BadRequest`] if the new gross is zero or below the
    ///   amount already paid.
    pub fn update_entry(
        &self,
        id: EntryId,
        patch: EntryPatch,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, PaymentError> {
        let mut data = self.inner.write();
        let entry = data.get_mut(id)?;
        if !entry.is_editable() {
            return Err(PaymentError::EntryImmutable);
        }
        if patch.expected_version.is_some_and(|v| v != entry.version) {
            return Err(PaymentError::Conflict);
        }
        if let Some(gross) = patch.gross_amount {
            if gross.is_zero() || gross < entry.paid_amount {
                return Err(PaymentError::BadRequest(
                    "gross amount must cover the paid amount".into(),
                ));
            }
        }
        if patch
            .counterparty
            .as_ref()
            .is_some_and(|c| c.trim().is_empty())
        {
            return Err(PaymentError::BadRequest("counterparty is required".into()));
        }

        if let Some(counterparty) = patch.counterparty {
            entry.counterparty = counterparty;
        }
        if let Some(narration) = patch.narration {
            entry.narration = narration;
        }
        if let Some(gross) = patch.gross_amount {
            entry.gross_amount = gross;
            entry.status = EntryStatus::derive(entry.paid_amount, gross);
        }
        entry.version += 1;
        entry.updated_at = now;
        entry.assert_invariants();
        Ok(entry.clone())
    }

    /// Removes a manual entry, reversing whatever it moved in the balance.
    ///
    /// # Errors
    ///
    /// [`PaymentError::EntryImmutable`] for completed or segment entries.
    pub fn delete_entry(&self, id: EntryId, now: DateTime<Utc>) -> Result<LedgerEntry, PaymentError> {
        let mut data = self.inner.write();
        let entry = data.entries.get(&id).ok_or(PaymentError::EntryNotFound)?;
        if !entry.is_editable() {
            return Err(PaymentError::EntryImmutable);
        }
        let (kind, paid) = (entry.kind, entry.paid_amount);
        if !paid.is_zero() {
            data.shift_balance(kind, paid, true, now)?;
        }
        let removed = data.entries.remove(&id).ok_or(PaymentError::EntryNotFound)?;
        tracing::info!(entry_id = %id, "ledger entry deleted");
        Ok(removed)
    }

    /// Pays `amount` against an entry and moves the balance with it.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::BadRequest`] for a zero amount or one larger than
    ///   what is outstanding.
    /// - [`PaymentError::EntryImmutable`] for completed or segment entries.
    pub fn apply_payment(
        &self,
        id: EntryId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, PaymentError> {
        if amount.is_zero() {
            return Err(PaymentError::BadRequest("payment must be positive".into()));
        }
        let mut data = self.inner.write();
        let entry = data.get_mut(id)?;
        if !entry.is_editable() {
            return Err(PaymentError::EntryImmutable);
        }
        let paid = entry.paid_amount.add(amount)?;
        if paid > entry.gross_amount {
            return Err(PaymentError::BadRequest(
                "payment exceeds outstanding amount".into(),
            ));
        }
        let kind = entry.kind;
        data.shift_balance(kind, amount, false, now)?;

        let entry = data.get_mut(id)?;
        entry.paid_amount = paid;
        entry.status = EntryStatus::derive(paid, entry.gross_amount);
        entry.version += 1;
        entry.updated_at = now;
        entry.assert_invariants();
        tracing::info!(
            entry_id = %id,
            amount = amount.minor(),
            status = ?entry.status,
            "payment applied to ledger entry"
        );
        Ok(entry.clone())
    }

    /// Posts the completed `RECEIVE` entry for a captured segment and credits
    /// the balance, in one critical section.
    ///
    /// # Errors
    ///
    /// [`PaymentError::AmountMismatch`] if `amount` differs from the segment
    /// amount; [`PaymentError::Arithmetic`] if the balance would overflow.
    pub fn post_segment_receive(
        &self,
        segment: &PaymentSegment,
        amount: Money,
        created_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, PaymentError> {
        if amount != segment.amount {
            return Err(PaymentError::AmountMismatch {
                expected: segment.amount,
                charged: amount,
            });
        }
        let entry = LedgerEntry {
            id: EntryId(self.ids.next()),
            kind: EntryKind::Receive,
            gross_amount: amount,
            paid_amount: amount,
            status: EntryStatus::Completed,
            origin: EntryOrigin::Segment,
            counterparty: format!("booking {}", segment.booking_id),
            narration: format!("{} (segment {})", segment.label, segment.index),
            booking_id: Some(segment.booking_id),
            segment_id: Some(segment.id),
            created_by,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        entry.assert_invariants();

        let mut data = self.inner.write();
        data.shift_balance(EntryKind::Receive, amount, false, now)?;
        data.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    /// Undoes [`Ledger::post_segment_receive`] when the paired segment
    /// transition could not be committed.
    pub(crate) fn rollback_segment_receive(
        &self,
        id: EntryId,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        let mut data = self.inner.write();
        let entry = data.entries.get(&id).ok_or(PaymentError::EntryNotFound)?;
        if entry.origin != EntryOrigin::Segment {
            return Err(PaymentError::EntryImmutable);
        }
        let amount = entry.paid_amount;
        data.shift_balance(EntryKind::Receive, amount, true, now)?;
        data.entries.remove(&id);
        tracing::warn!(entry_id = %id, "segment ledger posting rolled back");
        Ok(())
    }

    pub fn get_entry(&self, id: EntryId) -> Result<LedgerEntry, PaymentError> {
        self.inner
            .read()
            .entries
            .get(&id)
            .cloned()
            .ok_or(PaymentError::EntryNotFound)
    }

    /// Entries matching `filter`, newest first by `(created_at, id)`.
    pub fn list_entries(&self, filter: &EntryFilter, page: Page) -> Vec<LedgerEntry> {
        let data = self.inner.read();
        let mut matching: Vec<&LedgerEntry> =
            data.entries.values().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect()
    }

    /// Entries of `kind` that still have money outstanding.
    pub fn pending(&self, kind: EntryKind) -> Vec<LedgerEntry> {
        let filter = EntryFilter {
            kind: Some(kind),
            ..EntryFilter::default()
        };
        let data = self.inner.read();
        let mut pending: Vec<LedgerEntry> = data
            .entries
            .values()
            .filter(|e| filter.matches(e) && e.status != EntryStatus::Completed)
            .cloned()
            .collect();
        pending.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        pending
    }

    /// Totals computed from the entries, plus the recorded balance.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Arithmetic`] if a total overflows.
    pub fn summary(&self) -> Result<LedgerSummary, PaymentError> {
        let data = self.inner.read();
        let mut total_received = Money::ZERO;
        let mut total_paid = Money::ZERO;
        let mut pending_receivables = Money::ZERO;
        let mut pending_payables = Money::ZERO;
        for entry in data.entries.values() {
            match entry.kind {
                EntryKind::Receive => {
                    total_received = total_received.add(entry.paid_amount)?;
                    pending_receivables = pending_receivables.add(entry.outstanding())?;
                }
                EntryKind::Pay => {
                    total_paid = total_paid.add(entry.paid_amount)?;
                    pending_payables = pending_payables.add(entry.outstanding())?;
                }
            }
        }
        let net = total_received
            .as_signed()?
            .checked_sub(total_paid.as_signed()?)
            .ok_or(PaymentError::Arithmetic)?;
        Ok(LedgerSummary {
            total_received,
            total_paid,
            net,
            pending_receivables,
            pending_payables,
            balance: data.balance.current_balance,
        })
    }

    pub fn balance(&self) -> CashBankBalance {
        self.inner.read().balance
    }

    /// Overrides the balance, writing a completed audit entry for the delta.
    ///
    /// Raising the balance records a `RECEIVE`, lowering it a `PAY`; an
    /// unchanged balance records nothing.
    ///
    /// # Errors
    ///
    /// [`PaymentError::BadRequest`] for an empty reason,
    /// [`PaymentError::Arithmetic`] if the delta does not fit.
    pub fn set_balance(
        &self,
        new_value: i64,
        reason: &str,
        admin_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(CashBankBalance, Option<LedgerEntry>), PaymentError> {
        if reason.trim().is_empty() {
            return Err(PaymentError::BadRequest(
                "balance adjustment needs a reason".into(),
            ));
        }
        let mut data = self.inner.write();
        let current = data.balance.current_balance;
        let delta = i128::from(new_value) - i128::from(current);
        if delta == 0 {
            return Ok((data.balance, None));
        }
        let kind = if delta > 0 {
            EntryKind::Receive
        } else {
            EntryKind::Pay
        };
        let amount = u64::try_from(delta.unsigned_abs())
            .map(Money::new)
            .map_err(|_| PaymentError::Arithmetic)?;

        let entry = LedgerEntry {
            id: EntryId(self.ids.next()),
            kind,
            gross_amount: amount,
            paid_amount: amount,
            status: EntryStatus::Completed,
            origin: EntryOrigin::BalanceAdjustment,
            counterparty: "cash/bank adjustment".to_string(),
            narration: reason.to_string(),
            booking_id: None,
            segment_id: None,
            created_by: Some(admin_id),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        data.shift_balance(kind, amount, false, now)?;
        data.entries.insert(entry.id, entry.clone());
        debug_assert_eq!(data.balance.current_balance, new_value);
        tracing::info!(
            admin_id = %admin_id,
            previous = current,
            balance = new_value,
            entry_id = %entry.id,
            "cash/bank balance adjusted"
        );
        Ok((data.balance, Some(entry)))
    }

    /// Compares the recorded balance with `Σ RECEIVE.paid − Σ PAY.paid`.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Arithmetic`] if the recomputation overflows.
    pub fn reconcile(&self) -> Result<BalanceDrift, PaymentError> {
        let data = self.inner.read();
        Ok(BalanceDrift {
            recorded: data.balance.current_balance,
            expected: data.expected_balance()?,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Writes matching entries as CSV, newest first, amounts in major units.
    ///
    /// The last row carries the closing balance. It has no id, kind or status,
    /// so it never reads as an entry.
    ///
    /// # Errors
    ///
    /// Returns a CSV error if writing fails.
    pub fn write_statement<W: Write>(
        &self,
        writer: W,
        filter: &EntryFilter,
        minor_unit_factor: u32,
    ) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        let data = self.inner.read();
        let mut rows: Vec<&LedgerEntry> =
            data.entries.values().filter(|e| filter.matches(e)).collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        for entry in rows {
            wtr.serialize(StatementRow {
                id: Some(entry.id),
                date: entry.created_at.to_rfc3339(),
                kind: Some(entry.kind),
                status: Some(entry.status),
                counterparty: &entry.counterparty,
                narration: &entry.narration,
                gross: entry.gross_amount.format(minor_unit_factor),
                paid: entry.paid_amount.format(minor_unit_factor),
                booking: entry.booking_id,
                segment: entry.segment_id,
            })?;
        }
        wtr.serialize(StatementRow {
            id: None,
            date: data.balance.updated_at.to_rfc3339(),
            kind: None,
            status: None,
            counterparty: "closing balance",
            narration: "",
            gross: format_minor(i128::from(data.balance.current_balance), minor_unit_factor),
            paid: String::new(),
            booking: None,
            segment: None,
        })?;
        wtr.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct StatementRow<'a> {
    id: Option<EntryId>,
    date: String,
    kind: Option<EntryKind>,
    status: Option<EntryStatus>,
    counterparty: &'a str,
    narration: &'a str,
    gross: String,
    paid: String,
    booking: Option<BookingId>,
    segment: Option<SegmentId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentKind, SegmentState};

    fn ledger() -> Ledger {
        Ledger::new(Utc::now())
    }

    fn segment(amount: u64) -> PaymentSegment {
        PaymentSegment {
            id: SegmentId(9),
            booking_id: BookingId(3),
            index: 0,
            amount: Money::new(amount),
            label: "advance".into(),
            kind: SegmentKind::Advance,
            due_at: None,
            state: SegmentState::Ordered,
            gateway_order_id: None,
            gateway_payment_id: None,
            ledger_entry_id: None,
            status_reason: None,
            created_at: Utc::now(),
            ordered_at: None,
            paid_at: None,
        }
    }

    #[test]
    fn status_follows_paid_amount() {
        let gross = Money::new(100);
        assert_eq!(EntryStatus::derive(Money::ZERO, gross), EntryStatus::Pending);
        assert_eq!(EntryStatus::derive(Money::new(40), gross), EntryStatus::Partial);
        assert_eq!(EntryStatus::derive(gross, gross), EntryStatus::Completed);
    }

    #[test]
    fn partial_then_complete_receive() {
        let ledger = ledger();
        let entry = ledger
            .create_entry(
                EntryDraft::new(EntryKind::Receive, Money::new(1_000), "Vendor refund"),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);

        let entry = ledger
            .apply_payment(entry.id, Money::new(400), Utc::now())
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Partial);
        assert_eq!(ledger.balance().current_balance, 400);

        let entry = ledger
            .apply_payment(entry.id, Money::new(600), Utc::now())
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(ledger.balance().current_balance, 1_000);
    }

    #[test]
    fn overpayment_is_rejected() {
        let ledger = ledger();
        let entry = ledger
            .create_entry(
                EntryDraft::new(EntryKind::Pay, Money::new(100), "Worker payout"),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        let result = ledger.apply_payment(entry.id, Money::new(101), Utc::now());
        assert!(matches!(result, Err(PaymentError::BadRequest(_))));
        assert_eq!(ledger.balance().current_balance, 0);
    }

    #[test]
    fn completed_entries_are_immutable() {
        let ledger = ledger();
        let entry = ledger
            .create_entry(
                EntryDraft::new(EntryKind::Pay, Money::new(100), "Rent").paid(Money::new(100)),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(
            ledger.update_entry(entry.id, EntryPatch::default(), Utc::now()),
            Err(PaymentError::EntryImmutable)
        );
        assert_eq!(
            ledger.delete_entry(entry.id, Utc::now()),
            Err(PaymentError::EntryImmutable)
        );
    }

    #[test]
    fn segment_entries_are_completed_and_immutable() {
        let ledger = ledger();
        let entry = ledger
            .post_segment_receive(&segment(200_000), Money::new(200_000), None, Utc::now())
            .unwrap();
        assert_eq!(entry.kind, EntryKind::Receive);
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.paid_amount, entry.gross_amount);
        assert_eq!(entry.segment_id, Some(SegmentId(9)));
        assert_eq!(ledger.balance().current_balance, 200_000);
        assert_eq!(
            ledger.apply_payment(entry.id, Money::new(1), Utc::now()),
            Err(PaymentError::EntryImmutable)
        );
    }

    #[test]
    fn segment_posting_checks_amount() {
        let ledger = ledger();
        let result =
            ledger.post_segment_receive(&segment(500), Money::new(400), None, Utc::now());
        assert_eq!(
            result,
            Err(PaymentError::AmountMismatch {
                expected: Money::new(500),
                charged: Money::new(400),
            })
        );
        assert_eq!(ledger.entry_count(), 0);
    }

    #[test]
    fn rollback_restores_balance() {
        let ledger = ledger();
        let entry = ledger
            .post_segment_receive(&segment(500), Money::new(500), None, Utc::now())
            .unwrap();
        ledger.rollback_segment_receive(entry.id, Utc::now()).unwrap();
        assert_eq!(ledger.balance().current_balance, 0);
        assert_eq!(ledger.entry_count(), 0);
    }

    #[test]
    fn delete_reverses_partial_payment() {
        let ledger = ledger();
        let entry = ledger
            .create_entry(
                EntryDraft::new(EntryKind::Receive, Money::new(1_000), "Advance from vendor")
                    .paid(Money::new(300)),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(ledger.balance().current_balance, 300);
        ledger.delete_entry(entry.id, Utc::now()).unwrap();
        assert_eq!(ledger.balance().current_balance, 0);
        assert!(ledger.reconcile().unwrap().is_balanced());
    }

    #[test]
    fn update_checks_version_and_gross() {
        let ledger = ledger();
        let entry = ledger
            .create_entry(
                EntryDraft::new(EntryKind::Pay, Money::new(1_000), "Supplier")
                    .paid(Money::new(500)),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        let stale = EntryPatch {
            narration: Some("x".into()),
            expected_version: Some(entry.version + 1),
            ..EntryPatch::default()
        };
        assert_eq!(
            ledger.update_entry(entry.id, stale, Utc::now()),
            Err(PaymentError::Conflict)
        );
        let too_small = EntryPatch {
            gross_amount: Some(Money::new(400)),
            ..EntryPatch::default()
        };
        assert!(matches!(
            ledger.update_entry(entry.id, too_small, Utc::now()),
            Err(PaymentError::BadRequest(_))
        ));
        let shrink_to_paid = EntryPatch {
            gross_amount: Some(Money::new(500)),
            expected_version: Some(entry.version),
            ..EntryPatch::default()
        };
        let updated = ledger
            .update_entry(entry.id, shrink_to_paid, Utc::now())
            .unwrap();
        assert_eq!(updated.status, EntryStatus::Completed);
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn set_balance_writes_audit_entry() {
        let ledger = ledger();
        ledger
            .post_segment_receive(&segment(1_000_000), Money::new(1_000_000), None, Utc::now())
            .unwrap();
        let (balance, entry) = ledger
            .set_balance(900_000, "cash audit", UserId(7), Utc::now())
            .unwrap();
        let entry = entry.unwrap();
        assert_eq!(balance.current_balance, 900_000);
        assert_eq!(entry.kind, EntryKind::Pay);
        assert_eq!(entry.gross_amount, Money::new(100_000));
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.narration, "cash audit");
        assert!(ledger.reconcile().unwrap().is_balanced());

        let (_, none) = ledger
            .set_balance(900_000, "no-op", UserId(7), Utc::now())
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn summary_totals() {
        let ledger = ledger();
        ledger
            .post_segment_receive(&segment(700), Money::new(700), None, Utc::now())
            .unwrap();
        ledger
            .create_entry(
                EntryDraft::new(EntryKind::Pay, Money::new(300), "Worker").paid(Money::new(100)),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        ledger
            .create_entry(
                EntryDraft::new(EntryKind::Receive, Money::new(50), "Vendor fee"),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        let summary = ledger.summary().unwrap();
        assert_eq!(summary.total_received, Money::new(700));
        assert_eq!(summary.total_paid, Money::new(100));
        assert_eq!(summary.net, 600);
        assert_eq!(summary.pending_receivables, Money::new(50));
        assert_eq!(summary.pending_payables, Money::new(200));
        assert_eq!(summary.balance, 600);
    }

    #[test]
    fn listing_is_newest_first_with_id_tiebreak() {
        let ledger = ledger();
        let now = Utc::now();
        let first = ledger
            .create_entry(EntryDraft::new(EntryKind::Pay, Money::new(1), "a"), UserId(1), now)
            .unwrap();
        let second = ledger
            .create_entry(EntryDraft::new(EntryKind::Pay, Money::new(1), "b"), UserId(1), now)
            .unwrap();
        let listed = ledger.list_entries(&EntryFilter::default(), Page::default());
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        let page = ledger.list_entries(&EntryFilter::default(), Page::new(1, 1));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, first.id);
    }

    #[test]
    fn pending_lists_outstanding_entries_only() {
        let ledger = ledger();
        ledger
            .create_entry(
                EntryDraft::new(EntryKind::Pay, Money::new(10), "open"),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        ledger
            .create_entry(
                EntryDraft::new(EntryKind::Pay, Money::new(10), "done").paid(Money::new(10)),
                UserId(1),
                Utc::now(),
            )
            .unwrap();
        let pending = ledger.pending(EntryKind::Pay);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].counterparty, "open");
        assert!(ledger.pending(EntryKind::Receive).is_empty());
    }

    #[test]
    fn statement_csv_has_rows_and_closing_balance() {
        let ledger = ledger();
        ledger
            .post_segment_receive(&segment(200_000), Money::new(200_000), None, Utc::now())
            .unwrap();
        let mut out = Vec::new();
        ledger
            .write_statement(&mut out, &EntryFilter::default(), 100)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,date,kind,status,counterparty,narration,gross,paid,booking,segment"
        );
        assert!(lines.next().unwrap().contains("RECEIVE,COMPLETED,booking 3"));
        let closing = lines.next().unwrap();
        assert!(closing.starts_with(','));
        assert!(closing.contains(",,,closing balance,,2000.00"));
    }
}
