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

//! Admin access to the cash/bank ledger.
//!
//! Every operation requires an admin actor and stamps entries it creates
//! with that admin's id.

use crate::authz::{self, Actor};
use crate::base::EntryId;
use crate::engine::SegmentEngine;
use crate::error::PaymentError;
use crate::ledger::{
    CashBankBalance, EntryDraft, EntryFilter, EntryKind, EntryPatch, LedgerEntry, Page,
};
use crate::money::Money;
use std::io::Write;

impl SegmentEngine {
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins, plus the ledger's own
    /// validation errors.
    pub fn create_entry(
        &self,
        draft: EntryDraft,
        actor: &Actor,
    ) -> Result<LedgerEntry, PaymentError> {
        authz::require_admin(actor)?;
        self.ledger().create_entry(draft, actor.id, self.now())
    }

    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins,
    /// [`PaymentError::EntryImmutable`] for completed or segment entries.
    pub fn update_entry(
        &self,
        id: EntryId,
        patch: EntryPatch,
        actor: &Actor,
    ) -> Result<LedgerEntry, PaymentError> {
        authz::require_admin(actor)?;
        self.ledger().update_entry(id, patch, self.now())
    }

    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins,
    /// [`PaymentError::EntryImmutable`] for completed or segment entries.
    pub fn delete_entry(&self, id: EntryId, actor: &Actor) -> Result<LedgerEntry, PaymentError> {
        authz::require_admin(actor)?;
        self.ledger().delete_entry(id, self.now())
    }

    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins,
    /// [`PaymentError::BadRequest`] for overpayment.
    pub fn apply_payment(
        &self,
        id: EntryId,
        amount: Money,
        actor: &Actor,
    ) -> Result<LedgerEntry, PaymentError> {
        authz::require_admin(actor)?;
        self.ledger().apply_payment(id, amount, self.now())
    }

    /// Overrides the cash/bank balance and records the audit entry.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins,
    /// [`PaymentError::BadRequest`] without a reason.
    pub fn set_balance(
        &self,
        new_value: i64,
        reason: &str,
        actor: &Actor,
    ) -> Result<(CashBankBalance, Option<LedgerEntry>), PaymentError> {
        authz::require_admin(actor)?;
        self.ledger()
            .set_balance(new_value, reason, actor.id, self.now())
    }

    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins.
    pub fn balance(&self, actor: &Actor) -> Result<CashBankBalance, PaymentError> {
        authz::require_admin(actor)?;
        Ok(self.ledger().balance())
    }

    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins.
    pub fn list_entries(
        &self,
        filter: &EntryFilter,
        page: Page,
        actor: &Actor,
    ) -> Result<Vec<LedgerEntry>, PaymentError> {
        authz::require_admin(actor)?;
        Ok(self.ledger().list_entries(filter, page))
    }

    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins.
    pub fn pending_entries(
        &self,
        kind: EntryKind,
        actor: &Actor,
    ) -> Result<Vec<LedgerEntry>, PaymentError> {
        authz::require_admin(actor)?;
        Ok(self.ledger().pending(kind))
    }

    /// Writes a CSV statement of the matching entries.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] for non-admins,
    /// [`PaymentError::StoreUnavailable`] if the writer fails.
    pub fn export_statement<W: Write>(
        &self,
        writer: W,
        filter: &EntryFilter,
        actor: &Actor,
    ) -> Result<(), PaymentError> {
        authz::require_admin(actor)?;
        self.ledger()
            .write_statement(writer, filter, self.config().currency_minor_unit_factor)
            .map_err(|e| PaymentError::StoreUnavailable(format!("statement export: {e}")))
    }
}
