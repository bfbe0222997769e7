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

//! Who may act on a booking's payments.
//!
//! Owners are the booking's customer. Admins may act on any booking, and
//! their id is recorded on the ledger entries they cause. Workers never
//! initiate or verify payments.

use crate::base::UserId;
use crate::booking::BookingRef;
use crate::error::PaymentError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Customer,
    Worker,
    Vendor,
    Admin,
}

/// Identity issuing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub user_type: UserType,
}

impl Actor {
    pub fn customer(id: u64) -> Self {
        Self {
            id: UserId(id),
            user_type: UserType::Customer,
        }
    }

    pub fn admin(id: u64) -> Self {
        Self {
            id: UserId(id),
            user_type: UserType::Admin,
        }
    }

    pub fn worker(id: u64) -> Self {
        Self {
            id: UserId(id),
            user_type: UserType::Worker,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user_type == UserType::Admin
    }

    /// Admin id to stamp on ledger entries this actor causes.
    pub fn admin_id(&self) -> Option<UserId> {
        self.is_admin().then_some(self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Owner,
    Admin,
    Denied,
}

impl Access {
    /// # Errors
    ///
    /// [`PaymentError::Forbidden`] when access is denied.
    pub fn require(self) -> Result<Access, PaymentError> {
        match self {
            Access::Denied => Err(PaymentError::Forbidden),
            granted => Ok(granted),
        }
    }
}

/// Maps an actor and a booking to the access the actor holds.
pub fn check(actor: &Actor, booking: &BookingRef) -> Access {
    match actor.user_type {
        UserType::Admin => Access::Admin,
        UserType::Customer if actor.id == booking.customer_id => Access::Owner,
        _ => Access::Denied,
    }
}

/// # Errors
///
/// [`PaymentError::Forbidden`] unless the actor is an admin.
pub fn require_admin(actor: &Actor) -> Result<(), PaymentError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(PaymentError::Forbidden)
    }
}
