//! Account balance ledger
//!
//! The only two ways a balance changes: `debit` and `credit`. Both operate on
//! a locked account row, read the balance through the guard, append an
//! immutable entry stamped with the post-operation balance, and keep the
//! account and its history in lockstep. The audit recomputes a balance from
//! the entries; a divergence is a bug and is never silently corrected.

use crate::{
    error::ExchangeError,
    models::{Account, LedgerEntry, LedgerEntryKind},
    store::ExchangeStore,
    ExchangeResult,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Ledger primitives over the row store
pub struct Ledger {
    store: Arc<ExchangeStore>,
    /// Balances may not drop below this (a small overdraft bootstraps new
    /// members; the default is -10.00)
    floor: Decimal,
}

impl Ledger {
    /// Create a ledger with the given overdraft floor
    pub fn new(store: Arc<ExchangeStore>, floor: Decimal) -> Self {
        Self { store, floor }
    }

    /// The configured overdraft floor
    pub fn floor(&self) -> Decimal {
        self.floor
    }

    /// Debit hours from a locked account row.
    ///
    /// Fails with `InsufficientBalance` and touches nothing if the floor
    /// would be breached. The balance is read through the guard the caller
    /// holds, never from any earlier snapshot.
    pub async fn debit(
        &self,
        account: &mut Account,
        hours: Decimal,
        kind: LedgerEntryKind,
        handshake_id: Option<Uuid>,
        description: String,
    ) -> ExchangeResult<LedgerEntry> {
        let hours = checked_amount(hours)?;
        let balance_after = account.balance - hours;
        if balance_after < self.floor {
            return Err(ExchangeError::InsufficientBalance {
                required: hours,
                available: account.balance,
                floor: self.floor,
            });
        }

        account.balance = balance_after;
        account.updated_at = Utc::now();
        let entry = LedgerEntry::new(
            account.id,
            kind,
            -hours,
            balance_after,
            handshake_id,
            description,
        );
        self.store.append_entry(entry.clone()).await;
        Ok(entry)
    }

    /// Credit hours to a locked account row
    pub async fn credit(
        &self,
        account: &mut Account,
        hours: Decimal,
        kind: LedgerEntryKind,
        handshake_id: Option<Uuid>,
        description: String,
    ) -> ExchangeResult<LedgerEntry> {
        let hours = checked_amount(hours)?;
        let balance_after = account.balance + hours;

        account.balance = balance_after;
        account.updated_at = Utc::now();
        let entry = LedgerEntry::new(
            account.id,
            kind,
            hours,
            balance_after,
            handshake_id,
            description,
        );
        self.store.append_entry(entry.clone()).await;
        Ok(entry)
    }

    /// Recompute an account's balance from its opening balance and entries.
    ///
    /// Returns the reconstructed balance on success. A mismatch against the
    /// stored balance means a mutation bypassed the ledger; that is fatal.
    pub async fn audit_account(&self, account_id: Uuid) -> ExchangeResult<Decimal> {
        let account = self.store.lock_account(account_id).await?;
        let entries = self.store.entries_for_account(account_id).await;

        let reconstructed = entries
            .iter()
            .fold(account.opening_balance, |acc, e| acc + e.amount);

        if reconstructed != account.balance {
            error!(
                "ledger divergence for account {}: stored {} reconstructed {}",
                account_id, account.balance, reconstructed
            );
            return Err(ExchangeError::invariant(format!(
                "account {} balance {} does not match ledger sum {}",
                account_id, account.balance, reconstructed
            )));
        }

        // running balance_after stamps must agree with the running sum
        let mut running = account.opening_balance;
        for entry in &entries {
            running += entry.amount;
            if entry.balance_after != running {
                error!(
                    "ledger entry {} for account {} stamped {} but running sum is {}",
                    entry.id, account_id, entry.balance_after, running
                );
                return Err(ExchangeError::invariant(format!(
                    "entry {} balance_after diverges from the running sum",
                    entry.id
                )));
            }
        }

        Ok(reconstructed)
    }
}

/// Hour amounts entering the ledger must be positive with at most two
/// decimal places; anything else slipped past input validation.
fn checked_amount(hours: Decimal) -> ExchangeResult<Decimal> {
    if hours <= Decimal::ZERO {
        return Err(ExchangeError::invariant(format!(
            "ledger amount {hours} is not positive"
        )));
    }
    if hours.round_dp(2) != hours {
        return Err(ExchangeError::invariant(format!(
            "ledger amount {hours} has sub-cent precision"
        )));
    }
    Ok(hours)
}
