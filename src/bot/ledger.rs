//! Prepaid balances for image generation.

use crate::storage::{AccountStore, DebitOutcome, StorageError};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a pre-generation balance check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceCheck {
    /// Whether the balance covers the price
    pub sufficient: bool,
    /// Current balance, zero for users without an account
    pub balance: Decimal,
}

/// Reads and debits per-user balances
#[derive(Clone)]
pub struct BalanceLedger {
    store: Arc<dyn AccountStore>,
}

impl BalanceLedger {
    /// Create a ledger over the account store
    #[must_use]
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Compare the user's balance against `price`.
    ///
    /// A user without a balance account holds zero. A balance exactly equal
    /// to the price is sufficient.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the balance cannot be read.
    pub async fn check_balance(
        &self,
        user_id: i64,
        price: Decimal,
    ) -> Result<BalanceCheck, StorageError> {
        let balance = self.store.get_balance(user_id).await?.unwrap_or(Decimal::ZERO);
        Ok(BalanceCheck {
            sufficient: balance >= price,
            balance,
        })
    }

    /// Charge `price` and count one generated image, atomically.
    ///
    /// Never drives a balance below zero: if another request spent the money
    /// first, nothing changes and [`DebitOutcome::Insufficient`] comes back.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the update cannot be executed.
    pub async fn debit(&self, user_id: i64, price: Decimal) -> Result<DebitOutcome, StorageError> {
        let outcome = self.store.atomic_debit(user_id, price).await?;
        match outcome {
            DebitOutcome::Applied => info!(user_id, %price, "Balance debited"),
            DebitOutcome::NotFound => warn!(user_id, "Debit skipped: no balance account"),
            DebitOutcome::Insufficient => warn!(user_id, %price, "Debit rejected: insufficient balance"),
        }
        Ok(outcome)
    }
}
