use super::money::{Amount, Balance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A user's internal wallet.
///
/// Mutated only through the ledger writer (balance) and the PIN guard (PIN and lockout
/// state), both under the wallet's row lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Balance,
    /// Argon2 PHC string. `None` until the wallet is activated with a PIN.
    pub pin_hash: Option<String>,
    pub attempt_count: u32,
    pub attempt_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub active_date: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Wallet {
    pub fn new(user_id: Uuid, pin_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            balance: Balance::ZERO,
            pin_hash: Some(pin_hash),
            attempt_count: 0,
            attempt_at: None,
            locked_until: None,
            active_date: now,
            deleted_at: None,
            updated_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_deleted() && self.active_date <= now
    }

    /// The end of the current lockout window, if one is still running at `now`.
    pub fn lockout_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.locked_until.filter(|until| *until > now)
    }

    pub fn credit(&mut self, amount: Amount, now: DateTime<Utc>) {
        self.balance.credit(amount);
        self.updated_at = Some(now);
    }

    pub fn debit(&mut self, amount: Amount, now: DateTime<Utc>) -> bool {
        let debited = self.balance.debit(amount);
        if debited {
            self.updated_at = Some(now);
        }
        debited
    }
}

/// What callers outside the engine get to see of a wallet. Carries no PIN material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Balance,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub active_date: DateTime<Utc>,
}

impl From<&Wallet> for WalletSummary {
    fn from(wallet: &Wallet) -> Self {
        Self {
            id: wallet.id,
            user_id: wallet.user_id,
            balance: wallet.balance,
            failed_attempts: wallet.attempt_count,
            locked_until: wallet.locked_until,
            active_date: wallet.active_date,
        }
    }
}

/// One side of a fund movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Party {
    Wallet(Uuid),
    /// A funding source outside the ledger, e.g. a card charged by the payment gateway.
    External(String),
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Wallet(id) => write!(f, "{id}"),
            Party::External(reference) => write!(f, "{reference}"),
        }
    }
}

/// An immutable ledger entry recording one side of a movement on `wallet_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletHistory {
    pub id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub wallet_id: Uuid,
    pub from: Party,
    pub to: Party,
    pub amount: Amount,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl WalletHistory {
    /// Signed effect of this entry on its own wallet.
    pub fn signed_amount(&self) -> rust_decimal::Decimal {
        if self.from == Party::Wallet(self.wallet_id) {
            -self.amount.value()
        } else {
            self.amount.value()
        }
    }
}
