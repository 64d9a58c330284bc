use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionKind {
    /// Pays for one or more orders.
    Purchase,
    /// Loads the given wallet from an external card.
    TopUp { wallet_id: Uuid },
}

/// How a transaction is paid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentMethod {
    Wallet(Uuid),
    Card(String),
}

/// A payment unit spanning one or more orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub voucher_marketplace_id: Option<Uuid>,
    pub wallet_id: Option<Uuid>,
    pub card_number: Option<String>,
    pub invoice: String,
    pub total_price: Decimal,
    pub paid_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub expired_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_terminal(&self) -> bool {
        self.paid_at.is_some() || self.canceled_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at <= now
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        match (&self.wallet_id, &self.card_number) {
            (Some(wallet_id), None) => Some(PaymentMethod::Wallet(*wallet_id)),
            (None, Some(card)) => Some(PaymentMethod::Card(card.clone())),
            _ => None,
        }
    }
}

pub fn invoice_for(id: Uuid, now: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!("INV/{}/{}", now.format("%Y%m%d"), simple[..8].to_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[serde(rename = "PAID", alias = "TXN_PAID")]
    Paid,
    #[serde(rename = "FAILED", alias = "TXN_FAILED")]
    Failed,
}

/// Inbound payment notification. May be delivered more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub status: PaymentStatus,
    pub transaction_id: Uuid,
}
