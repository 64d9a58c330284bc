use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::order::OrderStatus;

pub type Result<T> = std::result::Result<T, SettlementError>;

/// Status-code category an outer transport maps each error to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    BusinessRule,
    Locked,
    Authorization,
    Transient,
    Internal,
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("wallet already activated for user {0}")]
    AlreadyActivated(Uuid),

    #[error("invalid order status transition from {from:?} to {to:?}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("refund {0} was rejected")]
    RefundRejected(Uuid),

    #[error("refund {0} is already finished")]
    RefundAlreadyFinished(Uuid),

    #[error("order {0} already has a refund")]
    RefundExists(Uuid),

    #[error("order {0} has a refund waiting to be settled")]
    RefundPending(Uuid),

    #[error("transaction {0} expired before payment")]
    TransactionExpired(Uuid),

    #[error("insufficient balance in wallet {wallet_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        wallet_id: Uuid,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("insufficient stock for product detail {product_detail_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_detail_id: Uuid,
        available: u32,
        requested: u32,
    },

    #[error("wallet is locked until {until}")]
    PinLocked { until: DateTime<Utc> },

    #[error("wallet PIN does not match, {remaining} attempt(s) left")]
    PinMismatch { remaining: u32 },

    #[error("voucher {0} is not active")]
    VoucherNotActive(String),

    #[error("voucher {0} has expired")]
    VoucherExpired(String),

    #[error("voucher {0} has no quota left")]
    VoucherQuotaExceeded(String),

    #[error("subtotal {subtotal} is below the voucher minimum {minimum}")]
    MinimumNotMet { subtotal: Decimal, minimum: Decimal },

    #[error("unauthorized: {0}")]
    Authorization(String),

    #[error("storage failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::MinimumNotMet { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyActivated(_)
            | Self::InvalidTransition { .. }
            | Self::RefundRejected(_)
            | Self::RefundAlreadyFinished(_)
            | Self::RefundExists(_)
            | Self::RefundPending(_)
            | Self::TransactionExpired(_) => ErrorKind::Conflict,
            Self::InsufficientBalance { .. }
            | Self::InsufficientStock { .. }
            | Self::VoucherNotActive(_)
            | Self::VoucherExpired(_)
            | Self::VoucherQuotaExceeded(_) => ErrorKind::BusinessRule,
            Self::PinLocked { .. } => ErrorKind::Locked,
            Self::PinMismatch { .. } | Self::Authorization(_) => ErrorKind::Authorization,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether repeating the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Locked)
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("row encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_kinds_are_distinguishable() {
        assert_eq!(
            SettlementError::RefundAlreadyFinished(Uuid::nil()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            SettlementError::InsufficientBalance {
                wallet_id: Uuid::nil(),
                balance: dec!(1),
                requested: dec!(2),
            }
            .kind(),
            ErrorKind::BusinessRule
        );
        assert_eq!(
            SettlementError::not_found("wallet", Uuid::nil()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SettlementError::Transient("io".into()).is_retryable());
        assert!(SettlementError::PinLocked { until: Utc::now() }.is_retryable());
        assert!(!SettlementError::Validation("bad".into()).is_retryable());
    }
}
