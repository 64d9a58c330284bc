use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Set when the seller is at fault; the delivery fee is then returned as well.
    pub is_seller_refund: bool,
    pub created_at: DateTime<Utc>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Refund {
    pub fn new(order_id: Uuid, is_seller_refund: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            is_seller_refund,
            created_at: now,
            rejected_at: None,
            refunded_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.rejected_at.is_none() && self.refunded_at.is_none()
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.rejected_at.is_some() {
            return Err(SettlementError::RefundRejected(self.id));
        }
        if self.refunded_at.is_some() {
            return Err(SettlementError::RefundAlreadyFinished(self.id));
        }
        Ok(())
    }
}
