use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle. Stored as its numeric code (1..=9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OrderStatus {
    WaitingToPay = 1,
    WaitingForSeller = 2,
    Processed = 3,
    OnDelivery = 4,
    Delivered = 5,
    Received = 6,
    Completed = 7,
    Canceled = 8,
    Refunded = 9,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Refunded)
    }

    /// Paid for and not yet finished; the states a refund can start from.
    pub fn is_refundable(self) -> bool {
        matches!(
            self,
            Self::WaitingForSeller
                | Self::Processed
                | Self::OnDelivery
                | Self::Delivered
                | Self::Received
        )
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (WaitingToPay, WaitingForSeller | Canceled) => true,
            (WaitingForSeller, Processed)
            | (Processed, OnDelivery)
            | (OnDelivery, Delivered)
            | (Delivered, Received)
            | (Received, Completed) => true,
            (from, Refunded) => from.is_refundable(),
            _ => false,
        }
    }

    pub fn transition(self, next: OrderStatus) -> Result<OrderStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SettlementError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl TryFrom<u8> for OrderStatus {
    type Error = SettlementError;

    fn try_from(code: u8) -> Result<Self> {
        use OrderStatus::*;
        Ok(match code {
            1 => WaitingToPay,
            2 => WaitingForSeller,
            3 => Processed,
            4 => OnDelivery,
            5 => Delivered,
            6 => Received,
            7 => Completed,
            8 => Canceled,
            9 => Refunded,
            other => {
                return Err(SettlementError::Validation(format!(
                    "unknown order status {other}"
                )));
            }
        })
    }
}

impl From<OrderStatus> for u8 {
    fn from(status: OrderStatus) -> Self {
        status as u8
    }
}

/// One shop's share of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub shop_id: Uuid,
    pub user_id: Uuid,
    pub courier_id: Uuid,
    pub voucher_shop_id: Option<Uuid>,
    pub status: OrderStatus,
    /// Item total after the shop voucher; excludes the delivery fee.
    pub total_price: Decimal,
    pub delivery_fee: Decimal,
    pub resi_no: Option<String>,
    pub created_at: DateTime<Utc>,
    pub arrived_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn advance(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition(next)?;
        if next == OrderStatus::Delivered {
            self.arrived_at = Some(now);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: Uuid,
    pub product_detail_id: Uuid,
    pub quantity: u32,
    pub item_price: Decimal,
    pub total_price: Decimal,
}
