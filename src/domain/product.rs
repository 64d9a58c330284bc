use crate::error::{Result, SettlementError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A purchasable variant of a product, with its own price and stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDetail {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub price: Decimal,
    pub stock: u32,
    pub weight: Decimal,
}

impl ProductDetail {
    pub fn reserve(&mut self, quantity: u32) -> Result<()> {
        if quantity > self.stock {
            return Err(SettlementError::InsufficientStock {
                product_detail_id: self.id,
                available: self.stock,
                requested: quantity,
            });
        }
        self.stock -= quantity;
        Ok(())
    }

    pub fn restock(&mut self, quantity: u32) -> Result<()> {
        self.stock = self.stock.checked_add(quantity).ok_or_else(|| {
            SettlementError::Internal(format!("stock overflow on product detail {}", self.id))
        })?;
        Ok(())
    }
}
