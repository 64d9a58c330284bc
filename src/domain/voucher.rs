//! Voucher definitions and the discount math applied to subtotals.

use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: Uuid,
    /// `None` for marketplace-wide vouchers.
    pub shop_id: Option<Uuid>,
    pub code: String,
    pub quota: u32,
    pub actived_date: DateTime<Utc>,
    pub expired_date: DateTime<Utc>,
    /// Percent off, e.g. `10` for 10%.
    pub discount_percentage: Option<Decimal>,
    pub discount_fix_price: Option<Decimal>,
    pub min_product_price: Decimal,
    /// Cap on a percentage discount. No cap when absent.
    pub max_discount_price: Option<Decimal>,
}

/// The discount a voucher grants, after resolving which field wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountRule {
    Percentage { percent: Decimal, cap: Option<Decimal> },
    Fixed(Decimal),
    None,
}

impl Voucher {
    /// A positive percentage takes precedence over a fixed price when both are set.
    pub fn rule(&self) -> DiscountRule {
        match (self.discount_percentage, self.discount_fix_price) {
            (Some(percent), _) if percent > Decimal::ZERO => DiscountRule::Percentage {
                percent,
                cap: self.max_discount_price,
            },
            (_, Some(fixed)) if fixed > Decimal::ZERO => DiscountRule::Fixed(fixed),
            _ => DiscountRule::None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.actived_date <= now && now <= self.expired_date
    }

    /// Discount granted on `subtotal`, never more than the subtotal itself.
    pub fn discount(&self, subtotal: Decimal, now: DateTime<Utc>) -> Result<Decimal> {
        if !self.is_active(now) {
            return Err(SettlementError::VoucherNotActive(self.code.clone()));
        }
        if subtotal < self.min_product_price {
            return Err(SettlementError::MinimumNotMet {
                subtotal,
                minimum: self.min_product_price,
            });
        }

        let discount = match self.rule() {
            DiscountRule::Percentage { percent, cap } => {
                let raw = (subtotal * percent / Decimal::ONE_HUNDRED)
                    .round_dp_with_strategy(2, RoundingStrategy::ToZero);
                cap.map_or(raw, |cap| raw.min(cap))
            }
            DiscountRule::Fixed(fixed) => fixed,
            DiscountRule::None => Decimal::ZERO,
        };
        Ok(discount.min(subtotal).max(Decimal::ZERO))
    }

    /// Price left to pay on `subtotal` once the voucher is applied.
    pub fn apply(&self, subtotal: Decimal, now: DateTime<Utc>) -> Result<Decimal> {
        Ok(subtotal - self.discount(subtotal, now)?)
    }

    /// Consumes one use. Window and quota are checked before anything changes.
    pub fn redeem(&mut self, now: DateTime<Utc>) -> Result<()> {
        if now > self.expired_date {
            return Err(SettlementError::VoucherExpired(self.code.clone()));
        }
        if now < self.actived_date {
            return Err(SettlementError::VoucherNotActive(self.code.clone()));
        }
        if self.quota == 0 {
            return Err(SettlementError::VoucherQuotaExceeded(self.code.clone()));
        }
        self.quota -= 1;
        Ok(())
    }

    /// Gives back a use taken by [`Voucher::redeem`].
    pub fn release(&mut self) {
        self.quota = self.quota.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn voucher(percent: Option<Decimal>, fixed: Option<Decimal>) -> Voucher {
        let now = Utc::now();
        Voucher {
            id: Uuid::new_v4(),
            shop_id: None,
            code: "HEMAT".into(),
            quota: 2,
            actived_date: now - Duration::days(1),
            expired_date: now + Duration::days(1),
            discount_percentage: percent,
            discount_fix_price: fixed,
            min_product_price: dec!(10000),
            max_discount_price: Some(dec!(15000)),
        }
    }

    #[test]
    fn test_percentage_discount() {
        let v = voucher(Some(dec!(10)), None);
        assert_eq!(v.apply(dec!(100000), Utc::now()).unwrap(), dec!(90000));
    }

    #[test]
    fn test_percentage_discount_is_capped() {
        let v = voucher(Some(dec!(50)), None);
        let subtotal = dec!(100000);
        let result = v.apply(subtotal, Utc::now()).unwrap();
        assert_eq!(result, dec!(85000));
        assert!(result >= subtotal - v.max_discount_price.unwrap());
    }

    #[test]
    fn test_percentage_without_cap() {
        let mut v = voucher(Some(dec!(50)), None);
        v.max_discount_price = None;
        assert_eq!(v.apply(dec!(100000), Utc::now()).unwrap(), dec!(50000));
    }

    #[test]
    fn test_fixed_discount_never_below_zero() {
        let mut v = voucher(None, Some(dec!(50000)));
        v.min_product_price = dec!(0);
        assert_eq!(v.apply(dec!(20000), Utc::now()).unwrap(), dec!(0));
        assert_eq!(v.apply(dec!(80000), Utc::now()).unwrap(), dec!(30000));
    }

    #[test]
    fn test_percentage_wins_when_both_are_set() {
        let v = voucher(Some(dec!(10)), Some(dec!(5000)));
        assert!(matches!(v.rule(), DiscountRule::Percentage { .. }));
        assert_eq!(v.apply(dec!(20000), Utc::now()).unwrap(), dec!(18000));
    }

    #[test]
    fn test_zero_percentage_falls_back_to_fixed() {
        let v = voucher(Some(dec!(0)), Some(dec!(5000)));
        assert_eq!(v.rule(), DiscountRule::Fixed(dec!(5000)));
    }

    #[test]
    fn test_minimum_not_met() {
        let v = voucher(Some(dec!(10)), None);
        assert!(matches!(
            v.apply(dec!(9999), Utc::now()),
            Err(SettlementError::MinimumNotMet { .. })
        ));
    }

    #[test]
    fn test_outside_window_is_not_active() {
        let v = voucher(Some(dec!(10)), None);
        let later = v.expired_date + Duration::seconds(1);
        assert!(matches!(
            v.apply(dec!(50000), later),
            Err(SettlementError::VoucherNotActive(_))
        ));
        let earlier = v.actived_date - Duration::seconds(1);
        assert!(matches!(
            v.apply(dec!(50000), earlier),
            Err(SettlementError::VoucherNotActive(_))
        ));
        assert!(v.apply(dec!(50000), v.expired_date).is_ok());
    }

    #[test]
    fn test_redeem_consumes_quota() {
        let mut v = voucher(Some(dec!(10)), None);
        let now = Utc::now();
        v.redeem(now).unwrap();
        v.redeem(now).unwrap();
        assert!(matches!(
            v.redeem(now),
            Err(SettlementError::VoucherQuotaExceeded(_))
        ));
        v.release();
        assert_eq!(v.quota, 1);
    }

    #[test]
    fn test_redeem_after_expiry() {
        let mut v = voucher(Some(dec!(10)), None);
        let later = v.expired_date + Duration::minutes(1);
        assert!(matches!(
            v.redeem(later),
            Err(SettlementError::VoucherExpired(_))
        ));
        assert_eq!(v.quota, 2);
    }
}
