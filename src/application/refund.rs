use super::ledger::{self, EscrowWallet};
use super::unit_of_work::Store;
use crate::clock::SharedClock;
use crate::domain::money::Amount;
use crate::domain::order::OrderStatus;
use crate::domain::refund::Refund;
use crate::error::{Result, SettlementError};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opens, rejects and settles refunds.
///
/// Settling a refund returns the order's money from escrow to the buyer's wallet, restocks
/// its items and closes both the refund and the order, in one unit of work. Locks are taken
/// refund, order, wallets, product details.
pub struct RefundOrchestrator {
    store: Store,
    escrow: EscrowWallet,
    clock: SharedClock,
}

impl RefundOrchestrator {
    pub fn new(store: Store, escrow: EscrowWallet, clock: SharedClock) -> Self {
        Self {
            store,
            escrow,
            clock,
        }
    }

    /// Disputes a paid, unfinished order on behalf of its buyer. One refund per order.
    #[tracing::instrument(skip(self))]
    pub async fn create_refund(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        is_seller_refund: bool,
    ) -> Result<Refund> {
        let now = self.clock.now();
        let mut uow = self.store.begin();
        let order = uow.lock_order(order_id).await?;

        if order.user_id != user_id {
            return Err(SettlementError::Authorization(format!(
                "order {order_id} does not belong to the user"
            )));
        }
        if !order.status.is_refundable() {
            return Err(SettlementError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Refunded,
            });
        }
        if uow.refund_of_order(order_id).await?.is_some() {
            return Err(SettlementError::RefundExists(order_id));
        }

        let refund = Refund::new(order_id, is_seller_refund, now);
        uow.insert_refund(&refund)?;
        uow.commit().await?;

        tracing::info!(refund_id = %refund.id, "refund requested");
        Ok(refund)
    }

    #[tracing::instrument(skip(self))]
    pub async fn reject_refund(&self, refund_id: Uuid) -> Result<Refund> {
        let mut uow = self.store.begin();
        let mut refund = uow.lock_refund(refund_id).await?;
        refund.ensure_open()?;

        refund.rejected_at = Some(self.clock.now());
        uow.put_refund(&refund)?;
        uow.commit().await?;

        tracing::info!("refund rejected");
        Ok(refund)
    }

    /// Settles a refund. Either every effect lands or none does.
    #[tracing::instrument(skip(self))]
    pub async fn refund_order(&self, refund_id: Uuid) -> Result<Refund> {
        let now = self.clock.now();
        let mut uow = self.store.begin();

        let mut refund = uow.lock_refund(refund_id).await?;
        if let Err(err) = refund.ensure_open() {
            tracing::warn!(%err, "refund is closed");
            return Err(err);
        }

        let mut order = uow.lock_order(refund.order_id).await?;
        order.advance(OrderStatus::Refunded, now)?;

        let mut total_reduce = order.total_price;
        if refund.is_seller_refund {
            total_reduce += order.delivery_fee;
        }
        let buyer_wallet = uow
            .wallet_id_of_user(order.user_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("wallet", order.user_id))?;
        if let Ok(amount) = Amount::new(total_reduce) {
            ledger::transfer(
                &mut uow,
                self.escrow.wallet_id,
                buyer_wallet,
                amount,
                Some(order.transaction_id),
                &format!("Refund order {}", order.id),
                now,
            )
            .await?;
        }

        let mut quantities: BTreeMap<Uuid, u32> = BTreeMap::new();
        for item in uow.order_items(order.id).await? {
            let quantity = quantities.entry(item.product_detail_id).or_default();
            *quantity = quantity.saturating_add(item.quantity);
        }
        for (id, quantity) in quantities {
            let mut detail = uow.lock_product_detail(id).await?;
            detail.restock(quantity)?;
            uow.put_product_detail(&detail)?;
        }

        refund.refunded_at = Some(now);
        uow.put_refund(&refund)?;
        uow.put_order(&order)?;
        uow.commit().await?;

        tracing::info!(order_id = %order.id, amount = %total_reduce, "refund settled");
        Ok(refund)
    }
}
