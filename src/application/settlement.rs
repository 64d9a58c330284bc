//! Transaction and order settlement.
//!
//! Creating a transaction reserves stock and voucher quota; a payment callback either settles
//! it (orders move on to the seller, funds land in escrow) or cancels it (reservations are
//! returned). Every operation runs in one unit of work and takes its row locks in the order
//! transaction, orders, wallets, product details, vouchers.

use super::ledger::{self, EscrowWallet};
use super::step_up::{Scope, StepUpIssuer};
use super::unit_of_work::{Store, UnitOfWork};
use crate::clock::SharedClock;
use crate::domain::money::Amount;
use crate::domain::order::{Order, OrderItem, OrderStatus};
use crate::domain::ports::GatewayPayment;
use crate::domain::product::ProductDetail;
use crate::domain::transaction::{
    PaymentCallback, PaymentMethod, PaymentStatus, Transaction, TransactionKind, invoice_for,
};
use crate::domain::voucher::Voucher;
use crate::domain::wallet::Party;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub product_detail_id: Uuid,
    pub quantity: u32,
}

/// The part of a checkout bought from one shop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopOrderRequest {
    pub shop_id: Uuid,
    pub courier_id: Uuid,
    #[serde(default)]
    pub delivery_fee: Decimal,
    #[serde(default)]
    pub voucher_shop_id: Option<Uuid>,
    pub items: Vec<ItemRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    #[serde(default)]
    pub wallet_id: Option<Uuid>,
    #[serde(default)]
    pub card_number: Option<String>,
    #[serde(default)]
    pub voucher_marketplace_id: Option<Uuid>,
    pub orders: Vec<ShopOrderRequest>,
}

impl CreateTransactionRequest {
    fn validate(&self) -> Result<PaymentMethod> {
        let method = match (&self.wallet_id, &self.card_number) {
            (Some(wallet_id), None) => PaymentMethod::Wallet(*wallet_id),
            (None, Some(card)) if !card.trim().is_empty() => PaymentMethod::Card(card.clone()),
            _ => {
                return Err(SettlementError::Validation(
                    "exactly one of wallet_id or card_number is required".into(),
                ));
            }
        };
        if self.orders.is_empty() {
            return Err(SettlementError::Validation("no orders requested".into()));
        }

        let mut shops = BTreeSet::new();
        for order in &self.orders {
            if !shops.insert(order.shop_id) {
                return Err(SettlementError::Validation(format!(
                    "shop {} appears in more than one order",
                    order.shop_id
                )));
            }
            if order.items.is_empty() {
                return Err(SettlementError::Validation(format!(
                    "order for shop {} has no items",
                    order.shop_id
                )));
            }
            if order.delivery_fee < Decimal::ZERO {
                return Err(SettlementError::Validation("delivery fee is negative".into()));
            }
            if order.items.iter().any(|item| item.quantity == 0) {
                return Err(SettlementError::Validation("item quantity must be positive".into()));
            }
        }
        Ok(method)
    }
}

pub struct SettlementOrchestrator {
    store: Store,
    escrow: EscrowWallet,
    step_up: Arc<StepUpIssuer>,
    clock: SharedClock,
    expiry: Duration,
}

async fn lock_orders(uow: &mut UnitOfWork, transaction_id: Uuid) -> Result<Vec<Order>> {
    let mut orders = Vec::new();
    for id in uow.order_ids_of_transaction(transaction_id).await? {
        orders.push(uow.lock_order(id).await?);
    }
    Ok(orders)
}

/// Moves every order of a freshly paid transaction on to the seller.
fn mark_orders_paid(uow: &mut UnitOfWork, orders: &mut [Order], now: DateTime<Utc>) -> Result<()> {
    for order in orders {
        order.advance(OrderStatus::WaitingForSeller, now)?;
        uow.put_order(order)?;
    }
    Ok(())
}

/// Gives back the stock and voucher quota a transaction reserved.
async fn release_reservations(
    uow: &mut UnitOfWork,
    transaction: &Transaction,
    orders: &[Order],
) -> Result<()> {
    let mut quantities: BTreeMap<Uuid, u32> = BTreeMap::new();
    for order in orders {
        for item in uow.order_items(order.id).await? {
            let quantity = quantities.entry(item.product_detail_id).or_default();
            *quantity = quantity.saturating_add(item.quantity);
        }
    }
    for (id, quantity) in quantities {
        let mut detail = uow.lock_product_detail(id).await?;
        detail.restock(quantity)?;
        uow.put_product_detail(&detail)?;
    }

    let vouchers: BTreeSet<Uuid> = orders
        .iter()
        .filter_map(|order| order.voucher_shop_id)
        .chain(transaction.voucher_marketplace_id)
        .collect();
    for id in vouchers {
        let mut voucher = uow.lock_voucher(id).await?;
        voucher.release();
        uow.put_voucher(&voucher)?;
    }
    Ok(())
}

impl SettlementOrchestrator {
    pub fn new(
        store: Store,
        escrow: EscrowWallet,
        step_up: Arc<StepUpIssuer>,
        clock: SharedClock,
        expiry: Duration,
    ) -> Self {
        Self {
            store,
            escrow,
            step_up,
            clock,
            expiry,
        }
    }

    /// Prices the request, reserves stock and voucher quota, and records the transaction with
    /// one order per shop, all WaitingToPay.
    #[tracing::instrument(skip(self, request))]
    pub async fn create_transaction(
        &self,
        user_id: Uuid,
        request: CreateTransactionRequest,
    ) -> Result<(Transaction, Vec<Order>)> {
        let method = request.validate()?;
        let now = self.clock.now();
        let mut uow = self.store.begin();

        if let PaymentMethod::Wallet(wallet_id) = &method {
            let wallet = uow.wallet(*wallet_id).await?;
            if wallet.user_id != user_id {
                return Err(SettlementError::Authorization(format!(
                    "wallet {wallet_id} does not belong to the user"
                )));
            }
            if !wallet.is_active(now) {
                return Err(SettlementError::Validation(format!(
                    "wallet {wallet_id} is not active"
                )));
            }
        }

        let product_ids: BTreeSet<Uuid> = request
            .orders
            .iter()
            .flat_map(|order| order.items.iter().map(|item| item.product_detail_id))
            .collect();
        let mut products: BTreeMap<Uuid, ProductDetail> = BTreeMap::new();
        for id in product_ids {
            products.insert(id, uow.lock_product_detail(id).await?);
        }

        let voucher_ids: BTreeSet<Uuid> = request
            .orders
            .iter()
            .filter_map(|order| order.voucher_shop_id)
            .chain(request.voucher_marketplace_id)
            .collect();
        let mut vouchers: BTreeMap<Uuid, Voucher> = BTreeMap::new();
        for id in voucher_ids {
            vouchers.insert(id, uow.lock_voucher(id).await?);
        }

        let transaction_id = Uuid::new_v4();
        let mut orders = Vec::with_capacity(request.orders.len());
        let mut orders_total = Decimal::ZERO;
        let mut delivery_total = Decimal::ZERO;

        for shop in &request.orders {
            let order_id = Uuid::new_v4();
            let mut items = Vec::with_capacity(shop.items.len());
            let mut subtotal = Decimal::ZERO;

            for item in &shop.items {
                let detail = products
                    .get_mut(&item.product_detail_id)
                    .ok_or_else(|| SettlementError::not_found("product detail", item.product_detail_id))?;
                if detail.shop_id != shop.shop_id {
                    return Err(SettlementError::Validation(format!(
                        "product detail {} is not sold by shop {}",
                        detail.id, shop.shop_id
                    )));
                }
                detail.reserve(item.quantity)?;

                let line_total = detail.price * Decimal::from(item.quantity);
                subtotal += line_total;
                items.push(OrderItem {
                    order_id,
                    product_detail_id: detail.id,
                    quantity: item.quantity,
                    item_price: detail.price,
                    total_price: line_total,
                });
            }

            let total_price = match shop.voucher_shop_id {
                Some(id) => {
                    let voucher = vouchers
                        .get_mut(&id)
                        .ok_or_else(|| SettlementError::not_found("voucher", id))?;
                    if voucher.shop_id != Some(shop.shop_id) {
                        return Err(SettlementError::Validation(format!(
                            "voucher {} is not valid for shop {}",
                            voucher.code, shop.shop_id
                        )));
                    }
                    voucher.redeem(now)?;
                    voucher.apply(subtotal, now)?
                }
                None => subtotal,
            };

            orders_total += total_price;
            delivery_total += shop.delivery_fee;
            orders.push((
                Order {
                    id: order_id,
                    transaction_id,
                    shop_id: shop.shop_id,
                    user_id,
                    courier_id: shop.courier_id,
                    voucher_shop_id: shop.voucher_shop_id,
                    status: OrderStatus::WaitingToPay,
                    total_price,
                    delivery_fee: shop.delivery_fee,
                    resi_no: None,
                    created_at: now,
                    arrived_at: None,
                },
                items,
            ));
        }

        let goods_total = match request.voucher_marketplace_id {
            Some(id) => {
                let voucher = vouchers
                    .get_mut(&id)
                    .ok_or_else(|| SettlementError::not_found("voucher", id))?;
                if voucher.shop_id.is_some() {
                    return Err(SettlementError::Validation(format!(
                        "voucher {} is a shop voucher",
                        voucher.code
                    )));
                }
                voucher.redeem(now)?;
                voucher.apply(orders_total, now)?
            }
            None => orders_total,
        };

        let (wallet_id, card_number) = match method {
            PaymentMethod::Wallet(wallet_id) => (Some(wallet_id), None),
            PaymentMethod::Card(card) => (None, Some(card)),
        };
        let transaction = Transaction {
            id: transaction_id,
            kind: TransactionKind::Purchase,
            voucher_marketplace_id: request.voucher_marketplace_id,
            wallet_id,
            card_number,
            invoice: invoice_for(transaction_id, now),
            total_price: goods_total + delivery_total,
            paid_at: None,
            canceled_at: None,
            expired_at: now + self.expiry,
        };

        uow.insert_transaction(&transaction)?;
        uow.insert_orders(transaction_id, &orders)?;
        for detail in products.values() {
            uow.put_product_detail(detail)?;
        }
        for voucher in vouchers.values() {
            uow.put_voucher(voucher)?;
        }
        uow.commit().await?;

        tracing::info!(
            transaction_id = %transaction.id,
            invoice = %transaction.invoice,
            total = %transaction.total_price,
            orders = orders.len(),
            "transaction created"
        );
        Ok((transaction, orders.into_iter().map(|(order, _)| order).collect()))
    }

    /// Records a card top-up of the user's wallet, settled by the gateway callback.
    #[tracing::instrument(skip(self, card_number))]
    pub async fn create_top_up(
        &self,
        user_id: Uuid,
        amount: Amount,
        card_number: String,
    ) -> Result<Transaction> {
        if card_number.trim().is_empty() {
            return Err(SettlementError::Validation("card_number is required".into()));
        }
        let now = self.clock.now();
        let mut uow = self.store.begin();

        let wallet_id = uow
            .wallet_id_of_user(user_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("wallet", user_id))?;
        if !uow.wallet(wallet_id).await?.is_active(now) {
            return Err(SettlementError::Validation(format!(
                "wallet {wallet_id} is not active"
            )));
        }

        let id = Uuid::new_v4();
        let transaction = Transaction {
            id,
            kind: TransactionKind::TopUp { wallet_id },
            voucher_marketplace_id: None,
            wallet_id: None,
            card_number: Some(card_number),
            invoice: invoice_for(id, now),
            total_price: amount.value(),
            paid_at: None,
            canceled_at: None,
            expired_at: now + self.expiry,
        };
        uow.insert_transaction(&transaction)?;
        uow.commit().await?;

        tracing::info!(transaction_id = %id, %amount, "top-up created");
        Ok(transaction)
    }

    /// What the gateway needs to start charging the card of an open transaction.
    pub async fn gateway_payment(&self, transaction_id: Uuid) -> Result<GatewayPayment> {
        let now = self.clock.now();
        let transaction = self.store.begin().transaction(transaction_id).await?;
        if transaction.is_terminal() {
            return Err(SettlementError::Validation(format!(
                "transaction {transaction_id} is already settled"
            )));
        }
        if transaction.is_expired(now) {
            return Err(SettlementError::TransactionExpired(transaction_id));
        }
        let Some(PaymentMethod::Card(card_number)) = transaction.payment_method() else {
            return Err(SettlementError::Validation(format!(
                "transaction {transaction_id} is not paid by card"
            )));
        };
        Ok(GatewayPayment {
            transaction_id,
            invoice: transaction.invoice,
            card_number,
            amount: transaction.total_price,
        })
    }

    /// Applies a payment-gateway callback. Repeated callbacks for a settled transaction are
    /// no-ops.
    #[tracing::instrument(skip(self, callback), fields(transaction_id = %callback.transaction_id))]
    pub async fn update_transaction(&self, callback: PaymentCallback) -> Result<Transaction> {
        let now = self.clock.now();
        let mut uow = self.store.begin();
        let mut transaction = uow.lock_transaction(callback.transaction_id).await?;

        if transaction.is_terminal() {
            tracing::debug!("transaction already settled, callback ignored");
            return Ok(transaction);
        }
        let Some(PaymentMethod::Card(card_number)) = transaction.payment_method() else {
            return Err(SettlementError::Validation(format!(
                "transaction {} is not paid by card",
                transaction.id
            )));
        };

        let mut orders = lock_orders(&mut uow, transaction.id).await?;
        match callback.status {
            PaymentStatus::Paid => {
                mark_orders_paid(&mut uow, &mut orders, now)?;
                let beneficiary = match transaction.kind {
                    TransactionKind::Purchase => self.escrow.wallet_id,
                    TransactionKind::TopUp { wallet_id } => wallet_id,
                };
                if let Ok(amount) = Amount::new(transaction.total_price) {
                    ledger::deposit(
                        &mut uow,
                        Party::External(card_number),
                        beneficiary,
                        amount,
                        Some(transaction.id),
                        &format!("Payment {}", transaction.invoice),
                        now,
                    )
                    .await?;
                }
                transaction.paid_at = Some(now);
            }
            PaymentStatus::Failed => {
                release_reservations(&mut uow, &transaction, &orders).await?;
                transaction.canceled_at = Some(now);
            }
        }

        uow.put_transaction(&transaction)?;
        uow.commit().await?;
        tracing::info!(status = ?callback.status, "transaction settled");
        Ok(transaction)
    }

    /// Applies a wallet-payment callback. Requires a level1 step-up token issued to the
    /// wallet's owner; the token is used up whatever the outcome.
    #[tracing::instrument(skip(self, callback, token), fields(transaction_id = %callback.transaction_id))]
    pub async fn update_wallet_transaction(
        &self,
        callback: PaymentCallback,
        token: &str,
    ) -> Result<Transaction> {
        let claims = self.step_up.consume(&self.store, token, Scope::Level1).await?;
        let now = self.clock.now();
        let mut uow = self.store.begin();
        let mut transaction = uow.lock_transaction(callback.transaction_id).await?;

        let Some(PaymentMethod::Wallet(wallet_id)) = transaction.payment_method() else {
            return Err(SettlementError::Validation(format!(
                "transaction {} is not paid by wallet",
                transaction.id
            )));
        };
        if uow.wallet(wallet_id).await?.user_id != claims.id {
            return Err(SettlementError::Authorization(
                "step-up token was issued to another user".into(),
            ));
        }
        if transaction.is_terminal() {
            tracing::debug!("transaction already settled, callback ignored");
            return Ok(transaction);
        }

        let mut orders = lock_orders(&mut uow, transaction.id).await?;
        match callback.status {
            PaymentStatus::Paid => {
                if transaction.is_expired(now) {
                    tracing::warn!(expired_at = %transaction.expired_at, "payment after expiry");
                    return Err(SettlementError::TransactionExpired(transaction.id));
                }
                mark_orders_paid(&mut uow, &mut orders, now)?;
                if let Ok(amount) = Amount::new(transaction.total_price) {
                    ledger::transfer(
                        &mut uow,
                        wallet_id,
                        self.escrow.wallet_id,
                        amount,
                        Some(transaction.id),
                        &format!("Payment {}", transaction.invoice),
                        now,
                    )
                    .await?;
                }
                transaction.paid_at = Some(now);
            }
            PaymentStatus::Failed => {
                release_reservations(&mut uow, &transaction, &orders).await?;
                transaction.canceled_at = Some(now);
            }
        }

        uow.put_transaction(&transaction)?;
        uow.commit().await?;
        tracing::info!(status = ?callback.status, "wallet transaction settled");
        Ok(transaction)
    }

    /// Expiry sweep: cancels an unpaid transaction once it is past its deadline and moves its
    /// waiting orders to Canceled. Returns the orders that were canceled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_unpaid_orders(&self, transaction_id: Uuid) -> Result<Vec<Order>> {
        let now = self.clock.now();
        let mut uow = self.store.begin();
        let mut transaction = uow.lock_transaction(transaction_id).await?;

        if transaction.paid_at.is_some() {
            tracing::debug!("transaction is paid, nothing to cancel");
            return Ok(Vec::new());
        }
        if transaction.canceled_at.is_none() && !transaction.is_expired(now) {
            return Err(SettlementError::Validation(format!(
                "transaction {transaction_id} has not expired yet"
            )));
        }

        let orders = lock_orders(&mut uow, transaction_id).await?;
        if transaction.canceled_at.is_none() {
            release_reservations(&mut uow, &transaction, &orders).await?;
            transaction.canceled_at = Some(now);
            uow.put_transaction(&transaction)?;
        }

        let mut canceled = Vec::new();
        for mut order in orders {
            if order.status == OrderStatus::WaitingToPay {
                order.advance(OrderStatus::Canceled, now)?;
                uow.put_order(&order)?;
                canceled.push(order);
            }
        }
        uow.commit().await?;

        tracing::info!(canceled = canceled.len(), "unpaid orders canceled");
        Ok(canceled)
    }

    /// Seller- and buyer-driven progress of a paid order.
    ///
    /// Payment, cancellation and refund have their own operations; asking for those states
    /// here is rejected. An order with an open refund stays where it is until the refund is
    /// settled or rejected.
    #[tracing::instrument(skip(self))]
    pub async fn advance_order_status(&self, order_id: Uuid, next: OrderStatus) -> Result<Order> {
        if matches!(
            next,
            OrderStatus::WaitingToPay
                | OrderStatus::WaitingForSeller
                | OrderStatus::Canceled
                | OrderStatus::Refunded
        ) {
            return Err(SettlementError::Validation(format!(
                "order status {next:?} cannot be set directly"
            )));
        }
        let now = self.clock.now();
        let mut uow = self.store.begin();
        let mut order = uow.lock_order(order_id).await?;
        // create_refund holds the same order lock, so no refund can open past this check
        if uow
            .refund_of_order(order_id)
            .await?
            .is_some_and(|refund| refund.is_open())
        {
            return Err(SettlementError::RefundPending(order_id));
        }
        order.advance(next, now)?;
        uow.put_order(&order)?;
        uow.commit().await?;

        tracing::info!(status = ?order.status, "order advanced");
        Ok(order)
    }
}
