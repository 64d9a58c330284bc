#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use settlement_engine::application::engine::SettlementEngine;
use settlement_engine::application::settlement::{
    CreateTransactionRequest, ItemRequest, ShopOrderRequest,
};
use settlement_engine::clock::ManualClock;
use settlement_engine::config::{PinPolicy, SettlementConfig};
use settlement_engine::domain::money::Balance;
use settlement_engine::domain::ports::{KvBackend, KvBackendBox, Mutation, Table};
use settlement_engine::domain::product::ProductDetail;
use settlement_engine::domain::transaction::{PaymentCallback, PaymentStatus, Transaction};
use settlement_engine::domain::voucher::Voucher;
use settlement_engine::error::{Result, SettlementError};
use settlement_engine::infrastructure::gateway::RedirectGateway;
use settlement_engine::infrastructure::in_memory::{InMemoryBackend, InMemoryIdentity};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub const PIN: &str = "123456";

pub struct Harness {
    pub engine: SettlementEngine,
    pub clock: Arc<ManualClock>,
    pub identity: InMemoryIdentity,
}

/// Defaults with a cheap Argon2 cost so PIN hashing does not dominate test time.
pub fn test_config() -> SettlementConfig {
    SettlementConfig {
        pin: PinPolicy {
            memory_kib: 8,
            iterations: 1,
            ..PinPolicy::default()
        },
        ..SettlementConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(Box::new(InMemoryBackend::new())).await
}

pub async fn harness_with(backend: KvBackendBox) -> Harness {
    let config = test_config();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ));
    let identity = InMemoryIdentity::new();
    let engine = SettlementEngine::open(
        &config,
        backend,
        Box::new(identity.clone()),
        Box::new(RedirectGateway::new(config.gateway.clone())),
        clock.clone(),
    )
    .await
    .unwrap();
    Harness {
        engine,
        clock,
        identity,
    }
}

impl Harness {
    pub async fn set_balance(&self, wallet_id: Uuid, balance: Decimal) {
        let mut uow = self.engine.store().begin();
        let mut wallet = uow.lock_wallet(wallet_id).await.unwrap();
        wallet.balance = Balance::new(balance).unwrap();
        uow.put_wallet(&wallet).unwrap();
        uow.commit().await.unwrap();
    }

    pub async fn balance(&self, wallet_id: Uuid) -> Decimal {
        self.engine
            .store()
            .begin()
            .wallet(wallet_id)
            .await
            .unwrap()
            .balance
            .value()
    }

    pub async fn escrow_balance(&self) -> Decimal {
        self.balance(self.engine.escrow().wallet_id).await
    }

    /// A fresh user with an activated wallet holding `balance`. Returns (user, wallet).
    pub async fn funded_wallet(&self, balance: Decimal) -> (Uuid, Uuid) {
        let user = Uuid::new_v4();
        let wallet = self.engine.activate_wallet(user, PIN).await.unwrap();
        if balance > Decimal::ZERO {
            self.set_balance(wallet.id, balance).await;
        }
        (user, wallet.id)
    }

    pub async fn fund_escrow(&self, balance: Decimal) {
        self.set_balance(self.engine.escrow().wallet_id, balance)
            .await;
    }

    pub async fn product(&self, shop_id: Uuid, price: Decimal, stock: u32) -> ProductDetail {
        let detail = ProductDetail {
            id: Uuid::new_v4(),
            shop_id,
            price,
            stock,
            weight: Decimal::ONE,
        };
        let mut uow = self.engine.store().begin();
        uow.insert_product_detail(&detail).unwrap();
        uow.commit().await.unwrap();
        detail
    }

    pub async fn stock(&self, product_detail_id: Uuid) -> u32 {
        self.engine
            .store()
            .begin()
            .product_detail(product_detail_id)
            .await
            .unwrap()
            .stock
    }

    pub async fn set_stock(&self, product_detail_id: Uuid, stock: u32) {
        let mut uow = self.engine.store().begin();
        let mut detail = uow.lock_product_detail(product_detail_id).await.unwrap();
        detail.stock = stock;
        uow.put_product_detail(&detail).unwrap();
        uow.commit().await.unwrap();
    }

    /// A voucher active for the next 30 days. `shop_id` of `None` makes it a marketplace
    /// voucher.
    pub async fn voucher(
        &self,
        shop_id: Option<Uuid>,
        quota: u32,
        percentage: Option<Decimal>,
        fixed: Option<Decimal>,
        min_product_price: Decimal,
        max_discount_price: Option<Decimal>,
    ) -> Voucher {
        let now = self.clock_now();
        let voucher = Voucher {
            id: Uuid::new_v4(),
            shop_id,
            code: format!("V{}", &Uuid::new_v4().simple().to_string()[..6]),
            quota,
            actived_date: now - Duration::days(1),
            expired_date: now + Duration::days(30),
            discount_percentage: percentage,
            discount_fix_price: fixed,
            min_product_price,
            max_discount_price,
        };
        let mut uow = self.engine.store().begin();
        uow.insert_voucher(&voucher).unwrap();
        uow.commit().await.unwrap();
        voucher
    }

    pub async fn quota(&self, voucher_id: Uuid) -> u32 {
        self.engine
            .store()
            .begin()
            .voucher(voucher_id)
            .await
            .unwrap()
            .quota
    }

    pub fn clock_now(&self) -> chrono::DateTime<Utc> {
        use settlement_engine::clock::Clock;
        self.clock.now()
    }

    /// Steps up with the PIN and pays `transaction_id` from the user's wallet.
    pub async fn pay_with_wallet(&self, user: Uuid, transaction_id: Uuid) -> Result<Transaction> {
        let token = self.engine.wallet_step_up(user, PIN).await?;
        self.engine
            .update_wallet_transaction(paid(transaction_id), &token)
            .await
    }
}

pub fn paid(transaction_id: Uuid) -> PaymentCallback {
    PaymentCallback {
        status: PaymentStatus::Paid,
        transaction_id,
    }
}

pub fn failed(transaction_id: Uuid) -> PaymentCallback {
    PaymentCallback {
        status: PaymentStatus::Failed,
        transaction_id,
    }
}

/// One order from one shop, with `(product, quantity)` lines.
pub fn shop_order(shop_id: Uuid, delivery_fee: Decimal, items: &[(Uuid, u32)]) -> ShopOrderRequest {
    ShopOrderRequest {
        shop_id,
        courier_id: Uuid::nil(),
        delivery_fee,
        voucher_shop_id: None,
        items: items
            .iter()
            .map(|(product_detail_id, quantity)| ItemRequest {
                product_detail_id: *product_detail_id,
                quantity: *quantity,
            })
            .collect(),
    }
}

pub fn wallet_request(wallet_id: Uuid, orders: Vec<ShopOrderRequest>) -> CreateTransactionRequest {
    CreateTransactionRequest {
        wallet_id: Some(wallet_id),
        orders,
        ..CreateTransactionRequest::default()
    }
}

pub fn card_request(orders: Vec<ShopOrderRequest>) -> CreateTransactionRequest {
    CreateTransactionRequest {
        card_number: Some("4111111111111111".into()),
        orders,
        ..CreateTransactionRequest::default()
    }
}

/// Backend whose writes can be switched to fail, as a dropped database connection would.
#[derive(Clone, Default)]
pub struct FlakyBackend {
    inner: InMemoryBackend,
    failing: Arc<AtomicBool>,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvBackend for FlakyBackend {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(table, key).await
    }

    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(table, prefix).await
    }

    async fn write_batch(&self, batch: Vec<Mutation>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SettlementError::Transient("connection reset".into()));
        }
        self.inner.write_batch(batch).await
    }
}
