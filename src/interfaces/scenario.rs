//! Replayable scenarios for the command-line driver.
//!
//! A scenario is a JSON document with a `seed` (wallets, product details, vouchers) and a
//! list of `commands`, each tagged by `op`. Entities are referred to by free-form labels; the
//! first time a label is used for a user, shop or courier it gets a fresh id, while created
//! transactions, refunds and step-up tokens are stored under the label the command gives them.

use crate::application::engine::{PinChangeProof, SettlementEngine};
use crate::application::settlement::{CreateTransactionRequest, ItemRequest, ShopOrderRequest};
use crate::clock::{Clock, ManualClock};
use crate::domain::money::Balance;
use crate::domain::order::OrderStatus;
use crate::domain::product::ProductDetail;
use crate::domain::transaction::{PaymentCallback, PaymentStatus};
use crate::domain::voucher::Voucher;
use crate::domain::wallet::Party;
use crate::error::{Result, SettlementError};
use crate::infrastructure::in_memory::InMemoryIdentity;
use crate::interfaces::csv::history_writer::HistoryRecord;
use crate::interfaces::csv::wallet_writer::WalletRecord;
use chrono::Duration;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use uuid::Uuid;

/// Label under which the escrow wallet's owner is known.
pub const ESCROW_LABEL: &str = "marketplace";

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub seed: Seed,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Scenario {
    pub fn from_reader<R: Read>(source: R) -> Result<Self> {
        serde_json::from_reader(source)
            .map_err(|e| SettlementError::Validation(format!("invalid scenario: {e}")))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub escrow_balance: Decimal,
    #[serde(default)]
    pub wallets: Vec<SeedWallet>,
    #[serde(default)]
    pub products: Vec<SeedProduct>,
    #[serde(default)]
    pub vouchers: Vec<SeedVoucher>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedWallet {
    pub user: String,
    pub pin: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedProduct {
    pub label: String,
    pub shop: String,
    pub price: Decimal,
    pub stock: u32,
    #[serde(default)]
    pub weight: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedVoucher {
    pub label: String,
    /// Absent for marketplace vouchers.
    #[serde(default)]
    pub shop: Option<String>,
    pub quota: u32,
    #[serde(default)]
    pub discount_percentage: Option<Decimal>,
    #[serde(default)]
    pub discount_fix_price: Option<Decimal>,
    #[serde(default)]
    pub min_product_price: Decimal,
    #[serde(default)]
    pub max_discount_price: Option<Decimal>,
    #[serde(default = "default_days_valid")]
    pub days_valid: i64,
}

fn default_days_valid() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioItem {
    pub product: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioOrder {
    pub shop: String,
    #[serde(default = "default_courier")]
    pub courier: String,
    #[serde(default)]
    pub delivery_fee: Decimal,
    #[serde(default)]
    pub voucher: Option<String>,
    pub items: Vec<ScenarioItem>,
}

fn default_courier() -> String {
    "courier".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    ActivateWallet {
        user: String,
        pin: String,
    },
    WalletStepUp {
        user: String,
        pin: String,
        label: String,
    },
    /// Re-authenticates with `password`, or with an emailed OTP when no password is given.
    ChangePin {
        user: String,
        new_pin: String,
        #[serde(default)]
        password: Option<String>,
    },
    CreateTransaction {
        user: String,
        label: String,
        #[serde(default)]
        wallet: bool,
        #[serde(default)]
        card_number: Option<String>,
        #[serde(default)]
        voucher: Option<String>,
        orders: Vec<ScenarioOrder>,
    },
    TopUp {
        user: String,
        amount: Decimal,
        card_number: String,
        label: String,
    },
    GatewayPayment {
        transaction: String,
    },
    GatewayCallback {
        transaction: String,
        status: PaymentStatus,
    },
    WalletCallback {
        transaction: String,
        token: String,
        status: PaymentStatus,
    },
    CancelUnpaid {
        transaction: String,
    },
    AdvanceOrder {
        transaction: String,
        shop: String,
        status: OrderStatus,
    },
    CreateRefund {
        user: String,
        transaction: String,
        shop: String,
        #[serde(default)]
        seller_refund: bool,
        label: String,
    },
    RejectRefund {
        refund: String,
    },
    RefundOrder {
        refund: String,
    },
    AdvanceClock {
        minutes: i64,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ActivateWallet { .. } => "activate_wallet",
            Command::WalletStepUp { .. } => "wallet_step_up",
            Command::ChangePin { .. } => "change_pin",
            Command::CreateTransaction { .. } => "create_transaction",
            Command::TopUp { .. } => "top_up",
            Command::GatewayPayment { .. } => "gateway_payment",
            Command::GatewayCallback { .. } => "gateway_callback",
            Command::WalletCallback { .. } => "wallet_callback",
            Command::CancelUnpaid { .. } => "cancel_unpaid",
            Command::AdvanceOrder { .. } => "advance_order",
            Command::CreateRefund { .. } => "create_refund",
            Command::RejectRefund { .. } => "reject_refund",
            Command::RefundOrder { .. } => "refund_order",
            Command::AdvanceClock { .. } => "advance_clock",
        }
    }
}

/// Drives an engine through a scenario.
pub struct ScenarioRunner<'a> {
    engine: &'a SettlementEngine,
    identity: InMemoryIdentity,
    clock: Arc<ManualClock>,
    labels: HashMap<String, Uuid>,
    tokens: HashMap<String, String>,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        engine: &'a SettlementEngine,
        identity: InMemoryIdentity,
        clock: Arc<ManualClock>,
    ) -> Self {
        let mut labels = HashMap::new();
        labels.insert(ESCROW_LABEL.to_string(), engine.escrow().owner_id);
        Self {
            engine,
            identity,
            clock,
            labels,
            tokens: HashMap::new(),
        }
    }

    /// Id behind `label`, minted on first use.
    fn id(&mut self, label: &str) -> Uuid {
        *self
            .labels
            .entry(label.to_string())
            .or_insert_with(Uuid::new_v4)
    }

    /// Id behind a label some earlier seed entry or command must have created.
    fn known(&self, entity: &'static str, label: &str) -> Result<Uuid> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| SettlementError::not_found(entity, label))
    }

    fn label_of(&self, id: Uuid) -> String {
        self.labels
            .iter()
            .find(|(_, known)| **known == id)
            .map(|(label, _)| label.clone())
            .unwrap_or_else(|| id.to_string())
    }

    async fn order_of(&self, transaction: &str, shop: &str) -> Result<Uuid> {
        let transaction_id = self.known("transaction", transaction)?;
        let shop_id = self.known("shop", shop)?;
        self.engine
            .orders_of_transaction(transaction_id)
            .await?
            .into_iter()
            .find(|order| order.shop_id == shop_id)
            .map(|order| order.id)
            .ok_or_else(|| SettlementError::not_found("order", format!("{transaction}/{shop}")))
    }

    pub async fn seed(&mut self, seed: &Seed) -> Result<()> {
        let now = self.clock.now();

        for wallet in &seed.wallets {
            let user_id = self.id(&wallet.user);
            if let Some(password) = &wallet.password {
                self.identity
                    .register(user_id, password, wallet.email.clone())
                    .await?;
            }
            let summary = self.engine.activate_wallet(user_id, &wallet.pin).await?;
            if wallet.balance > Decimal::ZERO {
                self.set_balance(summary.id, wallet.balance).await?;
            }
        }
        if seed.escrow_balance > Decimal::ZERO {
            self.set_balance(self.engine.escrow().wallet_id, seed.escrow_balance)
                .await?;
        }

        let mut uow = self.engine.store().begin();
        for product in &seed.products {
            let detail = ProductDetail {
                id: self.id(&product.label),
                shop_id: self.id(&product.shop),
                price: product.price,
                stock: product.stock,
                weight: product.weight,
            };
            uow.insert_product_detail(&detail)?;
        }
        for voucher in &seed.vouchers {
            let record = Voucher {
                id: self.id(&voucher.label),
                shop_id: voucher.shop.as_deref().map(|shop| self.id(shop)),
                code: voucher.label.clone(),
                quota: voucher.quota,
                actived_date: now,
                expired_date: now + Duration::days(voucher.days_valid),
                discount_percentage: voucher.discount_percentage,
                discount_fix_price: voucher.discount_fix_price,
                min_product_price: voucher.min_product_price,
                max_discount_price: voucher.max_discount_price,
            };
            uow.insert_voucher(&record)?;
        }
        uow.commit().await?;

        tracing::info!(
            wallets = seed.wallets.len(),
            products = seed.products.len(),
            vouchers = seed.vouchers.len(),
            "scenario seeded"
        );
        Ok(())
    }

    async fn set_balance(&self, wallet_id: Uuid, balance: Decimal) -> Result<()> {
        let mut uow = self.engine.store().begin();
        let mut wallet = uow.lock_wallet(wallet_id).await?;
        wallet.balance = Balance::new(balance)?;
        uow.put_wallet(&wallet)?;
        uow.commit().await
    }

    pub async fn run(&mut self, command: Command) -> Result<()> {
        match command {
            Command::ActivateWallet { user, pin } => {
                let user_id = self.id(&user);
                self.engine.activate_wallet(user_id, &pin).await?;
            }
            Command::WalletStepUp { user, pin, label } => {
                let user_id = self.known("user", &user)?;
                let token = self.engine.wallet_step_up(user_id, &pin).await?;
                self.tokens.insert(label, token);
            }
            Command::ChangePin {
                user,
                new_pin,
                password,
            } => {
                let user_id = self.known("user", &user)?;
                let proof = match password {
                    Some(password) => PinChangeProof::Password(password),
                    None => {
                        let token = self.engine.send_change_pin_otp(user_id).await?;
                        let code = self.identity.pending_code(&token).await.unwrap_or_default();
                        PinChangeProof::Otp { token, code }
                    }
                };
                let token = self.engine.change_wallet_pin_step_up(user_id, proof).await?;
                self.engine
                    .change_wallet_pin(&token, user_id, &new_pin)
                    .await?;
            }
            Command::CreateTransaction {
                user,
                label,
                wallet,
                card_number,
                voucher,
                orders,
            } => {
                let user_id = self.known("user", &user)?;
                let wallet_id = if wallet {
                    Some(self.engine.get_wallet(user_id).await?.id)
                } else {
                    None
                };
                let voucher_marketplace_id =
                    voucher.map(|v| self.known("voucher", &v)).transpose()?;
                let mut shop_orders = Vec::with_capacity(orders.len());
                for order in orders {
                    let items = order
                        .items
                        .iter()
                        .map(|item| {
                            Ok(ItemRequest {
                                product_detail_id: self.known("product detail", &item.product)?,
                                quantity: item.quantity,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    shop_orders.push(ShopOrderRequest {
                        shop_id: self.known("shop", &order.shop)?,
                        courier_id: self.id(&order.courier),
                        delivery_fee: order.delivery_fee,
                        voucher_shop_id: order
                            .voucher
                            .map(|v| self.known("voucher", &v))
                            .transpose()?,
                        items,
                    });
                }

                let (transaction, _) = self
                    .engine
                    .create_transaction(
                        user_id,
                        CreateTransactionRequest {
                            wallet_id,
                            card_number,
                            voucher_marketplace_id,
                            orders: shop_orders,
                        },
                    )
                    .await?;
                self.labels.insert(label, transaction.id);
            }
            Command::TopUp {
                user,
                amount,
                card_number,
                label,
            } => {
                let user_id = self.known("user", &user)?;
                let transaction = self
                    .engine
                    .top_up_wallet(user_id, amount, card_number)
                    .await?;
                self.labels.insert(label, transaction.id);
            }
            Command::GatewayPayment { transaction } => {
                let url = self
                    .engine
                    .create_gateway_payment(self.known("transaction", &transaction)?)
                    .await?;
                tracing::info!(%transaction, %url, "payment redirect created");
            }
            Command::GatewayCallback {
                transaction,
                status,
            } => {
                let transaction_id = self.known("transaction", &transaction)?;
                self.engine
                    .update_transaction(PaymentCallback {
                        status,
                        transaction_id,
                    })
                    .await?;
            }
            Command::WalletCallback {
                transaction,
                token,
                status,
            } => {
                let transaction_id = self.known("transaction", &transaction)?;
                let token = self
                    .tokens
                    .get(&token)
                    .cloned()
                    .ok_or_else(|| SettlementError::not_found("step-up token", &token))?;
                self.engine
                    .update_wallet_transaction(
                        PaymentCallback {
                            status,
                            transaction_id,
                        },
                        &token,
                    )
                    .await?;
            }
            Command::CancelUnpaid { transaction } => {
                let transaction_id = self.known("transaction", &transaction)?;
                self.engine.cancel_unpaid_orders(transaction_id).await?;
            }
            Command::AdvanceOrder {
                transaction,
                shop,
                status,
            } => {
                let order_id = self.order_of(&transaction, &shop).await?;
                self.engine.advance_order_status(order_id, status).await?;
            }
            Command::CreateRefund {
                user,
                transaction,
                shop,
                seller_refund,
                label,
            } => {
                let user_id = self.known("user", &user)?;
                let order_id = self.order_of(&transaction, &shop).await?;
                let refund = self
                    .engine
                    .create_refund(user_id, order_id, seller_refund)
                    .await?;
                self.labels.insert(label, refund.id);
            }
            Command::RejectRefund { refund } => {
                self.engine
                    .reject_refund(self.known("refund", &refund)?)
                    .await?;
            }
            Command::RefundOrder { refund } => {
                self.engine
                    .refund_order(self.known("refund", &refund)?)
                    .await?;
            }
            Command::AdvanceClock { minutes } => {
                self.clock.advance(Duration::minutes(minutes));
            }
        }
        Ok(())
    }

    /// Final state of every wallet, labelled by owner.
    pub async fn wallet_records(&self) -> Result<Vec<WalletRecord>> {
        let now = self.clock.now();
        let mut records: Vec<WalletRecord> = self
            .engine
            .wallets()
            .await?
            .into_iter()
            .map(|wallet| WalletRecord {
                user: self.label_of(wallet.user_id),
                wallet: wallet.id,
                balance: wallet.balance.value().normalize(),
                failed_attempts: wallet.failed_attempts,
                locked: wallet.locked_until.is_some_and(|until| until > now),
            })
            .collect();
        records.sort_by(|a, b| a.user.cmp(&b.user));
        Ok(records)
    }

    /// Every ledger entry, grouped by wallet owner.
    pub async fn ledger_records(&self) -> Result<Vec<HistoryRecord>> {
        let uow = self.engine.store().begin();
        let mut records = Vec::new();
        for wallet in self.wallet_records().await? {
            for entry in uow.wallet_history(wallet.wallet).await? {
                let party = |party: &Party| match party {
                    Party::Wallet(id) => id.to_string(),
                    Party::External(reference) => reference.clone(),
                };
                records.push(HistoryRecord {
                    user: wallet.user.clone(),
                    wallet: entry.wallet_id,
                    transaction: entry.transaction_id,
                    from: party(&entry.from),
                    to: party(&entry.to),
                    amount: entry.signed_amount().normalize(),
                    description: entry.description,
                    created_at: entry.created_at,
                });
            }
        }
        Ok(records)
    }
}
