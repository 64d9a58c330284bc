use super::ledger::EscrowWallet;
use super::pin_guard::PinGuard;
use super::refund::RefundOrchestrator;
use super::settlement::{CreateTransactionRequest, SettlementOrchestrator};
use super::step_up::{Scope, StepUpIssuer};
use super::unit_of_work::Store;
use crate::clock::SharedClock;
use crate::config::SettlementConfig;
use crate::domain::money::Amount;
use crate::domain::order::{Order, OrderStatus};
use crate::domain::ports::{IdentityProviderBox, KvBackendBox, PaymentGatewayBox};
use crate::domain::refund::Refund;
use crate::domain::transaction::{PaymentCallback, Transaction};
use crate::domain::wallet::{WalletHistory, WalletSummary};
use crate::error::{Result, SettlementError};
use chrono::Duration;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// How a user proves who they are before changing their wallet PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinChangeProof {
    Password(String),
    /// A code from [`SettlementEngine::send_change_pin_otp`] and the token it came with.
    Otp { token: String, code: String },
}

/// The main entry point of the wallet ledger and settlement core.
///
/// `SettlementEngine` owns the storage, the escrow wallet reference and the collaborators,
/// and exposes every operation the HTTP layer calls. Each operation runs in its own atomic
/// unit of work, so the engine can be shared across tasks.
pub struct SettlementEngine {
    store: Store,
    escrow: EscrowWallet,
    pins: PinGuard,
    step_up: Arc<StepUpIssuer>,
    settlement: SettlementOrchestrator,
    refunds: RefundOrchestrator,
    identity: IdentityProviderBox,
    gateway: PaymentGatewayBox,
}

impl SettlementEngine {
    /// Builds the engine and resolves the escrow wallet once.
    pub async fn open(
        config: &SettlementConfig,
        backend: KvBackendBox,
        identity: IdentityProviderBox,
        gateway: PaymentGatewayBox,
        clock: SharedClock,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SettlementError::Validation(e.to_string()))?;

        let store = Store::new(backend);
        let escrow =
            EscrowWallet::resolve(&store, config.settlement.escrow_owner_id, clock.now()).await?;
        let step_up = Arc::new(StepUpIssuer::new(&config.jwt, clock.clone()));
        let pins = PinGuard::new(&config.pin, clock.clone())?;
        let settlement = SettlementOrchestrator::new(
            store.clone(),
            escrow,
            step_up.clone(),
            clock.clone(),
            Duration::minutes(config.settlement.transaction_expiry_minutes),
        );
        let refunds = RefundOrchestrator::new(store.clone(), escrow, clock);

        tracing::info!(escrow_wallet = %escrow.wallet_id, "settlement engine ready");
        Ok(Self {
            store,
            escrow,
            pins,
            step_up,
            settlement,
            refunds,
            identity,
            gateway,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn escrow(&self) -> EscrowWallet {
        self.escrow
    }

    async fn wallet_id_of(&self, user_id: Uuid) -> Result<Uuid> {
        self.store
            .begin()
            .wallet_id_of_user(user_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("wallet", user_id))
    }

    // Wallet and PIN

    pub async fn activate_wallet(&self, user_id: Uuid, pin: &str) -> Result<WalletSummary> {
        let wallet = self.pins.activate(&self.store, user_id, pin).await?;
        Ok(WalletSummary::from(&wallet))
    }

    /// Verifies the PIN and issues a level1 token for paying with the wallet.
    pub async fn wallet_step_up(&self, user_id: Uuid, pin: &str) -> Result<String> {
        let wallet_id = self.wallet_id_of(user_id).await?;
        self.pins.verify(&self.store, wallet_id, pin).await?;
        self.step_up.issue(user_id, Scope::Level1)
    }

    /// Sends a one-time code to the user's contact address. Returns the token to present with
    /// the code.
    pub async fn send_change_pin_otp(&self, user_id: Uuid) -> Result<String> {
        let address = self
            .identity
            .contact_address(user_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("contact address", user_id))?;
        self.identity.send_otp(user_id, &address).await
    }

    /// Re-verifies the user and issues a level2 token for changing the PIN.
    pub async fn change_wallet_pin_step_up(
        &self,
        user_id: Uuid,
        proof: PinChangeProof,
    ) -> Result<String> {
        self.wallet_id_of(user_id).await?;
        let verified = match &proof {
            PinChangeProof::Password(password) => {
                self.identity.verify_password(user_id, password).await?
            }
            PinChangeProof::Otp { token, code } => {
                self.identity.verify_otp(user_id, token, code).await?
            }
        };
        if !verified {
            tracing::warn!(%user_id, "PIN change re-authentication failed");
            return Err(SettlementError::Authorization(
                "re-authentication failed".into(),
            ));
        }
        self.step_up.issue(user_id, Scope::Level2)
    }

    pub async fn change_wallet_pin(&self, token: &str, user_id: Uuid, new_pin: &str) -> Result<()> {
        let claims = self.step_up.consume(&self.store, token, Scope::Level2).await?;
        if claims.id != user_id {
            return Err(SettlementError::Authorization(
                "step-up token was issued to another user".into(),
            ));
        }
        let wallet_id = self.wallet_id_of(user_id).await?;
        self.pins.change_pin(&self.store, wallet_id, new_pin).await
    }

    pub async fn get_wallet(&self, user_id: Uuid) -> Result<WalletSummary> {
        let wallet_id = self.wallet_id_of(user_id).await?;
        let wallet = self.store.begin().wallet(wallet_id).await?;
        Ok(WalletSummary::from(&wallet))
    }

    pub async fn get_wallet_history(&self, user_id: Uuid) -> Result<Vec<WalletHistory>> {
        let wallet_id = self.wallet_id_of(user_id).await?;
        self.store.begin().wallet_history(wallet_id).await
    }

    /// Every wallet, escrow included, ordered by owner.
    pub async fn wallets(&self) -> Result<Vec<WalletSummary>> {
        let mut wallets: Vec<WalletSummary> = self
            .store
            .begin()
            .all_wallets()
            .await?
            .iter()
            .map(WalletSummary::from)
            .collect();
        wallets.sort_by_key(|wallet| wallet.user_id);
        Ok(wallets)
    }

    // Transactions and orders

    pub async fn create_transaction(
        &self,
        user_id: Uuid,
        request: CreateTransactionRequest,
    ) -> Result<(Transaction, Vec<Order>)> {
        self.settlement.create_transaction(user_id, request).await
    }

    pub async fn top_up_wallet(
        &self,
        user_id: Uuid,
        amount: Decimal,
        card_number: String,
    ) -> Result<Transaction> {
        let amount = Amount::new(amount)?;
        self.settlement
            .create_top_up(user_id, amount, card_number)
            .await
    }

    /// Asks the gateway for the URL the payer is sent to.
    pub async fn create_gateway_payment(&self, transaction_id: Uuid) -> Result<String> {
        let payment = self.settlement.gateway_payment(transaction_id).await?;
        self.gateway.create_payment(payment).await
    }

    pub async fn update_transaction(&self, callback: PaymentCallback) -> Result<Transaction> {
        self.settlement.update_transaction(callback).await
    }

    pub async fn update_wallet_transaction(
        &self,
        callback: PaymentCallback,
        token: &str,
    ) -> Result<Transaction> {
        self.settlement
            .update_wallet_transaction(callback, token)
            .await
    }

    pub async fn cancel_unpaid_orders(&self, transaction_id: Uuid) -> Result<Vec<Order>> {
        self.settlement.cancel_unpaid_orders(transaction_id).await
    }

    pub async fn advance_order_status(&self, order_id: Uuid, next: OrderStatus) -> Result<Order> {
        self.settlement.advance_order_status(order_id, next).await
    }

    pub async fn transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.store.begin().transaction(transaction_id).await
    }

    pub async fn orders_of_transaction(&self, transaction_id: Uuid) -> Result<Vec<Order>> {
        let uow = self.store.begin();
        let mut orders = Vec::new();
        for id in uow.order_ids_of_transaction(transaction_id).await? {
            orders.push(uow.order(id).await?);
        }
        Ok(orders)
    }

    // Refunds

    pub async fn create_refund(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        is_seller_refund: bool,
    ) -> Result<Refund> {
        self.refunds
            .create_refund(user_id, order_id, is_seller_refund)
            .await
    }

    pub async fn reject_refund(&self, refund_id: Uuid) -> Result<Refund> {
        self.refunds.reject_refund(refund_id).await
    }

    pub async fn refund_order(&self, refund_id: Uuid) -> Result<Refund> {
        self.refunds.refund_order(refund_id).await
    }
}
