use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Tables rows live in.
///
/// Declaration order is the global lock order: a unit of work may only lock rows in
/// ascending `(table, key)` order. Index and history tables are never locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Refunds,
    Transactions,
    Orders,
    WalletOwners,
    Wallets,
    ProductDetails,
    Vouchers,
    /// Step-up token ids that have been presented once, keyed by `jti`.
    ConsumedTokens,
    WalletHistory,
    TransactionOrders,
    OrderItems,
    OrderRefunds,
}

impl Table {
    pub const ALL: [Table; 12] = [
        Table::Refunds,
        Table::Transactions,
        Table::Orders,
        Table::WalletOwners,
        Table::Wallets,
        Table::ProductDetails,
        Table::Vouchers,
        Table::ConsumedTokens,
        Table::WalletHistory,
        Table::TransactionOrders,
        Table::OrderItems,
        Table::OrderRefunds,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Refunds => "refunds",
            Table::Transactions => "transactions",
            Table::Orders => "orders",
            Table::WalletOwners => "wallet_owners",
            Table::Wallets => "wallets",
            Table::ProductDetails => "product_details",
            Table::Vouchers => "vouchers",
            Table::ConsumedTokens => "consumed_tokens",
            Table::WalletHistory => "wallet_history",
            Table::TransactionOrders => "transaction_orders",
            Table::OrderItems => "order_items",
            Table::OrderRefunds => "order_refunds",
        }
    }
}

/// A row write staged by a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub table: Table,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Raw row storage. Rows are opaque encoded bytes keyed per table.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Applies every mutation or none of them.
    async fn write_batch(&self, batch: Vec<Mutation>) -> Result<()>;
}

pub type KvBackendBox = Box<dyn KvBackend>;

/// Re-authentication and OTP delivery, owned by the identity service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool>;
    async fn contact_address(&self, user_id: Uuid) -> Result<Option<String>>;
    /// Sends a one-time code for `user_id` to `address` and returns the token identifying it.
    async fn send_otp(&self, user_id: Uuid, address: &str) -> Result<String>;
    /// True only when `token` was sent to `user_id` and `code` matches. Any presentation of a
    /// token uses it up, whether the code matches or not.
    async fn verify_otp(&self, user_id: Uuid, token: &str, code: &str) -> Result<bool>;
}

pub type IdentityProviderBox = Box<dyn IdentityProvider>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPayment {
    pub transaction_id: Uuid,
    pub invoice: String,
    pub card_number: String,
    pub amount: Decimal,
}

/// Outbound side of the external payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Returns the URL the payer is redirected to.
    async fn create_payment(&self, payment: GatewayPayment) -> Result<String>;
}

pub type PaymentGatewayBox = Box<dyn PaymentGateway>;
