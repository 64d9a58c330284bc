//! Atomic units of work over a [`KvBackend`].
//!
//! A [`UnitOfWork`] stages every write in memory and hands them to the backend as one batch
//! on [`UnitOfWork::commit`]. Dropping it without committing discards the staged writes, so a
//! failed operation leaves no trace.
//!
//! Rows that are read-modified-written are locked first. Locks are per row, held until the
//! unit ends, and must be taken in ascending `(table, key)` order (see [`Table`]); a unit that
//! asks for a lower row than one it already holds gets an error instead of a potential
//! deadlock.

use crate::domain::order::{Order, OrderItem};
use crate::domain::ports::{KvBackend, KvBackendBox, Mutation, Table};
use crate::domain::product::ProductDetail;
use crate::domain::refund::Refund;
use crate::domain::transaction::Transaction;
use crate::domain::voucher::Voucher;
use crate::domain::wallet::{Wallet, WalletHistory};
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RowKey {
    table: Table,
    key: Vec<u8>,
}

impl RowKey {
    fn new(table: Table, key: &[u8]) -> Self {
        Self {
            table,
            key: key.to_vec(),
        }
    }
}

#[derive(Default)]
struct LockTable {
    rows: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    async fn acquire(&self, row: &RowKey) -> OwnedMutexGuard<()> {
        let cell = {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            rows.entry(row.clone()).or_default().clone()
        };
        cell.lock_owned().await
    }

    /// Forgets lock cells nobody holds or waits on anymore.
    fn prune<'a>(&self, released: impl Iterator<Item = &'a RowKey>) {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for row in released {
            if rows.get(row).is_some_and(|cell| Arc::strong_count(cell) == 1) {
                rows.remove(row);
            }
        }
    }
}

/// Shared handle to the backend and its row locks. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    locks: Arc<LockTable>,
}

impl Store {
    pub fn new(backend: KvBackendBox) -> Self {
        Self {
            backend: Arc::from(backend),
            locks: Arc::new(LockTable::default()),
        }
    }

    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork {
            backend: self.backend.clone(),
            locks: self.locks.clone(),
            held: BTreeMap::new(),
            inserted: BTreeSet::new(),
            staged: BTreeMap::new(),
        }
    }
}

pub struct UnitOfWork {
    backend: Arc<dyn KvBackend>,
    locks: Arc<LockTable>,
    held: BTreeMap<RowKey, OwnedMutexGuard<()>>,
    inserted: BTreeSet<RowKey>,
    staged: BTreeMap<RowKey, Vec<u8>>,
}

fn key_of(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

impl UnitOfWork {
    async fn read<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        let row = RowKey::new(table, key);
        let bytes = match self.staged.get(&row) {
            Some(bytes) => Some(bytes.clone()),
            None => self.backend.get(table, key).await?,
        };
        Ok(bytes.map(|b| serde_json::from_slice(&b)).transpose()?)
    }

    async fn lock_row(&mut self, table: Table, key: &[u8]) -> Result<()> {
        let row = RowKey::new(table, key);
        if self.held.contains_key(&row) {
            return Ok(());
        }
        if let Some((highest, _)) = self.held.last_key_value()
            && *highest > row
        {
            return Err(SettlementError::Internal(format!(
                "lock order violation: {} after {}",
                table.name(),
                highest.table.name()
            )));
        }
        let guard = self.locks.acquire(&row).await;
        self.held.insert(row, guard);
        Ok(())
    }

    async fn lock_and_read<T: DeserializeOwned>(
        &mut self,
        table: Table,
        key: &[u8],
    ) -> Result<Option<T>> {
        self.lock_row(table, key).await?;
        self.read(table, key).await
    }

    /// Stages an update of a row this unit has locked or inserted.
    fn update<T: Serialize>(&mut self, table: Table, key: &[u8], value: &T) -> Result<()> {
        let row = RowKey::new(table, key);
        if !self.held.contains_key(&row) && !self.inserted.contains(&row) {
            return Err(SettlementError::Internal(format!(
                "write to unlocked {} row",
                table.name()
            )));
        }
        self.staged.insert(row, serde_json::to_vec(value)?);
        Ok(())
    }

    /// Stages a brand-new row (fresh key), or an append-only/index row.
    fn insert<T: Serialize>(&mut self, table: Table, key: &[u8], value: &T) -> Result<()> {
        let row = RowKey::new(table, key);
        self.staged.insert(row.clone(), serde_json::to_vec(value)?);
        self.inserted.insert(row);
        Ok(())
    }

    async fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = self
            .backend
            .scan_prefix(table, prefix)
            .await?
            .into_iter()
            .collect();
        for (row, bytes) in &self.staged {
            if row.table == table && row.key.starts_with(prefix) {
                rows.insert(row.key.clone(), bytes.clone());
            }
        }
        rows.values()
            .map(|bytes| serde_json::from_slice(bytes).map_err(SettlementError::from))
            .collect()
    }

    /// Applies every staged write atomically and releases the locks.
    pub async fn commit(mut self) -> Result<()> {
        let batch: Vec<Mutation> = std::mem::take(&mut self.staged)
            .into_iter()
            .map(|(row, value)| Mutation {
                table: row.table,
                key: row.key,
                value,
            })
            .collect();
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.write_batch(batch).await
    }

    // Wallets

    pub async fn wallet_id_of_user(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        self.read(Table::WalletOwners, &key_of(user_id)).await
    }

    /// Locks the user's wallet-owner slot; serializes activations for one user.
    pub async fn lock_wallet_owner(&mut self, user_id: Uuid) -> Result<Option<Uuid>> {
        self.lock_and_read(Table::WalletOwners, &key_of(user_id)).await
    }

    pub async fn wallet(&self, wallet_id: Uuid) -> Result<Wallet> {
        self.read(Table::Wallets, &key_of(wallet_id))
            .await?
            .ok_or_else(|| SettlementError::not_found("wallet", wallet_id))
    }

    pub async fn lock_wallet(&mut self, wallet_id: Uuid) -> Result<Wallet> {
        self.lock_and_read(Table::Wallets, &key_of(wallet_id))
            .await?
            .ok_or_else(|| SettlementError::not_found("wallet", wallet_id))
    }

    pub fn put_wallet(&mut self, wallet: &Wallet) -> Result<()> {
        self.update(Table::Wallets, &key_of(wallet.id), wallet)
    }

    pub fn insert_wallet(&mut self, wallet: &Wallet) -> Result<()> {
        self.insert(Table::Wallets, &key_of(wallet.id), wallet)?;
        self.insert(Table::WalletOwners, &key_of(wallet.user_id), &wallet.id)
    }

    pub fn append_history(&mut self, entry: &WalletHistory) -> Result<()> {
        let mut key = key_of(entry.wallet_id);
        key.extend_from_slice(entry.id.as_bytes());
        self.insert(Table::WalletHistory, &key, entry)
    }

    /// Ledger entries of one wallet, oldest first.
    pub async fn wallet_history(&self, wallet_id: Uuid) -> Result<Vec<WalletHistory>> {
        let mut entries: Vec<WalletHistory> =
            self.scan(Table::WalletHistory, &key_of(wallet_id)).await?;
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    pub async fn all_wallets(&self) -> Result<Vec<Wallet>> {
        self.scan(Table::Wallets, &[]).await
    }

    // Product details

    pub async fn product_detail(&self, id: Uuid) -> Result<ProductDetail> {
        self.read(Table::ProductDetails, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("product detail", id))
    }

    pub async fn lock_product_detail(&mut self, id: Uuid) -> Result<ProductDetail> {
        self.lock_and_read(Table::ProductDetails, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("product detail", id))
    }

    pub fn put_product_detail(&mut self, detail: &ProductDetail) -> Result<()> {
        self.update(Table::ProductDetails, &key_of(detail.id), detail)
    }

    pub fn insert_product_detail(&mut self, detail: &ProductDetail) -> Result<()> {
        self.insert(Table::ProductDetails, &key_of(detail.id), detail)
    }

    // Vouchers

    pub async fn voucher(&self, id: Uuid) -> Result<Voucher> {
        self.read(Table::Vouchers, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("voucher", id))
    }

    pub async fn lock_voucher(&mut self, id: Uuid) -> Result<Voucher> {
        self.lock_and_read(Table::Vouchers, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("voucher", id))
    }

    pub fn put_voucher(&mut self, voucher: &Voucher) -> Result<()> {
        self.update(Table::Vouchers, &key_of(voucher.id), voucher)
    }

    pub fn insert_voucher(&mut self, voucher: &Voucher) -> Result<()> {
        self.insert(Table::Vouchers, &key_of(voucher.id), voucher)
    }

    // Transactions and orders

    pub async fn transaction(&self, id: Uuid) -> Result<Transaction> {
        self.read(Table::Transactions, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("transaction", id))
    }

    pub async fn lock_transaction(&mut self, id: Uuid) -> Result<Transaction> {
        self.lock_and_read(Table::Transactions, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("transaction", id))
    }

    pub fn put_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        self.update(Table::Transactions, &key_of(transaction.id), transaction)
    }

    pub fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        self.insert(Table::Transactions, &key_of(transaction.id), transaction)
    }

    /// Order ids of a transaction, sorted ascending (lock order).
    pub async fn order_ids_of_transaction(&self, transaction_id: Uuid) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .read(Table::TransactionOrders, &key_of(transaction_id))
            .await?
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    pub async fn order(&self, id: Uuid) -> Result<Order> {
        self.read(Table::Orders, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("order", id))
    }

    pub async fn lock_order(&mut self, id: Uuid) -> Result<Order> {
        self.lock_and_read(Table::Orders, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("order", id))
    }

    pub fn put_order(&mut self, order: &Order) -> Result<()> {
        self.update(Table::Orders, &key_of(order.id), order)
    }

    /// Inserts the orders of a new transaction together with their items.
    pub fn insert_orders(
        &mut self,
        transaction_id: Uuid,
        orders: &[(Order, Vec<OrderItem>)],
    ) -> Result<()> {
        let ids: Vec<Uuid> = orders.iter().map(|(order, _)| order.id).collect();
        self.insert(Table::TransactionOrders, &key_of(transaction_id), &ids)?;
        for (order, items) in orders {
            self.insert(Table::Orders, &key_of(order.id), order)?;
            self.insert(Table::OrderItems, &key_of(order.id), items)?;
        }
        Ok(())
    }

    pub async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>> {
        Ok(self
            .read(Table::OrderItems, &key_of(order_id))
            .await?
            .unwrap_or_default())
    }

    // Refunds

    pub async fn lock_refund(&mut self, id: Uuid) -> Result<Refund> {
        self.lock_and_read(Table::Refunds, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("refund", id))
    }

    pub fn put_refund(&mut self, refund: &Refund) -> Result<()> {
        self.update(Table::Refunds, &key_of(refund.id), refund)
    }

    pub fn insert_refund(&mut self, refund: &Refund) -> Result<()> {
        self.insert(Table::Refunds, &key_of(refund.id), refund)?;
        self.insert(Table::OrderRefunds, &key_of(refund.order_id), &refund.id)
    }

    pub async fn refund(&self, id: Uuid) -> Result<Refund> {
        self.read(Table::Refunds, &key_of(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("refund", id))
    }

    /// Latest refund opened for an order, if any.
    pub async fn refund_of_order(&self, order_id: Uuid) -> Result<Option<Refund>> {
        let id: Option<Uuid> = self.read(Table::OrderRefunds, &key_of(order_id)).await?;
        match id {
            Some(id) => Ok(Some(self.refund(id).await?)),
            None => Ok(None),
        }
    }

    // Step-up tokens

    /// Locks a token id and returns when it was first consumed, if it was.
    pub async fn lock_consumed_token(&mut self, jti: Uuid) -> Result<Option<DateTime<Utc>>> {
        self.lock_and_read(Table::ConsumedTokens, &key_of(jti)).await
    }

    pub fn insert_consumed_token(&mut self, jti: Uuid, consumed_at: DateTime<Utc>) -> Result<()> {
        self.insert(Table::ConsumedTokens, &key_of(jti), &consumed_at)
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let released: Vec<RowKey> = self.held.keys().cloned().collect();
        self.held.clear();
        self.locks.prune(released.iter());
    }
}
