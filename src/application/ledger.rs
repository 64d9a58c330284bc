//! Double-entry ledger writer.
//!
//! Every balance change in the engine goes through [`transfer`] or [`deposit`], inside the
//! caller's unit of work. A transfer locks both wallets (ascending id), refuses to overdraw the
//! source, and records one [`WalletHistory`] row per side with the same amount and
//! transaction id.

use super::unit_of_work::{Store, UnitOfWork};
use crate::domain::money::Amount;
use crate::domain::wallet::{Party, Wallet, WalletHistory};
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The marketplace's own wallet, where buyer funds sit between payment and payout or refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowWallet {
    pub owner_id: Uuid,
    pub wallet_id: Uuid,
}

impl EscrowWallet {
    /// Finds the wallet of `owner_id`, opening an empty, PIN-less one on first start.
    pub async fn resolve(store: &Store, owner_id: Uuid, now: DateTime<Utc>) -> Result<Self> {
        let mut uow = store.begin();
        let wallet_id = match uow.lock_wallet_owner(owner_id).await? {
            Some(wallet_id) => wallet_id,
            None => {
                let mut wallet = Wallet::new(owner_id, String::new(), now);
                wallet.pin_hash = None;
                uow.insert_wallet(&wallet)?;
                uow.commit().await?;
                tracing::info!(wallet_id = %wallet.id, %owner_id, "escrow wallet opened");
                wallet.id
            }
        };
        Ok(Self {
            owner_id,
            wallet_id,
        })
    }
}

/// Moves `amount` from one wallet to another.
///
/// Fails with [`SettlementError::InsufficientBalance`] without touching either wallet when the
/// source cannot cover it.
pub async fn transfer(
    uow: &mut UnitOfWork,
    from: Uuid,
    to: Uuid,
    amount: Amount,
    transaction_id: Option<Uuid>,
    description: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    if from == to {
        return Err(SettlementError::Validation(format!(
            "cannot move funds from wallet {from} to itself"
        )));
    }

    let (mut source, mut target) = if from < to {
        let source = uow.lock_wallet(from).await?;
        (source, uow.lock_wallet(to).await?)
    } else {
        let target = uow.lock_wallet(to).await?;
        (uow.lock_wallet(from).await?, target)
    };

    if !source.debit(amount, now) {
        tracing::warn!(wallet_id = %from, balance = %source.balance, %amount, "insufficient balance");
        return Err(SettlementError::InsufficientBalance {
            wallet_id: from,
            balance: source.balance.value(),
            requested: amount.value(),
        });
    }
    target.credit(amount, now);
    uow.put_wallet(&source)?;
    uow.put_wallet(&target)?;

    for wallet_id in [from, to] {
        uow.append_history(&WalletHistory {
            id: Uuid::new_v4(),
            transaction_id,
            wallet_id,
            from: Party::Wallet(from),
            to: Party::Wallet(to),
            amount,
            description: description.to_string(),
            created_at: now,
        })?;
    }

    tracing::debug!(%from, %to, %amount, ?transaction_id, "funds moved");
    Ok(())
}

/// Credits a wallet with funds arriving from outside the ledger (a charged card).
///
/// Only the receiving side is a wallet, so this writes a single history row whose `from`
/// is the external party.
pub async fn deposit(
    uow: &mut UnitOfWork,
    source: Party,
    to: Uuid,
    amount: Amount,
    transaction_id: Option<Uuid>,
    description: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    if matches!(source, Party::Wallet(_)) {
        return Err(SettlementError::Internal(
            "wallet-to-wallet movements go through transfer".into(),
        ));
    }

    let mut target = uow.lock_wallet(to).await?;
    target.credit(amount, now);
    uow.put_wallet(&target)?;
    uow.append_history(&WalletHistory {
        id: Uuid::new_v4(),
        transaction_id,
        wallet_id: to,
        from: source,
        to: Party::Wallet(to),
        amount,
        description: description.to_string(),
        created_at: now,
    })?;

    tracing::debug!(%to, %amount, ?transaction_id, "external funds deposited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Balance;
    use crate::infrastructure::in_memory::InMemoryBackend;
    use rust_decimal_macros::dec;

    async fn store_with(balances: &[rust_decimal::Decimal]) -> (Store, Vec<Uuid>) {
        let store = Store::new(Box::new(InMemoryBackend::new()));
        let mut uow = store.begin();
        let mut ids = Vec::new();
        for balance in balances {
            let mut wallet = Wallet::new(Uuid::new_v4(), "hash".into(), Utc::now());
            wallet.balance = Balance::new(*balance).unwrap();
            uow.insert_wallet(&wallet).unwrap();
            ids.push(wallet.id);
        }
        uow.commit().await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_and_writes_both_sides() {
        let (store, ids) = store_with(&[dec!(100), dec!(10)]).await;
        let tx = Uuid::new_v4();

        let mut uow = store.begin();
        transfer(
            &mut uow,
            ids[0],
            ids[1],
            Amount::new(dec!(40)).unwrap(),
            Some(tx),
            "payment",
            Utc::now(),
        )
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let uow = store.begin();
        assert_eq!(uow.wallet(ids[0]).await.unwrap().balance.value(), dec!(60));
        assert_eq!(uow.wallet(ids[1]).await.unwrap().balance.value(), dec!(50));

        let debit = uow.wallet_history(ids[0]).await.unwrap();
        let credit = uow.wallet_history(ids[1]).await.unwrap();
        assert_eq!(debit.len(), 1);
        assert_eq!(credit.len(), 1);
        assert_eq!(debit[0].amount, credit[0].amount);
        assert_eq!(debit[0].transaction_id, Some(tx));
        assert_eq!(credit[0].transaction_id, Some(tx));
        assert_eq!(debit[0].signed_amount() + credit[0].signed_amount(), dec!(0));
    }

    #[tokio::test]
    async fn test_transfer_in_descending_id_order() {
        let (store, mut ids) = store_with(&[dec!(5), dec!(5)]).await;
        ids.sort();

        let mut uow = store.begin();
        transfer(
            &mut uow,
            ids[1],
            ids[0],
            Amount::new(dec!(5)).unwrap(),
            None,
            "payment",
            Utc::now(),
        )
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let uow = store.begin();
        assert_eq!(uow.wallet(ids[0]).await.unwrap().balance.value(), dec!(10));
        assert_eq!(uow.wallet(ids[1]).await.unwrap().balance, Balance::ZERO);
    }

    #[tokio::test]
    async fn test_overdraw_leaves_balances_unchanged() {
        let (store, ids) = store_with(&[dec!(30), dec!(0)]).await;

        let mut uow = store.begin();
        let err = transfer(
            &mut uow,
            ids[0],
            ids[1],
            Amount::new(dec!(30.01)).unwrap(),
            None,
            "payment",
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientBalance { .. }));
        drop(uow);

        let uow = store.begin();
        assert_eq!(uow.wallet(ids[0]).await.unwrap().balance.value(), dec!(30));
        assert_eq!(uow.wallet(ids[1]).await.unwrap().balance, Balance::ZERO);
        assert!(uow.wallet_history(ids[0]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_from_card() {
        let (store, ids) = store_with(&[dec!(0)]).await;

        let mut uow = store.begin();
        deposit(
            &mut uow,
            Party::External("card:1111".into()),
            ids[0],
            Amount::new(dec!(25)).unwrap(),
            None,
            "top up",
            Utc::now(),
        )
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let uow = store.begin();
        assert_eq!(uow.wallet(ids[0]).await.unwrap().balance.value(), dec!(25));
        let history = uow.wallet_history(ids[0]).await.unwrap();
        assert_eq!(history[0].from, Party::External("card:1111".into()));
    }

    #[tokio::test]
    async fn test_escrow_is_resolved_once() {
        let store = Store::new(Box::new(InMemoryBackend::new()));
        let owner = Uuid::new_v4();
        let first = EscrowWallet::resolve(&store, owner, Utc::now()).await.unwrap();
        let second = EscrowWallet::resolve(&store, owner, Utc::now()).await.unwrap();
        assert_eq!(first, second);

        let uow = store.begin();
        assert!(uow.wallet(first.wallet_id).await.unwrap().pin_hash.is_none());
    }
}
