mod common;

use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement_engine::domain::wallet::Party;
use settlement_engine::error::SettlementError;
use uuid::Uuid;

#[tokio::test]
async fn test_wallet_payment_moves_funds_to_escrow() {
    let h = harness().await;
    let (user, wallet) = h.funded_wallet(dec!(100000)).await;
    let shop = Uuid::new_v4();
    let product = h.product(shop, dec!(30000), 10).await;

    let (tx, _) = h
        .engine
        .create_transaction(
            user,
            wallet_request(wallet, vec![shop_order(shop, dec!(5000), &[(product.id, 2)])]),
        )
        .await
        .unwrap();
    assert_eq!(tx.total_price, dec!(65000));

    h.pay_with_wallet(user, tx.id).await.unwrap();

    assert_eq!(h.balance(wallet).await, dec!(35000));
    assert_eq!(h.escrow_balance().await, dec!(65000));

    let buyer_side = h.engine.get_wallet_history(user).await.unwrap();
    let escrow_side = h
        .engine
        .store()
        .begin()
        .wallet_history(h.engine.escrow().wallet_id)
        .await
        .unwrap();
    assert_eq!(buyer_side.len(), 1);
    assert_eq!(escrow_side.len(), 1);
    assert_eq!(buyer_side[0].amount, escrow_side[0].amount);
    assert_eq!(buyer_side[0].transaction_id, Some(tx.id));
    assert_eq!(escrow_side[0].transaction_id, Some(tx.id));
    assert_eq!(buyer_side[0].from, Party::Wallet(wallet));
    assert_eq!(
        buyer_side[0].signed_amount() + escrow_side[0].signed_amount(),
        Decimal::ZERO
    );
}

#[tokio::test]
async fn test_insufficient_balance_changes_nothing() {
    let h = harness().await;
    let (user, wallet) = h.funded_wallet(dec!(1000)).await;
    let shop = Uuid::new_v4();
    let product = h.product(shop, dec!(5000), 10).await;

    let (tx, orders) = h
        .engine
        .create_transaction(
            user,
            wallet_request(wallet, vec![shop_order(shop, dec!(0), &[(product.id, 1)])]),
        )
        .await
        .unwrap();

    let err = h.pay_with_wallet(user, tx.id).await.unwrap_err();
    assert!(matches!(
        err,
        SettlementError::InsufficientBalance { requested, .. } if requested == dec!(5000)
    ));

    assert_eq!(h.balance(wallet).await, dec!(1000));
    assert_eq!(h.escrow_balance().await, Decimal::ZERO);
    assert!(h.engine.get_wallet_history(user).await.unwrap().is_empty());

    let tx = h.engine.transaction(tx.id).await.unwrap();
    assert!(tx.paid_at.is_none());
    let after = h.engine.orders_of_transaction(tx.id).await.unwrap();
    assert_eq!(after[0].status, orders[0].status);
}

#[tokio::test]
async fn test_card_top_up_credits_wallet_from_external_party() {
    let h = harness().await;
    let (user, wallet) = h.funded_wallet(Decimal::ZERO).await;

    let tx = h
        .engine
        .top_up_wallet(user, dec!(25000), "4111111111111111".into())
        .await
        .unwrap();
    assert!(h.engine.orders_of_transaction(tx.id).await.unwrap().is_empty());

    h.engine.update_transaction(paid(tx.id)).await.unwrap();

    assert_eq!(h.balance(wallet).await, dec!(25000));
    let history = h.engine.get_wallet_history(user).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, Party::External("4111111111111111".into()));
    assert_eq!(history[0].to, Party::Wallet(wallet));
}

#[tokio::test]
async fn test_top_up_requires_positive_amount_and_wallet() {
    let h = harness().await;
    let (user, _) = h.funded_wallet(Decimal::ZERO).await;

    assert!(matches!(
        h.engine.top_up_wallet(user, dec!(0), "4111".into()).await,
        Err(SettlementError::Validation(_))
    ));
    assert!(matches!(
        h.engine
            .top_up_wallet(Uuid::new_v4(), dec!(10), "4111".into())
            .await,
        Err(SettlementError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_balances_never_go_negative() {
    let h = harness().await;
    let (user, wallet) = h.funded_wallet(dec!(10000)).await;
    let shop = Uuid::new_v4();
    let product = h.product(shop, dec!(4000), 10).await;

    let mut paid = 0;
    for _ in 0..4 {
        let (tx, _) = h
            .engine
            .create_transaction(
                user,
                wallet_request(wallet, vec![shop_order(shop, dec!(0), &[(product.id, 1)])]),
            )
            .await
            .unwrap();
        if h.pay_with_wallet(user, tx.id).await.is_ok() {
            paid += 1;
        }
        assert!(h.balance(wallet).await >= Decimal::ZERO);
    }

    assert_eq!(paid, 2);
    assert_eq!(h.balance(wallet).await, dec!(2000));
    assert_eq!(h.escrow_balance().await, dec!(8000));
}
