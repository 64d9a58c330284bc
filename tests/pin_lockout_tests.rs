mod common;

use chrono::Duration;
use common::*;
use rust_decimal::Decimal;
use settlement_engine::error::{ErrorKind, SettlementError};
use std::sync::Arc;

#[tokio::test]
async fn test_lockout_after_three_failures() {
    let h = harness().await;
    let (user, _) = h.funded_wallet(Decimal::ZERO).await;

    for remaining in [2, 1] {
        let err = h.engine.wallet_step_up(user, "999999").await.unwrap_err();
        assert!(matches!(err, SettlementError::PinMismatch { remaining: r } if r == remaining));
    }
    let err = h.engine.wallet_step_up(user, "999999").await.unwrap_err();
    assert!(matches!(err, SettlementError::PinLocked { .. }));

    // the correct PIN does not help while locked
    let err = h.engine.wallet_step_up(user, PIN).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Locked);
    assert!(err.is_retryable());

    h.clock.advance(Duration::minutes(59));
    assert!(h.engine.wallet_step_up(user, PIN).await.is_err());

    h.clock.advance(Duration::minutes(2));
    assert!(h.engine.wallet_step_up(user, PIN).await.is_ok());
    assert_eq!(h.engine.get_wallet(user).await.unwrap().failed_attempts, 0);
}

#[tokio::test]
async fn test_failed_attempts_are_persisted() {
    let h = harness().await;
    let (user, _) = h.funded_wallet(Decimal::ZERO).await;

    let _ = h.engine.wallet_step_up(user, "000000").await;
    let _ = h.engine.wallet_step_up(user, "000000").await;

    let wallet = h.engine.get_wallet(user).await.unwrap();
    assert_eq!(wallet.failed_attempts, 2);
    assert!(wallet.locked_until.is_none());
}

#[tokio::test]
async fn test_locked_wallet_cannot_pay() {
    let h = harness().await;
    let (user, _) = h.funded_wallet(Decimal::ZERO).await;
    for _ in 0..3 {
        let _ = h.engine.wallet_step_up(user, "000000").await;
    }

    assert!(matches!(
        h.engine.wallet_step_up(user, PIN).await,
        Err(SettlementError::PinLocked { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attempts_serialize_on_wallet() {
    let h = Arc::new(harness().await);
    let (user, _) = h.funded_wallet(Decimal::ZERO).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.engine.wallet_step_up(user, "000000").await
        }));
    }

    let mut mismatches = 0;
    let mut locked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Err(SettlementError::PinMismatch { .. }) => mismatches += 1,
            Err(SettlementError::PinLocked { .. }) => locked += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    // no lost updates: exactly two mismatches before the third attempt locks the wallet
    assert_eq!(mismatches, 2);
    assert_eq!(locked, 8);
}

#[tokio::test]
async fn test_activation_rules() {
    let h = harness().await;
    let (user, _) = h.funded_wallet(Decimal::ZERO).await;

    let err = h.engine.activate_wallet(user, PIN).await.unwrap_err();
    assert!(matches!(err, SettlementError::AlreadyActivated(u) if u == user));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}
