//! Wallet PIN verification and lockout.
//!
//! PINs are stored as Argon2id PHC strings. Attempt counters and lockout windows are
//! read-modify-written under the wallet's row lock, the same lock the ledger takes for balance
//! changes, so concurrent attempts against one wallet serialize.

use super::unit_of_work::Store;
use crate::clock::SharedClock;
use crate::config::PinPolicy;
use crate::domain::wallet::Wallet;
use crate::error::{Result, SettlementError};
use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use chrono::Duration;
use uuid::Uuid;

pub struct PinGuard {
    max_attempts: u32,
    lockout: Duration,
    length: usize,
    hasher: Argon2<'static>,
    clock: SharedClock,
}

impl PinGuard {
    pub fn new(policy: &PinPolicy, clock: SharedClock) -> Result<Self> {
        let params = Params::new(policy.memory_kib, policy.iterations, 1, None)
            .map_err(|e| SettlementError::Internal(format!("argon2 parameters: {e}")))?;
        Ok(Self {
            max_attempts: policy.max_attempts,
            lockout: Duration::minutes(policy.lockout_minutes),
            length: policy.length,
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            clock,
        })
    }

    fn check_format(&self, pin: &str) -> Result<()> {
        if pin.len() != self.length || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SettlementError::Validation(format!(
                "PIN must be exactly {} digits",
                self.length
            )));
        }
        Ok(())
    }

    fn hash(&self, pin: &str) -> Result<String> {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        Ok(self
            .hasher
            .hash_password(pin.as_bytes(), &salt)
            .map_err(|e| SettlementError::Internal(format!("PIN hashing: {e}")))?
            .to_string())
    }

    fn matches(&self, stored: &str, pin: &str) -> Result<bool> {
        let parsed = PasswordHash::new(stored)
            .map_err(|e| SettlementError::Internal(format!("stored PIN hash: {e}")))?;
        Ok(self.hasher.verify_password(pin.as_bytes(), &parsed).is_ok())
    }

    /// Opens the user's wallet with `pin`. A soft-deleted wallet is replaced.
    #[tracing::instrument(skip(self, store, pin))]
    pub async fn activate(&self, store: &Store, user_id: Uuid, pin: &str) -> Result<Wallet> {
        self.check_format(pin)?;
        let now = self.clock.now();

        let mut uow = store.begin();
        if let Some(existing) = uow.lock_wallet_owner(user_id).await?
            && !uow.wallet(existing).await?.is_deleted()
        {
            return Err(SettlementError::AlreadyActivated(user_id));
        }

        let wallet = Wallet::new(user_id, self.hash(pin)?, now);
        uow.insert_wallet(&wallet)?;
        uow.commit().await?;

        tracing::info!(wallet_id = %wallet.id, "wallet activated");
        Ok(wallet)
    }

    /// Checks `pin` against the wallet, counting failures toward a lockout.
    ///
    /// The attempt that reaches the threshold starts the lockout and reports
    /// [`SettlementError::PinLocked`]; until the window ends every call does, whatever the PIN.
    #[tracing::instrument(skip(self, store, pin))]
    pub async fn verify(&self, store: &Store, wallet_id: Uuid, pin: &str) -> Result<Wallet> {
        let now = self.clock.now();
        let mut uow = store.begin();
        let mut wallet = uow.lock_wallet(wallet_id).await?;

        if !wallet.is_active(now) {
            return Err(SettlementError::Validation(format!(
                "wallet {wallet_id} is not active"
            )));
        }
        let Some(stored) = wallet.pin_hash.clone() else {
            return Err(SettlementError::Validation(format!(
                "wallet {wallet_id} has no PIN"
            )));
        };
        if let Some(until) = wallet.lockout_at(now) {
            tracing::warn!(%until, "PIN attempt while locked");
            return Err(SettlementError::PinLocked { until });
        }
        if wallet.locked_until.take().is_some() {
            wallet.attempt_count = 0;
        }

        let outcome = if self.matches(&stored, pin)? {
            wallet.attempt_count = 0;
            Ok(())
        } else {
            wallet.attempt_count += 1;
            wallet.attempt_at = Some(now);
            if wallet.attempt_count >= self.max_attempts {
                let until = now + self.lockout;
                wallet.locked_until = Some(until);
                wallet.attempt_count = 0;
                tracing::warn!(%until, "wallet locked after repeated PIN failures");
                Err(SettlementError::PinLocked { until })
            } else {
                let remaining = self.max_attempts - wallet.attempt_count;
                tracing::warn!(remaining, "PIN mismatch");
                Err(SettlementError::PinMismatch { remaining })
            }
        };

        // failed attempts are persisted too
        uow.put_wallet(&wallet)?;
        uow.commit().await?;
        outcome.map(|()| wallet)
    }

    /// Replaces the PIN and clears any failed attempts or lockout.
    #[tracing::instrument(skip(self, store, new_pin))]
    pub async fn change_pin(&self, store: &Store, wallet_id: Uuid, new_pin: &str) -> Result<()> {
        self.check_format(new_pin)?;
        let now = self.clock.now();

        let mut uow = store.begin();
        let mut wallet = uow.lock_wallet(wallet_id).await?;
        if !wallet.is_active(now) {
            return Err(SettlementError::Validation(format!(
                "wallet {wallet_id} is not active"
            )));
        }
        wallet.pin_hash = Some(self.hash(new_pin)?);
        wallet.attempt_count = 0;
        wallet.attempt_at = None;
        wallet.locked_until = None;
        wallet.updated_at = Some(now);
        uow.put_wallet(&wallet)?;
        uow.commit().await?;

        tracing::info!("wallet PIN changed");
        Ok(())
    }
}
