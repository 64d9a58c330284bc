use crate::domain::ports::{IdentityProvider, KvBackend, Mutation, Table};
use crate::error::{Result, SettlementError};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;

/// A thread-safe in-memory row store.
///
/// One ordered map per table behind a single `RwLock`, so a batch is applied while no reader
/// can observe half of it. Ideal for tests and for runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryBackend {
    tables: Arc<RwLock<HashMap<Table, Rows>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key).cloned()))
    }

    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|rows| {
                rows.range(prefix.to_vec()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_batch(&self, batch: Vec<Mutation>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for mutation in batch {
            tables
                .entry(mutation.table)
                .or_default()
                .insert(mutation.key, mutation.value);
        }
        Ok(())
    }
}

struct Account {
    password_hash: String,
    email: Option<String>,
}

struct PendingOtp {
    user_id: Uuid,
    code: String,
}

/// Identity collaborator kept in memory: password check and OTP delivery.
///
/// Delivered codes are logged rather than mailed; [`InMemoryIdentity::pending_code`] lets callers
/// read them back.
#[derive(Default, Clone)]
pub struct InMemoryIdentity {
    accounts: Arc<RwLock<HashMap<Uuid, Account>>>,
    // keyed by otp token
    otps: Arc<RwLock<HashMap<String, PendingOtp>>>,
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: Uuid, password: &str, email: Option<String>) -> Result<()> {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| SettlementError::Internal(format!("password hashing: {e}")))?
            .to_string();
        self.accounts.write().await.insert(
            user_id,
            Account {
                password_hash,
                email,
            },
        );
        Ok(())
    }

    /// The code behind an OTP token that has not been used yet.
    pub async fn pending_code(&self, token: &str) -> Option<String> {
        self.otps.read().await.get(token).map(|otp| otp.code.clone())
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentity {
    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool> {
        let accounts = self.accounts.read().await;
        let Some(account) = accounts.get(&user_id) else {
            return Ok(false);
        };
        let parsed = PasswordHash::new(&account.password_hash)
            .map_err(|e| SettlementError::Internal(format!("stored password hash: {e}")))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    async fn contact_address(&self, user_id: Uuid) -> Result<Option<String>> {
        Ok(self
            .accounts
            .read()
            .await
            .get(&user_id)
            .and_then(|account| account.email.clone()))
    }

    async fn send_otp(&self, user_id: Uuid, address: &str) -> Result<String> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let token = Uuid::new_v4().simple().to_string();
        tracing::info!(%user_id, %address, "one-time code sent");
        self.otps.write().await.insert(
            token.clone(),
            PendingOtp { user_id, code },
        );
        Ok(token)
    }

    async fn verify_otp(&self, user_id: Uuid, token: &str, code: &str) -> Result<bool> {
        let Some(otp) = self.otps.write().await.remove(token) else {
            return Ok(false);
        };
        if otp.user_id != user_id {
            tracing::warn!(%user_id, owner = %otp.user_id, "one-time code presented by another user");
            return Ok(false);
        }
        Ok(otp.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_and_prefix_scan() {
        let backend = InMemoryBackend::new();
        backend
            .write_batch(vec![
                Mutation {
                    table: Table::WalletHistory,
                    key: vec![1, 1],
                    value: b"a".to_vec(),
                },
                Mutation {
                    table: Table::WalletHistory,
                    key: vec![1, 2],
                    value: b"b".to_vec(),
                },
                Mutation {
                    table: Table::WalletHistory,
                    key: vec![2, 1],
                    value: b"c".to_vec(),
                },
            ])
            .await
            .unwrap();

        let rows = backend.scan_prefix(Table::WalletHistory, &[1]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].1, b"b".to_vec());
        assert!(backend.get(Table::Wallets, &[1, 1]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_password_verification() {
        let identity = InMemoryIdentity::new();
        let user = Uuid::new_v4();
        identity.register(user, "hunter2", None).await.unwrap();

        assert!(identity.verify_password(user, "hunter2").await.unwrap());
        assert!(!identity.verify_password(user, "hunter3").await.unwrap());
        assert!(!identity.verify_password(Uuid::new_v4(), "hunter2").await.unwrap());
    }

    #[tokio::test]
    async fn test_otp_is_single_use() {
        let identity = InMemoryIdentity::new();
        let user = Uuid::new_v4();
        let token = identity.send_otp(user, "buyer@example.com").await.unwrap();
        let code = identity.pending_code(&token).await.unwrap();

        assert!(identity.verify_otp(user, &token, &code).await.unwrap());
        assert!(!identity.verify_otp(user, &token, &code).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_code_burns_the_token() {
        let identity = InMemoryIdentity::new();
        let user = Uuid::new_v4();
        let token = identity.send_otp(user, "buyer@example.com").await.unwrap();
        let code = identity.pending_code(&token).await.unwrap();

        assert!(!identity.verify_otp(user, &token, "not-it").await.unwrap());
        assert!(identity.pending_code(&token).await.is_none());
        assert!(!identity.verify_otp(user, &token, &code).await.unwrap());
    }

    #[tokio::test]
    async fn test_otp_is_bound_to_its_user() {
        let identity = InMemoryIdentity::new();
        let owner = Uuid::new_v4();
        let token = identity.send_otp(owner, "owner@example.com").await.unwrap();
        let code = identity.pending_code(&token).await.unwrap();

        assert!(!identity.verify_otp(Uuid::new_v4(), &token, &code).await.unwrap());
        assert!(!identity.verify_otp(owner, &token, &code).await.unwrap());
    }
}
