//! Short-lived, scoped step-up tokens.
//!
//! Tokens are HS256 JWTs. A token is good for one use: [`StepUpIssuer::consume`] records its
//! `jti` in the store, and a second presentation is refused even while it has not expired,
//! across restarts included.

use super::unit_of_work::Store;
use crate::clock::SharedClock;
use crate::config::JwtConfig;
use crate::error::{Result, SettlementError};
use chrono::Duration;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Granted after PIN verification; pays with the wallet.
    Level1,
    /// Granted after password or OTP re-verification; changes the PIN.
    Level2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub id: Uuid,
    pub scope: Scope,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
}

pub struct StepUpIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    lifetime: Duration,
    clock: SharedClock,
}

fn unauthorized(reason: &str) -> SettlementError {
    SettlementError::Authorization(reason.to_string())
}

impl StepUpIssuer {
    pub fn new(config: &JwtConfig, clock: SharedClock) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        // expiry is checked against the injected clock
        validation.validate_exp = false;

        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            lifetime: Duration::minutes(config.step_up_exp_min),
            clock,
        }
    }

    pub fn issue(&self, subject: Uuid, scope: Scope) -> Result<String> {
        let now = self.clock.now();
        let claims = Claims {
            id: subject,
            scope,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
            jti: Uuid::new_v4(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SettlementError::Internal(format!("token encoding: {e}")))
    }

    /// Checks signature, algorithm, issuer, expiry and scope without using the token up.
    pub fn validate(&self, token: &str, scope: Scope) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "step-up token rejected");
                unauthorized("invalid token")
            })?
            .claims;

        if claims.exp <= self.clock.now().timestamp() {
            return Err(unauthorized("token expired"));
        }
        if claims.scope != scope {
            return Err(unauthorized("wrong token scope"));
        }
        Ok(claims)
    }

    /// Validates the token and marks it used in its own unit of work, before the caller's
    /// operation runs.
    pub async fn consume(&self, store: &Store, token: &str, scope: Scope) -> Result<Claims> {
        let claims = self.validate(token, scope)?;
        let mut uow = store.begin();
        if uow.lock_consumed_token(claims.jti).await?.is_some() {
            return Err(unauthorized("token already used"));
        }
        uow.insert_consumed_token(claims.jti, self.clock.now())?;
        uow.commit().await?;
        Ok(claims)
    }
}
