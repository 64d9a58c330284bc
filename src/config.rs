//! Engine configuration, loaded from TOML. Every field has a default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementConfig {
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub pin: PinPolicy,
    #[serde(default)]
    pub settlement: LedgerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtConfig {
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Lifetime of step-up tokens.
    #[serde(default = "default_step_up_exp_min")]
    pub step_up_exp_min: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
    #[serde(default = "default_pin_length")]
    pub length: usize,
    /// Argon2 memory cost in KiB.
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Owner of the marketplace escrow wallet.
    #[serde(default = "default_escrow_owner")]
    pub escrow_owner_id: Uuid,
    #[serde(default = "default_transaction_expiry")]
    pub transaction_expiry_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    #[serde(default)]
    pub merchant_code: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_secret() -> String {
    "change-me".to_string()
}

fn default_issuer() -> String {
    "settlement-engine".to_string()
}

fn default_step_up_exp_min() -> i64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lockout_minutes() -> i64 {
    60
}

fn default_pin_length() -> usize {
    6
}

fn default_memory_kib() -> u32 {
    argon2::Params::DEFAULT_M_COST
}

fn default_iterations() -> u32 {
    argon2::Params::DEFAULT_T_COST
}

fn default_escrow_owner() -> Uuid {
    Uuid::nil()
}

fn default_transaction_expiry() -> i64 {
    24 * 60
}

fn default_gateway_url() -> String {
    "https://pay.example.com".to_string()
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            jwt: JwtConfig::default(),
            pin: PinPolicy::default(),
            settlement: LedgerConfig::default(),
            gateway: GatewayConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            issuer: default_issuer(),
            step_up_exp_min: default_step_up_exp_min(),
        }
    }
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_minutes: default_lockout_minutes(),
            length: default_pin_length(),
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            escrow_owner_id: default_escrow_owner(),
            transaction_expiry_minutes: default_transaction_expiry(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            merchant_code: String::new(),
            api_key: String::new(),
        }
    }
}

impl SettlementConfig {
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let config: SettlementConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.is_empty() {
            return Err(ConfigError::Validation("jwt.secret is empty".into()));
        }
        if self.jwt.step_up_exp_min <= 0 {
            return Err(ConfigError::Validation(
                "jwt.step_up_exp_min must be positive".into(),
            ));
        }
        if self.pin.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "pin.max_attempts must be at least 1".into(),
            ));
        }
        if self.pin.lockout_minutes <= 0 {
            return Err(ConfigError::Validation(
                "pin.lockout_minutes must be positive".into(),
            ));
        }
        if self.settlement.transaction_expiry_minutes <= 0 {
            return Err(ConfigError::Validation(
                "settlement.transaction_expiry_minutes must be positive".into(),
            ));
        }
        if let Err(e) = url::Url::parse(&self.gateway.base_url) {
            return Err(ConfigError::Validation(format!(
                "gateway.base_url is not a url: {e}"
            )));
        }
        Ok(())
    }
}
