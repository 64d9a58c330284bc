use crate::config::GatewayConfig;
use crate::domain::ports::{GatewayPayment, PaymentGateway};
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

/// Hosted-checkout gateway: payments are started by redirecting the payer to a signed URL.
///
/// The signature is an HMAC-SHA256, keyed with the merchant API key, over
/// `merchant|invoice|transaction|amount`. The gateway later reports the outcome through the
/// payment callback.
#[derive(Debug, Clone)]
pub struct RedirectGateway {
    config: GatewayConfig,
}

impl RedirectGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.api_key.as_bytes())
            .map_err(|e| SettlementError::Internal(format!("gateway key: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl PaymentGateway for RedirectGateway {
    async fn create_payment(&self, payment: GatewayPayment) -> Result<String> {
        let amount = payment.amount.normalize();
        let payload = format!(
            "{}|{}|{}|{}",
            self.config.merchant_code, payment.invoice, payment.transaction_id, amount
        );
        let signature = self.sign(&payload)?;

        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| SettlementError::Internal(format!("gateway base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| SettlementError::Internal("gateway base url cannot have a path".into()))?
            .pop_if_empty()
            .push("checkout");
        url.query_pairs_mut()
            .append_pair("merchant", &self.config.merchant_code)
            .append_pair("invoice", &payment.invoice)
            .append_pair("transaction", &payment.transaction_id.to_string())
            .append_pair("amount", &amount.to_string())
            .append_pair("signature", &signature);
        Ok(url.into())
    }
}
