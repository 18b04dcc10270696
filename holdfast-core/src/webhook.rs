//! Provider webhook envelopes and their HMAC authentication.
//!
//! Each provider signs callbacks with a shared secret:
//! - HMAC-SHA512 over the raw request body, hex encoded;
//! - HMAC-SHA256 over the compact re-serialization of the `data` object, hex encoded.

use hmac::{Hmac, Mac};
use holdfast_shared::Masked;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use std::str::FromStr;

use crate::payment::ProviderKind;
use crate::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    HmacSha512RawBody,
    HmacSha256Data,
}

/// Checks webhook signatures for one provider.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    scheme: SignatureScheme,
    secret: Masked<Vec<u8>>,
}

impl WebhookVerifier {
    pub fn new(scheme: SignatureScheme, secret: impl Into<Vec<u8>>) -> Self {
        Self { scheme, secret: Masked(secret.into()) }
    }

    pub fn for_provider(kind: ProviderKind, secret: impl Into<Vec<u8>>) -> Self {
        Self::new(kind.signature_scheme(), secret)
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// Hex signature the provider would send for `raw_body`.
    pub fn sign(&self, raw_body: &[u8]) -> CoreResult<String> {
        let message = self.signed_bytes(raw_body)?;
        let digest = match self.scheme {
            SignatureScheme::HmacSha512RawBody => {
                let mut mac = HmacSha512::new_from_slice(self.secret.expose())
                    .map_err(|e| CoreError::ValidationError(e.to_string()))?;
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
            SignatureScheme::HmacSha256Data => {
                let mut mac = HmacSha256::new_from_slice(self.secret.expose())
                    .map_err(|e| CoreError::ValidationError(e.to_string()))?;
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(hex::encode(digest))
    }

    /// Constant-time check of a hex signature. Malformed input is a mismatch.
    pub fn verify(&self, raw_body: &[u8], signature: &str) -> bool {
        let expected = match hex::decode(signature.trim()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let message = match self.signed_bytes(raw_body) {
            Ok(m) => m,
            Err(_) => return false,
        };

        match self.scheme {
            SignatureScheme::HmacSha512RawBody => match HmacSha512::new_from_slice(self.secret.expose()) {
                Ok(mut mac) => {
                    mac.update(&message);
                    mac.verify_slice(&expected).is_ok()
                }
                Err(_) => false,
            },
            SignatureScheme::HmacSha256Data => match HmacSha256::new_from_slice(self.secret.expose()) {
                Ok(mut mac) => {
                    mac.update(&message);
                    mac.verify_slice(&expected).is_ok()
                }
                Err(_) => false,
            },
        }
    }

    fn signed_bytes(&self, raw_body: &[u8]) -> CoreResult<Vec<u8>> {
        match self.scheme {
            SignatureScheme::HmacSha512RawBody => Ok(raw_body.to_vec()),
            SignatureScheme::HmacSha256Data => {
                let value: serde_json::Value = serde_json::from_slice(raw_body)?;
                let data = value
                    .get("data")
                    .ok_or_else(|| CoreError::ValidationError("webhook has no data object".into()))?;
                Ok(serde_json::to_vec(&canonical(data))?)
            }
        }
    }
}

/// Copy of `value` with every object's keys in sorted order.
fn canonical(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical).collect())
        }
        other => other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    TransferSuccess,
    TransferFailed,
    TransferReversed,
    ChargeSuccess,
    Other(String),
}

impl From<&str> for WebhookEventKind {
    fn from(event: &str) -> Self {
        match event {
            "transfer.success" => WebhookEventKind::TransferSuccess,
            "transfer.failed" => WebhookEventKind::TransferFailed,
            "transfer.reversed" => WebhookEventKind::TransferReversed,
            "charge.success" => WebhookEventKind::ChargeSuccess,
            other => WebhookEventKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookData {
    pub reference: String,
    pub amount: serde_json::Number,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `{ "event": ..., "data": { "reference": ..., "amount": ..., ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    pub data: WebhookData,
}

impl WebhookEnvelope {
    pub fn parse(raw_body: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(raw_body)?)
    }

    pub fn kind(&self) -> WebhookEventKind {
        WebhookEventKind::from(self.event.as_str())
    }

    pub fn reference(&self) -> &str {
        &self.data.reference
    }

    /// Amount as sent by the provider, in the provider's own unit.
    pub fn raw_amount(&self) -> CoreResult<Decimal> {
        let text = self.data.amount.to_string();
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| CoreError::ValidationError(format!("bad webhook amount {}: {}", text, e)))
    }

    /// Amount in whole currency units.
    pub fn amount_for(&self, kind: ProviderKind) -> CoreResult<Decimal> {
        Ok(kind.webhook_amount_unit().to_major(self.raw_amount()?))
    }
}
