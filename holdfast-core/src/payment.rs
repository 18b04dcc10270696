use async_trait::async_trait;
use holdfast_shared::Masked;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::webhook::SignatureScheme;

/// Payment providers the marketplace can route money through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Paystack,
    Korapay,
}

/// Unit the provider reports amounts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountUnit {
    /// Whole currency units (naira).
    Major,
    /// Hundredths (kobo).
    Minor,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Paystack => "paystack",
            ProviderKind::Korapay => "korapay",
        }
    }

    /// Prefix for transfer references generated for this provider.
    pub fn reference_prefix(&self) -> &'static str {
        match self {
            ProviderKind::Paystack => "pk",
            ProviderKind::Korapay => "k",
        }
    }

    pub fn signature_header(&self) -> &'static str {
        match self {
            ProviderKind::Paystack => "x-paystack-signature",
            ProviderKind::Korapay => "x-korapay-signature",
        }
    }

    pub fn signature_scheme(&self) -> SignatureScheme {
        match self {
            ProviderKind::Paystack => SignatureScheme::HmacSha512RawBody,
            ProviderKind::Korapay => SignatureScheme::HmacSha256Data,
        }
    }

    /// Unit of the `amount` field in this provider's webhooks.
    pub fn webhook_amount_unit(&self) -> AmountUnit {
        match self {
            ProviderKind::Paystack => AmountUnit::Minor,
            ProviderKind::Korapay => AmountUnit::Major,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paystack" => Ok(ProviderKind::Paystack),
            "korapay" | "kora" => Ok(ProviderKind::Korapay),
            other => Err(ProviderError::Unsupported(other.to_string())),
        }
    }
}

impl AmountUnit {
    pub fn to_major(&self, amount: Decimal) -> Decimal {
        match self {
            AmountUnit::Major => amount,
            AmountUnit::Minor => amount / Decimal::ONE_HUNDRED,
        }
    }

    pub fn from_major(&self, amount: Decimal) -> Decimal {
        match self {
            AmountUnit::Major => amount,
            AmountUnit::Minor => amount * Decimal::ONE_HUNDRED,
        }
    }
}

/// Bank account money is paid out to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayoutAccount {
    pub account_name: String,
    pub account_number: Masked<String>,
    pub bank_code: String,
    pub email: Masked<String>,
    /// Provider-side recipient handle, when one has been registered.
    pub recipient_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeSession {
    pub provider_ref: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeStatus {
    Pending,
    Succeeded,
    Failed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeVerification {
    pub status: ChargeStatus,
    /// Amount collected, in hundredths of the currency unit.
    pub amount_cents: i64,
}

impl ChargeVerification {
    pub fn amount(&self) -> Decimal {
        Decimal::new(self.amount_cents, 2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    /// Amount in whole currency units.
    pub amount: Decimal,
    pub recipient: PayoutAccount,
    /// Our reference; providers echo it back in webhooks.
    pub reference: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl PayoutStatus {
    /// Whether the provider accepted the transfer for processing.
    pub fn accepted(&self) -> bool {
        !matches!(self, PayoutStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub provider_ref: String,
    pub status: PayoutStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bank {
    pub name: String,
    pub code: String,
    pub active: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider rejected request: {0}")]
    Rejected(String),
    #[error("Provider unreachable: {0}")]
    Unavailable(String),
    #[error("Provider call timed out after {0} ms")]
    Timeout(u64),
    #[error("Unsupported provider: {0}")]
    Unsupported(String),
}

/// Capability interface shared by the interchangeable payment providers.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Start collecting `amount` (whole units) from a payer.
    async fn initialize_charge(
        &self,
        amount: Decimal,
        payer_email: &str,
    ) -> Result<ChargeSession, ProviderError>;

    async fn verify_charge(&self, provider_ref: &str) -> Result<ChargeVerification, ProviderError>;

    async fn payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt, ProviderError>;

    /// Account holder name for a bank account.
    async fn resolve_account(
        &self,
        account_number: &str,
        bank_code: &str,
    ) -> Result<String, ProviderError>;

    async fn list_banks(&self) -> Result<Vec<Bank>, ProviderError>;
}
