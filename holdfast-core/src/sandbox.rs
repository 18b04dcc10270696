//! In-process stand-in for a real payment provider.
//!
//! It keeps charges and payouts in memory, can be scripted to fail or stall,
//! and produces webhook bodies signed exactly like the provider it imitates.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::payment::{
    Bank, ChargeSession, ChargeStatus, ChargeVerification, PaymentProvider, PayoutReceipt,
    PayoutRequest, PayoutStatus, ProviderError, ProviderKind,
};
use crate::webhook::WebhookVerifier;
use crate::CoreResult;

#[derive(Default)]
struct SandboxState {
    fail_payouts: bool,
    fail_charges: bool,
    delay: Option<Duration>,
    charges: HashMap<String, ChargeVerification>,
    payouts: Vec<PayoutRequest>,
    payout_attempts: usize,
    accounts: HashMap<(String, String), String>,
}

pub struct SandboxProvider {
    kind: ProviderKind,
    verifier: WebhookVerifier,
    state: Mutex<SandboxState>,
}

impl SandboxProvider {
    pub fn new(kind: ProviderKind, webhook_secret: &str) -> Self {
        Self {
            kind,
            verifier: WebhookVerifier::for_provider(kind, webhook_secret.as_bytes().to_vec()),
            state: Mutex::new(SandboxState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        // a poisoned sandbox is still usable for inspection
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fail_payouts(&self, fail: bool) {
        self.state().fail_payouts = fail;
    }

    pub fn fail_charges(&self, fail: bool) {
        self.state().fail_charges = fail;
    }

    /// Every call sleeps this long first.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Accepted payouts, in order.
    pub fn payouts(&self) -> Vec<PayoutRequest> {
        self.state().payouts.clone()
    }

    /// Payout calls received, accepted or not.
    pub fn payout_attempts(&self) -> usize {
        self.state().payout_attempts
    }

    pub fn register_account(&self, account_number: &str, bank_code: &str, name: &str) {
        self.state()
            .accounts
            .insert((account_number.to_string(), bank_code.to_string()), name.to_string());
    }

    /// Simulates the payer completing a charge.
    pub fn settle_charge(&self, provider_ref: &str, amount: Decimal) {
        let cents = (amount * Decimal::ONE_HUNDRED).trunc().to_i64().unwrap_or_default();
        self.state().charges.insert(
            provider_ref.to_string(),
            ChargeVerification { status: ChargeStatus::Succeeded, amount_cents: cents },
        );
    }

    /// Builds a webhook body and its signature header value. `amount` is in
    /// whole units and converted to the provider's webhook unit.
    pub fn signed_webhook(&self, event: &str, reference: &str, amount: Decimal) -> CoreResult<(Vec<u8>, String)> {
        let wire_amount = self.kind.webhook_amount_unit().from_major(amount).normalize();
        let amount_value: serde_json::Value = match wire_amount.to_i64() {
            Some(whole) if wire_amount.fract().is_zero() => whole.into(),
            _ => serde_json::Value::from(wire_amount.to_f64().unwrap_or_default()),
        };
        let body = serde_json::json!({
            "event": event,
            "data": {
                "reference": reference,
                "amount": amount_value,
                "currency": "NGN",
                "status": if event.ends_with("success") { "success" } else { "failed" },
            }
        });
        let raw = serde_json::to_vec(&body)?;
        let signature = self.verifier.sign(&raw)?;
        Ok((raw, signature))
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    async fn pause(&self) {
        let delay = self.state().delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl PaymentProvider for SandboxProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn initialize_charge(&self, amount: Decimal, payer_email: &str) -> Result<ChargeSession, ProviderError> {
        self.pause().await;
        if self.state().fail_charges {
            return Err(ProviderError::Rejected("charge initialization declined".into()));
        }
        if amount <= Decimal::ZERO {
            return Err(ProviderError::Rejected(format!("invalid charge amount {}", amount)));
        }

        let provider_ref = format!("{}_chg_{}", self.kind.reference_prefix(), Uuid::new_v4().simple());
        self.state().charges.insert(
            provider_ref.clone(),
            ChargeVerification { status: ChargeStatus::Pending, amount_cents: 0 },
        );
        tracing::debug!(
            "Sandbox {} charge {} opened for {:?}",
            self.kind,
            provider_ref,
            holdfast_shared::Masked::from(payer_email)
        );

        Ok(ChargeSession {
            redirect_url: format!("https://sandbox.{}.test/checkout/{}", self.kind, provider_ref),
            provider_ref,
        })
    }

    async fn verify_charge(&self, provider_ref: &str) -> Result<ChargeVerification, ProviderError> {
        self.pause().await;
        self.state()
            .charges
            .get(provider_ref)
            .cloned()
            .ok_or_else(|| ProviderError::Rejected(format!("unknown charge {}", provider_ref)))
    }

    async fn payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt, ProviderError> {
        self.pause().await;
        let mut state = self.state();
        state.payout_attempts += 1;
        if state.fail_payouts {
            return Err(ProviderError::Rejected(format!("payout {} declined", request.reference)));
        }
        state.payouts.push(request.clone());

        Ok(PayoutReceipt {
            provider_ref: format!("trf_{}", Uuid::new_v4().simple()),
            status: PayoutStatus::Pending,
        })
    }

    async fn resolve_account(&self, account_number: &str, bank_code: &str) -> Result<String, ProviderError> {
        self.pause().await;
        self.state()
            .accounts
            .get(&(account_number.to_string(), bank_code.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::Rejected("account could not be resolved".into()))
    }

    async fn list_banks(&self) -> Result<Vec<Bank>, ProviderError> {
        Ok(vec![
            Bank { name: "Access Bank".into(), code: "044".into(), active: true },
            Bank { name: "First Bank of Nigeria".into(), code: "011".into(), active: true },
            Bank { name: "Guaranty Trust Bank".into(), code: "058".into(), active: true },
            Bank { name: "Heritage Bank".into(), code: "030".into(), active: false },
        ])
    }
}
