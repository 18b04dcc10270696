//! Outbound money movement and webhook reconciliation.
//!
//! Transfers go to the ranked providers in order until one accepts. The
//! accepting provider and our reference are written to the key-value store as
//! a [`PendingTransfer`] before success is reported, and the provider's
//! webhook later consumes that record exactly once.

use chrono::{DateTime, Utc};
use holdfast_core::payment::{Bank, ChargeSession, ChargeVerification, PayoutRequest};
use holdfast_core::repository::{load_json, store_json};
use holdfast_core::{KeyValueStore, PaymentProvider, PayoutAccount, ProviderError, ProviderKind};
use holdfast_core::{WebhookEnvelope, WebhookEventKind, WebhookVerifier};
use holdfast_shared::models::events::TransferKind;
use holdfast_shared::EscrowEvent;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{EscrowError, EscrowResult};
use crate::locks::OrderLocks;
use crate::models::{ClosureReason, OrderAggregate, TransactionStatus};
use crate::repository::{commit, OrderRepository};
use crate::resiliency::CircuitBreaker;
use crate::timeline::TimelineCategory;

/// Side-table record linking our transfer reference to the order it settles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingTransfer {
    pub order_id: Uuid,
    pub kind: TransferKind,
    pub expected_amount: Decimal,
    pub provider: ProviderKind,
    pub reference: String,
    pub provider_ref: String,
    pub created_at: DateTime<Utc>,
}

/// In-flight payment collection, keyed by the provider's charge reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingCharge {
    pub order_id: Uuid,
    pub provider: ProviderKind,
    pub provider_ref: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferHandle {
    pub kind: TransferKind,
    pub reference: String,
    pub provider_ref: String,
    pub provider: ProviderKind,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub recipient: PayoutAccount,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied { order_id: Uuid, kind: TransferKind },
    /// The transfer was already recorded; the event is a replay.
    AlreadyApplied { order_id: Uuid, kind: TransferKind },
    /// Failure or reversal reported; nothing changes.
    Acknowledged { order_id: Uuid, kind: TransferKind },
    /// Success reported for a closed order; the ledger is left alone and the
    /// order is flagged for special attention.
    Flagged { order_id: Uuid, kind: TransferKind },
    /// No pending transfer matches, or the event is not about transfers.
    Ignored,
}

/// `pk_trans_full_…`, `k_trans_partial_…`, `pk_refund_…`
fn transfer_reference(provider: ProviderKind, kind: TransferKind) -> String {
    let id = Uuid::new_v4().simple();
    match kind {
        TransferKind::Refund => format!("{}_refund_{}", provider.reference_prefix(), id),
        _ => format!("{}_trans_{}_{}", provider.reference_prefix(), kind, id),
    }
}

pub fn transfer_key(reference: &str) -> String {
    format!("transfer:{}", reference)
}

pub fn charge_key(provider_ref: &str) -> String {
    format!("charge:{}", provider_ref)
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub provider_timeout: Duration,
    /// Name used as sender or receiver for escrow-held funds in history rows.
    pub holdings_name: String,
    pub charge_ttl: Duration,
    pub circuit_threshold: usize,
    pub circuit_reset: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(15),
            holdings_name: "Holdfast Escrow".to_string(),
            charge_ttl: Duration::from_secs(7 * 24 * 3600),
            circuit_threshold: 5,
            circuit_reset: Duration::from_secs(60),
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn PaymentProvider>,
    breaker: CircuitBreaker,
}

pub struct DisbursementCoordinator {
    ranking: Vec<ProviderSlot>,
    verifiers: HashMap<ProviderKind, WebhookVerifier>,
    kv: Arc<dyn KeyValueStore>,
    repo: Arc<dyn OrderRepository>,
    locks: Arc<OrderLocks>,
    events: broadcast::Sender<EscrowEvent>,
    settings: CoordinatorSettings,
}

impl DisbursementCoordinator {
    /// `ranking` is tried first to last.
    pub fn new(
        ranking: Vec<Arc<dyn PaymentProvider>>,
        kv: Arc<dyn KeyValueStore>,
        repo: Arc<dyn OrderRepository>,
        locks: Arc<OrderLocks>,
        events: broadcast::Sender<EscrowEvent>,
        settings: CoordinatorSettings,
    ) -> Self {
        let ranking = ranking
            .into_iter()
            .map(|provider| ProviderSlot {
                breaker: CircuitBreaker::new(provider.kind().as_str(), settings.circuit_threshold, settings.circuit_reset),
                provider,
            })
            .collect();
        Self {
            ranking,
            verifiers: HashMap::new(),
            kv,
            repo,
            locks,
            events,
            settings,
        }
    }

    pub fn with_verifier(mut self, kind: ProviderKind, verifier: WebhookVerifier) -> Self {
        self.verifiers.insert(kind, verifier);
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn events(&self) -> &broadcast::Sender<EscrowEvent> {
        &self.events
    }

    pub fn locks(&self) -> &Arc<OrderLocks> {
        &self.locks
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        self.ranking.iter().map(|s| s.provider.kind()).collect()
    }

    async fn call<T, F>(&self, slot: &ProviderSlot, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let result = match tokio::time::timeout(self.settings.provider_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ProviderError::Timeout(self.settings.provider_timeout.as_millis() as u64)),
        };
        match &result {
            Ok(_) => slot.breaker.record_success().await,
            Err(_) => slot.breaker.record_failure().await,
        }
        result
    }

    fn slot(&self, kind: ProviderKind) -> EscrowResult<&ProviderSlot> {
        self.ranking
            .iter()
            .find(|s| s.provider.kind() == kind)
            .ok_or_else(|| EscrowError::ProviderFailure(format!("provider {} is not configured", kind)))
    }

    /// Sends a payout through the first provider that accepts it.
    ///
    /// The pending transfer is stored before this returns `Ok`. If every
    /// provider fails, nothing is stored and the failures are reported.
    pub async fn initiate(&self, request: &TransferRequest) -> EscrowResult<TransferHandle> {
        if request.amount <= Decimal::ZERO {
            return Err(EscrowError::Validation(format!("cannot transfer {}", request.amount)));
        }
        let mut failures = Vec::new();

        for slot in &self.ranking {
            let kind = slot.provider.kind();
            if !slot.breaker.check().await {
                tracing::warn!("Skipping {} for {} transfer: circuit open", kind, request.kind);
                failures.push(format!("{}: circuit open", kind));
                continue;
            }

            let payout = PayoutRequest {
                amount: request.amount,
                recipient: request.recipient.clone(),
                reference: transfer_reference(kind, request.kind),
                reason: request.reason.clone(),
            };

            match self.call(slot, slot.provider.payout(&payout)).await {
                Ok(receipt) if receipt.status.accepted() => {
                    let pending = PendingTransfer {
                        order_id: request.order_id,
                        kind: request.kind,
                        expected_amount: request.amount,
                        provider: kind,
                        reference: payout.reference.clone(),
                        provider_ref: receipt.provider_ref.clone(),
                        created_at: Utc::now(),
                    };
                    if let Err(e) = store_json(self.kv.as_ref(), &transfer_key(&payout.reference), &pending, None).await {
                        tracing::error!(
                            "{} accepted transfer {} for order {} but it could not be recorded: {}",
                            kind,
                            payout.reference,
                            request.order_id,
                            e
                        );
                        return Err(e.into());
                    }
                    tracing::info!(
                        "{} transfer {} of {} for order {} accepted by {}",
                        request.kind,
                        payout.reference,
                        request.amount,
                        request.order_id,
                        kind
                    );
                    return Ok(TransferHandle {
                        kind: request.kind,
                        reference: payout.reference,
                        provider_ref: receipt.provider_ref,
                        provider: kind,
                        amount: request.amount,
                    });
                }
                Ok(receipt) => {
                    tracing::warn!("{} declined transfer {} with status {:?}", kind, payout.reference, receipt.status);
                    failures.push(format!("{}: status {:?}", kind, receipt.status));
                }
                Err(e) => {
                    tracing::warn!("{} transfer via {} failed, trying next provider: {}", request.kind, kind, e);
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }

        tracing::error!("All providers failed {} transfer for order {}", request.kind, request.order_id);
        Err(EscrowError::ProviderFailure(failures.join("; ")))
    }

    /// Opens a charge with the first provider that accepts it and remembers
    /// it until the payment is verified.
    pub async fn initialize_charge(
        &self,
        order_id: Uuid,
        amount: Decimal,
        payer_email: &str,
    ) -> EscrowResult<(ChargeSession, ProviderKind)> {
        let mut failures = Vec::new();
        for slot in &self.ranking {
            let kind = slot.provider.kind();
            if !slot.breaker.check().await {
                failures.push(format!("{}: circuit open", kind));
                continue;
            }
            match self.call(slot, slot.provider.initialize_charge(amount, payer_email)).await {
                Ok(session) => {
                    let pending = PendingCharge {
                        order_id,
                        provider: kind,
                        provider_ref: session.provider_ref.clone(),
                        amount,
                        created_at: Utc::now(),
                    };
                    store_json(
                        self.kv.as_ref(),
                        &charge_key(&session.provider_ref),
                        &pending,
                        Some(self.settings.charge_ttl),
                    )
                    .await?;
                    return Ok((session, kind));
                }
                Err(e) => {
                    tracing::warn!("Charge initialization via {} failed: {}", kind, e);
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }
        Err(EscrowError::ProviderFailure(failures.join("; ")))
    }

    pub async fn pending_charge(&self, provider_ref: &str) -> EscrowResult<Option<PendingCharge>> {
        Ok(load_json(self.kv.as_ref(), &charge_key(provider_ref)).await?)
    }

    /// Asks the provider that opened the charge how much was collected.
    pub async fn verify_charge(&self, charge: &PendingCharge) -> EscrowResult<ChargeVerification> {
        let slot = self.slot(charge.provider)?;
        self.call(slot, slot.provider.verify_charge(&charge.provider_ref))
            .await
            .map_err(|e| EscrowError::ProviderFailure(format!("{}: {}", charge.provider, e)))
    }

    pub async fn consume_charge(&self, provider_ref: &str) -> EscrowResult<bool> {
        Ok(self.kv.delete(&charge_key(provider_ref)).await?)
    }

    pub async fn resolve_account(&self, account_number: &str, bank_code: &str) -> EscrowResult<String> {
        let mut failures = Vec::new();
        for slot in &self.ranking {
            match self.call(slot, slot.provider.resolve_account(account_number, bank_code)).await {
                Ok(name) => return Ok(name),
                Err(e) => failures.push(format!("{}: {}", slot.provider.kind(), e)),
            }
        }
        Err(EscrowError::ProviderFailure(failures.join("; ")))
    }

    pub async fn list_banks(&self) -> EscrowResult<Vec<Bank>> {
        let mut failures = Vec::new();
        for slot in &self.ranking {
            match self.call(slot, slot.provider.list_banks()).await {
                Ok(banks) => return Ok(banks),
                Err(e) => failures.push(format!("{}: {}", slot.provider.kind(), e)),
            }
        }
        Err(EscrowError::ProviderFailure(failures.join("; ")))
    }

    pub async fn pending_transfer(&self, reference: &str) -> EscrowResult<Option<PendingTransfer>> {
        Ok(load_json(self.kv.as_ref(), &transfer_key(reference)).await?)
    }

    /// Applies a provider webhook at most once.
    ///
    /// `provider` is the endpoint the webhook arrived on. Events with no
    /// pending transfer are ignored unverified since they change nothing. For
    /// the rest the signature is checked with the secret of the provider that
    /// accepted the transfer, so a webhook on the wrong endpoint is rejected
    /// like a forged one.
    pub async fn reconcile(&self, provider: ProviderKind, raw_body: &[u8], signature: &str) -> EscrowResult<ReconcileOutcome> {
        let envelope = WebhookEnvelope::parse(raw_body)
            .map_err(|e| EscrowError::Validation(format!("malformed webhook: {}", e)))?;
        let event = envelope.kind();
        if !matches!(
            event,
            WebhookEventKind::TransferSuccess | WebhookEventKind::TransferFailed | WebhookEventKind::TransferReversed
        ) {
            tracing::debug!("Ignoring {} webhook event {}", provider, envelope.event);
            return Ok(ReconcileOutcome::Ignored);
        }

        let reference = envelope.reference().to_string();
        let Some(peek) = self.pending_transfer(&reference).await? else {
            tracing::warn!("No pending transfer for {} reference {}, ignoring", provider, reference);
            return Ok(ReconcileOutcome::Ignored);
        };
        let _guard = self.locks.acquire(peek.order_id).await;

        // a concurrent duplicate may have consumed it while we waited
        let Some(pending) = self.pending_transfer(&reference).await? else {
            return Ok(ReconcileOutcome::Ignored);
        };

        if pending.provider != provider {
            tracing::warn!(
                "Webhook for {} transfer {} arrived on the {} endpoint",
                pending.provider,
                reference,
                provider
            );
            return Err(EscrowError::InvalidSignature);
        }
        let verifier = self
            .verifiers
            .get(&pending.provider)
            .ok_or(EscrowError::InvalidSignature)?;
        if !verifier.verify(raw_body, signature) {
            tracing::warn!("Rejected {} webhook for {}: bad signature", provider, reference);
            return Err(EscrowError::InvalidSignature);
        }

        let mut agg = self
            .repo
            .load(pending.order_id)
            .await?
            .ok_or_else(|| EscrowError::DataInconsistency(format!("pending transfer {} points at missing order", reference)))?;

        if event != WebhookEventKind::TransferSuccess {
            tracing::warn!(
                "{} {} transfer {} for order {} reported {}; leaving order unchanged",
                pending.provider,
                pending.kind,
                reference,
                agg.reference(),
                envelope.event
            );
            return Ok(ReconcileOutcome::Acknowledged { order_id: pending.order_id, kind: pending.kind });
        }

        if agg.order.disbursement.get(pending.kind).dispatched() {
            self.kv.delete(&transfer_key(&reference)).await?;
            tracing::info!("Transfer {} already applied to order {}", reference, agg.reference());
            return Ok(ReconcileOutcome::AlreadyApplied { order_id: pending.order_id, kind: pending.kind });
        }

        let amount = envelope.amount_for(pending.provider)?;
        if agg.order.is_closed() {
            let problem = format!(
                "{} transfer {} of {} confirmed after order {} closed",
                pending.kind,
                reference,
                amount,
                agg.reference()
            );
            tracing::error!("{}", problem);
            let now = Utc::now();
            agg.order.flag_special_attention(problem.clone(), now);
            agg.record(TimelineCategory::DataInconsistency, problem, now);
            commit(self.repo.as_ref(), &self.events, &mut agg).await?;
            self.kv.delete(&transfer_key(&reference)).await?;
            return Ok(ReconcileOutcome::Flagged { order_id: pending.order_id, kind: pending.kind });
        }

        if amount != pending.expected_amount {
            tracing::warn!(
                "Transfer {} settled {} but {} was expected",
                reference,
                amount,
                pending.expected_amount
            );
        }

        self.apply_dispatch(&mut agg, &pending, amount, Utc::now());
        commit(self.repo.as_ref(), &self.events, &mut agg).await?;

        if let Err(e) = self.kv.delete(&transfer_key(&reference)).await {
            // a replay will find the transfer dispatched and clean up
            tracing::warn!("Could not remove pending transfer {}: {}", reference, e);
        }
        tracing::info!("Applied {} transfer {} to order {}", pending.kind, reference, agg.reference());
        Ok(ReconcileOutcome::Applied { order_id: pending.order_id, kind: pending.kind })
    }

    fn apply_dispatch(&self, agg: &mut OrderAggregate, pending: &PendingTransfer, amount: Decimal, now: DateTime<Utc>) {
        let holdings = self.settings.holdings_name.clone();
        let transfer = agg.order.disbursement.get_mut(pending.kind);
        if !transfer.initiated() {
            tracing::warn!(
                "Transfer {} confirmed before order {} recorded its initiation",
                pending.reference,
                agg.order.reference
            );
        }
        transfer.mark_dispatched(now, &pending.reference, pending.provider, amount);

        let amounts = &mut agg.order.amounts;
        let drawn = |value: Decimal| (value - amount).max(Decimal::ZERO);
        match pending.kind {
            TransferKind::Partial => {
                amounts.amount_partially_disbursed += amount;
                amounts.amount_remaining_to_be_disbursed = drawn(amounts.amount_remaining_to_be_disbursed);
                amounts.total_amount_disbursed += amount;
            }
            TransferKind::Full => {
                amounts.amount_remaining_to_be_disbursed = drawn(amounts.amount_remaining_to_be_disbursed);
                amounts.total_amount_disbursed += amount;
            }
            TransferKind::Refund => {
                amounts.amount_refunded += amount;
            }
        }
        amounts.current_holdings = drawn(amounts.current_holdings);

        let (receiver, category, description) = match pending.kind {
            TransferKind::Refund => (
                agg.customer_name(),
                TimelineCategory::Refund,
                format!("Refund of {} for order {} sent to buyer", amount, agg.order.reference),
            ),
            TransferKind::Partial => (
                agg.order.seller_account.account_name.clone(),
                TimelineCategory::DisbursementVerification,
                format!("Partial disbursement of {} for order {} sent to seller", amount, agg.order.reference),
            ),
            TransferKind::Full => (
                agg.order.seller_account.account_name.clone(),
                TimelineCategory::DisbursementVerification,
                format!("Disbursement of {} for order {} sent to seller", amount, agg.order.reference),
            ),
        };
        agg.add_history(amount, TransactionStatus::Success, pending.reference.clone(), holdings, receiver, description.clone(), now);
        agg.record(category, description, now);
        agg.publish(EscrowEvent::TransferDispatched {
            order_id: agg.id(),
            kind: pending.kind,
            reference: pending.reference.clone(),
            amount,
            timestamp: now,
        });

        let closing = match pending.kind {
            TransferKind::Full => Some(ClosureReason::SellerPaid),
            TransferKind::Refund => Some(ClosureReason::Refunded),
            TransferKind::Partial => None,
        };
        if let Some(reason) = closing {
            if agg.order.close(reason, now) {
                agg.record(TimelineCategory::OrderClose, format!("Order {} closed", agg.order.reference), now);
                agg.publish(EscrowEvent::OrderClosed {
                    order_id: agg.id(),
                    reason: reason.as_str().to_string(),
                    timestamp: now,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryOrderRepository;
    use crate::testing::sample_aggregate;
    use holdfast_core::sandbox::SandboxProvider;
    use holdfast_core::MemoryKeyValueStore;
    use rust_decimal_macros::dec;

    struct Fixture {
        coordinator: DisbursementCoordinator,
        paystack: Arc<SandboxProvider>,
        korapay: Arc<SandboxProvider>,
        kv: Arc<MemoryKeyValueStore>,
        repo: Arc<MemoryOrderRepository>,
    }

    fn fixture() -> Fixture {
        let paystack = Arc::new(SandboxProvider::new(ProviderKind::Paystack, "pk-secret"));
        let korapay = Arc::new(SandboxProvider::new(ProviderKind::Korapay, "kora-secret"));
        let kv = Arc::new(MemoryKeyValueStore::new());
        let repo = Arc::new(MemoryOrderRepository::new());
        let (events, _) = broadcast::channel(16);
        let coordinator = DisbursementCoordinator::new(
            vec![paystack.clone(), korapay.clone()],
            kv.clone(),
            repo.clone(),
            Arc::new(OrderLocks::default()),
            events,
            CoordinatorSettings::default(),
        )
        .with_verifier(ProviderKind::Paystack, paystack.verifier().clone())
        .with_verifier(ProviderKind::Korapay, korapay.verifier().clone());
        Fixture { coordinator, paystack, korapay, kv, repo }
    }

    fn request(order_id: Uuid, kind: TransferKind, amount: Decimal) -> TransferRequest {
        TransferRequest {
            kind,
            order_id,
            amount,
            recipient: crate::testing::seller_account(),
            reason: "test payout".into(),
        }
    }

    #[tokio::test]
    async fn test_primary_handles_transfer() {
        let f = fixture();
        let order_id = Uuid::new_v4();
        let handle = f.coordinator.initiate(&request(order_id, TransferKind::Full, dec!(1000))).await.unwrap();

        assert_eq!(handle.provider, ProviderKind::Paystack);
        assert!(handle.reference.starts_with("pk_trans_full_"));
        let pending = f.coordinator.pending_transfer(&handle.reference).await.unwrap().unwrap();
        assert_eq!(pending.order_id, order_id);
        assert_eq!(pending.expected_amount, dec!(1000));
        assert_eq!(pending.provider, ProviderKind::Paystack);
        assert_eq!(f.korapay.payout_attempts(), 0);
    }

    #[tokio::test]
    async fn test_fallback_gets_equivalent_payload() {
        let f = fixture();
        f.paystack.fail_payouts(true);
        let handle = f
            .coordinator
            .initiate(&request(Uuid::new_v4(), TransferKind::Partial, dec!(2500)))
            .await
            .unwrap();

        assert_eq!(handle.provider, ProviderKind::Korapay);
        assert!(handle.reference.starts_with("k_trans_partial_"));
        let sent = f.korapay.payouts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].amount, dec!(2500));
        assert_eq!(sent[0].reason, "test payout");
        assert_eq!(sent[0].recipient, crate::testing::seller_account());
    }

    #[tokio::test]
    async fn test_both_providers_fail_stores_nothing() {
        let f = fixture();
        f.paystack.fail_payouts(true);
        f.korapay.fail_payouts(true);

        let err = f
            .coordinator
            .initiate(&request(Uuid::new_v4(), TransferKind::Refund, dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::ProviderFailure(_)));
        assert_eq!(f.kv.len().await, 0);
    }

    #[tokio::test]
    async fn test_slow_primary_times_out_to_fallback() {
        let paystack = Arc::new(SandboxProvider::new(ProviderKind::Paystack, "a"));
        let korapay = Arc::new(SandboxProvider::new(ProviderKind::Korapay, "b"));
        paystack.set_delay(Some(Duration::from_millis(200)));
        let (events, _) = broadcast::channel(4);
        let coordinator = DisbursementCoordinator::new(
            vec![paystack, korapay.clone()],
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryOrderRepository::new()),
            Arc::new(OrderLocks::default()),
            events,
            CoordinatorSettings { provider_timeout: Duration::from_millis(20), ..Default::default() },
        );

        let handle = coordinator.initiate(&request(Uuid::new_v4(), TransferKind::Full, dec!(5))).await.unwrap();
        assert_eq!(handle.provider, ProviderKind::Korapay);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_ignored() {
        let f = fixture();
        let (body, sig) = f.paystack.signed_webhook("transfer.success", "pk_trans_full_nope", dec!(1)).unwrap();
        let outcome = f.coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_bad_signature_changes_nothing() {
        let f = fixture();
        let mut agg = sample_aggregate();
        f.repo.insert(&mut agg).await.unwrap();
        let handle = f.coordinator.initiate(&request(agg.id(), TransferKind::Partial, dec!(100))).await.unwrap();

        let (body, _) = f.paystack.signed_webhook("transfer.success", &handle.reference, dec!(100)).unwrap();
        let err = f.coordinator.reconcile(ProviderKind::Paystack, &body, "deadbeef").await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidSignature));

        let stored = f.repo.load(agg.id()).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(f.coordinator.pending_transfer(&handle.reference).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_endpoint_rejected() {
        let f = fixture();
        let mut agg = sample_aggregate();
        f.repo.insert(&mut agg).await.unwrap();
        let handle = f.coordinator.initiate(&request(agg.id(), TransferKind::Partial, dec!(100))).await.unwrap();

        let (body, sig) = f.korapay.signed_webhook("transfer.success", &handle.reference, dec!(100)).unwrap();
        let err = f.coordinator.reconcile(ProviderKind::Korapay, &body, &sig).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidSignature));
    }

    #[tokio::test]
    async fn test_failure_event_is_acknowledged_without_change() {
        let f = fixture();
        let mut agg = sample_aggregate();
        f.repo.insert(&mut agg).await.unwrap();
        let handle = f.coordinator.initiate(&request(agg.id(), TransferKind::Partial, dec!(100))).await.unwrap();

        let (body, sig) = f.paystack.signed_webhook("transfer.failed", &handle.reference, dec!(100)).unwrap();
        let outcome = f.coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Acknowledged { kind: TransferKind::Partial, .. }));
        assert_eq!(f.repo.load(agg.id()).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_partial_dispatch_applies_once() {
        let f = fixture();
        let mut agg = sample_aggregate();
        agg.order.amounts.current_holdings = dec!(83080);
        f.repo.insert(&mut agg).await.unwrap();
        let handle = f.coordinator.initiate(&request(agg.id(), TransferKind::Partial, dec!(20000))).await.unwrap();

        let (body, sig) = f.paystack.signed_webhook("transfer.success", &handle.reference, dec!(20000)).unwrap();
        let first = f.coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
        let second = f.coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Applied { .. }));
        assert_eq!(second, ReconcileOutcome::Ignored);

        let stored = f.repo.load(agg.id()).await.unwrap().unwrap();
        assert!(stored.order.disbursement.partial.dispatched());
        assert_eq!(stored.order.amounts.amount_partially_disbursed, dec!(20000));
        assert_eq!(stored.order.amounts.amount_remaining_to_be_disbursed, dec!(60000));
        assert_eq!(stored.order.amounts.current_holdings, dec!(63080));
        assert_eq!(stored.history.len(), 1);
        assert!(!stored.order.is_closed());
    }

    #[tokio::test]
    async fn test_success_on_closed_order_is_flagged() {
        let f = fixture();
        let mut agg = sample_aggregate();
        agg.order.amounts.current_holdings = dec!(83080);
        agg.order.close(ClosureReason::AutoCredited, Utc::now());
        f.repo.insert(&mut agg).await.unwrap();
        let handle = f.coordinator.initiate(&request(agg.id(), TransferKind::Partial, dec!(20000))).await.unwrap();

        let (body, sig) = f.paystack.signed_webhook("transfer.success", &handle.reference, dec!(20000)).unwrap();
        let outcome = f.coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Flagged { kind: TransferKind::Partial, .. }));

        let stored = f.repo.load(agg.id()).await.unwrap().unwrap();
        assert!(!stored.order.disbursement.partial.dispatched());
        assert_eq!(stored.order.amounts.amount_partially_disbursed, Decimal::ZERO);
        assert_eq!(stored.order.amounts.current_holdings, dec!(83080));
        assert!(stored.history.is_empty());
        assert!(stored.order.special_attention.is_some());
        assert_eq!(stored.timeline.count(TimelineCategory::DataInconsistency), 1);

        let replay = f.coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
        assert_eq!(replay, ReconcileOutcome::Ignored);
    }
}
