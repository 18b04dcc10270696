use chrono::{DateTime, Utc};
use holdfast_core::payment::{Bank, ChargeStatus};
use holdfast_core::{FeeQuote, FeeSchedule, PayoutAccount, ProviderKind};
use holdfast_shared::models::events::TransferKind;
use holdfast_shared::{EscrowEvent, Masked};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::conditions::{partial_requisites_met, ConditionLedger};
use crate::disbursement::{DisbursementCoordinator, TransferHandle, TransferRequest};
use crate::error::{EscrowError, EscrowResult};
use crate::models::{
    Condition, ConditionDraft, Customer, DeliveryPhase, DisbursementPhase, DisputePhase, InspectionPhase, Order,
    OrderAggregate, OrderAmounts, PaymentPhase, ProductDetails, Rating, TransactionRecord, TransactionStatus,
};
use crate::repository::{commit, OrderRepository};
use crate::timeline::{TimelineCategory, TimelineEntry};

const REFERENCE_LEN: usize = 21;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub merchant_id: String,
    pub customer: Customer,
    pub product: ProductDetails,
    pub product_amount: Decimal,
    pub seller_account: PayoutAccount,
    /// Amount released early when partial disbursement is wanted.
    pub partial_disbursement: Option<Decimal>,
    pub delivery_days: u32,
    pub inspection_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub provider: ProviderKind,
    pub provider_ref: String,
    pub redirect_url: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub amount: Decimal,
    pub amount_paid: Decimal,
    pub amount_to_balance: Decimal,
    pub fully_paid: bool,
}

pub struct LifecycleEngine {
    pub(crate) repo: Arc<dyn OrderRepository>,
    pub(crate) coordinator: Arc<DisbursementCoordinator>,
    pub(crate) fees: FeeSchedule,
    pub(crate) events: broadcast::Sender<EscrowEvent>,
}

impl LifecycleEngine {
    pub fn new(repo: Arc<dyn OrderRepository>, coordinator: Arc<DisbursementCoordinator>, fees: FeeSchedule) -> Self {
        let events = coordinator.events().clone();
        Self { repo, coordinator, fees, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.events.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<DisbursementCoordinator> {
        &self.coordinator
    }

    pub fn repository(&self) -> &Arc<dyn OrderRepository> {
        &self.repo
    }

    pub fn quote(&self, price: Decimal) -> EscrowResult<FeeQuote> {
        Ok(self.fees.fees(price)?)
    }

    pub(crate) async fn load(&self, reference: &str) -> EscrowResult<OrderAggregate> {
        self.repo
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("order {}", reference)))
    }

    pub(crate) async fn load_id(&self, id: Uuid) -> EscrowResult<OrderAggregate> {
        self.repo
            .load(id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("order {}", id)))
    }

    /// One unit of work: load, apply `op`, commit. Nothing is written if `op`
    /// or the commit fails.
    pub(crate) async fn mutate<T, F>(&self, reference: &str, op: F) -> EscrowResult<T>
    where
        F: FnOnce(&mut OrderAggregate, DateTime<Utc>) -> EscrowResult<T>,
    {
        let mut agg = self.load(reference).await?;
        let out = op(&mut agg, Utc::now())?;
        commit(self.repo.as_ref(), &self.events, &mut agg).await?;
        Ok(out)
    }

    pub async fn initialize_order(&self, new: NewOrder) -> EscrowResult<OrderAggregate> {
        validate_new_order(&new)?;
        let quote = self.fees.fees(new.product_amount)?;
        let now = Utc::now();
        let amount_to_pay = new.product_amount + quote.total_fees();

        let mut customer = new.customer;
        customer.email = Masked(customer.email.expose().trim().to_lowercase());

        let order = Order {
            id: Uuid::new_v4(),
            reference: generate_reference(),
            merchant_id: new.merchant_id,
            customer,
            product: new.product,
            seller_account: new.seller_account,
            amounts: OrderAmounts {
                product_amount: new.product_amount,
                escrow_fee: quote.escrow_fee,
                process_fee: quote.process_fee,
                escrow_percent: quote.escrow_percent,
                amount_to_pay,
                amount_paid: Decimal::ZERO,
                amount_to_balance: amount_to_pay,
                amount_overflow: Decimal::ZERO,
                current_holdings: Decimal::ZERO,
                amount_to_partially_disburse: new.partial_disbursement.unwrap_or_default(),
                amount_partially_disbursed: Decimal::ZERO,
                amount_remaining_to_be_disbursed: new.product_amount,
                total_amount_disbursed: Decimal::ZERO,
                amount_refunded: Decimal::ZERO,
            },
            payment: PaymentPhase::default(),
            delivery: DeliveryPhase { delivery_days: new.delivery_days, ..Default::default() },
            inspection: InspectionPhase { inspection_days: new.inspection_days, ..Default::default() },
            dispute: DisputePhase::None,
            disbursement: DisbursementPhase {
                partial_enabled: new.partial_disbursement.is_some(),
                ..Default::default()
            },
            special_attention: None,
            closure: None,
            created_at: now,
            updated_at: now,
        };

        let mut agg = OrderAggregate::new(order);
        let event = format!("Order successfully created with reference {}", agg.reference());
        agg.record(TimelineCategory::OrderCreation, event, now);
        self.repo.insert(&mut agg).await?;
        let _ = self.events.send(EscrowEvent::OrderCreated {
            order_id: agg.id(),
            reference: agg.reference().to_string(),
            merchant_id: agg.order.merchant_id.clone(),
            amount_to_pay,
            timestamp: now,
        });

        tracing::info!("Order {} created, {} to pay", agg.reference(), amount_to_pay);
        Ok(agg)
    }

    pub async fn get_order(&self, reference: &str) -> EscrowResult<OrderAggregate> {
        self.load(reference).await
    }

    pub async fn list_orders(&self, merchant_id: &str) -> EscrowResult<Vec<OrderAggregate>> {
        Ok(self.repo.list_for_merchant(merchant_id).await?)
    }

    pub async fn conditions(&self, reference: &str) -> EscrowResult<Vec<Condition>> {
        Ok(self.load(reference).await?.conditions)
    }

    pub async fn history(&self, reference: &str) -> EscrowResult<Vec<TransactionRecord>> {
        Ok(self.load(reference).await?.history)
    }

    pub async fn timeline(&self, reference: &str) -> EscrowResult<Vec<TimelineEntry>> {
        Ok(self.load(reference).await?.timeline.entries().to_vec())
    }

    pub async fn set_conditions(&self, reference: &str, drafts: Vec<ConditionDraft>) -> EscrowResult<Vec<Condition>> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            let ids = ConditionLedger::new(agg).set_conditions(drafts, now)?;
            tracing::info!("{} conditions set on order {}", ids.len(), agg.reference());
            Ok(agg.conditions.iter().filter(|c| ids.contains(&c.id)).cloned().collect())
        })
        .await
    }

    /// Opens a charge for the outstanding balance.
    pub async fn initiate_payment(&self, reference: &str) -> EscrowResult<PaymentSession> {
        let agg = self.load(reference).await?;
        check_payment_open(&agg)?;
        let amount = agg.order.amounts.amount_to_balance;
        let email = agg.order.customer.email.expose().clone();

        let (session, provider) = self.coordinator.initialize_charge(agg.id(), amount, &email).await?;

        self.mutate(reference, |agg, now| {
            check_payment_open(agg)?;
            if agg.order.payment.initiated_at.is_none() {
                agg.order.payment.initiated_at = Some(now);
            }
            agg.record(
                TimelineCategory::DepositInitiation,
                format!("Payment of {} initiated with {} ({})", amount, provider, session.provider_ref),
                now,
            );
            Ok(())
        })
        .await?;

        Ok(PaymentSession {
            provider,
            provider_ref: session.provider_ref,
            redirect_url: session.redirect_url,
            amount,
        })
    }

    /// Applies a completed charge to the order exactly once.
    pub async fn verify_payment(&self, reference: &str, provider_ref: &str) -> EscrowResult<PaymentReceipt> {
        let history_ref = format!("charge_{}", provider_ref);
        let agg = self.load(reference).await?;
        let _guard = self.coordinator.locks().acquire(agg.id()).await;
        let mut agg = self.load_id(agg.id()).await?;

        if agg.has_history_reference(&history_ref) {
            return Err(EscrowError::already(format!("charge {} has already been applied", provider_ref)));
        }
        ensure_open(&agg)?;
        if agg.order.payment.fully_verified() {
            return Err(EscrowError::already("full payment has already been verified"));
        }
        let charge = self
            .coordinator
            .pending_charge(provider_ref)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("pending charge {}", provider_ref)))?;
        if charge.order_id != agg.id() {
            return Err(EscrowError::Validation(format!("charge {} belongs to another order", provider_ref)));
        }

        let verification = self.coordinator.verify_charge(&charge).await?;
        if verification.status != ChargeStatus::Succeeded {
            return Err(EscrowError::precondition(format!(
                "charge {} is {:?}",
                provider_ref, verification.status
            )));
        }
        let amount = verification.amount();
        if amount <= Decimal::ZERO {
            return Err(EscrowError::Validation(format!("charge {} collected nothing", provider_ref)));
        }

        let now = Utc::now();
        let receipt = apply_payment(&mut agg, amount, &history_ref, self.coordinator.settings().holdings_name.clone(), now);
        commit(self.repo.as_ref(), &self.events, &mut agg).await?;

        if let Err(e) = self.coordinator.consume_charge(provider_ref).await {
            tracing::warn!("Could not clear pending charge {}: {}", provider_ref, e);
        }
        tracing::info!(
            "Payment of {} verified on order {} ({} outstanding)",
            amount,
            agg.reference(),
            receipt.amount_to_balance
        );
        Ok(receipt)
    }

    pub async fn confirm_sent_out(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            if !agg.order.payment.fully_verified() {
                return Err(EscrowError::precondition("payment has not been completed"));
            }
            if agg.order.delivery.sent_out() {
                return Err(EscrowError::already(format!("order {} has already been sent out", agg.reference())));
            }
            agg.order.delivery.shipment.begin(now);
            let event = format!("Order {} has been sent out for delivery", agg.reference());
            agg.record(TimelineCategory::DeliverySendout, event, now);
            Ok(())
        })
        .await
    }

    pub async fn seller_confirm_delivery(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            if !agg.order.delivery.sent_out() {
                return Err(EscrowError::precondition("product has not been sent out"));
            }
            if agg.order.delivery.seller_confirmed() {
                return Err(EscrowError::already("delivery has already been confirmed by the seller"));
            }
            agg.order.delivery.seller_confirmed_at = Some(now);
            let event = format!("Order {} confirmed as delivered by the seller", agg.reference());
            agg.record(TimelineCategory::DeliveryVerification, event, now);
            agg.publish(EscrowEvent::DeliveryConfirmed { order_id: agg.id(), by_buyer: false, timestamp: now });
            Ok(())
        })
        .await
    }

    /// Buyer receipt. Starts the inspection clock.
    pub async fn buyer_confirm_delivery(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            if !agg.order.delivery.sent_out() {
                return Err(EscrowError::precondition("product has not been sent out"));
            }
            if agg.order.delivery.buyer_confirmed() {
                return Err(EscrowError::already("delivery has already been confirmed by the buyer"));
            }
            agg.order.delivery.shipment.complete(now);
            let event = format!("Order {} confirmed as delivered by the buyer, inspection time started", agg.reference());
            agg.record(TimelineCategory::DeliveryVerification, event, now);
            agg.publish(EscrowEvent::DeliveryConfirmed { order_id: agg.id(), by_buyer: true, timestamp: now });
            Ok(())
        })
        .await
    }

    pub async fn mark_condition_met(&self, reference: &str, condition_id: Uuid) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            check_inspectable(agg)?;
            let condition = agg
                .condition(condition_id)
                .ok_or_else(|| EscrowError::NotFound(format!("condition {}", condition_id)))?;
            if condition.dispute_id.is_some() && !condition.dispute_settled {
                return Err(EscrowError::precondition(format!("condition {} is under dispute", condition_id)));
            }
            ConditionLedger::new(agg).mark_met(condition_id, now)?;
            mark_inspected(agg, now);
            Ok(())
        })
        .await
    }

    pub async fn mark_all_conditions_met(&self, reference: &str) -> EscrowResult<usize> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            check_inspectable(agg)?;
            if agg.order.dispute.ongoing() {
                return Err(EscrowError::precondition("a dispute is ongoing"));
            }
            let changed = ConditionLedger::new(agg).mark_all_met(now)?;
            mark_inspected(agg, now);
            Ok(changed)
        })
        .await
    }

    /// Succeeds when every condition is met, recording it if that has not
    /// happened yet.
    pub async fn verify_conditions_met(&self, reference: &str) -> EscrowResult<()> {
        let agg = self.load(reference).await?;
        if agg.order.inspection.conditions_met() {
            return Ok(());
        }
        self.mutate(reference, |agg, now| {
            let mut ledger = ConditionLedger::new(agg);
            if !ledger.all_met() {
                return Err(EscrowError::precondition("not every condition has been met"));
            }
            ledger.refresh(now);
            agg.record(TimelineCategory::ConditionConfirmation, "All conditions have been met and verified", now);
            Ok(())
        })
        .await
    }

    pub async fn approve_partial_disbursement(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            if !agg.order.disbursement.partial_enabled {
                return Err(EscrowError::precondition("order does not use partial disbursements"));
            }
            if agg.order.disbursement.partial.approved() {
                return Err(EscrowError::already("partial disbursement has already been approved"));
            }
            partial_disbursement_gate(agg)?;
            agg.order.disbursement.partial.approve(now);
            let event = format!("Partial disbursement for order {} ready for initiation", agg.reference());
            agg.record(TimelineCategory::DisbursementApproval, event, now);
            Ok(())
        })
        .await
    }

    pub async fn initiate_partial_disbursement(&self, reference: &str) -> EscrowResult<TransferHandle> {
        self.initiate_transfer(reference, TransferKind::Partial).await
    }

    pub async fn approve_seller_disbursement(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            if agg.order.disbursement.full.approved() {
                return Err(EscrowError::already("seller disbursement has already been approved"));
            }
            full_disbursement_gate(agg)?;
            agg.order.disbursement.full.approve(now);
            let event = format!("Disbursement for order {} approved", agg.reference());
            agg.record(TimelineCategory::DisbursementApproval, event, now);
            Ok(())
        })
        .await
    }

    pub async fn initiate_seller_payout(&self, reference: &str) -> EscrowResult<TransferHandle> {
        self.initiate_transfer(reference, TransferKind::Full).await
    }

    pub async fn initiate_refund(&self, reference: &str) -> EscrowResult<TransferHandle> {
        self.initiate_transfer(reference, TransferKind::Refund).await
    }

    /// Moves money for an approved transfer while holding the order's lock,
    /// so a fast webhook waits until the initiation is committed.
    async fn initiate_transfer(&self, reference: &str, kind: TransferKind) -> EscrowResult<TransferHandle> {
        let id = self.load(reference).await?.id();
        let _guard = self.coordinator.locks().acquire(id).await;
        let mut agg = self.load_id(id).await?;

        let request = transfer_request(&agg, kind)?;
        let handle = self.coordinator.initiate(&request).await?;

        let now = Utc::now();
        agg.order
            .disbursement
            .get_mut(kind)
            .mark_processing(now, handle.reference.clone(), handle.provider, handle.amount);
        let category = match kind {
            TransferKind::Refund => TimelineCategory::Refund,
            _ => TimelineCategory::DisbursementInitiation,
        };
        agg.record(
            category,
            format!("{} transfer of {} initiated with {} ({})", kind, handle.amount, handle.provider, handle.reference),
            now,
        );
        agg.publish(EscrowEvent::TransferInitiated {
            order_id: agg.id(),
            kind,
            provider: handle.provider.to_string(),
            reference: handle.reference.clone(),
            amount: handle.amount,
            timestamp: now,
        });

        if let Err(e) = commit(self.repo.as_ref(), &self.events, &mut agg).await {
            tracing::error!(
                "Transfer {} accepted by {} but order {} could not record it: {}",
                handle.reference,
                handle.provider,
                agg.reference(),
                e
            );
            return Err(e);
        }
        Ok(handle)
    }

    /// Resolves the account name with the providers and stores the account
    /// for refunds.
    pub async fn register_refund_account(
        &self,
        reference: &str,
        account_number: &str,
        bank_code: &str,
    ) -> EscrowResult<PayoutAccount> {
        if account_number.len() < 10 || !account_number.chars().all(|c| c.is_ascii_digit()) {
            return Err(EscrowError::Validation("account number must be at least 10 digits".into()));
        }
        ensure_open(&self.load(reference).await?)?;
        let account_name = self.coordinator.resolve_account(account_number, bank_code).await?;

        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            let account = PayoutAccount {
                account_name,
                account_number: Masked(account_number.to_string()),
                bank_code: bank_code.to_string(),
                email: agg.order.customer.email.clone(),
                recipient_code: None,
            };
            agg.order.customer.refund_account = Some(account.clone());
            agg.record(TimelineCategory::Refund, "Refund account registered for the buyer", now);
            Ok(account)
        })
        .await
    }

    pub async fn list_banks(&self) -> EscrowResult<Vec<Bank>> {
        self.coordinator.list_banks().await
    }

    pub async fn rate_order(&self, reference: &str, score: u8, feedback: Option<String>) -> EscrowResult<()> {
        if score > 5 {
            return Err(EscrowError::Validation(format!("rating {} is outside 0..=5", score)));
        }
        self.mutate(reference, |agg, now| {
            let closure = agg
                .order
                .closure
                .as_mut()
                .ok_or_else(|| EscrowError::precondition("only closed orders can be rated"))?;
            if closure.rating.is_some() {
                return Err(EscrowError::already("order has already been rated"));
            }
            closure.rating = Some(Rating { score, feedback, rated_at: now });
            agg.record(TimelineCategory::OrderRating, format!("Order rated {}", score), now);
            Ok(())
        })
        .await
    }
}

fn generate_reference() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERENCE_LEN)
        .map(char::from)
        .collect()
}

fn validate_new_order(new: &NewOrder) -> EscrowResult<()> {
    if new.product_amount <= Decimal::ZERO {
        return Err(EscrowError::Validation("product amount must be positive".into()));
    }
    if new.product.name.trim().is_empty() {
        return Err(EscrowError::Validation("product name is required".into()));
    }
    if new.customer.first_name.trim().is_empty() || new.customer.last_name.trim().is_empty() {
        return Err(EscrowError::Validation("customer name is required".into()));
    }
    if !new.customer.email.expose().contains('@') {
        return Err(EscrowError::Validation("customer email is invalid".into()));
    }
    if let Some(partial) = new.partial_disbursement {
        if partial <= Decimal::ZERO || partial >= new.product_amount {
            return Err(EscrowError::Validation(
                "partial disbursement must be positive and below the product amount".into(),
            ));
        }
    }
    Ok(())
}

pub(crate) fn ensure_open(agg: &OrderAggregate) -> EscrowResult<()> {
    if agg.order.is_closed() {
        return Err(EscrowError::precondition(format!("order {} is closed", agg.reference())));
    }
    Ok(())
}

fn check_payment_open(agg: &OrderAggregate) -> EscrowResult<()> {
    ensure_open(agg)?;
    if !agg.order.inspection.conditions_set() {
        return Err(EscrowError::precondition("conditions must be set before payment"));
    }
    if agg.order.payment.fully_verified() {
        return Err(EscrowError::already("order has already been fully paid"));
    }
    Ok(())
}

fn check_inspectable(agg: &OrderAggregate) -> EscrowResult<()> {
    if !agg.order.delivery.buyer_confirmed() {
        return Err(EscrowError::precondition("product must be delivered before conditions are validated"));
    }
    Ok(())
}

pub(crate) fn mark_inspected(agg: &mut OrderAggregate, now: DateTime<Utc>) {
    if agg.order.inspection.inspected_at.is_none() {
        agg.order.inspection.inspected_at = Some(now);
    }
}

fn apply_payment(
    agg: &mut OrderAggregate,
    amount: Decimal,
    history_ref: &str,
    holdings_name: String,
    now: DateTime<Utc>,
) -> PaymentReceipt {
    let amounts = &mut agg.order.amounts;
    amounts.amount_paid += amount;
    amounts.current_holdings += amount;
    amounts.amount_to_balance = (amounts.amount_to_pay - amounts.amount_paid).max(Decimal::ZERO);
    let fully_paid = amounts.amount_paid >= amounts.amount_to_pay;
    if amounts.amount_paid > amounts.amount_to_pay {
        amounts.amount_overflow = amounts.amount_paid - amounts.amount_to_pay;
        agg.order.payment.overpaid = true;
    }
    let receipt = PaymentReceipt {
        amount,
        amount_paid: amounts.amount_paid,
        amount_to_balance: amounts.amount_to_balance,
        fully_paid,
    };

    let event = if fully_paid {
        agg.order.payment.state.complete(now);
        format!("Full payment received for order {}, delivery time started", agg.order.reference)
    } else {
        agg.order.payment.state.begin(now);
        format!(
            "Payment of {} received for order {}, {} outstanding",
            amount, agg.order.reference, receipt.amount_to_balance
        )
    };
    if agg.order.payment.overpaid {
        tracing::warn!("Order {} overpaid by {}", agg.order.reference, agg.order.amounts.amount_overflow);
    }

    let sender = agg.customer_name();
    agg.add_history(
        amount,
        TransactionStatus::Success,
        history_ref,
        sender,
        holdings_name,
        format!("Deposit for order {}", agg.order.reference),
        now,
    );
    agg.record(TimelineCategory::OrderDeposit, event, now);
    agg.publish(EscrowEvent::PaymentVerified { order_id: agg.id(), amount, fully_paid, timestamp: now });
    receipt
}

/// Every gate a seller payout depends on, apart from the conditions.
fn release_gate(agg: &OrderAggregate) -> EscrowResult<()> {
    let o = &agg.order;
    let unmet = if !o.payment.fully_verified() {
        Some("full payment has not been verified")
    } else if o.payment.need_to_balance() {
        Some("a balance is still outstanding")
    } else if !o.delivery.seller_confirmed() {
        Some("seller has not confirmed delivery")
    } else if !o.delivery.buyer_confirmed() {
        Some("buyer has not confirmed delivery")
    } else if o.dispute.ongoing() {
        Some("a dispute is ongoing")
    } else if o.dispute.product_to_be_returned() {
        Some("product is to be returned")
    } else if o.disbursement.refund.initiated() {
        Some("a refund has been initiated")
    } else if o.special_attention.is_some() {
        Some("order is flagged for special attention")
    } else {
        None
    };
    match unmet {
        Some(why) => Err(EscrowError::precondition(why)),
        None => Ok(()),
    }
}

pub(crate) fn full_disbursement_gate(agg: &OrderAggregate) -> EscrowResult<()> {
    release_gate(agg)?;
    if !agg.order.inspection.conditions_met() {
        return Err(EscrowError::precondition("conditions have not all been met"));
    }
    if agg.order.disbursement.partial.processing() {
        return Err(EscrowError::precondition("a partial disbursement is still in flight"));
    }
    Ok(())
}

pub(crate) fn partial_disbursement_gate(agg: &OrderAggregate) -> EscrowResult<()> {
    if !partial_requisites_met(agg) {
        return Err(EscrowError::precondition("conditions required for partial disbursement are not met"));
    }
    release_gate(agg)
}

/// Gate, amount and recipient for an approved transfer.
fn transfer_request(agg: &OrderAggregate, kind: TransferKind) -> EscrowResult<TransferRequest> {
    ensure_open(agg)?;
    let o = &agg.order;
    let state = o.disbursement.get(kind);
    if state.initiated() {
        return Err(EscrowError::already(format!("{} transfer has already been initiated", kind)));
    }
    if !state.approved() {
        return Err(EscrowError::precondition(format!("{} transfer has not been approved", kind)));
    }

    let (amount, recipient, reason) = match kind {
        TransferKind::Partial => {
            partial_disbursement_gate(agg)?;
            (
                o.amounts.amount_to_partially_disburse,
                o.seller_account.clone(),
                format!("Partial payout to {} for order {}", o.seller_account.account_name, o.reference),
            )
        }
        TransferKind::Full => {
            full_disbursement_gate(agg)?;
            (
                o.amounts.amount_remaining_to_be_disbursed,
                o.seller_account.clone(),
                format!("Payout to {} for order {}", o.seller_account.account_name, o.reference),
            )
        }
        TransferKind::Refund => {
            let ret = agg
                .product_return
                .as_ref()
                .ok_or_else(|| EscrowError::precondition("no product return exists"))?;
            if o.disbursement.partial.processing() {
                return Err(EscrowError::precondition("a partial disbursement is still in flight"));
            }
            let account = o
                .customer
                .refund_account
                .clone()
                .ok_or_else(|| EscrowError::precondition("buyer has not registered a refund account"))?;
            // whatever the seller has not already received
            let amount = o.amounts.amount_remaining_to_be_disbursed;
            if amount != ret.amount_to_refund {
                tracing::warn!(
                    "Order {} refund recorded as {} at conclusion, refunding the {} still held",
                    o.reference,
                    ret.amount_to_refund,
                    amount
                );
            }
            (amount, account, format!("Refund payout to {} for order {}", agg.customer_name(), o.reference))
        }
    };
    if amount <= Decimal::ZERO {
        return Err(EscrowError::precondition(format!("nothing left to transfer for {}", kind)));
    }

    Ok(TransferRequest { kind, order_id: o.id, amount, recipient, reason })
}
