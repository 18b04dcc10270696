use chrono::{DateTime, Utc};
use holdfast_core::{PayoutAccount, ProviderKind};
use holdfast_shared::models::events::TransferKind;
use holdfast_shared::{EscrowEvent, Masked};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EscrowError, EscrowResult};
use crate::timeline::{TimelineCategory, TimelineLog};

/// Progress of one phase. Only moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Step {
    #[default]
    NotStarted,
    InProgress { since: DateTime<Utc> },
    Done { at: DateTime<Utc> },
}

impl Step {
    pub fn is_started(&self) -> bool {
        !matches!(self, Step::NotStarted)
    }

    pub fn in_progress(&self) -> bool {
        matches!(self, Step::InProgress { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done { .. })
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Step::NotStarted => None,
            Step::InProgress { since } => Some(*since),
            Step::Done { at } => Some(*at),
        }
    }

    pub fn done_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Step::Done { at } => Some(*at),
            _ => None,
        }
    }

    /// No-op unless the phase has not started yet.
    pub fn begin(&mut self, at: DateTime<Utc>) {
        if let Step::NotStarted = self {
            *self = Step::InProgress { since: at };
        }
    }

    /// No-op when already done, so the completion time is never rewritten.
    pub fn complete(&mut self, at: DateTime<Utc>) {
        if !self.is_done() {
            *self = Step::Done { at };
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub first_name: String,
    pub last_name: String,
    pub email: Masked<String>,
    pub phone: Masked<String>,
    pub country: String,
    pub city: String,
    pub address: String,
    /// Where refunds go. Registered on demand, after the account name resolves.
    pub refund_account: Option<PayoutAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// All money on an order, in whole currency units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAmounts {
    pub product_amount: Decimal,
    pub escrow_fee: Decimal,
    pub process_fee: Decimal,
    pub escrow_percent: Decimal,
    pub amount_to_pay: Decimal,
    pub amount_paid: Decimal,
    pub amount_to_balance: Decimal,
    pub amount_overflow: Decimal,
    pub current_holdings: Decimal,
    pub amount_to_partially_disburse: Decimal,
    pub amount_partially_disbursed: Decimal,
    pub amount_remaining_to_be_disbursed: Decimal,
    pub total_amount_disbursed: Decimal,
    pub amount_refunded: Decimal,
}

/// `state` is in progress while a balance is outstanding and done once the
/// full amount has been verified. Done also means the order has commenced and
/// the delivery clock is running.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentPhase {
    pub initiated_at: Option<DateTime<Utc>>,
    pub state: Step,
    pub overpaid: bool,
}

impl PaymentPhase {
    pub fn fully_verified(&self) -> bool {
        self.state.is_done()
    }

    pub fn need_to_balance(&self) -> bool {
        self.state.in_progress()
    }
}

/// `shipment` starts when the seller sends the product out and is done when
/// the buyer confirms receipt, which also starts the inspection clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryPhase {
    pub delivery_days: u32,
    pub shipment: Step,
    pub seller_confirmed_at: Option<DateTime<Utc>>,
}

impl DeliveryPhase {
    pub fn sent_out(&self) -> bool {
        self.shipment.is_started()
    }

    pub fn buyer_confirmed(&self) -> bool {
        self.shipment.is_done()
    }

    pub fn seller_confirmed(&self) -> bool {
        self.seller_confirmed_at.is_some()
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.shipment.done_at()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtraTime {
    pub granted_at: DateTime<Utc>,
    pub grace_ends_at: DateTime<Utc>,
}

/// `conditions` starts when conditions are attached and is done once every
/// one of them is met.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectionPhase {
    pub inspection_days: u32,
    pub conditions: Step,
    /// Set when the buyer first acts on the goods: validates a condition or
    /// raises a dispute.
    pub inspected_at: Option<DateTime<Utc>>,
    pub extra_time: Option<ExtraTime>,
}

impl InspectionPhase {
    pub fn conditions_set(&self) -> bool {
        self.conditions.is_started()
    }

    pub fn conditions_met(&self) -> bool {
        self.conditions.is_done()
    }

    pub fn inspected(&self) -> bool {
        self.inspected_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Accepted,
    Rejected,
    Unresolved,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Accepted => "accepted",
            Conclusion::Rejected => "rejected",
            Conclusion::Unresolved => "unresolved",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DisputePhase {
    #[default]
    None,
    Open {
        raised_at: DateTime<Utc>,
    },
    /// Every raised dispute is resolved; a conclusion is still owed.
    Resolved {
        raised_at: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
    },
    Concluded {
        raised_at: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
        conclusion: Conclusion,
        concluded_at: DateTime<Utc>,
    },
}

impl DisputePhase {
    pub fn raised(&self) -> bool {
        !matches!(self, DisputePhase::None)
    }

    pub fn ongoing(&self) -> bool {
        match self {
            DisputePhase::None => false,
            DisputePhase::Open { .. } | DisputePhase::Resolved { .. } => true,
            DisputePhase::Concluded { conclusion, .. } => *conclusion == Conclusion::Unresolved,
        }
    }

    pub fn resolved(&self) -> bool {
        matches!(self, DisputePhase::Resolved { .. } | DisputePhase::Concluded { .. })
    }

    pub fn conclusion(&self) -> Option<Conclusion> {
        match self {
            DisputePhase::Concluded { conclusion, .. } => Some(*conclusion),
            _ => None,
        }
    }

    pub fn arbitration_required(&self) -> bool {
        self.conclusion() == Some(Conclusion::Unresolved)
    }

    pub fn product_to_be_returned(&self) -> bool {
        self.conclusion() == Some(Conclusion::Rejected)
    }
}

/// Lifecycle of one outbound money movement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    NotStarted,
    Approved {
        approved_at: DateTime<Utc>,
    },
    Processing {
        approved_at: DateTime<Utc>,
        initiated_at: DateTime<Utc>,
        reference: String,
        provider: ProviderKind,
        amount: Decimal,
    },
    Dispatched {
        approved_at: DateTime<Utc>,
        initiated_at: DateTime<Utc>,
        reference: String,
        provider: ProviderKind,
        amount: Decimal,
        dispatched_at: DateTime<Utc>,
    },
}

impl TransferState {
    pub fn approved(&self) -> bool {
        !matches!(self, TransferState::NotStarted)
    }

    /// Initiated transfers are also processing until the provider confirms.
    pub fn initiated(&self) -> bool {
        matches!(self, TransferState::Processing { .. } | TransferState::Dispatched { .. })
    }

    pub fn processing(&self) -> bool {
        matches!(self, TransferState::Processing { .. })
    }

    pub fn dispatched(&self) -> bool {
        matches!(self, TransferState::Dispatched { .. })
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            TransferState::Processing { reference, .. } | TransferState::Dispatched { reference, .. } => {
                Some(reference)
            }
            _ => None,
        }
    }

    pub fn approve(&mut self, at: DateTime<Utc>) {
        if let TransferState::NotStarted = self {
            *self = TransferState::Approved { approved_at: at };
        }
    }

    /// Moves an approved transfer to processing. Callers check the gate first.
    pub fn mark_processing(&mut self, at: DateTime<Utc>, reference: String, provider: ProviderKind, amount: Decimal) {
        let approved_at = match self {
            TransferState::Approved { approved_at } => *approved_at,
            TransferState::NotStarted => at,
            _ => return,
        };
        *self = TransferState::Processing { approved_at, initiated_at: at, reference, provider, amount };
    }

    /// Records the provider's confirmation. Returns false if it was already
    /// recorded.
    pub fn mark_dispatched(&mut self, at: DateTime<Utc>, reference: &str, provider: ProviderKind, amount: Decimal) -> bool {
        let (approved_at, initiated_at) = match self {
            TransferState::Dispatched { .. } => return false,
            TransferState::Processing { approved_at, initiated_at, .. } => (*approved_at, *initiated_at),
            TransferState::Approved { approved_at } => (*approved_at, at),
            TransferState::NotStarted => (at, at),
        };
        *self = TransferState::Dispatched {
            approved_at,
            initiated_at,
            reference: reference.to_string(),
            provider,
            amount,
            dispatched_at: at,
        };
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisbursementPhase {
    pub partial_enabled: bool,
    pub partial: TransferState,
    pub full: TransferState,
    pub refund: TransferState,
}

impl DisbursementPhase {
    pub fn get(&self, kind: TransferKind) -> &TransferState {
        match kind {
            TransferKind::Partial => &self.partial,
            TransferKind::Full => &self.full,
            TransferKind::Refund => &self.refund,
        }
    }

    pub fn get_mut(&mut self, kind: TransferKind) -> &mut TransferState {
        match kind {
            TransferKind::Partial => &mut self.partial,
            TransferKind::Full => &mut self.full,
            TransferKind::Refund => &mut self.refund,
        }
    }

    /// A transfer has been initiated and the provider has not confirmed it.
    pub fn in_flight(&self) -> Option<TransferKind> {
        [TransferKind::Partial, TransferKind::Full, TransferKind::Refund]
            .into_iter()
            .find(|kind| self.get(*kind).processing())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialAttention {
    pub flagged_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosureReason {
    SellerPaid,
    Refunded,
    AutoCredited,
}

impl ClosureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosureReason::SellerPaid => "seller_paid",
            ClosureReason::Refunded => "refunded",
            ClosureReason::AutoCredited => "auto_credited",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rating {
    pub score: u8,
    pub feedback: Option<String>,
    pub rated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Closure {
    pub closed_at: DateTime<Utc>,
    pub reason: ClosureReason,
    pub rating: Option<Rating>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub reference: String,
    pub merchant_id: String,
    pub customer: Customer,
    pub product: ProductDetails,
    /// Seller account for partial and full disbursements.
    pub seller_account: PayoutAccount,
    pub amounts: OrderAmounts,
    pub payment: PaymentPhase,
    pub delivery: DeliveryPhase,
    pub inspection: InspectionPhase,
    pub dispute: DisputePhase,
    pub disbursement: DisbursementPhase,
    pub special_attention: Option<SpecialAttention>,
    pub closure: Option<Closure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_closed(&self) -> bool {
        self.closure.is_some()
    }

    pub fn close(&mut self, reason: ClosureReason, at: DateTime<Utc>) -> bool {
        if self.closure.is_some() {
            return false;
        }
        self.closure = Some(Closure { closed_at: at, reason, rating: None });
        true
    }

    pub fn flag_special_attention(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        if self.special_attention.is_none() {
            self.special_attention = Some(SpecialAttention { flagged_at: at, reason: reason.into() });
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub id: Uuid,
    pub order_id: Uuid,
    pub title: String,
    pub description: String,
    /// `None` when the order does not use partial disbursements.
    pub partial_disburse_requisite: Option<bool>,
    pub met: bool,
    pub met_at: Option<DateTime<Utc>>,
    pub dispute_id: Option<Uuid>,
    pub dispute_settled: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for a new condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub partial_disburse_requisite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dispute {
    pub id: Uuid,
    pub order_id: Uuid,
    pub title: String,
    pub reason: String,
    pub condition_id: Option<Uuid>,
    pub resolved: bool,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReturnDelivery {
    pub courier: String,
    pub tracking_number: String,
    pub source: String,
    pub destination: String,
    pub instructions: Option<String>,
}

/// Reverse logistics after a rejected dispute conclusion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductReturn {
    pub id: Uuid,
    pub order_id: Uuid,
    pub return_window_days: u32,
    pub amount_to_refund: Decimal,
    pub delivery_info: Option<ReturnDelivery>,
    pub sent_out_at: Option<DateTime<Utc>>,
    pub buyer_confirmed_at: Option<DateTime<Utc>>,
    pub seller_confirmed_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

/// One immutable ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub reference: String,
    pub sender: String,
    pub receiver: String,
    pub description: String,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An order with everything that is written together with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAggregate {
    pub order: Order,
    pub conditions: Vec<Condition>,
    pub disputes: Vec<Dispute>,
    pub product_return: Option<ProductReturn>,
    pub history: Vec<TransactionRecord>,
    pub timeline: TimelineLog,
    /// Bumped by the repository on every successful save.
    pub version: u64,
    #[serde(skip)]
    pending_events: Vec<EscrowEvent>,
}

impl OrderAggregate {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            conditions: Vec::new(),
            disputes: Vec::new(),
            product_return: None,
            history: Vec::new(),
            timeline: TimelineLog::new(),
            version: 0,
            pending_events: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.order.id
    }

    pub fn reference(&self) -> &str {
        &self.order.reference
    }

    pub fn condition(&self, id: Uuid) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    pub fn condition_mut(&mut self, id: Uuid) -> Option<&mut Condition> {
        self.conditions.iter_mut().find(|c| c.id == id)
    }

    /// Appends a timeline entry and touches the order.
    pub fn record(&mut self, category: TimelineCategory, event: impl Into<String>, at: DateTime<Utc>) {
        self.timeline.record(category, event, at);
        self.order.updated_at = at;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_history(
        &mut self,
        amount: Decimal,
        status: TransactionStatus,
        reference: impl Into<String>,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> &TransactionRecord {
        self.history.push(TransactionRecord {
            id: Uuid::new_v4(),
            order_id: self.order.id,
            amount,
            status,
            reference: reference.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            description: description.into(),
            remark: None,
            created_at: at,
        });
        &self.history[self.history.len() - 1]
    }

    pub fn has_history_reference(&self, reference: &str) -> bool {
        self.history.iter().any(|h| h.reference == reference)
    }

    /// Queues an event to publish once this aggregate is committed.
    pub fn publish(&mut self, event: EscrowEvent) {
        self.pending_events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<EscrowEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn customer_name(&self) -> String {
        format!("{} {}", self.order.customer.first_name, self.order.customer.last_name)
    }

    /// Cross-phase consistency. Later phases may only have progressed if the
    /// earlier ones they depend on have.
    pub fn check_invariants(&self) -> EscrowResult<()> {
        let o = &self.order;
        let broken = |what: &str| Err(EscrowError::DataInconsistency(format!("order {}: {}", o.reference, what)));

        if o.delivery.sent_out() && !o.payment.fully_verified() {
            return broken("shipped before full payment");
        }
        if o.delivery.seller_confirmed() && !o.delivery.sent_out() {
            return broken("seller confirmed delivery before send-out");
        }
        if o.inspection.conditions_met() {
            if !o.inspection.conditions_set() {
                return broken("conditions met before any were set");
            }
            if self.conditions.iter().any(|c| !c.met) {
                return broken("aggregate conditions met while a condition is unmet");
            }
        }
        if o.dispute.product_to_be_returned() != self.product_return.is_some() {
            return broken("product return does not match dispute conclusion");
        }
        if o.disbursement.refund.approved() {
            let accepted = self.product_return.as_ref().is_some_and(|r| r.accepted_at.is_some());
            if !accepted {
                return broken("refund approved before return was accepted");
            }
        }
        if (o.disbursement.full.dispatched() || o.disbursement.refund.dispatched()) && !o.is_closed() {
            return broken("dispatched transfer left order open");
        }
        if o.amounts.current_holdings < Decimal::ZERO || o.amounts.amount_remaining_to_be_disbursed < Decimal::ZERO {
            return broken("negative ledger balance");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_step_is_monotone() {
        let t0 = Utc::now();
        let mut step = Step::NotStarted;
        step.begin(t0);
        assert!(step.in_progress());

        step.complete(t0 + Duration::minutes(1));
        assert_eq!(step.done_at(), Some(t0 + Duration::minutes(1)));

        step.begin(t0 + Duration::minutes(2));
        step.complete(t0 + Duration::minutes(3));
        assert_eq!(step.done_at(), Some(t0 + Duration::minutes(1)));
    }

    #[test]
    fn test_dispute_phase_gates() {
        let t = Utc::now();
        assert!(!DisputePhase::None.ongoing());
        assert!(DisputePhase::Open { raised_at: t }.ongoing());
        assert!(DisputePhase::Resolved { raised_at: t, resolved_at: t }.ongoing());

        let concluded = |conclusion| DisputePhase::Concluded { raised_at: t, resolved_at: t, conclusion, concluded_at: t };
        assert!(!concluded(Conclusion::Accepted).ongoing());
        assert!(concluded(Conclusion::Rejected).product_to_be_returned());
        assert!(concluded(Conclusion::Unresolved).ongoing());
        assert!(concluded(Conclusion::Unresolved).arbitration_required());
    }

    #[test]
    fn test_transfer_state_progression() {
        let t = Utc::now();
        let mut transfer = TransferState::NotStarted;
        transfer.approve(t);
        assert!(transfer.approved() && !transfer.initiated());

        transfer.mark_processing(t, "pk_trans_full_1".into(), ProviderKind::Paystack, Decimal::ONE_HUNDRED);
        assert!(transfer.processing());
        assert_eq!(transfer.reference(), Some("pk_trans_full_1"));

        assert!(transfer.mark_dispatched(t, "pk_trans_full_1", ProviderKind::Paystack, Decimal::ONE_HUNDRED));
        assert!(!transfer.mark_dispatched(t, "pk_trans_full_1", ProviderKind::Paystack, Decimal::ONE_HUNDRED));
        assert!(transfer.dispatched() && transfer.initiated());
    }
}
