use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Which money movement a transfer event refers to.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Partial,
    Full,
    Refund,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Partial => "partial",
            TransferKind::Full => "full",
            TransferKind::Refund => "refund",
        }
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escrow lifecycle notifications, published after the change is committed.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowEvent {
    OrderCreated {
        order_id: Uuid,
        reference: String,
        merchant_id: String,
        amount_to_pay: Decimal,
        timestamp: DateTime<Utc>,
    },
    PaymentVerified {
        order_id: Uuid,
        amount: Decimal,
        fully_paid: bool,
        timestamp: DateTime<Utc>,
    },
    DeliveryConfirmed {
        order_id: Uuid,
        by_buyer: bool,
        timestamp: DateTime<Utc>,
    },
    DisputeRaised {
        order_id: Uuid,
        dispute_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    DisputeConcluded {
        order_id: Uuid,
        conclusion: String,
        timestamp: DateTime<Utc>,
    },
    TransferInitiated {
        order_id: Uuid,
        kind: TransferKind,
        provider: String,
        reference: String,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    },
    TransferDispatched {
        order_id: Uuid,
        kind: TransferKind,
        reference: String,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    },
    InspectionReminder {
        order_id: Uuid,
        grace_ends_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    OrderClosed {
        order_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl EscrowEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            EscrowEvent::OrderCreated { order_id, .. }
            | EscrowEvent::PaymentVerified { order_id, .. }
            | EscrowEvent::DeliveryConfirmed { order_id, .. }
            | EscrowEvent::DisputeRaised { order_id, .. }
            | EscrowEvent::DisputeConcluded { order_id, .. }
            | EscrowEvent::TransferInitiated { order_id, .. }
            | EscrowEvent::TransferDispatched { order_id, .. }
            | EscrowEvent::InspectionReminder { order_id, .. }
            | EscrowEvent::OrderClosed { order_id, .. } => *order_id,
        }
    }

    /// Topic name used when events are forwarded to a broker.
    pub fn topic(&self) -> &'static str {
        match self {
            EscrowEvent::OrderCreated { .. } => "escrow.order.created",
            EscrowEvent::PaymentVerified { .. } => "escrow.payment.verified",
            EscrowEvent::DeliveryConfirmed { .. } => "escrow.delivery.confirmed",
            EscrowEvent::DisputeRaised { .. } => "escrow.dispute.raised",
            EscrowEvent::DisputeConcluded { .. } => "escrow.dispute.concluded",
            EscrowEvent::TransferInitiated { .. } => "escrow.transfer.initiated",
            EscrowEvent::TransferDispatched { .. } => "escrow.transfer.dispatched",
            EscrowEvent::InspectionReminder { .. } => "escrow.inspection.reminder",
            EscrowEvent::OrderClosed { .. } => "escrow.order.closed",
        }
    }
}
