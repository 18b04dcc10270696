//! Disputes, their conclusion, and the product return that a rejection
//! starts.

use chrono::{DateTime, Utc};
use holdfast_shared::EscrowEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conditions::ConditionLedger;
use crate::error::{EscrowError, EscrowResult};
use crate::lifecycle::{ensure_open, mark_inspected, LifecycleEngine};
use crate::models::{Conclusion, Dispute, DisputePhase, OrderAggregate, ProductReturn, ReturnDelivery};
use crate::timeline::TimelineCategory;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeDraft {
    pub title: String,
    pub reason: String,
    pub condition_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "conclusion", rename_all = "snake_case")]
pub enum DisputeConclusion {
    Accepted,
    Rejected { return_window_days: u32 },
    Unresolved,
}

impl DisputeConclusion {
    fn conclusion(&self) -> Conclusion {
        match self {
            DisputeConclusion::Accepted => Conclusion::Accepted,
            DisputeConclusion::Rejected { .. } => Conclusion::Rejected,
            DisputeConclusion::Unresolved => Conclusion::Unresolved,
        }
    }
}

impl LifecycleEngine {
    pub async fn disputes(&self, reference: &str) -> EscrowResult<Vec<Dispute>> {
        Ok(self.load(reference).await?.disputes)
    }

    pub async fn raise_dispute(&self, reference: &str, draft: DisputeDraft) -> EscrowResult<Dispute> {
        if draft.title.trim().is_empty() || draft.reason.trim().is_empty() {
            return Err(EscrowError::Validation("dispute title and reason are required".into()));
        }
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            if !agg.order.payment.fully_verified() {
                return Err(EscrowError::precondition("order has not been paid for"));
            }
            if agg.order.inspection.conditions_met() {
                return Err(EscrowError::precondition("conditions have already been met"));
            }
            if let DisputePhase::Concluded { .. } = agg.order.dispute {
                return Err(EscrowError::precondition("disputes on this order have been concluded"));
            }

            let dispute_id = Uuid::new_v4();
            if let Some(condition_id) = draft.condition_id {
                let condition = agg
                    .condition_mut(condition_id)
                    .ok_or_else(|| EscrowError::NotFound(format!("condition {}", condition_id)))?;
                if condition.dispute_id.is_some() {
                    return Err(EscrowError::AlreadyDisputed(condition_id));
                }
                if condition.met {
                    return Err(EscrowError::precondition(format!("condition {} has already been met", condition_id)));
                }
                condition.dispute_id = Some(dispute_id);
            }

            let dispute = Dispute {
                id: dispute_id,
                order_id: agg.id(),
                title: draft.title,
                reason: draft.reason,
                condition_id: draft.condition_id,
                resolved: false,
                raised_at: now,
                resolved_at: None,
            };
            agg.disputes.push(dispute.clone());
            agg.order.dispute = match agg.order.dispute {
                DisputePhase::Open { raised_at } | DisputePhase::Resolved { raised_at, .. } => DisputePhase::Open { raised_at },
                _ => DisputePhase::Open { raised_at: now },
            };
            mark_inspected(agg, now);

            let event = match dispute.condition_id {
                Some(c) => format!("Dispute '{}' raised on condition {}", dispute.title, c),
                None => format!("Dispute '{}' raised on order {}", dispute.title, agg.reference()),
            };
            agg.record(TimelineCategory::Dispute, event, now);
            agg.publish(EscrowEvent::DisputeRaised { order_id: agg.id(), dispute_id, timestamp: now });
            tracing::info!("Dispute {} raised on order {}", dispute_id, agg.reference());
            Ok(dispute)
        })
        .await
    }

    pub async fn resolve_dispute(&self, reference: &str, dispute_id: Uuid) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            resolve_one(agg, dispute_id, now)?;
            settle_phase(agg, now);
            Ok(())
        })
        .await
    }

    /// Resolves every open dispute in one unit of work.
    pub async fn resolve_all_disputes(&self, reference: &str) -> EscrowResult<usize> {
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            let open: Vec<Uuid> = agg.disputes.iter().filter(|d| !d.resolved).map(|d| d.id).collect();
            if open.is_empty() {
                return Err(EscrowError::already("no open disputes"));
            }
            for id in &open {
                resolve_one(agg, *id, now)?;
            }
            settle_phase(agg, now);
            Ok(open.len())
        })
        .await
    }

    pub async fn conclude_dispute(&self, reference: &str, outcome: DisputeConclusion) -> EscrowResult<()> {
        if let DisputeConclusion::Rejected { return_window_days: 0 } = outcome {
            return Err(EscrowError::Validation("a return window in days is required".into()));
        }
        self.mutate(reference, |agg, now| {
            ensure_open(agg)?;
            let (raised_at, resolved_at) = match agg.order.dispute {
                DisputePhase::Resolved { raised_at, resolved_at } => (raised_at, resolved_at),
                DisputePhase::None => return Err(EscrowError::precondition("no dispute has been raised")),
                DisputePhase::Open { .. } => {
                    return Err(EscrowError::precondition("disputes have not all been resolved"))
                }
                DisputePhase::Concluded { .. } => return Err(EscrowError::already("dispute has already been concluded")),
            };

            match outcome {
                DisputeConclusion::Accepted => {
                    let pending: Vec<Uuid> = agg.conditions.iter().filter(|c| !c.met).map(|c| c.id).collect();
                    let mut ledger = ConditionLedger::new(agg);
                    for id in pending {
                        ledger.mark_met(id, now)?;
                    }
                    ledger.refresh(now);
                    agg.record(TimelineCategory::DisputeConclusion, "Dispute concluded and product accepted", now);
                }
                DisputeConclusion::Rejected { return_window_days } => {
                    if agg.order.disbursement.partial.processing() {
                        return Err(EscrowError::precondition(
                            "a partial disbursement is still in flight, wait for the provider to confirm it",
                        ));
                    }
                    agg.product_return = Some(ProductReturn {
                        id: Uuid::new_v4(),
                        order_id: agg.id(),
                        return_window_days,
                        amount_to_refund: agg.order.amounts.amount_remaining_to_be_disbursed,
                        delivery_info: None,
                        sent_out_at: None,
                        buyer_confirmed_at: None,
                        seller_confirmed_at: None,
                        accepted_at: None,
                        created_at: now,
                    });
                    let event = format!("Product {} was rejected and its return has commenced", agg.reference());
                    agg.record(TimelineCategory::DisputeConclusion, event, now);
                }
                DisputeConclusion::Unresolved => {
                    let event = format!("Dispute on order {} was unresolved, arbitration required", agg.reference());
                    agg.record(TimelineCategory::DisputeConclusion, event, now);
                    tracing::warn!("Order {} needs arbitration", agg.reference());
                }
            }

            let conclusion = outcome.conclusion();
            agg.order.dispute = DisputePhase::Concluded { raised_at, resolved_at, conclusion, concluded_at: now };
            agg.publish(EscrowEvent::DisputeConcluded {
                order_id: agg.id(),
                conclusion: conclusion.as_str().to_string(),
                timestamp: now,
            });
            Ok(())
        })
        .await
    }

    pub async fn confirm_return_sent_out(&self, reference: &str, delivery: ReturnDelivery) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            let ret = open_return(agg)?;
            if ret.sent_out_at.is_some() {
                return Err(EscrowError::already("product has already been sent back"));
            }
            ret.sent_out_at = Some(now);
            ret.delivery_info = Some(delivery);
            agg.record(TimelineCategory::ProductReturn, "Product has been sent back to the seller", now);
            Ok(())
        })
        .await
    }

    pub async fn buyer_confirm_return(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            let ret = open_return(agg)?;
            if ret.sent_out_at.is_none() {
                return Err(EscrowError::precondition("product has not been sent back"));
            }
            if ret.buyer_confirmed_at.is_some() {
                return Err(EscrowError::already("buyer has already confirmed the return"));
            }
            ret.buyer_confirmed_at = Some(now);
            agg.record(TimelineCategory::ProductReturn, "Buyer confirmed the product was returned", now);
            Ok(())
        })
        .await
    }

    /// Seller receipt of the return. Also records the buyer's confirmation
    /// if they never gave it.
    pub async fn seller_confirm_return(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            let ret = open_return(agg)?;
            if ret.sent_out_at.is_none() {
                return Err(EscrowError::precondition("product has not been sent back"));
            }
            if ret.seller_confirmed_at.is_some() {
                return Err(EscrowError::already("seller has already confirmed the return"));
            }
            ret.seller_confirmed_at = Some(now);
            let forced = ret.buyer_confirmed_at.is_none();
            if forced {
                ret.buyer_confirmed_at = Some(now);
            }
            agg.record(TimelineCategory::ProductReturn, "Seller confirmed receipt of the returned product", now);
            if forced {
                tracing::info!("Buyer return confirmation on {} set by seller confirmation", agg.reference());
            }
            Ok(())
        })
        .await
    }

    /// Seller accepts the returned goods, which approves the refund.
    pub async fn accept_return_condition(&self, reference: &str) -> EscrowResult<()> {
        self.mutate(reference, |agg, now| {
            let ret = open_return(agg)?;
            if ret.seller_confirmed_at.is_none() {
                return Err(EscrowError::precondition("seller has not confirmed the return"));
            }
            if ret.accepted_at.is_some() {
                return Err(EscrowError::already("return has already been accepted"));
            }
            ret.accepted_at = Some(now);
            agg.order.disbursement.refund.approve(now);
            let event = format!("Return accepted, refund of order {} approved", agg.reference());
            agg.record(TimelineCategory::Refund, event, now);
            Ok(())
        })
        .await
    }
}

fn resolve_one(agg: &mut OrderAggregate, dispute_id: Uuid, now: DateTime<Utc>) -> EscrowResult<()> {
    let dispute = agg
        .disputes
        .iter_mut()
        .find(|d| d.id == dispute_id)
        .ok_or_else(|| EscrowError::NotFound(format!("dispute {}", dispute_id)))?;
    if dispute.resolved {
        return Err(EscrowError::already(format!("dispute {} is already resolved", dispute_id)));
    }
    dispute.resolved = true;
    dispute.resolved_at = Some(now);
    let condition_id = dispute.condition_id;

    if let Some(cid) = condition_id {
        if let Some(condition) = agg.condition_mut(cid) {
            condition.dispute_settled = true;
        }
    }
    agg.record(TimelineCategory::Dispute, format!("Dispute {} resolved", dispute_id), now);
    Ok(())
}

/// Moves the order-level phase to resolved once no dispute is left open.
fn settle_phase(agg: &mut OrderAggregate, now: DateTime<Utc>) {
    if agg.disputes.iter().any(|d| !d.resolved) {
        return;
    }
    if let DisputePhase::Open { raised_at } = agg.order.dispute {
        agg.order.dispute = DisputePhase::Resolved { raised_at, resolved_at: now };
        agg.record(TimelineCategory::Dispute, "All disputes resolved, awaiting conclusion", now);
    }
}

fn open_return(agg: &mut OrderAggregate) -> EscrowResult<&mut ProductReturn> {
    ensure_open(agg)?;
    agg.product_return
        .as_mut()
        .ok_or_else(|| EscrowError::precondition("no product return is in progress"))
}
