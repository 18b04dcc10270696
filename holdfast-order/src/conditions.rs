use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EscrowError, EscrowResult};
use crate::models::{Condition, ConditionDraft, OrderAggregate};
use crate::timeline::TimelineCategory;

/// Acceptance conditions of one order and their aggregate satisfaction.
pub struct ConditionLedger<'a> {
    agg: &'a mut OrderAggregate,
}

impl<'a> ConditionLedger<'a> {
    pub fn new(agg: &'a mut OrderAggregate) -> Self {
        Self { agg }
    }

    /// Attaches conditions. More may be added until payment has started.
    pub fn set_conditions(&mut self, drafts: Vec<ConditionDraft>, now: DateTime<Utc>) -> EscrowResult<Vec<Uuid>> {
        if drafts.is_empty() {
            return Err(EscrowError::Validation("at least one condition is required".into()));
        }
        if let Some(blank) = drafts.iter().find(|d| d.title.trim().is_empty()) {
            return Err(EscrowError::Validation(format!("condition title is empty: {:?}", blank.description)));
        }
        let order = &self.agg.order;
        if order.inspection.conditions_set() && (order.payment.state.is_started() || order.payment.initiated_at.is_some()) {
            return Err(EscrowError::precondition("conditions are fixed once payment has started"));
        }

        let partial = order.disbursement.partial_enabled;
        let order_id = order.id;
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let condition = Condition {
                id: Uuid::new_v4(),
                order_id,
                title: draft.title,
                description: draft.description,
                partial_disburse_requisite: partial.then_some(draft.partial_disburse_requisite),
                met: false,
                met_at: None,
                dispute_id: None,
                dispute_settled: false,
                created_at: now,
            };
            let event = format!("Condition '{}' has been set", condition.title);
            ids.push(condition.id);
            self.agg.conditions.push(condition);
            self.agg.record(TimelineCategory::Conditions, event, now);
        }
        self.agg.order.inspection.conditions.begin(now);
        Ok(ids)
    }

    /// Marks one condition met. Fails with `AlreadyMet` without touching the
    /// timeline when it already is.
    pub fn mark_met(&mut self, id: Uuid, now: DateTime<Utc>) -> EscrowResult<()> {
        let condition = self
            .agg
            .condition_mut(id)
            .ok_or_else(|| EscrowError::NotFound(format!("condition {}", id)))?;
        if condition.met {
            return Err(EscrowError::AlreadyMet(id));
        }
        condition.met = true;
        condition.met_at = Some(now);

        self.agg
            .record(TimelineCategory::ConditionConfirmation, format!("Condition {} has been confirmed as met", id), now);
        self.refresh(now);
        Ok(())
    }

    /// Marks every unmet condition met, one timeline entry each. Returns how
    /// many changed.
    pub fn mark_all_met(&mut self, now: DateTime<Utc>) -> EscrowResult<usize> {
        if self.agg.conditions.is_empty() {
            return Err(EscrowError::precondition("no conditions have been set"));
        }
        let pending: Vec<Uuid> = self.agg.conditions.iter().filter(|c| !c.met).map(|c| c.id).collect();
        if pending.is_empty() {
            return Err(EscrowError::already("all conditions have already been marked as met"));
        }
        for id in &pending {
            self.mark_met(*id, now)?;
        }
        Ok(pending.len())
    }

    pub fn all_met(&self) -> bool {
        all_met(self.agg)
    }

    /// Flips the aggregate flag once every condition is met. Never clears it.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if all_met(self.agg) {
            self.agg.order.inspection.conditions.complete(now);
        }
        self.agg.order.inspection.conditions_met()
    }
}

/// True when at least one condition exists and all of them are met.
pub fn all_met(agg: &OrderAggregate) -> bool {
    !agg.conditions.is_empty() && agg.conditions.iter().all(|c| c.met)
}

/// Conditions the seller needs met before a partial payout.
pub fn partial_requisites_met(agg: &OrderAggregate) -> bool {
    agg.conditions
        .iter()
        .filter(|c| c.partial_disburse_requisite == Some(true))
        .all(|c| c.met)
}
