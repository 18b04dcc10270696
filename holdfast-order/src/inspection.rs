use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use holdfast_shared::EscrowEvent;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EscrowError, EscrowResult};
use crate::lifecycle::LifecycleEngine;
use crate::models::{ClosureReason, ExtraTime, OrderAggregate, TransactionStatus};
use crate::repository::commit;
use crate::timeline::TimelineCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    Waiting,
    Reminded,
    AutoClosed,
    Flagged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub reminded: usize,
    pub auto_closed: usize,
    pub flagged: usize,
    pub failed: usize,
    /// Another sweep was still running.
    pub skipped: bool,
    pub panicked: bool,
}

/// Advances delivered orders the buyer never inspected: one reminder with a
/// grace window once the inspection period lapses, then an automatic close in
/// the seller's favour.
pub struct InspectionScheduler {
    engine: Arc<LifecycleEngine>,
    grace_period: Duration,
    running: AtomicBool,
}

impl InspectionScheduler {
    pub fn new(engine: Arc<LifecycleEngine>, grace_period: Duration) -> Self {
        Self {
            engine,
            grace_period,
            running: AtomicBool::new(false),
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Runs one sweep as of `now`. Never panics; overlapping calls return
    /// immediately with `skipped` set.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Inspection sweep still running, skipping this tick");
            return SweepReport { skipped: true, ..Default::default() };
        }

        let result = AssertUnwindSafe(self.run(now)).catch_unwind().await;
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok(report) => {
                tracing::info!(
                    "Inspection sweep: {} examined, {} reminded, {} auto-closed, {} flagged, {} failed",
                    report.examined,
                    report.reminded,
                    report.auto_closed,
                    report.flagged,
                    report.failed
                );
                report
            }
            Err(_) => {
                tracing::error!("Inspection sweep panicked");
                SweepReport { panicked: true, ..Default::default() }
            }
        }
    }

    async fn run(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let candidates = match self.engine.repo.awaiting_inspection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Could not list orders awaiting inspection: {}", e);
                report.failed += 1;
                return report;
            }
        };

        for agg in candidates {
            report.examined += 1;
            match self.advance(agg.id(), now).await {
                Ok(SweepAction::Waiting) => {}
                Ok(SweepAction::Reminded) => report.reminded += 1,
                Ok(SweepAction::AutoClosed) => report.auto_closed += 1,
                Ok(SweepAction::Flagged) => report.flagged += 1,
                Err(e) => {
                    tracing::warn!("Inspection check of order {} failed: {}", agg.reference(), e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn advance(&self, id: Uuid, now: DateTime<Utc>) -> EscrowResult<SweepAction> {
        let _guard = self.engine.coordinator.locks().acquire(id).await;
        let mut agg = self.engine.load_id(id).await?;

        let o = &agg.order;
        if o.is_closed() || o.inspection.inspected() {
            return Ok(SweepAction::Waiting);
        }
        let Some(delivered_at) = o.delivery.delivered_at() else {
            return Ok(SweepAction::Waiting);
        };
        let deadline = delivered_at + Duration::days(i64::from(o.inspection.inspection_days));
        if now < deadline {
            return Ok(SweepAction::Waiting);
        }

        if let Some(kind) = o.disbursement.in_flight() {
            tracing::debug!("Order {} has a {} transfer in flight, not advancing inspection", agg.reference(), kind);
            return Ok(SweepAction::Waiting);
        }

        let extra_time = o.inspection.extra_time;
        let flagged = o.special_attention.is_some();

        let action = match extra_time {
            None => {
                grant_extra_time(&mut agg, now, self.grace_period);
                SweepAction::Reminded
            }
            Some(extra) if now < extra.grace_ends_at => return Ok(SweepAction::Waiting),
            Some(_) if flagged => return Ok(SweepAction::Waiting),
            Some(_) => match auto_close_inconsistency(&agg) {
                Some(problem) => {
                    tracing::error!("Order {} not auto-closed: {}", agg.reference(), problem);
                    agg.order.flag_special_attention(problem.to_string(), now);
                    agg.record(TimelineCategory::DataInconsistency, problem.to_string(), now);
                    SweepAction::Flagged
                }
                None => {
                    auto_credit(&mut agg, now, &self.engine.coordinator.settings().holdings_name);
                    SweepAction::AutoClosed
                }
            },
        };

        commit(self.engine.repo.as_ref(), &self.engine.events, &mut agg).await?;
        Ok(action)
    }
}

fn grant_extra_time(agg: &mut OrderAggregate, now: DateTime<Utc>, grace: Duration) {
    let grace_ends_at = now + grace;
    agg.order.inspection.extra_time = Some(ExtraTime { granted_at: now, grace_ends_at });
    let event = format!(
        "Inspection time for order {} has elapsed, extra time granted until {}",
        agg.reference(),
        grace_ends_at
    );
    agg.record(TimelineCategory::InspectionReminder, event, now);
    agg.publish(EscrowEvent::InspectionReminder { order_id: agg.id(), grace_ends_at, timestamp: now });
    tracing::info!("Granted extra inspection time on order {}", agg.reference());
}

/// Records the auto-close must find before crediting the seller.
fn auto_close_inconsistency(agg: &OrderAggregate) -> Option<EscrowError> {
    if agg.timeline.latest(TimelineCategory::InspectionReminder).is_none() {
        return Some(EscrowError::DataInconsistency(format!(
            "order {} has extra time but no inspection reminder on record",
            agg.reference()
        )));
    }
    if !agg.order.payment.fully_verified() {
        return Some(EscrowError::DataInconsistency(format!(
            "order {} was delivered without a verified payment",
            agg.reference()
        )));
    }
    None
}

fn auto_credit(agg: &mut OrderAggregate, now: DateTime<Utc>, holdings_name: &str) {
    // a dispatched partial already reached the seller
    let amount = agg.order.amounts.amount_remaining_to_be_disbursed;
    let seller = agg.order.seller_account.account_name.clone();
    let reference = format!("auto_credit_{}", Uuid::new_v4().simple());
    let description = format!("Order {} auto-credited to seller after inspection lapsed", agg.reference());
    agg.add_history(amount, TransactionStatus::Success, reference, holdings_name, seller, description.clone(), now);
    agg.record(TimelineCategory::AutoCredit, description, now);

    if agg.order.close(ClosureReason::AutoCredited, now) {
        agg.record(TimelineCategory::OrderClose, format!("Order {} closed", agg.reference()), now);
        agg.publish(EscrowEvent::OrderClosed {
            order_id: agg.id(),
            reason: ClosureReason::AutoCredited.as_str().to_string(),
            timestamp: now,
        });
    }
    tracing::info!("Order {} auto-closed in the seller's favour", agg.reference());
}
