use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineCategory {
    OrderCreation,
    Conditions,
    DepositInitiation,
    OrderDeposit,
    DeliverySendout,
    DeliveryVerification,
    ConditionConfirmation,
    Dispute,
    DisputeConclusion,
    ProductReturn,
    Refund,
    DisbursementApproval,
    DisbursementInitiation,
    DisbursementVerification,
    InspectionReminder,
    AutoCredit,
    DataInconsistency,
    OrderClose,
    OrderRating,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub category: TimelineCategory,
    pub event: String,
    pub at: DateTime<Utc>,
}

/// Append-only audit trail of one order.
///
/// The log lives inside the order aggregate, so entries are committed in the
/// same unit of work as the change they describe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct TimelineLog {
    entries: Vec<TimelineEntry>,
}

impl TimelineLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, category: TimelineCategory, event: impl Into<String>, at: DateTime<Utc>) -> &TimelineEntry {
        self.entries.push(TimelineEntry {
            id: Uuid::new_v4(),
            category,
            event: event.into(),
            at,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_category(&self, category: TimelineCategory) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter().filter(move |e| e.category == category)
    }

    pub fn count(&self, category: TimelineCategory) -> usize {
        self.in_category(category).count()
    }

    /// Most recent entry of a category.
    pub fn latest(&self, category: TimelineCategory) -> Option<&TimelineEntry> {
        self.entries.iter().rev().find(|e| e.category == category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_append_and_query() {
        let mut log = TimelineLog::new();
        let t0 = Utc::now();
        log.record(TimelineCategory::OrderCreation, "created", t0);
        log.record(TimelineCategory::Conditions, "condition a", t0);
        log.record(TimelineCategory::Conditions, "condition b", t0 + Duration::seconds(1));

        assert_eq!(log.len(), 3);
        assert_eq!(log.count(TimelineCategory::Conditions), 2);
        assert_eq!(log.latest(TimelineCategory::Conditions).unwrap().event, "condition b");
        assert!(log.latest(TimelineCategory::Refund).is_none());
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let mut log = TimelineLog::new();
        log.record(TimelineCategory::OrderClose, "closed", Utc::now());
        let json = serde_json::to_value(&log).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["category"], "ORDER_CLOSE");
    }
}
