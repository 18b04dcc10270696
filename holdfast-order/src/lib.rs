pub mod conditions;
pub mod disbursement;
pub mod disputes;
pub mod error;
pub mod inspection;
pub mod lifecycle;
pub mod locks;
pub mod models;
pub mod repository;
pub mod resiliency;
pub mod timeline;

#[cfg(test)]
pub(crate) mod testing;

pub use conditions::ConditionLedger;
pub use disbursement::{
    CoordinatorSettings, DisbursementCoordinator, PendingTransfer, ReconcileOutcome, TransferHandle,
};
pub use disputes::{DisputeConclusion, DisputeDraft};
pub use error::{EscrowError, EscrowResult, StoreError};
pub use inspection::{InspectionScheduler, SweepReport};
pub use lifecycle::{LifecycleEngine, NewOrder, PaymentReceipt, PaymentSession};
pub use locks::{LockGranularity, OrderLocks};
pub use models::{Order, OrderAggregate};
pub use repository::{MemoryOrderRepository, OrderRepository};
pub use timeline::{TimelineCategory, TimelineEntry, TimelineLog};
