use futures_util::FutureExt;
use holdfast_order::InspectionScheduler;
use holdfast_shared::EscrowEvent;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Runs the inspection sweep on a fixed interval, forever.
pub async fn start_inspection_worker(scheduler: Arc<InspectionScheduler>, every: Duration) {
    info!("Inspection worker started, sweeping every {:?}", every);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let s = scheduler.clone();
        match AssertUnwindSafe(async move { s.sweep().await }).catch_unwind().await {
            Ok(report) if report.failed > 0 => warn!("Inspection sweep finished with {} failures", report.failed),
            Ok(_) => {}
            Err(_) => error!("Inspection sweep task panicked"),
        }
    }
}

/// Logs every committed escrow event until the channel closes. Notification
/// dispatch subscribes the same way.
pub async fn start_event_log(mut events: broadcast::Receiver<EscrowEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => info!(topic = event.topic(), order_id = %event.order_id(), "escrow event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!("Event log lagged, skipped {}", skipped),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
