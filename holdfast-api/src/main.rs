use holdfast_api::{app, state::build_engine, worker, AppState};
use holdfast_order::InspectionScheduler;
use holdfast_store::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "holdfast_api=debug,holdfast_order=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!("Starting Holdfast API on port {}", config.server.port);

    let engine = build_engine(&config).await?;

    tokio::spawn(worker::start_event_log(engine.subscribe()));

    spawn_kafka_forwarder(&config, &engine)?;

    let scheduler = Arc::new(InspectionScheduler::new(
        engine.clone(),
        chrono::Duration::hours(config.scheduler.grace_period_hours),
    ));
    tokio::spawn(worker::start_inspection_worker(
        scheduler,
        Duration::from_secs(config.scheduler.interval_seconds),
    ));

    let app = app(AppState::new(engine));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "kafka")]
fn spawn_kafka_forwarder(config: &Config, engine: &holdfast_order::LifecycleEngine) -> anyhow::Result<()> {
    if let Some(kafka) = &config.kafka {
        let producer = holdfast_store::EventProducer::new(&kafka.brokers)?;
        tokio::spawn(producer.forward(engine.subscribe()));
        tracing::info!("Forwarding escrow events to Kafka at {}", kafka.brokers);
    }
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn spawn_kafka_forwarder(config: &Config, _engine: &holdfast_order::LifecycleEngine) -> anyhow::Result<()> {
    if config.kafka.is_some() {
        tracing::warn!("Kafka configured but this build lacks the kafka feature, events stay local");
    }
    Ok(())
}
