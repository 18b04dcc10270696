use anyhow::Context;
use holdfast_core::sandbox::SandboxProvider;
use holdfast_core::{FeeSchedule, KeyValueStore, MemoryKeyValueStore, PaymentProvider, WebhookVerifier};
use holdfast_order::{
    CoordinatorSettings, DisbursementCoordinator, LifecycleEngine, MemoryOrderRepository, OrderLocks, OrderRepository,
};
use holdfast_store::{Config, DbClient, PgOrderRepository, RedisKeyValueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LifecycleEngine>,
}

impl AppState {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }
}

/// Wires storage, providers and the engine from configuration.
pub async fn build_engine(config: &Config) -> anyhow::Result<Arc<LifecycleEngine>> {
    let repo: Arc<dyn OrderRepository> = match &config.database.url {
        Some(url) => {
            let db = DbClient::new(url).await.context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;
            Arc::new(PgOrderRepository::new(db.pool.clone()))
        }
        None => {
            tracing::warn!("No database configured, orders are kept in memory");
            Arc::new(MemoryOrderRepository::new())
        }
    };

    let kv: Arc<dyn KeyValueStore> = match &config.redis.url {
        Some(url) => Arc::new(RedisKeyValueStore::new(url).await.context("Failed to connect to Redis")?),
        None => {
            tracing::warn!("No Redis configured, pending transfers are kept in memory");
            Arc::new(MemoryKeyValueStore::new())
        }
    };

    if config.providers.ranking.is_empty() {
        anyhow::bail!("providers.ranking must name at least one provider");
    }

    let mut ranking: Vec<Arc<dyn PaymentProvider>> = Vec::new();
    let mut verifiers = Vec::new();
    for kind in &config.providers.ranking {
        let secret = &config
            .providers
            .settings(*kind)
            .with_context(|| format!("No settings for provider {}", kind))?
            .webhook_secret;
        tracing::info!("Registering sandbox {} provider", kind);
        ranking.push(Arc::new(SandboxProvider::new(*kind, secret)));
        verifiers.push((*kind, WebhookVerifier::for_provider(*kind, secret.as_bytes())));
    }

    let settings = CoordinatorSettings {
        provider_timeout: Duration::from_millis(config.providers.timeout_ms),
        holdings_name: config.escrow.holdings_name.clone(),
        ..Default::default()
    };
    let (events, _) = broadcast::channel(1024);
    let locks = Arc::new(OrderLocks::new(config.escrow.lock_granularity));

    let mut coordinator = DisbursementCoordinator::new(ranking, kv, repo.clone(), locks, events, settings);
    for (kind, verifier) in verifiers {
        coordinator = coordinator.with_verifier(kind, verifier);
    }

    Ok(Arc::new(LifecycleEngine::new(repo, Arc::new(coordinator), FeeSchedule::standard())))
}
