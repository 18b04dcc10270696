use holdfast_core::ProviderKind;
use holdfast_order::LockGranularity;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    pub kafka: Option<KafkaConfig>,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub escrow: EscrowConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// Absent url means orders live in memory.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    pub webhook_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    /// Primary first.
    pub ranking: Vec<ProviderKind>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub paystack: Option<ProviderSettings>,
    pub korapay: Option<ProviderSettings>,
}

impl ProvidersConfig {
    pub fn settings(&self, kind: ProviderKind) -> Option<&ProviderSettings> {
        match kind {
            ProviderKind::Paystack => self.paystack.as_ref(),
            ProviderKind::Korapay => self.korapay.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_grace_period_hours")]
    pub grace_period_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            grace_period_hours: default_grace_period_hours(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EscrowConfig {
    #[serde(default = "default_holdings_name")]
    pub holdings_name: String,
    #[serde(default)]
    pub lock_granularity: LockGranularity,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            holdings_name: default_holdings_name(),
            lock_granularity: LockGranularity::default(),
        }
    }
}

fn default_timeout_ms() -> u64 { 15_000 }
fn default_interval_seconds() -> u64 { 6 * 60 * 60 }
fn default_grace_period_hours() -> i64 { 24 }
fn default_holdings_name() -> String { "Holdfast Escrow".into() }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // local overrides stay out of git
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `HOLDFAST__PROVIDERS__PAYSTACK__WEBHOOK_SECRET=...`
            .add_source(config::Environment::with_prefix("HOLDFAST").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml(raw: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let cfg = Config::from_toml(
            r#"
            [server]
            port = 8080

            [providers]
            ranking = ["paystack", "korapay"]

            [providers.paystack]
            webhook_secret = "sk_test"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.database.url.is_none());
        assert!(cfg.redis.url.is_none());
        assert!(cfg.kafka.is_none());
        assert_eq!(cfg.providers.ranking, vec![ProviderKind::Paystack, ProviderKind::Korapay]);
        assert_eq!(cfg.providers.timeout_ms, 15_000);
        assert_eq!(cfg.providers.settings(ProviderKind::Paystack).unwrap().webhook_secret, "sk_test");
        assert!(cfg.providers.settings(ProviderKind::Korapay).is_none());
        assert_eq!(cfg.scheduler.interval_seconds, 21_600);
        assert_eq!(cfg.scheduler.grace_period_hours, 24);
        assert_eq!(cfg.escrow.holdings_name, "Holdfast Escrow");
        assert_eq!(cfg.escrow.lock_granularity, LockGranularity::PerOrder);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = Config::from_toml(
            r#"
            [server]
            port = 1
            [providers]
            ranking = ["stripe"]
            "#,
        );
        assert!(err.is_err());
    }
}
