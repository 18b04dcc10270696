pub mod fees;
pub mod payment;
pub mod repository;
pub mod sandbox;
pub mod webhook;

pub use fees::{FeeQuote, FeeSchedule};
pub use payment::{PaymentProvider, PayoutAccount, ProviderError, ProviderKind};
pub use repository::{KeyValueStore, MemoryKeyValueStore};
pub use webhook::{WebhookEnvelope, WebhookEventKind, WebhookVerifier};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Store unavailable: {0}")]
    StoreError(String),
    #[error("Serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
