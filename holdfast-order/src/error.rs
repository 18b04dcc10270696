use uuid::Uuid;

/// Failures of the persistence layer behind [`crate::repository::OrderRepository`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order {id} was modified concurrently (expected version {expected}, found {found})")]
    Conflict { id: Uuid, expected: u64, found: u64 },

    #[error("Order {0} already exists")]
    Duplicate(Uuid),

    #[error("Order {0} is not stored")]
    Missing(Uuid),

    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("Stored order could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("Already done: {0}")]
    AlreadyDone(String),

    #[error("Condition {0} has already been met")]
    AlreadyMet(Uuid),

    #[error("Condition {0} is already disputed")]
    AlreadyDisputed(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment providers failed: {0}")]
    ProviderFailure(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EscrowError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        EscrowError::PreconditionNotMet(msg.into())
    }

    pub fn already(msg: impl Into<String>) -> Self {
        EscrowError::AlreadyDone(msg.into())
    }

    /// Business-rule rejections the caller can act on, as opposed to
    /// infrastructure failures.
    pub fn is_business_rule(&self) -> bool {
        !matches!(self, EscrowError::Store(_) | EscrowError::ProviderFailure(_))
    }
}

impl From<holdfast_core::CoreError> for EscrowError {
    fn from(err: holdfast_core::CoreError) -> Self {
        match err {
            holdfast_core::CoreError::ValidationError(msg) => EscrowError::Validation(msg),
            holdfast_core::CoreError::StoreError(msg) => EscrowError::Store(StoreError::Backend(msg)),
            holdfast_core::CoreError::SerializationError(e) => EscrowError::Store(StoreError::Serialization(e)),
        }
    }
}

pub type EscrowResult<T> = Result<T, EscrowError>;
