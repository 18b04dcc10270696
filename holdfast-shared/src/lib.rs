pub mod models;
pub mod pii;

pub use models::events::EscrowEvent;
pub use pii::Masked;
