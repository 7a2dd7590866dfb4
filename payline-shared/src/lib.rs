pub mod models;
pub mod pii;

pub use models::events::{DomainEvent, PaymentEvent, RefundEvent, SubscriptionEvent};
pub use pii::Masked;
