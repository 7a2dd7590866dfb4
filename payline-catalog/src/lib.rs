pub mod product;
pub mod pricing;
pub mod channel;

pub use product::{Product, PricingType, ProductError};
pub use pricing::BillingInterval;
pub use channel::{Channel, ChannelStatus, PaymentType, ProviderKind};
