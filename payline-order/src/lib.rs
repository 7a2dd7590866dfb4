pub mod audit;
pub mod registry;
pub mod manager;
pub mod reconciler;
pub mod subscription;
pub mod billing;
pub mod mock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use payline_core::repository::{
    ChannelRepository, OrderRepository, PaymentLogRepository, ProductRepository, SubscriptionRepository,
};
use payline_core::{BoxError, CoreError, CoreResult};

pub use audit::AuditLog;
pub use registry::ProviderRegistry;
pub use manager::{CreateOrderInput, OrderLifecycle, TransitionOutcome};
pub use reconciler::{WebhookReceipt, WebhookReconciler};
pub use subscription::{CreateSubscriptionInput, SubscriptionCreated, SubscriptionService};
pub use billing::{BatchReport, SubscriptionBiller};
pub use mock::{MockProvider, MockProviderFactory};

/// Persistence ports the engine works against
#[derive(Clone)]
pub struct Stores {
    pub orders: Arc<dyn OrderRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub products: Arc<dyn ProductRepository>,
    pub logs: Arc<dyn PaymentLogRepository>,
}

/// Who triggered a lifecycle attempt, recorded on audit entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ip_address: None,
        }
    }

    /// Background jobs and provider callbacks
    pub fn system(name: &str) -> Self {
        Self {
            user_id: Some(format!("system:{}", name)),
            ip_address: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Used when an order does not name a currency
    pub base_currency: String,
    pub supported_currencies: Vec<String>,
    pub default_order_ttl: chrono::Duration,
    /// Upper bound on every outbound provider call
    pub provider_timeout: Duration,
    pub renewal_lookahead: chrono::Duration,
    /// Page size used by batch sweeps
    pub batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_currency: "USD".to_string(),
            supported_currencies: ["USD", "EUR", "GBP", "CNY", "JPY"].iter().map(|c| c.to_string()).collect(),
            default_order_ttl: chrono::Duration::hours(24),
            provider_timeout: Duration::from_secs(15),
            renewal_lookahead: chrono::Duration::hours(24),
            batch_size: 100,
        }
    }
}

/// Run a provider call under the configured deadline. A timeout is a failure,
/// never an ambiguous success.
pub(crate) async fn bounded<T, F>(timeout: Duration, call: F) -> CoreResult<T>
where
    F: Future<Output = Result<T, BoxError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CoreError::ProviderError(e.to_string())),
        Err(_) => Err(CoreError::TimeoutError(timeout.as_millis() as u64)),
    }
}
