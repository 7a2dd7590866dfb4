use std::sync::Arc;
use std::time::Duration;
use payline_order::{EngineSettings, OrderLifecycle, SubscriptionService};
use payline_store::app_config::Config;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<OrderLifecycle>,
    pub subscriptions: Arc<SubscriptionService>,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(lifecycle: Arc<OrderLifecycle>, auth: AuthConfig) -> Self {
        Self {
            subscriptions: Arc::new(SubscriptionService::new(lifecycle.clone())),
            lifecycle,
            auth,
        }
    }
}

/// Engine knobs taken from the `payments` and `billing` config sections
pub fn engine_settings(config: &Config) -> EngineSettings {
    let defaults = EngineSettings::default();
    EngineSettings {
        base_currency: config.payments.base_currency.to_uppercase(),
        supported_currencies: config
            .payments
            .supported_currencies
            .iter()
            .map(|c| c.to_uppercase())
            .collect(),
        default_order_ttl: chrono::Duration::hours(config.payments.default_order_ttl_hours),
        provider_timeout: Duration::from_millis(config.payments.provider_timeout_ms),
        renewal_lookahead: chrono::Duration::hours(config.billing.renewal_lookahead_hours),
        ..defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payline_store::app_config::{AuthConfig as AuthSection, BillingConfig, DatabaseConfig, PaymentsConfig, ServerConfig};

    #[test]
    fn test_engine_settings_from_config() {
        let config = Config {
            server: ServerConfig { port: 8080 },
            database: DatabaseConfig {
                url: "postgres://localhost/payline".to_string(),
                max_connections: 5,
            },
            auth: AuthSection {
                jwt_secret: "secret".to_string(),
                jwt_expiration_seconds: 60,
            },
            billing: BillingConfig {
                renewal_lookahead_hours: 48,
                ..BillingConfig::default()
            },
            payments: PaymentsConfig {
                base_currency: "eur".to_string(),
                provider_timeout_ms: 2500,
                ..PaymentsConfig::default()
            },
            kafka: None,
        };

        let settings = engine_settings(&config);
        assert_eq!(settings.base_currency, "EUR");
        assert_eq!(settings.provider_timeout, Duration::from_millis(2500));
        assert_eq!(settings.renewal_lookahead, chrono::Duration::hours(48));
        assert_eq!(settings.default_order_ttl, chrono::Duration::hours(24));
        assert_eq!(settings.batch_size, EngineSettings::default().batch_size);
    }
}
