use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    pub kafka: Option<KafkaConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

/// Schedules for the background passes
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BillingConfig {
    pub renewal_lookahead_hours: i64,
    pub renewal_interval_seconds: u64,
    pub expiry_interval_seconds: u64,
    pub order_expiry_interval_seconds: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            renewal_lookahead_hours: 24,
            renewal_interval_seconds: 3600,
            expiry_interval_seconds: 3600,
            order_expiry_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaymentsConfig {
    pub default_order_ttl_hours: i64,
    pub provider_timeout_ms: u64,
    pub base_currency: String,
    pub supported_currencies: Vec<String>,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            default_order_ttl_hours: 24,
            provider_timeout_ms: 15_000,
            base_currency: "USD".to_string(),
            supported_currencies: vec![
                "USD".to_string(),
                "EUR".to_string(),
                "GBP".to_string(),
                "CNY".to_string(),
                "JPY".to_string(),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String { "payline".to_string() }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `PAYLINE__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("PAYLINE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
