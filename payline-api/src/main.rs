use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use payline_api::{app, state::{engine_settings, AppState, AuthConfig}, worker};
use payline_core::events::EventPublisher;
use payline_order::{AuditLog, MockProviderFactory, OrderLifecycle, ProviderRegistry, Stores};
use payline_store::app_config::Config;
use payline_store::{
    DbClient, LogPublisher, PgChannelRepository, PgOrderRepository, PgPaymentLogRepository, PgProductRepository,
    PgSubscriptionRepository,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payline_api=debug,payline_order=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Payline API on port {}", config.server.port);

    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    let stores = Stores {
        orders: Arc::new(PgOrderRepository::new(db.pool.clone())),
        subscriptions: Arc::new(PgSubscriptionRepository::new(db.pool.clone())),
        channels: Arc::new(PgChannelRepository::new(db.pool.clone())),
        products: Arc::new(PgProductRepository::new(db.pool.clone())),
        logs: Arc::new(PgPaymentLogRepository::new(db.pool.clone())),
    };

    // Provider HTTP integrations are plugged in through `ProviderFactory`;
    // this binary ships the sandbox provider only.
    tracing::warn!("Using sandbox payment providers");
    let registry = Arc::new(ProviderRegistry::new(Arc::new(MockProviderFactory::new())));
    let audit = Arc::new(AuditLog::new(stores.logs.clone()));
    let events = publisher(&config)?;

    let lifecycle = Arc::new(OrderLifecycle::new(stores, registry, audit, events, engine_settings(&config)));
    let _workers = worker::start_billing_worker(lifecycle.clone(), &config.billing);

    let app_state = AppState::new(
        lifecycle,
        AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(app_state)).await?;
    Ok(())
}

#[cfg(feature = "kafka")]
fn publisher(config: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    match &config.kafka {
        Some(kafka) => {
            let producer = payline_store::EventProducer::new(&kafka.brokers, &kafka.topic_prefix)
                .context("Failed to create Kafka producer")?;
            Ok(Arc::new(producer))
        }
        None => Ok(Arc::new(LogPublisher)),
    }
}

#[cfg(not(feature = "kafka"))]
fn publisher(config: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    if config.kafka.is_some() {
        tracing::warn!("Kafka configured but the binary was built without the `kafka` feature; logging events only");
    }
    Ok(Arc::new(LogPublisher))
}
