#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use payline_catalog::{Channel, PaymentType, Product, ProviderKind};
use payline_core::events::{EventBus, EventPublisher, EventSubscriber};
use payline_core::repository::{ChannelRepository, ProductRepository};
use payline_core::BoxError;
use payline_order::mock::SIGNATURE_HEADER;
use payline_order::{
    AuditLog, EngineSettings, MockProvider, MockProviderFactory, OrderLifecycle, ProviderRegistry, Stores,
    SubscriptionBiller, SubscriptionService,
};
use payline_shared::DomainEvent;
use payline_store::{
    InMemoryChannelRepository, InMemoryOrderRepository, InMemoryPaymentLogRepository, InMemoryProductRepository,
    InMemorySubscriptionRepository,
};

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Captures every published event
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<DomainEvent>>,
}

impl Recorder {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSubscriber for Recorder {
    async fn handle(&self, event: &DomainEvent) -> Result<(), BoxError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Publisher that always fails, to check that commits survive it
pub struct BrokenPublisher;

#[async_trait]
impl EventPublisher for BrokenPublisher {
    async fn publish(&self, _event: &DomainEvent) -> Result<(), BoxError> {
        Err("broker unavailable".into())
    }
}

pub struct Harness {
    pub lifecycle: Arc<OrderLifecycle>,
    pub subscriptions: SubscriptionService,
    pub biller: SubscriptionBiller,
    pub provider: Arc<MockProvider>,
    pub factory: Arc<MockProviderFactory>,
    pub recorder: Arc<Recorder>,
    pub logs: InMemoryPaymentLogRepository,
    pub stores: Stores,
    pub channel: Channel,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(EngineSettings::default()).await
    }

    pub async fn with_settings(settings: EngineSettings) -> Self {
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone());
        Self::build(settings, bus, recorder).await
    }

    pub async fn with_publisher(publisher: Arc<dyn EventPublisher>) -> Self {
        Self::build(EngineSettings::default(), publisher, Arc::new(Recorder::default())).await
    }

    async fn build(settings: EngineSettings, events: Arc<dyn EventPublisher>, recorder: Arc<Recorder>) -> Self {
        let logs = InMemoryPaymentLogRepository::new();
        let stores = Stores {
            orders: Arc::new(InMemoryOrderRepository::new()),
            subscriptions: Arc::new(InMemorySubscriptionRepository::new()),
            channels: Arc::new(InMemoryChannelRepository::new()),
            products: Arc::new(InMemoryProductRepository::new()),
            logs: Arc::new(logs.clone()),
        };

        let provider = Arc::new(MockProvider::new(ProviderKind::Custom).with_webhook_secret(WEBHOOK_SECRET));
        let factory = Arc::new(MockProviderFactory::shared(provider.clone()));
        let registry = Arc::new(ProviderRegistry::new(factory.clone()));
        let audit = Arc::new(AuditLog::new(stores.logs.clone()));
        let lifecycle = Arc::new(OrderLifecycle::new(stores.clone(), registry, audit, events, settings));

        let channel = Channel::new(
            "mock-main",
            ProviderKind::Custom,
            &[PaymentType::OneTime, PaymentType::Subscription],
        );
        stores.channels.insert_channel(&channel).await.unwrap();

        Self {
            subscriptions: SubscriptionService::new(lifecycle.clone()),
            biller: SubscriptionBiller::new(lifecycle.clone()),
            lifecycle,
            provider,
            factory,
            recorder,
            logs,
            stores,
            channel,
        }
    }

    pub async fn add_channel(&self, channel: Channel) -> Channel {
        self.stores.channels.insert_channel(&channel).await.unwrap();
        channel
    }

    pub async fn add_product(&self, product: Product) -> Product {
        self.stores.products.insert_product(&product).await.unwrap();
        product
    }

    /// Number of audit entries that recorded an actual status change
    pub async fn changes(&self) -> usize {
        self.logs.all().await.iter().filter(|l| l.is_change()).count()
    }
}

pub fn signed_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(SIGNATURE_HEADER.to_string(), WEBHOOK_SECRET.to_string());
    headers
}

pub fn webhook(order_no: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "type": format!("payment.{}", status),
        "order_no": order_no,
        "status": status,
        "provider_ref": "custom_pi_webhook",
    })
    .to_string()
    .into_bytes()
}

pub fn short_timeout() -> EngineSettings {
    EngineSettings {
        provider_timeout: Duration::from_millis(50),
        ..EngineSettings::default()
    }
}
