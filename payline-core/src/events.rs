use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use payline_shared::DomainEvent;
use crate::BoxError;

/// Sink for committed-change notifications. Delivery is best-effort.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), BoxError>;
}

/// In-process reaction to domain events
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<(), BoxError>;
}

/// Fan-out publisher over registered subscribers.
///
/// A failing subscriber is logged and skipped; the remaining subscribers
/// still receive the event.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        match self.subscribers.write() {
            Ok(mut subs) => subs.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventSubscriber>> {
        match self.subscribers.read() {
            Ok(subs) => subs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: &DomainEvent) -> Result<(), BoxError> {
        for subscriber in self.snapshot() {
            if let Err(e) = subscriber.handle(event).await {
                tracing::warn!(event = event.name(), error = %e, "Event subscriber failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payline_shared::SubscriptionEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EventSubscriber for Counting {
        async fn handle(&self, _event: &DomainEvent) -> Result<(), BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSubscriber for Failing {
        async fn handle(&self, _event: &DomainEvent) -> Result<(), BoxError> {
            Err("subscriber down".into())
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::SubscriptionExpired(SubscriptionEvent {
            subscription_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            product_id: Uuid::new_v4(),
            status: "expired".to_string(),
            current_period_start: 0,
            current_period_end: 0,
            order_id: None,
            timestamp: 0,
        })
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(counter.clone());

        assert!(bus.publish(&event()).await.is_ok());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 2);
    }
}
