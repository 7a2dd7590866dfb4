use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use payline_catalog::{Channel, Product};
use payline_core::repository::{
    ChannelRepository, Cursor, DuplicateKey, OrderFilter, OrderRepository, Page, PaymentLogRepository,
    ProductRepository, SubscriptionRepository,
};
use payline_core::{BoxError, Order, OrderStatus, PaymentLog, Subscription, SubscriptionStatus};

/// Newest-first page over an unsorted set
fn paginate<T, K>(mut items: Vec<T>, key: K, cursor: Option<Cursor>, limit: usize) -> Page<T>
where
    K: Fn(&T) -> (DateTime<Utc>, Uuid),
{
    items.sort_by(|a, b| {
        let (a_at, a_id) = key(a);
        let (b_at, b_id) = key(b);
        (b_at.timestamp_micros(), b_id).cmp(&(a_at.timestamp_micros(), a_id))
    });

    let mut items: Vec<T> = items
        .into_iter()
        .filter(|item| {
            let (at, id) = key(item);
            cursor.map_or(true, |c| c.precedes(at, id))
        })
        .take(limit + 1)
        .collect();

    let next_cursor = if items.len() > limit {
        items.truncate(limit);
        items.last().map(|last| {
            let (at, id) = key(last);
            Cursor::new(at, id)
        })
    } else {
        None
    };

    Page { items, next_cursor }
}

/// Orders held in process memory. Used by tests and local runs without a database.
#[derive(Default, Clone)]
pub struct InMemoryOrderRepository {
    orders: Arc<RwLock<HashMap<Uuid, Order>>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert_order(&self, order: &Order) -> Result<(), BoxError> {
        let mut orders = self.orders.write().await;
        if orders.values().any(|o| o.order_no == order.order_no) {
            return Err(Box::new(DuplicateKey(order.order_no.clone())));
        }
        if orders.contains_key(&order.id) {
            return Err(Box::new(DuplicateKey(order.id.to_string())));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, BoxError> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn get_order_by_no(&self, order_no: &str) -> Result<Option<Order>, BoxError> {
        let orders = self.orders.read().await;
        Ok(orders.values().find(|o| o.order_no == order_no).cloned())
    }

    async fn get_order_by_provider_ref(&self, provider_ref: &str) -> Result<Option<Order>, BoxError> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|o| o.provider_ref.as_deref() == Some(provider_ref))
            .cloned())
    }

    async fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<bool, BoxError> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(stored) if stored.status == expected => {
                *stored = order.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<Order>, BoxError> {
        let orders = self.orders.read().await;
        let matching: Vec<Order> = orders.values().filter(|o| filter.matches(o)).cloned().collect();
        Ok(paginate(matching, |o| (o.created_at, o.id), cursor, limit))
    }

    async fn count_orders(&self, filter: &OrderFilter) -> Result<u64, BoxError> {
        let orders = self.orders.read().await;
        Ok(orders.values().filter(|o| filter.matches(o)).count() as u64)
    }
}

#[derive(Default, Clone)]
pub struct InMemorySubscriptionRepository {
    subscriptions: Arc<RwLock<HashMap<Uuid, Subscription>>>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), BoxError> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&subscription.id) {
            return Err(Box::new(DuplicateKey(subscription.id.to_string())));
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, BoxError> {
        Ok(self.subscriptions.read().await.get(&id).cloned())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<bool, BoxError> {
        let mut subscriptions = self.subscriptions.write().await;
        match subscriptions.get_mut(&subscription.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = subscription.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, BoxError> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .filter(|s| s.current_period_end > now && s.current_period_end <= until)
            .cloned()
            .collect())
    }

    async fn list_lapsed(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, BoxError> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.current_period_end <= now)
            .cloned()
            .collect())
    }

    async fn list_subscriptions(
        &self,
        user_id: &str,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<Subscription>, BoxError> {
        let subscriptions = self.subscriptions.read().await;
        let owned: Vec<Subscription> = subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        Ok(paginate(owned, |s| (s.created_at, s.id), cursor, limit))
    }
}

#[derive(Default, Clone)]
pub struct InMemoryChannelRepository {
    channels: Arc<RwLock<HashMap<Uuid, Channel>>>,
}

impl InMemoryChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelRepository for InMemoryChannelRepository {
    async fn insert_channel(&self, channel: &Channel) -> Result<(), BoxError> {
        self.channels.write().await.insert(channel.id, channel.clone());
        Ok(())
    }

    async fn get_channel(&self, id: Uuid) -> Result<Option<Channel>, BoxError> {
        Ok(self.channels.read().await.get(&id).cloned())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, BoxError> {
        let mut channels: Vec<Channel> = self.channels.read().await.values().cloned().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryProductRepository {
    products: Arc<RwLock<HashMap<Uuid, Product>>>,
}

impl InMemoryProductRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository {
    async fn insert_product(&self, product: &Product) -> Result<(), BoxError> {
        self.products.write().await.insert(product.id, product.clone());
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, BoxError> {
        Ok(self.products.read().await.get(&id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>, BoxError> {
        let mut products: Vec<Product> = self.products.read().await.values().cloned().collect();
        products.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(products)
    }
}

/// Append-only log; entries keep insertion order
#[derive(Default, Clone)]
pub struct InMemoryPaymentLogRepository {
    entries: Arc<RwLock<Vec<PaymentLog>>>,
}

impl InMemoryPaymentLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Every entry across all orders, oldest first
    pub async fn all(&self) -> Vec<PaymentLog> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl PaymentLogRepository for InMemoryPaymentLogRepository {
    async fn append(&self, entry: &PaymentLog) -> Result<(), BoxError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_for_order(&self, order_id: Uuid) -> Result<Vec<PaymentLog>, BoxError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.order_id == Some(order_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use payline_catalog::PaymentType;

    fn order(created_at: DateTime<Utc>) -> Order {
        let mut order = Order::new(
            "user-1".to_string(),
            Uuid::new_v4(),
            PaymentType::OneTime,
            500,
            "USD".to_string(),
            created_at + Duration::hours(24),
        );
        order.created_at = created_at;
        order
    }

    #[tokio::test]
    async fn test_duplicate_order_no_rejected() {
        let repo = InMemoryOrderRepository::new();
        let first = order(Utc::now());
        repo.insert_order(&first).await.unwrap();

        let mut second = order(Utc::now());
        second.order_no = first.order_no.clone();
        let err = repo.insert_order(&second).await.unwrap_err();
        assert!(err.downcast_ref::<DuplicateKey>().is_some());
    }

    #[tokio::test]
    async fn test_update_is_conditional_on_status() {
        let repo = InMemoryOrderRepository::new();
        let mut stored = order(Utc::now());
        repo.insert_order(&stored).await.unwrap();

        stored.set_status(OrderStatus::Completed, Utc::now());
        assert!(repo.update_order(&stored, OrderStatus::Pending).await.unwrap());

        // Second writer still believes the order is pending
        let mut stale = stored.clone();
        stale.set_status(OrderStatus::Failed, Utc::now());
        assert!(!repo.update_order(&stale, OrderStatus::Pending).await.unwrap());

        let current = repo.get_order(stored.id).await.unwrap().unwrap();
        assert_eq!(current.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_orders_pages_newest_first() {
        let repo = InMemoryOrderRepository::new();
        let base = Utc::now();
        for i in 0..5 {
            repo.insert_order(&order(base - Duration::minutes(i))).await.unwrap();
        }

        let filter = OrderFilter::default();
        let first = repo.list_orders(&filter, None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.items[0].created_at > first.items[1].created_at);
        let cursor = first.next_cursor.expect("more pages");

        let second = repo.list_orders(&filter, Some(cursor), 2).await.unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.items[0].created_at < first.items[1].created_at);

        let third = repo.list_orders(&filter, second.next_cursor, 2).await.unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_subscription_version_guard() {
        let repo = InMemorySubscriptionRepository::new();
        let now = Utc::now();
        let sub = Subscription::new("user-1".to_string(), Uuid::new_v4(), Uuid::new_v4(), now, now + Duration::days(30));
        repo.insert_subscription(&sub).await.unwrap();

        let next = sub.next_version();
        assert!(repo.update_subscription(&next, sub.version).await.unwrap());
        assert!(!repo.update_subscription(&next.next_version(), sub.version).await.unwrap());
    }

    #[tokio::test]
    async fn test_renewal_window() {
        let repo = InMemorySubscriptionRepository::new();
        let now = Utc::now();
        let soon = Subscription::new("u".to_string(), Uuid::new_v4(), Uuid::new_v4(), now - Duration::days(29), now + Duration::hours(2));
        let later = Subscription::new("u".to_string(), Uuid::new_v4(), Uuid::new_v4(), now, now + Duration::days(30));
        let lapsed = Subscription::new("u".to_string(), Uuid::new_v4(), Uuid::new_v4(), now - Duration::days(31), now - Duration::days(1));
        for sub in [&soon, &later, &lapsed] {
            repo.insert_subscription(sub).await.unwrap();
        }

        let due = repo.list_due_for_renewal(now, now + Duration::hours(24)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, soon.id);

        let gone = repo.list_lapsed(now).await.unwrap();
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].id, lapsed.id);
    }
}
