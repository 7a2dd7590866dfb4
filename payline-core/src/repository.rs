use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use payline_catalog::{Channel, Product};
use crate::models::{Order, OrderStatus, PaymentLog, Subscription};
use crate::BoxError;

/// Returned by `insert_order` when the order number is already taken.
#[derive(Debug, thiserror::Error)]
#[error("duplicate key: {0}")]
pub struct DuplicateKey(pub String);

/// Opaque pagination cursor: position of the last item seen, newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at_micros: i64,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self {
            created_at_micros: created_at.timestamp_micros(),
            id,
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.created_at_micros, self.id))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        let (micros, id) = text.split_once(':')?;
        Some(Self {
            created_at_micros: micros.parse().ok()?,
            id: Uuid::parse_str(id).ok()?,
        })
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.created_at_micros)
    }

    /// Whether an item at `(created_at, id)` comes after this cursor in
    /// newest-first order.
    pub fn precedes(&self, created_at: DateTime<Utc>, id: Uuid) -> bool {
        (created_at.timestamp_micros(), id) < (self.created_at_micros, self.id)
    }
}

/// Filter for order listings; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub user_id: Option<String>,
    pub channel_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    /// Only orders whose `expires_at` is before this instant
    pub expires_before: Option<DateTime<Utc>>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.user_id.as_ref().map_or(true, |u| &order.user_id == u)
            && self.channel_id.map_or(true, |c| order.channel_id == c)
            && self.subscription_id.map_or(true, |s| order.subscription_id == Some(s))
            && self.status.map_or(true, |s| order.status == s)
            && self.expires_before.map_or(true, |t| order.expires_at < t)
    }
}

/// A page of results plus the cursor for the next page, if any
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Fails with `DuplicateKey` if the order number already exists
    async fn insert_order(&self, order: &Order) -> Result<(), BoxError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, BoxError>;

    async fn get_order_by_no(&self, order_no: &str) -> Result<Option<Order>, BoxError>;

    async fn get_order_by_provider_ref(&self, provider_ref: &str) -> Result<Option<Order>, BoxError>;

    /// Compare-and-swap: writes `order` only if the stored status is still
    /// `expected`. Returns false when another writer got there first.
    async fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<bool, BoxError>;

    /// Newest-first
    async fn list_orders(
        &self,
        filter: &OrderFilter,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<Order>, BoxError>;

    async fn count_orders(&self, filter: &OrderFilter) -> Result<u64, BoxError>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), BoxError>;

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, BoxError>;

    /// Writes `subscription` only if the stored version is still
    /// `expected_version`. Returns false on a concurrent write.
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<bool, BoxError>;

    /// Active subscriptions whose period ends in `(now, until]`
    async fn list_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, BoxError>;

    /// Active subscriptions whose period ended at or before `now`
    async fn list_lapsed(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, BoxError>;

    async fn list_subscriptions(
        &self,
        user_id: &str,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<Subscription>, BoxError>;
}

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn insert_channel(&self, channel: &Channel) -> Result<(), BoxError>;

    async fn get_channel(&self, id: Uuid) -> Result<Option<Channel>, BoxError>;

    async fn list_channels(&self) -> Result<Vec<Channel>, BoxError>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn insert_product(&self, product: &Product) -> Result<(), BoxError>;

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, BoxError>;

    async fn list_products(&self) -> Result<Vec<Product>, BoxError>;
}

/// Append-only; entries are never updated
#[async_trait]
pub trait PaymentLogRepository: Send + Sync {
    async fn append(&self, entry: &PaymentLog) -> Result<(), BoxError>;

    /// Oldest-first history of one order
    async fn list_for_order(&self, order_id: Uuid) -> Result<Vec<PaymentLog>, BoxError>;
}
