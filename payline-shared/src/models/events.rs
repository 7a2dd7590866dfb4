use uuid::Uuid;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct PaymentEvent {
    pub order_id: Uuid,
    pub order_no: String,
    pub user_id: String,
    pub channel_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub provider_ref: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct RefundEvent {
    pub order_id: Uuid,
    pub order_no: String,
    pub refund_id: String,
    pub amount: i64,
    pub currency: String,
    pub reason: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub product_id: Uuid,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    /// Set when the event caused an order to be created (first period or renewal).
    pub order_id: Option<Uuid>,
    pub timestamp: i64,
}

/// Every notification the engine emits after a committed change.
///
/// The variant set is closed; `name()` gives the dotted wire name used by
/// external consumers (topics, webhooks to merchants).
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    PaymentCreated(PaymentEvent),
    PaymentSucceeded(PaymentEvent),
    PaymentFailed(PaymentEvent),
    PaymentCancelled(PaymentEvent),
    PaymentRefunded(RefundEvent),
    PaymentExpired(PaymentEvent),
    SubscriptionCreated(SubscriptionEvent),
    SubscriptionRenewed(SubscriptionEvent),
    SubscriptionUpdated(SubscriptionEvent),
    SubscriptionCancelled(SubscriptionEvent),
    SubscriptionExpired(SubscriptionEvent),
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::PaymentCreated(_) => "payment.created",
            DomainEvent::PaymentSucceeded(_) => "payment.succeeded",
            DomainEvent::PaymentFailed(_) => "payment.failed",
            DomainEvent::PaymentCancelled(_) => "payment.cancelled",
            DomainEvent::PaymentRefunded(_) => "payment.refunded",
            DomainEvent::PaymentExpired(_) => "payment.expired",
            DomainEvent::SubscriptionCreated(_) => "subscription.created",
            DomainEvent::SubscriptionRenewed(_) => "subscription.renewed",
            DomainEvent::SubscriptionUpdated(_) => "subscription.updated",
            DomainEvent::SubscriptionCancelled(_) => "subscription.cancelled",
            DomainEvent::SubscriptionExpired(_) => "subscription.expired",
        }
    }

    /// Aggregate identifier, used as the partition key by publishers.
    pub fn key(&self) -> Uuid {
        match self {
            DomainEvent::PaymentCreated(e)
            | DomainEvent::PaymentSucceeded(e)
            | DomainEvent::PaymentFailed(e)
            | DomainEvent::PaymentCancelled(e)
            | DomainEvent::PaymentExpired(e) => e.order_id,
            DomainEvent::PaymentRefunded(e) => e.order_id,
            DomainEvent::SubscriptionCreated(e)
            | DomainEvent::SubscriptionRenewed(e)
            | DomainEvent::SubscriptionUpdated(e)
            | DomainEvent::SubscriptionCancelled(e)
            | DomainEvent::SubscriptionExpired(e) => e.subscription_id,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            DomainEvent::PaymentCreated(e)
            | DomainEvent::PaymentSucceeded(e)
            | DomainEvent::PaymentFailed(e)
            | DomainEvent::PaymentCancelled(e)
            | DomainEvent::PaymentExpired(e) => serde_json::to_value(e),
            DomainEvent::PaymentRefunded(e) => serde_json::to_value(e),
            DomainEvent::SubscriptionCreated(e)
            | DomainEvent::SubscriptionRenewed(e)
            | DomainEvent::SubscriptionUpdated(e)
            | DomainEvent::SubscriptionCancelled(e)
            | DomainEvent::SubscriptionExpired(e) => serde_json::to_value(e),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> PaymentEvent {
        PaymentEvent {
            order_id: Uuid::new_v4(),
            order_no: "20260101000000ABCDEF".to_string(),
            user_id: "user-1".to_string(),
            channel_id: Uuid::new_v4(),
            subscription_id: None,
            amount: 100,
            currency: "USD".to_string(),
            status: "completed".to_string(),
            provider_ref: Some("pi_123".to_string()),
            timestamp: 0,
        }
    }

    #[test]
    fn test_wire_names() {
        let p = payment();
        assert_eq!(DomainEvent::PaymentSucceeded(p.clone()).name(), "payment.succeeded");
        assert_eq!(DomainEvent::PaymentCancelled(p.clone()).name(), "payment.cancelled");
        assert_eq!(DomainEvent::PaymentCreated(p).name(), "payment.created");
    }

    #[test]
    fn test_key_and_payload() {
        let p = payment();
        let event = DomainEvent::PaymentSucceeded(p.clone());
        assert_eq!(event.key(), p.order_id);
        assert_eq!(event.payload()["provider_ref"], "pi_123");
    }
}
