use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use payline_catalog::PaymentType;

/// Order status in the payment lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

/// Result of asking the state machine to move an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Legal move; the caller must persist it
    Applied { from: OrderStatus, to: OrderStatus },
    /// Requested status equals the current one
    Unchanged,
    /// Not allowed from the current status; dropped without error
    Ignored { current: OrderStatus, requested: OrderStatus },
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// True once the payment outcome is settled (anything but `pending`).
    /// A settled `completed` order can still be refunded; see `can_transition_to`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    /// Transition table
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        matches!(
            (self, to),
            (OrderStatus::Pending, OrderStatus::Completed)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
                | (OrderStatus::Completed, OrderStatus::Refunded)
        )
    }

    pub fn transition_to(&self, to: OrderStatus) -> Transition {
        if *self == to {
            Transition::Unchanged
        } else if self.can_transition_to(to) {
            Transition::Applied { from: *self, to }
        } else {
            Transition::Ignored { current: *self, requested: to }
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// A single payment attempt. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub order_no: String,
    /// Amount in minor currency units
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_type: PaymentType,
    pub channel_id: Uuid,
    pub user_id: String,
    pub product_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub provider_ref: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        user_id: String,
        channel_id: Uuid,
        payment_type: PaymentType,
        amount: i64,
        currency: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_no: Self::generate_order_no(now),
            amount,
            currency,
            status: OrderStatus::Pending,
            payment_type,
            channel_id,
            user_id,
            product_id: None,
            subscription_id: None,
            expires_at,
            paid_at: None,
            provider_ref: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// `yyyyMMddHHmmssSSS` followed by six random alphanumerics.
    ///
    /// Collisions are unlikely but possible; inserts must be retried with a
    /// fresh number on a uniqueness violation.
    pub fn generate_order_no(now: DateTime<Utc>) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect::<String>()
            .to_ascii_uppercase();
        format!("{}{}", now.format("%Y%m%d%H%M%S%3f"), suffix)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Set the new status; stamps `paid_at` on the first entry into `completed`.
    pub fn set_status(&mut self, status: OrderStatus, now: DateTime<Utc>) {
        if status == OrderStatus::Completed && self.paid_at.is_none() {
            self.paid_at = Some(now);
        }
        self.status = status;
        self.updated_at = now;
    }

    /// Shallow merge of a JSON object into the metadata map
    pub fn merge_metadata(&mut self, extra: &serde_json::Value) {
        let Some(extra) = extra.as_object() else {
            return;
        };
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Sum of refund records already attached to this order
    pub fn refunded_amount(&self) -> i64 {
        self.metadata
            .get("refunds")
            .and_then(|v| v.as_array())
            .map(|refunds| {
                refunds
                    .iter()
                    .filter_map(|r| r.get("amount").and_then(|a| a.as_i64()))
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn refundable_amount(&self) -> i64 {
        self.amount - self.refunded_amount()
    }

    /// Append a refund record; refunds accumulate as a list
    pub fn push_refund(&mut self, record: serde_json::Value) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            let refunds = map
                .entry("refunds")
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let Some(list) = refunds.as_array_mut() {
                list.push(record);
            } else {
                *refunds = serde_json::Value::Array(vec![record]);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Cancelled,
    Expired,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::PastDue => "past_due",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

/// A recurring commitment to a product
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub product_id: Uuid,
    pub channel_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    /// Scheduled cancellation, effective at this instant
    pub cancel_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub provider_ref: Option<String>,
    pub metadata: serde_json::Value,
    /// Bumped on every write; conditional updates compare against it
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        user_id: String,
        product_id: Uuid,
        channel_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            product_id,
            channel_id,
            status: SubscriptionStatus::Active,
            current_period_start: period_start,
            current_period_end: period_end,
            trial_start: None,
            trial_end: None,
            cancel_at: None,
            cancelled_at: None,
            provider_ref: None,
            metadata: serde_json::json!({}),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy prepared for a conditional write against `self.version`
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next
    }

    pub fn in_trial(&self, now: DateTime<Utc>) -> bool {
        matches!((self.trial_start, self.trial_end), (Some(start), Some(end)) if start <= now && now < end)
    }

    /// Move to the next billing period. Returns false (and changes nothing) when
    /// the subscription is terminal or the period is empty.
    pub fn advance_period(&mut self, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || end <= start {
            return false;
        }
        self.current_period_start = start;
        self.current_period_end = end;
        self.updated_at = now;
        true
    }

    /// Whether a scheduled cancellation takes effect by the end of the current period
    pub fn cancels_at_period_end(&self) -> bool {
        self.cancel_at.is_some_and(|at| at <= self.current_period_end)
    }
}

/// Kind of audit entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Create,
    Update,
    Verify,
    Callback,
    Refund,
    Error,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Create => "create",
            LogType::Update => "update",
            LogType::Verify => "verify",
            LogType::Callback => "callback",
            LogType::Refund => "refund",
            LogType::Error => "error",
        }
    }
}

impl std::str::FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(LogType::Create),
            "update" => Ok(LogType::Update),
            "verify" => Ok(LogType::Verify),
            "callback" => Ok(LogType::Callback),
            "refund" => Ok(LogType::Refund),
            "error" => Ok(LogType::Error),
            other => Err(format!("unknown log type: {}", other)),
        }
    }
}

/// Immutable audit record of one lifecycle attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentLog {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub log_type: LogType,
    pub status_before: Option<OrderStatus>,
    pub status_after: Option<OrderStatus>,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub actor: Option<String>,
    pub ip_address: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentLog {
    /// True when the entry records an actual status change
    pub fn is_change(&self) -> bool {
        matches!((self.status_before, self.status_after), (Some(before), Some(after)) if before != after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn order() -> Order {
        Order::new(
            "user-1".to_string(),
            Uuid::new_v4(),
            PaymentType::OneTime,
            100,
            "USD".to_string(),
            Utc::now() + Duration::hours(24),
        )
    }

    #[test]
    fn test_transition_table() {
        use OrderStatus::*;
        let all = [Pending, Completed, Failed, Cancelled, Refunded];

        for from in all {
            for to in all {
                let expected = matches!(
                    (from, to),
                    (Pending, Completed) | (Pending, Failed) | (Pending, Cancelled) | (Completed, Refunded)
                );
                assert_eq!(from.can_transition_to(to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_transition_outcomes() {
        use OrderStatus::*;
        assert_eq!(Pending.transition_to(Pending), Transition::Unchanged);
        assert_eq!(Pending.transition_to(Completed), Transition::Applied { from: Pending, to: Completed });
        assert_eq!(
            Failed.transition_to(Completed),
            Transition::Ignored { current: Failed, requested: Completed }
        );
        assert_eq!(Refunded.transition_to(Refunded), Transition::Unchanged);
    }

    #[test]
    fn test_paid_at_set_once() {
        let mut order = order();
        let first = Utc::now();
        order.set_status(OrderStatus::Completed, first);
        assert_eq!(order.paid_at, Some(first));

        order.set_status(OrderStatus::Refunded, first + Duration::minutes(5));
        assert_eq!(order.paid_at, Some(first));
    }

    #[test]
    fn test_order_no_format() {
        let no = Order::generate_order_no(Utc::now());
        assert_eq!(no.len(), 23);
        assert!(no[..17].chars().all(|c| c.is_ascii_digit()));
        assert_ne!(no, Order::generate_order_no(Utc::now()));
    }

    #[test]
    fn test_refund_records_accumulate() {
        let mut order = order();
        order.push_refund(serde_json::json!({"refund_id": "re_1", "amount": 30}));
        order.push_refund(serde_json::json!({"refund_id": "re_2", "amount": 20}));
        assert_eq!(order.refunded_amount(), 50);
        assert_eq!(order.refundable_amount(), 50);
        assert_eq!(order.metadata["refunds"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_merge_metadata() {
        let mut order = order();
        order.merge_metadata(&serde_json::json!({"is_renewal": true}));
        order.merge_metadata(&serde_json::json!({"source": "webhook"}));
        assert!(order.metadata_flag("is_renewal"));
        assert_eq!(order.metadata["source"], "webhook");
    }

    #[test]
    fn test_subscription_terminal_does_not_advance() {
        let now = Utc::now();
        let mut sub = Subscription::new("user-1".into(), Uuid::new_v4(), Uuid::new_v4(), now, now + Duration::days(30));
        assert!(sub.advance_period(now + Duration::days(30), now + Duration::days(60), now));

        sub.status = SubscriptionStatus::Expired;
        assert!(!sub.advance_period(now + Duration::days(60), now + Duration::days(90), now));
        assert_eq!(sub.current_period_end, now + Duration::days(60));
    }

    #[test]
    fn test_empty_period_rejected() {
        let now = Utc::now();
        let mut sub = Subscription::new("user-1".into(), Uuid::new_v4(), Uuid::new_v4(), now, now + Duration::days(1));
        assert!(!sub.advance_period(now, now, now));
    }
}
