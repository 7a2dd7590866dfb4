use std::sync::Arc;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use uuid::Uuid;
use payline_catalog::{PaymentType, Product, ProductError};
use payline_core::payment::{PaymentProvider, ProviderSubscription, SubscriptionRequest};
use payline_core::repository::{Cursor, Page};
use payline_core::{CoreError, CoreResult, Order, Subscription, SubscriptionStatus};
use payline_shared::{DomainEvent, SubscriptionEvent};
use crate::manager::{CreateOrderInput, OrderLifecycle};
use crate::{bounded, Actor};

const MAX_CAS_ATTEMPTS: usize = 3;
const MAX_PAGE_SIZE: usize = 100;

/// Metadata key holding the start of the period a renewal order was issued for
pub(crate) const RENEWAL_CLAIM_KEY: &str = "renewal_period_end";

#[derive(Debug, Clone)]
pub struct CreateSubscriptionInput {
    pub user_id: String,
    pub product_id: Uuid,
    pub channel_id: Uuid,
    /// Overrides the product's trial length when set
    pub trial_days: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionCreated {
    pub subscription: Subscription,
    /// First-period order; absent while the subscription is in trial
    pub order: Option<Order>,
    pub provider: Option<ProviderSubscription>,
}

pub struct SubscriptionService {
    lifecycle: Arc<OrderLifecycle>,
}

impl SubscriptionService {
    pub fn new(lifecycle: Arc<OrderLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub async fn create(&self, input: CreateSubscriptionInput, actor: &Actor) -> CoreResult<SubscriptionCreated> {
        if input.user_id.trim().is_empty() {
            return Err(CoreError::ValidationError("user_id is required".to_string()));
        }
        let product = load_product(&self.lifecycle, input.product_id).await?;
        product.ensure_subscribable().map_err(|e| match e {
            ProductError::NotAvailable(_) => CoreError::PreconditionError(e.to_string()),
            ProductError::NotRecurring(_) => CoreError::ValidationError(e.to_string()),
        })?;
        let currency = self.lifecycle.resolve_currency(Some(&product.currency))?;

        let channel = self.lifecycle.load_channel(input.channel_id).await?;
        if !channel.accepts(PaymentType::Subscription) {
            return Err(CoreError::PreconditionError(format!(
                "channel {} cannot take subscription payments",
                channel.id
            )));
        }

        let now = Utc::now();
        let interval = product.interval();
        let trial_days = input.trial_days.unwrap_or(product.trial_days);

        if trial_days > 0 {
            let trial_end = now + Duration::days(i64::from(trial_days));
            let mut subscription = Subscription::new(input.user_id, product.id, channel.id, now, trial_end);
            subscription.trial_start = Some(now);
            subscription.trial_end = Some(trial_end);
            if let Some(metadata) = &input.metadata {
                merge_json(&mut subscription.metadata, metadata);
            }
            self.insert(&subscription).await?;

            tracing::info!(subscription_id = %subscription.id, trial_days, "Trial subscription created");
            self.lifecycle
                .publish(DomainEvent::SubscriptionCreated(subscription_event(&subscription, None)))
                .await;
            return Ok(SubscriptionCreated {
                subscription,
                order: None,
                provider: None,
            });
        }

        let period_end = interval.advance(now);
        let mut subscription = Subscription::new(input.user_id, product.id, channel.id, now, period_end);
        if let Some(metadata) = &input.metadata {
            merge_json(&mut subscription.metadata, metadata);
        }

        let provider = self.lifecycle.registry().for_channel(&channel).await?;
        let request = SubscriptionRequest {
            subscription_id: subscription.id,
            user_id: subscription.user_id.clone(),
            product_id: product.id,
            amount: product.price,
            currency: currency.clone(),
            interval,
        };
        let remote = bounded(
            self.lifecycle.settings().provider_timeout,
            provider.create_subscription(&request),
        )
        .await
        .map_err(|e| {
            tracing::error!(product_id = %product.id, error = %e, "Provider subscription creation failed");
            e
        })?;
        subscription.provider_ref = Some(remote.provider_ref.clone());
        if let Err(e) = self.insert(&subscription).await {
            tracing::error!(subscription_id = %subscription.id, error = %e, "Failed to store subscription, cancelling it at the provider");
            self.release_remote(provider.as_ref(), &subscription, &remote.provider_ref).await;
            return Err(e);
        }

        let order_input = CreateOrderInput {
            user_id: subscription.user_id.clone(),
            channel_id: channel.id,
            payment_type: PaymentType::Subscription,
            amount: product.price,
            currency: Some(currency),
            product_id: Some(product.id),
            subscription_id: Some(subscription.id),
            expires_at: None,
            metadata: Some(period_metadata(false, now, period_end)),
        };
        let order = match self.lifecycle.create(order_input, actor).await {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(subscription_id = %subscription.id, error = %e, "First-period order failed, cancelling subscription");
                self.release_remote(provider.as_ref(), &subscription, &remote.provider_ref).await;
                self.abandon(&subscription).await;
                return Err(e);
            }
        };

        tracing::info!(subscription_id = %subscription.id, order_id = %order.id, "Subscription created");
        self.lifecycle
            .publish(DomainEvent::SubscriptionCreated(subscription_event(&subscription, Some(order.id))))
            .await;
        Ok(SubscriptionCreated {
            subscription,
            order: Some(order),
            provider: Some(remote),
        })
    }

    pub async fn get(&self, subscription_id: Uuid) -> CoreResult<Subscription> {
        load_subscription(&self.lifecycle, subscription_id).await
    }

    pub async fn list(&self, user_id: &str, cursor: Option<Cursor>, limit: usize) -> CoreResult<Page<Subscription>> {
        self.lifecycle
            .stores()
            .subscriptions
            .list_subscriptions(user_id, cursor, limit.clamp(1, MAX_PAGE_SIZE))
            .await
            .map_err(CoreError::storage)
    }

    /// Push `updates` to the provider (when linked) and merge them into the
    /// subscription's metadata.
    pub async fn update(&self, subscription_id: Uuid, updates: serde_json::Value) -> CoreResult<Subscription> {
        if !updates.is_object() {
            return Err(CoreError::ValidationError("updates must be an object".to_string()));
        }
        let current = load_subscription(&self.lifecycle, subscription_id).await?;
        if current.status.is_terminal() {
            return Err(CoreError::PreconditionError(format!(
                "subscription {} is {}",
                current.id, current.status
            )));
        }

        if let Some(provider_ref) = &current.provider_ref {
            let channel = self.lifecycle.load_channel(current.channel_id).await?;
            let provider = self.lifecycle.registry().for_channel(&channel).await?;
            bounded(
                self.lifecycle.settings().provider_timeout,
                provider.update_subscription(provider_ref, &updates),
            )
            .await?;
        }

        let updated = self
            .modify(subscription_id, |sub, now| {
                if sub.status.is_terminal() {
                    return Err(CoreError::PreconditionError(format!("subscription {} is {}", sub.id, sub.status)));
                }
                merge_json(&mut sub.metadata, &updates);
                sub.updated_at = now;
                Ok(())
            })
            .await?;

        self.lifecycle
            .publish(DomainEvent::SubscriptionUpdated(subscription_event(&updated, None)))
            .await;
        Ok(updated)
    }

    /// Cancel now, or at the end of the current period. The provider is told
    /// first; if it refuses, nothing changes.
    pub async fn cancel(&self, subscription_id: Uuid, immediate: bool, actor: &Actor) -> CoreResult<Subscription> {
        let current = load_subscription(&self.lifecycle, subscription_id).await?;
        if current.status.is_terminal() {
            return Err(CoreError::PreconditionError(format!(
                "subscription {} is already {}",
                current.id, current.status
            )));
        }

        if let Some(provider_ref) = &current.provider_ref {
            let channel = self.lifecycle.load_channel(current.channel_id).await?;
            let provider = self.lifecycle.registry().for_channel(&channel).await?;
            bounded(
                self.lifecycle.settings().provider_timeout,
                provider.cancel_subscription(provider_ref, immediate),
            )
            .await
            .map_err(|e| {
                tracing::error!(%subscription_id, error = %e, "Provider refused cancellation");
                e
            })?;
        }

        let cancelled = self
            .modify(subscription_id, |sub, now| {
                if sub.status.is_terminal() {
                    return Err(CoreError::PreconditionError(format!("subscription {} is already {}", sub.id, sub.status)));
                }
                if immediate {
                    sub.status = SubscriptionStatus::Cancelled;
                    sub.cancelled_at = Some(now);
                } else {
                    sub.cancel_at = Some(sub.current_period_end);
                }
                sub.updated_at = now;
                Ok(())
            })
            .await?;

        tracing::info!(
            %subscription_id,
            immediate,
            actor = ?actor.user_id,
            "Subscription cancelled"
        );
        self.lifecycle
            .publish(DomainEvent::SubscriptionCancelled(subscription_event(&cancelled, None)))
            .await;
        Ok(cancelled)
    }

    async fn insert(&self, subscription: &Subscription) -> CoreResult<()> {
        self.lifecycle
            .stores()
            .subscriptions
            .insert_subscription(subscription)
            .await
            .map_err(CoreError::storage)
    }

    /// Version-conditioned read-modify-write with bounded retries
    async fn modify<F>(&self, subscription_id: Uuid, mut change: F) -> CoreResult<Subscription>
    where
        F: FnMut(&mut Subscription, DateTime<Utc>) -> CoreResult<()>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = load_subscription(&self.lifecycle, subscription_id).await?;
            let mut next = current.next_version();
            change(&mut next, Utc::now())?;
            if self
                .lifecycle
                .stores()
                .subscriptions
                .update_subscription(&next, current.version)
                .await
                .map_err(CoreError::storage)?
            {
                return Ok(next);
            }
            tracing::warn!(%subscription_id, "Concurrent subscription update, retrying");
        }
        Err(CoreError::ConflictError(format!(
            "subscription {} kept changing concurrently",
            subscription_id
        )))
    }

    /// Stop a provider-side subscription that has no usable local counterpart
    async fn release_remote(&self, provider: &dyn PaymentProvider, subscription: &Subscription, provider_ref: &str) {
        let cancelled = bounded(
            self.lifecycle.settings().provider_timeout,
            provider.cancel_subscription(provider_ref, true),
        )
        .await;
        if let Err(e) = cancelled {
            tracing::error!(
                subscription_id = %subscription.id,
                %provider_ref,
                error = %e,
                "Provider subscription left active, needs manual cancellation"
            );
        }
    }

    async fn abandon(&self, subscription: &Subscription) {
        let mut next = subscription.next_version();
        let now = Utc::now();
        next.status = SubscriptionStatus::Cancelled;
        next.cancelled_at = Some(now);
        next.updated_at = now;
        if let Err(e) = self
            .lifecycle
            .stores()
            .subscriptions
            .update_subscription(&next, subscription.version)
            .await
        {
            tracing::error!(subscription_id = %subscription.id, error = %e, "Failed to cancel abandoned subscription");
        }
    }
}

/// Runs after a subscription order commits as `completed`. Renewal orders
/// move the subscription into the period they paid for.
pub(crate) async fn settle_subscription_payment(lifecycle: &OrderLifecycle, order: &Order) {
    let Some(subscription_id) = order.subscription_id else {
        return;
    };
    if !order.metadata_flag("is_renewal") {
        return;
    }
    let period = (
        order.metadata.get("period_start").and_then(decode_instant),
        order.metadata.get("period_end").and_then(decode_instant),
    );
    let (Some(start), Some(end)) = period else {
        tracing::warn!(order_id = %order.id, "Renewal order without a billing period");
        return;
    };

    for _ in 0..MAX_CAS_ATTEMPTS {
        let current = match load_subscription(lifecycle, subscription_id).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(%subscription_id, order_id = %order.id, error = %e, "Cannot load renewed subscription");
                return;
            }
        };
        if current.status.is_terminal() {
            tracing::warn!(
                %subscription_id,
                order_id = %order.id,
                status = %current.status,
                "Renewal paid for a closed subscription, needs manual reconciliation"
            );
            return;
        }
        if current.current_period_end >= end {
            tracing::debug!(%subscription_id, "Renewal period already applied");
            return;
        }
        if current.current_period_end != start {
            tracing::warn!(
                %subscription_id,
                order_id = %order.id,
                "Renewal period does not follow the current period, needs manual reconciliation"
            );
            return;
        }

        let now = Utc::now();
        let mut next = current.next_version();
        if !next.advance_period(start, end, now) {
            return;
        }
        if next.status == SubscriptionStatus::PastDue {
            next.status = SubscriptionStatus::Active;
        }
        if let Some(map) = next.metadata.as_object_mut() {
            map.remove(RENEWAL_CLAIM_KEY);
        }

        match lifecycle
            .stores()
            .subscriptions
            .update_subscription(&next, current.version)
            .await
        {
            Ok(true) => {
                tracing::info!(%subscription_id, order_id = %order.id, period_end = %end, "Subscription renewed");
                lifecycle
                    .publish(DomainEvent::SubscriptionRenewed(subscription_event(&next, Some(order.id))))
                    .await;
                return;
            }
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(%subscription_id, error = %e, "Failed to advance subscription period");
                return;
            }
        }
    }
    tracing::warn!(%subscription_id, order_id = %order.id, "Gave up advancing subscription period after conflicts");
}

pub(crate) async fn load_subscription(lifecycle: &OrderLifecycle, subscription_id: Uuid) -> CoreResult<Subscription> {
    lifecycle
        .stores()
        .subscriptions
        .get_subscription(subscription_id)
        .await
        .map_err(CoreError::storage)?
        .ok_or_else(|| CoreError::NotFoundError(format!("subscription {}", subscription_id)))
}

pub(crate) async fn load_product(lifecycle: &OrderLifecycle, product_id: Uuid) -> CoreResult<Product> {
    lifecycle
        .stores()
        .products
        .get_product(product_id)
        .await
        .map_err(CoreError::storage)?
        .ok_or_else(|| CoreError::NotFoundError(format!("product {}", product_id)))
}

pub(crate) fn subscription_event(subscription: &Subscription, order_id: Option<Uuid>) -> SubscriptionEvent {
    SubscriptionEvent {
        subscription_id: subscription.id,
        user_id: subscription.user_id.clone(),
        product_id: subscription.product_id,
        status: subscription.status.as_str().to_string(),
        current_period_start: subscription.current_period_start.timestamp(),
        current_period_end: subscription.current_period_end.timestamp(),
        order_id,
        timestamp: subscription.updated_at.timestamp(),
    }
}

pub(crate) fn period_metadata(is_renewal: bool, start: DateTime<Utc>, end: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "is_renewal": is_renewal,
        "period_start": encode_instant(start),
        "period_end": encode_instant(end),
    })
}

pub(crate) fn encode_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn decode_instant(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn merge_json(target: &mut serde_json::Value, extra: &serde_json::Value) {
    let Some(extra) = extra.as_object() else {
        return;
    };
    if !target.is_object() {
        *target = serde_json::json!({});
    }
    if let Some(map) = target.as_object_mut() {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
}
