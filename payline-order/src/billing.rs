use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use payline_catalog::PaymentType;
use payline_core::repository::OrderFilter;
use payline_core::{CoreError, CoreResult, OrderStatus, Subscription, SubscriptionStatus};
use payline_shared::DomainEvent;
use crate::manager::{CreateOrderInput, OrderLifecycle};
use crate::subscription::{
    decode_instant, encode_instant, load_product, load_subscription, period_metadata, subscription_event,
    RENEWAL_CLAIM_KEY,
};
use crate::Actor;

/// Tally of one batch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchReport {
    fn tally(&mut self, result: CoreResult<bool>) {
        self.processed += 1;
        match result {
            Ok(true) => self.succeeded += 1,
            Ok(false) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Scheduled subscription work: issuing renewal orders ahead of period end
/// and closing subscriptions whose period lapsed unpaid.
///
/// Both passes may run concurrently with each other and with request
/// traffic. Every subscription write is conditioned on the version read.
pub struct SubscriptionBiller {
    lifecycle: Arc<OrderLifecycle>,
}

impl SubscriptionBiller {
    pub fn new(lifecycle: Arc<OrderLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Issue a pending renewal order for every active subscription whose
    /// period ends within the lookahead window. The period itself moves only
    /// once that order completes.
    pub async fn process_renewals(&self) -> CoreResult<BatchReport> {
        let now = Utc::now();
        let until = now + self.lifecycle.settings().renewal_lookahead;
        let due = self
            .lifecycle
            .stores()
            .subscriptions
            .list_due_for_renewal(now, until)
            .await
            .map_err(CoreError::storage)?;

        let mut report = BatchReport::default();
        for subscription in &due {
            let result = self.renew(subscription).await;
            if let Err(e) = &result {
                tracing::error!(subscription_id = %subscription.id, error = %e, "Renewal failed");
            }
            report.tally(result);
        }

        if report.processed > 0 {
            tracing::info!(?report, "Renewal pass finished");
        }
        Ok(report)
    }

    /// Close active subscriptions whose period has ended: scheduled
    /// cancellations become `cancelled`, unpaid ones `expired`. A subscription
    /// with a pending order is left for the next pass.
    pub async fn process_expired_subscriptions(&self) -> CoreResult<BatchReport> {
        let now = Utc::now();
        let lapsed = self
            .lifecycle
            .stores()
            .subscriptions
            .list_lapsed(now)
            .await
            .map_err(CoreError::storage)?;

        let mut report = BatchReport::default();
        for subscription in &lapsed {
            let result = self.close(subscription, now).await;
            if let Err(e) = &result {
                tracing::error!(subscription_id = %subscription.id, error = %e, "Expiry failed");
            }
            report.tally(result);
        }

        if report.processed > 0 {
            tracing::info!(?report, "Expiry pass finished");
        }
        Ok(report)
    }

    async fn renew(&self, subscription: &Subscription) -> CoreResult<bool> {
        if subscription.cancels_at_period_end() {
            tracing::debug!(subscription_id = %subscription.id, "Cancellation scheduled, not renewing");
            return Ok(false);
        }
        if renewal_claim(subscription) == Some(subscription.current_period_end) {
            return Ok(false);
        }

        let product = load_product(&self.lifecycle, subscription.product_id).await?;
        let (start, end) = product.interval().next_period(subscription.current_period_end);

        // Claim the period before issuing the order so that overlapping passes
        // cannot both bill it.
        let mut claimed = subscription.next_version();
        set_renewal_claim(&mut claimed, Some(start));
        claimed.updated_at = Utc::now();
        if !self
            .lifecycle
            .stores()
            .subscriptions
            .update_subscription(&claimed, subscription.version)
            .await
            .map_err(CoreError::storage)?
        {
            tracing::debug!(subscription_id = %subscription.id, "Renewal already claimed elsewhere");
            return Ok(false);
        }

        let input = CreateOrderInput {
            user_id: subscription.user_id.clone(),
            channel_id: subscription.channel_id,
            payment_type: PaymentType::Subscription,
            amount: product.price,
            currency: Some(product.currency.clone()),
            product_id: Some(product.id),
            subscription_id: Some(subscription.id),
            expires_at: None,
            metadata: Some(period_metadata(true, start, end)),
        };
        match self.lifecycle.create(input, &Actor::system("billing")).await {
            Ok(order) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    order_id = %order.id,
                    period_start = %start,
                    period_end = %end,
                    "Renewal order issued"
                );
                Ok(true)
            }
            Err(e) => {
                self.release_claim(subscription, start).await;
                Err(e)
            }
        }
    }

    async fn release_claim(&self, subscription: &Subscription, start: DateTime<Utc>) {
        let current = match load_subscription(&self.lifecycle, subscription.id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::error!(subscription_id = %subscription.id, error = %e, "Cannot release renewal claim");
                return;
            }
        };
        if renewal_claim(&current) != Some(start) {
            return;
        }
        let mut released = current.next_version();
        set_renewal_claim(&mut released, None);
        released.updated_at = Utc::now();
        match self
            .lifecycle
            .stores()
            .subscriptions
            .update_subscription(&released, current.version)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(subscription_id = %subscription.id, "Renewal claim changed before release"),
            Err(e) => tracing::error!(subscription_id = %subscription.id, error = %e, "Cannot release renewal claim"),
        }
    }

    async fn close(&self, subscription: &Subscription, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut next = subscription.next_version();
        next.updated_at = now;

        let event = if subscription.cancels_at_period_end() {
            next.status = SubscriptionStatus::Cancelled;
            next.cancelled_at = Some(now);
            DomainEvent::SubscriptionCancelled(subscription_event(&next, None))
        } else {
            // Payment may still be in flight.
            let filter = OrderFilter {
                subscription_id: Some(subscription.id),
                status: Some(OrderStatus::Pending),
                ..OrderFilter::default()
            };
            let pending = self
                .lifecycle
                .stores()
                .orders
                .count_orders(&filter)
                .await
                .map_err(CoreError::storage)?;
            if pending > 0 {
                tracing::debug!(subscription_id = %subscription.id, pending, "Lapsed subscription has a pending order");
                return Ok(false);
            }
            next.status = SubscriptionStatus::Expired;
            DomainEvent::SubscriptionExpired(subscription_event(&next, None))
        };

        if !self
            .lifecycle
            .stores()
            .subscriptions
            .update_subscription(&next, subscription.version)
            .await
            .map_err(CoreError::storage)?
        {
            tracing::warn!(subscription_id = %subscription.id, "Subscription changed during expiry, skipping");
            return Ok(false);
        }

        tracing::info!(subscription_id = %subscription.id, status = %next.status, "Subscription closed");
        self.lifecycle.publish(event).await;
        Ok(true)
    }
}

fn renewal_claim(subscription: &Subscription) -> Option<DateTime<Utc>> {
    subscription.metadata.get(RENEWAL_CLAIM_KEY).and_then(decode_instant)
}

fn set_renewal_claim(subscription: &mut Subscription, start: Option<DateTime<Utc>>) {
    if !subscription.metadata.is_object() {
        subscription.metadata = serde_json::json!({});
    }
    if let Some(map) = subscription.metadata.as_object_mut() {
        match start {
            Some(start) => {
                map.insert(RENEWAL_CLAIM_KEY.to_string(), serde_json::Value::String(encode_instant(start)));
            }
            None => {
                map.remove(RENEWAL_CLAIM_KEY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn subscription() -> Subscription {
        let now = Utc::now();
        Subscription::new("user-1".to_string(), Uuid::new_v4(), Uuid::new_v4(), now, now + Duration::days(30))
    }

    #[test]
    fn test_claim_set_and_release() {
        let mut sub = subscription();
        assert!(renewal_claim(&sub).is_none());

        let end = sub.current_period_end;
        set_renewal_claim(&mut sub, Some(end));
        assert_eq!(renewal_claim(&sub), Some(end));

        set_renewal_claim(&mut sub, None);
        assert!(renewal_claim(&sub).is_none());
    }

    #[test]
    fn test_report_tally() {
        let mut report = BatchReport::default();
        report.tally(Ok(true));
        report.tally(Ok(false));
        report.tally(Err(CoreError::ProviderError("down".to_string())));
        assert_eq!(
            report,
            BatchReport {
                processed: 3,
                succeeded: 1,
                skipped: 1,
                failed: 1
            }
        );
    }
}
