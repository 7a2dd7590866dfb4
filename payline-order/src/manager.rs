use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use payline_catalog::{Channel, ChannelStatus, PaymentType};
use payline_core::events::EventPublisher;
use payline_core::payment::{PaymentProvider, ProviderPayment};
use payline_core::repository::{Cursor, DuplicateKey, OrderFilter, Page};
use payline_core::{CoreError, CoreResult, LogType, Order, OrderStatus, PaymentLog, Transition};
use payline_shared::{DomainEvent, PaymentEvent, RefundEvent};
use crate::audit::{AuditEntry, AuditLog};
use crate::reconciler::{WebhookReceipt, WebhookReconciler};
use crate::registry::ProviderRegistry;
use crate::{bounded, subscription, Actor, EngineSettings, Stores};

const MAX_INSERT_ATTEMPTS: usize = 3;
const MAX_CAS_ATTEMPTS: usize = 3;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct CreateOrderInput {
    pub user_id: String,
    pub channel_id: Uuid,
    pub payment_type: PaymentType,
    /// Minor currency units
    pub amount: i64,
    pub currency: Option<String>,
    pub product_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl CreateOrderInput {
    pub fn one_time(user_id: impl Into<String>, channel_id: Uuid, amount: i64, currency: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id,
            payment_type: PaymentType::OneTime,
            amount,
            currency: currency.map(str::to_string),
            product_id: None,
            subscription_id: None,
            expires_at: None,
            metadata: None,
        }
    }
}

/// What triggered a status change; selects the event that gets published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cause {
    Client,
    Verification,
    Webhook,
    Expiry,
    Refund,
}

/// Input of the shared transition routine
pub(crate) struct TransitionRequest {
    pub target: OrderStatus,
    pub provider_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Refund record appended to the order's `refunds` list
    pub refund: Option<serde_json::Value>,
    pub cause: Cause,
    pub log_type: LogType,
    pub request: serde_json::Value,
    pub actor: Actor,
}

impl TransitionRequest {
    pub fn new(target: OrderStatus, cause: Cause, log_type: LogType, actor: Actor) -> Self {
        Self {
            target,
            provider_ref: None,
            metadata: None,
            refund: None,
            cause,
            log_type,
            request: serde_json::Value::Null,
            actor,
        }
    }
}

/// Result of the shared transition routine
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub order: Order,
    /// False for idempotent repeats and for requests dropped from a terminal state
    pub changed: bool,
}

/// Payment order state machine.
///
/// Every status change (client verification, provider webhook, refund,
/// expiry) goes through `apply_transition`, which re-reads the order, consults
/// the transition table and persists with a compare-and-swap on the previous
/// status. Audit entries and events are written only after that commit.
pub struct OrderLifecycle {
    stores: Stores,
    registry: Arc<ProviderRegistry>,
    audit: Arc<AuditLog>,
    events: Arc<dyn EventPublisher>,
    settings: EngineSettings,
}

impl OrderLifecycle {
    pub fn new(
        stores: Stores,
        registry: Arc<ProviderRegistry>,
        audit: Arc<AuditLog>,
        events: Arc<dyn EventPublisher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            stores,
            registry,
            audit,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn stores(&self) -> &Stores {
        &self.stores
    }

    pub(crate) fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub(crate) fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Normalize a requested currency, defaulting to the base currency
    pub fn resolve_currency(&self, currency: Option<&str>) -> CoreResult<String> {
        let currency = currency
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.settings.base_currency.clone());
        if !self.settings.supported_currencies.iter().any(|c| c.eq_ignore_ascii_case(&currency)) {
            return Err(CoreError::ValidationError(format!("unsupported currency: {}", currency)));
        }
        Ok(currency)
    }

    pub async fn create(&self, input: CreateOrderInput, actor: &Actor) -> CoreResult<Order> {
        if input.amount <= 0 {
            return Err(CoreError::ValidationError("amount must be positive".to_string()));
        }
        if input.user_id.trim().is_empty() {
            return Err(CoreError::ValidationError("user_id is required".to_string()));
        }
        let currency = self.resolve_currency(input.currency.as_deref())?;
        let now = Utc::now();
        if let Some(expires_at) = input.expires_at {
            if expires_at <= now {
                return Err(CoreError::ValidationError("expires_at must be in the future".to_string()));
            }
        }

        let channel = self.load_channel(input.channel_id).await?;
        if channel.status != ChannelStatus::Active {
            return Err(CoreError::PreconditionError(format!("channel {} is not active", channel.id)));
        }
        if !channel.supports(input.payment_type) {
            return Err(CoreError::PreconditionError(format!(
                "channel {} does not support {} payments",
                channel.id,
                input.payment_type.as_str()
            )));
        }

        let expires_at = input.expires_at.unwrap_or(now + self.settings.default_order_ttl);
        let mut order = Order::new(input.user_id, channel.id, input.payment_type, input.amount, currency, expires_at);
        order.product_id = input.product_id;
        order.subscription_id = input.subscription_id;
        if let Some(metadata) = &input.metadata {
            order.merge_metadata(metadata);
        }

        self.insert_with_fresh_number(&mut order).await?;

        tracing::info!(order_id = %order.id, order_no = %order.order_no, amount = order.amount, "Order created");
        self.audit
            .record(
                AuditEntry::new(LogType::Create)
                    .order(&order)
                    .transition(None, OrderStatus::Pending)
                    .request(serde_json::json!({
                        "amount": order.amount,
                        "currency": order.currency,
                        "payment_type": order.payment_type,
                    }))
                    .actor(actor),
            )
            .await;
        self.publish(DomainEvent::PaymentCreated(payment_event(&order))).await;

        Ok(order)
    }

    async fn insert_with_fresh_number(&self, order: &mut Order) -> CoreResult<()> {
        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            match self.stores.orders.insert_order(order).await {
                Ok(()) => return Ok(()),
                Err(e) if e.downcast_ref::<DuplicateKey>().is_some() => {
                    tracing::warn!(order_no = %order.order_no, attempt, "Order number collision, regenerating");
                    order.order_no = Order::generate_order_no(Utc::now());
                }
                Err(e) => return Err(CoreError::storage(e)),
            }
        }
        Err(CoreError::DuplicateOrderNumber(order.order_no.clone()))
    }

    pub async fn get(&self, order_id: Uuid) -> CoreResult<Order> {
        self.load_order(order_id).await
    }

    /// Every recorded attempt against an order, oldest first
    pub async fn audit_history(&self, order_id: Uuid) -> Vec<PaymentLog> {
        self.audit.history(order_id).await
    }

    /// Newest-first page of orders
    pub async fn list_orders(
        &self,
        filter: &OrderFilter,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> CoreResult<Page<Order>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.stores
            .orders
            .list_orders(filter, cursor, limit)
            .await
            .map_err(CoreError::storage)
    }

    /// Ask the channel's provider to create the payment for a pending order.
    ///
    /// The order stays `pending`; only the provider reference is stored. A
    /// provider failure persists nothing.
    pub async fn initiate_provider_payment(
        &self,
        order_id: Uuid,
        actor: &Actor,
    ) -> CoreResult<(Order, ProviderPayment)> {
        let order = self.load_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(CoreError::ConflictError(format!("order {} is {}", order.id, order.status)));
        }
        if order.is_expired(Utc::now()) {
            self.apply_transition(
                order.id,
                TransitionRequest::new(OrderStatus::Cancelled, Cause::Expiry, LogType::Update, actor.clone()),
            )
            .await?;
            return Err(CoreError::ExpiredError(order.order_no));
        }

        let provider = self.provider_for(&order, actor).await?;
        let payment = match bounded(self.settings.provider_timeout, provider.create_payment(&order)).await {
            Ok(payment) => payment,
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "Provider payment creation failed");
                self.audit
                    .record(AuditEntry::new(LogType::Error).order(&order).actor(actor).error(&e))
                    .await;
                return Err(e);
            }
        };

        let mut updated = order.clone();
        updated.provider_ref = Some(payment.provider_ref.clone());
        updated.updated_at = Utc::now();
        let stored = self
            .stores
            .orders
            .update_order(&updated, OrderStatus::Pending)
            .await
            .map_err(CoreError::storage)?;
        if !stored {
            return Err(CoreError::ConflictError(format!(
                "order {} changed while the payment was being created",
                order.id
            )));
        }

        self.audit
            .record(
                AuditEntry::new(LogType::Update)
                    .order(&updated)
                    .response(serde_json::json!({
                        "provider_ref": payment.provider_ref,
                        "payload": payment.payload,
                    }))
                    .actor(actor),
            )
            .await;
        tracing::info!(order_id = %order.id, provider_ref = %payment.provider_ref, "Provider payment created");

        Ok((updated, payment))
    }

    /// Client-initiated verification: confirm with the provider, then apply
    /// the reported status. Provider failure leaves the order untouched.
    pub async fn apply_verification(
        &self,
        order_id: Uuid,
        payload: serde_json::Value,
        actor: &Actor,
    ) -> CoreResult<TransitionOutcome> {
        let order = self.load_order(order_id).await?;
        let provider = self.provider_for(&order, actor).await?;

        let verified = bounded(self.settings.provider_timeout, provider.verify_payment(&order, &payload)).await;
        let result = match verified {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "Payment verification failed");
                self.audit
                    .record(
                        AuditEntry::new(LogType::Error)
                            .order(&order)
                            .request(payload)
                            .actor(actor)
                            .error(&e),
                    )
                    .await;
                return Err(e);
            }
        };

        if !result.success {
            let err = CoreError::ProviderError("verification rejected by provider".to_string());
            self.audit
                .record(
                    AuditEntry::new(LogType::Verify)
                        .order(&order)
                        .request(payload)
                        .response(serde_json::to_value(&result).unwrap_or_default())
                        .actor(actor)
                        .error(&err),
                )
                .await;
            return Err(err);
        }

        let mut request = TransitionRequest::new(result.target_status, Cause::Verification, LogType::Verify, actor.clone());
        request.provider_ref = result.provider_ref;
        request.metadata = result.metadata;
        request.request = payload;
        self.apply_transition(order.id, request).await
    }

    /// Provider callback entry point; see `WebhookReconciler`
    pub async fn apply_webhook_result(
        self: &Arc<Self>,
        channel_id: Uuid,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> CoreResult<WebhookReceipt> {
        WebhookReconciler::new(self.clone()).handle(channel_id, payload, headers).await
    }

    /// Refund a completed order through its provider. Nothing changes unless
    /// the provider confirms the refund.
    pub async fn refund(
        &self,
        order_id: Uuid,
        amount: Option<i64>,
        reason: Option<String>,
        actor: &Actor,
    ) -> CoreResult<Order> {
        let order = self.load_order(order_id).await?;
        if order.status != OrderStatus::Completed {
            return Err(CoreError::PreconditionError(format!(
                "only completed orders can be refunded, order {} is {}",
                order.id, order.status
            )));
        }

        let refundable = order.refundable_amount();
        let amount = amount.unwrap_or(refundable);
        if amount <= 0 {
            return Err(CoreError::ValidationError("refund amount must be positive".to_string()));
        }
        if amount > refundable {
            return Err(CoreError::ValidationError(format!(
                "refund amount {} exceeds paid amount {}",
                amount, refundable
            )));
        }

        let provider = self.provider_for(&order, actor).await?;
        let request_body = serde_json::json!({ "amount": amount, "reason": reason });
        let refunded = bounded(
            self.settings.provider_timeout,
            provider.refund_payment(&order, amount, reason.as_deref()),
        )
        .await;
        let result = match refunded {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "Provider refund failed");
                self.audit
                    .record(
                        AuditEntry::new(LogType::Error)
                            .order(&order)
                            .request(request_body)
                            .actor(actor)
                            .error(&e),
                    )
                    .await;
                return Err(e);
            }
        };

        if !result.success {
            let err = CoreError::ProviderError(format!("refund {} was declined", result.refund_id));
            self.audit
                .record(
                    AuditEntry::new(LogType::Refund)
                        .order(&order)
                        .request(request_body)
                        .actor(actor)
                        .error(&err),
                )
                .await;
            return Err(err);
        }

        let mut request = TransitionRequest::new(OrderStatus::Refunded, Cause::Refund, LogType::Refund, actor.clone());
        request.refund = Some(serde_json::json!({
            "refund_id": result.refund_id,
            "amount": result.amount,
            "reason": reason,
            "refunded_at": Utc::now().to_rfc3339(),
        }));
        request.request = request_body;
        let outcome = self.apply_transition(order.id, request).await?;
        Ok(outcome.order)
    }

    /// Client cancellation of a pending order
    pub async fn cancel(&self, order_id: Uuid, actor: &Actor) -> CoreResult<Order> {
        let order = self.load_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(CoreError::PreconditionError(format!(
                "only pending orders can be cancelled, order {} is {}",
                order.id, order.status
            )));
        }

        let outcome = self
            .apply_transition(
                order.id,
                TransitionRequest::new(OrderStatus::Cancelled, Cause::Client, LogType::Update, actor.clone()),
            )
            .await?;
        if outcome.order.status != OrderStatus::Cancelled {
            return Err(CoreError::ConflictError(format!(
                "order {} became {} before it could be cancelled",
                order.id, outcome.order.status
            )));
        }
        Ok(outcome.order)
    }

    /// Cancel every pending order past its expiration. Returns how many were
    /// cancelled; failures are logged and skipped.
    pub async fn expire_stale_orders(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let filter = OrderFilter {
            status: Some(OrderStatus::Pending),
            expires_before: Some(now),
            ..OrderFilter::default()
        };

        let mut expired = 0;
        let mut cursor = None;
        loop {
            let page = self
                .stores
                .orders
                .list_orders(&filter, cursor, self.settings.batch_size)
                .await
                .map_err(CoreError::storage)?;

            for order in &page.items {
                let request =
                    TransitionRequest::new(OrderStatus::Cancelled, Cause::Expiry, LogType::Update, Actor::system("expiry"));
                match self.apply_transition(order.id, request).await {
                    Ok(outcome) if outcome.changed => expired += 1,
                    Ok(_) => {}
                    Err(e) => tracing::error!(order_id = %order.id, error = %e, "Failed to expire order"),
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if expired > 0 {
            tracing::info!(expired, "Expired stale pending orders");
        }
        Ok(expired)
    }

    /// Shared transition routine used by verification, webhooks, refunds and expiry.
    ///
    /// Same-status requests and requests the table rejects (anything out of a
    /// terminal state except `completed → refunded`) are successful no-ops, so
    /// duplicate or stale deliveries never change state. A lost compare-and-swap
    /// re-reads and re-evaluates.
    pub(crate) async fn apply_transition(
        &self,
        order_id: Uuid,
        request: TransitionRequest,
    ) -> CoreResult<TransitionOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load_order(order_id).await?;

            let (from, to) = match current.status.transition_to(request.target) {
                Transition::Applied { from, to } => (from, to),
                Transition::Unchanged => {
                    tracing::debug!(order_id = %current.id, status = %current.status, "Transition already applied");
                    return self.record_noop(current, &request, "unchanged").await;
                }
                Transition::Ignored { current: status, requested } => {
                    tracing::warn!(
                        order_id = %current.id,
                        from = %status,
                        to = %requested,
                        "Transition not allowed, ignoring"
                    );
                    return self.record_noop(current, &request, "ignored").await;
                }
            };

            let now = Utc::now();
            let mut next = current.clone();
            next.set_status(to, now);
            if let Some(provider_ref) = &request.provider_ref {
                next.provider_ref = Some(provider_ref.clone());
            }
            if let Some(metadata) = &request.metadata {
                next.merge_metadata(metadata);
            }
            if let Some(refund) = &request.refund {
                next.push_refund(refund.clone());
            }

            let stored = self
                .stores
                .orders
                .update_order(&next, from)
                .await
                .map_err(CoreError::storage)?;
            if !stored {
                tracing::warn!(order_id = %current.id, from = %from, to = %to, "Concurrent update, retrying transition");
                continue;
            }

            tracing::info!(order_id = %next.id, order_no = %next.order_no, from = %from, to = %to, "Order transitioned");
            self.audit
                .record(
                    AuditEntry::new(request.log_type)
                        .order(&next)
                        .transition(Some(from), to)
                        .request(request.request.clone())
                        .actor(&request.actor),
                )
                .await;
            if let Some(event) = transition_event(&next, to, request.cause, request.refund.as_ref()) {
                self.publish(event).await;
            }
            if to == OrderStatus::Completed && next.subscription_id.is_some() {
                subscription::settle_subscription_payment(self, &next).await;
            }

            return Ok(TransitionOutcome {
                order: next,
                changed: true,
            });
        }

        Err(CoreError::ConflictError(format!(
            "order {} kept changing concurrently",
            order_id
        )))
    }

    async fn record_noop(
        &self,
        mut current: Order,
        request: &TransitionRequest,
        outcome: &str,
    ) -> CoreResult<TransitionOutcome> {
        // A confirmed refund must be recorded even if a webhook already moved the order.
        if let (Some(refund), OrderStatus::Refunded) = (&request.refund, current.status) {
            let mut next = current.clone();
            next.push_refund(refund.clone());
            next.updated_at = Utc::now();
            if self
                .stores
                .orders
                .update_order(&next, OrderStatus::Refunded)
                .await
                .map_err(CoreError::storage)?
            {
                current = next;
            }
        }

        self.audit
            .record(
                AuditEntry::new(request.log_type)
                    .order(&current)
                    .request(request.request.clone())
                    .response(serde_json::json!({
                        "outcome": outcome,
                        "requested": request.target,
                    }))
                    .actor(&request.actor),
            )
            .await;
        Ok(TransitionOutcome {
            order: current,
            changed: false,
        })
    }

    pub(crate) async fn load_order(&self, order_id: Uuid) -> CoreResult<Order> {
        self.stores
            .orders
            .get_order(order_id)
            .await
            .map_err(CoreError::storage)?
            .ok_or_else(|| CoreError::NotFoundError(format!("order {}", order_id)))
    }

    pub(crate) async fn load_channel(&self, channel_id: Uuid) -> CoreResult<Channel> {
        self.stores
            .channels
            .get_channel(channel_id)
            .await
            .map_err(CoreError::storage)?
            .ok_or_else(|| CoreError::NotFoundError(format!("channel {}", channel_id)))
    }

    async fn provider_for(&self, order: &Order, actor: &Actor) -> CoreResult<Arc<dyn PaymentProvider>> {
        let channel = self.load_channel(order.channel_id).await?;
        match self.registry.for_channel(&channel).await {
            Ok(provider) => Ok(provider),
            Err(e) => {
                tracing::error!(channel_id = %channel.id, error = %e, "Provider unavailable");
                self.audit
                    .record(AuditEntry::new(LogType::Error).order(order).actor(actor).error(&e))
                    .await;
                Err(e)
            }
        }
    }

    /// Best-effort; a publisher failure never undoes the committed change
    pub(crate) async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(&event).await {
            tracing::warn!(event = event.name(), key = %event.key(), error = %e, "Failed to publish event");
        }
    }
}

pub(crate) fn payment_event(order: &Order) -> PaymentEvent {
    PaymentEvent {
        order_id: order.id,
        order_no: order.order_no.clone(),
        user_id: order.user_id.clone(),
        channel_id: order.channel_id,
        subscription_id: order.subscription_id,
        amount: order.amount,
        currency: order.currency.clone(),
        status: order.status.as_str().to_string(),
        provider_ref: order.provider_ref.clone(),
        timestamp: order.updated_at.timestamp(),
    }
}

fn transition_event(
    order: &Order,
    to: OrderStatus,
    cause: Cause,
    refund: Option<&serde_json::Value>,
) -> Option<DomainEvent> {
    let event = match to {
        OrderStatus::Completed => DomainEvent::PaymentSucceeded(payment_event(order)),
        OrderStatus::Failed => DomainEvent::PaymentFailed(payment_event(order)),
        OrderStatus::Cancelled if cause == Cause::Expiry => DomainEvent::PaymentExpired(payment_event(order)),
        OrderStatus::Cancelled => DomainEvent::PaymentCancelled(payment_event(order)),
        OrderStatus::Refunded => {
            let field = |key: &str| refund.and_then(|r| r.get(key));
            DomainEvent::PaymentRefunded(RefundEvent {
                order_id: order.id,
                order_no: order.order_no.clone(),
                refund_id: field("refund_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| order.provider_ref.clone())
                    .unwrap_or_default(),
                amount: field("amount").and_then(|v| v.as_i64()).unwrap_or(order.amount),
                currency: order.currency.clone(),
                reason: field("reason").and_then(|v| v.as_str()).map(str::to_string),
                timestamp: order.updated_at.timestamp(),
            })
        }
        OrderStatus::Pending => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new(
            "user-1".to_string(),
            Uuid::new_v4(),
            PaymentType::OneTime,
            100,
            "USD".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn test_expiry_cancellation_publishes_expired() {
        let order = order();
        let event = transition_event(&order, OrderStatus::Cancelled, Cause::Expiry, None).unwrap();
        assert_eq!(event.name(), "payment.expired");

        let event = transition_event(&order, OrderStatus::Cancelled, Cause::Client, None).unwrap();
        assert_eq!(event.name(), "payment.cancelled");
    }

    #[test]
    fn test_refund_event_uses_record() {
        let order = order();
        let record = serde_json::json!({"refund_id": "re_9", "amount": 40, "reason": "duplicate"});
        match transition_event(&order, OrderStatus::Refunded, Cause::Refund, Some(&record)) {
            Some(DomainEvent::PaymentRefunded(e)) => {
                assert_eq!(e.refund_id, "re_9");
                assert_eq!(e.amount, 40);
                assert_eq!(e.reason.as_deref(), Some("duplicate"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_pending_has_no_event() {
        assert!(transition_event(&order(), OrderStatus::Pending, Cause::Webhook, None).is_none());
    }
}
