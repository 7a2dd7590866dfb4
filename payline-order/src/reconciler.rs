use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use payline_core::payment::WebhookOutcome;
use payline_core::{CoreError, CoreResult, LogType, Order};
use crate::audit::{raw_payload, AuditEntry};
use crate::manager::{Cause, OrderLifecycle, TransitionRequest};
use crate::{bounded, Actor};

/// What happened to a delivered webhook
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookReceipt {
    /// Event not tied to an order (connectivity test, subscription lifecycle)
    Ignored { event_type: String },
    Applied { order_id: Uuid, changed: bool },
}

/// Turns provider callbacks into order transitions.
///
/// Deliveries are at-least-once and unordered. There is no event-id
/// deduplication: repeats and stale events fall out as no-ops in the
/// transition routine once the order is terminal.
pub struct WebhookReconciler {
    lifecycle: Arc<OrderLifecycle>,
}

impl WebhookReconciler {
    pub fn new(lifecycle: Arc<OrderLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub async fn handle(
        &self,
        channel_id: Uuid,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> CoreResult<WebhookReceipt> {
        let actor = Actor::system("webhook");
        let lifecycle = &self.lifecycle;

        let channel = match lifecycle.load_channel(channel_id).await {
            Ok(channel) => channel,
            Err(e) => {
                self.reject(channel_id, payload, &actor, &e).await;
                return Err(e);
            }
        };
        let provider = match lifecycle.registry().for_channel(&channel).await {
            Ok(provider) => provider,
            Err(e) => {
                self.reject(channel_id, payload, &actor, &e).await;
                return Err(e);
            }
        };

        let parsed = bounded(lifecycle.settings().provider_timeout, provider.process_webhook(payload, headers)).await;
        let outcome = match parsed {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(%channel_id, error = %e, "Webhook rejected by provider");
                self.reject(channel_id, payload, &actor, &e).await;
                return Err(e);
            }
        };

        let Some(identifier) = outcome.order_identifier.clone() else {
            tracing::debug!(%channel_id, event_type = %outcome.event_type, "Webhook not related to an order");
            lifecycle
                .audit()
                .record(
                    AuditEntry::new(LogType::Callback)
                        .channel(channel_id)
                        .request(raw_payload(payload))
                        .response(serde_json::json!({ "event_type": outcome.event_type, "outcome": "ignored" }))
                        .actor(&actor),
                )
                .await;
            return Ok(WebhookReceipt::Ignored {
                event_type: outcome.event_type,
            });
        };

        let order = match self.resolve_order(&identifier).await? {
            Some(order) => order,
            None => {
                let err = CoreError::NotFoundError(format!("order {}", identifier));
                tracing::warn!(%channel_id, %identifier, "Webhook references unknown order");
                self.reject(channel_id, payload, &actor, &err).await;
                return Err(err);
            }
        };

        if order.channel_id != channel_id {
            let err = CoreError::PreconditionError(format!(
                "order {} does not belong to channel {}",
                order.id, channel_id
            ));
            tracing::warn!(order_id = %order.id, %channel_id, "Webhook delivered on the wrong channel");
            lifecycle
                .audit()
                .record(
                    AuditEntry::new(LogType::Callback)
                        .order(&order)
                        .channel(channel_id)
                        .request(raw_payload(payload))
                        .actor(&actor)
                        .error(&err),
                )
                .await;
            return Err(err);
        }

        let order_id = order.id;
        let outcome = lifecycle
            .apply_transition(order_id, transition_request(outcome, payload, actor))
            .await?;
        Ok(WebhookReceipt::Applied {
            order_id,
            changed: outcome.changed,
        })
    }

    /// Providers may echo our order number, our internal id, or only their own
    /// payment reference
    async fn resolve_order(&self, identifier: &str) -> CoreResult<Option<Order>> {
        let orders = &self.lifecycle.stores().orders;
        if let Some(order) = orders.get_order_by_no(identifier).await.map_err(CoreError::storage)? {
            return Ok(Some(order));
        }
        if let Ok(id) = Uuid::parse_str(identifier) {
            if let Some(order) = orders.get_order(id).await.map_err(CoreError::storage)? {
                return Ok(Some(order));
            }
        }
        orders
            .get_order_by_provider_ref(identifier)
            .await
            .map_err(CoreError::storage)
    }

    async fn reject(&self, channel_id: Uuid, payload: &[u8], actor: &Actor, error: &CoreError) {
        self.lifecycle
            .audit()
            .record(
                AuditEntry::new(LogType::Callback)
                    .channel(channel_id)
                    .request(raw_payload(payload))
                    .actor(actor)
                    .error(error),
            )
            .await;
    }
}

fn transition_request(outcome: WebhookOutcome, payload: &[u8], actor: Actor) -> TransitionRequest {
    let mut request = TransitionRequest::new(outcome.target_status, Cause::Webhook, LogType::Callback, actor);
    request.provider_ref = outcome.provider_ref;
    request.metadata = outcome.metadata;
    request.request = serde_json::json!({
        "event_type": outcome.event_type,
        "body": raw_payload(payload),
    });
    request
}
