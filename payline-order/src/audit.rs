use std::sync::Arc;
use chrono::Utc;
use uuid::Uuid;
use payline_core::repository::PaymentLogRepository;
use payline_core::{LogType, Order, OrderStatus, PaymentLog};
use crate::Actor;

/// Builder for one audit record
pub struct AuditEntry {
    log: PaymentLog,
}

impl AuditEntry {
    pub fn new(log_type: LogType) -> Self {
        Self {
            log: PaymentLog {
                id: Uuid::new_v4(),
                order_id: None,
                channel_id: None,
                log_type,
                status_before: None,
                status_after: None,
                request: serde_json::Value::Null,
                response: serde_json::Value::Null,
                actor: None,
                ip_address: None,
                error: None,
                created_at: Utc::now(),
            },
        }
    }

    /// Attach an order; before/after default to its current status
    pub fn order(mut self, order: &Order) -> Self {
        self.log.order_id = Some(order.id);
        self.log.channel_id = Some(order.channel_id);
        self.log.status_before = Some(order.status);
        self.log.status_after = Some(order.status);
        self
    }

    pub fn channel(mut self, channel_id: Uuid) -> Self {
        self.log.channel_id = Some(channel_id);
        self
    }

    pub fn transition(mut self, before: Option<OrderStatus>, after: OrderStatus) -> Self {
        self.log.status_before = before;
        self.log.status_after = Some(after);
        self
    }

    pub fn request(mut self, request: serde_json::Value) -> Self {
        self.log.request = request;
        self
    }

    pub fn response(mut self, response: serde_json::Value) -> Self {
        self.log.response = response;
        self
    }

    pub fn actor(mut self, actor: &Actor) -> Self {
        self.log.actor = actor.user_id.clone();
        self.log.ip_address = actor.ip_address.clone();
        self
    }

    pub fn error(mut self, error: impl std::fmt::Display) -> Self {
        self.log.error = Some(error.to_string());
        self
    }

    pub fn build(self) -> PaymentLog {
        self.log
    }
}

/// Append-only recorder of every lifecycle attempt.
///
/// Writes happen after the state change they describe has committed. A failed
/// write is reported through `tracing` and never fails the caller.
pub struct AuditLog {
    repo: Arc<dyn PaymentLogRepository>,
}

impl AuditLog {
    pub fn new(repo: Arc<dyn PaymentLogRepository>) -> Self {
        Self { repo }
    }

    pub async fn record(&self, entry: AuditEntry) {
        let log = entry.build();
        if let Err(e) = self.repo.append(&log).await {
            tracing::error!(
                log_type = log.log_type.as_str(),
                order_id = ?log.order_id,
                error = %e,
                "Failed to write payment log"
            );
        }
    }

    pub async fn history(&self, order_id: Uuid) -> Vec<PaymentLog> {
        match self.repo.list_for_order(order_id).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(%order_id, error = %e, "Failed to read payment log");
                Vec::new()
            }
        }
    }
}

/// Render a raw webhook body for the audit trail: JSON when it parses, text otherwise
pub fn raw_payload(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()))
}
