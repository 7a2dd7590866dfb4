use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;
use payline_catalog::{BillingInterval, ProviderKind};
use crate::models::{Order, OrderStatus};
use crate::BoxError;

/// Provider-side payment created for an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayment {
    /// Provider's identifier (e.g., pi_123)
    pub provider_ref: String,
    /// Whatever the client needs to complete the payment (client secret, redirect URL, QR code)
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub target_status: OrderStatus,
    pub provider_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A webhook after signature check and parsing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookOutcome {
    /// Provider event type, for the audit trail
    pub event_type: String,
    /// Order number or internal id as echoed by the provider. `None` for
    /// events unrelated to an order (subscription lifecycle, test pings).
    pub order_identifier: Option<String>,
    pub target_status: OrderStatus,
    pub provider_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResult {
    pub success: bool,
    pub refund_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub product_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub provider_ref: String,
    pub payload: serde_json::Value,
}

/// Capability contract every payment provider integration implements.
///
/// The engine never inspects provider-specific payloads; it only consumes the
/// normalized results above.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Create the provider-side payment for a pending order
    async fn create_payment(&self, order: &Order) -> Result<ProviderPayment, BoxError>;

    /// Confirm a client-reported payment with the provider
    async fn verify_payment(
        &self,
        order: &Order,
        payload: &serde_json::Value,
    ) -> Result<VerificationResult, BoxError>;

    /// Authenticate (signature) and parse a raw callback
    async fn process_webhook(
        &self,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<WebhookOutcome, BoxError>;

    async fn refund_payment(
        &self,
        order: &Order,
        amount: i64,
        reason: Option<&str>,
    ) -> Result<RefundResult, BoxError>;

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<ProviderSubscription, BoxError>;

    async fn update_subscription(
        &self,
        provider_ref: &str,
        updates: &serde_json::Value,
    ) -> Result<(), BoxError>;

    async fn cancel_subscription(&self, provider_ref: &str, immediate: bool) -> Result<(), BoxError>;
}

/// Builds live provider clients from a channel's configuration.
///
/// Construction may authenticate against the provider, so it is async and
/// may be slow.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(
        &self,
        kind: ProviderKind,
        config: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn PaymentProvider>, BoxError>;
}
