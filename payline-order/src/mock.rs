use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use serde::Deserialize;
use payline_catalog::ProviderKind;
use payline_core::models::{Order, OrderStatus};
use payline_core::payment::{
    PaymentProvider, ProviderFactory, ProviderPayment, ProviderSubscription, RefundResult, SubscriptionRequest,
    VerificationResult, WebhookOutcome,
};
use payline_core::BoxError;

pub const SIGNATURE_HEADER: &str = "x-mock-signature";

#[derive(Default)]
struct MockState {
    seq: u64,
    next_ref: Option<String>,
    failing: HashSet<&'static str>,
    delay: Option<Duration>,
    verify_status: Option<OrderStatus>,
    calls: Vec<&'static str>,
}

/// Scriptable in-process provider, used by tests and by `custom` channels in
/// local runs.
///
/// Webhooks are JSON: `{"type": "...", "order_no": "...", "status": "completed",
/// "provider_ref": "..."}`. When a webhook secret is configured the
/// `x-mock-signature` header must carry it.
pub struct MockProvider {
    kind: ProviderKind,
    webhook_secret: Option<String>,
    state: Mutex<MockState>,
}

#[derive(Debug, Deserialize)]
struct MockWebhook {
    #[serde(rename = "type", default)]
    event_type: String,
    order_no: Option<String>,
    order_id: Option<String>,
    status: Option<OrderStatus>,
    provider_ref: Option<String>,
    metadata: Option<serde_json::Value>,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            webhook_secret: None,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Make every subsequent call to `operation` fail until `recover`
    pub fn fail(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.state().failing.remove(operation);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Reference returned by the next `create_payment`/`create_subscription`
    pub fn set_next_ref(&self, provider_ref: impl Into<String>) {
        self.state().next_ref = Some(provider_ref.into());
    }

    /// Status reported by `verify_payment` (defaults to completed)
    pub fn set_verify_status(&self, status: OrderStatus) {
        self.state().verify_status = Some(status);
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| **c == operation).count()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record the call, honour the scripted delay and failure
    async fn enter(&self, operation: &'static str) -> Result<(), BoxError> {
        let (delay, failing) = {
            let mut state = self.state();
            state.calls.push(operation);
            (state.delay, state.failing.contains(operation))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(format!("mock {} failure", operation).into());
        }
        Ok(())
    }

    fn next_ref(&self, prefix: &str) -> String {
        let mut state = self.state();
        if let Some(scripted) = state.next_ref.take() {
            return scripted;
        }
        state.seq += 1;
        format!("{}_{}_{}", self.kind.as_str(), prefix, state.seq)
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create_payment(&self, order: &Order) -> Result<ProviderPayment, BoxError> {
        self.enter("create_payment").await?;
        let provider_ref = self.next_ref("pi");
        Ok(ProviderPayment {
            payload: serde_json::json!({
                "client_secret": format!("{}_secret", provider_ref),
                "amount": order.amount,
                "currency": order.currency,
            }),
            provider_ref,
        })
    }

    async fn verify_payment(
        &self,
        order: &Order,
        payload: &serde_json::Value,
    ) -> Result<VerificationResult, BoxError> {
        self.enter("verify_payment").await?;
        let scripted = self.state().verify_status;
        let target_status = scripted.unwrap_or(OrderStatus::Completed);
        Ok(VerificationResult {
            success: true,
            target_status,
            provider_ref: order.provider_ref.clone(),
            metadata: Some(serde_json::json!({ "verified_with": payload.clone() })),
        })
    }

    async fn process_webhook(
        &self,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<WebhookOutcome, BoxError> {
        self.enter("process_webhook").await?;
        if let Some(secret) = &self.webhook_secret {
            let presented = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(SIGNATURE_HEADER))
                .map(|(_, v)| v.as_str());
            if presented != Some(secret.as_str()) {
                return Err("invalid webhook signature".into());
            }
        }

        let event: MockWebhook = serde_json::from_slice(payload)?;
        let order_identifier = event.order_no.or(event.order_id).filter(|id| !id.is_empty());
        let target_status = match (&order_identifier, event.status) {
            (_, Some(status)) => status,
            (None, None) => OrderStatus::Pending,
            (Some(_), None) => return Err("webhook without status".into()),
        };

        Ok(WebhookOutcome {
            event_type: event.event_type,
            order_identifier,
            target_status,
            provider_ref: event.provider_ref,
            metadata: event.metadata,
        })
    }

    async fn refund_payment(
        &self,
        _order: &Order,
        amount: i64,
        _reason: Option<&str>,
    ) -> Result<RefundResult, BoxError> {
        self.enter("refund_payment").await?;
        Ok(RefundResult {
            success: true,
            refund_id: self.next_ref("re"),
            amount,
        })
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<ProviderSubscription, BoxError> {
        self.enter("create_subscription").await?;
        Ok(ProviderSubscription {
            provider_ref: self.next_ref("sub"),
            payload: serde_json::json!({ "interval": request.interval.as_str() }),
        })
    }

    async fn update_subscription(
        &self,
        _provider_ref: &str,
        _updates: &serde_json::Value,
    ) -> Result<(), BoxError> {
        self.enter("update_subscription").await
    }

    async fn cancel_subscription(&self, _provider_ref: &str, _immediate: bool) -> Result<(), BoxError> {
        self.enter("cancel_subscription").await
    }
}

/// Factory handing out `MockProvider`s.
///
/// With `shared`, every build returns the same scripted instance; otherwise a
/// fresh provider is built per call. A config containing `invalid` fails to build.
#[derive(Default)]
pub struct MockProviderFactory {
    shared: Option<Arc<MockProvider>>,
    build_delay: Option<Duration>,
    builds: AtomicUsize,
}

impl MockProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(provider: Arc<MockProvider>) -> Self {
        Self {
            shared: Some(provider),
            ..Self::default()
        }
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderFactory for MockProviderFactory {
    async fn build(
        &self,
        kind: ProviderKind,
        config: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn PaymentProvider>, BoxError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if config.contains_key("invalid") {
            return Err("rejected credentials".into());
        }
        if let Some(shared) = &self.shared {
            return Ok(shared.clone());
        }
        let mut provider = MockProvider::new(kind);
        if let Some(secret) = config.get("webhook_secret") {
            provider = provider.with_webhook_secret(secret.clone());
        }
        Ok(Arc::new(provider))
    }
}
