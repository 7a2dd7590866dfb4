use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};
use payline_order::{OrderLifecycle, SubscriptionBiller};
use payline_store::app_config::BillingConfig;

/// Start the periodic billing passes: renewals, subscription expiry and stale
/// order expiry. Each runs on its own schedule; a failed pass is logged and
/// retried on the next tick.
pub fn start_billing_worker(lifecycle: Arc<OrderLifecycle>, config: &BillingConfig) -> Vec<JoinHandle<()>> {
    let biller = Arc::new(SubscriptionBiller::new(lifecycle.clone()));

    info!(
        renewal_every = config.renewal_interval_seconds,
        expiry_every = config.expiry_interval_seconds,
        order_expiry_every = config.order_expiry_interval_seconds,
        "Billing worker started"
    );

    let renewals = {
        let biller = biller.clone();
        every("renewals", config.renewal_interval_seconds, move || {
            let biller = biller.clone();
            async move { biller.process_renewals().await.map(|_| ()) }
        })
    };
    let expiry = every("subscription_expiry", config.expiry_interval_seconds, move || {
        let biller = biller.clone();
        async move { biller.process_expired_subscriptions().await.map(|_| ()) }
    });
    let stale = every("order_expiry", config.order_expiry_interval_seconds, move || {
        let lifecycle = lifecycle.clone();
        async move {
            let expired = lifecycle.expire_stale_orders().await?;
            if expired > 0 {
                info!(expired, "Stale orders cancelled");
            }
            Ok(())
        }
    });

    vec![renewals, expiry, stale]
}

fn every<F, Fut>(name: &'static str, seconds: u64, mut pass: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = payline_core::CoreResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(seconds.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = pass().await {
                error!(pass = name, error = %e, "Billing pass failed");
            }
        }
    })
}
