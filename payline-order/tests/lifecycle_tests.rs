mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use payline_catalog::{Channel, ChannelStatus, PaymentType, ProviderKind};
use payline_core::repository::{OrderFilter, OrderRepository};
use payline_core::{CoreError, LogType, OrderStatus};
use payline_order::{Actor, CreateOrderInput, WebhookReceipt};
use common::{short_timeout, signed_headers, webhook, BrokenPublisher, Harness};

fn input(h: &Harness, amount: i64) -> CreateOrderInput {
    CreateOrderInput::one_time("user-1", h.channel.id, amount, Some("usd"))
}

#[tokio::test]
async fn test_create_order_defaults() {
    let h = Harness::new().await;
    let mut request = input(&h, 1999);
    request.currency = None;

    let order = h.lifecycle.create(request, &Actor::user("user-1")).await.unwrap();

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.currency, "USD");
    assert!(order.paid_at.is_none());
    let ttl = order.expires_at - order.created_at;
    assert!(ttl >= chrono::Duration::hours(23) && ttl <= chrono::Duration::hours(25));

    let history = h.lifecycle.audit_history(order.id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].log_type, LogType::Create);
    assert_eq!(history[0].actor.as_deref(), Some("user-1"));
    assert_eq!(h.recorder.names(), vec!["payment.created"]);
}

#[tokio::test]
async fn test_create_order_validation() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");

    let err = h.lifecycle.create(input(&h, 0), &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));

    let mut request = input(&h, 100);
    request.currency = Some("XTS".to_string());
    let err = h.lifecycle.create(request, &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));

    let mut request = input(&h, 100);
    request.channel_id = uuid::Uuid::new_v4();
    let err = h.lifecycle.create(request, &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFoundError(_)));

    let mut disabled = Channel::new("off", ProviderKind::Custom, &[PaymentType::OneTime]);
    disabled.status = ChannelStatus::Disabled;
    let disabled = h.add_channel(disabled).await;
    let err = h
        .lifecycle
        .create(CreateOrderInput::one_time("user-1", disabled.id, 100, None), &actor)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PreconditionError(_)));

    let one_time_only = h.add_channel(Channel::new("cards", ProviderKind::Custom, &[PaymentType::OneTime])).await;
    let mut request = CreateOrderInput::one_time("user-1", one_time_only.id, 100, None);
    request.payment_type = PaymentType::Subscription;
    let err = h.lifecycle.create(request, &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::PreconditionError(_)));

    assert!(h.recorder.names().is_empty());
}

#[tokio::test]
async fn test_initiate_stores_provider_ref() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 500), &Actor::user("user-1")).await.unwrap();
    h.provider.set_next_ref("pi_abc");

    let (updated, payment) = h
        .lifecycle
        .initiate_provider_payment(order.id, &Actor::user("user-1"))
        .await
        .unwrap();

    assert_eq!(payment.provider_ref, "pi_abc");
    assert_eq!(updated.status, OrderStatus::Pending);
    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.provider_ref.as_deref(), Some("pi_abc"));
}

#[tokio::test]
async fn test_initiate_provider_failure_keeps_order_pending() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 500), &Actor::user("user-1")).await.unwrap();
    h.provider.fail("create_payment");

    let err = h
        .lifecycle
        .initiate_provider_payment(order.id, &Actor::user("user-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ProviderError(_)));

    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert!(stored.provider_ref.is_none());

    let history = h.lifecycle.audit_history(order.id).await;
    let error_entry = history.iter().find(|l| l.log_type == LogType::Error).expect("error entry");
    assert!(error_entry.error.as_deref().unwrap_or_default().contains("mock create_payment failure"));
}

#[tokio::test]
async fn test_initiate_expired_order_is_cancelled() {
    let h = Harness::new().await;
    let mut request = input(&h, 500);
    request.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(30));
    let order = h.lifecycle.create(request, &Actor::user("user-1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let err = h
        .lifecycle
        .initiate_provider_payment(order.id, &Actor::user("user-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ExpiredError(_)));
    assert_eq!(h.lifecycle.get(order.id).await.unwrap().status, OrderStatus::Cancelled);
    assert_eq!(h.provider.call_count("create_payment"), 0);
    assert_eq!(h.recorder.count("payment.expired"), 1);
}

#[tokio::test]
async fn test_initiate_requires_pending() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 500), &Actor::user("user-1")).await.unwrap();
    h.lifecycle.cancel(order.id, &Actor::user("user-1")).await.unwrap();

    let err = h
        .lifecycle
        .initiate_provider_payment(order.id, &Actor::user("user-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConflictError(_)));
}

#[tokio::test]
async fn test_verification_completes_order() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();

    let outcome = h
        .lifecycle
        .apply_verification(order.id, serde_json::json!({"token": "tok"}), &Actor::user("user-1"))
        .await
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.order.status, OrderStatus::Completed);
    assert!(outcome.order.paid_at.is_some());
    assert_eq!(h.recorder.count("payment.succeeded"), 1);
}

#[tokio::test]
async fn test_verification_failure_leaves_state() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    h.provider.fail("verify_payment");

    let err = h
        .lifecycle
        .apply_verification(order.id, serde_json::json!({}), &Actor::user("user-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ProviderError(_)));
    assert_eq!(h.lifecycle.get(order.id).await.unwrap().status, OrderStatus::Pending);
    assert_eq!(h.changes().await, 0);
}

#[tokio::test]
async fn test_provider_timeout_is_failure() {
    let h = Harness::with_settings(short_timeout()).await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    h.provider.set_delay(Some(Duration::from_millis(300)));

    let err = h
        .lifecycle
        .apply_verification(order.id, serde_json::json!({}), &Actor::user("user-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TimeoutError(50)));

    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert!(stored.paid_at.is_none());
}

#[tokio::test]
async fn test_webhook_then_verification_single_change() {
    // Verification: completed; later webhook also says completed.
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();

    h.lifecycle
        .apply_verification(order.id, serde_json::json!({}), &Actor::user("user-1"))
        .await
        .unwrap();
    let paid_at = h.lifecycle.get(order.id).await.unwrap().paid_at;

    let receipt = h
        .lifecycle
        .apply_webhook_result(h.channel.id, &webhook(&order.order_no, "completed"), &signed_headers())
        .await
        .unwrap();

    assert_eq!(
        receipt,
        WebhookReceipt::Applied {
            order_id: order.id,
            changed: false
        }
    );
    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.paid_at, paid_at);
    assert_eq!(h.changes().await, 1);
    assert_eq!(h.recorder.count("payment.succeeded"), 1);
}

#[tokio::test]
async fn test_duplicate_webhook_is_noop() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    let body = webhook(&order.order_no, "completed");

    let first = h
        .lifecycle
        .apply_webhook_result(h.channel.id, &body, &signed_headers())
        .await
        .unwrap();
    let second = h
        .lifecycle
        .apply_webhook_result(h.channel.id, &body, &signed_headers())
        .await
        .unwrap();

    assert!(matches!(first, WebhookReceipt::Applied { changed: true, .. }));
    assert!(matches!(second, WebhookReceipt::Applied { changed: false, .. }));
    assert_eq!(h.changes().await, 1);
    assert_eq!(h.recorder.count("payment.succeeded"), 1);

    // Both attempts are on the audit trail
    let callbacks = h
        .lifecycle
        .audit_history(order.id)
        .await
        .into_iter()
        .filter(|l| l.log_type == LogType::Callback)
        .count();
    assert_eq!(callbacks, 2);
}

#[tokio::test]
async fn test_stale_webhook_after_terminal_state() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    h.lifecycle
        .apply_webhook_result(h.channel.id, &webhook(&order.order_no, "failed"), &signed_headers())
        .await
        .unwrap();

    for status in ["completed", "pending", "cancelled", "refunded"] {
        let receipt = h
            .lifecycle
            .apply_webhook_result(h.channel.id, &webhook(&order.order_no, status), &signed_headers())
            .await
            .unwrap();
        assert!(matches!(receipt, WebhookReceipt::Applied { changed: false, .. }));
    }

    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Failed);
    assert!(stored.paid_at.is_none());
    assert_eq!(h.recorder.names(), vec!["payment.created", "payment.failed"]);
}

#[tokio::test]
async fn test_webhook_resolves_internal_id() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    let body = serde_json::json!({
        "type": "charge.succeeded",
        "order_id": order.id.to_string(),
        "status": "completed",
        "provider_ref": "ch_1",
    })
    .to_string();

    h.lifecycle
        .apply_webhook_result(h.channel.id, body.as_bytes(), &signed_headers())
        .await
        .unwrap();

    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.provider_ref.as_deref(), Some("ch_1"));
}

#[tokio::test]
async fn test_webhook_resolves_provider_ref() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 250), &Actor::user("user-1")).await.unwrap();
    h.provider.set_next_ref("pi_123");
    h.lifecycle
        .initiate_provider_payment(order.id, &Actor::user("user-1"))
        .await
        .unwrap();
    let body = serde_json::json!({
        "type": "payment_intent.succeeded",
        "order_id": "pi_123",
        "status": "completed",
    })
    .to_string();

    let first = h
        .lifecycle
        .apply_webhook_result(h.channel.id, body.as_bytes(), &signed_headers())
        .await
        .unwrap();
    assert_eq!(first, WebhookReceipt::Applied { order_id: order.id, changed: true });
    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.provider_ref.as_deref(), Some("pi_123"));

    let again = h
        .lifecycle
        .apply_webhook_result(h.channel.id, body.as_bytes(), &signed_headers())
        .await
        .unwrap();
    assert_eq!(again, WebhookReceipt::Applied { order_id: order.id, changed: false });
    assert_eq!(h.recorder.count("payment.succeeded"), 1);
    assert_eq!(h.changes().await, 1);
}

#[tokio::test]
async fn test_webhook_without_order_is_ignored() {
    let h = Harness::new().await;
    let receipt = h
        .lifecycle
        .apply_webhook_result(h.channel.id, br#"{"type":"ping"}"#, &signed_headers())
        .await
        .unwrap();

    assert_eq!(
        receipt,
        WebhookReceipt::Ignored {
            event_type: "ping".to_string()
        }
    );
    let logs = h.logs.all().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log_type, LogType::Callback);
    assert!(logs[0].error.is_none());
}

#[tokio::test]
async fn test_webhook_unknown_order() {
    let h = Harness::new().await;
    let err = h
        .lifecycle
        .apply_webhook_result(h.channel.id, &webhook("NOPE", "completed"), &signed_headers())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::NotFoundError(_)));
    let logs = h.logs.all().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log_type, LogType::Callback);
    assert!(logs[0].error.is_some());
}

#[tokio::test]
async fn test_webhook_bad_signature_rejected() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();

    let err = h
        .lifecycle
        .apply_webhook_result(h.channel.id, &webhook(&order.order_no, "completed"), &HashMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::ProviderError(_)));
    assert_eq!(h.lifecycle.get(order.id).await.unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_webhook_on_foreign_channel_rejected() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    let other = h
        .add_channel(Channel::new("other", ProviderKind::Custom, &[PaymentType::OneTime]))
        .await;

    let err = h
        .lifecycle
        .apply_webhook_result(other.id, &webhook(&order.order_no, "completed"), &signed_headers())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::PreconditionError(_)));
    assert_eq!(h.lifecycle.get(order.id).await.unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_refund_full_and_partial() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");
    let order = h.lifecycle.create(input(&h, 100), &actor).await.unwrap();

    let err = h.lifecycle.refund(order.id, None, None, &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::PreconditionError(_)));

    h.lifecycle
        .apply_verification(order.id, serde_json::json!({}), &actor)
        .await
        .unwrap();

    let err = h.lifecycle.refund(order.id, Some(150), None, &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));
    assert_eq!(h.provider.call_count("refund_payment"), 0);

    let refunded = h
        .lifecycle
        .refund(order.id, Some(40), Some("damaged".to_string()), &actor)
        .await
        .unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_eq!(refunded.refunded_amount(), 40);
    assert!(refunded.paid_at.is_some());
    assert_eq!(h.recorder.count("payment.refunded"), 1);

    // Refunded is terminal for the refund operation itself
    let err = h.lifecycle.refund(order.id, Some(10), None, &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::PreconditionError(_)));
}

#[tokio::test]
async fn test_refund_defaults_to_full_amount() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");
    let order = h.lifecycle.create(input(&h, 2500), &actor).await.unwrap();
    h.lifecycle
        .apply_verification(order.id, serde_json::json!({}), &actor)
        .await
        .unwrap();

    let refunded = h.lifecycle.refund(order.id, None, None, &actor).await.unwrap();

    let refunds = refunded.metadata["refunds"].as_array().unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0]["amount"], 2500);
}

#[tokio::test]
async fn test_refund_provider_failure_changes_nothing() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");
    let order = h.lifecycle.create(input(&h, 100), &actor).await.unwrap();
    h.lifecycle
        .apply_verification(order.id, serde_json::json!({}), &actor)
        .await
        .unwrap();
    h.provider.fail("refund_payment");

    let err = h.lifecycle.refund(order.id, None, None, &actor).await.unwrap_err();

    assert!(matches!(err, CoreError::ProviderError(_)));
    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.refunded_amount(), 0);
    assert_eq!(h.recorder.count("payment.refunded"), 0);
}

#[tokio::test]
async fn test_cancel_only_pending() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");
    let order = h.lifecycle.create(input(&h, 100), &actor).await.unwrap();

    let cancelled = h.lifecycle.cancel(order.id, &actor).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.recorder.count("payment.cancelled"), 1);

    let err = h.lifecycle.cancel(order.id, &actor).await.unwrap_err();
    assert!(matches!(err, CoreError::PreconditionError(_)));
}

#[tokio::test]
async fn test_expire_stale_orders() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");
    let mut short = input(&h, 100);
    short.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(20));
    let stale = h.lifecycle.create(short, &actor).await.unwrap();
    let fresh = h.lifecycle.create(input(&h, 100), &actor).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let expired = h.lifecycle.expire_stale_orders().await.unwrap();

    assert_eq!(expired, 1);
    assert_eq!(h.lifecycle.get(stale.id).await.unwrap().status, OrderStatus::Cancelled);
    assert_eq!(h.lifecycle.get(fresh.id).await.unwrap().status, OrderStatus::Pending);
    assert_eq!(h.recorder.count("payment.expired"), 1);
    assert_eq!(h.lifecycle.expire_stale_orders().await.unwrap(), 0);
}

#[tokio::test]
async fn test_list_orders_cursor() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");
    for amount in 1..=5 {
        h.lifecycle.create(input(&h, amount * 100), &actor).await.unwrap();
    }

    let filter = OrderFilter {
        user_id: Some("user-1".to_string()),
        ..OrderFilter::default()
    };
    let first = h.lifecycle.list_orders(&filter, None, 3).await.unwrap();
    assert_eq!(first.items.len(), 3);
    let second = h.lifecycle.list_orders(&filter, first.next_cursor, 3).await.unwrap();
    assert_eq!(second.items.len(), 2);
    assert!(second.next_cursor.is_none());

    let mut seen: Vec<_> = first.items.iter().chain(second.items.iter()).map(|o| o.id).collect();
    seen.dedup();
    assert_eq!(seen.len(), 5);
}

#[tokio::test]
async fn test_concurrent_verification_and_webhook() {
    let h = Harness::new().await;
    let actor = Actor::user("user-1");
    let order = h.lifecycle.create(input(&h, 100), &actor).await.unwrap();
    let body = webhook(&order.order_no, "completed");
    let headers = signed_headers();

    let (verified, hooked) = tokio::join!(
        h.lifecycle.apply_verification(order.id, serde_json::json!({}), &actor),
        h.lifecycle.apply_webhook_result(h.channel.id, &body, &headers),
    );

    let verified = verified.unwrap();
    let hooked = hooked.unwrap();
    let hook_changed = matches!(hooked, WebhookReceipt::Applied { changed: true, .. });
    assert!(verified.changed ^ hook_changed);
    assert_eq!(h.changes().await, 1);
    assert_eq!(h.recorder.count("payment.succeeded"), 1);
}

#[tokio::test]
async fn test_conflicting_terminal_race_has_one_winner() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    let lifecycle = h.lifecycle.clone();
    let channel_id = h.channel.id;

    let mut tasks = Vec::new();
    for status in ["completed", "failed", "cancelled", "completed"] {
        let lifecycle = lifecycle.clone();
        let body = webhook(&order.order_no, status);
        tasks.push(tokio::spawn(async move {
            lifecycle
                .apply_webhook_result(channel_id, &body, &signed_headers())
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let stored = h.lifecycle.get(order.id).await.unwrap();
    assert!(stored.status.is_terminal());
    assert_eq!(stored.paid_at.is_some(), stored.status == OrderStatus::Completed);
    assert_eq!(h.changes().await, 1);
    assert_eq!(h.recorder.names().len(), 2);
}

#[tokio::test]
async fn test_publisher_failure_does_not_roll_back() {
    let h = Harness::with_publisher(Arc::new(BrokenPublisher)).await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();

    let outcome = h
        .lifecycle
        .apply_verification(order.id, serde_json::json!({}), &Actor::user("user-1"))
        .await
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(h.lifecycle.get(order.id).await.unwrap().status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_stale_write_is_rejected_by_store() {
    let h = Harness::new().await;
    let order = h.lifecycle.create(input(&h, 100), &Actor::user("user-1")).await.unwrap();
    h.lifecycle
        .apply_verification(order.id, serde_json::json!({}), &Actor::user("user-1"))
        .await
        .unwrap();

    let mut stale = order.clone();
    stale.set_status(OrderStatus::Failed, Utc::now());
    assert!(!h.stores.orders.update_order(&stale, OrderStatus::Pending).await.unwrap());
    assert_eq!(h.lifecycle.get(order.id).await.unwrap().status, OrderStatus::Completed);
}
