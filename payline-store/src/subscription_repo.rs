use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;
use payline_core::repository::{Cursor, Page, SubscriptionRepository};
use payline_core::{BoxError, Subscription, SubscriptionStatus};
use crate::order_repo::map_insert_error;

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, product_id, channel_id, status, current_period_start, \
    current_period_end, trial_start, trial_end, cancel_at, cancelled_at, provider_ref, metadata, version, \
    created_at, updated_at";

pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: String,
    product_id: Uuid,
    channel_id: Uuid,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    trial_start: Option<DateTime<Utc>>,
    trial_end: Option<DateTime<Utc>>,
    cancel_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    provider_ref: Option<String>,
    metadata: Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Result<Subscription, BoxError> {
        Ok(Subscription {
            id: self.id,
            user_id: self.user_id,
            product_id: self.product_id,
            channel_id: self.channel_id,
            status: self.status.parse::<SubscriptionStatus>()?,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            trial_start: self.trial_start,
            trial_end: self.trial_end,
            cancel_at: self.cancel_at,
            cancelled_at: self.cancelled_at,
            provider_ref: self.provider_ref,
            metadata: self.metadata,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn collect(rows: Vec<SubscriptionRow>) -> Result<Vec<Subscription>, BoxError> {
    rows.into_iter().map(SubscriptionRow::into_subscription).collect()
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), BoxError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, user_id, product_id, channel_id, status, current_period_start,
                current_period_end, trial_start, trial_end, cancel_at, cancelled_at, provider_ref, metadata,
                version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.user_id)
        .bind(subscription.product_id)
        .bind(subscription.channel_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.trial_start)
        .bind(subscription.trial_end)
        .bind(subscription.cancel_at)
        .bind(subscription.cancelled_at)
        .bind(&subscription.provider_ref)
        .bind(&subscription.metadata)
        .bind(subscription.version)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &subscription.id.to_string()))?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, BoxError> {
        let sql = format!("SELECT {} FROM subscriptions WHERE id = $1", SUBSCRIPTION_COLUMNS);
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<bool, BoxError> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, current_period_start = $3, current_period_end = $4, trial_start = $5,
                trial_end = $6, cancel_at = $7, cancelled_at = $8, provider_ref = $9, metadata = $10,
                version = $11, updated_at = $12
            WHERE id = $1 AND version = $13
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.trial_start)
        .bind(subscription.trial_end)
        .bind(subscription.cancel_at)
        .bind(subscription.cancelled_at)
        .bind(&subscription.provider_ref)
        .bind(&subscription.metadata)
        .bind(subscription.version)
        .bind(subscription.updated_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, BoxError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE status = $1 AND current_period_end > $2 AND current_period_end <= $3 \
             ORDER BY current_period_end",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(SubscriptionStatus::Active.as_str())
            .bind(now)
            .bind(until)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn list_lapsed(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, BoxError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE status = $1 AND current_period_end <= $2 ORDER BY current_period_end",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(SubscriptionStatus::Active.as_str())
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn list_subscriptions(
        &self,
        user_id: &str,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<Subscription>, BoxError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 \
             AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3::uuid)) \
             ORDER BY created_at DESC, id DESC LIMIT $4",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .bind(cursor.and_then(|c| c.created_at()))
            .bind(cursor.map(|c| c.id))
            .bind(limit as i64 + 1)
            .fetch_all(&self.pool)
            .await?;

        let mut items = collect(rows)?;
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|s| Cursor::new(s.created_at, s.id))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }
}
