use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;
use payline_core::repository::PaymentLogRepository;
use payline_core::{BoxError, LogType, OrderStatus, PaymentLog};

/// Insert-only; there is deliberately no update or delete statement here.
pub struct PgPaymentLogRepository {
    pool: PgPool,
}

impl PgPaymentLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    order_id: Option<Uuid>,
    channel_id: Option<Uuid>,
    log_type: String,
    status_before: Option<String>,
    status_after: Option<String>,
    request: Value,
    response: Value,
    actor: Option<String>,
    ip_address: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

fn parse_status(raw: Option<String>) -> Result<Option<OrderStatus>, BoxError> {
    Ok(raw.map(|s| s.parse::<OrderStatus>()).transpose()?)
}

impl LogRow {
    fn into_log(self) -> Result<PaymentLog, BoxError> {
        Ok(PaymentLog {
            id: self.id,
            order_id: self.order_id,
            channel_id: self.channel_id,
            log_type: self.log_type.parse::<LogType>()?,
            status_before: parse_status(self.status_before)?,
            status_after: parse_status(self.status_after)?,
            request: self.request,
            response: self.response,
            actor: self.actor,
            ip_address: self.ip_address,
            error: self.error,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl PaymentLogRepository for PgPaymentLogRepository {
    async fn append(&self, entry: &PaymentLog) -> Result<(), BoxError> {
        sqlx::query(
            r#"
            INSERT INTO payment_logs (id, order_id, channel_id, log_type, status_before, status_after,
                request, response, actor, ip_address, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id)
        .bind(entry.order_id)
        .bind(entry.channel_id)
        .bind(entry.log_type.as_str())
        .bind(entry.status_before.map(|s| s.as_str()))
        .bind(entry.status_after.map(|s| s.as_str()))
        .bind(&entry.request)
        .bind(&entry.response)
        .bind(&entry.actor)
        .bind(&entry.ip_address)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_order(&self, order_id: Uuid) -> Result<Vec<PaymentLog>, BoxError> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, order_id, channel_id, log_type, status_before, status_after, request, response, \
             actor, ip_address, error, created_at FROM payment_logs WHERE order_id = $1 ORDER BY created_at, id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LogRow::into_log).collect()
    }
}
