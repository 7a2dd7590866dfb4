use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;
use payline_catalog::PaymentType;
use payline_core::repository::{Cursor, DuplicateKey, OrderFilter, OrderRepository, Page};
use payline_core::{BoxError, Order, OrderStatus};

const ORDER_COLUMNS: &str = "id, order_no, amount, currency, status, payment_type, channel_id, user_id, \
    product_id, subscription_id, expires_at, paid_at, provider_ref, metadata, created_at, updated_at";

const FILTER_CLAUSE: &str = "($1::text IS NULL OR user_id = $1) \
    AND ($2::uuid IS NULL OR channel_id = $2) \
    AND ($3::uuid IS NULL OR subscription_id = $3) \
    AND ($4::text IS NULL OR status = $4) \
    AND ($5::timestamptz IS NULL OR expires_at < $5)";

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(&self, clause: &str, value: &str) -> Result<Option<Order>, BoxError> {
        let sql = format!("SELECT {} FROM payment_orders WHERE {} = $1", ORDER_COLUMNS, clause);
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OrderRow::into_order).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_no: String,
    amount: i64,
    currency: String,
    status: String,
    payment_type: String,
    channel_id: Uuid,
    user_id: String,
    product_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    expires_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    provider_ref: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self) -> Result<Order, BoxError> {
        Ok(Order {
            id: self.id,
            order_no: self.order_no,
            amount: self.amount,
            currency: self.currency,
            status: self.status.parse::<OrderStatus>()?,
            payment_type: self.payment_type.parse::<PaymentType>()?,
            channel_id: self.channel_id,
            user_id: self.user_id,
            product_id: self.product_id,
            subscription_id: self.subscription_id,
            expires_at: self.expires_at,
            paid_at: self.paid_at,
            provider_ref: self.provider_ref,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Unique violations on insert surface as `DuplicateKey` so callers can retry
pub(crate) fn map_insert_error(err: sqlx::Error, key: &str) -> BoxError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return Box::new(DuplicateKey(key.to_string()));
        }
    }
    Box::new(err)
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn insert_order(&self, order: &Order) -> Result<(), BoxError> {
        sqlx::query(
            r#"
            INSERT INTO payment_orders (id, order_no, amount, currency, status, payment_type, channel_id, user_id,
                product_id, subscription_id, expires_at, paid_at, provider_ref, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(order.id)
        .bind(&order.order_no)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(order.payment_type.as_str())
        .bind(order.channel_id)
        .bind(&order.user_id)
        .bind(order.product_id)
        .bind(order.subscription_id)
        .bind(order.expires_at)
        .bind(order.paid_at)
        .bind(&order.provider_ref)
        .bind(&order.metadata)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &order.order_no))?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, BoxError> {
        let sql = format!("SELECT {} FROM payment_orders WHERE id = $1", ORDER_COLUMNS);
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OrderRow::into_order).transpose()
    }

    async fn get_order_by_no(&self, order_no: &str) -> Result<Option<Order>, BoxError> {
        self.fetch_one_where("order_no", order_no).await
    }

    async fn get_order_by_provider_ref(&self, provider_ref: &str) -> Result<Option<Order>, BoxError> {
        self.fetch_one_where("provider_ref", provider_ref).await
    }

    async fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<bool, BoxError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_orders
            SET status = $2, paid_at = $3, provider_ref = $4, metadata = $5, updated_at = $6
            WHERE id = $1 AND status = $7
            "#,
        )
        .bind(order.id)
        .bind(order.status.as_str())
        .bind(order.paid_at)
        .bind(&order.provider_ref)
        .bind(&order.metadata)
        .bind(order.updated_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<Order>, BoxError> {
        let sql = format!(
            "SELECT {} FROM payment_orders WHERE {} \
             AND ($6::timestamptz IS NULL OR (created_at, id) < ($6, $7::uuid)) \
             ORDER BY created_at DESC, id DESC LIMIT $8",
            ORDER_COLUMNS, FILTER_CLAUSE
        );
        let rows = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(filter.user_id.as_deref())
            .bind(filter.channel_id)
            .bind(filter.subscription_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.expires_before)
            .bind(cursor.and_then(|c| c.created_at()))
            .bind(cursor.map(|c| c.id))
            .bind(limit as i64 + 1)
            .fetch_all(&self.pool)
            .await?;

        let mut items = rows
            .into_iter()
            .map(OrderRow::into_order)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|o| Cursor::new(o.created_at, o.id))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn count_orders(&self, filter: &OrderFilter) -> Result<u64, BoxError> {
        let sql = format!("SELECT COUNT(*) FROM payment_orders WHERE {}", FILTER_CLAUSE);
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(filter.user_id.as_deref())
            .bind(filter.channel_id)
            .bind(filter.subscription_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.expires_before)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
