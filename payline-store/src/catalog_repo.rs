use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;
use payline_catalog::{Channel, ChannelStatus, PaymentType, PricingType, Product, ProviderKind};
use payline_core::repository::{ChannelRepository, ProductRepository};
use payline_core::BoxError;
use payline_shared::Masked;

pub struct PgChannelRepository {
    pool: PgPool,
}

impl PgChannelRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
    id: Uuid,
    name: String,
    provider: String,
    status: String,
    supported_types: Vec<String>,
    config: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ChannelRow {
    fn into_channel(self) -> Result<Channel, BoxError> {
        let supported_types = self
            .supported_types
            .iter()
            .map(|t| t.parse::<PaymentType>())
            .collect::<Result<HashSet<_>, _>>()?;
        let config: BTreeMap<String, String> = serde_json::from_value(self.config)?;
        Ok(Channel {
            id: self.id,
            name: self.name,
            provider: self.provider.parse::<ProviderKind>()?,
            status: self.status.parse::<ChannelStatus>()?,
            supported_types,
            config: Masked(config),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl ChannelRepository for PgChannelRepository {
    async fn insert_channel(&self, channel: &Channel) -> Result<(), BoxError> {
        let supported: Vec<String> = channel.supported_types.iter().map(|t| t.as_str().to_string()).collect();
        let config = serde_json::to_value(channel.config.expose())?;
        sqlx::query(
            r#"
            INSERT INTO payment_channels (id, name, provider, status, supported_types, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(channel.id)
        .bind(&channel.name)
        .bind(channel.provider.as_str())
        .bind(channel.status.as_str())
        .bind(&supported)
        .bind(&config)
        .bind(channel.created_at)
        .bind(channel.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_channel(&self, id: Uuid) -> Result<Option<Channel>, BoxError> {
        let row = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, name, provider, status, supported_types, config, created_at, updated_at \
             FROM payment_channels WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ChannelRow::into_channel).transpose()
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, BoxError> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, name, provider, status, supported_types, config, created_at, updated_at \
             FROM payment_channels ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ChannelRow::into_channel).collect()
    }
}

pub struct PgProductRepository {
    pool: PgPool,
}

impl PgProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    pricing_type: String,
    price: i64,
    currency: String,
    billing_interval: Option<String>,
    trial_days: i32,
    is_active: bool,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProductRow {
    fn into_product(self) -> Result<Product, BoxError> {
        Ok(Product {
            id: self.id,
            name: self.name,
            description: self.description,
            pricing_type: self.pricing_type.parse::<PricingType>()?,
            price: self.price,
            currency: self.currency,
            billing_interval: self.billing_interval,
            trial_days: u32::try_from(self.trial_days)?,
            is_active: self.is_active,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl ProductRepository for PgProductRepository {
    async fn insert_product(&self, product: &Product) -> Result<(), BoxError> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, pricing_type, price, currency, billing_interval,
                trial_days, is_active, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.pricing_type.as_str())
        .bind(product.price)
        .bind(&product.currency)
        .bind(&product.billing_interval)
        .bind(i32::try_from(product.trial_days)?)
        .bind(product.is_active)
        .bind(&product.metadata)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, BoxError> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, description, pricing_type, price, currency, billing_interval, trial_days, \
             is_active, metadata, created_at, updated_at FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProductRow::into_product).transpose()
    }

    async fn list_products(&self) -> Result<Vec<Product>, BoxError> {
        let rows = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, description, pricing_type, price, currency, billing_interval, trial_days, \
             is_active, metadata, created_at, updated_at FROM products ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProductRow::into_product).collect()
    }
}
