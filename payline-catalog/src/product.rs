use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use crate::pricing::BillingInterval;

/// How a product is charged
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PricingType {
    OneTime,
    Recurring,
    UsageBased,
    Tiered,
}

impl PricingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingType::OneTime => "one_time",
            PricingType::Recurring => "recurring",
            PricingType::UsageBased => "usage_based",
            PricingType::Tiered => "tiered",
        }
    }
}

impl std::str::FromStr for PricingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(PricingType::OneTime),
            "recurring" => Ok(PricingType::Recurring),
            "usage_based" => Ok(PricingType::UsageBased),
            "tiered" => Ok(PricingType::Tiered),
            other => Err(format!("unknown pricing type: {}", other)),
        }
    }
}

/// A purchasable item or plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub pricing_type: PricingType,
    /// Price in minor currency units
    pub price: i64,
    pub currency: String,
    /// Free-form label as configured (`daily`, `weekly`, `monthly`, `yearly`)
    pub billing_interval: Option<String>,
    pub trial_days: u32,
    pub is_active: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(name: impl Into<String>, pricing_type: PricingType, price: i64, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            pricing_type,
            price,
            currency: currency.into(),
            billing_interval: None,
            trial_days: 0,
            is_active: true,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// A recurring plan billed every `interval`
    pub fn recurring(name: impl Into<String>, price: i64, currency: impl Into<String>, interval: BillingInterval) -> Self {
        let mut product = Self::new(name, PricingType::Recurring, price, currency);
        product.billing_interval = Some(interval.as_str().to_string());
        product
    }

    pub fn with_trial_days(mut self, days: u32) -> Self {
        self.trial_days = days;
        self
    }

    /// Billing interval, falling back to monthly for missing or unknown labels
    pub fn interval(&self) -> BillingInterval {
        self.billing_interval
            .as_deref()
            .map(BillingInterval::from_label)
            .unwrap_or_default()
    }

    /// Only recurring products may back a subscription
    pub fn ensure_subscribable(&self) -> Result<(), ProductError> {
        if !self.is_active {
            return Err(ProductError::NotAvailable(self.id.to_string()));
        }
        if self.pricing_type != PricingType::Recurring {
            return Err(ProductError::NotRecurring(self.id.to_string()));
        }
        Ok(())
    }
}

/// Product-related errors
#[derive(Debug, thiserror::Error)]
pub enum ProductError {
    #[error("Product not available: {0}")]
    NotAvailable(String),

    #[error("Product is not a recurring plan: {0}")]
    NotRecurring(String),
}
