use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use payline_shared::pii::Masked;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Active,
    Disabled,
    Testing,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Active => "active",
            ChannelStatus::Disabled => "disabled",
            ChannelStatus::Testing => "testing",
        }
    }
}

impl std::str::FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ChannelStatus::Active),
            "disabled" => Ok(ChannelStatus::Disabled),
            "testing" => Ok(ChannelStatus::Testing),
            other => Err(format!("unknown channel status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    OneTime,
    Subscription,
    Recurring,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OneTime => "one_time",
            PaymentType::Subscription => "subscription",
            PaymentType::Recurring => "recurring",
        }
    }
}

impl std::str::FromStr for PaymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(PaymentType::OneTime),
            "subscription" => Ok(PaymentType::Subscription),
            "recurring" => Ok(PaymentType::Recurring),
            other => Err(format!("unknown payment type: {}", other)),
        }
    }
}

/// Provider family a channel integrates with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Stripe,
    Paypal,
    Alipay,
    Wechat,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::Paypal => "paypal",
            ProviderKind::Alipay => "alipay",
            ProviderKind::Wechat => "wechat",
            ProviderKind::Custom => "custom",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Ok(ProviderKind::Stripe),
            "paypal" => Ok(ProviderKind::Paypal),
            "alipay" => Ok(ProviderKind::Alipay),
            "wechat" | "wechatpay" | "wechat_pay" => Ok(ProviderKind::Wechat),
            "custom" => Ok(ProviderKind::Custom),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// A configured payment integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderKind,
    pub status: ChannelStatus,
    pub supported_types: HashSet<PaymentType>,
    /// Credentials and endpoint overrides, opaque to the engine
    pub config: Masked<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(name: impl Into<String>, provider: ProviderKind, supported_types: &[PaymentType]) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider,
            status: ChannelStatus::Active,
            supported_types: supported_types.iter().copied().collect(),
            config: Masked(BTreeMap::new()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.config.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn supports(&self, payment_type: PaymentType) -> bool {
        self.supported_types.contains(&payment_type)
    }

    /// Orders may only be created against active channels that accept the type
    pub fn accepts(&self, payment_type: PaymentType) -> bool {
        self.status == ChannelStatus::Active && self.supports(payment_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        let mut channel = Channel::new("stripe-main", ProviderKind::Stripe, &[PaymentType::OneTime]);
        assert!(channel.accepts(PaymentType::OneTime));
        assert!(!channel.accepts(PaymentType::Subscription));

        channel.status = ChannelStatus::Testing;
        assert!(!channel.accepts(PaymentType::OneTime));
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("Stripe".parse::<ProviderKind>().unwrap(), ProviderKind::Stripe);
        assert_eq!("wechat_pay".parse::<ProviderKind>().unwrap(), ProviderKind::Wechat);
        assert!("square".parse::<ProviderKind>().is_err());
    }
}
