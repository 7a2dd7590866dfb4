use serde::{Deserialize, Serialize};
use chrono::{DateTime, Duration, Months, Utc};

/// Billing cadence of a recurring product
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Yearly,
}

impl BillingInterval {
    /// Parse a configured label; anything unrecognized bills monthly.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => BillingInterval::Daily,
            "week" | "weekly" => BillingInterval::Weekly,
            "month" | "monthly" => BillingInterval::Monthly,
            "year" | "yearly" | "annual" => BillingInterval::Yearly,
            _ => BillingInterval::Monthly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Daily => "daily",
            BillingInterval::Weekly => "weekly",
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    /// End of the period that starts at `start`.
    ///
    /// Calendar months clamp to the last day of shorter months
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            BillingInterval::Daily => start.checked_add_signed(Duration::days(1)),
            BillingInterval::Weekly => start.checked_add_signed(Duration::weeks(1)),
            BillingInterval::Monthly => start.checked_add_months(Months::new(1)),
            BillingInterval::Yearly => start.checked_add_months(Months::new(12)),
        };
        // Only overflows at the end of chrono's representable range.
        next.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Next billing period `[current_end, next_end)`
    pub fn next_period(&self, current_end: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (current_end, self.advance(current_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_labels() {
        assert_eq!(BillingInterval::from_label("Daily"), BillingInterval::Daily);
        assert_eq!(BillingInterval::from_label("week"), BillingInterval::Weekly);
        assert_eq!(BillingInterval::from_label("yearly"), BillingInterval::Yearly);
        assert_eq!(BillingInterval::from_label(""), BillingInterval::Monthly);
    }

    #[test]
    fn test_advance() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();

        assert_eq!(BillingInterval::Daily.advance(start), Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap());
        assert_eq!(BillingInterval::Weekly.advance(start), Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap());
        assert_eq!(BillingInterval::Monthly.advance(start), Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap());
        assert_eq!(BillingInterval::Yearly.advance(start), Utc.with_ymd_and_hms(2027, 1, 31, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_period_is_contiguous() {
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let (start, next_end) = BillingInterval::Monthly.next_period(end);
        assert_eq!(start, end);
        assert!(next_end > start);
    }
}
