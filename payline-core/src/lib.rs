pub mod models;
pub mod repository;
pub mod payment;
pub mod events;

pub use models::{Order, OrderStatus, PaymentLog, LogType, Subscription, SubscriptionStatus, Transition};

/// Boxed error returned across port boundaries (repositories, providers, publishers)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFoundError(String),
    #[error("Precondition failed: {0}")]
    PreconditionError(String),
    #[error("Conflict: {0}")]
    ConflictError(String),
    #[error("Order expired: {0}")]
    ExpiredError(String),
    #[error("Provider configuration invalid: {0}")]
    ConfigurationError(String),
    #[error("Provider call failed: {0}")]
    ProviderError(String),
    #[error("Provider call timed out after {0} ms")]
    TimeoutError(u64),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Order number already in use: {0}")]
    DuplicateOrderNumber(String),
}

impl CoreError {
    /// Failures that leave state untouched and can be retried with the same input
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderError(_)
                | CoreError::TimeoutError(_)
                | CoreError::StorageError(_)
                | CoreError::DuplicateOrderNumber(_)
        )
    }

    pub fn storage(err: BoxError) -> Self {
        CoreError::StorageError(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(CoreError::TimeoutError(500).is_retryable());
        assert!(CoreError::DuplicateOrderNumber("x".into()).is_retryable());
        assert!(!CoreError::ValidationError("amount".into()).is_retryable());
        assert!(!CoreError::PreconditionError("status".into()).is_retryable());
    }
}
