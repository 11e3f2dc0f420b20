//! Host-facing error type.
//!
//! Every failure the engine surfaces to its embedding host maps to one of the
//! variants below. `kind()` returns the stable machine-readable kind string;
//! the `Display` impl carries the human-readable message.

use crate::explorer::ExplorerError;
use thiserror::Error;

/// Errors surfaced by the payment engine.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// An argument failed a type or range check.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configured merchant wallet address is malformed.
    #[error("invalid merchant wallet address")]
    InvalidWallet,

    /// The requested currency is not supported.
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// A creation rate limit was hit.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The global cap on active pending forms was reached.
    #[error("active form cap exceeded: {active}/{max}")]
    FormCapExceeded { active: i64, max: i64 },

    /// The requested amount is too close to a recent transaction amount.
    #[error("amount is too similar to a recent transaction")]
    SimilarToRecent,

    /// No form with the given identifier exists.
    #[error("payment form not found")]
    FormNotFound,

    /// The form exists but is no longer pending.
    #[error("payment form is not pending")]
    FormNotPending,

    /// The form deadline has passed.
    #[error("payment form expired")]
    Expired,

    /// Transfer amount or currency does not match the form.
    #[error("amount or currency mismatch")]
    Mismatch,

    /// The on-chain transaction was already settled against a form.
    #[error("transaction already processed")]
    AlreadyProcessed,

    /// Another settlement won the guarded status update.
    #[error("lost settlement race")]
    RaceLost,

    /// The database stayed lock-busy through all retries.
    #[error("storage busy")]
    StorageBusy,

    /// A database operation failed.
    #[error("storage failed: {0}")]
    Storage(#[from] sqlx::Error),

    /// A payment form row could not be persisted.
    #[error("could not persist payment form")]
    FormPersistFailed,

    /// The explorer client failed.
    #[error(transparent)]
    Explorer(#[from] ExplorerError),

    /// A transfer failed sender, freshness, confirmation, or contract checks.
    #[error("validation failed: {0}")]
    ValidationFailed(&'static str),
}

impl PaymentError {
    /// Stable snake_case kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentError::InvalidArgument(_) => "invalid_argument",
            PaymentError::InvalidWallet => "invalid_wallet",
            PaymentError::UnsupportedCurrency(_) => "unsupported_currency",
            PaymentError::RateLimited(_) => "rate_limited",
            PaymentError::FormCapExceeded { .. } => "form_cap_exceeded",
            PaymentError::SimilarToRecent => "similar_to_recent",
            PaymentError::FormNotFound => "form_not_found",
            PaymentError::FormNotPending => "form_not_pending",
            PaymentError::Expired => "expired",
            PaymentError::Mismatch => "mismatch",
            PaymentError::AlreadyProcessed => "already_processed",
            PaymentError::RaceLost => "race_lost",
            PaymentError::StorageBusy => "storage_busy",
            PaymentError::Storage(_) | PaymentError::FormPersistFailed => "storage_failed",
            PaymentError::Explorer(ExplorerError::Ssl(_)) => "ssl_failed",
            PaymentError::Explorer(ExplorerError::ApiRejected(_)) => "api_rejected",
            PaymentError::Explorer(ExplorerError::RateLimited { .. }) => "rate_limited",
            PaymentError::Explorer(_) => "network_failed",
            PaymentError::ValidationFailed(_) => "validation_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(PaymentError::FormNotPending.kind(), "form_not_pending");
        assert_eq!(PaymentError::AlreadyProcessed.kind(), "already_processed");
        assert_eq!(
            PaymentError::RateLimited("wait".into()).kind(),
            "rate_limited"
        );
        assert_eq!(
            PaymentError::Explorer(ExplorerError::Ssl("handshake".into())).kind(),
            "ssl_failed"
        );
    }
}
