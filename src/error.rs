//! Error types for the time exchange
//!
//! The taxonomy separates business-rule rejections (terminal, surfaced to the
//! caller with a specific reason), transient store failures (safe to retry
//! from scratch), and invariant violations (bugs, never silently corrected).

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for exchange operations
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The service is not in an active lifecycle state
    #[error("service \"{0}\" is not open for requests")]
    ServiceNotActive(String),

    /// A member tried to express interest in their own service
    #[error("cannot express interest in your own service")]
    OwnService,

    /// An open handshake for this (service, requester) pair already exists
    #[error("you already have an open request for this service")]
    DuplicateInterest,

    /// The service has no remaining participant capacity
    #[error("service has reached its participant limit")]
    CapacityReached,

    /// The service's pending request queue hit the anti-spam ceiling
    #[error("service has too many pending requests")]
    PendingQueueFull,

    /// A debit would breach the overdraft floor
    #[error("insufficient balance: {available} cannot cover {required} without breaching the {floor} floor")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
        floor: Decimal,
    },

    /// State machine transition errors
    #[error("invalid state transition: {from} -> {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// A referenced row does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// The acting member is neither provider nor receiver of the handshake
    #[error("user {user} is not a party to handshake {handshake}")]
    NotParticipant { user: Uuid, handshake: Uuid },

    /// An hour amount failed validation before reaching the ledger
    #[error("invalid hour amount: {0}")]
    InvalidHours(String),

    /// Registration input failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Lock-wait timeout; the operation is safe to retry from scratch
    #[error("timed out waiting for a lock on {0}")]
    LockTimeout(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// A correctness invariant was broken; indicates a bug
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ExchangeError {
    /// Create a service-not-active error
    pub fn service_not_active<S: Into<String>>(title: S) -> Self {
        Self::ServiceNotActive(title.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from: S, to: S, reason: S) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Create an invalid-hours error
    pub fn invalid_hours<S: Into<String>>(msg: S) -> Self {
        Self::InvalidHours(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a lock-timeout error
    pub fn lock_timeout<S: Into<String>>(what: S) -> Self {
        Self::LockTimeout(what.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invariant-violation error
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Whether the operation is safe to retry from scratch.
    ///
    /// Only transient store failures qualify; every business rule is
    /// re-validated under the lock on retry, so a retry cannot duplicate an
    /// effect. Business rejections are terminal and must not be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_the_only_retryable_error() {
        assert!(ExchangeError::lock_timeout("account row").is_retryable());
        assert!(!ExchangeError::OwnService.is_retryable());
        assert!(!ExchangeError::CapacityReached.is_retryable());
        assert!(!ExchangeError::InsufficientBalance {
            required: Decimal::new(200, 2),
            available: Decimal::new(100, 2),
            floor: Decimal::new(-1000, 2),
        }
        .is_retryable());
        assert!(!ExchangeError::invariant("ledger diverged").is_retryable());
    }

    #[test]
    fn rejection_reasons_are_user_facing() {
        let err = ExchangeError::PendingQueueFull;
        assert_eq!(err.to_string(), "service has too many pending requests");

        let err = ExchangeError::state_transition("Pending", "Completed", "not yet accepted");
        assert!(err.to_string().contains("Pending -> Completed"));
    }
}
