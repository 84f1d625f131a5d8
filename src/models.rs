//! Core data models for the time exchange
//!
//! Row types and state machines: member accounts, services, handshakes, the
//! append-only ledger, and the opening conversation message.

use crate::{error::ExchangeError, ExchangeResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handshake state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStatus {
    /// Interest expressed, awaiting the owner's side of the agreement
    Pending,
    /// Agreement approved; hours are escrowed
    Accepted,
    /// Declined by the service owner before anything was provisioned
    Denied,
    /// Called off; escrowed hours (if any) were refunded
    Cancelled,
    /// Both parties confirmed; hours were transferred to the provider
    Completed,
    /// Under dispute; no further automatic transfer
    Reported,
    /// Dispute parked by moderation; no further automatic transfer
    Paused,
}

impl HandshakeStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Cancelled | Self::Paused)
    }

    /// Check if this handshake counts toward a service's capacity
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Accepted)
    }

    /// Check if this state allows approval
    pub fn can_approve(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this state allows completion confirmations
    pub fn can_confirm(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Check if this state allows filing a report
    pub fn can_report(&self) -> bool {
        matches!(self, Self::Accepted | Self::Completed)
    }
}

/// Whether a service offers hours or asks for them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    /// The owner provides the service; the requester consumes and pays
    Offer,
    /// The owner asks for the service; the requester provides, the owner pays
    Need,
}

/// Service lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Listed and open for requests
    Active,
    /// Temporarily hidden by the owner
    Paused,
    /// Permanently closed
    Closed,
}

impl ServiceStatus {
    /// Check if the service accepts new handshakes
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Kind of a balance-affecting ledger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryKind {
    /// Hours escrowed out of the payer's usable balance
    Provision,
    /// Final transfer crediting the provider
    Transfer,
    /// Escrowed hours returned to the payer
    Refund,
    /// Escrowed amount re-negotiated before settlement
    Adjustment,
}

/// Member account holding the time balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub display_name: String,
    /// Current balance in hours, two-decimal precision.
    /// Mutated only by the ledger primitives, under the account row lock.
    pub balance: Decimal,
    /// Balance the account was opened with; the ledger audit anchor.
    pub opening_balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account
    pub fn new(display_name: String, opening_balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_name,
            balance: opening_balance,
            opening_balance,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A listed offer or need
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub kind: ServiceKind,
    pub title: String,
    pub description: Option<String>,
    pub status: ServiceStatus,
    /// Default price of one exchange, in hours
    pub duration_hours: Decimal,
    /// Maximum simultaneous open handshakes
    pub max_participants: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Create a new active service
    pub fn new(
        owner_id: Uuid,
        kind: ServiceKind,
        title: String,
        description: Option<String>,
        duration_hours: Decimal,
        max_participants: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            kind,
            title,
            description,
            status: ServiceStatus::Active,
            duration_hours,
            max_participants,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Agreement details the provider supplies before approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agreement {
    pub location: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_hours: Decimal,
}

/// The persisted agreement between a requester and a service's owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub id: Uuid,
    pub service_id: Uuid,
    pub requester_id: Uuid,
    pub status: HandshakeStatus,
    /// Hours currently escrowed or to be escrowed; adjustable until settled
    pub provisioned_hours: Decimal,
    pub provider_confirmed: bool,
    pub receiver_confirmed: bool,
    /// Set by the provider; approval requires it
    pub agreement: Option<Agreement>,
    /// Stamped exactly once, when the final transfer fires
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Handshake {
    /// Create a new pending handshake
    pub fn new(service_id: Uuid, requester_id: Uuid, provisioned_hours: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            service_id,
            requester_id,
            status: HandshakeStatus::Pending,
            provisioned_hours,
            provider_confirmed: false,
            receiver_confirmed: false,
            agreement: None,
            settled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate a state transition
    pub fn validate_transition(&self, to: HandshakeStatus) -> ExchangeResult<()> {
        use HandshakeStatus::*;

        let valid = match (self.status, to) {
            (Pending, Accepted) | (Pending, Denied) | (Pending, Cancelled) => true,
            (Accepted, Completed) | (Accepted, Cancelled) | (Accepted, Reported) => true,
            (Completed, Reported) => true,
            // Reported resolves via moderation only
            (Reported, Paused) | (Reported, Cancelled) | (Reported, Completed) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(ExchangeError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to),
                "transition not allowed".to_string(),
            ))
        }
    }
}

/// Immutable record of one balance-affecting event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: LedgerEntryKind,
    /// Signed; negative for debits, positive for credits
    pub amount: Decimal,
    /// Account balance immediately after this entry was applied
    pub balance_after: Decimal,
    pub handshake_id: Option<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create a new ledger entry
    pub fn new(
        account_id: Uuid,
        kind: LedgerEntryKind,
        amount: Decimal,
        balance_after: Decimal,
        handshake_id: Option<Uuid>,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            amount,
            balance_after,
            handshake_id,
            description,
            created_at: Utc::now(),
        }
    }
}

/// Opening conversation message created on admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub handshake_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(handshake_id: Uuid, sender_id: Uuid, recipient_id: Uuid, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            handshake_id,
            sender_id,
            recipient_id,
            body,
            created_at: Utc::now(),
        }
    }
}
