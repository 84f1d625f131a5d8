//! Escrow ledger and handshake engine for a mutual-aid time exchange
//!
//! Members trade hours of service with a shared unit of account tracked per
//! member. Hours move between accounts only when both parties agree a service
//! happened. This crate implements the core that makes that safe:
//! - an append-only transaction ledger behind exclusive account row locks
//! - an escrow engine (provision, settle, refund) with an overdraft floor
//! - the handshake state machine driving which escrow operation fires
//! - admission control gating entry into a handshake
//! - an ordered locking discipline that makes deadlock structurally impossible

pub mod admission;
pub mod config;
pub mod error;
pub mod escrow;
pub mod exchange;
pub mod ledger;
pub mod models;
pub mod notifier;
pub mod roles;
pub mod store;

use error::ExchangeError;

/// Result type alias for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;
