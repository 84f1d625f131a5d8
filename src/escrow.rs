//! Escrow engine
//!
//! Moves hours between an account and escrow. Escrow is conceptual, not a
//! separate account: provisioned hours simply leave the payer's usable
//! balance, with a matching ledger row, and re-enter either the provider's
//! balance (settle) or the payer's (refund). Each operation validates
//! everything first and mutates only once nothing can fail, so a rejection
//! leaves every row untouched.
//!
//! Callers hold the handshake row lock across each call; the engine takes the
//! account row lock it needs, which keeps to the lock hierarchy
//! (handshake before account).

use crate::{
    error::ExchangeError,
    ledger::Ledger,
    models::{Handshake, HandshakeStatus, LedgerEntryKind, Service},
    roles::TransactionRoles,
    store::ExchangeStore,
    ExchangeResult,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

/// The three escrow operations plus pre-settlement adjustment
pub struct EscrowEngine {
    store: Arc<ExchangeStore>,
    ledger: Arc<Ledger>,
}

impl EscrowEngine {
    /// Create an escrow engine over the shared store and ledger
    pub fn new(store: Arc<ExchangeStore>, ledger: Arc<Ledger>) -> Self {
        Self { store, ledger }
    }

    /// Escrow the handshake's hours out of the payer's balance.
    ///
    /// Fails with `InsufficientBalance` and changes nothing if the overdraft
    /// floor would be breached; the caller then leaves the handshake pending.
    pub async fn provision(&self, handshake: &Handshake, service: &Service) -> ExchangeResult<()> {
        let roles = TransactionRoles::for_handshake(service, handshake);
        let mut payer = self.store.lock_account(roles.payer).await?;

        self.ledger
            .debit(
                &mut payer,
                handshake.provisioned_hours,
                LedgerEntryKind::Provision,
                Some(handshake.id),
                format!("Hours escrowed for \"{}\"", service.title),
            )
            .await?;

        info!(
            "provisioned {} hours from {} for handshake {}",
            handshake.provisioned_hours, roles.payer, handshake.id
        );
        Ok(())
    }

    /// Final transfer: credit the provider and complete the handshake.
    ///
    /// The dual-confirmation gate guarantees this is reached once; a call on
    /// an already-settled handshake would double-credit and is treated as a
    /// fatal invariant violation.
    pub async fn settle(&self, handshake: &mut Handshake, service: &Service) -> ExchangeResult<()> {
        if handshake.settled_at.is_some() {
            error!("second settlement attempted for handshake {}", handshake.id);
            return Err(ExchangeError::invariant(format!(
                "handshake {} is already settled",
                handshake.id
            )));
        }

        let roles = TransactionRoles::for_handshake(service, handshake);
        let mut provider = self.store.lock_account(roles.provider).await?;

        self.ledger
            .credit(
                &mut provider,
                handshake.provisioned_hours,
                LedgerEntryKind::Transfer,
                Some(handshake.id),
                format!("Hours received for \"{}\"", service.title),
            )
            .await?;

        handshake.status = HandshakeStatus::Completed;
        handshake.settled_at = Some(Utc::now());
        handshake.updated_at = Utc::now();

        info!(
            "settled {} hours to {} for handshake {}",
            handshake.provisioned_hours, roles.provider, handshake.id
        );
        Ok(())
    }

    /// Return the escrowed hours to the payer and cancel the handshake.
    ///
    /// Only meaningful once the handshake was provisioned (reached accepted).
    pub async fn refund(&self, handshake: &mut Handshake, service: &Service) -> ExchangeResult<()> {
        let roles = TransactionRoles::for_handshake(service, handshake);
        let mut payer = self.store.lock_account(roles.payer).await?;

        self.ledger
            .credit(
                &mut payer,
                handshake.provisioned_hours,
                LedgerEntryKind::Refund,
                Some(handshake.id),
                format!("Hours refunded for \"{}\"", service.title),
            )
            .await?;

        handshake.status = HandshakeStatus::Cancelled;
        handshake.updated_at = Utc::now();

        info!(
            "refunded {} hours to {} for handshake {}",
            handshake.provisioned_hours, roles.payer, handshake.id
        );
        Ok(())
    }

    /// Re-negotiate the escrowed amount before settlement.
    ///
    /// Moves only the difference against the payer, immediately: a raise
    /// debits it (floor-checked), a reduction credits it back. The payer
    /// identity is fixed at acceptance time; only the amount is adjustable.
    pub async fn adjust(
        &self,
        handshake: &mut Handshake,
        service: &Service,
        new_hours: Decimal,
    ) -> ExchangeResult<()> {
        if new_hours <= Decimal::ZERO || new_hours.round_dp(2) != new_hours {
            return Err(ExchangeError::invalid_hours(format!(
                "{new_hours} is not a positive two-decimal hour amount"
            )));
        }
        if handshake.status != HandshakeStatus::Accepted {
            return Err(ExchangeError::state_transition(
                format!("{:?}", handshake.status),
                "Accepted".to_string(),
                "hours can only be adjusted while the handshake is accepted".to_string(),
            ));
        }

        let difference = new_hours - handshake.provisioned_hours;
        if difference.is_zero() {
            return Ok(());
        }

        let roles = TransactionRoles::for_handshake(service, handshake);
        let mut payer = self.store.lock_account(roles.payer).await?;

        if difference > Decimal::ZERO {
            self.ledger
                .debit(
                    &mut payer,
                    difference,
                    LedgerEntryKind::Adjustment,
                    Some(handshake.id),
                    format!(
                        "Escrow raised to {} hours for \"{}\"",
                        new_hours, service.title
                    ),
                )
                .await?;
        } else {
            self.ledger
                .credit(
                    &mut payer,
                    -difference,
                    LedgerEntryKind::Adjustment,
                    Some(handshake.id),
                    format!(
                        "Escrow lowered to {} hours for \"{}\"",
                        new_hours, service.title
                    ),
                )
                .await?;
        }

        handshake.provisioned_hours = new_hours;
        handshake.updated_at = Utc::now();

        info!(
            "adjusted escrow for handshake {} by {} hours to {}",
            handshake.id, difference, new_hours
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, ServiceKind};
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<ExchangeStore>,
        engine: EscrowEngine,
        service: Service,
        requester_id: Uuid,
        owner_id: Uuid,
    }

    async fn fixture(kind: ServiceKind) -> Fixture {
        let store = Arc::new(ExchangeStore::new(Duration::from_millis(200)));
        let ledger = Arc::new(Ledger::new(store.clone(), Decimal::new(-1000, 2)));
        let engine = EscrowEngine::new(store.clone(), ledger);

        let owner = Account::new("owner".to_string(), Decimal::new(500, 2));
        let requester = Account::new("requester".to_string(), Decimal::new(300, 2));
        let (owner_id, requester_id) = (owner.id, requester.id);
        store.insert_account(owner).await;
        store.insert_account(requester).await;

        let service = Service::new(
            owner_id,
            kind,
            "Bike repair".to_string(),
            None,
            Decimal::new(200, 2),
            3,
        );
        store.insert_service(service.clone()).await;

        Fixture {
            store,
            engine,
            service,
            requester_id,
            owner_id,
        }
    }

    async fn balance(store: &ExchangeStore, id: Uuid) -> Decimal {
        store.snapshot_account(id).await.unwrap().balance
    }

    #[tokio::test]
    async fn provision_debits_the_requester_for_an_offer() {
        let fx = fixture(ServiceKind::Offer).await;
        let hs = Handshake::new(fx.service.id, fx.requester_id, Decimal::new(200, 2));

        fx.engine.provision(&hs, &fx.service).await.unwrap();

        assert_eq!(balance(&fx.store, fx.requester_id).await, Decimal::new(100, 2));
        assert_eq!(balance(&fx.store, fx.owner_id).await, Decimal::new(500, 2));
    }

    #[tokio::test]
    async fn provision_debits_the_owner_for_a_need() {
        let fx = fixture(ServiceKind::Need).await;
        let hs = Handshake::new(fx.service.id, fx.requester_id, Decimal::new(200, 2));

        fx.engine.provision(&hs, &fx.service).await.unwrap();

        assert_eq!(balance(&fx.store, fx.owner_id).await, Decimal::new(300, 2));
        assert_eq!(balance(&fx.store, fx.requester_id).await, Decimal::new(300, 2));
    }

    #[tokio::test]
    async fn settle_twice_is_an_invariant_violation() {
        let fx = fixture(ServiceKind::Offer).await;
        let mut hs = Handshake::new(fx.service.id, fx.requester_id, Decimal::new(200, 2));
        hs.status = HandshakeStatus::Accepted;

        fx.engine.settle(&mut hs, &fx.service).await.unwrap();
        assert_eq!(hs.status, HandshakeStatus::Completed);
        assert!(hs.settled_at.is_some());

        let err = fx.engine.settle(&mut hs, &fx.service).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvariantViolation(_)));
        // no second credit reached the provider
        assert_eq!(balance(&fx.store, fx.owner_id).await, Decimal::new(700, 2));
    }

    #[tokio::test]
    async fn adjustment_moves_exactly_the_difference() {
        let fx = fixture(ServiceKind::Offer).await;
        let mut hs = Handshake::new(fx.service.id, fx.requester_id, Decimal::new(200, 2));
        fx.engine.provision(&hs, &fx.service).await.unwrap();
        hs.status = HandshakeStatus::Accepted;

        // raise 2.00 -> 2.50: payer loses another 0.50
        fx.engine
            .adjust(&mut hs, &fx.service, Decimal::new(250, 2))
            .await
            .unwrap();
        assert_eq!(balance(&fx.store, fx.requester_id).await, Decimal::new(50, 2));
        assert_eq!(hs.provisioned_hours, Decimal::new(250, 2));

        // lower 2.50 -> 1.00: payer gets 1.50 back
        fx.engine
            .adjust(&mut hs, &fx.service, Decimal::new(100, 2))
            .await
            .unwrap();
        assert_eq!(balance(&fx.store, fx.requester_id).await, Decimal::new(200, 2));
        assert_eq!(hs.provisioned_hours, Decimal::new(100, 2));
    }

    #[tokio::test]
    async fn adjustment_respects_the_floor() {
        let fx = fixture(ServiceKind::Offer).await;
        let mut hs = Handshake::new(fx.service.id, fx.requester_id, Decimal::new(200, 2));
        fx.engine.provision(&hs, &fx.service).await.unwrap();
        hs.status = HandshakeStatus::Accepted;

        // requester sits at 1.00; raising escrow by 12.00 would breach -10.00
        let err = fx
            .engine
            .adjust(&mut hs, &fx.service, Decimal::new(1400, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
        assert_eq!(hs.provisioned_hours, Decimal::new(200, 2));
        assert_eq!(balance(&fx.store, fx.requester_id).await, Decimal::new(100, 2));
    }

    #[tokio::test]
    async fn refund_restores_the_payer_exactly() {
        let fx = fixture(ServiceKind::Offer).await;
        let mut hs = Handshake::new(fx.service.id, fx.requester_id, Decimal::new(200, 2));
        fx.engine.provision(&hs, &fx.service).await.unwrap();
        hs.status = HandshakeStatus::Accepted;

        fx.engine.refund(&mut hs, &fx.service).await.unwrap();

        assert_eq!(hs.status, HandshakeStatus::Cancelled);
        assert_eq!(balance(&fx.store, fx.requester_id).await, Decimal::new(300, 2));
    }
}
