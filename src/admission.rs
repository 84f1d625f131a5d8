//! Admission controller
//!
//! Gates entry into a handshake. All checks run in order inside one locked
//! scope: the service row lock first, then both user rows in ascending id
//! order, so two members expressing interest in each other's services at the
//! same moment can never wait on each other in a cycle. No ledger mutation
//! happens here; provisioning fires only on approval.

use crate::{
    error::ExchangeError,
    models::{Handshake, Message},
    roles::TransactionRoles,
    store::ExchangeStore,
    ExchangeResult,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Outcome of a non-persisting admission check
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub ok: bool,
    /// The specific rejection reason, verbatim, when `ok` is false
    pub reason: Option<String>,
}

/// Validates and creates handshakes
pub struct AdmissionController {
    store: Arc<ExchangeStore>,
    /// Hard ceiling on pending requests per service, independent of capacity
    pending_queue_cap: usize,
}

impl AdmissionController {
    /// Create an admission controller over the shared store
    pub fn new(store: Arc<ExchangeStore>, pending_queue_cap: usize) -> Self {
        Self {
            store,
            pending_queue_cap,
        }
    }

    /// Run the admission checks without persisting anything.
    ///
    /// Business rejections come back as `(false, reason)`; missing rows and
    /// transient lock failures still surface as errors.
    pub async fn can_express_interest(
        &self,
        service_id: Uuid,
        user_id: Uuid,
    ) -> ExchangeResult<AdmissionDecision> {
        match self.admit(service_id, user_id, false).await {
            Ok(_) => Ok(AdmissionDecision {
                ok: true,
                reason: None,
            }),
            Err(err @ ExchangeError::NotFound { .. }) => Err(err),
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => Ok(AdmissionDecision {
                ok: false,
                reason: Some(err.to_string()),
            }),
        }
    }

    /// Validate and create a pending handshake.
    ///
    /// On success the handshake is persisted with the service's default
    /// duration escrow-ready, and an opening message is stored. Failures
    /// surface one of the admission taxonomy reasons.
    pub async fn express_interest(
        &self,
        service_id: Uuid,
        user_id: Uuid,
    ) -> ExchangeResult<Handshake> {
        let handshake = self.admit(service_id, user_id, true).await?.ok_or_else(|| {
            ExchangeError::invariant("admission persisted nothing on the persist path")
        })?;

        info!(
            "user {} expressed interest in service {} (handshake {})",
            user_id, service_id, handshake.id
        );
        Ok(handshake)
    }

    /// The shared admission path. Checks, in order:
    /// 1. service is active
    /// 2. requester is not the owner
    /// 3. no open handshake for this (service, requester) pair
    /// 4. active handshakes below the participant limit
    /// 5. pending handshakes below the anti-spam ceiling
    /// 6. the payer can cover the service's duration
    async fn admit(
        &self,
        service_id: Uuid,
        user_id: Uuid,
        persist: bool,
    ) -> ExchangeResult<Option<Handshake>> {
        let service = self.store.lock_service(service_id).await?;

        if !service.status.is_active() {
            return Err(ExchangeError::service_not_active(service.title.clone()));
        }
        if service.owner_id == user_id {
            return Err(ExchangeError::OwnService);
        }

        // counts are stable against concurrent admissions while the service
        // row lock is held
        let existing = self.store.handshakes_for_service(service_id).await?;
        if existing
            .iter()
            .any(|h| h.requester_id == user_id && h.status.is_active())
        {
            return Err(ExchangeError::DuplicateInterest);
        }

        let active = existing.iter().filter(|h| h.status.is_active()).count();
        if active >= service.max_participants as usize {
            return Err(ExchangeError::CapacityReached);
        }

        let pending = existing
            .iter()
            .filter(|h| h.status == crate::models::HandshakeStatus::Pending)
            .count();
        if pending >= self.pending_queue_cap {
            return Err(ExchangeError::PendingQueueFull);
        }

        // both user rows locked together, ascending id order, to read the
        // payer's balance and the pair's identities consistently
        let (requester, owner) = self
            .store
            .lock_account_pair(user_id, service.owner_id)
            .await?;
        if requester.id == owner.id {
            return Err(ExchangeError::OwnService);
        }

        let roles = TransactionRoles::derive(service.kind, owner.id, requester.id);
        let payer_balance = if roles.payer == requester.id {
            requester.balance
        } else {
            owner.balance
        };
        if payer_balance < service.duration_hours {
            // admission requires full cover; the overdraft floor is reserved
            // for balances that moved between admission and approval
            return Err(ExchangeError::InsufficientBalance {
                required: service.duration_hours,
                available: payer_balance,
                floor: Decimal::ZERO,
            });
        }

        if !persist {
            return Ok(None);
        }

        let handshake = Handshake::new(service_id, user_id, service.duration_hours);
        let opening = Message::new(
            handshake.id,
            user_id,
            service.owner_id,
            format!("Hi! I'm interested in \"{}\".", service.title),
        );
        self.store.insert_handshake(handshake.clone()).await;
        self.store.append_message(opening).await;

        Ok(Some(handshake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, HandshakeStatus, Service, ServiceKind, ServiceStatus};
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct Fixture {
        store: Arc<ExchangeStore>,
        admission: AdmissionController,
        owner_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(ExchangeStore::new(Duration::from_millis(200)));
        let admission = AdmissionController::new(store.clone(), 50);

        let owner = Account::new("owner".to_string(), Decimal::new(500, 2));
        let owner_id = owner.id;
        store.insert_account(owner).await;

        Fixture {
            store,
            admission,
            owner_id,
        }
    }

    async fn add_member(fx: &Fixture, balance: Decimal) -> Uuid {
        let account = Account::new("member".to_string(), balance);
        let id = account.id;
        fx.store.insert_account(account).await;
        id
    }

    async fn add_service(fx: &Fixture, kind: ServiceKind, max_participants: u32) -> Uuid {
        let service = Service::new(
            fx.owner_id,
            kind,
            "Garden help".to_string(),
            None,
            Decimal::new(200, 2),
            max_participants,
        );
        let id = service.id;
        fx.store.insert_service(service).await;
        id
    }

    #[tokio::test]
    async fn admission_creates_a_pending_handshake_and_opening_message() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 3).await;
        let member = add_member(&fx, Decimal::new(300, 2)).await;

        let handshake = fx.admission.express_interest(service_id, member).await.unwrap();

        assert_eq!(handshake.status, HandshakeStatus::Pending);
        assert_eq!(handshake.provisioned_hours, Decimal::new(200, 2));
        assert!(!handshake.provider_confirmed);
        assert!(!handshake.receiver_confirmed);

        let messages = fx.store.messages_for_handshake(handshake.id).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, member);
        assert_eq!(messages[0].recipient_id, fx.owner_id);

        // no ledger mutation on admission
        assert!(fx.store.entries_for_account(member).await.is_empty());
    }

    #[tokio::test]
    async fn inactive_services_reject_interest() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 3).await;
        let member = add_member(&fx, Decimal::new(300, 2)).await;

        {
            let mut service = fx.store.lock_service(service_id).await.unwrap();
            service.status = ServiceStatus::Paused;
        }

        let err = fx
            .admission
            .express_interest(service_id, member)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ServiceNotActive(_)));
    }

    #[tokio::test]
    async fn owners_cannot_request_their_own_service() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 3).await;

        let err = fx
            .admission
            .express_interest(service_id, fx.owner_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OwnService));
    }

    #[tokio::test]
    async fn duplicate_open_interest_is_rejected() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 3).await;
        let member = add_member(&fx, Decimal::new(300, 2)).await;

        fx.admission.express_interest(service_id, member).await.unwrap();
        let err = fx
            .admission
            .express_interest(service_id, member)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::DuplicateInterest));
    }

    #[tokio::test]
    async fn a_closed_out_handshake_frees_the_duplicate_slot() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 3).await;
        let member = add_member(&fx, Decimal::new(300, 2)).await;

        let first = fx.admission.express_interest(service_id, member).await.unwrap();
        {
            let mut hs = fx.store.lock_handshake(first.id).await.unwrap();
            hs.status = HandshakeStatus::Cancelled;
        }

        assert!(fx.admission.express_interest(service_id, member).await.is_ok());
    }

    #[tokio::test]
    async fn capacity_counts_pending_and_accepted() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 2).await;

        let a = add_member(&fx, Decimal::new(300, 2)).await;
        let b = add_member(&fx, Decimal::new(300, 2)).await;
        let c = add_member(&fx, Decimal::new(300, 2)).await;

        let first = fx.admission.express_interest(service_id, a).await.unwrap();
        {
            let mut hs = fx.store.lock_handshake(first.id).await.unwrap();
            hs.status = HandshakeStatus::Accepted;
        }
        fx.admission.express_interest(service_id, b).await.unwrap();

        let err = fx.admission.express_interest(service_id, c).await.unwrap_err();
        assert!(matches!(err, ExchangeError::CapacityReached));
    }

    #[tokio::test]
    async fn the_fifty_first_pending_request_hits_the_queue_ceiling() {
        let fx = fixture().await;
        // capacity far above the queue ceiling
        let service_id = add_service(&fx, ServiceKind::Offer, 1000).await;

        for _ in 0..50 {
            let member = add_member(&fx, Decimal::new(300, 2)).await;
            fx.admission.express_interest(service_id, member).await.unwrap();
        }

        let member = add_member(&fx, Decimal::new(300, 2)).await;
        let err = fx
            .admission
            .express_interest(service_id, member)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PendingQueueFull));
    }

    #[tokio::test]
    async fn offer_requires_the_requester_to_cover_the_duration() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 3).await;
        let member = add_member(&fx, Decimal::new(100, 2)).await;

        let err = fx
            .admission
            .express_interest(service_id, member)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn need_requires_the_owner_to_cover_the_duration() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Need, 3).await;
        // owner has 5.00; drain them below the 2.00 duration
        {
            let mut owner = fx.store.lock_account(fx.owner_id).await.unwrap();
            owner.balance = Decimal::new(150, 2);
        }
        // requester is broke but provides, not pays
        let member = add_member(&fx, Decimal::ZERO).await;

        let err = fx
            .admission
            .express_interest(service_id, member)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn can_express_interest_reports_without_persisting() {
        let fx = fixture().await;
        let service_id = add_service(&fx, ServiceKind::Offer, 3).await;
        let member = add_member(&fx, Decimal::new(300, 2)).await;

        let decision = fx
            .admission
            .can_express_interest(service_id, member)
            .await
            .unwrap();
        assert!(decision.ok);
        assert!(decision.reason.is_none());
        assert!(fx.store.handshakes_for_service(service_id).await.unwrap().is_empty());

        let decision = fx
            .admission
            .can_express_interest(service_id, fx.owner_id)
            .await
            .unwrap();
        assert!(!decision.ok);
        assert_eq!(
            decision.reason.as_deref(),
            Some("cannot express interest in your own service")
        );
    }
}
