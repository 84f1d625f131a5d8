//! Time exchange coordinator
//!
//! Wires the store, ledger, escrow engine, and admission controller together
//! and exposes the public surface. Every state transition invokes its escrow
//! side effect synchronously at the transition call site; there is no event
//! dispatch to chase. Notification requests go out fire-and-forget only after
//! the state they describe is committed, and a transient lock failure is
//! retried once before it reaches the caller.

use crate::{
    admission::{AdmissionController, AdmissionDecision},
    config::ExchangeConfig,
    error::ExchangeError,
    escrow::EscrowEngine,
    ledger::Ledger,
    models::{
        Account, Agreement, Handshake, HandshakeStatus, LedgerEntry, Message, Service,
        ServiceKind, ServiceStatus,
    },
    notifier::{LogNotifier, NotificationKind, NotificationRequest, NotificationSink},
    roles::TransactionRoles,
    store::ExchangeStore,
    ExchangeResult,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::{collections::HashSet, future::Future, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

/// Moderation outcome for a reported handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportResolution {
    /// Confirmed no-show: return the escrowed hours to the payer
    Refund,
    /// Report dismissed: let the exchange stand
    Dismiss,
}

/// The time exchange engine
pub struct TimeExchange {
    config: ExchangeConfig,
    store: Arc<ExchangeStore>,
    ledger: Arc<Ledger>,
    escrow: EscrowEngine,
    admission: AdmissionController,
    notifier: Arc<dyn NotificationSink>,
}

impl TimeExchange {
    /// Create an exchange with the default log-only notification sink
    pub fn new(config: ExchangeConfig) -> Self {
        Self::with_notifier(config, Arc::new(LogNotifier))
    }

    /// Create an exchange with a custom notification sink
    pub fn with_notifier(config: ExchangeConfig, notifier: Arc<dyn NotificationSink>) -> Self {
        let store = Arc::new(ExchangeStore::new(config.lock_wait()));
        let ledger = Arc::new(Ledger::new(store.clone(), config.overdraft_floor));
        let escrow = EscrowEngine::new(store.clone(), ledger.clone());
        let admission = AdmissionController::new(store.clone(), config.pending_queue_cap);

        Self {
            config,
            store,
            ledger,
            escrow,
            admission,
            notifier,
        }
    }

    // ---- registration ----

    /// Register a member account with an opening balance
    pub async fn register_account(
        &self,
        display_name: &str,
        opening_balance: Decimal,
    ) -> ExchangeResult<Account> {
        if display_name.trim().is_empty() {
            return Err(ExchangeError::validation("display name cannot be empty"));
        }
        if opening_balance.round_dp(2) != opening_balance {
            return Err(ExchangeError::validation(
                "opening balance must have at most two decimal places",
            ));
        }
        if opening_balance < self.config.overdraft_floor {
            return Err(ExchangeError::validation(
                "opening balance cannot start below the overdraft floor",
            ));
        }

        let account = Account::new(display_name.to_string(), opening_balance);
        self.store.insert_account(account.clone()).await;
        info!("registered account {} ({})", account.id, display_name);
        Ok(account)
    }

    /// Register a service listing owned by an existing member
    pub async fn register_service(
        &self,
        owner_id: Uuid,
        kind: ServiceKind,
        title: &str,
        description: Option<String>,
        duration_hours: Decimal,
        max_participants: u32,
    ) -> ExchangeResult<Service> {
        self.store.snapshot_account(owner_id).await?;
        if title.trim().is_empty() {
            return Err(ExchangeError::validation("title cannot be empty"));
        }
        if duration_hours <= Decimal::ZERO || duration_hours.round_dp(2) != duration_hours {
            return Err(ExchangeError::invalid_hours(format!(
                "{duration_hours} is not a positive two-decimal hour amount"
            )));
        }
        if max_participants == 0 {
            return Err(ExchangeError::validation(
                "a service needs room for at least one participant",
            ));
        }

        let service = Service::new(
            owner_id,
            kind,
            title.to_string(),
            description,
            duration_hours,
            max_participants,
        );
        self.store.insert_service(service.clone()).await;
        info!("registered service {} (\"{}\")", service.id, title);
        Ok(service)
    }

    /// Change a service's lifecycle state; only the owner may do this
    pub async fn set_service_status(
        &self,
        service_id: Uuid,
        actor: Uuid,
        status: ServiceStatus,
    ) -> ExchangeResult<Service> {
        let mut service = self.store.lock_service(service_id).await?;
        if service.owner_id != actor {
            return Err(ExchangeError::validation(
                "only the owner may change a service's status",
            ));
        }
        service.status = status;
        service.updated_at = Utc::now();
        Ok(service.clone())
    }

    // ---- admission ----

    /// Check whether a member could express interest, without persisting
    pub async fn can_express_interest(
        &self,
        service_id: Uuid,
        user_id: Uuid,
    ) -> ExchangeResult<AdmissionDecision> {
        self.retry_transient(|| self.admission.can_express_interest(service_id, user_id))
            .await
    }

    /// Express interest in a service, creating a pending handshake
    pub async fn express_interest(
        &self,
        service_id: Uuid,
        user_id: Uuid,
    ) -> ExchangeResult<Handshake> {
        let service = self.store.snapshot_service(service_id).await?;
        let handshake = self
            .retry_transient(|| self.admission.express_interest(service_id, user_id))
            .await?;

        self.dispatch(NotificationRequest {
            recipient: service.owner_id,
            kind: NotificationKind::InterestReceived,
            title: format!("New interest in \"{}\"", service.title),
            body: "A member would like to arrange an exchange.".to_string(),
            handshake_id: Some(handshake.id),
            service_id: Some(service_id),
            metadata: None,
        })
        .await;

        Ok(handshake)
    }

    // ---- handshake lifecycle ----

    /// Supply or amend the agreement details; provider only, while pending
    pub async fn set_agreement(
        &self,
        handshake_id: Uuid,
        actor: Uuid,
        agreement: Agreement,
    ) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.set_agreement_once(handshake_id, actor, agreement.clone()))
            .await
    }

    /// Approve a pending handshake; receiver only. Escrows the hours.
    pub async fn approve(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.approve_once(handshake_id, actor))
            .await
    }

    /// Confirm completion, optionally re-negotiating the hour amount.
    ///
    /// The final transfer fires the instant the second party confirms.
    pub async fn confirm_completion(
        &self,
        handshake_id: Uuid,
        actor: Uuid,
        hours: Option<Decimal>,
    ) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.confirm_once(handshake_id, actor, hours))
            .await
    }

    /// Call off a pending or accepted handshake; either party
    pub async fn cancel(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.cancel_once(handshake_id, actor))
            .await
    }

    /// Decline a pending request; service owner only
    pub async fn deny(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.deny_once(handshake_id, actor))
            .await
    }

    /// File a dispute on an accepted or completed handshake; either party
    pub async fn report(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.report_once(handshake_id, actor))
            .await
    }

    /// Park a reported handshake; moderation collaborator
    pub async fn pause(&self, handshake_id: Uuid) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.pause_once(handshake_id)).await
    }

    /// Resolve a reported handshake; moderation collaborator
    pub async fn resolve_report(
        &self,
        handshake_id: Uuid,
        resolution: ReportResolution,
    ) -> ExchangeResult<Handshake> {
        self.retry_transient(|| self.resolve_report_once(handshake_id, resolution))
            .await
    }

    // ---- queries ----

    /// Committed copy of one account
    pub async fn get_account(&self, account_id: Uuid) -> ExchangeResult<Account> {
        self.store.snapshot_account(account_id).await
    }

    /// Committed copy of one service
    pub async fn get_service(&self, service_id: Uuid) -> ExchangeResult<Service> {
        self.store.snapshot_service(service_id).await
    }

    /// Committed copy of one handshake
    pub async fn get_handshake(&self, handshake_id: Uuid) -> ExchangeResult<Handshake> {
        self.store.snapshot_handshake(handshake_id).await
    }

    /// Every handshake a member is a party to, oldest first
    pub async fn handshakes_for_user(&self, user_id: Uuid) -> ExchangeResult<Vec<Handshake>> {
        let owned: HashSet<Uuid> = self
            .store
            .services_owned_by(user_id)
            .await?
            .into_iter()
            .collect();
        let mut handshakes: Vec<Handshake> = self
            .store
            .all_handshakes()
            .await?
            .into_iter()
            .filter(|h| h.requester_id == user_id || owned.contains(&h.service_id))
            .collect();
        handshakes.sort_by_key(|h| h.created_at);
        Ok(handshakes)
    }

    /// Full balance history for one account, in append order
    pub async fn ledger_for_account(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        self.store.entries_for_account(account_id).await
    }

    /// Every balance-affecting event attached to one handshake
    pub async fn ledger_for_handshake(&self, handshake_id: Uuid) -> Vec<LedgerEntry> {
        self.store.entries_for_handshake(handshake_id).await
    }

    /// Conversation attached to one handshake
    pub async fn messages_for_handshake(&self, handshake_id: Uuid) -> Vec<Message> {
        self.store.messages_for_handshake(handshake_id).await
    }

    /// Reconstruct one account's balance from its ledger and verify it
    pub async fn audit_account(&self, account_id: Uuid) -> ExchangeResult<Decimal> {
        self.ledger.audit_account(account_id).await
    }

    /// Verify the balance/ledger invariant for every account
    pub async fn audit_all(&self) -> ExchangeResult<()> {
        for account_id in self.store.account_ids().await {
            self.ledger.audit_account(account_id).await?;
        }
        Ok(())
    }

    // ---- transition bodies ----

    /// Service snapshot for a handshake, read before any handshake lock so
    /// the service-before-handshake lock order holds everywhere
    async fn service_for(&self, handshake_id: Uuid) -> ExchangeResult<Service> {
        let handshake = self.store.snapshot_handshake(handshake_id).await?;
        self.store.snapshot_service(handshake.service_id).await
    }

    async fn set_agreement_once(
        &self,
        handshake_id: Uuid,
        actor: Uuid,
        agreement: Agreement,
    ) -> ExchangeResult<Handshake> {
        if agreement.duration_hours <= Decimal::ZERO
            || agreement.duration_hours.round_dp(2) != agreement.duration_hours
        {
            return Err(ExchangeError::invalid_hours(format!(
                "{} is not a positive two-decimal hour amount",
                agreement.duration_hours
            )));
        }

        let service = self.service_for(handshake_id).await?;
        let mut handshake = self.store.lock_handshake(handshake_id).await?;
        let roles = TransactionRoles::for_handshake(&service, &handshake);
        if !roles.is_party(actor) {
            return Err(ExchangeError::NotParticipant {
                user: actor,
                handshake: handshake_id,
            });
        }
        if handshake.status != HandshakeStatus::Pending {
            return Err(ExchangeError::state_transition(
                format!("{:?}", handshake.status),
                "Pending".to_string(),
                "agreement details can only change before approval".to_string(),
            ));
        }
        if actor != roles.provider {
            return Err(ExchangeError::state_transition(
                "Pending".to_string(),
                "Pending".to_string(),
                "only the providing party supplies agreement details".to_string(),
            ));
        }

        handshake.agreement = Some(agreement);
        handshake.updated_at = Utc::now();
        Ok(handshake.clone())
    }

    async fn approve_once(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        let service = self.service_for(handshake_id).await?;
        let mut handshake = self.store.lock_handshake(handshake_id).await?;
        let roles = TransactionRoles::for_handshake(&service, &handshake);

        if !roles.is_party(actor) {
            return Err(ExchangeError::NotParticipant {
                user: actor,
                handshake: handshake_id,
            });
        }
        handshake.validate_transition(HandshakeStatus::Accepted)?;
        if actor != roles.receiver {
            return Err(ExchangeError::state_transition(
                "Pending".to_string(),
                "Accepted".to_string(),
                "only the receiving party may approve".to_string(),
            ));
        }
        if handshake.agreement.is_none() {
            return Err(ExchangeError::state_transition(
                "Pending".to_string(),
                "Accepted".to_string(),
                "agreement details must be supplied before approval".to_string(),
            ));
        }

        // the balance may have moved since admission; if provisioning fails
        // the handshake stays pending and nothing changed
        self.escrow.provision(&handshake, &service).await?;
        handshake.status = HandshakeStatus::Accepted;
        handshake.updated_at = Utc::now();
        let snapshot = handshake.clone();
        drop(handshake);

        self.dispatch(NotificationRequest {
            recipient: roles.provider,
            kind: NotificationKind::RequestApproved,
            title: format!("\"{}\" is on", service.title),
            body: format!(
                "The agreement was approved and {} hours are escrowed.",
                snapshot.provisioned_hours
            ),
            handshake_id: Some(handshake_id),
            service_id: Some(service.id),
            metadata: None,
        })
        .await;

        Ok(snapshot)
    }

    async fn confirm_once(
        &self,
        handshake_id: Uuid,
        actor: Uuid,
        hours: Option<Decimal>,
    ) -> ExchangeResult<Handshake> {
        let service = self.service_for(handshake_id).await?;
        let mut handshake = self.store.lock_handshake(handshake_id).await?;
        let roles = TransactionRoles::for_handshake(&service, &handshake);

        if !roles.is_party(actor) {
            return Err(ExchangeError::NotParticipant {
                user: actor,
                handshake: handshake_id,
            });
        }
        // a late confirmation of something already settled is a no-op,
        // never a second settlement
        if handshake.status == HandshakeStatus::Completed {
            return Ok(handshake.clone());
        }
        if handshake.status != HandshakeStatus::Accepted {
            return Err(ExchangeError::state_transition(
                format!("{:?}", handshake.status),
                "Completed".to_string(),
                "only accepted handshakes take completion confirmations".to_string(),
            ));
        }

        let mut adjusted = false;
        if let Some(new_hours) = hours {
            if new_hours != handshake.provisioned_hours {
                self.escrow.adjust(&mut handshake, &service, new_hours).await?;
                adjusted = true;
            }
        }

        if actor == roles.provider {
            handshake.provider_confirmed = true;
        } else {
            handshake.receiver_confirmed = true;
        }
        handshake.updated_at = Utc::now();

        let both_confirmed = handshake.provider_confirmed && handshake.receiver_confirmed;
        if both_confirmed {
            self.escrow.settle(&mut handshake, &service).await?;
        }

        let snapshot = handshake.clone();
        drop(handshake);

        let other = if actor == roles.provider {
            roles.receiver
        } else {
            roles.provider
        };
        if both_confirmed {
            self.dispatch(NotificationRequest {
                recipient: other,
                kind: NotificationKind::HandshakeCompleted,
                title: format!("\"{}\" is settled", service.title),
                body: format!(
                    "Both sides confirmed; {} hours were transferred.",
                    snapshot.provisioned_hours
                ),
                handshake_id: Some(handshake_id),
                service_id: Some(service.id),
                metadata: Some(serde_json::json!({
                    "hours": snapshot.provisioned_hours
                })),
            })
            .await;
        } else if adjusted {
            self.dispatch(NotificationRequest {
                recipient: other,
                kind: NotificationKind::HoursAdjusted,
                title: format!("Hours updated for \"{}\"", service.title),
                body: format!(
                    "The escrowed amount is now {} hours.",
                    snapshot.provisioned_hours
                ),
                handshake_id: Some(handshake_id),
                service_id: Some(service.id),
                metadata: Some(serde_json::json!({
                    "hours": snapshot.provisioned_hours
                })),
            })
            .await;
        }

        Ok(snapshot)
    }

    async fn cancel_once(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        let service = self.service_for(handshake_id).await?;
        let mut handshake = self.store.lock_handshake(handshake_id).await?;
        let roles = TransactionRoles::for_handshake(&service, &handshake);

        if !roles.is_party(actor) {
            return Err(ExchangeError::NotParticipant {
                user: actor,
                handshake: handshake_id,
            });
        }

        match handshake.status {
            // nothing was provisioned; no balance moves
            HandshakeStatus::Pending => {
                handshake.status = HandshakeStatus::Cancelled;
                handshake.updated_at = Utc::now();
            }
            HandshakeStatus::Accepted => {
                self.escrow.refund(&mut handshake, &service).await?;
            }
            other => {
                return Err(ExchangeError::state_transition(
                    format!("{other:?}"),
                    "Cancelled".to_string(),
                    "only pending or accepted handshakes can be cancelled".to_string(),
                ));
            }
        }

        let snapshot = handshake.clone();
        drop(handshake);

        let other_party = if actor == roles.provider {
            roles.receiver
        } else {
            roles.provider
        };
        self.dispatch(NotificationRequest {
            recipient: other_party,
            kind: NotificationKind::HandshakeCancelled,
            title: format!("\"{}\" was called off", service.title),
            body: "The handshake was cancelled; any escrowed hours were returned.".to_string(),
            handshake_id: Some(handshake_id),
            service_id: Some(service.id),
            metadata: None,
        })
        .await;

        Ok(snapshot)
    }

    async fn deny_once(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        let service = self.service_for(handshake_id).await?;
        let mut handshake = self.store.lock_handshake(handshake_id).await?;
        let roles = TransactionRoles::for_handshake(&service, &handshake);

        if !roles.is_party(actor) {
            return Err(ExchangeError::NotParticipant {
                user: actor,
                handshake: handshake_id,
            });
        }
        handshake.validate_transition(HandshakeStatus::Denied)?;
        if actor != service.owner_id {
            return Err(ExchangeError::state_transition(
                "Pending".to_string(),
                "Denied".to_string(),
                "only the service owner may deny a request".to_string(),
            ));
        }

        // nothing was provisioned; no escrow side effect
        handshake.status = HandshakeStatus::Denied;
        handshake.updated_at = Utc::now();
        let snapshot = handshake.clone();
        drop(handshake);

        self.dispatch(NotificationRequest {
            recipient: snapshot.requester_id,
            kind: NotificationKind::RequestDenied,
            title: format!("\"{}\" request declined", service.title),
            body: "The owner declined this request.".to_string(),
            handshake_id: Some(handshake_id),
            service_id: Some(service.id),
            metadata: None,
        })
        .await;

        Ok(snapshot)
    }

    async fn report_once(&self, handshake_id: Uuid, actor: Uuid) -> ExchangeResult<Handshake> {
        let service = self.service_for(handshake_id).await?;
        let mut handshake = self.store.lock_handshake(handshake_id).await?;
        let roles = TransactionRoles::for_handshake(&service, &handshake);

        if !roles.is_party(actor) {
            return Err(ExchangeError::NotParticipant {
                user: actor,
                handshake: handshake_id,
            });
        }
        handshake.validate_transition(HandshakeStatus::Reported)?;

        handshake.status = HandshakeStatus::Reported;
        handshake.updated_at = Utc::now();
        let snapshot = handshake.clone();
        drop(handshake);

        warn!(
            "handshake {} reported by {}; escrow frozen pending moderation",
            handshake_id, actor
        );
        let other_party = if actor == roles.provider {
            roles.receiver
        } else {
            roles.provider
        };
        self.dispatch(NotificationRequest {
            recipient: other_party,
            kind: NotificationKind::HandshakeReported,
            title: format!("\"{}\" was reported", service.title),
            body: "The other party filed a report; moderation will follow up.".to_string(),
            handshake_id: Some(handshake_id),
            service_id: Some(service.id),
            metadata: None,
        })
        .await;

        Ok(snapshot)
    }

    async fn pause_once(&self, handshake_id: Uuid) -> ExchangeResult<Handshake> {
        let mut handshake = self.store.lock_handshake(handshake_id).await?;
        handshake.validate_transition(HandshakeStatus::Paused)?;
        handshake.status = HandshakeStatus::Paused;
        handshake.updated_at = Utc::now();
        Ok(handshake.clone())
    }

    async fn resolve_report_once(
        &self,
        handshake_id: Uuid,
        resolution: ReportResolution,
    ) -> ExchangeResult<Handshake> {
        let service = self.service_for(handshake_id).await?;
        let mut handshake = self.store.lock_handshake(handshake_id).await?;

        if handshake.status != HandshakeStatus::Reported {
            return Err(ExchangeError::state_transition(
                format!("{:?}", handshake.status),
                "Resolved".to_string(),
                "only reported handshakes can be resolved".to_string(),
            ));
        }

        match resolution {
            ReportResolution::Refund => {
                if handshake.settled_at.is_some() {
                    return Err(ExchangeError::state_transition(
                        "Reported".to_string(),
                        "Cancelled".to_string(),
                        "settled transfers are not clawed back automatically".to_string(),
                    ));
                }
                self.escrow.refund(&mut handshake, &service).await?;
            }
            ReportResolution::Dismiss => {
                if handshake.settled_at.is_some() {
                    // the transfer already happened; just restore the status
                    handshake.status = HandshakeStatus::Completed;
                    handshake.updated_at = Utc::now();
                } else {
                    self.escrow.settle(&mut handshake, &service).await?;
                }
            }
        }

        info!(
            "report on handshake {} resolved as {:?}",
            handshake_id, resolution
        );
        Ok(handshake.clone())
    }

    // ---- plumbing ----

    /// Run an operation, retrying once after a transient lock timeout.
    ///
    /// Safe because every operation re-validates all business rules under
    /// its locks; a retry cannot duplicate an effect.
    async fn retry_transient<T, Fut, F>(&self, mut op: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        match op().await {
            Err(err) if self.config.retry_transient && err.is_retryable() => {
                warn!("transient store failure, retrying once: {}", err);
                op().await
            }
            result => result,
        }
    }

    /// Hand a request to the notification sink; failures never propagate
    async fn dispatch(&self, request: NotificationRequest) {
        if let Err(err) = self.notifier.notify(request).await {
            warn!("notification sink failure ignored: {}", err);
        }
    }
}
