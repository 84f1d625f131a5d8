//! Payer and provider derivation
//!
//! Roles are never stored on a handshake; they are a pure function of the
//! service kind, the service owner, and the requester. Every component that
//! needs "who pays" or "who provides" calls this instead of re-deriving the
//! rule locally.

use crate::models::{Handshake, Service, ServiceKind};
use uuid::Uuid;

/// The three roles of one exchange.
///
/// The payer and the receiver are always the same party: whoever consumes the
/// service pays for it. The provider is the other party and is credited on
/// settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRoles {
    /// Account debited when hours are escrowed
    pub payer: Uuid,
    /// Consumer of the service; identical to the payer
    pub receiver: Uuid,
    /// Account credited on settlement
    pub provider: Uuid,
}

impl TransactionRoles {
    /// Derive the roles for one (service, requester) pairing.
    ///
    /// For an offer the requester consumes and pays; for a need the owner
    /// consumes and pays, while the requester renders the service.
    pub fn derive(kind: ServiceKind, owner: Uuid, requester: Uuid) -> Self {
        match kind {
            ServiceKind::Offer => Self {
                payer: requester,
                receiver: requester,
                provider: owner,
            },
            ServiceKind::Need => Self {
                payer: owner,
                receiver: owner,
                provider: requester,
            },
        }
    }

    /// Derive the roles for a persisted handshake
    pub fn for_handshake(service: &Service, handshake: &Handshake) -> Self {
        Self::derive(service.kind, service.owner_id, handshake.requester_id)
    }

    /// Check whether a user is one of the two parties
    pub fn is_party(&self, user: Uuid) -> bool {
        user == self.receiver || user == self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_requester_pays_owner_provides() {
        let owner = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let roles = TransactionRoles::derive(ServiceKind::Offer, owner, requester);

        assert_eq!(roles.payer, requester);
        assert_eq!(roles.receiver, requester);
        assert_eq!(roles.provider, owner);
    }

    #[test]
    fn need_owner_pays_requester_provides() {
        let owner = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let roles = TransactionRoles::derive(ServiceKind::Need, owner, requester);

        assert_eq!(roles.payer, owner);
        assert_eq!(roles.receiver, owner);
        assert_eq!(roles.provider, requester);
    }

    #[test]
    fn payer_and_receiver_always_coincide() {
        let owner = Uuid::new_v4();
        let requester = Uuid::new_v4();
        for kind in [ServiceKind::Offer, ServiceKind::Need] {
            let roles = TransactionRoles::derive(kind, owner, requester);
            assert_eq!(roles.payer, roles.receiver);
            assert_ne!(roles.payer, roles.provider);
            assert!(roles.is_party(owner));
            assert!(roles.is_party(requester));
            assert!(!roles.is_party(Uuid::new_v4()));
        }
    }
}
