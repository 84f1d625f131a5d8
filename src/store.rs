//! Row store with exclusive row locks
//!
//! In-memory stand-in for the transactional relational store: every account,
//! service, and handshake row sits behind its own async mutex, the moral
//! equivalent of `SELECT ... FOR UPDATE`. All reads that feed a mutation
//! happen through the lock guard; nothing is cached from before the lock.
//!
//! Lock hierarchy, observed by every caller:
//!   service row -> handshake rows -> account rows.
//! Within a rank, account pairs are always acquired in ascending id order,
//! never request-arrival order, which gives a total lock order and makes
//! circular waits impossible. A lock wait is bounded; expiry surfaces as
//! `LockTimeout`, the one retryable error in the crate.

use crate::{
    error::ExchangeError,
    models::{Account, Handshake, LedgerEntry, Message, Service},
    ExchangeResult,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

/// Exclusive guard over an account row
pub type AccountGuard = OwnedMutexGuard<Account>;
/// Exclusive guard over a service row
pub type ServiceGuard = OwnedMutexGuard<Service>;
/// Exclusive guard over a handshake row
pub type HandshakeGuard = OwnedMutexGuard<Handshake>;

/// The backing store for all exchange state
pub struct ExchangeStore {
    /// Upper bound on any single lock wait
    lock_wait: Duration,
    accounts: RwLock<HashMap<Uuid, Arc<Mutex<Account>>>>,
    services: RwLock<HashMap<Uuid, Arc<Mutex<Service>>>>,
    handshakes: RwLock<HashMap<Uuid, Arc<Mutex<Handshake>>>>,
    /// Handshake ids per service, maintained on insert
    handshakes_by_service: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    /// Append-only; rows are never updated or deleted
    ledger: RwLock<Vec<LedgerEntry>>,
    messages: RwLock<Vec<Message>>,
}

impl ExchangeStore {
    /// Create an empty store with the given lock-wait bound
    pub fn new(lock_wait: Duration) -> Self {
        Self {
            lock_wait,
            accounts: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            handshakes: RwLock::new(HashMap::new()),
            handshakes_by_service: RwLock::new(HashMap::new()),
            ledger: RwLock::new(Vec::new()),
            messages: RwLock::new(Vec::new()),
        }
    }

    async fn acquire<T>(
        &self,
        row: Arc<Mutex<T>>,
        what: &'static str,
    ) -> ExchangeResult<OwnedMutexGuard<T>> {
        timeout(self.lock_wait, row.lock_owned())
            .await
            .map_err(|_| ExchangeError::lock_timeout(what))
    }

    // ---- accounts ----

    /// Insert a new account row
    pub async fn insert_account(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.id, Arc::new(Mutex::new(account)));
    }

    async fn account_row(&self, id: Uuid) -> ExchangeResult<Arc<Mutex<Account>>> {
        self.accounts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ExchangeError::not_found("account", id))
    }

    /// Take the exclusive lock on one account row
    pub async fn lock_account(&self, id: Uuid) -> ExchangeResult<AccountGuard> {
        let row = self.account_row(id).await?;
        self.acquire(row, "account row").await
    }

    /// Take the exclusive locks on two account rows.
    ///
    /// The locks are acquired in ascending id order regardless of argument
    /// order; the guards come back matching the argument order.
    pub async fn lock_account_pair(
        &self,
        first: Uuid,
        second: Uuid,
    ) -> ExchangeResult<(AccountGuard, AccountGuard)> {
        if first == second {
            return Err(ExchangeError::invariant(
                "attempted to pair-lock one account against itself",
            ));
        }

        let (lo, hi) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        let lo_guard = self.lock_account(lo).await?;
        let hi_guard = self.lock_account(hi).await?;

        if first < second {
            Ok((lo_guard, hi_guard))
        } else {
            Ok((hi_guard, lo_guard))
        }
    }

    /// Read a consistent copy of one account row
    pub async fn snapshot_account(&self, id: Uuid) -> ExchangeResult<Account> {
        Ok(self.lock_account(id).await?.clone())
    }

    /// Ids of every account, for audit sweeps
    pub async fn account_ids(&self) -> Vec<Uuid> {
        self.accounts.read().await.keys().copied().collect()
    }

    // ---- services ----

    /// Insert a new service row
    pub async fn insert_service(&self, service: Service) {
        self.services
            .write()
            .await
            .insert(service.id, Arc::new(Mutex::new(service)));
    }

    async fn service_row(&self, id: Uuid) -> ExchangeResult<Arc<Mutex<Service>>> {
        self.services
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ExchangeError::not_found("service", id))
    }

    /// Take the exclusive lock on one service row
    pub async fn lock_service(&self, id: Uuid) -> ExchangeResult<ServiceGuard> {
        let row = self.service_row(id).await?;
        self.acquire(row, "service row").await
    }

    /// Read a consistent copy of one service row
    pub async fn snapshot_service(&self, id: Uuid) -> ExchangeResult<Service> {
        Ok(self.lock_service(id).await?.clone())
    }

    /// Ids of every service owned by a member
    pub async fn services_owned_by(&self, owner_id: Uuid) -> ExchangeResult<Vec<Uuid>> {
        let rows: Vec<Arc<Mutex<Service>>> =
            self.services.read().await.values().cloned().collect();
        let mut owned = Vec::new();
        for row in rows {
            let service = self.acquire(row, "service row").await?;
            if service.owner_id == owner_id {
                owned.push(service.id);
            }
        }
        Ok(owned)
    }

    // ---- handshakes ----

    /// Insert a new handshake row
    pub async fn insert_handshake(&self, handshake: Handshake) {
        self.handshakes_by_service
            .write()
            .await
            .entry(handshake.service_id)
            .or_default()
            .push(handshake.id);
        self.handshakes
            .write()
            .await
            .insert(handshake.id, Arc::new(Mutex::new(handshake)));
    }

    async fn handshake_row(&self, id: Uuid) -> ExchangeResult<Arc<Mutex<Handshake>>> {
        self.handshakes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ExchangeError::not_found("handshake", id))
    }

    /// Take the exclusive lock on one handshake row
    pub async fn lock_handshake(&self, id: Uuid) -> ExchangeResult<HandshakeGuard> {
        let row = self.handshake_row(id).await?;
        self.acquire(row, "handshake row").await
    }

    /// Read a consistent copy of one handshake row
    pub async fn snapshot_handshake(&self, id: Uuid) -> ExchangeResult<Handshake> {
        Ok(self.lock_handshake(id).await?.clone())
    }

    /// Committed copies of every handshake attached to a service.
    ///
    /// Each row is locked briefly and released before the next; callers that
    /// need the counts to stay stable against concurrent admissions must hold
    /// the service row lock while calling this.
    pub async fn handshakes_for_service(&self, service_id: Uuid) -> ExchangeResult<Vec<Handshake>> {
        let ids: Vec<Uuid> = self
            .handshakes_by_service
            .read()
            .await
            .get(&service_id)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.snapshot_handshake(id).await?);
        }
        Ok(out)
    }

    /// Committed copies of every handshake in the store
    pub async fn all_handshakes(&self) -> ExchangeResult<Vec<Handshake>> {
        let ids: Vec<Uuid> = self.handshakes.read().await.keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.snapshot_handshake(id).await?);
        }
        Ok(out)
    }

    // ---- ledger ----

    /// Append one immutable ledger entry.
    ///
    /// The caller must hold the lock on the entry's account row; that lock is
    /// what serializes entries per account.
    pub async fn append_entry(&self, entry: LedgerEntry) {
        self.ledger.write().await.push(entry);
    }

    /// All entries for one account, in append order
    pub async fn entries_for_account(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    /// All entries attached to one handshake, in append order
    pub async fn entries_for_handshake(&self, handshake_id: Uuid) -> Vec<LedgerEntry> {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|e| e.handshake_id == Some(handshake_id))
            .cloned()
            .collect()
    }

    // ---- messages ----

    /// Append one conversation message
    pub async fn append_message(&self, message: Message) {
        self.messages.write().await.push(message);
    }

    /// All messages attached to one handshake, in append order
    pub async fn messages_for_handshake(&self, handshake_id: Uuid) -> Vec<Message> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.handshake_id == handshake_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn account(name: &str) -> Account {
        Account::new(name.to_string(), Decimal::new(500, 2))
    }

    #[tokio::test]
    async fn lock_wait_expiry_surfaces_as_retryable_timeout() {
        let store = ExchangeStore::new(Duration::from_millis(50));
        let alice = account("alice");
        let id = alice.id;
        store.insert_account(alice).await;

        let _held = store.lock_account(id).await.unwrap();
        let err = store.lock_account(id).await.unwrap_err();
        assert!(matches!(err, ExchangeError::LockTimeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn pair_lock_returns_guards_in_argument_order() {
        let store = ExchangeStore::new(Duration::from_millis(50));
        let a = account("a");
        let b = account("b");
        let (a_id, b_id) = (a.id, b.id);
        store.insert_account(a).await;
        store.insert_account(b).await;

        let (first, second) = store.lock_account_pair(b_id, a_id).await.unwrap();
        assert_eq!(first.id, b_id);
        assert_eq!(second.id, a_id);
    }

    #[tokio::test]
    async fn pair_lock_rejects_a_single_account() {
        let store = ExchangeStore::new(Duration::from_millis(50));
        let a = account("a");
        let id = a.id;
        store.insert_account(a).await;

        let err = store.lock_account_pair(id, id).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let store = ExchangeStore::new(Duration::from_millis(50));
        let id = Uuid::new_v4();
        assert!(matches!(
            store.lock_account(id).await.unwrap_err(),
            ExchangeError::NotFound { kind: "account", .. }
        ));
        assert!(matches!(
            store.snapshot_service(id).await.unwrap_err(),
            ExchangeError::NotFound { kind: "service", .. }
        ));
    }

    #[tokio::test]
    async fn opposite_order_pair_locks_do_not_deadlock() {
        let store = Arc::new(ExchangeStore::new(Duration::from_secs(2)));
        let a = account("a");
        let b = account("b");
        let (a_id, b_id) = (a.id, b.id);
        store.insert_account(a).await;
        store.insert_account(b).await;

        let s1 = store.clone();
        let s2 = store.clone();
        let t1 = tokio::spawn(async move {
            for _ in 0..100 {
                let _guards = s1.lock_account_pair(a_id, b_id).await.unwrap();
            }
        });
        let t2 = tokio::spawn(async move {
            for _ in 0..100 {
                let _guards = s2.lock_account_pair(b_id, a_id).await.unwrap();
            }
        });

        timeout(Duration::from_secs(5), async {
            t1.await.unwrap();
            t2.await.unwrap();
        })
        .await
        .expect("pair locks must not deadlock");
    }
}
