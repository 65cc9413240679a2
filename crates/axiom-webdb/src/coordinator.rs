//! Transaction coordinator
//!
//! Serializes transactions that target the same database file, no matter how
//! many handles (or script contexts) opened it. Each identity has at most one
//! holder and a FIFO queue of waiters. A transaction only ever waits for one
//! identity, so there is no lock ordering to get wrong here.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::origin::SecurityOrigin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Resolved (origin, name) key shared by every handle on one database file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinatorIdentity(String);

impl CoordinatorIdentity {
    pub fn new(origin: &SecurityOrigin, name: &str) -> Self {
        Self(format!("{}/{}", origin.database_identifier(), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CoordinatorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub identity: CoordinatorIdentity,
    pub transaction: TransactionId,
    pub connection: ConnectionId,
    pub read_only: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The request was withdrawn: its connection was interrupted or closed
    #[error("Lock request cancelled")]
    Cancelled,

    #[error("Transaction coordinator shut down")]
    ShutDown,
}

#[derive(Default)]
struct LockQueue {
    holder: Option<LockRequest>,
    waiting: VecDeque<LockRequest>,
}

impl LockQueue {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiting.is_empty()
    }

    fn position(&self, transaction: TransactionId) -> Option<usize> {
        self.waiting.iter().position(|r| r.transaction == transaction)
    }
}

#[derive(Default)]
struct LockTable {
    queues: HashMap<CoordinatorIdentity, LockQueue>,
    shut_down: bool,
}

impl LockTable {
    fn withdraw(&mut self, identity: &CoordinatorIdentity, transaction: TransactionId) {
        if let Some(queue) = self.queues.get_mut(identity) {
            if let Some(index) = queue.position(transaction) {
                queue.waiting.remove(index);
            }
            if queue.is_idle() {
                self.queues.remove(identity);
            }
        }
    }
}

pub struct SqlTransactionCoordinator {
    table: Mutex<LockTable>,
    changed: Condvar,
    grants: AtomicU64,
}

impl SqlTransactionCoordinator {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            changed: Condvar::new(),
            grants: AtomicU64::new(0),
        }
    }

    /// Queue `request` and block until it is at the head of its identity's
    /// queue with no holder.
    ///
    /// `should_abort` is polled under the table lock before queuing and on
    /// every wake-up; anything that flips it must call `cancel_connection`
    /// (or `shutdown`) afterwards so sleeping waiters get woken.
    pub fn acquire(
        self: &Arc<Self>,
        request: LockRequest,
        should_abort: &dyn Fn() -> bool,
    ) -> Result<CoordinatorLock, LockError> {
        let identity = request.identity.clone();
        let transaction = request.transaction;

        let mut table = self.table.lock();
        if table.shut_down {
            return Err(LockError::ShutDown);
        }
        if should_abort() {
            return Err(LockError::Cancelled);
        }

        tracing::trace!(
            identity = %identity,
            transaction = %transaction,
            read_only = request.read_only,
            "Queued for database lock"
        );
        table
            .queues
            .entry(identity.clone())
            .or_default()
            .waiting
            .push_back(request);

        loop {
            if table.shut_down {
                table.withdraw(&identity, transaction);
                return Err(LockError::ShutDown);
            }

            if should_abort() {
                table.withdraw(&identity, transaction);
                self.changed.notify_all();
                return Err(LockError::Cancelled);
            }

            let Some(queue) = table.queues.get_mut(&identity) else {
                return Err(LockError::Cancelled);
            };
            let Some(position) = queue.position(transaction) else {
                // Removed by cancel_connection
                return Err(LockError::Cancelled);
            };

            if position == 0 && queue.holder.is_none() {
                queue.holder = queue.waiting.pop_front();
                let grant = self.grants.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(
                    identity = %identity,
                    transaction = %transaction,
                    grant,
                    "Granted database lock"
                );
                return Ok(CoordinatorLock {
                    coordinator: Arc::clone(self),
                    identity,
                    transaction,
                });
            }

            self.changed.wait(&mut table);
        }
    }

    fn release(&self, identity: &CoordinatorIdentity, transaction: TransactionId) {
        let mut table = self.table.lock();
        if let Some(queue) = table.queues.get_mut(identity) {
            if queue.holder.as_ref().map(|h| h.transaction) == Some(transaction) {
                queue.holder = None;
            }
            if queue.is_idle() {
                table.queues.remove(identity);
            }
        }
        tracing::trace!(identity = %identity, transaction = %transaction, "Released database lock");
        self.changed.notify_all();
    }

    /// Withdraw every queued request of `connection`, from every identity.
    /// A lock it already holds is unaffected. Returns the number removed.
    pub fn cancel_connection(&self, connection: ConnectionId) -> usize {
        let mut table = self.table.lock();
        let mut removed = 0;
        for queue in table.queues.values_mut() {
            let before = queue.waiting.len();
            queue.waiting.retain(|r| r.connection != connection);
            removed += before - queue.waiting.len();
        }
        table.queues.retain(|_, queue| !queue.is_idle());
        drop(table);

        if removed > 0 {
            tracing::debug!(connection = %connection, removed, "Cancelled queued transactions");
        }
        self.changed.notify_all();
        removed
    }

    /// Fail every waiter and refuse new requests
    pub fn shutdown(&self) {
        let mut table = self.table.lock();
        table.shut_down = true;
        for queue in table.queues.values_mut() {
            queue.waiting.clear();
        }
        table.queues.retain(|_, queue| !queue.is_idle());
        drop(table);

        tracing::info!("Transaction coordinator shut down");
        self.changed.notify_all();
    }

    pub fn holder_of(&self, identity: &CoordinatorIdentity) -> Option<TransactionId> {
        self.table
            .lock()
            .queues
            .get(identity)
            .and_then(|q| q.holder.as_ref().map(|h| h.transaction))
    }

    pub fn waiting_count(&self, identity: &CoordinatorIdentity) -> usize {
        self.table
            .lock()
            .queues
            .get(identity)
            .map(|q| q.waiting.len())
            .unwrap_or(0)
    }

    /// Total number of grants handed out since creation
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::SeqCst)
    }
}

impl Default for SqlTransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Held grant; dropping it lets the next waiter in
pub struct CoordinatorLock {
    coordinator: Arc<SqlTransactionCoordinator>,
    identity: CoordinatorIdentity,
    transaction: TransactionId,
}

impl CoordinatorLock {
    pub fn identity(&self) -> &CoordinatorIdentity {
        &self.identity
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }
}

impl Drop for CoordinatorLock {
    fn drop(&mut self) {
        self.coordinator.release(&self.identity, self.transaction);
    }
}

impl std::fmt::Debug for CoordinatorLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorLock")
            .field("identity", &self.identity)
            .field("transaction", &self.transaction)
            .finish()
    }
}
