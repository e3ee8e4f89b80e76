//! Transactions and the transaction manager.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::lock_manager::LockManager;
use crate::Rid;

pub type TxnId = u32;

/// Two-phase locking state machine. A transaction acquires locks while
/// `Growing`, moves to `Shrinking` on its first release (non-strict mode),
/// and ends `Committed` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// A transaction as seen by the lock manager: an id (lower is older), a
/// 2PL state, and the sets of record locks it holds.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn holds_shared(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    pub fn holds_exclusive(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    pub fn shared_lock_set(&self) -> Vec<Rid> {
        self.shared_lock_set.lock().iter().copied().collect()
    }

    pub fn exclusive_lock_set(&self) -> Vec<Rid> {
        self.exclusive_lock_set.lock().iter().copied().collect()
    }

    pub(crate) fn add_shared(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().remove(rid)
    }

    pub(crate) fn remove_exclusive(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().remove(rid)
    }
}

/// Vends transactions with monotonically increasing ids and drives commit
/// and abort, releasing held locks with the transaction already in its
/// terminal state.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            lock_manager,
        }
    }

    pub fn begin(&self) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        debug!("begin txn {}", id);
        Arc::new(Transaction::new(id))
    }

    pub fn commit(&self, txn: &Transaction) {
        txn.set_state(TransactionState::Committed);
        self.release_all(txn);
        debug!("commit txn {}", txn.id());
    }

    pub fn abort(&self, txn: &Transaction) {
        txn.set_state(TransactionState::Aborted);
        self.release_all(txn);
        debug!("abort txn {}", txn.id());
    }

    fn release_all(&self, txn: &Transaction) {
        for rid in txn.shared_lock_set() {
            self.lock_manager.unlock(txn, rid);
        }
        for rid in txn.exclusive_lock_set() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
