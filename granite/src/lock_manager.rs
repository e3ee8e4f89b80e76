//! The tuple-level lock manager with Wait-Die deadlock avoidance.
//!
//! Shared/exclusive locks on record ids under two-phase locking. Conflicts
//! are resolved by transaction age: an older requester waits, a younger one
//! aborts ("older waits, younger dies"). Waiters block on one-shot
//! channels; the unlock path wakes the queue head and sweeps out waiters
//! the wake makes doomed.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Sender};

use log::debug;
use parking_lot::Mutex;

use crate::transaction::{Transaction, TransactionState, TxnId};
use crate::Rid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// One blocked request. The signal carries true for granted, false for
/// aborted, and is fired exactly once.
struct WaitItem {
    txn_id: TxnId,
    target: LockMode,
    signal: Sender<bool>,
}

/// Per-record lock state: the granted mode, who holds it, and a FIFO of
/// blocked requests. Created lazily by the first locker and destroyed by
/// the unlock that leaves it empty.
struct WaitList {
    mode: LockMode,
    granted: Vec<TxnId>,
    waiters: VecDeque<WaitItem>,
}

pub struct LockManager {
    strict_2pl: bool,
    lock_table: Mutex<HashMap<Rid, WaitList>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            lock_table: Mutex::new(HashMap::new()),
        }
    }

    /// 2PL admission check. A request from a shrinking transaction is a
    /// protocol violation and aborts it.
    fn valid_to_acquire(&self, txn: &Transaction) -> bool {
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => false,
            TransactionState::Shrinking => {
                txn.set_state(TransactionState::Aborted);
                false
            }
            TransactionState::Growing => true,
        }
    }

    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        if !self.valid_to_acquire(txn) {
            return false;
        }
        let mut table = self.lock_table.lock();
        if !table.contains_key(&rid) {
            table.insert(
                rid,
                WaitList {
                    mode: LockMode::Shared,
                    granted: vec![txn.id()],
                    waiters: VecDeque::new(),
                },
            );
            txn.add_shared(rid);
            return true;
        }
        let wait_list = table.get_mut(&rid).expect("checked above");

        if wait_list.mode == LockMode::Shared {
            // Re-request of a held shared lock is idempotent.
            if txn.holds_shared(&rid) {
                return true;
            }
            wait_list.granted.push(txn.id());
            txn.add_shared(rid);
            return true;
        }

        if let Some(&holder) = wait_list.granted.first() {
            if txn.id() > holder {
                // Wait-Die: the younger requester dies.
                txn.set_state(TransactionState::Aborted);
                debug!("txn {} aborted by wait-die against {}", txn.id(), holder);
                return false;
            }
            if txn.id() == holder {
                // The exclusive holder re-requesting shared succeeds
                // without recording a second grant.
                return true;
            }
        }
        let receiver = {
            let (sender, receiver) = channel();
            wait_list.waiters.push_back(WaitItem {
                txn_id: txn.id(),
                target: LockMode::Shared,
                signal: sender,
            });
            receiver
        };
        drop(table);

        let granted = receiver.recv().unwrap_or(false);
        // Reacquire the table latch before touching shared state.
        let mut table = self.lock_table.lock();
        if !granted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        table
            .get_mut(&rid)
            .expect("waitlist outlives its woken waiter")
            .granted
            .push(txn.id());
        txn.add_shared(rid);
        true
    }

    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        if !self.valid_to_acquire(txn) {
            return false;
        }
        let mut table = self.lock_table.lock();
        if !table.contains_key(&rid) {
            table.insert(
                rid,
                WaitList {
                    mode: LockMode::Exclusive,
                    granted: vec![txn.id()],
                    waiters: VecDeque::new(),
                },
            );
            txn.add_exclusive(rid);
            return true;
        }
        let wait_list = table.get_mut(&rid).expect("checked above");

        for &holder in wait_list.granted.iter() {
            if txn.id() > holder {
                txn.set_state(TransactionState::Aborted);
                debug!("txn {} aborted by wait-die against {}", txn.id(), holder);
                return false;
            }
            if wait_list.mode == LockMode::Exclusive && txn.id() == holder {
                debug_assert_eq!(wait_list.granted.len(), 1);
                return true;
            }
        }
        let receiver = {
            let (sender, receiver) = channel();
            wait_list.waiters.push_back(WaitItem {
                txn_id: txn.id(),
                target: LockMode::Exclusive,
                signal: sender,
            });
            receiver
        };
        drop(table);

        let granted = receiver.recv().unwrap_or(false);
        let mut table = self.lock_table.lock();
        if !granted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        table
            .get_mut(&rid)
            .expect("waitlist outlives its woken waiter")
            .granted
            .push(txn.id());
        txn.add_exclusive(rid);
        true
    }

    /// Upgrades a held shared lock to exclusive. Not atomic: the shared
    /// lock is released first, and a Wait-Die abort during the re-acquire
    /// leaves no lock held.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        if !self.valid_to_acquire(txn) {
            return false;
        }
        {
            let table = self.lock_table.lock();
            let Some(wait_list) = table.get(&rid) else {
                return false;
            };
            if !wait_list.granted.contains(&txn.id()) {
                return false;
            }
            if wait_list.mode == LockMode::Exclusive {
                debug_assert_eq!(wait_list.granted.len(), 1);
                return true;
            }
        }
        self.unlock_internal(txn, rid, true) && self.lock_exclusive(txn, rid)
    }

    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        self.unlock_internal(txn, rid, false)
    }

    /// `for_upgrade` skips the strict-2PL gate and the growing-to-shrinking
    /// transition: an upgrade's intermediate release is not a 2PL release.
    fn unlock_internal(&self, txn: &Transaction, rid: Rid, for_upgrade: bool) -> bool {
        if self.strict_2pl && !for_upgrade {
            let state = txn.state();
            if state != TransactionState::Committed && state != TransactionState::Aborted {
                return false;
            }
        }
        let mut table = self.lock_table.lock();
        let Some(wait_list) = table.get_mut(&rid) else {
            debug_assert!(false, "unlock of an unlocked record");
            return false;
        };
        let Some(position) = wait_list.granted.iter().position(|&id| id == txn.id()) else {
            debug_assert!(false, "unlock by a non-holder");
            return false;
        };
        wait_list.granted.remove(position);
        match wait_list.mode {
            LockMode::Exclusive => {
                txn.remove_exclusive(&rid);
            }
            LockMode::Shared => {
                txn.remove_shared(&rid);
            }
        }
        if !self.strict_2pl && !for_upgrade && txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        if !wait_list.granted.is_empty() {
            debug_assert_eq!(wait_list.mode, LockMode::Shared);
            return true;
        }
        if wait_list.waiters.is_empty() {
            table.remove(&rid);
            return true;
        }

        // Wake the head of the FIFO, then abort every remaining waiter
        // younger than it; older waiters keep waiting, per Wait-Die.
        let head = wait_list.waiters.pop_front().expect("waiters is non-empty");
        let woken_id = head.txn_id;
        wait_list.mode = head.target;
        head.signal.send(true).ok();
        debug!("lock on {:?} handed to txn {}", rid, woken_id);
        wait_list.waiters.retain(|waiter| {
            if waiter.txn_id > woken_id {
                waiter.signal.send(false).ok();
                false
            } else {
                true
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_locks_are_compatible() {
        let lm = LockManager::new(false);
        let t0 = Transaction::new(0);
        let t1 = Transaction::new(1);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared(&t0, rid));
        assert!(lm.lock_shared(&t1, rid));
        assert!(t0.holds_shared(&rid));
        assert!(t1.holds_shared(&rid));
    }

    #[test]
    fn test_younger_exclusive_requester_dies() {
        let lm = LockManager::new(false);
        let old = Transaction::new(0);
        let young = Transaction::new(5);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_exclusive(&old, rid));
        assert!(!lm.lock_exclusive(&young, rid));
        assert_eq!(young.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_acquire_after_release_violates_2pl() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(0);
        let a = Rid::new(1, 0);
        let b = Rid::new(1, 1);

        assert!(lm.lock_shared(&txn, a));
        assert!(lm.unlock(&txn, a));
        assert_eq!(txn.state(), TransactionState::Shrinking);
        assert!(!lm.lock_shared(&txn, b));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_strict_2pl_rejects_early_unlock() {
        let lm = LockManager::new(true);
        let txn = Transaction::new(0);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_exclusive(&txn, rid));
        assert!(!lm.unlock(&txn, rid));
        txn.set_state(TransactionState::Committed);
        assert!(lm.unlock(&txn, rid));
        assert!(!txn.holds_exclusive(&rid));
    }

    #[test]
    fn test_upgrade_when_sole_shared_holder() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(0);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared(&txn, rid));
        assert!(lm.lock_upgrade(&txn, rid));
        assert!(txn.holds_exclusive(&rid));
        assert!(!txn.holds_shared(&rid));
        assert_eq!(txn.state(), TransactionState::Growing);
    }

    #[test]
    fn test_upgrade_without_holding_fails() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(0);
        assert!(!lm.lock_upgrade(&txn, Rid::new(1, 0)));
    }

    #[test]
    fn test_reentrant_shared_after_exclusive() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(0);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_exclusive(&txn, rid));
        assert!(lm.lock_shared(&txn, rid));
        // No shared grant was recorded; the exclusive lock stands alone.
        assert!(!txn.holds_shared(&rid));
        assert!(txn.holds_exclusive(&rid));
    }
}
