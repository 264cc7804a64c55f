//! Per-extension single-flight guard.
//!
//! Publishing and applying the same extension must never overlap on one
//! node, while different extensions proceed independently. The table holds
//! the ids currently in flight; a guard releases its id on drop.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<u64>>,
    released: Condvar,
}

impl LockTable {
    fn held(&self) -> MutexGuard<'_, HashSet<u64>> {
        // The set stays consistent even if a holder panicked mid-sync.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to a node-local lock table keyed by extension id.
#[derive(Debug, Clone, Default)]
pub struct ExtensionLocks {
    table: Arc<LockTable>,
}

impl ExtensionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `extension_id` is free, then hold it.
    pub fn acquire(&self, extension_id: u64) -> ExtensionGuard {
        let mut held = self.table.held();
        while held.contains(&extension_id) {
            tracing::debug!(extension_id, "waiting for in-flight sync to finish");
            held = self
                .table
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(extension_id);
        self.guard(extension_id)
    }

    fn guard(&self, extension_id: u64) -> ExtensionGuard {
        ExtensionGuard {
            table: Arc::clone(&self.table),
            extension_id,
        }
    }
}

/// Releases its extension id when dropped.
#[derive(Debug)]
#[must_use = "the extension is released as soon as the guard is dropped"]
pub struct ExtensionGuard {
    table: Arc<LockTable>,
    extension_id: u64,
}

impl ExtensionGuard {
    pub fn extension_id(&self) -> u64 {
        self.extension_id
    }
}

impl Drop for ExtensionGuard {
    fn drop(&mut self) {
        self.table.held().remove(&self.extension_id);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn held(locks: &ExtensionLocks, extension_id: u64) -> bool {
        locks.table.held().contains(&extension_id)
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks = ExtensionLocks::new();
        let guard = locks.acquire(7);
        assert!(held(&locks, 7));
        drop(guard);
        assert!(!held(&locks, 7));
        let _again = locks.acquire(7);
    }

    #[test]
    fn different_extensions_are_independent() {
        let locks = ExtensionLocks::new();
        let _a = locks.acquire(1);
        let b = locks.acquire(2);
        assert_eq!(b.extension_id(), 2);
        assert!(held(&locks, 1) && held(&locks, 2));
    }

    #[test]
    fn acquire_waits_for_release() {
        let locks = ExtensionLocks::new();
        let guard = locks.acquire(3);
        let entered = Arc::new(AtomicBool::new(false));

        let waiter = {
            let locks = locks.clone();
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = locks.acquire(3);
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!held(&locks, 3));
    }
}
