//! Per-handle mutual exclusion.
//!
//! Entries are reference counted by waiters and removed once the last holder
//! unlocks, so the map only ever contains keys that are locked or contended.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct KeyLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl KeyLock {
    fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    fn release(&self, key: &str) {
        let mut held = self.held.lock();
        assert!(*held, "unlocking key that is not locked: {key}");
        *held = false;
        drop(held);
        self.released.notify_one();
    }
}

#[derive(Debug)]
struct Entry {
    lock: Arc<KeyLock>,
    refs: usize,
}

/// Per-key lock table.
#[derive(Debug, Default)]
pub struct LockManager {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LockManager {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is held by the caller.
    ///
    /// The returned guard unlocks on drop.
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(KeyLock::default()),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };

        lock.acquire();

        KeyGuard {
            manager: self,
            key: key.to_string(),
        }
    }

    /// Release `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not currently locked.
    pub fn unlock(&self, key: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            panic!("unlocking key that is not locked: {key}");
        };

        // a stray unlock panics before the count moves
        entry.lock.release(key);
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
        }
    }

    /// Number of keys currently locked or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no key is locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a key in a [`LockManager`] until dropped.
#[derive(Debug)]
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'a> {
    manager: &'a LockManager,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.manager.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn same_key_serializes() {
        let manager = LockManager::new();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let _guard = manager.lock("handle");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn different_keys_do_not_block() {
        let manager = LockManager::new();
        let _a = manager.lock("a");

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let _b = manager.lock("b");
                tx.send(()).unwrap();
            });
            rx.recv_timeout(Duration::from_secs(5))
                .expect("locking a different key blocked");
        });

        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn entries_are_evicted_after_unlock() {
        let manager = LockManager::new();
        {
            let _guard = manager.lock("a");
            assert_eq!(manager.len(), 1);
        }
        assert!(manager.is_empty());
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn unlocking_a_never_locked_key_panics() {
        LockManager::new().unlock("never-locked");
    }

    #[test]
    fn unlocking_a_waited_on_but_unheld_key_panics() {
        let manager = LockManager::new();
        // a waiter that has registered but not yet acquired
        manager.entries.lock().insert(
            "a".to_string(),
            Entry {
                lock: Arc::new(KeyLock::default()),
                refs: 1,
            },
        );

        let stray = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| manager.unlock("a")));
        assert!(stray.is_err());
        assert_eq!(manager.entries.lock()["a"].refs, 1);
    }
}
