//! Named locks with bounded wait.
//!
//! One lock per logical role ("replay group", "master data resync for facility
//! group X"). Acquisition waits at most the given duration and then gives up;
//! whether giving up is benign or an error is the caller's decision.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Default)]
struct Registry {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// A registry of named, process-wide locks.
///
/// Cloning shares the registry.
#[derive(Clone, Default)]
pub struct NamedLocks {
    inner: Arc<Registry>,
}

impl NamedLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to acquire `name`, waiting at most `wait`.
    ///
    /// Returns `None` if the lock is still held by someone else when the
    /// wait runs out.
    pub fn try_acquire(&self, name: &str, wait: Duration) -> Option<NamedLockGuard> {
        let deadline = Instant::now() + wait;
        let mut held = self.inner.held.lock();

        while held.contains(name) {
            if self.inner.released.wait_until(&mut held, deadline).timed_out() {
                if held.contains(name) {
                    trace!(lock = name, "lock wait timed out");
                    return None;
                }
                break;
            }
        }

        held.insert(name.to_string());
        Some(NamedLockGuard {
            registry: Arc::clone(&self.inner),
            name: name.to_string(),
        })
    }

    /// Returns true if `name` is currently held.
    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.inner.held.lock().contains(name)
    }
}

/// Holds a named lock until dropped.
pub struct NamedLockGuard {
    registry: Arc<Registry>,
    name: String,
}

impl NamedLockGuard {
    /// Name of the held lock.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        self.registry.held.lock().remove(&self.name);
        self.registry.released.notify_all();
    }
}

impl std::fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn second_acquire_times_out() {
        let locks = NamedLocks::new();
        let _guard = locks.try_acquire("replay-group", Duration::ZERO).unwrap();

        assert!(locks
            .try_acquire("replay-group", Duration::from_millis(20))
            .is_none());
    }

    #[test]
    fn different_names_do_not_contend() {
        let locks = NamedLocks::new();
        let _a = locks.try_acquire("a", Duration::ZERO).unwrap();
        assert!(locks.try_acquire("b", Duration::ZERO).is_some());
    }

    #[test]
    fn release_on_drop() {
        let locks = NamedLocks::new();
        {
            let _guard = locks.try_acquire("replay-group", Duration::ZERO).unwrap();
            assert!(locks.is_held("replay-group"));
        }
        assert!(!locks.is_held("replay-group"));
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let locks = NamedLocks::new();
        let guard = locks.try_acquire("resync", Duration::ZERO).unwrap();

        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || {
                locks
                    .try_acquire("resync", Duration::from_secs(5))
                    .map(|g| g.name().to_string())
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert_eq!(waiter.join().unwrap().as_deref(), Some("resync"));
    }
}
