//! Mutual exclusion for sync roles.

use localmachine_storage::{NamedLockGuard, NamedLocks};
use std::time::Duration;

/// A held lock; released when dropped.
pub trait LockGuard: Send {
    /// Name of the held lock.
    fn name(&self) -> &str;
}

impl LockGuard for NamedLockGuard {
    fn name(&self) -> &str {
        NamedLockGuard::name(self)
    }
}

/// Source of named locks with bounded wait.
///
/// The default is an in-process [`NamedLocks`] registry; deployments that run
/// several agent processes against one journal plug in a shared lock here.
pub trait LockProvider: Send + Sync {
    /// Tries to acquire `name`, giving up after `wait`.
    fn try_lock(&self, name: &str, wait: Duration) -> Option<Box<dyn LockGuard>>;
}

impl LockProvider for NamedLocks {
    fn try_lock(&self, name: &str, wait: Duration) -> Option<Box<dyn LockGuard>> {
        self.try_acquire(name, wait)
            .map(|guard| Box::new(guard) as Box<dyn LockGuard>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_locks_as_provider() {
        let locks = NamedLocks::new();
        let provider: &dyn LockProvider = &locks;

        let guard = provider.try_lock("replay group", Duration::ZERO).unwrap();
        assert_eq!(guard.name(), "replay group");
        assert!(provider.try_lock("replay group", Duration::ZERO).is_none());

        drop(guard);
        assert!(provider.try_lock("replay group", Duration::ZERO).is_some());
    }
}
