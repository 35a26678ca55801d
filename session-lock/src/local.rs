use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::errors::LockError;
use crate::lease::Lease;
use crate::manager::LockGuard;

/// In-process lock source for deployments without a shared database.
///
/// Keys map to one-slot mutexes; a held slot is a held lock. Substituting
/// this for [`crate::LockManager`] is invisible to callers of the
/// [`crate::LockSource`] contract.
#[derive(Debug, Default)]
pub struct LocalLocks {
    slots: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().expect("local lock map mutex poisoned");
        Arc::clone(slots.entry(key.to_owned()).or_default())
    }

    pub async fn try_lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        if parent.is_cancelled() {
            return (Lease::dead(LockError::Canceled), LockGuard::noop());
        }
        match self.slot(key).try_lock_owned() {
            Ok(permit) => grant(parent, permit),
            Err(_) => (Lease::dead(LockError::Contended), LockGuard::noop()),
        }
    }

    pub async fn lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        if parent.is_cancelled() {
            return (Lease::dead(LockError::Canceled), LockGuard::noop());
        }
        let slot = self.slot(key);
        tokio::select! {
            permit = slot.lock_owned() => grant(parent, permit),
            _ = parent.cancelled() => (Lease::dead(LockError::Canceled), LockGuard::noop()),
        }
    }
}

fn grant(parent: &CancellationToken, permit: OwnedMutexGuard<()>) -> (Lease, LockGuard) {
    let lease = Lease::live();
    let parent = parent.clone();
    let watched = lease.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => watched.cancel(LockError::Canceled),
            _ = watched.done() => {}
        }
    });
    let guard = LockGuard::local(lease.clone(), permit);
    (lease, guard)
}
