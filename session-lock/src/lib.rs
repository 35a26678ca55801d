//! Cancellation-scoped mutual exclusion keyed by strings, backed by Postgres
//! session advisory locks.
//!
//! A [`LockManager`] owns one long-lived database connection driven by a
//! single serializer task. Callers receive a [`Lease`] (a done signal plus a
//! terminal error) and a [`LockGuard`] releaser. Losing the database cancels
//! every lease with [`LockError::Unavailable`] and reconnects in the
//! background; new requests fail fast until the connection is restored.
//!
//! [`LocalLocks`] provides the same contract with in-process primitives for
//! single-node use.

mod errors;
mod lease;
mod local;
mod manager;
mod pool;
mod serializer;

pub use errors::{LockError, Result};
pub use lease::Lease;
pub use local::LocalLocks;
pub use manager::{LockGuard, LockManager, LockOptions};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The lock contract consumed by the updater orchestrator.
///
/// Both operations return a lease and its releaser. A failed acquisition
/// looks like an already-ended lease: the done signal is closed and
/// [`Lease::err`] names the reason; the accompanying guard is a no-op.
#[async_trait]
pub trait LockSource: Send + Sync {
    /// One non-blocking attempt at the key.
    async fn try_lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard);

    /// Blocks until acquired, the parent is cancelled, or a non-contention
    /// error occurs.
    async fn lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard);
}

#[async_trait]
impl LockSource for LockManager {
    async fn try_lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        LockManager::try_lock(self, parent, key).await
    }

    async fn lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        LockManager::lock(self, parent, key).await
    }
}

#[async_trait]
impl LockSource for LocalLocks {
    async fn try_lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        LocalLocks::try_lock(self, parent, key).await
    }

    async fn lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        LocalLocks::lock(self, parent, key).await
    }
}
