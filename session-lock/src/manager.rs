use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use sqlx::{Connection, PgConnection};
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::errors::{LockError, Result};
use crate::lease::Lease;
use crate::pool::{DEFAULT_POOL_SEED, Reply, ReqKind, Request, RequestPool};
use crate::serializer::{Serializer, Status};

/// Fixed back-off between retries of a blocking `lock`. Pragmatic, not
/// load-bearing; contention is expected to be short-lived.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(250);
const REQUEST_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Cap on outstanding leases; 0 means unbounded.
    pub max_locks: usize,
    /// Number of request envelopes pre-allocated in the pool.
    pub pool_seed: usize,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            max_locks: 0,
            pool_seed: DEFAULT_POOL_SEED,
        }
    }
}

/// Distributed advisory locks over one long-lived Postgres session.
///
/// All methods are safe for concurrent callers: every operation funnels
/// through the serializer task's request channel.
pub struct LockManager {
    tx: mpsc::Sender<Box<Request>>,
    pool: Arc<RequestPool>,
    status: Arc<Status>,
    shutdown: CancellationToken,
    serializer: JoinHandle<()>,
}

impl LockManager {
    /// Opens the lock connection and starts the serializer.
    pub async fn connect(dsn: impl Into<String>, options: LockOptions) -> Result<Self> {
        let dsn = dsn.into();
        let conn = PgConnection::connect(&dsn)
            .await
            .map_err(|err| LockError::database("opening lock connection", err))?;
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let pool = Arc::new(RequestPool::new(options.pool_seed));
        let status = Arc::new(Status::new_online());
        let shutdown = CancellationToken::new();
        let serializer = Serializer::new(
            conn,
            dsn,
            options.max_locks,
            Arc::clone(&status),
            Arc::clone(&pool),
            rx,
            shutdown.clone(),
        );
        let handle = tokio::spawn(serializer.run());
        Ok(Self {
            tx,
            pool,
            status,
            shutdown,
            serializer: handle,
        })
    }

    pub fn is_online(&self) -> bool {
        self.status.online()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status.reconnecting()
    }

    /// Reconnect epoch; bumped once per restored connection.
    pub fn generation(&self) -> u64 {
        self.status.generation()
    }

    /// One attempt at the key. The returned lease is live on success; on
    /// failure it is born dead with the error readable via [`Lease::err`].
    pub async fn try_lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        if parent.is_cancelled() {
            return (Lease::dead(LockError::Canceled), LockGuard::noop());
        }
        // Fail fast while disconnected; the serializer is busy reconnecting.
        if !self.status.online() {
            return (Lease::dead(LockError::Unavailable), LockGuard::noop());
        }
        let mut req = self.pool.get();
        req.kind = ReqKind::Lock;
        req.key.push_str(key);
        let (reply_tx, reply_rx) = oneshot::channel();
        req.reply = Some(reply_tx);
        if let Err(err) = self.tx.send(req).await {
            self.pool.put(err.0);
            return (Lease::dead(LockError::Canceled), LockGuard::noop());
        }
        let lease = match reply_rx.await {
            Ok(Reply::Locked(lease)) => lease,
            Ok(Reply::Unlocked(_)) | Err(_) => Lease::dead(LockError::Canceled),
        };
        if lease.is_ended() {
            return (lease, LockGuard::noop());
        }
        self.spawn_watcher(parent.clone(), lease.clone(), key.to_owned());
        let guard = LockGuard::session(
            self.tx.clone(),
            Arc::clone(&self.pool),
            key.to_owned(),
            lease.clone(),
        );
        (lease, guard)
    }

    /// Blocks until the key is acquired, the parent is cancelled, or a
    /// non-contention error occurs.
    pub async fn lock(&self, parent: &CancellationToken, key: &str) -> (Lease, LockGuard) {
        loop {
            let (lease, guard) = self.try_lock(parent, key).await;
            match lease.err() {
                Some(LockError::Contended) => {}
                _ => return (lease, guard),
            }
            tokio::select! {
                _ = parent.cancelled() => {
                    return (Lease::dead(LockError::Canceled), LockGuard::noop());
                }
                _ = sleep(LOCK_RETRY_DELAY) => {}
            }
        }
    }

    /// Tears down the serializer; every outstanding lease ends with
    /// [`LockError::Canceled`] and the database session is closed.
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(err) = self.serializer.await {
            warn!("lock serializer task panicked: {err:?}");
        }
    }

    /// Ends the lease if the caller's context goes away first.
    fn spawn_watcher(&self, parent: CancellationToken, lease: Lease, key: String) {
        let tx = self.tx.clone();
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    if let Err(err) = send_unlock(&tx, &pool, &key).await {
                        debug!("unlock after parent cancellation failed for '{key}': {err}");
                    }
                }
                _ = lease.done() => {}
            }
        });
    }
}

pub(crate) async fn send_unlock(
    tx: &mpsc::Sender<Box<Request>>,
    pool: &RequestPool,
    key: &str,
) -> Result<()> {
    let mut req = pool.get();
    req.kind = ReqKind::Unlock;
    req.key.push_str(key);
    let (reply_tx, reply_rx) = oneshot::channel();
    req.reply = Some(reply_tx);
    if let Err(err) = tx.send(req).await {
        // Manager shut down; the session releases the lock on close.
        pool.put(err.0);
        return Err(LockError::Canceled);
    }
    match reply_rx.await {
        Ok(Reply::Unlocked(result)) => result,
        Ok(Reply::Locked(_)) | Err(_) => Err(LockError::Canceled),
    }
}

enum GuardInner {
    Session {
        tx: mpsc::Sender<Box<Request>>,
        pool: Arc<RequestPool>,
        key: String,
        lease: Lease,
    },
    Local {
        lease: Lease,
        permit: OwnedMutexGuard<()>,
    },
}

/// Releaser for one acquired lock.
///
/// `release` is deterministic and preferred; `Drop` is best-effort only.
/// Both are idempotent, never panic, and no-op for failed leases.
pub struct LockGuard {
    inner: Option<GuardInner>,
}

impl LockGuard {
    pub(crate) fn noop() -> Self {
        Self { inner: None }
    }

    pub(crate) fn session(
        tx: mpsc::Sender<Box<Request>>,
        pool: Arc<RequestPool>,
        key: String,
        lease: Lease,
    ) -> Self {
        Self {
            inner: Some(GuardInner::Session {
                tx,
                pool,
                key,
                lease,
            }),
        }
    }

    pub(crate) fn local(lease: Lease, permit: OwnedMutexGuard<()>) -> Self {
        Self {
            inner: Some(GuardInner::Local { lease, permit }),
        }
    }

    pub async fn release(mut self) -> Result<()> {
        match self.inner.take() {
            None => Ok(()),
            Some(inner) => release_inner(inner).await,
        }
    }
}

async fn release_inner(inner: GuardInner) -> Result<()> {
    match inner {
        GuardInner::Session {
            tx,
            pool,
            key,
            lease,
        } => {
            if lease.is_ended() {
                return Ok(());
            }
            match send_unlock(&tx, &pool, &key).await {
                // The lease ended between the check and the unlock; the
                // serializer already cleaned up.
                Err(LockError::NotHeld(_)) if lease.is_ended() => Ok(()),
                other => other,
            }
        }
        GuardInner::Local { lease, permit } => {
            lease.cancel(LockError::Canceled);
            drop(permit);
            Ok(())
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.inner.take() {
            None => {}
            Some(GuardInner::Local { lease, permit }) => {
                lease.cancel(LockError::Canceled);
                drop(permit);
            }
            Some(inner @ GuardInner::Session { .. }) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = release_inner(inner).await {
                            debug!("failed to release lock during drop: {err}");
                        }
                    });
                }
                // Without a runtime the release is skipped; the database
                // session still frees the lock when the manager closes.
            }
        }
    }
}
