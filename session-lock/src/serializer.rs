use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use sqlx::{Connection, PgConnection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::xxh3_64;

use crate::errors::LockError;
use crate::lease::Lease;
use crate::pool::{Reply, ReqKind, Request, RequestPool};

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30);
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

const TRY_LOCK_SQL: &str = "SELECT 1 WHERE pg_try_advisory_lock($1)";
const UNLOCK_SQL: &str = "SELECT 1 WHERE pg_advisory_unlock($1)";

/// Folds an arbitrary key into the signed 64-bit advisory-lock keyspace.
///
/// Collisions are acceptable: two colliding keys merely serialize against
/// each other. Nothing may assume distinct keys map to distinct integers.
pub(crate) fn lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

/// Connection health, published by the serializer and read by managers to
/// fail fast without a channel round-trip.
#[derive(Debug, Default)]
pub(crate) struct Status {
    online: AtomicBool,
    reconnecting: AtomicBool,
    generation: AtomicU64,
}

impl Status {
    pub(crate) fn new_online() -> Self {
        let status = Self::default();
        status.online.store(true, Ordering::Release);
        status
    }

    pub(crate) fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    fn set_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.store(reconnecting, Ordering::Release);
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Single task owning the database connection and the table of held locks.
///
/// All connection and table access happens inside `run`; managers talk to it
/// exclusively through the request channel, so no per-operation locking is
/// needed anywhere in here.
pub(crate) struct Serializer {
    dsn: String,
    conn: Option<PgConnection>,
    held: HashMap<String, Lease>,
    max_locks: usize,
    status: Arc<Status>,
    pool: Arc<RequestPool>,
    requests: mpsc::Receiver<Box<Request>>,
    shutdown: CancellationToken,
    restored_tx: mpsc::Sender<PgConnection>,
    restored_rx: mpsc::Receiver<PgConnection>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Serializer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn: PgConnection,
        dsn: String,
        max_locks: usize,
        status: Arc<Status>,
        pool: Arc<RequestPool>,
        requests: mpsc::Receiver<Box<Request>>,
        shutdown: CancellationToken,
    ) -> Self {
        let (restored_tx, restored_rx) = mpsc::channel(1);
        Self {
            dsn,
            conn: Some(conn),
            held: HashMap::new(),
            max_locks,
            status,
            pool,
            requests,
            shutdown,
            restored_tx,
            restored_rx,
            reconnect_task: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => self.ping().await,
                req = self.requests.recv() => match req {
                    Some(req) => self.handle_request(req).await,
                    None => break,
                },
                restored = self.restored_rx.recv() => {
                    if let Some(conn) = restored {
                        self.install(conn);
                    }
                }
            }
        }
        self.finish().await;
    }

    async fn ping(&mut self) {
        if !self.status.online() {
            return;
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if let Err(err) = conn.ping().await {
            warn!(
                "lock connection ping failed: {err}; cancelling {} leases and reconnecting",
                self.held.len()
            );
            self.go_offline();
        }
    }

    /// Every outstanding lease dies with the connection; the server releases
    /// the session locks itself once the session is gone.
    fn go_offline(&mut self) {
        self.status.set_online(false);
        self.status.set_reconnecting(true);
        for (_, lease) in self.held.drain() {
            lease.cancel(LockError::Unavailable);
        }
        self.conn = None;
        self.reconnect_task = Some(tokio::spawn(reconnect(
            self.dsn.clone(),
            self.shutdown.clone(),
            self.restored_tx.clone(),
        )));
    }

    fn install(&mut self, conn: PgConnection) {
        if self.status.online() {
            // A connection is already installed; a stale reconnect has
            // nothing to contribute.
            return;
        }
        self.conn = Some(conn);
        self.held.clear();
        let generation = self.status.bump_generation();
        self.status.set_online(true);
        self.status.set_reconnecting(false);
        self.reconnect_task = None;
        info!("lock connection restored (generation {generation})");
    }

    async fn handle_request(&mut self, mut req: Box<Request>) {
        // Offline answers exactly once; requests never fall through into the
        // dispatch below.
        if !self.status.online() {
            match req.kind {
                ReqKind::Unlock => reply(&mut req, Reply::Unlocked(Err(LockError::Unavailable))),
                _ => reply(&mut req, Reply::Locked(Lease::dead(LockError::Unavailable))),
            }
            self.pool.put(req);
            return;
        }
        match req.kind {
            ReqKind::Lock => self.lock(&mut req).await,
            ReqKind::Unlock => self.unlock(&mut req).await,
            ReqKind::None => warn!("discarding lock request with unset kind"),
        }
        self.pool.put(req);
    }

    async fn lock(&mut self, req: &mut Request) {
        if self.held.contains_key(&req.key) {
            reply(req, Reply::Locked(Lease::dead(LockError::Contended)));
            return;
        }
        if self.max_locks != 0 && self.held.len() >= self.max_locks {
            reply(
                req,
                Reply::Locked(Lease::dead(LockError::MaxLocks(self.max_locks))),
            );
            return;
        }
        let Some(conn) = self.conn.as_mut() else {
            reply(req, Reply::Locked(Lease::dead(LockError::Unavailable)));
            return;
        };
        // Row data is discarded; only the command tag's row count matters.
        let tag = sqlx::query(TRY_LOCK_SQL)
            .bind(lock_id(&req.key))
            .execute(&mut *conn)
            .await;
        match tag {
            Ok(tag) if tag.rows_affected() == 1 => {
                let lease = Lease::live();
                self.held.insert(req.key.clone(), lease.clone());
                debug!("acquired advisory lock for '{}'", req.key);
                reply(req, Reply::Locked(lease));
            }
            Ok(_) => reply(req, Reply::Locked(Lease::dead(LockError::Contended))),
            Err(err) => reply(
                req,
                Reply::Locked(Lease::dead(LockError::database(
                    "acquiring advisory lock",
                    err,
                ))),
            ),
        }
    }

    async fn unlock(&mut self, req: &mut Request) {
        let Some(lease) = self.held.remove(&req.key) else {
            reply(req, Reply::Unlocked(Err(LockError::NotHeld(req.key.clone()))));
            return;
        };
        let result = match self.conn.as_mut() {
            Some(conn) => {
                match sqlx::query(UNLOCK_SQL)
                    .bind(lock_id(&req.key))
                    .execute(&mut *conn)
                    .await
                {
                    Ok(tag) if tag.rows_affected() == 1 => Ok(()),
                    Ok(_) => Err(LockError::UnlockFailed(req.key.clone())),
                    Err(err) => Err(LockError::database("releasing advisory lock", err)),
                }
            }
            None => Err(LockError::Unavailable),
        };
        // Local bookkeeping is unconditional; the database session releases
        // everything on close no matter what the query said.
        lease.cancel(LockError::Canceled);
        if let Err(err) = &result {
            debug!("advisory unlock for '{}' reported: {err}", req.key);
        }
        reply(req, Reply::Unlocked(result));
    }

    async fn finish(mut self) {
        self.status.set_online(false);
        self.requests.close();
        // Drain whatever was in flight when the shutdown landed.
        while let Some(mut req) = self.requests.recv().await {
            match req.kind {
                ReqKind::Unlock => reply(&mut req, Reply::Unlocked(Err(LockError::Canceled))),
                _ => reply(&mut req, Reply::Locked(Lease::dead(LockError::Canceled))),
            }
            self.pool.put(req);
        }
        for (_, lease) in self.held.drain() {
            lease.cancel(LockError::Canceled);
        }
        if let Some(task) = self.reconnect_task.take() {
            // The task observes the shutdown token and exits promptly.
            let _ = task.await;
        }
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.close().await {
                debug!("error closing lock connection: {err}");
            }
        }
    }
}

fn reply(req: &mut Request, reply: Reply) {
    if let Some(tx) = req.reply.take() {
        // The requester may have gone away; nothing to do then.
        let _ = tx.send(reply);
    }
}

async fn reconnect(dsn: String, shutdown: CancellationToken, tx: mpsc::Sender<PgConnection>) {
    let conn = loop {
        if shutdown.is_cancelled() {
            return;
        }
        match timeout(RECONNECT_ATTEMPT_TIMEOUT, PgConnection::connect(&dsn)).await {
            Ok(Ok(conn)) => break conn,
            Ok(Err(err)) => debug!("lock reconnect attempt failed: {err}"),
            Err(_) => debug!("lock reconnect attempt timed out"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(RECONNECT_RETRY_DELAY) => {}
        }
    };
    // If the event loop is gone the fresh connection just drops.
    let _ = tx.send(conn).await;
}
