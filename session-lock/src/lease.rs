use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::errors::LockError;

static DEAD_DONE: OnceLock<CancellationToken> = OnceLock::new();

/// Shared pre-cancelled token for leases born already dead, so a failed lock
/// never allocates its own signal state.
fn dead_done() -> CancellationToken {
    DEAD_DONE
        .get_or_init(|| {
            let token = CancellationToken::new();
            token.cancel();
            token
        })
        .clone()
}

/// A cancellation-scoped handle to one held lock.
///
/// Clones share state. The lease transitions from live to ended exactly once:
/// the first `cancel` records its error and closes the done signal, later
/// calls are no-ops. `err()` returns `Some` iff the lease has ended.
#[derive(Debug, Clone)]
pub struct Lease {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    done: CancellationToken,
    err: OnceLock<LockError>,
}

impl Lease {
    pub(crate) fn live() -> Self {
        Self {
            inner: Arc::new(Inner {
                done: CancellationToken::new(),
                err: OnceLock::new(),
            }),
        }
    }

    /// A lease that never lived: its done signal is already closed and its
    /// terminal error is set.
    pub(crate) fn dead(err: LockError) -> Self {
        let inner = Inner {
            done: dead_done(),
            err: OnceLock::new(),
        };
        let _ = inner.err.set(err);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Resolves once the lease has ended.
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }

    pub fn is_ended(&self) -> bool {
        self.inner.err.get().is_some()
    }

    /// The terminal error, or `None` while the lease is live.
    pub fn err(&self) -> Option<LockError> {
        self.inner.err.get().cloned()
    }

    pub(crate) fn cancel(&self, err: LockError) {
        if self.inner.err.set(err).is_ok() {
            self.inner.done.cancel();
        }
    }
}
