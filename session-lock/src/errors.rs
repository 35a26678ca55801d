use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LockError>;

/// Terminal error carried by a lease, or surfaced by an unlock.
///
/// Clonable so every holder of a lease handle can read the same error; the
/// driver error is shared behind an `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// Another session already holds the key. Retryable.
    #[error("lock is held by another session")]
    Contended,
    /// The configured cap on outstanding leases was reached.
    #[error("maximum of {0} concurrent locks reached")]
    MaxLocks(usize),
    /// The database connection is lost or not yet restored.
    #[error("lock database unavailable")]
    Unavailable,
    /// The caller's context or the manager itself was cancelled.
    #[error("lock operation canceled")]
    Canceled,
    /// Unlock was requested for a key with no live lease.
    #[error("lock for key '{0}' is not held")]
    NotHeld(String),
    /// The database reported the advisory lock was not held by this session.
    #[error("advisory unlock for key '{0}' released nothing")]
    UnlockFailed(String),
    #[error("database error while {action}: {source}")]
    Database {
        action: &'static str,
        // Shared rather than chained: every clone of a lease reads the same
        // driver error, and `sqlx::Error` is not itself clonable.
        source: Arc<sqlx::Error>,
    },
}

impl LockError {
    pub(crate) fn database(action: &'static str, source: sqlx::Error) -> Self {
        Self::Database {
            action,
            source: Arc::new(source),
        }
    }

    pub fn is_contended(&self) -> bool {
        matches!(self, LockError::Contended)
    }
}
