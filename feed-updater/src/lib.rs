//! Orchestration for vulnerability-feed updaters.
//!
//! An [`UpdateManager`] periodically resolves updater sets from factories,
//! drives each updater (fetch, parse, persist) with bounded parallelism, and
//! serializes per-updater work through a [`session_lock::LockSource`] so
//! multiple manager instances sharing a store cooperate instead of colliding.
//! Fingerprints gate re-parsing: an updater whose upstream is unchanged is a
//! recorded no-op.
//!
//! The [`OfflineRunner`] reuses the same pipeline to capture feeds into a
//! [`RecordingStore`] for replay where the network is unreachable.

pub mod driver;
mod manager;
mod offline;
mod recording;

pub use manager::{UpdateError, UpdateManager, UpdateManagerBuilder};
pub use offline::OfflineRunner;
pub use recording::{
    Follow, LoadedEntry, Loader, Record, RecordingStore, UpdaterStatus, iterate, load,
};
