use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use log::warn;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::driver::UpdaterSetFactory;
use crate::manager::{UpdateError, drive_updater, gather_updaters};
use crate::recording::RecordingStore;

/// Runs the update pipeline without persistent storage or locking, recording
/// results for later replay in an air-gapped environment.
///
/// The output stream is the gzip NDJSON format described in
/// [`crate::recording`]; feed it back through [`crate::load`] or
/// [`crate::iterate`].
pub struct OfflineRunner {
    factories: Vec<Box<dyn UpdaterSetFactory>>,
    configs: HashMap<String, serde_json::Value>,
    client: reqwest::Client,
    batch_size: usize,
}

impl Default for OfflineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineRunner {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            configs: HashMap::new(),
            client: reqwest::Client::default(),
            batch_size: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
        }
    }

    pub fn with_factory(mut self, factory: Box<dyn UpdaterSetFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn with_configs(mut self, configs: HashMap<String, serde_json::Value>) -> Self {
        self.configs = configs;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        if batch_size != 0 {
            self.batch_size = batch_size;
        }
        self
    }

    /// Drives every updater into a fresh recording store and serializes the
    /// store to `out`.
    pub async fn run<W: Write>(&self, ctx: &CancellationToken, out: W) -> anyhow::Result<()> {
        let store = Arc::new(RecordingStore::new());
        self.run_into(ctx, Arc::clone(&store)).await?;
        store
            .store(out)
            .context("failed to serialize recording store")?;
        Ok(())
    }

    /// The update pipeline of [`crate::UpdateManager::run`], minus locking:
    /// a single process owns the recording store, so cooperation is moot.
    pub async fn run_into(
        &self,
        ctx: &CancellationToken,
        store: Arc<RecordingStore>,
    ) -> Result<(), UpdateError> {
        let updaters = gather_updaters(
            &self.factories,
            &self.configs,
            &self.client,
            None,
            store.as_ref(),
        )
        .await;

        let errors: Arc<Mutex<BTreeMap<String, String>>> = Arc::default();
        let semaphore = Arc::new(Semaphore::new(self.batch_size));
        let mut workers = Vec::with_capacity(updaters.len());
        for updater in updaters {
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&store);
            let errors = Arc::clone(&errors);
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if ctx.is_cancelled() {
                    return;
                }
                let name = updater.name().to_owned();
                if let Err(err) = drive_updater(&*store, updater.as_ref()).await {
                    errors
                        .lock()
                        .expect("error map mutex poisoned")
                        .insert(name, format!("{err:#}"));
                }
            }));
        }
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("offline updater worker panicked: {err:?}");
            }
        }

        let failures = std::mem::take(&mut *errors.lock().expect("error map mutex poisoned"));
        if failures.is_empty() {
            Ok(())
        } else {
            Err(UpdateError::from_failures(failures))
        }
    }
}
