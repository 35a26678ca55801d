use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, warn};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use feed_types::{Fingerprint, UpdateKind};
use session_lock::LockSource;

use crate::driver::{FetchError, Fetched, Store, Updater, UpdaterSetFactory};

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const GC_LOCK_KEY: &str = "garbage-collection";

/// Per-run failure summary, keyed by updater name.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UpdateError {
    message: String,
    failures: BTreeMap<String, String>,
}

impl UpdateError {
    pub(crate) fn from_failures(failures: BTreeMap<String, String>) -> Self {
        let details = failures
            .iter()
            .map(|(name, err)| format!("{name}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            message: format!("{} updater(s) failed: {details}", failures.len()),
            failures,
        }
    }

    pub fn failures(&self) -> &BTreeMap<String, String> {
        &self.failures
    }
}

pub struct UpdateManagerBuilder {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockSource>,
    factories: Vec<Box<dyn UpdaterSetFactory>>,
    configs: HashMap<String, serde_json::Value>,
    client: Option<reqwest::Client>,
    batch_size: usize,
    interval: Duration,
    gc_retention: Option<u64>,
    enabled: Option<HashSet<String>>,
}

impl UpdateManagerBuilder {
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockSource>) -> Self {
        Self {
            store,
            locks,
            factories: Vec::new(),
            configs: HashMap::new(),
            client: None,
            batch_size: 0,
            interval: DEFAULT_UPDATE_INTERVAL,
            gc_retention: None,
            enabled: None,
        }
    }

    pub fn with_factory(mut self, factory: Box<dyn UpdaterSetFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Per-updater configuration values, keyed by updater name.
    pub fn with_configs(mut self, configs: HashMap<String, serde_json::Value>) -> Self {
        self.configs = configs;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Maximum updaters driven concurrently; 0 selects the machine's
    /// parallelism.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enables the garbage-collection pass, keeping `retention` operations
    /// per updater.
    pub fn with_gc_retention(mut self, retention: u64) -> Self {
        self.gc_retention = Some(retention);
        self
    }

    /// Restricts runs to the named updaters; unnamed updaters are skipped.
    pub fn with_enabled_updaters(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.enabled = Some(names.into_iter().collect());
        self
    }

    pub fn into_manager(self) -> anyhow::Result<UpdateManager> {
        if self.interval.is_zero() {
            anyhow::bail!("update interval must be non-zero");
        }
        let batch_size = if self.batch_size == 0 {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        } else {
            self.batch_size
        };
        Ok(UpdateManager {
            store: self.store,
            locks: self.locks,
            factories: self.factories,
            configs: self.configs,
            client: self.client.unwrap_or_default(),
            batch_size,
            interval: self.interval,
            gc_retention: self.gc_retention,
            enabled: self.enabled,
        })
    }
}

/// Periodically drives the configured updater sets against the store, using
/// the lock source to cooperate with other manager instances.
pub struct UpdateManager {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockSource>,
    factories: Vec<Box<dyn UpdaterSetFactory>>,
    configs: HashMap<String, serde_json::Value>,
    client: reqwest::Client,
    batch_size: usize,
    interval: Duration,
    gc_retention: Option<u64>,
    enabled: Option<HashSet<String>>,
}

impl UpdateManager {
    /// Runs once immediately, then on every interval tick until `ctx` ends.
    pub async fn start(&self, ctx: &CancellationToken) {
        loop {
            let started = Instant::now();
            if let Err(err) = self.run(ctx).await {
                error!("update run failed: {err}");
            }
            let wait = self.interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = sleep(wait) => {}
            }
        }
    }

    /// One full pass over every factory's updater set.
    pub async fn run(&self, ctx: &CancellationToken) -> Result<(), UpdateError> {
        let updaters = self.gather().await;
        let errors: Arc<Mutex<BTreeMap<String, String>>> = Arc::default();

        let semaphore = Arc::new(Semaphore::new(self.batch_size));
        let mut workers = Vec::with_capacity(updaters.len());
        for updater in updaters {
            let semaphore = Arc::clone(&semaphore);
            let locks = Arc::clone(&self.locks);
            let store = Arc::clone(&self.store);
            let errors = Arc::clone(&errors);
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let name = updater.name().to_owned();
                let (lease, guard) = locks.try_lock(&ctx, &name).await;
                if let Some(err) = lease.err() {
                    // Another manager instance won the key; that is normal
                    // cooperative behaviour, not a failure.
                    debug!("skipping updater '{name}': {err}");
                    return;
                }
                let result = tokio::select! {
                    result = drive_updater(store.as_ref(), updater.as_ref()) => result,
                    // The lease ending mid-run means exclusivity is gone
                    // (database loss, caller cancellation, manager shutdown);
                    // stop immediately.
                    _ = lease.done() => {
                        let reason = lease
                            .err()
                            .map(|err| err.to_string())
                            .unwrap_or_else(|| "lease ended".to_owned());
                        let err = anyhow::anyhow!("lost updater lock mid-run: {reason}");
                        // The abandoned drive future can no longer write its
                        // status record, so the contract is honoured here.
                        if let Err(status_err) = store
                            .record_updater_status(
                                &name,
                                Utc::now(),
                                &Fingerprint::default(),
                                Some(format!("{err:#}")),
                            )
                            .await
                        {
                            warn!("failed to record lost-lock status for '{name}': {status_err}");
                        }
                        Err(err)
                    }
                };
                if let Err(err) = guard.release().await {
                    warn!("failed to release updater lock for '{name}': {err}");
                }
                if let Err(err) = result {
                    errors
                        .lock()
                        .expect("error map mutex poisoned")
                        .insert(name, format!("{err:#}"));
                }
            }));
        }
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("updater worker panicked: {err:?}");
            }
        }

        if let Some(retention) = self.gc_retention {
            self.collect_garbage(ctx, retention, &errors).await;
        }

        let failures = std::mem::take(
            &mut *errors.lock().expect("error map mutex poisoned"),
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(UpdateError::from_failures(failures))
        }
    }

    async fn gather(&self) -> Vec<Box<dyn Updater>> {
        gather_updaters(
            &self.factories,
            &self.configs,
            &self.client,
            self.enabled.as_ref(),
            self.store.as_ref(),
        )
        .await
    }

    async fn collect_garbage(
        &self,
        ctx: &CancellationToken,
        retention: u64,
        errors: &Mutex<BTreeMap<String, String>>,
    ) {
        let (lease, guard) = self.locks.try_lock(ctx, GC_LOCK_KEY).await;
        if let Some(err) = lease.err() {
            debug!("skipping garbage collection: {err}");
            return;
        }
        match self.store.gc(retention).await {
            Ok(remaining) => {
                debug!("garbage collection done, {remaining} operation(s) remaining")
            }
            Err(err) => {
                errors
                    .lock()
                    .expect("error map mutex poisoned")
                    .insert(GC_LOCK_KEY.to_owned(), err.to_string());
            }
        }
        if let Err(err) = guard.release().await {
            warn!("failed to release garbage collection lock: {err}");
        }
    }
}

/// Resolves factories into the configured, filtered list of updaters for one
/// run. Factory and configuration failures downgrade the affected set or
/// updater, never the run; stub sets only stamp their telemetry.
pub(crate) async fn gather_updaters(
    factories: &[Box<dyn UpdaterSetFactory>],
    configs: &HashMap<String, serde_json::Value>,
    client: &reqwest::Client,
    enabled: Option<&HashSet<String>>,
    store: &dyn Store,
) -> Vec<Box<dyn Updater>> {
    let mut updaters: Vec<Box<dyn Updater>> = Vec::new();
    for factory in factories {
        let set = match factory.updater_set().await {
            Ok(set) => set,
            Err(err) => {
                error!("updater set factory '{}' failed: {err:#}", factory.name());
                continue;
            }
        };
        if set.is_stub() {
            // The vendor reports everything current; stamp the telemetry and
            // move on.
            if let Err(err) = store
                .record_updater_set_status(factory.name(), Utc::now())
                .await
            {
                warn!("failed to record set status for '{}': {err}", factory.name());
            }
            continue;
        }
        for mut updater in set.into_updaters() {
            if let Some(enabled) = enabled {
                if !enabled.contains(updater.name()) {
                    debug!("updater '{}' filtered out", updater.name());
                    continue;
                }
            }
            let config = configs
                .get(updater.name())
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            if let Err(err) = updater.configure(&config, client) {
                error!("failed to configure updater '{}': {err}", updater.name());
                continue;
            }
            updaters.push(updater);
        }
    }
    updaters
}

/// Drives one updater through fetch, parse, and persist.
///
/// The status record is the observability contract: it is written on every
/// exit, success or failure.
pub(crate) async fn drive_updater(store: &dyn Store, updater: &dyn Updater) -> anyhow::Result<()> {
    use anyhow::Context as _;

    let name = updater.name();
    let kind = updater.kind();
    let mut ops = store
        .get_update_operations(kind, &[name])
        .await
        .context("failed to read previous update operations")?;
    let previous = ops
        .remove(name)
        .and_then(|list| list.into_iter().next())
        .map(|op| op.fingerprint);

    let (fingerprint, result) = apply_update(store, updater, previous).await;
    let error = result.as_ref().err().map(|err| format!("{err:#}"));
    store
        .record_updater_status(name, Utc::now(), &fingerprint, error)
        .await
        .context("failed to record updater status")?;
    result
}

/// Returns the fingerprint to record alongside the outcome: the fresh one
/// once fetch produced data, otherwise whatever was previously stored.
async fn apply_update(
    store: &dyn Store,
    updater: &dyn Updater,
    previous: Option<Fingerprint>,
) -> (Fingerprint, anyhow::Result<()>) {
    use anyhow::Context as _;

    let name = updater.name();
    let fetched = match updater.fetch(previous.as_ref()).await {
        Err(FetchError::Unchanged) => {
            debug!("updater '{name}' reports no change");
            return (previous.unwrap_or_default(), Ok(()));
        }
        Err(err) => {
            return (
                previous.unwrap_or_default(),
                Err(err).context("fetch failed"),
            );
        }
        Ok(fetched) => fetched,
    };
    let Fetched { blob, fingerprint } = fetched;

    let result = match updater.kind() {
        UpdateKind::Vulnerability => match updater.parse(blob).await {
            Ok(vulnerabilities) => store
                .update_vulnerabilities(name, &fingerprint, vulnerabilities)
                .await
                .map(|reference| {
                    debug!("updater '{name}' recorded update operation {reference}");
                })
                .context("failed to persist vulnerabilities"),
            Err(err) => Err(err).context("parse failed"),
        },
        UpdateKind::Enrichment => match updater.parse_enrichments(blob).await {
            Ok(enrichments) => store
                .update_enrichments(name, &fingerprint, enrichments)
                .await
                .map(|reference| {
                    debug!("updater '{name}' recorded update operation {reference}");
                })
                .context("failed to persist enrichments"),
            Err(err) => Err(err).context("parse failed"),
        },
    };
    (fingerprint, result)
}
