#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use uuid::Uuid;

use feed_types::{
    EnrichmentRecord, Fingerprint, Package, Severity, UpdateKind, UpdateOperation, Vulnerability,
};
use feed_updater::driver::{
    Blob, ConfigError, FetchError, Fetched, ParseError, Store, StoreError, Updater, UpdaterSet,
    UpdaterSetFactory,
};

pub fn vuln(name: &str) -> Vulnerability {
    Vulnerability {
        name: name.to_owned(),
        description: format!("{name} description"),
        links: vec![format!("https://example.com/{name}")],
        severity: Severity::Medium,
        package: Package {
            name: "libexample".to_owned(),
            version: Some("2.0.0".to_owned()),
        },
        fixed_in_version: None,
        issued: None,
    }
}

pub fn enrichment(tag: &str) -> EnrichmentRecord {
    EnrichmentRecord {
        tags: vec![tag.to_owned()],
        enrichment: serde_json::json!({ "score": 5.5 }),
    }
}

/// Tracks how many workers are inside fetch at once.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    high_water: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

/// Updater whose fetch serializes its canned records as JSON and whose parse
/// deserializes them back, exercising the real blob path.
#[derive(Clone)]
pub struct MockUpdater {
    name: String,
    kind: UpdateKind,
    fingerprint: Fingerprint,
    vulnerabilities: Vec<Vulnerability>,
    enrichments: Vec<EnrichmentRecord>,
    fail_fetch: bool,
    fail_configure: bool,
    delay: Duration,
    gauge: Option<Arc<ConcurrencyGauge>>,
    pub fetch_calls: Arc<AtomicUsize>,
    pub configure_calls: Arc<AtomicUsize>,
}

impl MockUpdater {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: UpdateKind::Vulnerability,
            fingerprint: Fingerprint::new(format!("{name}-fp-1")),
            vulnerabilities: vec![vuln(&format!("CVE-{name}"))],
            enrichments: Vec::new(),
            fail_fetch: false,
            fail_configure: false,
            delay: Duration::ZERO,
            gauge: None,
            fetch_calls: Arc::new(AtomicUsize::new(0)),
            configure_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn enriching(name: &str, records: Vec<EnrichmentRecord>) -> Self {
        let mut updater = Self::new(name);
        updater.kind = UpdateKind::Enrichment;
        updater.vulnerabilities = Vec::new();
        updater.enrichments = records;
        updater
    }

    pub fn with_vulnerabilities(mut self, vulnerabilities: Vec<Vulnerability>) -> Self {
        self.vulnerabilities = vulnerabilities;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: &str) -> Self {
        self.fingerprint = Fingerprint::new(fingerprint);
        self
    }

    pub fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }
}

#[async_trait]
impl Updater for MockUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> UpdateKind {
        self.kind
    }

    fn configure(
        &mut self,
        _config: &serde_json::Value,
        _client: &reqwest::Client,
    ) -> Result<(), ConfigError> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_configure {
            return Err(ConfigError::Invalid("configuration rejected".to_owned()));
        }
        Ok(())
    }

    async fn fetch(&self, previous: Option<&Fingerprint>) -> Result<Fetched, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        if self.fail_fetch {
            return Err(FetchError::other("upstream exploded"));
        }
        if previous == Some(&self.fingerprint) {
            return Err(FetchError::Unchanged);
        }
        let payload = match self.kind {
            UpdateKind::Vulnerability => serde_json::to_vec(&self.vulnerabilities),
            UpdateKind::Enrichment => serde_json::to_vec(&self.enrichments),
        }
        .expect("canned records must serialize");
        Ok(Fetched {
            blob: Box::new(Cursor::new(payload)),
            fingerprint: self.fingerprint.clone(),
        })
    }

    async fn parse(&self, blob: Blob) -> Result<Vec<Vulnerability>, ParseError> {
        Ok(serde_json::from_reader(blob)?)
    }

    async fn parse_enrichments(&self, blob: Blob) -> Result<Vec<EnrichmentRecord>, ParseError> {
        Ok(serde_json::from_reader(blob)?)
    }
}

pub struct MockFactory {
    name: String,
    updaters: Vec<MockUpdater>,
    fail: bool,
}

impl MockFactory {
    pub fn new(name: &str, updaters: Vec<MockUpdater>) -> Self {
        Self {
            name: name.to_owned(),
            updaters,
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            updaters: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl UpdaterSetFactory for MockFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn updater_set(&self) -> anyhow::Result<UpdaterSet> {
        if self.fail {
            anyhow::bail!("factory '{}' is broken", self.name);
        }
        let mut set = UpdaterSet::new();
        for updater in &self.updaters {
            set.add(Box::new(updater.clone()))?;
        }
        Ok(set)
    }
}

/// Store that records every call for later assertions.
#[derive(Default)]
pub struct MockStore {
    pub operations: Mutex<HashMap<String, Vec<UpdateOperation>>>,
    pub vuln_updates: AtomicUsize,
    pub enrichment_updates: AtomicUsize,
    pub statuses: Mutex<Vec<(String, Fingerprint, Option<String>)>>,
    pub set_statuses: Mutex<Vec<String>>,
    pub gc_calls: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_names(&self) -> Vec<String> {
        self.statuses
            .lock()
            .expect("status mutex poisoned")
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    fn push_operation(&self, updater: &str, fingerprint: &Fingerprint, kind: UpdateKind) -> Uuid {
        let operation = UpdateOperation {
            reference: Uuid::new_v4(),
            updater: updater.to_owned(),
            fingerprint: fingerprint.clone(),
            date: Utc::now(),
            kind,
        };
        let reference = operation.reference;
        self.operations
            .lock()
            .expect("operations mutex poisoned")
            .entry(updater.to_owned())
            .or_default()
            .insert(0, operation);
        reference
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get_update_operations(
        &self,
        kind: UpdateKind,
        updaters: &[&str],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>, StoreError> {
        let operations = self.operations.lock().expect("operations mutex poisoned");
        let mut out = HashMap::new();
        for (name, ops) in operations.iter() {
            if !updaters.is_empty() && !updaters.contains(&name.as_str()) {
                continue;
            }
            let ops: Vec<_> = ops.iter().filter(|op| op.kind == kind).cloned().collect();
            if !ops.is_empty() {
                out.insert(name.clone(), ops);
            }
        }
        Ok(out)
    }

    async fn update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &Fingerprint,
        _vulnerabilities: Vec<Vulnerability>,
    ) -> Result<Uuid, StoreError> {
        self.vuln_updates.fetch_add(1, Ordering::SeqCst);
        Ok(self.push_operation(updater, fingerprint, UpdateKind::Vulnerability))
    }

    async fn update_enrichments(
        &self,
        updater: &str,
        fingerprint: &Fingerprint,
        _enrichments: Vec<EnrichmentRecord>,
    ) -> Result<Uuid, StoreError> {
        self.enrichment_updates.fetch_add(1, Ordering::SeqCst);
        Ok(self.push_operation(updater, fingerprint, UpdateKind::Enrichment))
    }

    async fn record_updater_status(
        &self,
        updater: &str,
        _date: DateTime<Utc>,
        fingerprint: &Fingerprint,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.statuses
            .lock()
            .expect("status mutex poisoned")
            .push((updater.to_owned(), fingerprint.clone(), error));
        Ok(())
    }

    async fn record_updater_set_status(
        &self,
        set: &str,
        _date: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.set_statuses
            .lock()
            .expect("set status mutex poisoned")
            .push(set.to_owned());
        Ok(())
    }

    async fn gc(&self, _retention: u64) -> Result<i64, StoreError> {
        self.gc_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}
