//! Contracts between the orchestrator, the updaters it drives, and the store
//! it writes to.

use std::collections::HashMap;
use std::io::Read;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use feed_types::{EnrichmentRecord, Fingerprint, UpdateKind, UpdateOperation, Vulnerability};

/// Sentinel updater name. A set containing exactly one updater with this
/// name means the vendor reports all of its updaters current: the set status
/// is recorded and no work runs.
pub const STUB_UPDATER_NAME: &str = "rhel-all";

/// Raw feed contents handed from fetch to parse.
pub type Blob = Box<dyn Read + Send>;

/// Result of a successful fetch: the feed contents and the fingerprint
/// describing what was fetched.
pub struct Fetched {
    pub blob: Blob,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream feed matches the previous fingerprint; nothing to parse.
    #[error("upstream feed unchanged")]
    Unchanged,
    #[error("I/O error while fetching feed")]
    Io(#[from] std::io::Error),
    #[error("http error while fetching feed")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed feed document: {0}")]
    Malformed(String),
    #[error("I/O error while parsing feed")]
    Io(#[from] std::io::Error),
    #[error("JSON error while parsing feed")]
    Json(#[from] serde_json::Error),
    #[error("updater does not produce {0} records")]
    Unsupported(UpdateKind),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid updater configuration: {0}")]
    Invalid(String),
    #[error("failed to decode updater configuration")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error in update store")]
    Io(#[from] std::io::Error),
    #[error("serialization error in update store")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// One vulnerability-feed updater.
///
/// `kind` selects the parse method and store path the orchestrator uses;
/// implementations override the parser matching their kind and leave the
/// other at its default.
#[async_trait]
pub trait Updater: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> UpdateKind {
        UpdateKind::Vulnerability
    }

    /// Configuration hook, invoked once per run before any fetch. `config`
    /// is the value registered under this updater's name (JSON null when
    /// none is registered); the client is shared by all network-going
    /// updaters.
    fn configure(
        &mut self,
        _config: &serde_json::Value,
        _client: &reqwest::Client,
    ) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Fetches the feed, comparing against the fingerprint of the previous
    /// ingest. Returns [`FetchError::Unchanged`] when there is nothing new.
    async fn fetch(&self, previous: Option<&Fingerprint>) -> Result<Fetched, FetchError>;

    async fn parse(&self, blob: Blob) -> Result<Vec<Vulnerability>, ParseError> {
        drop(blob);
        Err(ParseError::Unsupported(UpdateKind::Vulnerability))
    }

    async fn parse_enrichments(&self, blob: Blob) -> Result<Vec<EnrichmentRecord>, ParseError> {
        drop(blob);
        Err(ParseError::Unsupported(UpdateKind::Enrichment))
    }
}

#[derive(Debug, Error)]
#[error("duplicate updater name '{0}'")]
pub struct DuplicateUpdater(pub String);

/// A named collection of updaters, usually one vendor's worth.
#[derive(Default)]
pub struct UpdaterSet {
    updaters: Vec<Box<dyn Updater>>,
}

impl UpdaterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, updater: Box<dyn Updater>) -> Result<(), DuplicateUpdater> {
        if self.updaters.iter().any(|u| u.name() == updater.name()) {
            return Err(DuplicateUpdater(updater.name().to_owned()));
        }
        self.updaters.push(updater);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.updaters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.is_empty()
    }

    /// Whether this set is the "nothing to do" stub.
    pub fn is_stub(&self) -> bool {
        self.updaters.len() == 1 && self.updaters[0].name() == STUB_UPDATER_NAME
    }

    pub fn into_updaters(self) -> Vec<Box<dyn Updater>> {
        self.updaters
    }
}

/// Produces an updater set, typically by enumerating a vendor's feeds.
#[async_trait]
pub trait UpdaterSetFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn updater_set(&self) -> anyhow::Result<UpdaterSet>;
}

/// Persistence consumed by the orchestrator.
#[async_trait]
pub trait Store: Send + Sync {
    /// Update operations per updater name, most recent first. An empty name
    /// slice selects every known updater.
    async fn get_update_operations(
        &self,
        kind: UpdateKind,
        updaters: &[&str],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>, StoreError>;

    async fn update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &Fingerprint,
        vulnerabilities: Vec<Vulnerability>,
    ) -> Result<Uuid, StoreError>;

    async fn update_enrichments(
        &self,
        updater: &str,
        fingerprint: &Fingerprint,
        enrichments: Vec<EnrichmentRecord>,
    ) -> Result<Uuid, StoreError>;

    /// Written once per driven updater per run, success or not.
    async fn record_updater_status(
        &self,
        updater: &str,
        date: DateTime<Utc>,
        fingerprint: &Fingerprint,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn record_updater_set_status(
        &self,
        set: &str,
        date: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Drops update operations beyond `retention` per updater; returns how
    /// many candidates remain.
    async fn gc(&self, retention: u64) -> Result<i64, StoreError>;
}
