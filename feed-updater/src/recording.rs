//! In-memory recording store for offline runs, and the gzip NDJSON stream
//! format used to move recordings between air-gapped environments.
//!
//! One JSON object per line, one line per record. Lines belonging to the
//! same update operation share a `ref` and are consecutive; a `ref` change
//! marks an entry boundary.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use feed_types::{EnrichmentRecord, Fingerprint, UpdateKind, UpdateOperation, Vulnerability};

use crate::driver::{Store, StoreError};

/// Batches at or above this many records are spooled to disk instead of
/// living on the heap.
const DEFAULT_SPOOL_THRESHOLD: usize = 1024;

#[derive(Serialize)]
struct DiskEntryRef<'a> {
    updater: &'a str,
    fingerprint: &'a Fingerprint,
    date: &'a DateTime<Utc>,
    #[serde(rename = "ref")]
    reference: &'a Uuid,
    kind: UpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    vuln: Option<&'a Vulnerability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enrichment: Option<&'a EnrichmentRecord>,
}

#[derive(Debug, Deserialize)]
struct DiskEntry {
    updater: String,
    fingerprint: Fingerprint,
    date: DateTime<Utc>,
    #[serde(rename = "ref")]
    reference: Uuid,
    kind: UpdateKind,
    #[serde(default)]
    vuln: Option<Vulnerability>,
    #[serde(default)]
    enrichment: Option<EnrichmentRecord>,
}

impl DiskEntry {
    fn operation(&self) -> UpdateOperation {
        UpdateOperation {
            reference: self.reference,
            updater: self.updater.clone(),
            fingerprint: self.fingerprint.clone(),
            date: self.date,
            kind: self.kind,
        }
    }
}

enum Payload {
    Vulnerabilities(Vec<Vulnerability>),
    Enrichments(Vec<EnrichmentRecord>),
    /// Pre-serialized lines in an anonymous temp file. The file is unlinked
    /// at creation, so it is reaped when the handle closes.
    Spooled(Mutex<File>),
}

struct Entry {
    operation: UpdateOperation,
    payload: Payload,
}

/// Status telemetry as recorded during an offline run.
#[derive(Debug, Clone)]
pub struct UpdaterStatus {
    pub date: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub error: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    operations: HashMap<String, Vec<UpdateOperation>>,
    statuses: HashMap<String, UpdaterStatus>,
    set_statuses: HashMap<String, DateTime<Utc>>,
}

/// Append-only [`Store`] used by the offline sink.
pub struct RecordingStore {
    inner: RwLock<Inner>,
    spool_threshold: usize,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
        }
    }

    pub fn with_spool_threshold(mut self, threshold: usize) -> Self {
        self.spool_threshold = threshold.max(1);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.read().entries.len()
    }

    pub fn updater_status(&self, updater: &str) -> Option<UpdaterStatus> {
        self.read().statuses.get(updater).cloned()
    }

    pub fn set_status(&self, set: &str) -> Option<DateTime<Utc>> {
        self.read().set_statuses.get(set).copied()
    }

    /// Serializes every recorded entry as gzip-compressed NDJSON.
    pub fn store<W: Write>(&self, out: W) -> Result<(), StoreError> {
        let inner = self.read();
        let mut encoder = GzEncoder::new(out, Compression::default());
        for entry in &inner.entries {
            let op = &entry.operation;
            match &entry.payload {
                Payload::Vulnerabilities(vulnerabilities) => {
                    for vuln in vulnerabilities {
                        write_line(&mut encoder, op, Some(vuln), None)?;
                    }
                }
                Payload::Enrichments(enrichments) => {
                    for enrichment in enrichments {
                        write_line(&mut encoder, op, None, Some(enrichment))?;
                    }
                }
                Payload::Spooled(file) => {
                    let mut file = file.lock().expect("spool file mutex poisoned");
                    file.seek(SeekFrom::Start(0))?;
                    io::copy(&mut *file, &mut encoder)?;
                }
            }
        }
        encoder.finish()?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("recording store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("recording store lock poisoned")
    }

    fn append(&self, operation: UpdateOperation, payload: Payload) {
        let mut inner = self.write();
        inner
            .operations
            .entry(operation.updater.clone())
            .or_default()
            .insert(0, operation.clone());
        inner.entries.push(Entry { operation, payload });
    }

    #[cfg(test)]
    fn is_spooled(&self, reference: Uuid) -> bool {
        self.read()
            .entries
            .iter()
            .any(|entry| {
                entry.operation.reference == reference
                    && matches!(entry.payload, Payload::Spooled(_))
            })
    }
}

fn write_line<W: Write>(
    out: &mut W,
    operation: &UpdateOperation,
    vuln: Option<&Vulnerability>,
    enrichment: Option<&EnrichmentRecord>,
) -> Result<(), StoreError> {
    let line = DiskEntryRef {
        updater: &operation.updater,
        fingerprint: &operation.fingerprint,
        date: &operation.date,
        reference: &operation.reference,
        kind: operation.kind,
        vuln,
        enrichment,
    };
    serde_json::to_writer(&mut *out, &line)?;
    out.write_all(b"\n")?;
    Ok(())
}

fn spool<T, F>(operation: &UpdateOperation, records: &[T], mut write: F) -> Result<File, StoreError>
where
    F: FnMut(&mut File, &UpdateOperation, &T) -> Result<(), StoreError>,
{
    let mut file = tempfile::tempfile()?;
    for record in records {
        write(&mut file, operation, record)?;
    }
    Ok(file)
}

#[async_trait]
impl Store for RecordingStore {
    async fn get_update_operations(
        &self,
        kind: UpdateKind,
        updaters: &[&str],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>, StoreError> {
        let wanted: Option<HashSet<&str>> = if updaters.is_empty() {
            None
        } else {
            Some(updaters.iter().copied().collect())
        };
        let inner = self.read();
        let mut out = HashMap::new();
        for (name, operations) in &inner.operations {
            if wanted
                .as_ref()
                .is_some_and(|wanted| !wanted.contains(name.as_str()))
            {
                continue;
            }
            let operations: Vec<_> = operations
                .iter()
                .filter(|op| op.kind == kind)
                .cloned()
                .collect();
            if !operations.is_empty() {
                out.insert(name.clone(), operations);
            }
        }
        Ok(out)
    }

    async fn update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &Fingerprint,
        vulnerabilities: Vec<Vulnerability>,
    ) -> Result<Uuid, StoreError> {
        let operation = UpdateOperation {
            reference: Uuid::new_v4(),
            updater: updater.to_owned(),
            fingerprint: fingerprint.clone(),
            date: Utc::now(),
            kind: UpdateKind::Vulnerability,
        };
        let payload = if vulnerabilities.len() >= self.spool_threshold {
            let file = spool(&operation, &vulnerabilities, |file, op, vuln| {
                write_line(file, op, Some(vuln), None)
            })?;
            Payload::Spooled(Mutex::new(file))
        } else {
            Payload::Vulnerabilities(vulnerabilities)
        };
        let reference = operation.reference;
        self.append(operation, payload);
        Ok(reference)
    }

    async fn update_enrichments(
        &self,
        updater: &str,
        fingerprint: &Fingerprint,
        enrichments: Vec<EnrichmentRecord>,
    ) -> Result<Uuid, StoreError> {
        let operation = UpdateOperation {
            reference: Uuid::new_v4(),
            updater: updater.to_owned(),
            fingerprint: fingerprint.clone(),
            date: Utc::now(),
            kind: UpdateKind::Enrichment,
        };
        let payload = if enrichments.len() >= self.spool_threshold {
            let file = spool(&operation, &enrichments, |file, op, enrichment| {
                write_line(file, op, None, Some(enrichment))
            })?;
            Payload::Spooled(Mutex::new(file))
        } else {
            Payload::Enrichments(enrichments)
        };
        let reference = operation.reference;
        self.append(operation, payload);
        Ok(reference)
    }

    async fn record_updater_status(
        &self,
        updater: &str,
        date: DateTime<Utc>,
        fingerprint: &Fingerprint,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.write().statuses.insert(
            updater.to_owned(),
            UpdaterStatus {
                date,
                fingerprint: fingerprint.clone(),
                error,
            },
        );
        Ok(())
    }

    async fn record_updater_set_status(
        &self,
        set: &str,
        date: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write().set_statuses.insert(set.to_owned(), date);
        Ok(())
    }

    async fn gc(&self, _retention: u64) -> Result<i64, StoreError> {
        // Recordings are append-only; there is never anything to collect.
        Ok(0)
    }
}

/// One update operation with its records, as replayed from a stream.
#[derive(Debug, Clone)]
pub struct LoadedEntry {
    pub operation: UpdateOperation,
    pub vulnerabilities: Vec<Vulnerability>,
    pub enrichments: Vec<EnrichmentRecord>,
}

/// Cursor over a recorded stream, grouping consecutive same-`ref` lines.
pub struct Loader<R> {
    reader: R,
    pending: Option<DiskEntry>,
    line: String,
    failed: bool,
}

/// Replays a stream produced by [`RecordingStore::store`].
pub fn load<R: Read>(input: R) -> Loader<BufReader<GzDecoder<R>>> {
    Loader {
        reader: BufReader::new(GzDecoder::new(input)),
        pending: None,
        line: String::new(),
        failed: false,
    }
}

impl<R: BufRead> Loader<R> {
    fn next_line(&mut self) -> Result<Option<DiskEntry>, StoreError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

impl<R: BufRead> Iterator for Loader<R> {
    type Item = Result<LoadedEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let first = match self.pending.take() {
            Some(entry) => entry,
            None => match self.next_line() {
                Ok(Some(entry)) => entry,
                Ok(None) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            },
        };
        let mut loaded = LoadedEntry {
            operation: first.operation(),
            vulnerabilities: Vec::new(),
            enrichments: Vec::new(),
        };
        push_record(&mut loaded, first);
        loop {
            match self.next_line() {
                Ok(Some(entry)) if entry.reference == loaded.operation.reference => {
                    push_record(&mut loaded, entry);
                }
                Ok(Some(entry)) => {
                    self.pending = Some(entry);
                    break;
                }
                Ok(None) => break,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        Some(Ok(loaded))
    }
}

fn push_record(loaded: &mut LoadedEntry, entry: DiskEntry) {
    if let Some(vuln) = entry.vuln {
        loaded.vulnerabilities.push(vuln);
    }
    if let Some(enrichment) = entry.enrichment {
        loaded.enrichments.push(enrichment);
    }
}

/// Whether [`iterate`] should deserialize an operation's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Follow {
    Descend,
    Skip,
}

/// One record yielded by [`iterate`].
#[derive(Debug, Clone)]
pub enum Record {
    Vulnerability(Vulnerability),
    Enrichment(EnrichmentRecord),
}

#[derive(Deserialize)]
struct RawLine {
    updater: String,
    fingerprint: Fingerprint,
    date: DateTime<Utc>,
    #[serde(rename = "ref")]
    reference: Uuid,
    kind: UpdateKind,
    #[serde(default)]
    vuln: Option<Box<RawValue>>,
    #[serde(default)]
    enrichment: Option<Box<RawValue>>,
}

/// Two-level iteration over a recorded stream.
///
/// `visit` sees each operation header once and decides whether to descend;
/// skipped operations never have their record payloads deserialized. `each`
/// receives the records of descended operations in stream order.
pub fn iterate<R, V, F>(input: R, mut visit: V, mut each: F) -> Result<(), StoreError>
where
    R: Read,
    V: FnMut(&UpdateOperation) -> Follow,
    F: FnMut(&UpdateOperation, Record) -> Result<(), StoreError>,
{
    let mut reader = BufReader::new(GzDecoder::new(input));
    let mut line = String::new();
    let mut current: Option<(UpdateOperation, Follow)> = None;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let raw: RawLine = serde_json::from_str(trimmed)?;
        let boundary = current
            .as_ref()
            .is_none_or(|(op, _)| op.reference != raw.reference);
        if boundary {
            let operation = UpdateOperation {
                reference: raw.reference,
                updater: raw.updater.clone(),
                fingerprint: raw.fingerprint.clone(),
                date: raw.date,
                kind: raw.kind,
            };
            let follow = visit(&operation);
            current = Some((operation, follow));
        }
        let (operation, follow) = current.as_ref().expect("set on boundary above");
        if *follow == Follow::Skip {
            continue;
        }
        let record = match raw.kind {
            UpdateKind::Vulnerability => {
                let Some(payload) = raw.vuln else {
                    return Err(StoreError::other(format!(
                        "vulnerability record in operation {} has no payload",
                        raw.reference
                    )));
                };
                Record::Vulnerability(serde_json::from_str(payload.get())?)
            }
            UpdateKind::Enrichment => {
                let Some(payload) = raw.enrichment else {
                    return Err(StoreError::other(format!(
                        "enrichment record in operation {} has no payload",
                        raw.reference
                    )));
                };
                Record::Enrichment(serde_json::from_str(payload.get())?)
            }
        };
        each(operation, record)?;
    }
}
