//! Shared data model for the vulnerability feed pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which store path an update targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Vulnerability,
    Enrichment,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::Vulnerability => write!(f, "vulnerability"),
            UpdateKind::Enrichment => write!(f, "enrichment"),
        }
    }
}

impl FromStr for UpdateKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "vulnerability" => Ok(UpdateKind::Vulnerability),
            "enrichment" => Ok(UpdateKind::Enrichment),
            other => Err(format!("unsupported update kind '{other}'")),
        }
    }
}

/// Opaque token describing the state of an upstream feed.
///
/// Produced by an updater's fetch step and compared literally on the next
/// run to decide whether re-parsing is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// One recorded ingest of a feed by one updater.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateOperation {
    #[serde(rename = "ref")]
    pub reference: Uuid,
    pub updater: String,
    pub fingerprint: Fingerprint,
    pub date: DateTime<Utc>,
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Unknown,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Unknown => "unknown",
            Severity::Negligible => "negligible",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Affected package as reported by a feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A single vulnerability record emitted by an updater's parse step.
///
/// The persistent store schema is external to this workspace; this is the
/// wire shape exchanged between updaters, the orchestrator, and the offline
/// recording store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vulnerability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    pub package: Package,
    #[serde(default)]
    pub fixed_in_version: Option<String>,
    #[serde(default)]
    pub issued: Option<DateTime<Utc>>,
}

/// An enrichment record: free-form JSON addressed by tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrichmentRecord {
    #[serde(default)]
    pub tags: Vec<String>,
    pub enrichment: serde_json::Value,
}
