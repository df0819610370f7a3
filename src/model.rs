use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned identifier of one stored raw record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawRecordId(pub u64);

impl fmt::Display for RawRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raw:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Json,
    Xml,
    Other,
}

/// A record as yielded by a harvester, before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestedRecord {
    pub provider_id: String,
    pub payload: Vec<u8>,
    pub format: RecordFormat,
}

impl HarvestedRecord {
    pub fn json(provider_id: impl Into<String>, value: &serde_json::Value) -> Self {
        Self {
            provider_id: provider_id.into(),
            payload: value.to_string().into_bytes(),
            format: RecordFormat::Json,
        }
    }

    pub fn xml(provider_id: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            payload: document.into().into_bytes(),
            format: RecordFormat::Xml,
        }
    }
}

/// One persisted version of a provider record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: RawRecordId,
    pub source: String,
    pub provider_id: String,
    pub payload: Vec<u8>,
    pub format: RecordFormat,
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 of `payload`, hex encoded.
    pub digest: String,
}

/// Resolved `[start, end)` range a harvest run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Input of a harvest task invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestRequest {
    pub source: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub started_by: Option<String>,
}

impl HarvestRequest {
    /// Request for the source's default window.
    pub fn latest(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            start: None,
            end: None,
            started_by: None,
        }
    }

    pub fn between(source: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            start: Some(start),
            end: Some(end),
            started_by: None,
        }
    }

    pub fn started_by(mut self, who: impl Into<String>) -> Self {
        self.started_by = Some(who.into());
        self
    }
}

/// Input of a normalize task invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeJob {
    pub source: String,
    pub raw_id: RawRecordId,
    pub started_by: Option<String>,
}

/// Source-agnostic document graph derived from one raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedGraph {
    pub raw_id: RawRecordId,
    pub source: String,
    pub graph: serde_json::Value,
}
