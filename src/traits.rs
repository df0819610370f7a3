use crate::model::{HarvestWindow, HarvestedRecord, NormalizedGraph, RawRecord};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("Upstream rate limit exceeded")]
    RateLimited,
    #[error("Failed to parse upstream response: {0}")]
    Parse(String),
    #[error("Upstream rejected request with {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("Harvester misconfigured: {0}")]
    Config(String),
}

impl HarvestError {
    /// Whether retrying the whole harvest call can succeed.
    ///
    /// Parse failures count as transient: some providers intermittently
    /// serve truncated or malformed documents.
    pub fn is_retryable(&self) -> bool {
        match self {
            HarvestError::Network(_)
            | HarvestError::Upstream { .. }
            | HarvestError::RateLimited
            | HarvestError::Parse(_) => true,
            HarvestError::Rejected { .. } | HarvestError::Config(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Mapping failed: {0}")]
    Mapping(String),
    #[error("Dependency failed: {0}")]
    Dependency(String),
}

#[derive(Error, Debug)]
#[error("Graph sink rejected graph: {0}")]
pub struct SinkError(pub String);

/// Lazy sequence of harvested records; the first `Err` ends the harvest.
pub type RecordStream<'a> = BoxStream<'a, Result<HarvestedRecord, HarvestError>>;

/// A provider-specific fetcher of raw records.
pub trait Harvester: Send + Sync {
    /// Source identifier this harvester serves (e.g., "vivo", "iacr").
    fn source(&self) -> &str;

    /// Window length used when a request names no start.
    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(1)
    }

    /// Yields every record the upstream reports inside `window`, each
    /// provider id at most once.
    fn harvest(&self, window: HarvestWindow) -> RecordStream<'_>;
}

/// Turns one raw record into a normalized graph.
#[async_trait]
pub trait Normalizer: Send + Sync {
    async fn normalize(&self, raw: &RawRecord) -> Result<NormalizedGraph, NormalizeError>;
}

/// Downstream consumer of normalized graphs.
#[async_trait]
pub trait GraphSink: Send + Sync {
    async fn accept(&self, graph: NormalizedGraph) -> Result<(), SinkError>;
}
