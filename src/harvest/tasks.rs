//! Task bodies: one attempt of a harvest run or of a normalization.
//!
//! Both functions return explicit results; retrying an `Err` is the
//! executor's job. A harvest attempt is safe to re-run from scratch because
//! [`RawRecordStore::put`] is idempotent and only new versions fan out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::model::{HarvestRequest, HarvestWindow, NormalizeJob};
use crate::queue::{QueueError, TaskKind, TaskQueue};
use crate::registry::{SourceEntry, SourceRegistry};
use crate::store::{RawRecordStore, StoreError};
use crate::traits::{GraphSink, HarvestError, NormalizeError, SinkError};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Invalid harvest window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Harvest window reaching back {lookback} from {end} is out of range")]
    WindowOutOfRange {
        end: DateTime<Utc>,
        lookback: chrono::Duration,
    },

    #[error("Harvest failed: {0}")]
    Harvest(#[from] HarvestError),

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Failed to enqueue follow-up task: {0}")]
    Queue(#[from] QueueError),
}

impl TaskError {
    /// Whether the whole task should be run again after the countdown.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Harvest(e) => e.is_retryable(),
            TaskError::Store(StoreError::NotFound(_)) => false,
            TaskError::Store(StoreError::Backend(_)) => true,
            TaskError::Normalize(_) | TaskError::Sink(_) => true,
            // A record stored as new but never enqueued would be skipped as
            // unchanged by a retry; fail loudly instead.
            TaskError::Queue(_) => false,
            TaskError::UnknownSource(_)
            | TaskError::InvalidWindow { .. }
            | TaskError::WindowOutOfRange { .. } => false,
        }
    }
}

/// Everything a task body needs, shared across all workers.
#[derive(Clone)]
pub struct TaskContext {
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<dyn RawRecordStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub sink: Arc<dyn GraphSink>,
    /// Fan out records whose payload did not change.
    pub reprocess_unchanged: bool,
}

impl TaskContext {
    fn entry(&self, source: &str) -> Result<&SourceEntry, TaskError> {
        self.registry
            .get(source)
            .ok_or_else(|| TaskError::UnknownSource(source.to_string()))
    }
}

/// Counters of one successful harvest attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestReport {
    pub source: String,
    pub window: HarvestWindow,
    pub harvested: usize,
    pub new: usize,
    pub unchanged: usize,
    pub enqueued: usize,
}

/// Fills in missing window bounds.
///
/// Without a start the window reaches back `lookback` from the end; without
/// an end it runs up to `now`.
pub fn resolve_window(
    request: &HarvestRequest,
    lookback: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<HarvestWindow, TaskError> {
    let end = request.end.unwrap_or(now);
    let start = match request.start {
        Some(start) => start,
        None => end
            .checked_sub_signed(lookback)
            .ok_or(TaskError::WindowOutOfRange { end, lookback })?,
    };

    if start > end {
        return Err(TaskError::InvalidWindow { start, end });
    }

    Ok(HarvestWindow { start, end })
}

/// Harvests one window for one source, persists every record and fans out
/// a normalize task per new version.
#[instrument(skip(ctx, request), fields(source = %request.source))]
pub async fn run_harvester(
    ctx: &TaskContext,
    request: &HarvestRequest,
) -> Result<HarvestReport, TaskError> {
    let entry = ctx.entry(&request.source)?;
    let window = resolve_window(request, entry.harvester.default_lookback(), Utc::now())?;

    info!(
        start = %window.start,
        end = %window.end,
        "Starting harvester run"
    );

    let mut report = HarvestReport {
        source: request.source.clone(),
        window,
        harvested: 0,
        new: 0,
        unchanged: 0,
        enqueued: 0,
    };

    let mut records = entry.harvester.harvest(window);
    while let Some(record) = records.next().await {
        let record = record?;
        let provider_id = record.provider_id.clone();
        report.harvested += 1;

        let outcome = ctx.store.put(&request.source, record).await?;
        if outcome.is_new {
            report.new += 1;
        } else {
            report.unchanged += 1;
        }

        if outcome.is_new || ctx.reprocess_unchanged {
            let task = ctx
                .queue
                .enqueue(TaskKind::Normalize(NormalizeJob {
                    source: request.source.clone(),
                    raw_id: outcome.id,
                    started_by: request.started_by.clone(),
                }))
                .await?;
            report.enqueued += 1;
            debug!(
                %task,
                raw = %outcome.id,
                provider_id = %provider_id,
                "Started run_normalizer task"
            );
        }
    }

    info!(
        harvested = report.harvested,
        new = report.new,
        unchanged = report.unchanged,
        enqueued = report.enqueued,
        "Collected {} records from {}",
        report.harvested,
        request.source
    );

    Ok(report)
}

/// Normalizes one stored raw record and hands the graph downstream.
#[instrument(skip(ctx, job), fields(source = %job.source, raw = %job.raw_id))]
pub async fn run_normalizer(ctx: &TaskContext, job: &NormalizeJob) -> Result<(), TaskError> {
    let raw = ctx.store.get(job.raw_id).await?;
    let entry = ctx.entry(&job.source)?;

    info!(provider_id = %raw.provider_id, "Starting normalization");
    let graph = entry.normalizer.normalize(&raw).await?;
    debug!(graph = %graph.graph, "Parsed raw record");

    ctx.sink.accept(graph).await?;
    Ok(())
}
