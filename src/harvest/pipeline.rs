//! Running harvest/normalize pipeline.
//!
//! [`Pipeline`] wires a [`SourceRegistry`], a [`RawRecordStore`] and a
//! [`GraphSink`] to an in-process queue and a [`TaskExecutor`]:
//! - Harvest and normalize tasks run as independent units on a bounded pool
//! - Failed attempts are re-enqueued after the retry countdown
//! - Every task's state is tracked in the [`TaskLedger`]

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{PipelineConfig, RuntimeConfig};
use crate::executor::{RetryPolicy, TaskExecutor};
use crate::harvest::tasks::TaskContext;
use crate::ledger::{TaskId, TaskLedger};
use crate::model::{HarvestRequest, NormalizeJob};
use crate::queue::{ChannelQueue, QueueError, TaskKind, TaskQueue};
use crate::registry::{RegistryError, SourceRegistry};
use crate::store::{MemoryStore, RawRecordStore};
use crate::traits::GraphSink;

/// Configures and starts a [`Pipeline`].
///
/// # Example
///
/// ```ignore
/// use scholarly_harvester::{MemoryGraphSink, Pipeline, PipelineConfig, HarvestRequest};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = PipelineConfig::load_default()?;
///     let pipeline = Pipeline::from_config(&config, Arc::new(MemoryGraphSink::new()))?.start();
///
///     pipeline.submit_harvest(HarvestRequest::latest("vivo")).await?;
///     pipeline.wait_idle().await;
///     pipeline.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct PipelineBuilder {
    registry: SourceRegistry,
    sink: Arc<dyn GraphSink>,
    store: Arc<dyn RawRecordStore>,
    runtime: RuntimeConfig,
    retry: Option<RetryPolicy>,
}

impl PipelineBuilder {
    /// Default configuration:
    /// - Store: [`MemoryStore`]
    /// - Runtime: [`RuntimeConfig::default`] (8 workers, 3 retries, 10s countdown)
    pub fn new(registry: SourceRegistry, sink: Arc<dyn GraphSink>) -> Self {
        Self {
            registry,
            sink,
            store: Arc::new(MemoryStore::new()),
            runtime: RuntimeConfig::default(),
            retry: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RawRecordStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Overrides the retry policy derived from the runtime config.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Spawns the executor. Must be called from inside a tokio runtime.
    pub fn start(self) -> Pipeline {
        let ledger = Arc::new(TaskLedger::new());
        let (queue, receiver) = ChannelQueue::new(Arc::clone(&ledger));
        let policy = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from(&self.runtime));

        let ctx = TaskContext {
            registry: Arc::new(self.registry),
            store: Arc::clone(&self.store),
            queue: Arc::new(queue.clone()),
            sink: self.sink,
            reprocess_unchanged: self.runtime.reprocess_unchanged,
        };

        info!(
            sources = ctx.registry.len(),
            workers = self.runtime.worker_concurrency,
            max_retries = policy.max_retries,
            "Starting harvest pipeline"
        );

        let executor = Arc::new(TaskExecutor::new(
            self.runtime.worker_concurrency.max(1),
            policy,
            ctx,
            queue.clone(),
            Arc::clone(&ledger),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(executor.run(receiver, shutdown_rx));

        Pipeline {
            queue,
            ledger,
            store: self.store,
            shutdown,
            worker,
        }
    }
}

pub struct Pipeline {
    queue: ChannelQueue,
    ledger: Arc<TaskLedger>,
    store: Arc<dyn RawRecordStore>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Pipeline {
    pub fn builder(registry: SourceRegistry, sink: Arc<dyn GraphSink>) -> PipelineBuilder {
        PipelineBuilder::new(registry, sink)
    }

    /// Builder with the registry and runtime settings of `config`.
    pub fn from_config(
        config: &PipelineConfig,
        sink: Arc<dyn GraphSink>,
    ) -> Result<PipelineBuilder, RegistryError> {
        let registry = SourceRegistry::from_config(config)?;
        Ok(PipelineBuilder::new(registry, sink).with_runtime(config.runtime.clone()))
    }

    /// Schedules a harvest run; returns as soon as it is queued.
    pub async fn submit_harvest(&self, request: HarvestRequest) -> Result<TaskId, QueueError> {
        self.queue.enqueue(TaskKind::Harvest(request)).await
    }

    /// Schedules normalization of an already stored raw record.
    pub async fn submit_normalize(&self, job: NormalizeJob) -> Result<TaskId, QueueError> {
        self.queue.enqueue(TaskKind::Normalize(job)).await
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn RawRecordStore> {
        &self.store
    }

    /// Waits until every submitted task and everything it fanned out has
    /// succeeded or failed.
    pub async fn wait_idle(&self) {
        self.ledger.wait_idle().await;
    }

    /// Stops dispatching new work and waits for the dispatcher to exit.
    ///
    /// Tasks still waiting in the queue, and retries whose countdown ends
    /// after this point, are marked failed. Running tasks finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.worker.await {
            tracing::warn!("Executor join error: {}", e);
        }
        info!(
            outstanding = self.ledger.outstanding(),
            "Harvest pipeline stopped"
        );
    }
}
