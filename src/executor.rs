use crate::config::RuntimeConfig;
use crate::harvest::tasks::{run_harvester, run_normalizer, TaskContext, TaskError};
use crate::ledger::TaskLedger;
use crate::queue::{ChannelQueue, TaskKind, TaskMessage};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, instrument, warn};

/// How failed tasks are re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed delay before each retry.
    pub countdown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for RetryPolicy {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            max_retries: runtime.max_retries,
            countdown: runtime.retry_countdown(),
        }
    }
}

impl RetryPolicy {
    /// Whether a task whose `attempt`-th run failed gets another one.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Drains the task queue onto a bounded pool of tokio tasks.
pub struct TaskExecutor {
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    ctx: TaskContext,
    queue: ChannelQueue,
    ledger: Arc<TaskLedger>,
}

impl TaskExecutor {
    pub fn new(
        concurrency_limit: usize,
        policy: RetryPolicy,
        ctx: TaskContext,
        queue: ChannelQueue,
        ledger: Arc<TaskLedger>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            policy,
            ctx,
            queue,
            ledger,
        }
    }

    /// Dispatches messages until `shutdown` flips to `true`.
    ///
    /// Tasks already running are left to finish on their own; tasks still
    /// queued are marked failed.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<TaskMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Task executor started");
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                message = receiver.recv() => message,
            };
            let Some(message) = message else {
                break;
            };

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.abandon(message);
                    break;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Semaphore error: {}", e);
                    self.ledger.mark_failed(message.id, e.to_string());
                    break;
                }
            };

            let executor = Arc::clone(&self);
            tokio::spawn(async move {
                let id = message.id;
                if let Err(panic) = AssertUnwindSafe(executor.execute(message))
                    .catch_unwind()
                    .await
                {
                    let reason = panic_message(panic.as_ref());
                    error!(task = %id, panic = %reason, "Task panicked");
                    executor
                        .ledger
                        .mark_failed(id, format!("task panicked: {reason}"));
                }
                drop(permit);
            });
        }

        receiver.close();
        while let Ok(message) = receiver.try_recv() {
            self.abandon(message);
        }
        info!("Task executor stopped");
    }

    fn abandon(&self, message: TaskMessage) {
        warn!(task = %message.id, name = message.kind.name(), "Dropping queued task on shutdown");
        self.ledger
            .mark_failed(message.id, "pipeline shut down before the task ran".to_string());
    }

    #[instrument(
        skip(self, message),
        fields(task = %message.id, name = message.kind.name(), attempt = message.attempt)
    )]
    async fn execute(&self, message: TaskMessage) {
        self.ledger.mark_running(message.id, message.attempt);

        let result = match &message.kind {
            TaskKind::Harvest(request) => run_harvester(&self.ctx, request).await.map(|_| ()),
            TaskKind::Normalize(job) => run_normalizer(&self.ctx, job).await,
        };

        match result {
            Ok(()) => self.ledger.mark_succeeded(message.id),
            Err(err) => self.handle_failure(message, err),
        }
    }

    fn handle_failure(&self, message: TaskMessage, err: TaskError) {
        if !err.is_retryable() {
            error!(error = %err, "Task failed permanently");
            self.ledger.mark_failed(message.id, err.to_string());
            return;
        }

        if !self.policy.allows_retry(message.attempt) {
            error!(error = %err, "Task failed after exhausting retries");
            self.ledger.mark_failed(message.id, err.to_string());
            return;
        }

        warn!(
            error = %err,
            countdown_ms = self.policy.countdown.as_millis() as u64,
            "Task failed, retrying"
        );
        self.ledger.mark_retrying(message.id, err.to_string());

        // The countdown runs off the worker pool so a backing-off task does
        // not hold a permit.
        let queue = self.queue.clone();
        let ledger = Arc::clone(&self.ledger);
        let countdown = self.policy.countdown;
        tokio::spawn(async move {
            tokio::time::sleep(countdown).await;
            let id = message.id;
            let retry = TaskMessage {
                attempt: message.attempt + 1,
                ..message
            };
            if let Err(e) = queue.requeue(retry) {
                ledger.mark_failed(id, e.to_string());
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
