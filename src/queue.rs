//! Task queue seam.
//!
//! [`TaskQueue`] is what task bodies see when they fan out work. The bundled
//! [`ChannelQueue`] is an in-process broker backed by a tokio channel and
//! drained by [`TaskExecutor`](crate::executor::TaskExecutor).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ledger::{TaskId, TaskLedger};
use crate::model::{HarvestRequest, NormalizeJob};

pub const HARVEST_TASK: &str = "run_harvester";
pub const NORMALIZE_TASK: &str = "run_normalizer";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task queue is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    Harvest(HarvestRequest),
    Normalize(NormalizeJob),
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Harvest(_) => HARVEST_TASK,
            TaskKind::Normalize(_) => NORMALIZE_TASK,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            TaskKind::Harvest(request) => &request.source,
            TaskKind::Normalize(job) => &job.source,
        }
    }

    pub fn started_by(&self) -> Option<&str> {
        match self {
            TaskKind::Harvest(request) => request.started_by.as_deref(),
            TaskKind::Normalize(job) => job.started_by.as_deref(),
        }
    }
}

/// One delivery of a task to a worker.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub id: TaskId,
    /// 1 for the first delivery, incremented on every retry.
    pub attempt: u32,
    pub kind: TaskKind,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedules `kind` and returns without waiting for it to run.
    async fn enqueue(&self, kind: TaskKind) -> Result<TaskId, QueueError>;
}

#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<TaskMessage>,
    ledger: Arc<TaskLedger>,
}

impl ChannelQueue {
    pub fn new(ledger: Arc<TaskLedger>) -> (Self, mpsc::UnboundedReceiver<TaskMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, ledger }, receiver)
    }

    /// Redelivers an already registered task.
    pub(crate) fn requeue(&self, message: TaskMessage) -> Result<(), QueueError> {
        self.sender.send(message).map_err(|_| QueueError::Closed)
    }
}

#[async_trait]
impl TaskQueue for ChannelQueue {
    async fn enqueue(&self, kind: TaskKind) -> Result<TaskId, QueueError> {
        let id = self.ledger.register(
            kind.name(),
            kind.source(),
            kind.started_by().map(str::to_string),
        );

        let message = TaskMessage {
            id,
            attempt: 1,
            kind,
        };

        if self.sender.send(message).is_err() {
            self.ledger.mark_failed(id, QueueError::Closed.to_string());
            return Err(QueueError::Closed);
        }

        Ok(id)
    }
}
