//! Task status bookkeeping.
//!
//! Every enqueued task gets a [`TaskRecord`] that moves through
//! `Pending → Running → {Succeeded, Retrying, Failed}`; `Retrying` goes back
//! to `Running` when the countdown elapses. Failed tasks keep their last error
//! so nothing is dropped without a trace.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// `"run_harvester"` or `"run_normalizer"`.
    pub name: &'static str,
    pub source: String,
    pub started_by: Option<String>,
    pub state: TaskState,
    /// Attempts started so far, including the first.
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub struct TaskLedger {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    next_id: AtomicU64,
    settled: Notify,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLedger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            settled: Notify::new(),
        }
    }

    /// Allocates an id and records the task as pending.
    pub fn register(
        &self,
        name: &'static str,
        source: &str,
        started_by: Option<String>,
    ) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = TaskRecord {
            id,
            name,
            source: source.to_string(),
            started_by,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
        };
        self.with_records(|records| {
            records.insert(id, record);
        });
        id
    }

    pub fn mark_running(&self, id: TaskId, attempt: u32) {
        self.update(id, |record| {
            record.state = TaskState::Running;
            record.attempts = attempt;
        });
    }

    pub fn mark_retrying(&self, id: TaskId, error: String) {
        self.update(id, |record| {
            record.state = TaskState::Retrying;
            record.last_error = Some(error);
        });
    }

    pub fn mark_succeeded(&self, id: TaskId) {
        self.update(id, |record| record.state = TaskState::Succeeded);
        self.settled.notify_waiters();
    }

    pub fn mark_failed(&self, id: TaskId, error: String) {
        self.update(id, |record| {
            record.state = TaskState::Failed;
            record.last_error = Some(error);
        });
        self.settled.notify_waiters();
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.with_records(|records| records.get(&id).cloned())
    }

    /// All records ordered by id.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let mut records = self.with_records(|records| records.values().cloned().collect::<Vec<_>>());
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn count(&self, name: &str, state: TaskState) -> usize {
        self.with_records(|records| {
            records
                .values()
                .filter(|record| record.name == name && record.state == state)
                .count()
        })
    }

    /// Tasks not yet succeeded or failed.
    pub fn outstanding(&self) -> usize {
        self.with_records(|records| {
            records
                .values()
                .filter(|record| !record.state.is_terminal())
                .count()
        })
    }

    /// Resolves once every registered task is terminal.
    ///
    /// A harvest task registers its normalize tasks before it settles, so
    /// this also waits for the whole fan-out of every run.
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.settled.notified();
            if self.outstanding() == 0 {
                return;
            }
            settled.await;
        }
    }

    fn update(&self, id: TaskId, f: impl FnOnce(&mut TaskRecord)) {
        self.with_records(|records| {
            if let Some(record) = records.get_mut(&id) {
                f(record);
            }
        });
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut HashMap<TaskId, TaskRecord>) -> T) -> T {
        // A panic while holding the lock cannot leave a record half-written,
        // so a poisoned map is still consistent.
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut records)
    }
}
