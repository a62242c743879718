//! Task handles and row snapshots.
//!
//! `Task` carries only a key. `TaskWithMetadata` adds a snapshot of the row
//! taken when it was read. `AcquiredTask` adds the claim token and the
//! lease operations. None of these are persisted; they are rebuilt on every
//! query or claim.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::{Client, FinishOptions, HeartbeatOptions};
use crate::error::{Result, TaskError};

/// `created_at` value marking a task whose cancellation was requested.
pub const CANCEL_REQUESTED_MARKER: i64 = -1;

/// Lifecycle state derived from `created_at` and `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    CancelRequested,
    Finished,
}

impl TaskStatus {
    /// Derive the status of a row as seen at `now`.
    pub fn from_row(created_at: Option<i64>, timeout: i64, now: i64) -> Self {
        match created_at {
            None => TaskStatus::Finished,
            Some(c) if c <= 0 => TaskStatus::CancelRequested,
            Some(_) if timeout <= now => TaskStatus::Waiting,
            Some(_) => TaskStatus::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::CancelRequested => "cancel_requested",
            TaskStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub key: String,
    pub status: TaskStatus,
    /// Task type from the payload's `type` field, or the key prefix before the first `.`.
    pub task_type: String,
    pub data: Map<String, Value>,
    /// Concurrency group.
    pub resource: Option<String>,
    pub max_running: Option<i64>,
    /// Raw `timeout` column: run-at, lease expiry, or encoded deletion deadline.
    pub timeout: i64,
    /// Original submit time; `None` once finished.
    pub created_at: Option<i64>,
}

impl TaskMetadata {
    pub fn new(
        key: String,
        data: Map<String, Value>,
        timeout: i64,
        created_at: Option<i64>,
        resource: Option<String>,
        max_running: Option<i64>,
        now: i64,
    ) -> Self {
        let task_type = task_type_of(&key, &data);
        Self {
            status: TaskStatus::from_row(created_at, timeout, now),
            key,
            task_type,
            data,
            resource,
            max_running,
            timeout,
            created_at: created_at.filter(|c| *c > 0),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == TaskStatus::Finished
    }

    pub fn is_waiting(&self) -> bool {
        self.status == TaskStatus::Waiting
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.status == TaskStatus::CancelRequested
    }
}

fn task_type_of(key: &str, data: &Map<String, Value>) -> String {
    match data.get("type") {
        Some(Value::String(t)) => t.clone(),
        _ => key.split('.').next().unwrap_or(key).to_string(),
    }
}

/// Capability for one outstanding lease.
///
/// Remembers the lease expiry written by the last successful claim or
/// heartbeat so strict heartbeats can detect a competing claimant.
#[derive(Debug)]
pub struct ClaimToken {
    key: String,
    timeout: AtomicI64,
}

impl ClaimToken {
    pub fn new(key: impl Into<String>, timeout: i64) -> Self {
        Self {
            key: key.into(),
            timeout: AtomicI64::new(timeout),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease expiry this holder last wrote.
    pub fn last_timeout(&self) -> i64 {
        self.timeout.load(Ordering::Acquire)
    }

    pub(crate) fn renewed(&self, timeout: i64) {
        self.timeout.store(timeout, Ordering::Release);
    }
}

/// A task addressed by key.
#[derive(Clone)]
pub struct Task {
    client: Client,
    key: String,
}

impl Task {
    pub fn new(client: Client, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn metadata(&self) -> Result<TaskMetadata> {
        self.client.get_task_metadata(&self.key, None).await
    }

    /// True unless the row is gone or past its retention.
    pub async fn exists(&self) -> Result<bool> {
        match self.metadata().await {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.task_error(), Some(TaskError::NotFound { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_request(&self) -> Result<()> {
        self.client.cancel_request(&self.key, None).await
    }

    pub async fn force_finish(&self, options: FinishOptions) -> Result<()> {
        self.client.force_finish(&self.key, options).await
    }

    /// Overwrite the payload of an active task.
    pub async fn update_data(&self, data: Map<String, Value>) -> Result<()> {
        self.client.update_data(&self.key, data).await
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("key", &self.key).finish()
    }
}

/// A task plus the row snapshot it was read with.
#[derive(Clone)]
pub struct TaskWithMetadata {
    task: Task,
    metadata: TaskMetadata,
}

impl TaskWithMetadata {
    pub fn new(client: Client, metadata: TaskMetadata) -> Self {
        Self {
            task: Task::new(client, metadata.key.clone()),
            metadata,
        }
    }

    pub fn attributes(&self) -> &TaskMetadata {
        &self.metadata
    }

    pub fn task_type(&self) -> &str {
        &self.metadata.task_type
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.metadata.data
    }

    pub fn status(&self) -> TaskStatus {
        self.metadata.status
    }
}

impl Deref for TaskWithMetadata {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl fmt::Debug for TaskWithMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWithMetadata")
            .field("key", &self.task.key)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A task this caller holds the lease for.
pub struct AcquiredTask {
    inner: TaskWithMetadata,
    token: ClaimToken,
}

impl AcquiredTask {
    pub fn new(client: Client, metadata: TaskMetadata, token: ClaimToken) -> Self {
        Self {
            inner: TaskWithMetadata::new(client, metadata),
            token,
        }
    }

    pub fn token(&self) -> &ClaimToken {
        &self.token
    }

    /// Extend the lease.
    pub async fn heartbeat(&self, options: HeartbeatOptions) -> Result<()> {
        self.client().heartbeat(&self.token, options).await
    }

    pub async fn finish(&self, options: FinishOptions) -> Result<()> {
        self.client().finish(&self.token, options).await
    }

    /// Give the lease back immediately without finishing.
    pub async fn release(&self) -> Result<()> {
        self.client().release(&self.token, None).await
    }

    /// Give the lease back and delay re-acquisition by the retry wait.
    pub async fn retry(&self) -> Result<()> {
        self.client().retry(&self.token, None).await
    }
}

impl Deref for AcquiredTask {
    type Target = TaskWithMetadata;

    fn deref(&self) -> &TaskWithMetadata {
        &self.inner
    }
}

impl fmt::Debug for AcquiredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredTask")
            .field("key", &self.key())
            .field("task_type", &self.task_type())
            .field("lease_until", &self.token.last_timeout())
            .finish()
    }
}
