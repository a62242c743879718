//! `Backend` trait: the task store contract used by `Client`.
//!
//! All times are integer epoch seconds and every method takes `now`
//! explicitly so callers (and tests) control the clock. Implementations
//! must make `acquire` safe under concurrent callers in other processes:
//! a row is handed to at most one caller per lease.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::Compression;
use crate::error::Result;
use crate::task::{ClaimToken, TaskMetadata};

/// Row fields for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub key: String,
    pub task_type: String,
    pub data: Map<String, Value>,
    /// First time the task may be acquired.
    pub run_at: i64,
    pub resource: Option<String>,
    pub max_running: Option<i64>,
    pub compression: Compression,
}

/// Optional payload overwrite and optimistic check for a heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatParams<'a> {
    /// New payload written together with the lease extension.
    pub data: Option<&'a Map<String, Value>>,
    /// Require the stored lease to still be the one this token last wrote.
    pub strict: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Create or upgrade the task table. `force` drops existing rows first.
    async fn init_database(&self, force: bool) -> Result<()>;

    // ── Submission ──────────────────────────────────────────────────

    /// Insert a task. `AlreadyExists` when a live row has the same key.
    async fn submit(&self, task: NewTask, now: i64) -> Result<()>;

    // ── Acquisition ─────────────────────────────────────────────────

    /// Claim up to `max_acquire` due tasks for `alive_time` seconds.
    /// An empty vector means no work, never an error.
    async fn acquire(
        &self,
        alive_time: i64,
        max_acquire: usize,
        now: i64,
    ) -> Result<Vec<(TaskMetadata, ClaimToken)>>;

    // ── Lease maintenance ───────────────────────────────────────────

    /// Extend the lease to `now + alive_time`.
    ///
    /// `Preempted` when the row is gone, finished, or (strict) re-leased by
    /// someone else; `CancelRequested` when cancellation was requested.
    async fn heartbeat(
        &self,
        token: &ClaimToken,
        alive_time: i64,
        now: i64,
        params: HeartbeatParams<'_>,
    ) -> Result<()>;

    // ── Termination ─────────────────────────────────────────────────

    /// Mark finished, keeping the row queryable for `retention_time`.
    /// `AlreadyFinished` when already finished or gone.
    async fn finish(&self, token: &ClaimToken, retention_time: i64, now: i64) -> Result<()>;

    /// `finish` by key, ignoring lease ownership.
    async fn force_finish(&self, key: &str, retention_time: i64, now: i64) -> Result<()>;

    /// Flag a claimed task for cancellation. `AlreadyFinished` when not claimed.
    async fn cancel_request(&self, key: &str, now: i64) -> Result<()>;

    // ── Queries ─────────────────────────────────────────────────────

    /// Snapshot of one task. `NotFound` when missing or past retention.
    async fn get_task_metadata(&self, key: &str, now: i64) -> Result<TaskMetadata>;

    /// All rows, ordered by ascending timeout.
    async fn list(&self, now: i64) -> Result<Vec<TaskMetadata>>;

    /// Overwrite the payload of an active (not finished) task.
    async fn update_data(
        &self,
        key: &str,
        data: Map<String, Value>,
        compression: Compression,
    ) -> Result<()>;
}
