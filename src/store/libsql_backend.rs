//! libSQL backend: `Backend` implementation over a single task table.
//!
//! Claims run inside `BEGIN IMMEDIATE` transactions, which take SQLite's
//! write lock, and every claim is additionally a compare-and-swap on the
//! row's previous `timeout`. Several processes can therefore share one
//! database file and still never hand the same lease out twice.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, Value, params};
use rand::Rng;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ClientConfig, Compression};
use crate::error::{DatabaseError, Error, Result, TaskError};
use crate::store::traits::{Backend, HeartbeatParams, NewTask};
use crate::store::{codec, migrations};
use crate::task::{CANCEL_REQUESTED_MARKER, ClaimToken, TaskMetadata};

/// Offset subtracted from the deletion deadline of finished rows so it can
/// never be mistaken for a live run-at or lease time.
pub const DELETE_OFFSET: i64 = 1_000_000_000;

/// Attempts for an operation that keeps hitting lock contention.
const MAX_RETRY: u32 = 10;

/// Candidate rows read per page, as a multiple of the batch size.
const MAX_SELECT_ROW: usize = 8;

/// Upper bound on rows scanned per acquire page.
const MAX_PAGE_ROWS: usize = 1024;

const COLUMNS: &str = "id, timeout, data, created_at, resource, max_running";

/// libSQL task store.
///
/// One connection per backend. `op_lock` serializes operations on it so a
/// transaction never interleaves with another statement from this process.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    op_lock: Mutex<()>,
    table: String,
    cleanup_interval: u32,
    retention_time: i64,
    acquire_count: AtomicU32,
}

impl LibSqlBackend {
    /// Open the database named by `config.database` and migrate the task table.
    pub async fn open(config: &ClientConfig) -> Result<Self> {
        let built = if config.database == ":memory:" {
            libsql::Builder::new_local(":memory:").build().await
        } else {
            let path = Path::new(&config.database);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
            libsql::Builder::new_local(path).build().await
        };
        let db = built
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        if config.database != ":memory:" {
            // Both pragmas return a row, so they go through `query`.
            for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA busy_timeout = 5000"] {
                conn.query(pragma, ())
                    .await
                    .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
            }
        }

        let backend = Self {
            db: Arc::new(db),
            conn,
            op_lock: Mutex::new(()),
            table: config.table.clone(),
            cleanup_interval: config.cleanup_interval.max(1),
            retention_time: config.retention_time,
            acquire_count: AtomicU32::new(0),
        };
        backend.init_database(false).await?;
        info!(database = %config.database, table = %backend.table, "Task store opened");
        Ok(backend)
    }

    /// Open (or create) a local database file with default settings.
    pub async fn new_local(path: &Path) -> Result<Self> {
        Self::open(&ClientConfig {
            database: path.to_string_lossy().into_owned(),
            ..ClientConfig::default()
        })
        .await
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self> {
        Self::open(&ClientConfig {
            database: ":memory:".to_string(),
            ..ClientConfig::default()
        })
        .await
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Run `attempt` until it succeeds or fails with something other than
    /// lock contention, sleeping a short jittered delay between tries.
    async fn retrying<T, F, Fut>(&self, op: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tries = 0;
        loop {
            match attempt().await {
                Err(Error::Database(e)) if e.is_transient() && tries < MAX_RETRY => {
                    tries += 1;
                    let delay = rand::thread_rng().gen_range(50..=500);
                    warn!(op, attempt = tries, error = %e, "Store busy, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                other => return other,
            }
        }
    }

    async fn acquire_once(
        &self,
        alive_time: i64,
        max_acquire: usize,
        now: i64,
        cleanup: bool,
    ) -> Result<Vec<(TaskMetadata, ClaimToken)>> {
        let _guard = self.op_lock.lock().await;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::from_libsql("acquire begin", e))?;

        match self.claim_rows(&tx, alive_time, max_acquire, now, cleanup).await {
            Ok(claimed) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::from_libsql("acquire commit", e))?;
                Ok(claimed)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn claim_rows(
        &self,
        conn: &Connection,
        alive_time: i64,
        max_acquire: usize,
        now: i64,
        cleanup: bool,
    ) -> Result<Vec<(TaskMetadata, ClaimToken)>> {
        let table = &self.table;
        if cleanup {
            self.cleanup(conn, now).await?;
        }

        let mut running = running_per_resource(conn, table, now).await?;

        let next_timeout = now + alive_time;
        let owner = Uuid::new_v4().to_string();
        let page_size = max_acquire.saturating_mul(MAX_SELECT_ROW).min(MAX_PAGE_ROWS) as i64;
        let mut claimed_keys: Vec<String> = Vec::with_capacity(max_acquire.min(MAX_PAGE_ROWS));
        let mut cursor: Option<(i64, String)> = None;

        'pages: loop {
            let mut rows = match &cursor {
                None => conn
                    .query(
                        &format!(
                            "SELECT {COLUMNS} FROM {table}
                             WHERE timeout <= ?1 AND created_at > 0
                             ORDER BY timeout ASC, id ASC LIMIT ?2"
                        ),
                        params![now, page_size],
                    )
                    .await,
                Some((last_timeout, last_id)) => conn
                    .query(
                        &format!(
                            "SELECT {COLUMNS} FROM {table}
                             WHERE timeout <= ?1 AND created_at > 0
                               AND (timeout > ?3 OR (timeout = ?3 AND id > ?4))
                             ORDER BY timeout ASC, id ASC LIMIT ?2"
                        ),
                        params![now, page_size, *last_timeout, last_id.clone()],
                    )
                    .await,
            }
            .map_err(|e| DatabaseError::from_libsql("acquire select", e))?;

            let mut page = Vec::new();
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::from_libsql("acquire select", e))?
            {
                page.push(read_row(&row)?);
            }
            let exhausted = (page.len() as i64) < page_size;

            for candidate in page {
                cursor = Some((candidate.timeout, candidate.id.clone()));

                if let (Some(resource), Some(max_running)) =
                    (&candidate.resource, candidate.max_running)
                {
                    let count = running.get(resource).copied().unwrap_or(0);
                    if count >= max_running {
                        continue;
                    }
                }

                let n = conn
                    .execute(
                        &format!(
                            "UPDATE {table} SET timeout = ?1, owner = ?2
                             WHERE id = ?3 AND timeout = ?4 AND created_at > 0"
                        ),
                        params![next_timeout, owner.clone(), candidate.id.clone(), candidate.timeout],
                    )
                    .await
                    .map_err(|e| DatabaseError::from_libsql("acquire update", e))?;
                if n == 0 {
                    continue;
                }

                if let Some(resource) = &candidate.resource {
                    *running.entry(resource.clone()).or_insert(0) += 1;
                }
                claimed_keys.push(candidate.id);
                if claimed_keys.len() >= max_acquire {
                    break 'pages;
                }
            }

            if exhausted {
                break;
            }
        }

        if claimed_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows = conn
            .query(
                &format!("SELECT {COLUMNS} FROM {table} WHERE owner = ?1"),
                params![owner],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("acquire fetch", e))?;

        let mut won = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("acquire fetch", e))?
        {
            let raw = read_row(&row)?;
            won.insert(raw.id.clone(), raw);
        }

        let mut claimed = Vec::with_capacity(claimed_keys.len());
        for key in claimed_keys {
            if let Some(raw) = won.remove(&key) {
                let token = ClaimToken::new(key, raw.timeout);
                claimed.push((raw.into_metadata(now)?, token));
            }
        }
        debug!(count = claimed.len(), next_timeout, "Tasks acquired");
        Ok(claimed)
    }

    /// Delete finished rows past retention and finish cancel-requested rows
    /// whose lease ran out without the holder acknowledging.
    async fn cleanup(&self, conn: &Connection, now: i64) -> Result<()> {
        let table = &self.table;
        let deleted = conn
            .execute(
                &format!("DELETE FROM {table} WHERE created_at IS NULL AND timeout < ?1"),
                params![now - DELETE_OFFSET],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("cleanup delete", e))?;

        let abandoned = conn
            .execute(
                &format!(
                    "UPDATE {table} SET timeout = ?1, created_at = NULL, resource = NULL, owner = NULL
                     WHERE created_at = ?2 AND timeout <= ?3"
                ),
                params![
                    now + self.retention_time - DELETE_OFFSET,
                    CANCEL_REQUESTED_MARKER,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("cleanup cancelled", e))?;

        if deleted > 0 || abandoned > 0 {
            debug!(deleted, abandoned, "Task table cleaned up");
        }
        Ok(())
    }

    async fn select_row(&self, key: &str) -> Result<Option<RawRow>> {
        let table = &self.table;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {COLUMNS} FROM {table} WHERE id = ?1"),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("select task", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(read_row(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("select task", e).into()),
        }
    }

    async fn heartbeat_once(
        &self,
        token: &ClaimToken,
        next_timeout: i64,
        params: HeartbeatParams<'_>,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let table = &self.table;
        let key = token.key();

        let mut sql = format!("UPDATE {table} SET timeout = ?1");
        let mut values = vec![Value::Integer(next_timeout), Value::Text(key.to_string())];
        if let Some(data) = data {
            sql.push_str(", data = ?3");
            values.push(Value::Blob(data));
        }
        sql.push_str(" WHERE id = ?2 AND created_at > 0");
        if params.strict {
            sql.push_str(&format!(" AND timeout = ?{}", values.len() + 1));
            values.push(Value::Integer(token.last_timeout()));
        }

        let n = self
            .conn
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::from_libsql("heartbeat", e))?;
        if n > 0 {
            token.renewed(next_timeout);
            return Ok(());
        }

        match self.select_row(key).await? {
            None => Err(preempted(key, "task no longer exists")),
            Some(row) => match row.created_at {
                None => Err(preempted(key, "task is already finished")),
                Some(c) if c <= 0 => Err(TaskError::CancelRequested {
                    key: key.to_string(),
                }
                .into()),
                Some(_) => Err(preempted(key, "lease was taken over by another worker")),
            },
        }
    }

    async fn finish_once(&self, key: &str, retention_time: i64, now: i64) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let table = &self.table;
        let n = self
            .conn
            .execute(
                &format!(
                    "UPDATE {table} SET timeout = ?1, created_at = NULL, resource = NULL, owner = NULL
                     WHERE id = ?2 AND created_at IS NOT NULL"
                ),
                params![now + retention_time - DELETE_OFFSET, key],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("finish", e))?;

        if n == 0 {
            return Err(TaskError::AlreadyFinished {
                key: key.to_string(),
            }
            .into());
        }
        debug!(task = %key, "Task finished");
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Task row as stored.
struct RawRow {
    id: String,
    timeout: i64,
    data: Vec<u8>,
    created_at: Option<i64>,
    resource: Option<String>,
    max_running: Option<i64>,
}

impl RawRow {
    fn into_metadata(self, now: i64) -> Result<TaskMetadata> {
        let data = codec::decode(&self.data)?;
        Ok(TaskMetadata::new(
            self.id,
            data,
            self.timeout,
            self.created_at,
            self.resource,
            self.max_running,
            now,
        ))
    }

    /// Finished and past retention: logically deleted.
    fn is_expired(&self, now: i64) -> bool {
        self.created_at.is_none() && self.timeout < now - DELETE_OFFSET
    }
}

/// Parse a row selected with `COLUMNS`.
fn read_row(row: &libsql::Row) -> Result<RawRow> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let timeout: i64 = row.get(1).map_err(parse)?;
    let data = match row.get_value(2).map_err(parse)? {
        Value::Blob(b) => b,
        Value::Text(s) => s.into_bytes(),
        _ => Vec::new(),
    };
    let created_at = opt_int(row.get_value(3).map_err(parse)?);
    let resource = match row.get_value(4).map_err(parse)? {
        Value::Text(s) => Some(s),
        _ => None,
    };
    let max_running = opt_int(row.get_value(5).map_err(parse)?);
    Ok(RawRow {
        id,
        timeout,
        data,
        created_at,
        resource,
        max_running,
    })
}

fn opt_int(v: Value) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(i),
        _ => None,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_integer(i: Option<i64>) -> Value {
    match i {
        Some(i) => Value::Integer(i),
        None => Value::Null,
    }
}

fn preempted(key: &str, reason: &str) -> Error {
    TaskError::Preempted {
        key: key.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Currently leased rows per resource label.
async fn running_per_resource(
    conn: &Connection,
    table: &str,
    now: i64,
) -> Result<HashMap<String, i64>> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT resource, COUNT(*) FROM {table}
                 WHERE resource IS NOT NULL AND created_at IS NOT NULL AND timeout > ?1
                 GROUP BY resource"
            ),
            params![now],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("running count", e))?;

    let mut counts = HashMap::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql("running count", e))?
    {
        let resource: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("running count parse: {e}")))?;
        let count: i64 = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("running count parse: {e}")))?;
        counts.insert(resource, count);
    }
    Ok(counts)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Backend for LibSqlBackend {
    async fn init_database(&self, force: bool) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if force {
            let table = &self.table;
            self.conn
                .execute(&format!("DROP TABLE IF EXISTS {table}"), ())
                .await
                .map_err(|e| DatabaseError::Migration(format!("drop {table}: {e}")))?;
            // The tracking table may not exist yet.
            let _ = self
                .conn
                .execute(
                    "DELETE FROM _migrations WHERE table_name = ?1",
                    params![table.as_str()],
                )
                .await;
            info!(table = %table, "Task table dropped");
        }
        migrations::run_migrations(&self.conn, &self.table).await?;
        Ok(())
    }

    async fn submit(&self, task: NewTask, now: i64) -> Result<()> {
        let mut data = task.data;
        data.insert("type".to_string(), JsonValue::String(task.task_type));
        let blob = codec::encode(&data, task.compression)?;

        let key = task.key;
        let (id, blob) = (key.as_str(), blob.as_slice());
        let (run_at, created_at) = (task.run_at, task.run_at.max(1));
        let (resource, max_running) = (task.resource.as_deref(), task.max_running);
        let table = &self.table;

        let n = self
            .retrying("submit", || async move {
                let _guard = self.op_lock.lock().await;
                self.conn
                    .execute(
                        &format!(
                            "INSERT INTO {table} (id, timeout, data, created_at, resource, max_running)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                             ON CONFLICT(id) DO UPDATE SET
                                timeout = excluded.timeout,
                                data = excluded.data,
                                created_at = excluded.created_at,
                                resource = excluded.resource,
                                max_running = excluded.max_running,
                                owner = NULL
                             WHERE {table}.created_at IS NULL AND {table}.timeout < ?7"
                        ),
                        params![
                            id,
                            run_at,
                            Value::Blob(blob.to_vec()),
                            created_at,
                            opt_text(resource),
                            opt_integer(max_running),
                            now - DELETE_OFFSET
                        ],
                    )
                    .await
                    .map_err(|e| Error::from(DatabaseError::from_libsql("submit", e)))
            })
            .await?;

        if n == 0 {
            return Err(TaskError::AlreadyExists { key }.into());
        }
        debug!(task = %key, run_at, "Task submitted");
        Ok(())
    }

    async fn acquire(
        &self,
        alive_time: i64,
        max_acquire: usize,
        now: i64,
    ) -> Result<Vec<(TaskMetadata, ClaimToken)>> {
        if max_acquire == 0 {
            return Ok(Vec::new());
        }
        let count = self.acquire_count.fetch_add(1, Ordering::Relaxed);
        let cleanup = count % self.cleanup_interval == 0;
        self.retrying("acquire", || {
            self.acquire_once(alive_time, max_acquire, now, cleanup)
        })
        .await
    }

    async fn heartbeat(
        &self,
        token: &ClaimToken,
        alive_time: i64,
        now: i64,
        params: HeartbeatParams<'_>,
    ) -> Result<()> {
        let data = match params.data {
            Some(data) => Some(codec::encode(data, Compression::None)?),
            None => None,
        };
        let next_timeout = now + alive_time;
        self.retrying("heartbeat", || {
            self.heartbeat_once(token, next_timeout, params, data.clone())
        })
        .await
    }

    async fn finish(&self, token: &ClaimToken, retention_time: i64, now: i64) -> Result<()> {
        self.retrying("finish", || self.finish_once(token.key(), retention_time, now))
            .await
    }

    async fn force_finish(&self, key: &str, retention_time: i64, now: i64) -> Result<()> {
        self.retrying("force_finish", || self.finish_once(key, retention_time, now))
            .await?;
        info!(task = %key, "Task force-finished");
        Ok(())
    }

    async fn cancel_request(&self, key: &str, now: i64) -> Result<()> {
        let table = &self.table;
        let n = self
            .retrying("cancel_request", || async move {
                let _guard = self.op_lock.lock().await;
                self.conn
                    .execute(
                        &format!(
                            "UPDATE {table} SET created_at = ?1
                             WHERE id = ?2 AND created_at > 0 AND timeout > ?3"
                        ),
                        params![CANCEL_REQUESTED_MARKER, key, now],
                    )
                    .await
                    .map_err(|e| Error::from(DatabaseError::from_libsql("cancel_request", e)))
            })
            .await?;

        if n == 0 {
            return Err(TaskError::AlreadyFinished {
                key: key.to_string(),
            }
            .into());
        }
        info!(task = %key, "Cancellation requested");
        Ok(())
    }

    async fn get_task_metadata(&self, key: &str, now: i64) -> Result<TaskMetadata> {
        let row = {
            let _guard = self.op_lock.lock().await;
            self.select_row(key).await?
        };
        match row {
            Some(row) if !row.is_expired(now) => row.into_metadata(now),
            _ => Err(TaskError::NotFound {
                key: key.to_string(),
            }
            .into()),
        }
    }

    async fn list(&self, now: i64) -> Result<Vec<TaskMetadata>> {
        let _guard = self.op_lock.lock().await;
        let table = &self.table;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM {table}
                     WHERE NOT (created_at IS NULL AND timeout < ?1)
                     ORDER BY timeout ASC, id ASC"
                ),
                params![now - DELETE_OFFSET],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list", e))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list", e))?
        {
            tasks.push(read_row(&row)?.into_metadata(now)?);
        }
        Ok(tasks)
    }

    async fn update_data(
        &self,
        key: &str,
        data: Map<String, JsonValue>,
        compression: Compression,
    ) -> Result<()> {
        let blob = codec::encode(&data, compression)?;
        let _guard = self.op_lock.lock().await;
        let table = &self.table;
        let n = self
            .conn
            .execute(
                &format!("UPDATE {table} SET data = ?1 WHERE id = ?2 AND created_at IS NOT NULL"),
                params![Value::Blob(blob), key],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("update_data", e))?;

        if n > 0 {
            return Ok(());
        }
        match self.select_row(key).await? {
            Some(_) => Err(TaskError::AlreadyFinished {
                key: key.to_string(),
            }
            .into()),
            None => Err(TaskError::NotFound {
                key: key.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_task(key: &str, run_at: i64) -> NewTask {
        NewTask {
            key: key.to_string(),
            task_type: "test".to_string(),
            data: Map::new(),
            run_at,
            resource: None,
            max_running: None,
            compression: Compression::None,
        }
    }

    fn limited(key: &str, run_at: i64, resource: &str, max_running: i64) -> NewTask {
        NewTask {
            resource: Some(resource.to_string()),
            max_running: Some(max_running),
            ..new_task(key, run_at)
        }
    }

    fn task_err(e: Error) -> TaskError {
        match e {
            Error::Task(t) => t,
            other => panic!("expected task error, got {other}"),
        }
    }

    #[tokio::test]
    async fn submit_then_duplicate_fails() {
        let db = test_db().await;
        db.submit(new_task("t1", 100), 100).await.unwrap();
        let err = db.submit(new_task("t1", 100), 100).await.unwrap_err();
        assert!(matches!(task_err(err), TaskError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn acquire_returns_due_tasks_oldest_first() {
        let db = test_db().await;
        db.submit(new_task("late", 50), 0).await.unwrap();
        db.submit(new_task("early", 10), 0).await.unwrap();
        db.submit(new_task("future", 500), 0).await.unwrap();

        let got = db.acquire(60, 5, 100).await.unwrap();
        let keys: Vec<_> = got.iter().map(|(m, _)| m.key.as_str()).collect();
        assert_eq!(keys, vec!["early", "late"]);
        assert!(got.iter().all(|(m, t)| m.status == TaskStatus::Running && t.last_timeout() == 160));
    }

    #[tokio::test]
    async fn acquire_nothing_is_empty_not_error() {
        let db = test_db().await;
        assert!(db.acquire(60, 1, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimed_row_is_not_handed_out_twice() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        assert_eq!(db.acquire(60, 1, 20).await.unwrap().len(), 1);
        assert!(db.acquire(60, 1, 20).await.unwrap().is_empty());
        // lease expired at 80
        assert_eq!(db.acquire(60, 1, 80).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resource_cap_is_enforced_within_a_batch() {
        let db = test_db().await;
        for i in 0..4 {
            db.submit(limited(&format!("r{i}"), 10 + i, "acct", 2), 0).await.unwrap();
        }
        db.submit(new_task("free", 20), 0).await.unwrap();

        let got = db.acquire(60, 10, 100).await.unwrap();
        let keys: Vec<_> = got.iter().map(|(m, _)| m.key.clone()).collect();
        assert_eq!(keys, vec!["r0", "r1", "free"]);

        assert!(db.acquire(60, 10, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resource_slot_frees_after_finish() {
        let db = test_db().await;
        db.submit(limited("a", 10, "acct", 1), 0).await.unwrap();
        db.submit(limited("b", 11, "acct", 1), 0).await.unwrap();

        let (_, token) = db.acquire(60, 1, 100).await.unwrap().remove(0);
        assert!(db.acquire(60, 1, 100).await.unwrap().is_empty());
        db.finish(&token, 300, 101).await.unwrap();
        let next = db.acquire(60, 1, 102).await.unwrap();
        assert_eq!(next[0].0.key, "b");
    }

    #[tokio::test]
    async fn heartbeat_extends_lease_and_detects_preemption() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, token) = db.acquire(10, 1, 10).await.unwrap().remove(0);

        let strict = HeartbeatParams {
            strict: true,
            ..Default::default()
        };
        db.heartbeat(&token, 15, 12, strict).await.unwrap();
        assert_eq!(token.last_timeout(), 27);

        // someone else reclaims after expiry
        let (_, other) = db.acquire(10, 1, 30).await.unwrap().remove(0);
        let err = db.heartbeat(&token, 15, 31, strict).await.unwrap_err();
        assert!(matches!(task_err(err), TaskError::Preempted { .. }));
        db.heartbeat(&other, 15, 31, strict).await.unwrap();
    }

    #[tokio::test]
    async fn stale_heartbeat_in_takeover_second_is_preempted() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, stale) = db.acquire(60, 1, 10).await.unwrap().remove(0);
        let (_, fresh) = db.acquire(60, 1, 80).await.unwrap().remove(0);
        assert_eq!(fresh.last_timeout(), 140);

        let strict = HeartbeatParams {
            strict: true,
            ..Default::default()
        };
        let err = db.heartbeat(&stale, 60, 80, strict).await.unwrap_err();
        assert!(matches!(task_err(err), TaskError::Preempted { .. }));
        assert_eq!(stale.last_timeout(), 70);
        db.heartbeat(&fresh, 60, 81, strict).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_heartbeat_in_same_second_is_kept() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, token) = db.acquire(60, 1, 10).await.unwrap().remove(0);
        let strict = HeartbeatParams {
            strict: true,
            ..Default::default()
        };
        db.heartbeat(&token, 60, 20, strict).await.unwrap();
        db.heartbeat(&token, 60, 20, strict).await.unwrap();
        assert_eq!(token.last_timeout(), 80);
    }

    #[tokio::test]
    async fn huge_batch_size_is_clamped() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        db.submit(new_task("t2", 11), 10).await.unwrap();
        let got = db.acquire(60, usize::MAX, 20).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_can_checkpoint_data() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, token) = db.acquire(60, 1, 10).await.unwrap().remove(0);

        let data = match json!({"type": "test", "progress": 3}) {
            JsonValue::Object(m) => m,
            _ => unreachable!(),
        };
        db.heartbeat(
            &token,
            60,
            20,
            HeartbeatParams {
                data: Some(&data),
                strict: true,
            },
        )
        .await
        .unwrap();
        let meta = db.get_task_metadata("t1", 20).await.unwrap();
        assert_eq!(meta.data["progress"], json!(3));
    }

    #[tokio::test]
    async fn heartbeat_on_finished_task_is_preempted() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, token) = db.acquire(60, 1, 10).await.unwrap().remove(0);
        db.force_finish("t1", 300, 20).await.unwrap();
        let err = db
            .heartbeat(&token, 60, 21, HeartbeatParams::default())
            .await
            .unwrap_err();
        assert!(matches!(task_err(err), TaskError::Preempted { .. }));
    }

    #[tokio::test]
    async fn cancel_request_surfaces_on_heartbeat() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, token) = db.acquire(60, 1, 10).await.unwrap().remove(0);

        db.cancel_request("t1", 15).await.unwrap();
        assert_eq!(
            db.get_task_metadata("t1", 15).await.unwrap().status,
            TaskStatus::CancelRequested
        );
        let err = db
            .heartbeat(&token, 60, 20, HeartbeatParams::default())
            .await
            .unwrap_err();
        assert!(matches!(task_err(err), TaskError::CancelRequested { .. }));

        db.finish(&token, 300, 21).await.unwrap();
        assert_eq!(
            db.get_task_metadata("t1", 21).await.unwrap().status,
            TaskStatus::Finished
        );
    }

    #[tokio::test]
    async fn cancel_request_requires_a_claimed_task() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let err = db.cancel_request("t1", 20).await.unwrap_err();
        assert!(matches!(task_err(err), TaskError::AlreadyFinished { .. }));
    }

    #[tokio::test]
    async fn cancelled_rows_are_not_acquired() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        db.acquire(60, 1, 10).await.unwrap();
        db.cancel_request("t1", 15).await.unwrap();
        assert!(db.acquire(60, 1, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_twice_is_idempotent_error() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, token) = db.acquire(60, 1, 10).await.unwrap().remove(0);
        db.finish(&token, 300, 20).await.unwrap();
        let before = db.get_task_metadata("t1", 20).await.unwrap();

        let err = db.finish(&token, 300, 25).await.unwrap_err();
        assert!(err.is_idempotent());
        assert_eq!(db.get_task_metadata("t1", 20).await.unwrap(), before);
    }

    #[tokio::test]
    async fn finished_task_visible_until_retention_ends() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        db.force_finish("t1", 100, 50).await.unwrap();

        assert!(db.get_task_metadata("t1", 150).await.is_ok());
        let err = db.get_task_metadata("t1", 151).await.unwrap_err();
        assert!(matches!(task_err(err), TaskError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cleanup_deletes_expired_rows() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        db.force_finish("t1", 100, 50).await.unwrap();

        // first acquire runs cleanup
        db.acquire(60, 1, 1000).await.unwrap();
        assert!(db.list(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn key_reusable_only_after_retention() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        db.force_finish("t1", 100, 50).await.unwrap();

        assert!(db.submit(new_task("t1", 120), 120).await.is_err());
        db.submit(new_task("t1", 200), 200).await.unwrap();
        assert!(db.get_task_metadata("t1", 200).await.unwrap().is_waiting());
    }

    #[tokio::test]
    async fn abandoned_cancellation_is_finished_by_cleanup() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        db.acquire(60, 1, 10).await.unwrap();
        db.cancel_request("t1", 20).await.unwrap();

        // lease ran out at 70; first acquire call runs cleanup
        let fresh = LibSqlBackend {
            acquire_count: AtomicU32::new(0),
            ..db
        };
        fresh.acquire(60, 1, 80).await.unwrap();
        assert!(fresh.get_task_metadata("t1", 80).await.unwrap().is_finished());
    }

    #[tokio::test]
    async fn release_makes_task_immediately_available() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let (_, token) = db.acquire(60, 1, 10).await.unwrap().remove(0);
        db.heartbeat(&token, 0, 20, HeartbeatParams::default()).await.unwrap();
        assert_eq!(db.acquire(60, 1, 20).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_data_only_on_active_tasks() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        let mut data = Map::new();
        data.insert("type".into(), json!("test"));
        data.insert("n".into(), json!(1));
        db.update_data("t1", data.clone(), Compression::Gzip).await.unwrap();
        assert_eq!(db.get_task_metadata("t1", 10).await.unwrap().data["n"], json!(1));

        db.force_finish("t1", 100, 20).await.unwrap();
        assert!(db.update_data("t1", data.clone(), Compression::None).await.is_err());
        let err = db.update_data("nope", data, Compression::None).await.unwrap_err();
        assert!(matches!(task_err(err), TaskError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_orders_by_timeout() {
        let db = test_db().await;
        db.submit(new_task("b", 20), 0).await.unwrap();
        db.submit(new_task("a", 10), 0).await.unwrap();
        let keys: Vec<_> = db.list(0).await.unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn init_database_force_drops_rows() {
        let db = test_db().await;
        db.submit(new_task("t1", 10), 10).await.unwrap();
        db.init_database(true).await.unwrap();
        assert!(db.list(0).await.unwrap().is_empty());
    }
}
