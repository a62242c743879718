//! Queue client: default policy over a `Backend`.
//!
//! Fills in lease length, retention and retry wait from `ClientConfig`
//! when the caller does not override them, and wraps backend rows into
//! task handles. Cheap to clone.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::config::{ClientConfig, Compression};
use crate::error::Result;
use crate::store::{Backend, HeartbeatParams, LibSqlBackend, NewTask};
use crate::task::{AcquiredTask, ClaimToken, Task, TaskMetadata, TaskWithMetadata};

/// Current time in epoch seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub now: Option<i64>,
    /// Earliest acquisition time. Defaults to now.
    pub run_at: Option<i64>,
    pub resource: Option<String>,
    pub max_running: Option<i64>,
    /// Overrides the configured compression.
    pub compression: Option<Compression>,
}

#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub now: Option<i64>,
    pub alive_time: Option<i64>,
    pub max_acquire: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub now: Option<i64>,
    pub alive_time: Option<i64>,
    /// Payload checkpoint written with the extension.
    pub data: Option<Map<String, Value>>,
    /// Fail with `Preempted` if another claimant renewed the row. On by default.
    pub strict: bool,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            now: None,
            alive_time: None,
            data: None,
            strict: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FinishOptions {
    pub now: Option<i64>,
    pub retention_time: Option<i64>,
}

#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
    config: Arc<ClientConfig>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>, config: ClientConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
        }
    }

    /// Open the libSQL store named in `config`.
    pub async fn open(config: &ClientConfig) -> Result<Self> {
        let backend = LibSqlBackend::open(config).await?;
        Ok(Self::new(Arc::new(backend), config.clone()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub async fn init_database(&self, force: bool) -> Result<()> {
        self.backend.init_database(force).await
    }

    pub async fn submit(
        &self,
        key: &str,
        task_type: &str,
        data: Map<String, Value>,
        options: SubmitOptions,
    ) -> Result<Task> {
        let now = options.now.unwrap_or_else(now);
        let task = NewTask {
            key: key.to_string(),
            task_type: task_type.to_string(),
            data,
            run_at: options.run_at.unwrap_or(now),
            resource: options.resource,
            max_running: options.max_running,
            compression: options.compression.unwrap_or(self.config.compression),
        };
        self.backend.submit(task, now).await?;
        Ok(Task::new(self.clone(), key))
    }

    pub async fn acquire(&self, options: AcquireOptions) -> Result<Vec<AcquiredTask>> {
        let now = options.now.unwrap_or_else(now);
        let alive_time = options.alive_time.unwrap_or(self.config.alive_time);
        let max_acquire = options.max_acquire.unwrap_or(self.config.max_acquire);

        let claimed = self.backend.acquire(alive_time, max_acquire, now).await?;
        Ok(claimed
            .into_iter()
            .map(|(metadata, token)| AcquiredTask::new(self.clone(), metadata, token))
            .collect())
    }

    pub async fn heartbeat(&self, token: &ClaimToken, options: HeartbeatOptions) -> Result<()> {
        let now = options.now.unwrap_or_else(now);
        let alive_time = options.alive_time.unwrap_or(self.config.alive_time);
        let params = HeartbeatParams {
            data: options.data.as_ref(),
            strict: options.strict,
        };
        self.backend.heartbeat(token, alive_time, now, params).await
    }

    /// Heartbeat with a zero lease: the task is acquirable again at once.
    pub async fn release(&self, token: &ClaimToken, now: Option<i64>) -> Result<()> {
        self.heartbeat(
            token,
            HeartbeatOptions {
                now,
                alive_time: Some(0),
                ..Default::default()
            },
        )
        .await
    }

    /// Heartbeat with the retry wait as lease.
    pub async fn retry(&self, token: &ClaimToken, now: Option<i64>) -> Result<()> {
        self.heartbeat(
            token,
            HeartbeatOptions {
                now,
                alive_time: Some(self.config.retry_wait),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn finish(&self, token: &ClaimToken, options: FinishOptions) -> Result<()> {
        let now = options.now.unwrap_or_else(now);
        let retention = options.retention_time.unwrap_or(self.config.retention_time);
        self.backend.finish(token, retention, now).await
    }

    pub async fn force_finish(&self, key: &str, options: FinishOptions) -> Result<()> {
        let now = options.now.unwrap_or_else(now);
        let retention = options.retention_time.unwrap_or(self.config.retention_time);
        self.backend.force_finish(key, retention, now).await
    }

    pub async fn cancel_request(&self, key: &str, now: Option<i64>) -> Result<()> {
        self.backend
            .cancel_request(key, now.unwrap_or_else(self::now))
            .await
    }

    pub async fn get_task_metadata(&self, key: &str, now: Option<i64>) -> Result<TaskMetadata> {
        self.backend
            .get_task_metadata(key, now.unwrap_or_else(self::now))
            .await
    }

    pub async fn list(&self, now: Option<i64>) -> Result<Vec<TaskWithMetadata>> {
        let rows = self.backend.list(now.unwrap_or_else(self::now)).await?;
        Ok(rows
            .into_iter()
            .map(|metadata| TaskWithMetadata::new(self.clone(), metadata))
            .collect())
    }

    /// Replace the payload of an active task. The stored `type` is kept
    /// unless `data` sets one.
    pub async fn update_data(&self, key: &str, mut data: Map<String, Value>) -> Result<()> {
        if !data.contains_key("type") {
            let current = self.get_task_metadata(key, None).await?;
            data.insert("type".to_string(), Value::String(current.task_type));
        }
        self.backend
            .update_data(key, data, self.config.compression)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use serde_json::json;

    async fn test_client(config: ClientConfig) -> Client {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        Client::new(Arc::new(backend), config)
    }

    fn payload(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn acquire_uses_configured_lease() {
        let client = test_client(ClientConfig {
            alive_time: 42,
            ..Default::default()
        })
        .await;
        client
            .submit("t1", "echo", Map::new(), SubmitOptions { now: Some(100), ..Default::default() })
            .await
            .unwrap();

        let got = client
            .acquire(AcquireOptions { now: Some(100), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].token().last_timeout(), 142);
        assert_eq!(got[0].task_type(), "echo");
    }

    #[tokio::test]
    async fn retry_delays_by_retry_wait() {
        let client = test_client(ClientConfig {
            retry_wait: 50,
            ..Default::default()
        })
        .await;
        client
            .submit("t1", "echo", Map::new(), SubmitOptions { now: Some(100), ..Default::default() })
            .await
            .unwrap();
        let task = client
            .acquire(AcquireOptions { now: Some(100), ..Default::default() })
            .await
            .unwrap()
            .remove(0);

        client.retry(task.token(), Some(110)).await.unwrap();
        let meta = client.get_task_metadata("t1", Some(110)).await.unwrap();
        assert_eq!(meta.timeout, 160);
        assert!(meta.is_running());
        assert!(
            client
                .acquire(AcquireOptions { now: Some(159), ..Default::default() })
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            client
                .acquire(AcquireOptions { now: Some(160), ..Default::default() })
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn submit_respects_run_at() {
        let client = test_client(ClientConfig::default()).await;
        client
            .submit(
                "later",
                "echo",
                Map::new(),
                SubmitOptions {
                    now: Some(100),
                    run_at: Some(200),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let acquire_at = |t| AcquireOptions { now: Some(t), ..Default::default() };
        assert!(client.acquire(acquire_at(150)).await.unwrap().is_empty());
        assert_eq!(client.acquire(acquire_at(200)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_data_keeps_type() {
        let client = test_client(ClientConfig::default()).await;
        let task = client
            .submit("t1", "report", payload(json!({"n": 1})), SubmitOptions::default())
            .await
            .unwrap();
        task.update_data(payload(json!({"n": 2}))).await.unwrap();

        let meta = task.metadata().await.unwrap();
        assert_eq!(meta.task_type, "report");
        assert_eq!(meta.data["n"], json!(2));
    }

    #[tokio::test]
    async fn exists_turns_false_after_retention() {
        let client = test_client(ClientConfig::default()).await;
        let task = client
            .submit("t1", "echo", Map::new(), SubmitOptions::default())
            .await
            .unwrap();
        assert!(task.exists().await.unwrap());

        task.force_finish(FinishOptions {
            now: Some(now() - 1000),
            retention_time: Some(10),
        })
        .await
        .unwrap();
        assert!(!task.exists().await.unwrap());
    }

    #[tokio::test]
    async fn gzip_config_applies_to_submit() {
        let client = test_client(ClientConfig {
            compression: Compression::Gzip,
            ..Default::default()
        })
        .await;
        client
            .submit("t1", "echo", payload(json!({"body": "hello"})), SubmitOptions::default())
            .await
            .unwrap();
        let meta = client.get_task_metadata("t1", None).await.unwrap();
        assert_eq!(meta.data["body"], json!("hello"));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let client = test_client(ClientConfig::default()).await;
        let err = client.get_task_metadata("ghost", None).await.unwrap_err();
        assert!(matches!(err.task_error(), Some(TaskError::NotFound { .. })));
    }
}
