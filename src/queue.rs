//! Queue handle: the producer/consumer view of a `Client`.

use serde_json::{Map, Value};

use crate::client::{AcquireOptions, Client, SubmitOptions};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::task::{AcquiredTask, Task, TaskWithMetadata};

#[derive(Clone)]
pub struct Queue {
    client: Client,
}

impl Queue {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Open a queue on the configured store.
    pub async fn open(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(Client::open(config).await?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Handle for `key`. Does not touch the store.
    pub fn task(&self, key: &str) -> Task {
        Task::new(self.client.clone(), key)
    }

    pub async fn submit(
        &self,
        key: &str,
        task_type: &str,
        data: Map<String, Value>,
        options: SubmitOptions,
    ) -> Result<Task> {
        self.client.submit(key, task_type, data, options).await
    }

    /// Acquire at most one task.
    pub async fn poll(&self, options: AcquireOptions) -> Result<Option<AcquiredTask>> {
        let options = AcquireOptions {
            max_acquire: Some(1),
            ..options
        };
        Ok(self.poll_multi(options).await?.into_iter().next())
    }

    /// Acquire up to `max_acquire` tasks.
    pub async fn poll_multi(&self, options: AcquireOptions) -> Result<Vec<AcquiredTask>> {
        self.client.acquire(options).await
    }

    /// Every task row still visible, oldest timeout first.
    pub async fn list(&self) -> Result<Vec<TaskWithMetadata>> {
        self.client.list(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::LibSqlBackend;
    use crate::task::TaskStatus;

    async fn test_queue() -> Queue {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        Queue::new(Client::new(Arc::new(backend), ClientConfig::default()))
    }

    fn at(now: i64) -> AcquireOptions {
        AcquireOptions {
            now: Some(now),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn poll_takes_one_even_with_larger_batch() {
        let queue = test_queue().await;
        for key in ["a", "b", "c"] {
            queue
                .submit(key, "echo", Map::new(), SubmitOptions { now: Some(10), ..Default::default() })
                .await
                .unwrap();
        }
        let first = queue
            .poll(AcquireOptions {
                max_acquire: Some(3),
                ..at(10)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.key(), "a");

        let rest = queue
            .poll_multi(AcquireOptions {
                max_acquire: Some(5),
                ..at(10)
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(queue.poll(at(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_and_index() {
        let queue = test_queue().await;
        queue
            .submit("job.1", "echo", Map::new(), SubmitOptions::default())
            .await
            .unwrap();
        let listed = queue.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status(), TaskStatus::Waiting);
        assert!(queue.task("job.1").exists().await.unwrap());
        assert!(!queue.task("job.2").exists().await.unwrap());
    }
}
