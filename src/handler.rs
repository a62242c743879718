//! Task handler interface.
//!
//! A `HandlerFactory` builds one `Handler` per acquired task. The handler's
//! `run` executes the work; `kill` is called from the monitor while `run`
//! may still be executing, so it must return promptly and must not wait on
//! anything `run` holds. `decide` dispatches named decisions a handler
//! chooses to support; unknown names fail with `UndefinedDecision`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::HandlerError;
use crate::monitor::MonitoredTask;
use crate::task::AcquiredTask;

/// Why a running task is being asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReason {
    /// Another worker took the lease over, or the task was finished elsewhere.
    Preempted(String),
    /// An operator requested cancellation.
    CancelRequested,
    /// The processor is stopping gracefully. Advisory: the task may finish.
    GracefulStop,
    /// The processor is stopping immediately.
    ImmediateStop,
}

impl KillReason {
    /// True when the lease is gone and nothing should be written for this task.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, KillReason::Preempted(_))
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::Preempted(why) => write!(f, "preempted: {why}"),
            KillReason::CancelRequested => f.write_str("cancel requested"),
            KillReason::GracefulStop => f.write_str("graceful stop requested"),
            KillReason::ImmediateStop => f.write_str("immediate stop requested"),
        }
    }
}

/// User code for one task.
///
/// Returning `Ok` without calling a terminal method on the task finishes it;
/// returning `Err` schedules a retry after the configured retry wait.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Called before `run`; returning false skips `run` and `after_run`.
    async fn before_run(&self, _task: &MonitoredTask) -> bool {
        true
    }

    async fn run(&self, task: &MonitoredTask) -> Result<(), HandlerError>;

    /// Called after `run`, whatever its outcome.
    async fn after_run(&self, _task: &MonitoredTask) {}

    /// Take the decision named `decision`. The default defines none.
    async fn decide(
        &self,
        _task: &MonitoredTask,
        decision: &str,
        options: &Map<String, Value>,
    ) -> Result<(), HandlerError> {
        Err(undefined_decision(decision, options))
    }

    /// Cooperative abort request. Errors are logged by the monitor.
    fn kill(&self, _reason: &KillReason) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Error for a decision the handler does not define.
pub fn undefined_decision(decision: &str, options: &Map<String, Value>) -> HandlerError {
    HandlerError::UndefinedDecision {
        decision: decision.to_string(),
        options: Value::Object(options.clone()).to_string(),
    }
}

/// Builds a handler for an acquired task.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, task: &AcquiredTask) -> Arc<dyn Handler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(&AcquiredTask) -> H + Send + Sync,
    H: Handler + 'static,
{
    fn create(&self, task: &AcquiredTask) -> Arc<dyn Handler> {
        Arc::new(self(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::client::{AcquireOptions, Client, SubmitOptions};
    use crate::config::ClientConfig;
    use crate::monitor::{MonitorConfig, NoLiveness, TaskMonitor};
    use crate::store::LibSqlBackend;

    #[derive(Default)]
    struct Notifier {
        notified: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Handler for Notifier {
        async fn run(&self, _task: &MonitoredTask) -> Result<(), HandlerError> {
            Ok(())
        }

        async fn decide(
            &self,
            _task: &MonitoredTask,
            decision: &str,
            options: &Map<String, Value>,
        ) -> Result<(), HandlerError> {
            match decision {
                "notify" => {
                    self.notified
                        .lock()
                        .unwrap()
                        .push(Value::Object(options.clone()));
                    Ok(())
                }
                _ => Err(undefined_decision(decision, options)),
            }
        }
    }

    struct Plain;

    #[async_trait]
    impl Handler for Plain {
        async fn run(&self, _task: &MonitoredTask) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    async fn monitored(handler: Arc<dyn Handler>) -> Arc<MonitoredTask> {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let client = Client::new(Arc::new(backend), ClientConfig::default());
        client
            .submit("t1", "echo", Map::new(), SubmitOptions::default())
            .await
            .unwrap();
        let task = client
            .acquire(AcquireOptions::default())
            .await
            .unwrap()
            .remove(0);
        let monitor = TaskMonitor::new(MonitorConfig::default(), Arc::new(NoLiveness));
        monitor.set_task(task, handler)
    }

    fn options(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn defined_decision_runs() {
        let handler = Arc::new(Notifier::default());
        let task = monitored(handler.clone()).await;
        handler
            .decide(&task, "notify", &options(json!({"to": "ops"})))
            .await
            .unwrap();
        assert_eq!(*handler.notified.lock().unwrap(), vec![json!({"to": "ops"})]);
    }

    #[tokio::test]
    async fn unknown_decision_is_rejected() {
        let handler = Arc::new(Notifier::default());
        let task = monitored(handler.clone()).await;
        let err = handler.decide(&task, "page", &Map::new()).await.unwrap_err();
        assert!(matches!(err, HandlerError::UndefinedDecision { ref decision, .. } if decision == "page"));
    }

    #[tokio::test]
    async fn default_handler_defines_no_decisions() {
        let handler = Arc::new(Plain);
        let task = monitored(handler.clone()).await;
        let err = handler
            .decide(&task, "notify", &options(json!({"n": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), r#"undefined decision notify options={"n":1}"#);
    }
}
