//! Poll loop shared by the thread and child processors.
//!
//! Acquires a batch, runs each task through its routed handler with the
//! monitor heartbeating it, then settles the task from the handler outcome:
//!
//! | outcome                         | action  |
//! |---------------------------------|---------|
//! | handler already settled it      | none    |
//! | lease lost                      | none    |
//! | `Ok`                            | finish  |
//! | cancel requested                | finish  |
//! | immediate stop, not `Ok`        | release |
//! | `Err`, panic, `before_run` false | retry   |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::client::{AcquireOptions, Client};
use crate::config::EngineConfig;
use crate::error::{HandlerError, Result};
use crate::handler::KillReason;
use crate::monitor::{MonitoredTask, TaskMonitor};
use crate::router::Router;
use crate::task::AcquiredTask;

/// Stop request shared between a processor and its worker.
#[derive(Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    immediate: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, immediate: bool) {
        if immediate {
            self.immediate.store(true, Ordering::SeqCst);
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration`, returning early on a stop request.
    pub async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wait() => {}
        }
    }
}

/// Why `Worker::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    /// `max_requests_per_child` tasks were processed.
    MaxRequests,
}

enum Outcome {
    Skipped,
    Done(std::result::Result<(), HandlerError>),
    Panicked,
}

pub struct Worker {
    client: Client,
    router: Arc<Router>,
    monitor: Arc<TaskMonitor>,
    poll_interval: Duration,
    max_requests: Option<u64>,
    release_prefetched: bool,
}

impl Worker {
    pub fn new(
        client: Client,
        router: Arc<Router>,
        monitor: Arc<TaskMonitor>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            client,
            router,
            monitor,
            poll_interval: config.processor.poll_interval(),
            max_requests: config.processor.max_requests_per_child,
            release_prefetched: config.processor.release_prefetched_on_stop,
        }
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    /// Poll and process until stopped or the request limit is reached.
    pub async fn run(&self, stop: &StopSignal) -> WorkerExit {
        let mut processed: u64 = 0;
        info!("Worker started");

        loop {
            if stop.is_stopped() {
                break;
            }

            let batch = match self.client.acquire(AcquireOptions::default()).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Failed to acquire tasks: {e}");
                    stop.sleep(self.poll_interval).await;
                    continue;
                }
            };
            if batch.is_empty() {
                stop.sleep(self.poll_interval).await;
                continue;
            }
            debug!(count = batch.len(), "Acquired tasks");

            let mut pending = batch.into_iter();
            while let Some(task) = pending.next() {
                self.process(task).await;
                processed += 1;

                if self.max_requests.is_some_and(|max| processed >= max) {
                    self.leave_prefetched(pending.collect()).await;
                    info!(processed, "Request limit reached");
                    return WorkerExit::MaxRequests;
                }
                if stop.is_stopped() {
                    self.leave_prefetched(pending.collect()).await;
                    break;
                }
            }
        }

        info!(processed, "Worker stopped");
        WorkerExit::Stopped
    }

    async fn leave_prefetched(&self, rest: Vec<AcquiredTask>) {
        if rest.is_empty() {
            return;
        }
        if !self.release_prefetched {
            debug!(count = rest.len(), "Leaving prefetched tasks to lease expiry");
            return;
        }
        for task in rest {
            if let Err(e) = task.release().await {
                warn!(task = %task.key(), "Failed to release prefetched task: {e}");
            }
        }
    }

    /// Run one task to a terminal state.
    pub async fn process(&self, task: AcquiredTask) {
        let Some(handler) = self.router.dispatch(&task) else {
            error!(
                task = %task.key(),
                task_type = %task.task_type(),
                "No route for task type; retrying later"
            );
            if let Err(e) = task.retry().await {
                warn!(task = %task.key(), "Failed to retry unrouted task: {e}");
            }
            return;
        };

        let monitored = self.monitor.set_task(task, Arc::clone(&handler));
        debug!(task = %monitored.key(), task_type = %monitored.task_type(), "Running task");

        let run = {
            let monitored = Arc::clone(&monitored);
            tokio::spawn(async move {
                if !handler.before_run(&monitored).await {
                    return Outcome::Skipped;
                }
                let result = handler.run(&monitored).await;
                handler.after_run(&monitored).await;
                Outcome::Done(result)
            })
        };
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task = %monitored.key(), "Handler ended abnormally: {e}");
                Outcome::Panicked
            }
        };

        if let Err(e) = self.settle(&monitored, outcome).await {
            if e.is_idempotent() {
                debug!(task = %monitored.key(), "Task already settled: {e}");
            } else {
                warn!(task = %monitored.key(), "Failed to settle task: {e}");
            }
        }
        self.monitor.task_finished(&monitored);
    }

    async fn settle(&self, task: &MonitoredTask, outcome: Outcome) -> Result<()> {
        if task.is_settled() {
            return Ok(());
        }
        let kill = task.kill_reason();
        if let Some(KillReason::Preempted(reason)) = &kill {
            info!(task = %task.key(), "Lease lost ({reason}); dropping result");
            return Ok(());
        }

        match outcome {
            Outcome::Done(Ok(())) => task.finish().await,
            _ if kill == Some(KillReason::CancelRequested) => {
                info!(task = %task.key(), "Task cancelled");
                task.finish().await
            }
            _ if kill == Some(KillReason::ImmediateStop) => task.release().await,
            Outcome::Skipped => task.retry().await,
            Outcome::Done(Err(e)) => {
                warn!(task = %task.key(), "Task failed: {e}");
                task.retry().await
            }
            Outcome::Panicked => task.retry().await,
        }
    }
}
