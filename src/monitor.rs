//! Task monitor: liveness pulses and lease heartbeats for one processor.
//!
//! One background tokio task per processor. It wakes at the earlier of the
//! next liveness pulse and the next lease heartbeat of the current task.
//! A lease heartbeat that fails with `Preempted` or `CancelRequested`
//! triggers the handler's kill hook.
//!
//! Terminal calls on a running task (finish, release, retry, cancel) go
//! through `MonitoredTask`, which holds the monitor's lease lock for the
//! duration of the call. A heartbeat therefore never races a terminal call.
//! The kill hook is always invoked with no monitor lock held.

use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{FinishOptions, HeartbeatOptions};
use crate::config::EngineConfig;
use crate::error::{Result, TaskError};
use crate::handler::{Handler, KillReason};
use crate::task::AcquiredTask;

/// Where liveness pulses go.
pub trait Liveness: Send + Sync {
    fn pulse(&self) -> std::io::Result<()>;

    /// Called once a pulse fails. The receiver is gone.
    fn lost(&self) {}
}

/// Liveness sink for in-process processors.
pub struct NoLiveness;

impl Liveness for NoLiveness {
    fn pulse(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorConfig {
    pub task_heartbeat_interval: Duration,
    pub child_heartbeat_interval: Duration,
}

impl MonitorConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            task_heartbeat_interval: config
                .processor
                .task_heartbeat_interval(config.client.alive_time),
            child_heartbeat_interval: config.processor.child_heartbeat_interval(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            task_heartbeat_interval: Duration::from_secs(2),
            child_heartbeat_interval: Duration::from_secs(2),
        }
    }
}

struct Current {
    generation: u64,
    task: Arc<MonitoredTask>,
    handler: Arc<dyn Handler>,
    last_heartbeat: Instant,
}

struct State {
    config: MonitorConfig,
    current: Option<Current>,
    generation: u64,
    finished: bool,
}

struct Shared {
    state: Mutex<State>,
    lease: AsyncMutex<()>,
    wake: Notify,
    liveness: Arc<dyn Liveness>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget the current task if it is still `generation`.
    fn task_finished(&self, generation: u64) {
        let mut state = self.lock();
        if state.current.as_ref().is_some_and(|c| c.generation == generation) {
            state.current = None;
        }
    }

    fn kill_task(&self, reason: KillReason) {
        let target = {
            let state = self.lock();
            state
                .current
                .as_ref()
                .map(|c| (Arc::clone(&c.task), Arc::clone(&c.handler)))
        };
        let Some((task, handler)) = target else {
            return;
        };

        info!(task = %task.key(), reason = %reason, "Killing task");
        task.kill_signal.send_replace(Some(reason.clone()));
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler.kill(&reason))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = %task.key(), "Failed to kill task: {e}"),
            Err(_) => error!(task = %task.key(), "Task kill hook panicked"),
        }
    }
}

/// Background heartbeat loop for one processor.
pub struct TaskMonitor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskMonitor {
    pub fn new(config: MonitorConfig, liveness: Arc<dyn Liveness>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    current: None,
                    generation: 0,
                    finished: false,
                }),
                lease: AsyncMutex::new(()),
                wake: Notify::new(),
                liveness,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the monitor loop. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run(shared));
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    /// Ask the loop to exit. Does not touch the current task.
    pub fn stop(&self) {
        self.shared.lock().finished = true;
        self.shared.wake.notify_one();
    }

    pub async fn join(&self) {
        let handle = self.handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Task monitor ended abnormally: {e}");
            }
        }
    }

    /// Start heartbeating `task`; the returned handle carries the terminal calls.
    pub fn set_task(&self, task: AcquiredTask, handler: Arc<dyn Handler>) -> Arc<MonitoredTask> {
        let (kill_signal, _) = watch::channel(None);
        let mut state = self.shared.lock();
        state.generation += 1;
        let monitored = Arc::new(MonitoredTask {
            task,
            generation: state.generation,
            shared: Arc::clone(&self.shared),
            settled: AtomicBool::new(false),
            checkpoint: Mutex::new(None),
            kill_signal,
        });
        state.current = Some(Current {
            generation: state.generation,
            task: Arc::clone(&monitored),
            handler,
            last_heartbeat: Instant::now(),
        });
        drop(state);
        self.shared.wake.notify_one();
        monitored
    }

    /// Stop heartbeating `task` without a terminal call.
    pub fn task_finished(&self, task: &MonitoredTask) {
        self.shared.task_finished(task.generation);
    }

    pub fn has_task(&self) -> bool {
        self.shared.lock().current.is_some()
    }

    /// Invoke the current task's kill hook with a stop reason.
    pub fn stop_task(&self, immediate: bool) {
        let reason = if immediate {
            KillReason::ImmediateStop
        } else {
            KillReason::GracefulStop
        };
        self.shared.kill_task(reason);
    }

    pub fn kill_task(&self, reason: KillReason) {
        self.shared.kill_task(reason);
    }
}

async fn run(shared: Arc<Shared>) {
    let mut last_pulse: Option<Instant> = None;
    let mut parent_lost = false;

    loop {
        let now = Instant::now();
        let (config, heartbeat_due) = {
            let state = shared.lock();
            if state.finished {
                break;
            }
            let due = state
                .current
                .as_ref()
                .map(|c| c.last_heartbeat + state.config.task_heartbeat_interval);
            (state.config, due)
        };

        if let Some(due) = heartbeat_due
            && due <= now
        {
            heartbeat_current(&shared).await;
        }

        let pulse_due = last_pulse.map(|t| t + config.child_heartbeat_interval);
        if !parent_lost && pulse_due.is_none_or(|due| due <= now) {
            if let Err(e) = shared.liveness.pulse() {
                error!("Liveness pulse failed: {e}");
                parent_lost = true;
                shared.liveness.lost();
            }
            last_pulse = Some(now);
        }

        let next_pulse = now + config.child_heartbeat_interval;
        let next_heartbeat = {
            let state = shared.lock();
            state
                .current
                .as_ref()
                .map(|c| c.last_heartbeat + state.config.task_heartbeat_interval)
        };
        let wake_at = match next_heartbeat {
            Some(hb) => hb.min(next_pulse),
            None => next_pulse,
        };

        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = shared.wake.notified() => {}
        }
    }
    debug!("Task monitor stopped");
}

async fn heartbeat_current(shared: &Arc<Shared>) {
    let lease = shared.lease.lock().await;
    let target = {
        let state = shared.lock();
        state
            .current
            .as_ref()
            .map(|c| (c.generation, Arc::clone(&c.task)))
    };
    let Some((generation, task)) = target else {
        return;
    };

    let data = task.take_checkpoint();
    let result = task
        .task
        .heartbeat(HeartbeatOptions {
            data,
            ..Default::default()
        })
        .await;

    {
        let mut state = shared.lock();
        if let Some(current) = state.current.as_mut()
            && current.generation == generation
        {
            current.last_heartbeat = Instant::now();
        }
    }
    drop(lease);

    match result {
        Ok(()) => debug!(task = %task.key(), "Lease extended"),
        Err(e) => match e.task_error() {
            Some(TaskError::CancelRequested { .. }) => shared.kill_task(KillReason::CancelRequested),
            Some(TaskError::Preempted { reason, .. }) => {
                shared.kill_task(KillReason::Preempted(reason.clone()))
            }
            _ => warn!(task = %task.key(), "Heartbeat failed: {e}"),
        },
    }
}

enum Settle {
    Finish,
    Release,
    Retry,
    CancelRequest,
}

/// A running task as seen by its handler.
///
/// Terminal calls stop the monitor's heartbeats for this task, whether or
/// not the store accepted them.
pub struct MonitoredTask {
    task: AcquiredTask,
    generation: u64,
    shared: Arc<Shared>,
    settled: AtomicBool,
    checkpoint: Mutex<Option<Map<String, Value>>>,
    kill_signal: watch::Sender<Option<KillReason>>,
}

impl MonitoredTask {
    pub fn task(&self) -> &AcquiredTask {
        &self.task
    }

    pub async fn finish(&self) -> Result<()> {
        self.settle(Settle::Finish).await
    }

    pub async fn release(&self) -> Result<()> {
        self.settle(Settle::Release).await
    }

    pub async fn retry(&self) -> Result<()> {
        self.settle(Settle::Retry).await
    }

    pub async fn cancel_request(&self) -> Result<()> {
        self.settle(Settle::CancelRequest).await
    }

    /// Extend the lease now instead of waiting for the monitor.
    pub async fn heartbeat(&self) -> Result<()> {
        let _lease = self.shared.lease.lock().await;
        let data = self.take_checkpoint();
        let result = self
            .task
            .heartbeat(HeartbeatOptions {
                data,
                ..Default::default()
            })
            .await;
        let mut state = self.shared.lock();
        if let Some(current) = state.current.as_mut()
            && current.generation == self.generation
        {
            current.last_heartbeat = Instant::now();
        }
        result
    }

    /// Payload written with the next heartbeat. Replaces the stored data, so
    /// it should be the full payload.
    pub fn checkpoint(&self, mut data: Map<String, Value>) {
        data.entry("type")
            .or_insert_with(|| Value::String(self.task.task_type().to_string()));
        if let Ok(mut slot) = self.checkpoint.lock() {
            *slot = Some(data);
        }
    }

    fn take_checkpoint(&self) -> Option<Map<String, Value>> {
        self.checkpoint.lock().ok().and_then(|mut slot| slot.take())
    }

    /// True once a terminal call has been made.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub fn kill_reason(&self) -> Option<KillReason> {
        self.kill_signal.borrow().clone()
    }

    /// Resolves when the monitor asks this task to stop.
    pub async fn killed(&self) -> KillReason {
        let mut rx = self.kill_signal.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `self`, so this is unreachable while borrowed.
                std::future::pending::<()>().await;
            }
        }
    }

    async fn settle(&self, op: Settle) -> Result<()> {
        let _lease = self.shared.lease.lock().await;
        let result = match op {
            Settle::Finish => self.task.finish(FinishOptions::default()).await,
            Settle::Release => self.task.release().await,
            Settle::Retry => self.task.retry().await,
            Settle::CancelRequest => self.task.cancel_request().await,
        };
        self.settled.store(true, Ordering::Release);
        self.shared.task_finished(self.generation);
        result
    }
}

impl Deref for MonitoredTask {
    type Target = AcquiredTask;

    fn deref(&self) -> &AcquiredTask {
        &self.task
    }
}
