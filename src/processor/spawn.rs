//! Child-process processor, parent side.
//!
//! The child is started from `worker_command` with the engine config in
//! `LEASEQ_WORKER_CONFIG`. It writes a byte to its stdout every
//! `child_heartbeat_interval`; a child that stays silent longer than
//! `child_heartbeat_limit` is stopped gracefully and replaced, and a closed
//! pipe means the child is going away, so it is killed outright.
//!
//! Kill signals are resent every `child_kill_interval` until the child is
//! reaped. A graceful kill escalates to SIGKILL after
//! `child_graceful_kill_limit` when one is set.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Processor;
use crate::config::{EngineConfig, WORKER_CONFIG_ENV};
use crate::error::ProcessError;

/// Pulse bookkeeping shared with the pipe reader task.
struct Pulse {
    last: StdMutex<Instant>,
    closed: AtomicBool,
}

impl Pulse {
    fn touch(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    fn since_last(&self) -> Duration {
        self.last
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// Parent-side view of one child process.
struct ChildMonitor {
    pid: i32,
    child: Child,
    pulse: Arc<Pulse>,
    reader: JoinHandle<()>,
    kill_start: Option<Instant>,
    last_kill: Option<Instant>,
    kill_immediate: bool,
}

impl ChildMonitor {
    fn spawn(config: &EngineConfig) -> Result<Self, ProcessError> {
        let (program, args) = worker_command(config)?;
        let payload = config
            .to_json()
            .map_err(|e| ProcessError::Spawn(format!("encode worker config: {e}")))?;

        let mut child = Command::new(&program)
            .args(&args)
            .env(WORKER_CONFIG_ENV, payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| ProcessError::Spawn(format!("{program}: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Spawn(format!("{program}: exited before start")))?
            as i32;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::Spawn(format!("{program}: no liveness pipe")))?;

        let pulse = Arc::new(Pulse {
            last: StdMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });
        let reader = {
            let pulse = Arc::clone(&pulse);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => pulse.touch(),
                        Err(e) => {
                            debug!(pid, "Liveness pipe read failed: {e}");
                            break;
                        }
                    }
                }
                pulse.closed.store(true, Ordering::SeqCst);
            })
        };

        info!(pid, "Worker process started");
        Ok(Self {
            pid,
            child,
            pulse,
            reader,
            kill_start: None,
            last_kill: None,
            kill_immediate: false,
        })
    }

    /// `Err` when the pipe is closed, otherwise whether a pulse arrived
    /// within `limit`.
    fn check_heartbeat(&self, limit: Duration) -> Result<bool, ()> {
        if self.pulse.closed.load(Ordering::SeqCst) {
            return Err(());
        }
        Ok(self.pulse.since_last() <= limit)
    }

    fn start_killing(&mut self, immediate: bool) {
        if immediate && !self.kill_immediate {
            self.kill_immediate = true;
        } else if self.kill_start.is_some() {
            return;
        }
        let now = Instant::now();
        self.kill_start = Some(now);
        self.send_signal(now, None);
    }

    /// True once the child has been reaped. Only reaps after `start_killing`.
    fn try_join(&mut self, kill_interval: Duration, graceful_limit: Option<Duration>) -> bool {
        if self.kill_start.is_none() {
            return false;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                info!(pid = self.pid, %status, "Worker process exited");
                self.reader.abort();
                return true;
            }
            Ok(None) => {}
            Err(e) => {
                let e = ProcessError::Wait {
                    pid: self.pid,
                    reason: e.to_string(),
                };
                warn!("{e}");
                self.reader.abort();
                return true;
            }
        }

        let now = Instant::now();
        if self.last_kill.is_none_or(|last| last + kill_interval <= now) {
            self.send_signal(now, graceful_limit);
        }
        false
    }

    fn send_signal(&mut self, now: Instant, graceful_limit: Option<Duration>) {
        let over_limit = match (self.kill_start, graceful_limit) {
            (Some(start), Some(limit)) => start + limit < now,
            _ => false,
        };
        let pid = Pid::from_raw(self.pid);
        let result = if self.kill_immediate || over_limit {
            debug!(pid = self.pid, "Sending SIGKILL for immediate stop");
            signal::killpg(pid, Signal::SIGKILL)
        } else {
            debug!(pid = self.pid, "Sending SIGTERM for graceful stop");
            signal::kill(pid, Signal::SIGTERM)
        };
        if let Err(e) = result {
            let e = ProcessError::Signal {
                pid: self.pid,
                reason: e.to_string(),
            };
            debug!("{e}");
        }
        self.last_kill = Some(now);
    }
}

/// Program and arguments for a worker child.
fn worker_command(config: &EngineConfig) -> Result<(String, Vec<String>), ProcessError> {
    if let Some((program, args)) = config.processor.worker_command.split_first() {
        return Ok((program.clone(), args.to_vec()));
    }
    let exe = std::env::current_exe()
        .map_err(|e| ProcessError::Spawn(format!("locate current executable: {e}")))?;
    Ok((exe.to_string_lossy().into_owned(), vec!["worker".to_string()]))
}

struct State {
    config: EngineConfig,
    child: Option<ChildMonitor>,
    stopped: bool,
    last_spawn: Option<Instant>,
}

impl State {
    fn try_join(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        let kill_interval = self.config.processor.child_kill_interval();
        let graceful_limit = self.config.processor.child_graceful_kill_limit();
        if child.try_join(kill_interval, graceful_limit) {
            self.child = None;
            true
        } else {
            false
        }
    }
}

pub struct SpawnProcessor {
    state: Mutex<State>,
}

impl SpawnProcessor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            state: Mutex::new(State {
                config,
                child: None,
                stopped: false,
                last_spawn: None,
            }),
        }
    }

    /// Pid of the current child, if one is running.
    pub async fn pid(&self) -> Option<i32> {
        self.state.lock().await.child.as_ref().map(|c| c.pid)
    }
}

#[async_trait]
impl Processor for SpawnProcessor {
    async fn keepalive(&self) {
        let mut state = self.state.lock().await;
        if state.stopped {
            state.try_join();
            return;
        }

        let limit = state.config.processor.child_heartbeat_limit();
        if let Some(child) = state.child.as_mut() {
            match child.check_heartbeat(limit) {
                Ok(true) => {}
                Ok(false) => {
                    error!(pid = child.pid, "Heartbeat broke out. Restarting worker process");
                    child.start_killing(false);
                }
                Err(()) => {
                    error!(pid = child.pid, "Heartbeat pipe is closed. Restarting worker process");
                    child.start_killing(true);
                }
            }
            state.try_join();
        }

        if state.child.is_none() {
            let min_gap = state.config.processor.child_fork_frequency_limit();
            if state.last_spawn.is_some_and(|t| t.elapsed() < min_gap) {
                return;
            }
            state.last_spawn = Some(Instant::now());
            match ChildMonitor::spawn(&state.config) {
                Ok(child) => state.child = Some(child),
                Err(e) => error!("Failed to spawn worker process: {e}"),
            }
        }
    }

    async fn restart(&self, immediate: bool, config: &EngineConfig) {
        let mut state = self.state.lock().await;
        state.config = config.clone();
        if let Some(child) = state.child.as_mut() {
            child.start_killing(immediate);
        }
    }

    async fn stop(&self, immediate: bool) {
        let mut state = self.state.lock().await;
        state.stopped = true;
        if let Some(child) = state.child.as_mut() {
            info!(
                pid = child.pid,
                immediate, "Stopping worker process"
            );
            child.start_killing(immediate);
        }
    }

    async fn join(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if state.try_join() {
                    return;
                }
                (state.config.processor.child_kill_interval() + Duration::from_secs(1)) / 2
            };
            tokio::time::sleep(wait).await;
        }
    }

    async fn is_joined(&self) -> bool {
        let mut state = self.state.lock().await;
        state.stopped && state.try_join()
    }
}
