//! Processor pool and its keepalive loop.
//!
//! The engine owns `processors` processors built by a `ProcessorFactory`
//! and calls `keepalive` on each about once a second until stopped.
//! `restart` reconciles the pool against a new config: extra processors
//! are stopped and reaped in the background, missing ones are added, and
//! survivors are restarted with the new settings.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{ConfigError, ProcessError, Result};
use crate::processor::{Processor, ProcessorFactory};

/// Delay between keepalive rounds.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

struct Pool {
    config: EngineConfig,
    processors: Vec<Arc<dyn Processor>>,
    /// Removed by a shrinking restart, not yet reaped.
    retiring: Vec<Arc<dyn Processor>>,
}

pub struct Engine {
    factory: ProcessorFactory,
    pool: Mutex<Pool>,
    finished: AtomicBool,
    wake: Notify,
    replaced: std::sync::Mutex<Option<u32>>,
}

impl Engine {
    pub fn new(config: EngineConfig, factory: ProcessorFactory) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let processors = (0..config.processors)
            .map(|_| Arc::from(factory(&config)))
            .collect();
        info!(
            processors = config.processors,
            processor_type = ?config.processor_type,
            "Engine configured"
        );
        Ok(Self {
            factory,
            pool: Mutex::new(Pool {
                config,
                processors,
                retiring: Vec::new(),
            }),
            finished: AtomicBool::new(false),
            wake: Notify::new(),
            replaced: std::sync::Mutex::new(None),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub async fn config(&self) -> EngineConfig {
        self.pool.lock().await.config.clone()
    }

    pub async fn processor_count(&self) -> usize {
        self.pool.lock().await.processors.len()
    }

    /// Keepalive loop. Returns after `stop` once every processor is joined.
    pub async fn run(&self) {
        loop {
            let (processors, retiring) = self.snapshot().await;
            for processor in processors.iter().chain(retiring.iter()) {
                processor.keepalive().await;
            }
            self.drop_reaped(&retiring).await;

            if self.is_finished() {
                break;
            }
            let notified = self.wake.notified();
            tokio::select! {
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
                _ = notified => {}
            }
        }
        self.join().await;
    }

    async fn snapshot(&self) -> (Vec<Arc<dyn Processor>>, Vec<Arc<dyn Processor>>) {
        let pool = self.pool.lock().await;
        (pool.processors.clone(), pool.retiring.clone())
    }

    async fn drop_reaped(&self, retiring: &[Arc<dyn Processor>]) {
        let mut reaped = Vec::new();
        for processor in retiring {
            if processor.is_joined().await {
                reaped.push(Arc::clone(processor));
            }
        }
        if reaped.is_empty() {
            return;
        }
        let mut pool = self.pool.lock().await;
        pool.retiring
            .retain(|p| !reaped.iter().any(|r| Arc::ptr_eq(p, r)));
        debug!(count = reaped.len(), "Retired processors reaped");
    }

    /// Apply `config`. On a validation error the current config stays.
    pub async fn restart(&self, immediate: bool, config: EngineConfig) -> std::result::Result<(), ConfigError> {
        config.validate()?;

        let survivors = {
            let mut pool = self.pool.lock().await;
            let mut retired: Vec<Arc<dyn Processor>> = Vec::new();

            if pool.config.processor_type != config.processor_type {
                retired.append(&mut pool.processors);
            } else if pool.processors.len() > config.processors {
                retired = pool.processors.split_off(config.processors);
            }
            let survivors = pool.processors.clone();
            while pool.processors.len() < config.processors {
                pool.processors.push(Arc::from((self.factory)(&config)));
            }

            info!(
                immediate,
                processors = config.processors,
                retired = retired.len(),
                "Restarting engine"
            );
            for processor in &retired {
                processor.stop(immediate).await;
            }
            pool.retiring.extend(retired);
            pool.config = config.clone();
            survivors
        };

        for processor in survivors {
            processor.restart(immediate, &config).await;
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Stop every processor. Repeating a stop is harmless; an immediate stop
    /// after a graceful one escalates.
    pub async fn stop(&self, immediate: bool) {
        self.finished.store(true, Ordering::SeqCst);
        let (processors, retiring) = self.snapshot().await;
        join_all(
            processors
                .iter()
                .chain(retiring.iter())
                .map(|p| p.stop(immediate)),
        )
        .await;
        self.wake.notify_one();
    }

    pub async fn join(&self) {
        let (processors, retiring) = self.snapshot().await;
        join_all(processors.iter().chain(retiring.iter()).map(|p| p.join())).await;
    }

    pub async fn shutdown(&self, immediate: bool) {
        self.stop(immediate).await;
        self.join().await;
    }

    /// Start `command` as the replacement supervisor, then stop this engine.
    /// Only one replacement is ever started.
    pub async fn replace(&self, immediate: bool, command: &[String]) -> Result<u32> {
        let pid = {
            let mut replaced = self
                .replaced
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(pid) = *replaced {
                return Err(ProcessError::AlreadyReplaced(pid).into());
            }
            let (program, args) = command
                .split_first()
                .ok_or_else(|| ProcessError::Spawn("empty replacement command".to_string()))?;
            let child = Command::new(program)
                .args(args)
                .process_group(0)
                .spawn()
                .map_err(|e| ProcessError::Spawn(format!("{program}: {e}")))?;
            let pid = child
                .id()
                .ok_or_else(|| ProcessError::Spawn(format!("{program}: exited before start")))?;
            *replaced = Some(pid);
            pid
        };

        info!(pid, immediate, "Replacement process started");
        self.stop(immediate).await;
        Ok(pid)
    }

    pub async fn logrotated(&self) {
        let (processors, retiring) = self.snapshot().await;
        for processor in processors.iter().chain(retiring.iter()) {
            processor.logrotated().await;
        }
    }
}
