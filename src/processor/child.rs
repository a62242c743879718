//! Child-process entry: the worker loop with a liveness pipe on stdout.
//!
//! Signals: TERM, INT, USR1 and HUP stop gracefully; QUIT, USR2 and WINCH
//! stop immediately; CONT is ignored. If the parent goes away the next
//! pulse fails and the child exits with status 137.

use std::io::Write;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use crate::client::Client;
use crate::config::{EngineConfig, WORKER_CONFIG_ENV};
use crate::error::{ConfigError, Result};
use crate::monitor::{Liveness, MonitorConfig, TaskMonitor};
use crate::router::Router;
use crate::worker::{StopSignal, Worker, WorkerExit};

/// Exit status used when the parent is gone.
pub const PARENT_LOST_EXIT: i32 = 137;

/// Writes one byte per pulse to stdout, which the parent reads.
pub struct PipeLiveness;

impl Liveness for PipeLiveness {
    fn pulse(&self) -> std::io::Result<()> {
        let mut out = std::io::stdout().lock();
        out.write_all(&[0])?;
        out.flush()
    }

    fn lost(&self) {
        error!("Parent process is gone; exiting");
        std::process::exit(PARENT_LOST_EXIT);
    }
}

/// Config handed down by the parent.
pub fn config_from_env() -> std::result::Result<EngineConfig, ConfigError> {
    let raw = std::env::var(WORKER_CONFIG_ENV).map_err(|_| ConfigError::MissingRequired {
        key: WORKER_CONFIG_ENV.to_string(),
        hint: "the worker subcommand is started by the supervisor".to_string(),
    })?;
    EngineConfig::from_json(&raw)
}

/// Run the worker loop until a stop signal or the request limit.
pub async fn run(config: EngineConfig, router: Arc<Router>) -> Result<WorkerExit> {
    let pid = std::process::id();
    let client = Client::open(&config.client).await?;

    let monitor = Arc::new(TaskMonitor::new(
        MonitorConfig::from_config(&config),
        Arc::new(PipeLiveness),
    ));
    monitor.start();

    let stop = Arc::new(StopSignal::new());
    let signals = tokio::spawn(handle_signals(Arc::clone(&stop), Arc::clone(&monitor)));

    let worker = Worker::new(client, router, Arc::clone(&monitor), &config);
    info!(pid, "Worker process running");
    let exit = worker.run(&stop).await;

    signals.abort();
    monitor.stop();
    monitor.join().await;
    info!(pid, ?exit, "Worker process exiting");
    Ok(exit)
}

async fn handle_signals(stop: Arc<StopSignal>, monitor: Arc<TaskMonitor>) {
    let kinds = [
        (SignalKind::terminate(), false),
        (SignalKind::interrupt(), false),
        (SignalKind::user_defined1(), false),
        (SignalKind::hangup(), false),
        (SignalKind::quit(), true),
        (SignalKind::user_defined2(), true),
        (SignalKind::window_change(), true),
    ];

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for (kind, immediate) in kinds {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(immediate).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    while let Some(immediate) = rx.recv().await {
        info!(immediate, "Stop signal received");
        stop.request(immediate);
        monitor.stop_task(immediate);
    }
}

