//! In-process processor: the worker loop as a tokio task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::Processor;
use crate::client::Client;
use crate::config::EngineConfig;
use crate::monitor::{MonitorConfig, NoLiveness, TaskMonitor};
use crate::router::Router;
use crate::worker::{StopSignal, Worker, WorkerExit};

struct Running {
    stop: Arc<StopSignal>,
    monitor: Arc<TaskMonitor>,
    handle: JoinHandle<WorkerExit>,
}

impl Running {
    fn request_stop(&self, immediate: bool) {
        self.stop.request(immediate);
        self.monitor.stop_task(immediate);
    }
}

struct State {
    config: EngineConfig,
    client: Option<Client>,
    running: Option<Running>,
    stopped: bool,
}

pub struct ThreadProcessor {
    router: Arc<Router>,
    state: Mutex<State>,
}

impl ThreadProcessor {
    pub fn new(router: Arc<Router>, config: EngineConfig) -> Self {
        Self {
            router,
            state: Mutex::new(State {
                config,
                client: None,
                running: None,
                stopped: false,
            }),
        }
    }

    async fn spawn_worker(&self, state: &mut State) {
        let client = match &state.client {
            Some(client) => client.clone(),
            None => match Client::open(&state.config.client).await {
                Ok(client) => {
                    state.client = Some(client.clone());
                    client
                }
                Err(e) => {
                    error!("Failed to open queue for worker: {e}");
                    return;
                }
            },
        };

        let monitor = Arc::new(TaskMonitor::new(
            MonitorConfig::from_config(&state.config),
            Arc::new(NoLiveness),
        ));
        monitor.start();
        let worker = Worker::new(
            client,
            Arc::clone(&self.router),
            Arc::clone(&monitor),
            &state.config,
        );
        let stop = Arc::new(StopSignal::new());

        let handle = {
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let exit = worker.run(&stop).await;
                worker.monitor().stop();
                worker.monitor().join().await;
                exit
            })
        };
        info!("Worker thread started");
        state.running = Some(Running {
            stop,
            monitor,
            handle,
        });
    }

    /// Await the worker task if it has exited.
    async fn reap(state: &mut State, wait: bool) -> bool {
        let Some(running) = state.running.as_ref() else {
            return true;
        };
        if !wait && !running.handle.is_finished() {
            return false;
        }
        if let Some(running) = state.running.take() {
            match running.handle.await {
                Ok(exit) => info!(?exit, "Worker thread exited"),
                Err(e) => error!("Worker thread ended abnormally: {e}"),
            }
        }
        true
    }
}

#[async_trait]
impl Processor for ThreadProcessor {
    async fn keepalive(&self) {
        let mut state = self.state.lock().await;
        if state.stopped {
            Self::reap(&mut state, false).await;
            return;
        }
        if Self::reap(&mut state, false).await {
            self.spawn_worker(&mut state).await;
        }
    }

    async fn restart(&self, immediate: bool, config: &EngineConfig) {
        let mut state = self.state.lock().await;
        if let Some(running) = state.running.as_ref() {
            running.request_stop(immediate);
        }
        Self::reap(&mut state, true).await;
        if state.config.client != config.client {
            state.client = None;
        }
        state.config = config.clone();
        if !state.stopped {
            self.spawn_worker(&mut state).await;
        }
    }

    async fn stop(&self, immediate: bool) {
        let mut state = self.state.lock().await;
        state.stopped = true;
        if let Some(running) = state.running.as_ref() {
            info!(
                immediate,
                "{}",
                if immediate {
                    "Stopping worker thread immediately"
                } else {
                    "Stopping worker thread gracefully"
                }
            );
            running.request_stop(immediate);
        }
    }

    async fn join(&self) {
        let mut state = self.state.lock().await;
        if !state.stopped {
            warn!("join called on a running worker thread");
        }
        Self::reap(&mut state, true).await;
    }

    async fn is_joined(&self) -> bool {
        let mut state = self.state.lock().await;
        state.stopped && Self::reap(&mut state, false).await
    }
}
