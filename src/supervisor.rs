//! Supervisor: config loading, OS signals and the engine lifecycle.
//!
//! | signal | action                   |
//! |--------|--------------------------|
//! | TERM   | graceful stop            |
//! | INT    | graceful stop            |
//! | QUIT   | immediate stop           |
//! | USR1   | graceful restart         |
//! | HUP    | immediate restart        |
//! | USR2   | reopen the log file      |
//! | CONT   | graceful binary replace  |
//! | WINCH  | immediate binary replace |
//!
//! Restart reloads the config through the loader. Every action logs its
//! own failure and reports success as a bool; none of them ends `run`
//! except a stop.

use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{ConfigError, Error, Result};
use crate::logging::LogHandle;
use crate::processor::ProcessorFactory;

/// Produces the current config; called at start and on every restart.
pub type ConfigLoader = Box<dyn Fn() -> std::result::Result<EngineConfig, ConfigError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Stop(bool),
    Restart(bool),
    Replace(bool),
    Logrotated,
}

pub struct Supervisor {
    loader: ConfigLoader,
    factory: ProcessorFactory,
    log: Option<LogHandle>,
    engine: OnceCell<Arc<Engine>>,
}

impl Supervisor {
    pub fn new(loader: ConfigLoader, factory: ProcessorFactory) -> Self {
        Self {
            loader,
            factory,
            log: None,
            engine: OnceCell::new(),
        }
    }

    /// Let config reloads retarget and reopen this log.
    pub fn with_log(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    pub fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine.get()
    }

    fn load_config(&self) -> std::result::Result<EngineConfig, ConfigError> {
        let config = (self.loader)()?;
        if let Some(log) = &self.log
            && let Err(e) = log.set_path(config.log.as_deref())
        {
            warn!("Failed to open log file: {e}");
        }
        Ok(config)
    }

    /// Run until stopped. The engine is always shut down before returning.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("lease-queue {}", env!("CARGO_PKG_VERSION"));
        let config = self.load_config()?;
        let engine = Arc::new(Engine::new(config, Arc::clone(&self.factory))?);
        if self.engine.set(Arc::clone(&engine)).is_err() {
            return Err(Error::Config(ConfigError::InvalidValue {
                key: "supervisor".to_string(),
                message: "already running".to_string(),
            }));
        }

        let signals = tokio::spawn(handle_signals(Arc::clone(&self)));
        engine.run().await;
        engine.shutdown(true).await;
        signals.abort();
        info!("Supervisor stopped");
        Ok(())
    }

    pub async fn stop(&self, immediate: bool) -> bool {
        info!(
            "{}",
            if immediate {
                "Received immediate stop"
            } else {
                "Received graceful stop"
            }
        );
        match self.engine() {
            Some(engine) => {
                engine.stop(immediate).await;
                true
            }
            None => false,
        }
    }

    pub async fn restart(&self, immediate: bool) -> bool {
        info!(
            "{}",
            if immediate {
                "Received immediate restart"
            } else {
                "Received graceful restart"
            }
        );
        let Some(engine) = self.engine() else {
            return false;
        };
        let config = match self.load_config() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to restart: {e}");
                return false;
            }
        };
        match engine.restart(immediate, config).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to restart: {e}");
                false
            }
        }
    }

    /// Start a new copy of this binary with the same arguments, then stop.
    pub async fn replace(&self, immediate: bool, command: Option<Vec<String>>) -> bool {
        info!(
            "{}",
            if immediate {
                "Received immediate binary replace"
            } else {
                "Received graceful binary replace"
            }
        );
        let Some(engine) = self.engine() else {
            return false;
        };
        let command = match command {
            Some(command) => command,
            None => match current_command() {
                Ok(command) => command,
                Err(e) => {
                    error!("Failed to replace: {e}");
                    return false;
                }
            },
        };
        match engine.replace(immediate, &command).await {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to replace: {e}");
                false
            }
        }
    }

    pub async fn logrotated(&self) -> bool {
        info!("Reopening log file");
        if let Some(engine) = self.engine() {
            engine.logrotated().await;
        }
        if let Some(log) = &self.log
            && let Err(e) = log.reopen()
        {
            error!("Failed to reopen log file: {e}");
            return false;
        }
        true
    }

    async fn dispatch(&self, action: Action) -> bool {
        match action {
            Action::Stop(immediate) => self.stop(immediate).await,
            Action::Restart(immediate) => self.restart(immediate).await,
            Action::Replace(immediate) => self.replace(immediate, None).await,
            Action::Logrotated => self.logrotated().await,
        }
    }
}

fn current_command() -> std::io::Result<Vec<String>> {
    let exe = std::env::current_exe()?;
    let mut command = vec![exe.to_string_lossy().into_owned()];
    command.extend(std::env::args().skip(1));
    Ok(command)
}

async fn handle_signals(supervisor: Arc<Supervisor>) {
    let kinds = [
        (SignalKind::terminate(), Action::Stop(false)),
        (SignalKind::interrupt(), Action::Stop(false)),
        (SignalKind::quit(), Action::Stop(true)),
        (SignalKind::user_defined1(), Action::Restart(false)),
        (SignalKind::hangup(), Action::Restart(true)),
        (SignalKind::user_defined2(), Action::Logrotated),
        (SignalKind::from_raw(Signal::SIGCONT as i32), Action::Replace(false)),
        (SignalKind::window_change(), Action::Replace(true)),
    ];

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for (kind, action) in kinds {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(e) => {
                error!(?action, "Failed to install signal handler: {e}");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(action).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    // One action at a time, in arrival order.
    while let Some(action) = rx.recv().await {
        supervisor.dispatch(action).await;
    }
}
