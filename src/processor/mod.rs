//! Processors: one execution unit of the engine pool.
//!
//! `ThreadProcessor` runs the worker loop as a tokio task inside the
//! supervisor. `SpawnProcessor` runs it in a child process started from
//! `worker_command` and watches the child's liveness pipe.

pub mod child;
pub mod spawn;
pub mod thread;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EngineConfig, ProcessorType};
use crate::router::Router;

pub use spawn::SpawnProcessor;
pub use thread::ThreadProcessor;

#[async_trait]
pub trait Processor: Send + Sync {
    /// Restart the unit if it died; reap it if stopping. Called about once
    /// a second by the engine.
    async fn keepalive(&self);

    /// Stop the current unit and run the next one with `config`.
    async fn restart(&self, immediate: bool, config: &EngineConfig);

    /// Stop without restarting. Idempotent.
    async fn stop(&self, immediate: bool);

    /// Wait until the unit has exited after `stop`.
    async fn join(&self);

    /// True once the unit has exited after `stop`.
    async fn is_joined(&self) -> bool;

    /// The log file was rotated.
    async fn logrotated(&self) {}
}

/// Builds processors for the engine pool.
pub type ProcessorFactory = Arc<dyn Fn(&EngineConfig) -> Box<dyn Processor> + Send + Sync>;

/// Factory for the processor type named in the config.
pub fn default_factory(router: Arc<Router>) -> ProcessorFactory {
    Arc::new(move |config: &EngineConfig| -> Box<dyn Processor> {
        match config.processor_type {
            ProcessorType::Thread => Box::new(ThreadProcessor::new(Arc::clone(&router), config.clone())),
            ProcessorType::Process => Box::new(SpawnProcessor::new(config.clone())),
        }
    })
}
