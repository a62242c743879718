//! lease-queue: a lease-based, at-least-once task queue on libSQL, with a
//! supervised pool of worker threads or processes.

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod logging;
pub mod monitor;
pub mod processor;
pub mod queue;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod worker;

pub use client::Client;
pub use error::{Error, Result};
pub use queue::Queue;
