//! Persistence layer: the task table and the `Backend` contract over it.

pub mod codec;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{DELETE_OFFSET, LibSqlBackend};
pub use traits::{Backend, HeartbeatParams, NewTask};
