//! Error types for the lease queue.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

impl Error {
    /// The task-level error kind, if this is one.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            Error::Task(e) => Some(e),
            _ => None,
        }
    }

    /// True for `AlreadyExists` / `AlreadyFinished`, which callers under
    /// at-least-once delivery treat as success.
    pub fn is_idempotent(&self) -> bool {
        self.task_error().is_some_and(TaskError::is_idempotent)
    }

    /// True when the caller's lease is no longer valid.
    pub fn is_lease_lost(&self) -> bool {
        self.task_error().is_some_and(TaskError::is_lease_lost)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    /// Lock contention. Retried inside the backend before surfacing.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libSQL error raised by `op`.
    pub(crate) fn from_libsql(op: &str, e: libsql::Error) -> Self {
        let msg = e.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("database is locked")
            || lower.contains("database table is locked")
            || lower.contains("busy")
        {
            DatabaseError::Busy(format!("{op}: {msg}"))
        } else {
            DatabaseError::Query(format!("{op}: {msg}"))
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Busy(_))
    }
}

/// Task lifecycle errors returned by backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task {key} already exists")]
    AlreadyExists { key: String },

    #[error("task {key} is already finished")]
    AlreadyFinished { key: String },

    #[error("task {key} was preempted: {reason}")]
    Preempted { key: String, reason: String },

    #[error("task {key} was cancelled by request")]
    CancelRequested { key: String },

    #[error("task {key} does not exist")]
    NotFound { key: String },
}

impl TaskError {
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            TaskError::AlreadyExists { .. } | TaskError::AlreadyFinished { .. }
        )
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            TaskError::Preempted { .. } | TaskError::CancelRequested { .. }
        )
    }
}

/// Worker process management errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Failed to signal pid {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("Failed to wait for pid {pid}: {reason}")]
    Wait { pid: i32, reason: String },

    #[error("Binary replace already in progress (pid {0})")]
    AlreadyReplaced(u32),
}

/// Failure reported by user task code.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("task aborted: {0}")]
    Aborted(String),

    #[error("undefined decision {decision} options={options}")]
    UndefinedDecision { decision: String, options: String },

    #[error(transparent)]
    Queue(#[from] Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_kinds() {
        let exists: Error = TaskError::AlreadyExists { key: "a".into() }.into();
        let finished: Error = TaskError::AlreadyFinished { key: "a".into() }.into();
        let preempted: Error = TaskError::Preempted {
            key: "a".into(),
            reason: "gone".into(),
        }
        .into();
        assert!(exists.is_idempotent());
        assert!(finished.is_idempotent());
        assert!(!preempted.is_idempotent());
        assert!(preempted.is_lease_lost());
    }

    #[test]
    fn cancel_is_lease_loss_not_idempotent() {
        let err: Error = TaskError::CancelRequested { key: "a".into() }.into();
        assert!(err.is_lease_lost());
        assert!(!err.is_idempotent());
    }

    #[test]
    fn database_errors_are_not_task_errors() {
        let err: Error = DatabaseError::Query("boom".into()).into();
        assert!(err.task_error().is_none());
        assert!(!err.is_lease_lost());
    }

    #[test]
    fn process_errors_name_the_pid() {
        let err: Error = ProcessError::Wait {
            pid: 42,
            reason: "ECHILD".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Failed to wait for pid 42: ECHILD");
        assert!(err.task_error().is_none());
    }
}
