//! Error types for the scheduler.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: i64 },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn task_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "task".to_string(),
            id,
        }
    }

    pub fn execution_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "execution".to_string(),
            id,
        }
    }
}

/// A cron expression that cannot be evaluated.
///
/// Carries the expression as written so the diagnostic stored on the task
/// points at the exact definition the user has to fix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cron expression '{expression}': {message}")]
pub struct CronError {
    pub expression: String,
    pub message: String,
}

impl CronError {
    pub fn new(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            message: message.into(),
        }
    }
}

/// Launch-level command failures (the command never produced an exit status).
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn '{shell}': {reason}")]
    Spawn { shell: String, reason: String },

    #[error("IO error while running command: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
