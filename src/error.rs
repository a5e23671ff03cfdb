//! Error kinds surfaced to SQL callers.
//!
//! A single `thiserror` enum with `From` impls for the lower-level error types
//! each module needs to bubble through `?`, plus a stable `KIND: message`
//! rendering so hosts can pattern-match on the SQLite error text.

use sqlite_loadable::Error as LoadableError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no such {0}")]
    NotFound(String),

    #[error("task is cancelled")]
    Cancelled,

    #[error("checkpoint is owned by a different live run")]
    CheckpointConflict,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("sqlite error: {0}")]
    Sql(String),
}

impl EngineError {
    fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NotFound",
            EngineError::Cancelled => "CancelledError",
            EngineError::CheckpointConflict => "CheckpointConflict",
            EngineError::Invalid(_) => "Invalid",
            EngineError::Sql(_) => "Sql",
        }
    }

    /// Stable `KIND: message` prefix callers can match on, e.g. `LIKE 'CancelledError:%'`.
    pub fn sql_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<LoadableError> for EngineError {
    fn from(error: LoadableError) -> EngineError {
        EngineError::Sql(error.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> EngineError {
        EngineError::Invalid(format!("bad json: {error}"))
    }
}

impl From<EngineError> for LoadableError {
    fn from(error: EngineError) -> LoadableError {
        LoadableError::new_message(error.sql_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_message_is_stable() {
        assert_eq!(EngineError::Cancelled.sql_message(), "CancelledError: task is cancelled");
    }

    #[test]
    fn not_found_carries_the_entity_name() {
        let err = EngineError::NotFound("task".to_string());
        assert!(err.sql_message().starts_with("NotFound: no such task"));
    }
}
