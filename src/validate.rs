//! Argument validation shared by every scalar function and virtual table.
//!
//! Kept deliberately small and synchronous: these run inline on the FFI
//! boundary before a transaction is opened, so a bad argument never touches
//! the database.

use crate::error::EngineError;

const MAX_NAME_LEN: usize = 512;

fn non_empty(value: &str, what: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{what} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(EngineError::Invalid(format!(
            "{what} must not exceed {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

pub fn queue_name(value: &str) -> Result<(), EngineError> {
    non_empty(value, "queue_name")
}

pub fn task_name(value: &str) -> Result<(), EngineError> {
    non_empty(value, "task_name")
}

pub fn event_name(value: &str) -> Result<(), EngineError> {
    non_empty(value, "event_name")
}

pub fn step_name(value: &str) -> Result<(), EngineError> {
    non_empty(value, "step_name")
}

pub fn checkpoint_name(value: &str) -> Result<(), EngineError> {
    non_empty(value, "checkpoint_name")
}

/// Validates that `value` parses as JSON when present, passing through `None`.
pub fn optional_json(value: Option<&str>, what: &str) -> Result<(), EngineError> {
    if let Some(text) = value {
        serde_json::from_str::<serde_json::Value>(text)
            .map_err(|_| EngineError::Invalid(format!("{what} is not valid json")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_queue_name() {
        assert!(queue_name("   ").is_err());
    }

    #[test]
    fn accepts_reasonable_names() {
        assert!(queue_name("orders").is_ok());
        assert!(event_name("payment.settled").is_ok());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(optional_json(Some("{not json"), "params").is_err());
        assert!(optional_json(None, "params").is_ok());
    }
}
