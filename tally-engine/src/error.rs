//! Error types for tally-engine
//!
//! Only [`EngineError::Configuration`] aborts a pass. Everything else is
//! caught at item, stage or contributor granularity, logged, and carried
//! into the [`crate::RunSummary`].

use crate::models::Stage;
use crate::store::{FieldTypeError, StoreError};
use thiserror::Error;

/// Engine result type
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    /// Required project configuration missing or invalid (fatal)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required stage field was absent, empty or of the wrong type
    #[error("Task {task_id}: {stage} stage field '{field}' {reason}")]
    MissingField {
        task_id: String,
        stage: Stage,
        field: String,
        reason: String,
    },

    /// A store call failed
    #[error("Store call failed during {operation}: {source}")]
    ExternalCall {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Store state did not look the way the engine expects
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// True when the whole pass must abort
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }

    pub fn missing_field(task_id: &str, stage: Stage, field: &str, reason: impl Into<String>) -> Self {
        EngineError::MissingField {
            task_id: task_id.to_string(),
            stage,
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Missing-field error for a field holding the wrong type
    pub fn wrong_type(task_id: &str, stage: Stage, field: &str, err: &FieldTypeError) -> Self {
        Self::missing_field(task_id, stage, field, err.to_string())
    }
}

impl From<tally_common::Error> for EngineError {
    fn from(err: tally_common::Error) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

/// Attach the failing operation to a store error
pub trait StoreResultExt<T> {
    fn during(self, operation: impl Into<String>) -> EngineResult<T>;
}

impl<T> StoreResultExt<T> for Result<T, StoreError> {
    fn during(self, operation: impl Into<String>) -> EngineResult<T> {
        self.map_err(|source| EngineError::ExternalCall {
            operation: operation.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(EngineError::Configuration("ratios".into()).is_fatal());
        assert!(!EngineError::missing_field("t", Stage::Translate, "End", "is empty").is_fatal());
        assert!(!EngineError::InvariantViolation("x".into()).is_fatal());

        let err: Result<(), StoreError> = Err(StoreError::RateLimited);
        assert!(!err.during("query").unwrap_err().is_fatal());
    }

    #[test]
    fn test_missing_field_message_names_task_and_field() {
        let err = EngineError::missing_field("abc", Stage::Translate, "Translated At", "is empty");
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("translate"));
        assert!(msg.contains("Translated At"));
    }

    #[test]
    fn test_common_error_maps_to_configuration() {
        let err: EngineError = tally_common::Error::Config("no key".into()).into();
        assert!(err.is_fatal());
    }
}
