use schema::ValidationError;
use store::StoreError;
use thiserror::Error;

/// Failure taxonomy shared by every feedback operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedbackError {
    #[error("company code is required")]
    MissingTenant,
    #[error("feedback not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl FeedbackError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn not_found(id: &str) -> Self {
        Self::NotFound(id.to_string())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingTenant => 401,
            Self::NotFound(_) => 404,
            Self::InvalidRequest(_) => 400,
            Self::StorageUnavailable(_) => 503,
        }
    }
}

impl From<StoreError> for FeedbackError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::MissingTenant => Self::MissingTenant,
            StoreError::SchemaViolation { field, reason } => {
                Self::InvalidRequest(format!("{field} {reason}"))
            }
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<ValidationError> for FeedbackError {
    fn from(value: ValidationError) -> Self {
        Self::InvalidRequest(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn store_errors_map_onto_the_taxonomy() {
        assert_eq!(
            FeedbackError::from(StoreError::MissingTenant),
            FeedbackError::MissingTenant
        );
        let timeout = FeedbackError::from(StoreError::Timeout {
            operation: "count",
            after: Duration::from_millis(10),
        });
        assert_eq!(timeout.status_code(), 503);
        let violation = FeedbackError::from(StoreError::SchemaViolation {
            field: "status".into(),
            reason: "is required".into(),
        });
        assert_eq!(violation, FeedbackError::invalid("status is required"));
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        let err = FeedbackError::from(ValidationError::InvalidRange("rating"));
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "invalid request: value out of range: rating");
    }
}
