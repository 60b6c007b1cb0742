//! Tenant-scoped document storage.
//!
//! A [`StorageEngine`] hands out [`Collection`]s bound to a namespace. The
//! [`TenantRegistry`] sits in front of the engine, turns a tenant identifier
//! into a namespace, binds each (tenant, entity) pair exactly once and wraps
//! every storage call in a timeout.

use std::time::Duration;

pub mod engine;
pub mod filter;
pub mod journal;
pub mod memory;
pub mod registry;
pub mod schema;

pub use engine::{Collection, Document, ID_FIELD, StorageEngine};
pub use filter::{Bound, Filter, FindOptions, SortDirection, SortSpec, Update, compare_values};
pub use journal::{FileJournal, JournalCheckpointStats, JournalPolicy, JournalRecord};
pub use memory::{FaultPlan, InMemoryEngine};
pub use registry::{RegistryConfig, TenantHandle, TenantId, TenantRegistry};
pub use schema::{FieldKind, FieldSpec, SchemaDescriptor};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("tenant identifier is missing")]
    MissingTenant,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage call '{operation}' timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("collection '{collection}' is already registered in namespace '{namespace}'")]
    DuplicateRegistration {
        namespace: String,
        collection: String,
    },
    #[error("field '{field}' {reason}")]
    SchemaViolation { field: String, reason: String },
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl StoreError {
    /// True for failures of the storage backend itself rather than of the
    /// caller's input.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::Timeout { .. }
                | Self::DuplicateRegistration { .. }
                | Self::Io(_)
                | Self::Parse(_)
        )
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_backend_failures_as_unavailable() {
        assert!(StoreError::Unavailable("down".into()).is_unavailable());
        assert!(
            StoreError::Timeout {
                operation: "insert",
                after: Duration::from_millis(5)
            }
            .is_unavailable()
        );
        assert!(!StoreError::MissingTenant.is_unavailable());
        assert!(
            !StoreError::SchemaViolation {
                field: "status".into(),
                reason: "is required".into()
            }
            .is_unavailable()
        );
    }

    #[test]
    fn timeout_message_reports_operation_and_limit() {
        let err = StoreError::Timeout {
            operation: "find_many",
            after: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "storage call 'find_many' timed out after 250ms"
        );
    }
}
