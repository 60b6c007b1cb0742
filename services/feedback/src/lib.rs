pub mod analytics;
pub mod api;
pub mod bulk;
pub mod error;
pub mod lifecycle;
pub mod query;
pub mod repository;
pub mod transport;
pub mod transport_axum;

use std::sync::Arc;

use store::{InMemoryEngine, RegistryConfig, StorageEngine, TenantRegistry};

pub use analytics::{AnalyticsScope, FeedbackAnalytics};
pub use bulk::{BulkCoordinator, BulkDeleteOutcome, BulkUpdateOutcome};
pub use error::FeedbackError;
pub use lifecycle::{
    Actor, ConsistencyMode, CreatedFeedback, DeleteOutcome, LifecycleCoordinator, PairLocks,
    ResponseInput,
};
pub use query::{FeedbackPage, ListQuery};
pub use repository::FeedbackStore;

/// Entry point for every tenant-scoped operation. Owns the registry and the
/// pair locks shared by all coordinators it hands out.
#[derive(Debug, Clone)]
pub struct FeedbackService {
    registry: Arc<TenantRegistry>,
    consistency: ConsistencyMode,
    pairs: Arc<PairLocks>,
}

impl FeedbackService {
    pub fn new(registry: Arc<TenantRegistry>, consistency: ConsistencyMode) -> Self {
        Self {
            registry,
            consistency,
            pairs: Arc::default(),
        }
    }

    pub fn with_engine(
        engine: Arc<dyn StorageEngine>,
        config: RegistryConfig,
        consistency: ConsistencyMode,
    ) -> Self {
        Self::new(Arc::new(TenantRegistry::new(engine, config)), consistency)
    }

    pub fn in_memory() -> Self {
        Self::with_engine(
            Arc::new(InMemoryEngine::new()),
            RegistryConfig::default(),
            ConsistencyMode::default(),
        )
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn consistency(&self) -> ConsistencyMode {
        self.consistency
    }

    pub async fn store(&self, tenant: &str) -> Result<FeedbackStore, FeedbackError> {
        FeedbackStore::open(&self.registry, tenant).await
    }

    pub async fn lifecycle(&self, tenant: &str) -> Result<LifecycleCoordinator, FeedbackError> {
        let store = self.store(tenant).await?;
        Ok(LifecycleCoordinator::new(
            store,
            self.consistency,
            Arc::clone(&self.pairs),
        ))
    }

    pub async fn bulk(&self, tenant: &str) -> Result<BulkCoordinator, FeedbackError> {
        Ok(BulkCoordinator::new(self.store(tenant).await?))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use schema::{FeedbackType, NewFeedback};

    use super::*;

    #[tokio::test]
    async fn blank_tenant_is_rejected_before_binding() {
        let service = FeedbackService::in_memory();
        assert_eq!(
            service.store("  ").await.map(|_| ()),
            Err(FeedbackError::MissingTenant)
        );
        assert_eq!(service.registry().bind_count(), 0);
    }

    #[tokio::test]
    async fn coordinators_share_one_binding_per_tenant() {
        let service = FeedbackService::in_memory();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let lifecycle = service.lifecycle("ACME").await.expect("lifecycle");
        let created = lifecycle
            .create(
                NewFeedback::new(FeedbackType::SelfFeedback),
                &Actor::system(),
                now,
            )
            .await
            .expect("create");
        let bulk = service.bulk("acme").await.expect("bulk");
        let outcome = bulk
            .bulk_delete(vec![created.feedback.id])
            .await
            .expect("delete");
        assert_eq!(outcome.deleted_count, 1);
        assert_eq!(service.registry().bind_count(), 1);
    }
}
