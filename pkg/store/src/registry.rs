//! Tenant resolution: tenant identifier to a bound, cached collection handle.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    StoreError,
    engine::{Collection, Document, StorageEngine},
    filter::{Filter, FindOptions, Update},
    schema::SchemaDescriptor,
};

const NAMESPACE_PREFIX: &str = "company_";

/// Normalized tenant identifier: trimmed, ASCII-lowercased, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StoreError::MissingTenant);
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        format!("{NAMESPACE_PREFIX}{sanitized}")
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryConfig {
    /// Upper bound for every storage call, binding included. `None` waits
    /// indefinitely.
    pub call_timeout: Option<Duration>,
}

type BindingKey = (TenantId, String);

pub struct TenantRegistry {
    engine: Arc<dyn StorageEngine>,
    config: RegistryConfig,
    bindings: Mutex<HashMap<BindingKey, Arc<OnceCell<TenantHandle>>>>,
    binds_completed: AtomicU64,
}

impl TenantRegistry {
    pub fn new(engine: Arc<dyn StorageEngine>, config: RegistryConfig) -> Self {
        Self {
            engine,
            config,
            bindings: Mutex::new(HashMap::new()),
            binds_completed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the handle for `entity` within `tenant`, binding it on first use.
    ///
    /// Concurrent first calls for the same pair wait on a single bind. A failed
    /// bind is not cached; the next call retries.
    pub async fn resolve(
        &self,
        tenant: &str,
        entity: &str,
        schema: &SchemaDescriptor,
    ) -> Result<TenantHandle, StoreError> {
        let tenant = TenantId::parse(tenant)?;
        let cell = {
            let mut bindings = self.bindings.lock();
            Arc::clone(
                bindings
                    .entry((tenant.clone(), entity.to_string()))
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };
        if let Some(handle) = cell.get() {
            debug!(%tenant, entity, "tenant binding cache hit");
            return Ok(handle.clone());
        }
        let handle = cell
            .get_or_try_init(|| self.bind(&tenant, entity, schema))
            .await?;
        Ok(handle.clone())
    }

    async fn bind(
        &self,
        tenant: &TenantId,
        entity: &str,
        schema: &SchemaDescriptor,
    ) -> Result<TenantHandle, StoreError> {
        let namespace = tenant.namespace();
        let bound = match with_timeout(
            "bind",
            self.config.call_timeout,
            self.engine.bind(&namespace, entity, schema),
        )
        .await
        {
            Err(StoreError::DuplicateRegistration { .. }) => {
                self.adopt_registered(&namespace, entity).await
            }
            other => other,
        };
        match bound {
            Ok(collection) => {
                self.binds_completed.fetch_add(1, Ordering::SeqCst);
                info!(%tenant, namespace, entity, "bound tenant collection");
                Ok(TenantHandle {
                    tenant: tenant.clone(),
                    collection,
                    call_timeout: self.config.call_timeout,
                })
            }
            Err(err) => {
                warn!(%tenant, namespace, entity, error = %err, "tenant binding failed");
                Err(err)
            }
        }
    }

    /// Picks up a collection left registered by an earlier bind whose result
    /// was lost, e.g. to a timeout.
    async fn adopt_registered(
        &self,
        namespace: &str,
        entity: &str,
    ) -> Result<Arc<dyn Collection>, StoreError> {
        let existing = with_timeout(
            "lookup",
            self.config.call_timeout,
            self.engine.lookup(namespace, entity),
        )
        .await?;
        match existing {
            Some(collection) => {
                info!(namespace, entity, "adopted collection registered by an earlier bind");
                Ok(collection)
            }
            None => Err(StoreError::Unavailable(format!(
                "collection '{entity}' reported as registered in '{namespace}' but not found"
            ))),
        }
    }

    /// Successful binds performed so far.
    pub fn bind_count(&self) -> u64 {
        self.binds_completed.load(Ordering::SeqCst)
    }

    /// Number of (tenant, entity) pairs holding a live binding.
    pub fn cached_bindings(&self) -> usize {
        self.bindings
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn cached_tenants(&self) -> Vec<String> {
        let bindings = self.bindings.lock();
        let mut tenants: Vec<String> = bindings
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|((tenant, _), _)| tenant.to_string())
            .collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }
}

impl fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("config", &self.config)
            .field("cached_bindings", &self.cached_bindings())
            .field("bind_count", &self.bind_count())
            .finish()
    }
}

/// A bound (tenant, entity) collection. Cheap to clone; every call is subject
/// to the registry's call timeout.
#[derive(Clone)]
pub struct TenantHandle {
    tenant: TenantId,
    collection: Arc<dyn Collection>,
    call_timeout: Option<Duration>,
}

impl TenantHandle {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn namespace(&self) -> &str {
        self.collection.namespace()
    }

    pub fn entity(&self) -> &str {
        self.collection.name()
    }

    pub fn same_binding(&self, other: &TenantHandle) -> bool {
        Arc::ptr_eq(&self.collection, &other.collection)
    }

    pub async fn insert(&self, document: Document) -> Result<Document, StoreError> {
        with_timeout("insert", self.call_timeout, self.collection.insert(document)).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StoreError> {
        with_timeout("find_by_id", self.call_timeout, self.collection.find_by_id(id)).await
    }

    pub async fn find_many(
        &self,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        with_timeout(
            "find_many",
            self.call_timeout,
            self.collection.find_many(filter, options),
        )
        .await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        with_timeout("count", self.call_timeout, self.collection.count(filter)).await
    }

    pub async fn update_by_id(
        &self,
        id: &str,
        update: &Update,
    ) -> Result<Option<Document>, StoreError> {
        with_timeout(
            "update_by_id",
            self.call_timeout,
            self.collection.update_by_id(id, update),
        )
        .await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<Option<Document>, StoreError> {
        with_timeout(
            "delete_by_id",
            self.call_timeout,
            self.collection.delete_by_id(id),
        )
        .await
    }

    pub async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError> {
        with_timeout(
            "delete_many",
            self.call_timeout,
            self.collection.delete_many(filter),
        )
        .await
    }
}

impl fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantHandle")
            .field("tenant", &self.tenant)
            .field("namespace", &self.collection.namespace())
            .field("entity", &self.collection.name())
            .finish()
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    limit: Option<Duration>,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match limit {
        None => call.await,
        Some(after) => tokio::time::timeout(after, call)
            .await
            .map_err(|_| StoreError::Timeout { operation, after })?,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::InMemoryEngine;

    fn registry_with(
        engine: Arc<InMemoryEngine>,
        call_timeout: Option<Duration>,
    ) -> TenantRegistry {
        TenantRegistry::new(engine, RegistryConfig { call_timeout })
    }

    #[test]
    fn tenant_ids_are_trimmed_and_lowercased() {
        let tenant = TenantId::parse("  ACME ").expect("valid tenant");
        assert_eq!(tenant.as_str(), "acme");
        assert_eq!(tenant.namespace(), "company_acme");
        assert_eq!(
            TenantId::parse("a/b c").expect("valid").namespace(),
            "company_a_b_c"
        );
    }

    #[tokio::test]
    async fn missing_tenant_fails_before_touching_storage() {
        let engine = Arc::new(InMemoryEngine::new());
        let registry = registry_with(Arc::clone(&engine), None);
        for raw in ["", "   "] {
            let err = registry
                .resolve(raw, "Feedback", &SchemaDescriptor::new())
                .await
                .expect_err("empty tenant");
            assert_eq!(err, StoreError::MissingTenant);
        }
        assert_eq!(engine.bind_calls(), 0);
        assert!(engine.namespaces().is_empty());
    }

    #[tokio::test]
    async fn bind_left_registered_by_lost_attempt_is_adopted() {
        let engine = Arc::new(InMemoryEngine::new());
        let earlier = engine
            .bind("company_acme", "Feedback", &SchemaDescriptor::new())
            .await
            .expect("engine-side registration");
        let mut document = Document::new();
        document.insert("title".into(), json!("kept"));
        let stored = earlier.insert(document).await.expect("insert");
        let id = stored
            .get(crate::ID_FIELD)
            .and_then(|v| v.as_str())
            .expect("id")
            .to_string();

        let registry = registry_with(Arc::clone(&engine), Some(Duration::from_secs(1)));
        let handle = registry
            .resolve("ACME", "Feedback", &SchemaDescriptor::new())
            .await
            .expect("duplicate registration resolves to the existing collection");
        assert!(handle.find_by_id(&id).await.expect("read").is_some());
        assert_eq!(registry.bind_count(), 1);
        assert_eq!(engine.bind_calls(), 2);
        assert_eq!(engine.collections("company_acme"), vec!["Feedback"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_resolutions_bind_once() {
        let engine = Arc::new(InMemoryEngine::new());
        engine
            .faults()
            .set_bind_latency(Some(Duration::from_millis(30)));
        let registry = Arc::new(registry_with(Arc::clone(&engine), None));

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..16 {
            let registry = Arc::clone(&registry);
            let raw = if n % 2 == 0 { "acme" } else { " ACME " };
            tasks.spawn(async move {
                registry
                    .resolve(raw, "Feedback", &SchemaDescriptor::new())
                    .await
            });
        }
        let mut handles = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            handles.push(joined.expect("task").expect("resolve"));
        }
        assert_eq!(engine.bind_calls(), 1);
        assert_eq!(registry.bind_count(), 1);
        assert!(handles.windows(2).all(|w| w[0].same_binding(&w[1])));
        assert_eq!(registry.cached_tenants(), vec!["acme"]);
        assert_eq!(registry.cached_bindings(), 1);
    }

    #[tokio::test]
    async fn failed_bind_is_retried_on_next_call() {
        let engine = Arc::new(InMemoryEngine::new());
        let registry = registry_with(Arc::clone(&engine), None);
        engine.faults().set_unavailable(true);
        let err = registry
            .resolve("acme", "Feedback", &SchemaDescriptor::new())
            .await
            .expect_err("engine offline");
        assert!(err.is_unavailable());
        assert!(registry.cached_tenants().is_empty());

        engine.faults().set_unavailable(false);
        registry
            .resolve("acme", "Feedback", &SchemaDescriptor::new())
            .await
            .expect("retry binds");
        assert_eq!(engine.bind_calls(), 2);
        assert_eq!(registry.bind_count(), 1);
    }

    #[tokio::test]
    async fn tenants_never_see_each_others_records() {
        let engine = Arc::new(InMemoryEngine::new());
        let registry = registry_with(engine, None);
        let schema = SchemaDescriptor::new();
        let acme = registry.resolve("acme", "Feedback", &schema).await.expect("acme");
        let globex = registry
            .resolve("globex", "Feedback", &schema)
            .await
            .expect("globex");
        let stored = acme
            .insert(json!({"title": "private"}).as_object().cloned().unwrap_or_default())
            .await
            .expect("insert");
        let id = stored["_id"].as_str().expect("id").to_string();

        assert!(globex.find_by_id(&id).await.expect("find").is_none());
        assert_eq!(globex.count(&Filter::All).await.expect("count"), 0);
        assert_eq!(globex.delete_by_id(&id).await.expect("delete"), None);
        assert!(acme.find_by_id(&id).await.expect("find").is_some());
        assert_eq!(acme.namespace(), "company_acme");
        assert_eq!(globex.namespace(), "company_globex");
    }

    #[tokio::test]
    async fn stalled_calls_time_out_instead_of_hanging() {
        let engine = Arc::new(InMemoryEngine::new());
        let registry = registry_with(Arc::clone(&engine), Some(Duration::from_millis(50)));
        let handle = registry
            .resolve("acme", "Feedback", &SchemaDescriptor::new())
            .await
            .expect("resolve");
        engine.faults().stall_document("stuck");
        let err = handle.find_by_id("stuck").await.expect_err("stalled");
        assert!(matches!(
            err,
            StoreError::Timeout {
                operation: "find_by_id",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_bind_times_out_and_is_not_cached() {
        let engine = Arc::new(InMemoryEngine::new());
        engine
            .faults()
            .set_bind_latency(Some(Duration::from_millis(200)));
        let registry = registry_with(Arc::clone(&engine), Some(Duration::from_millis(20)));
        let err = registry
            .resolve("acme", "Feedback", &SchemaDescriptor::new())
            .await
            .expect_err("bind too slow");
        assert!(matches!(err, StoreError::Timeout { operation: "bind", .. }));

        engine.faults().set_bind_latency(None);
        registry
            .resolve("acme", "Feedback", &SchemaDescriptor::new())
            .await
            .expect("second attempt binds");
        assert_eq!(registry.bind_count(), 1);
    }
}
