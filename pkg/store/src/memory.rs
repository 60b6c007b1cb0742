//! In-process storage engine, optionally journaled to disk.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    StoreError,
    engine::{Collection, Document, ID_FIELD, StorageEngine, document_id},
    filter::{Filter, FindOptions, Update, compare_documents},
    journal::{FileJournal, JournalPolicy, JournalRecord},
    schema::SchemaDescriptor,
};

const STALL_DURATION: Duration = Duration::from_secs(3600);

/// Fault injection knobs shared by an engine and all of its collections.
#[derive(Debug, Default)]
pub struct FaultPlan {
    unavailable: AtomicBool,
    bind_latency: Mutex<Option<Duration>>,
    call_latency: Mutex<Option<Duration>>,
    stalled_ids: Mutex<HashSet<String>>,
    failing_ids: Mutex<HashSet<String>>,
}

impl FaultPlan {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_bind_latency(&self, latency: Option<Duration>) {
        *self.bind_latency.lock() = latency;
    }

    pub fn set_call_latency(&self, latency: Option<Duration>) {
        *self.call_latency.lock() = latency;
    }

    /// Calls addressing `id` hang until released.
    pub fn stall_document(&self, id: &str) {
        self.stalled_ids.lock().insert(id.to_string());
    }

    /// Calls addressing `id` fail as unavailable.
    pub fn fail_document(&self, id: &str) {
        self.failing_ids.lock().insert(id.to_string());
    }

    pub fn release_document(&self, id: &str) {
        self.stalled_ids.lock().remove(id);
        self.failing_ids.lock().remove(id);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "storage engine is offline".to_string(),
            ));
        }
        Ok(())
    }

    async fn before_bind(&self) -> Result<(), StoreError> {
        self.check_available()?;
        let latency = *self.bind_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    async fn before_call(&self, id: Option<&str>) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(id) = id {
            if self.failing_ids.lock().contains(id) {
                return Err(StoreError::Unavailable(format!(
                    "document '{id}' is unreachable"
                )));
            }
            let stalled = self.stalled_ids.lock().contains(id);
            if stalled {
                tokio::time::sleep(STALL_DURATION).await;
            }
        }
        let latency = *self.call_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEngine {
    namespaces: RwLock<HashMap<String, HashMap<String, Arc<MemoryCollection>>>>,
    journal: Option<(PathBuf, JournalPolicy)>,
    faults: Arc<FaultPlan>,
    bind_calls: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists every collection under `<root>/<namespace>/<collection>.jsonl`.
    pub fn with_journal(root: impl Into<PathBuf>, policy: JournalPolicy) -> Self {
        Self {
            journal: Some((root.into(), policy)),
            ..Self::default()
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Bind attempts, including failed and duplicate ones.
    pub fn bind_calls(&self) -> u64 {
        self.bind_calls.load(Ordering::SeqCst)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn collections(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .namespaces
            .read()
            .get(namespace)
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn register(
        &self,
        namespace: &str,
        collection: &str,
        schema: &SchemaDescriptor,
    ) -> Result<Arc<MemoryCollection>, StoreError> {
        let mut namespaces = self.namespaces.write();
        let collections = namespaces.entry(namespace.to_string()).or_default();
        if collections.contains_key(collection) {
            return Err(StoreError::DuplicateRegistration {
                namespace: namespace.to_string(),
                collection: collection.to_string(),
            });
        }
        let journal = match &self.journal {
            Some((root, policy)) => {
                let path = root
                    .join(sanitize_path_component(namespace))
                    .join(format!("{}.jsonl", sanitize_path_component(collection)));
                Some(FileJournal::open_with_policy(path, policy.clone())?)
            }
            None => None,
        };
        let handle = Arc::new(MemoryCollection::open(
            namespace,
            collection,
            schema.clone(),
            journal,
            Arc::clone(&self.faults),
        )?);
        collections.insert(collection.to_string(), Arc::clone(&handle));
        Ok(handle)
    }
}

#[async_trait]
impl StorageEngine for InMemoryEngine {
    async fn bind(
        &self,
        namespace: &str,
        collection: &str,
        schema: &SchemaDescriptor,
    ) -> Result<Arc<dyn Collection>, StoreError> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        self.faults.before_bind().await?;
        let handle: Arc<dyn Collection> = self.register(namespace, collection, schema)?;
        Ok(handle)
    }

    async fn lookup(
        &self,
        namespace: &str,
        collection: &str,
    ) -> Result<Option<Arc<dyn Collection>>, StoreError> {
        self.faults.check_available()?;
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|collections| collections.get(collection))
            .map(|handle| Arc::clone(handle) as Arc<dyn Collection>))
    }
}

struct StoredDocument {
    seq: u64,
    document: Document,
}

struct CollectionState {
    documents: HashMap<String, StoredDocument>,
    next_seq: u64,
    journal: Option<FileJournal>,
}

impl CollectionState {
    fn put(&mut self, id: &str, document: Document) -> Result<(), StoreError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append_put(&document)?;
        }
        self.apply_put(id, document);
        self.checkpoint_if_due()
    }

    fn remove(&mut self, id: &str) -> Result<Option<Document>, StoreError> {
        if !self.documents.contains_key(id) {
            return Ok(None);
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.append_delete(id)?;
        }
        let removed = self.documents.remove(id).map(|stored| stored.document);
        self.checkpoint_if_due()?;
        Ok(removed)
    }

    fn apply_put(&mut self, id: &str, document: Document) {
        match self.documents.get_mut(id) {
            Some(stored) => stored.document = document,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.documents
                    .insert(id.to_string(), StoredDocument { seq, document });
            }
        }
    }

    fn checkpoint_if_due(&mut self) -> Result<(), StoreError> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        if !journal.should_checkpoint() {
            return Ok(());
        }
        let mut live: Vec<&StoredDocument> = self.documents.values().collect();
        live.sort_by_key(|stored| stored.seq);
        let stats = journal.checkpoint(live.into_iter().map(|stored| &stored.document))?;
        debug!(
            path = %journal.path().display(),
            snapshot_records = stats.snapshot_records,
            truncated = stats.truncated_journal_records,
            "compacted collection journal"
        );
        Ok(())
    }
}

pub struct MemoryCollection {
    namespace: String,
    name: String,
    schema: SchemaDescriptor,
    state: RwLock<CollectionState>,
    faults: Arc<FaultPlan>,
}

impl MemoryCollection {
    fn open(
        namespace: &str,
        name: &str,
        schema: SchemaDescriptor,
        journal: Option<FileJournal>,
        faults: Arc<FaultPlan>,
    ) -> Result<Self, StoreError> {
        let mut state = CollectionState {
            documents: HashMap::new(),
            next_seq: 0,
            journal: None,
        };
        if let Some(journal) = &journal {
            let records = journal.replay()?;
            let replayed = records.len();
            for record in records {
                match record {
                    JournalRecord::Put { doc } => {
                        let id = document_id(&doc)
                            .ok_or_else(|| {
                                StoreError::Parse("journal record is missing _id".to_string())
                            })?
                            .to_string();
                        state.apply_put(&id, doc);
                    }
                    JournalRecord::Delete { id } => {
                        state.documents.remove(&id);
                    }
                }
            }
            info!(
                namespace,
                collection = name,
                replayed,
                live = state.documents.len(),
                "replayed collection journal"
            );
        }
        state.journal = journal;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            schema,
            state: RwLock::new(state),
            faults,
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, mut document: Document) -> Result<Document, StoreError> {
        self.faults.before_call(None).await?;
        let id = Uuid::new_v4().simple().to_string();
        document.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        self.schema.apply_defaults(&mut document);
        self.schema.validate(&document)?;
        self.state.write().put(&id, document.clone())?;
        Ok(document)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.faults.before_call(Some(id)).await?;
        Ok(self
            .state
            .read()
            .documents
            .get(id)
            .map(|stored| stored.document.clone()))
    }

    async fn find_many(
        &self,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        self.faults.before_call(None).await?;
        let state = self.state.read();
        let mut matched: Vec<&StoredDocument> = state
            .documents
            .values()
            .filter(|stored| filter.matches(&stored.document))
            .collect();
        matched.sort_by(|left, right| {
            compare_documents(&left.document, &right.document, &options.sort)
                .then(left.seq.cmp(&right.seq))
        });
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .map(|stored| stored.document.clone())
            .collect())
    }

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        self.faults.before_call(None).await?;
        let state = self.state.read();
        Ok(state
            .documents
            .values()
            .filter(|stored| filter.matches(&stored.document))
            .count() as u64)
    }

    async fn update_by_id(
        &self,
        id: &str,
        update: &Update,
    ) -> Result<Option<Document>, StoreError> {
        self.faults.before_call(Some(id)).await?;
        self.schema.validate_update(update)?;
        let mut state = self.state.write();
        let Some(stored) = state.documents.get(id) else {
            return Ok(None);
        };
        let mut next = stored.document.clone();
        update.apply(&mut next)?;
        state.put(id, next.clone())?;
        Ok(Some(next))
    }

    async fn delete_by_id(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.faults.before_call(Some(id)).await?;
        self.state.write().remove(id)
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError> {
        self.faults.before_call(None).await?;
        let mut state = self.state.write();
        let ids: Vec<String> = state
            .documents
            .iter()
            .filter(|(_, stored)| filter.matches(&stored.document))
            .map(|(id, _)| id.clone())
            .collect();
        let mut deleted = 0u64;
        for id in ids {
            if state.remove(&id)?.is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn sanitize_path_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "_".to_string() } else { out }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::remove_dir_all,
        time::{SystemTime, UNIX_EPOCH},
    };

    use serde_json::json;

    use super::*;
    use crate::{filter::SortSpec, schema::{FieldKind, FieldSpec}};

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new()
            .field(
                FieldSpec::new("status", FieldKind::String)
                    .one_of(["Not Started", "Completed"])
                    .default_value("Not Started"),
            )
            .field(FieldSpec::new("history", FieldKind::Array).default_value(json!([])))
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    fn temp_root() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("feedback-engine-{}-{nanos}", std::process::id()))
    }

    #[tokio::test]
    async fn second_registration_in_same_namespace_is_rejected() {
        let engine = InMemoryEngine::new();
        engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("first bind");
        let err = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .err()
            .expect("duplicate bind fails");
        assert!(matches!(err, StoreError::DuplicateRegistration { .. }));
        engine
            .bind("company_globex", "Feedback", &schema())
            .await
            .expect("other namespace binds");
        assert_eq!(engine.namespaces(), vec!["company_acme", "company_globex"]);
        assert_eq!(engine.bind_calls(), 3);
    }

    #[tokio::test]
    async fn insert_assigns_identifier_and_defaults() {
        let engine = InMemoryEngine::new();
        let collection = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("bind");
        let stored = collection
            .insert(doc(json!({"title": "hello"})))
            .await
            .expect("insert");
        let id = document_id(&stored).expect("id assigned").to_string();
        assert_eq!(stored["status"], "Not Started");
        let fetched = collection.find_by_id(&id).await.expect("find");
        assert_eq!(fetched, Some(stored));
    }

    #[tokio::test]
    async fn insert_rejects_schema_violations() {
        let engine = InMemoryEngine::new();
        let collection = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("bind");
        let err = collection
            .insert(doc(json!({"status": "Paused"})))
            .await
            .expect_err("invalid status");
        assert!(matches!(err, StoreError::SchemaViolation { .. }));
        assert_eq!(collection.count(&Filter::All).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn find_many_sorts_then_pages() {
        let engine = InMemoryEngine::new();
        let collection = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("bind");
        for day in 1..=5 {
            collection
                .insert(doc(json!({
                    "createdAt": format!("2026-10-0{day}T00:00:00.000Z"),
                    "day": day,
                })))
                .await
                .expect("insert");
        }
        let page = collection
            .find_many(
                &Filter::All,
                &FindOptions::default()
                    .sorted_by(SortSpec::descending("createdAt"))
                    .page(1, 2),
            )
            .await
            .expect("find");
        let days: Vec<i64> = page.iter().filter_map(|d| d["day"].as_i64()).collect();
        assert_eq!(days, vec![4, 3]);
    }

    #[tokio::test]
    async fn concurrent_pushes_are_never_lost() {
        let engine = InMemoryEngine::new();
        let collection = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("bind");
        let stored = collection.insert(Document::new()).await.expect("insert");
        let id = document_id(&stored).expect("id").to_string();

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..32 {
            let collection = Arc::clone(&collection);
            let id = id.clone();
            tasks.spawn(async move {
                collection
                    .update_by_id(&id, &Update::new().push("history", json!({"n": n})))
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task").expect("update").expect("present");
        }
        let fetched = collection.find_by_id(&id).await.expect("find").expect("present");
        assert_eq!(fetched["history"].as_array().map(Vec::len), Some(32));
    }

    #[tokio::test]
    async fn offline_engine_and_failing_documents_surface_unavailable() {
        let engine = InMemoryEngine::new();
        let collection = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("bind");
        engine.faults().fail_document("abc");
        assert!(matches!(
            collection.find_by_id("abc").await,
            Err(StoreError::Unavailable(_))
        ));
        engine.faults().release_document("abc");
        assert_eq!(collection.find_by_id("abc").await.expect("find"), None);

        engine.faults().set_unavailable(true);
        assert!(matches!(
            engine.bind("company_acme", "Other", &schema()).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(collection.count(&Filter::All).await.is_err());
    }

    #[tokio::test]
    async fn journaled_engine_restores_documents_after_restart() {
        let root = temp_root();
        let id = {
            let engine = InMemoryEngine::with_journal(&root, JournalPolicy::default());
            let collection = engine
                .bind("company_acme", "Feedback", &schema())
                .await
                .expect("bind");
            let kept = collection
                .insert(doc(json!({"title": "kept"})))
                .await
                .expect("insert");
            let dropped = collection
                .insert(doc(json!({"title": "dropped"})))
                .await
                .expect("insert");
            let kept_id = document_id(&kept).expect("id").to_string();
            collection
                .update_by_id(&kept_id, &Update::new().set("status", "Completed"))
                .await
                .expect("update");
            collection
                .delete_by_id(document_id(&dropped).expect("id"))
                .await
                .expect("delete");
            kept_id
        };

        let engine = InMemoryEngine::with_journal(&root, JournalPolicy::default());
        let collection = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("rebind");
        assert_eq!(collection.count(&Filter::All).await.expect("count"), 1);
        let restored = collection.find_by_id(&id).await.expect("find").expect("present");
        assert_eq!(restored["status"], "Completed");
        let _ = remove_dir_all(&root);
    }

    #[tokio::test]
    async fn delete_many_removes_only_matching_documents() {
        let engine = InMemoryEngine::new();
        let collection = engine
            .bind("company_acme", "Feedback", &schema())
            .await
            .expect("bind");
        let mut ids = Vec::new();
        for _ in 0..3 {
            let stored = collection.insert(Document::new()).await.expect("insert");
            ids.push(document_id(&stored).expect("id").to_string());
        }
        let deleted = collection
            .delete_many(&Filter::ids([&ids[0], &ids[2], &"missing".to_string()]))
            .await
            .expect("delete");
        assert_eq!(deleted, 2);
        assert_eq!(collection.count(&Filter::All).await.expect("count"), 1);
    }
}
