use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    StoreError,
    filter::{Filter, FindOptions, Update},
    schema::SchemaDescriptor,
};

/// Records are schemaless JSON objects; typing lives one layer up.
pub type Document = Map<String, Value>;

/// Storage-assigned identifier field present on every stored document.
pub const ID_FIELD: &str = "_id";

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Creates the namespace if needed and registers `collection` inside it.
    ///
    /// Registering the same collection twice in one namespace is an error;
    /// callers are expected to cache the returned handle. A bind cancelled by
    /// a timeout may still have registered the collection.
    async fn bind(
        &self,
        namespace: &str,
        collection: &str,
        schema: &SchemaDescriptor,
    ) -> Result<Arc<dyn Collection>, StoreError>;

    /// Handle to a collection an earlier bind already registered.
    async fn lookup(
        &self,
        namespace: &str,
        collection: &str,
    ) -> Result<Option<Arc<dyn Collection>>, StoreError>;
}

#[async_trait]
pub trait Collection: Send + Sync {
    fn namespace(&self) -> &str;

    fn name(&self) -> &str;

    /// Stores a new document under a fresh identifier and returns the stored
    /// form, defaults applied.
    async fn insert(&self, document: Document) -> Result<Document, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn find_many(
        &self,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError>;

    /// Applies `update` atomically to one document. `Ok(None)` when absent.
    async fn update_by_id(
        &self,
        id: &str,
        update: &Update,
    ) -> Result<Option<Document>, StoreError>;

    async fn delete_by_id(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError>;
}

pub fn document_id(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}
