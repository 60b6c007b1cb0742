//! Typed access to one tenant's `Feedback` collection.

use chrono::{DateTime, Utc};
use schema::{
    Feedback, FeedbackPatch, FeedbackStatus, FeedbackType, HistoryEntry, Priority, ReviewStatus,
    dates::format_date,
};
use serde::Serialize;
use serde_json::Value;
use store::{
    Document, FieldKind, FieldSpec, Filter, FindOptions, ID_FIELD, SchemaDescriptor, SortSpec,
    TenantHandle, TenantRegistry, Update,
};

use crate::error::FeedbackError;

pub const FEEDBACK_ENTITY: &str = "Feedback";

pub fn feedback_schema() -> SchemaDescriptor {
    SchemaDescriptor::new()
        .field(
            FieldSpec::new("feedbackType", FieldKind::String)
                .required()
                .one_of(FeedbackType::ALL.map(|t| t.as_str())),
        )
        .field(
            FieldSpec::new("status", FieldKind::String)
                .required()
                .one_of(FeedbackStatus::ALL.map(|s| s.as_str()))
                .default_value(FeedbackStatus::NotStarted.as_str()),
        )
        .field(
            FieldSpec::new("reviewStatus", FieldKind::String)
                .one_of(ReviewStatus::ALL.map(|s| s.as_str())),
        )
        .field(
            FieldSpec::new("priority", FieldKind::String)
                .one_of(Priority::ALL.map(|p| p.as_str())),
        )
        .field(FieldSpec::new("originalFeedbackId", FieldKind::String))
        .field(FieldSpec::new("history", FieldKind::Array).default_value(Value::Array(Vec::new())))
        .field(FieldSpec::new("response", FieldKind::Object))
        .field(FieldSpec::new("dueDate", FieldKind::Date))
        .field(FieldSpec::new("startDate", FieldKind::Date))
        .field(FieldSpec::new("createdAt", FieldKind::Date))
        .field(FieldSpec::new("updatedAt", FieldKind::Date))
}

/// Feedback collection bound to a single tenant. Cloning shares the binding.
#[derive(Debug, Clone)]
pub struct FeedbackStore {
    handle: TenantHandle,
}

impl FeedbackStore {
    pub async fn open(registry: &TenantRegistry, tenant: &str) -> Result<Self, FeedbackError> {
        let handle = registry
            .resolve(tenant, FEEDBACK_ENTITY, &feedback_schema())
            .await?;
        Ok(Self { handle })
    }

    pub fn tenant(&self) -> &str {
        self.handle.tenant().as_str()
    }

    pub async fn insert(&self, record: &Feedback) -> Result<Feedback, FeedbackError> {
        let mut document = to_document(record)?;
        document.remove(ID_FIELD);
        decode(self.handle.insert(document).await?)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Feedback>, FeedbackError> {
        self.handle.find_by_id(id).await?.map(decode).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Feedback, FeedbackError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| FeedbackError::not_found(id))
    }

    pub async fn find_many(
        &self,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Feedback>, FeedbackError> {
        self.handle
            .find_many(filter, options)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn count_matching(&self, filter: &Filter) -> Result<u64, FeedbackError> {
        Ok(self.handle.count(filter).await?)
    }

    /// Writes the patch's fields plus `history` entries in one update.
    pub async fn update_by_id(
        &self,
        id: &str,
        patch: &FeedbackPatch,
        history: &[HistoryEntry],
        now: DateTime<Utc>,
    ) -> Result<Option<Feedback>, FeedbackError> {
        let mut update = Update::new().set_all(to_document(patch)?);
        for entry in history {
            update = update.push("history", to_value(entry)?);
        }
        self.apply(id, update, now).await
    }

    /// Applies a raw update, stamping `updatedAt`.
    pub async fn apply(
        &self,
        id: &str,
        update: Update,
        now: DateTime<Utc>,
    ) -> Result<Option<Feedback>, FeedbackError> {
        let update = update.set("updatedAt", format_date(&now));
        self.handle
            .update_by_id(id, &update)
            .await?
            .map(decode)
            .transpose()
    }

    /// Atomic append; never reads the record first.
    pub async fn append_history(
        &self,
        id: &str,
        entry: &HistoryEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<Feedback>, FeedbackError> {
        self.apply(id, Update::new().push("history", to_value(entry)?), now)
            .await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<Option<Feedback>, FeedbackError> {
        self.handle.delete_by_id(id).await?.map(decode).transpose()
    }

    pub async fn delete_many(&self, filter: &Filter) -> Result<u64, FeedbackError> {
        Ok(self.handle.delete_many(filter).await?)
    }

    /// Earliest review pointing at `original_id`.
    pub async fn find_linked_review(
        &self,
        original_id: &str,
    ) -> Result<Option<Feedback>, FeedbackError> {
        let options = FindOptions {
            sort: vec![SortSpec::ascending("createdAt")],
            skip: 0,
            limit: Some(1),
        };
        let mut found = self
            .find_many(&Filter::eq("originalFeedbackId", original_id), &options)
            .await?;
        Ok(found.pop())
    }
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value, FeedbackError> {
    serde_json::to_value(value)
        .map_err(|err| FeedbackError::invalid(format!("unserializable value: {err}")))
}

pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<Document, FeedbackError> {
    match to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(FeedbackError::invalid("expected a JSON object")),
    }
}

fn decode(document: Document) -> Result<Feedback, FeedbackError> {
    serde_json::from_value(Value::Object(document))
        .map_err(|err| FeedbackError::StorageUnavailable(format!("stored record is malformed: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use schema::NewFeedback;
    use store::{InMemoryEngine, RegistryConfig};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap()
    }

    async fn store() -> FeedbackStore {
        let registry = TenantRegistry::new(
            Arc::new(InMemoryEngine::new()),
            RegistryConfig::default(),
        );
        FeedbackStore::open(&registry, "acme").await.expect("open store")
    }

    fn record(kind: FeedbackType) -> Feedback {
        NewFeedback::new(kind).into_feedback(FeedbackStatus::NotStarted, now())
    }

    #[tokio::test]
    async fn insert_round_trips_through_storage() {
        let store = store().await;
        let stored = store
            .insert(&record(FeedbackType::RequestedFeedback))
            .await
            .expect("insert");
        assert!(!stored.id.is_empty());
        assert_eq!(store.get(&stored.id).await.expect("get"), stored);
        assert_eq!(store.tenant(), "acme");
    }

    #[tokio::test]
    async fn get_reports_missing_records_as_not_found() {
        let store = store().await;
        assert_eq!(
            store.get("nope").await,
            Err(FeedbackError::not_found("nope"))
        );
    }

    #[tokio::test]
    async fn update_writes_patch_and_history_together() {
        let store = store().await;
        let stored = store
            .insert(&record(FeedbackType::SelfFeedback))
            .await
            .expect("insert");
        let entry = HistoryEntry::new(now(), "Status Updated", "ana", "moved");
        let updated = store
            .update_by_id(
                &stored.id,
                &FeedbackPatch::status(FeedbackStatus::InProgress),
                &[entry.clone()],
                now(),
            )
            .await
            .expect("update")
            .expect("present");
        assert_eq!(updated.status, FeedbackStatus::InProgress);
        assert_eq!(updated.history, vec![entry]);
        assert_eq!(updated.title, stored.title);
    }

    #[tokio::test]
    async fn linked_review_lookup_follows_back_reference() {
        let store = store().await;
        let original = store
            .insert(&record(FeedbackType::SelfFeedback))
            .await
            .expect("insert");
        let mut review = record(FeedbackType::FeedbackToReview);
        review.original_feedback_id = Some(original.id.clone());
        let review = store.insert(&review).await.expect("insert review");

        let found = store
            .find_linked_review(&original.id)
            .await
            .expect("lookup");
        assert_eq!(found.map(|f| f.id), Some(review.id.clone()));
        assert_eq!(store.find_linked_review(&review.id).await.expect("lookup"), None);
    }
}
