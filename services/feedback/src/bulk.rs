//! Bulk update and delete across a list of ids.
//!
//! Updates fan out one task per id against a shared batch timestamp. A missing
//! id or a failed write only drops that id from the result.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use schema::{Feedback, FeedbackPatch, HistoryEntry, validate_patch};
use serde::Serialize;
use serde_json::{Map, Value};
use store::Filter;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{error::FeedbackError, lifecycle::Actor, repository::FeedbackStore};

const ACTOR_FIELD: &str = "updatedBy";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateOutcome {
    pub updated_count: usize,
    pub records: Vec<Feedback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteOutcome {
    pub deleted_count: u64,
}

/// Splits the `updatedBy` actor out of a raw update object and parses the
/// remaining fields as a patch.
pub fn split_actor(
    mut updates: Map<String, Value>,
) -> Result<(Option<String>, FeedbackPatch), FeedbackError> {
    let actor = match updates.remove(ACTOR_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(raw.trim().to_string()).filter(|s| !s.is_empty()),
        Some(Value::Object(actor)) => actor
            .get("name")
            .or_else(|| actor.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(_) => {
            return Err(FeedbackError::invalid(
                "updatedBy must be a string or {id, name} object",
            ));
        }
    };
    let patch: FeedbackPatch = serde_json::from_value(Value::Object(updates))
        .map_err(|err| FeedbackError::invalid(format!("invalid updates: {err}")))?;
    Ok((actor, patch))
}

#[derive(Debug, Clone)]
pub struct BulkCoordinator {
    store: FeedbackStore,
}

impl BulkCoordinator {
    pub fn new(store: FeedbackStore) -> Self {
        Self { store }
    }

    /// Patches each id independently with one shared history entry. Linked
    /// records are not touched: a `status` or `reviewStatus` set here is not
    /// mirrored onto the other half of a pair.
    pub async fn bulk_update(
        &self,
        ids: Vec<String>,
        patch: FeedbackPatch,
        updated_by: Option<String>,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<BulkUpdateOutcome, FeedbackError> {
        let ids = normalize_ids(ids)?;
        validate_patch(&patch)?;
        if patch.is_empty() {
            return Err(FeedbackError::invalid("updates must set at least one field"));
        }
        let user = updated_by.unwrap_or_else(|| actor.label().to_string());
        let entry = HistoryEntry::new(
            now,
            "Bulk Update",
            user,
            format!("Bulk update: {}", patch.field_names().join(", ")),
        );
        let patch = Arc::new(patch);
        let entry = Arc::new(entry);

        let mut tasks = JoinSet::new();
        for (index, id) in ids.iter().cloned().enumerate() {
            let store = self.store.clone();
            let patch = Arc::clone(&patch);
            let entry = Arc::clone(&entry);
            tasks.spawn(async move {
                let outcome = store
                    .update_by_id(&id, &patch, std::slice::from_ref(entry.as_ref()), now)
                    .await;
                (index, id, outcome)
            });
        }

        let mut updated = Vec::with_capacity(ids.len());
        let mut missing = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(Some(record)))) => updated.push((index, record)),
                Ok((_, _, Ok(None))) => missing += 1,
                Ok((_, id, Err(err))) => {
                    failed += 1;
                    warn!(tenant = self.store.tenant(), id = %id, error = %err, "bulk update skipped record");
                }
                Err(err) => {
                    failed += 1;
                    warn!(tenant = self.store.tenant(), error = %err, "bulk update task aborted");
                }
            }
        }
        updated.sort_by_key(|(index, _)| *index);
        info!(
            tenant = self.store.tenant(),
            requested = ids.len(),
            updated = updated.len(),
            missing,
            failed,
            "bulk update finished"
        );
        Ok(BulkUpdateOutcome {
            updated_count: updated.len(),
            records: updated.into_iter().map(|(_, record)| record).collect(),
        })
    }

    /// One set-based delete. Reviews of deleted originals are left in place.
    pub async fn bulk_delete(&self, ids: Vec<String>) -> Result<BulkDeleteOutcome, FeedbackError> {
        let ids = normalize_ids(ids)?;
        let deleted_count = self.store.delete_many(&Filter::ids(&ids)).await?;
        info!(
            tenant = self.store.tenant(),
            requested = ids.len(),
            deleted_count,
            "bulk delete finished"
        );
        Ok(BulkDeleteOutcome { deleted_count })
    }
}

/// Trims, rejects blanks and drops duplicates, keeping first-seen order.
fn normalize_ids(ids: Vec<String>) -> Result<Vec<String>, FeedbackError> {
    if ids.is_empty() {
        return Err(FeedbackError::invalid("ids must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim();
        if id.is_empty() {
            return Err(FeedbackError::invalid("ids must not contain blank entries"));
        }
        if seen.insert(id.to_string()) {
            out.push(id.to_string());
        }
    }
    Ok(out)
}
