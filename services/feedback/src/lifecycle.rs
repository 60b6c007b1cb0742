//! Feedback lifecycle: creation of linked self-feedback/review pairs, status
//! propagation across a pair, history appends and review decisions.
//!
//! Writes to the two halves of a pair are independent storage calls. In
//! [`ConsistencyMode::BestEffort`] nothing orders them against concurrent
//! writers; [`ConsistencyMode::SerializedPairs`] holds a per-pair lock for the
//! duration of each read-modify-write.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schema::{
    Feedback, FeedbackPatch, FeedbackResponse, FeedbackStatus, FeedbackType, HistoryEntry,
    LinkageDivergence, NewFeedback, ReviewStatus, require_text, validate_new_feedback,
    validate_patch, validate_rating,
};
use serde::Serialize;
use store::{Filter, Update};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::{
    error::FeedbackError,
    repository::{FeedbackStore, to_value},
};

const SYSTEM_ACTOR: &str = "System";

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub name: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR, None)
    }

    /// Name written into history entries.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.id)
    }

    fn is_system(&self) -> bool {
        self.id == SYSTEM_ACTOR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    #[default]
    BestEffort,
    SerializedPairs,
}

impl FromStr for ConsistencyMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "best-effort" | "best_effort" | "besteffort" => Ok(Self::BestEffort),
            "serialized" | "serialized-pairs" | "serialized_pairs" => Ok(Self::SerializedPairs),
            other => Err(format!("unknown pair consistency mode '{other}'")),
        }
    }
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BestEffort => "best-effort",
            Self::SerializedPairs => "serialized",
        })
    }
}

/// Per-pair async locks, keyed by tenant and the pair's original id.
#[derive(Debug, Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl PairLocks {
    pub async fn acquire(&self, tenant: &str, pair_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry((tenant.to_string(), pair_id.to_string()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedFeedback {
    pub feedback: Feedback,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<Feedback>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub id: String,
    pub deleted_reviews: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInput {
    pub text: String,
    pub rating: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct LifecycleCoordinator {
    store: FeedbackStore,
    mode: ConsistencyMode,
    pairs: Arc<PairLocks>,
}

impl LifecycleCoordinator {
    pub fn new(store: FeedbackStore, mode: ConsistencyMode, pairs: Arc<PairLocks>) -> Self {
        Self { store, mode, pairs }
    }

    pub fn best_effort(store: FeedbackStore) -> Self {
        Self::new(store, ConsistencyMode::BestEffort, Arc::default())
    }

    pub fn store(&self) -> &FeedbackStore {
        &self.store
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    pub async fn create(
        &self,
        mut input: NewFeedback,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<CreatedFeedback, FeedbackError> {
        validate_new_feedback(&input)?;
        if input.created_by.is_none() && !actor.is_system() {
            input.created_by = Some(actor.id.clone());
        }
        let history_user = input
            .created_by
            .clone()
            .unwrap_or_else(|| SYSTEM_ACTOR.to_string());

        if !input.splits_into_review() {
            let status = input.status.unwrap_or_default();
            let mut record = input.into_feedback(status, now);
            record
                .history
                .push(HistoryEntry::new(now, "Created", history_user, ""));
            let stored = self.store.insert(&record).await?;
            self.flag_divergence(&stored);
            return Ok(CreatedFeedback {
                feedback: stored,
                review: None,
            });
        }

        let review_template = review_for(&input);
        let mut original = input.into_feedback(FeedbackStatus::InProgress, now);
        original.history.push(HistoryEntry::new(
            now,
            "Created and sent for review",
            history_user.clone(),
            "",
        ));
        let original = self.store.insert(&original).await?;

        let mut review = review_template.into_feedback(FeedbackStatus::Pending, now);
        review.original_feedback_id = Some(original.id.clone());
        review.history.push(HistoryEntry::new(
            now,
            "Submitted for review",
            history_user,
            format!("Review of feedback {}", original.id),
        ));
        let review = match self.store.insert(&review).await {
            Ok(review) => review,
            Err(err) => {
                warn!(
                    tenant = self.store.tenant(),
                    original_id = %original.id,
                    error = %err,
                    "review insert failed; self-feedback left without a review"
                );
                return Err(err);
            }
        };
        info!(
            tenant = self.store.tenant(),
            original_id = %original.id,
            review_id = %review.id,
            "created self-feedback review pair"
        );
        Ok(CreatedFeedback {
            feedback: original,
            review: Some(review),
        })
    }

    pub async fn get(&self, id: &str) -> Result<Feedback, FeedbackError> {
        let record = self.store.get(id).await?;
        self.flag_divergence(&record);
        Ok(record)
    }

    /// Applies `patch`. A carried status is then mirrored onto the counterpart
    /// without writing history there; a carried review status on a review is
    /// mirrored onto its original together with the history entry. Counterpart
    /// writes are best-effort: failures are logged and the primary result is
    /// still returned.
    pub async fn update(
        &self,
        id: &str,
        patch: FeedbackPatch,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Feedback, FeedbackError> {
        validate_patch(&patch)?;
        if patch.is_empty() {
            return Err(FeedbackError::invalid("update carries no fields"));
        }
        let (current, _pair) = self.load_for_pair_write(id).await?;

        let mut history = Vec::new();
        if let Some(next) = patch.status
            && next != current.status
        {
            history.push(HistoryEntry::new(
                now,
                "Status Updated",
                actor.label(),
                format!("Status changed from {} to {}", current.status, next),
            ));
        }
        let review_entry = match patch.review_status {
            Some(next) if Some(next) != current.review_status => Some(HistoryEntry::new(
                now,
                "Review Status Updated",
                actor.label(),
                format!(
                    "Review status changed from {} to {next}",
                    review_status_label(current.review_status)
                ),
            )),
            _ => None,
        };
        history.extend(review_entry.iter().cloned());
        let updated = self
            .store
            .update_by_id(id, &patch, &history, now)
            .await?
            .ok_or_else(|| FeedbackError::not_found(id))?;

        if let Some(status) = patch.status {
            self.propagate_status(&updated, status, now).await;
        }
        if let (Some(review_status), Some(original_id)) =
            (patch.review_status, &current.original_feedback_id)
        {
            let mut mirror = Update::new().set("reviewStatus", review_status.as_str());
            if let Some(entry) = &review_entry {
                mirror = mirror.push("history", to_value(entry)?);
            }
            self.write_counterpart(&current.id, original_id, mirror, now)
                .await;
        }
        Ok(updated)
    }

    async fn propagate_status(&self, source: &Feedback, status: FeedbackStatus, now: DateTime<Utc>) {
        let counterpart_id = match &source.original_feedback_id {
            Some(original_id) => Some(original_id.clone()),
            None => match self.store.find_linked_review(&source.id).await {
                Ok(review) => review.map(|review| review.id),
                Err(err) => {
                    warn!(
                        tenant = self.store.tenant(),
                        source_id = %source.id,
                        error = %err,
                        "linked review lookup failed; status not propagated"
                    );
                    return;
                }
            },
        };
        if let Some(counterpart_id) = counterpart_id {
            let update = Update::new().set("status", status.as_str());
            self.write_counterpart(&source.id, &counterpart_id, update, now)
                .await;
        }
    }

    /// Second, independent write onto the other half of a pair. A vanished
    /// counterpart or a storage failure is logged, never returned.
    async fn write_counterpart(
        &self,
        source_id: &str,
        counterpart_id: &str,
        update: Update,
        now: DateTime<Utc>,
    ) {
        match self.store.apply(counterpart_id, update, now).await {
            Ok(Some(_)) => debug!(
                tenant = self.store.tenant(),
                source_id,
                counterpart_id,
                "mirrored change onto linked feedback"
            ),
            Ok(None) => debug!(
                tenant = self.store.tenant(),
                source_id,
                counterpart_id,
                "linked feedback vanished; change not mirrored"
            ),
            Err(err) => warn!(
                tenant = self.store.tenant(),
                source_id,
                counterpart_id,
                error = %err,
                "linked feedback write failed; pair may diverge"
            ),
        }
    }

    /// Deletes a review alone, or an original together with all its reviews.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome, FeedbackError> {
        let current = self.store.get(id).await?;
        let deleted_reviews = if current.is_review() {
            0
        } else {
            self.store
                .delete_many(&Filter::eq("originalFeedbackId", id))
                .await?
        };
        self.store
            .delete_by_id(id)
            .await?
            .ok_or_else(|| FeedbackError::not_found(id))?;
        if deleted_reviews > 0 {
            info!(
                tenant = self.store.tenant(),
                id,
                deleted_reviews,
                "cascaded delete to linked reviews"
            );
        }
        Ok(DeleteOutcome {
            id: id.to_string(),
            deleted_reviews,
        })
    }

    pub async fn add_comment(
        &self,
        id: &str,
        text: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Feedback, FeedbackError> {
        let text = require_text(text, "comment")?;
        let entry = HistoryEntry::new(now, "Comment Added", actor.label(), text);
        self.store
            .append_history(id, &entry, now)
            .await?
            .ok_or_else(|| FeedbackError::not_found(id))
    }

    /// Records the response and completes the record. Not propagated.
    pub async fn submit_response(
        &self,
        id: &str,
        input: ResponseInput,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Feedback, FeedbackError> {
        let text = require_text(&input.text, "text")?.to_string();
        validate_rating(input.rating)?;
        let details = match input.rating {
            Some(rating) => format!("Response submitted with rating {rating}"),
            None => "Response submitted without rating".to_string(),
        };
        let response = FeedbackResponse {
            text,
            rating: input.rating,
            submitted_by: actor.id.clone(),
            submitted_at: now,
        };
        let update = Update::new()
            .set("response", to_value(&response)?)
            .set("status", FeedbackStatus::Completed.as_str())
            .push(
                "history",
                to_value(&HistoryEntry::new(
                    now,
                    "Response Submitted",
                    actor.label(),
                    details,
                ))?,
            );
        self.store
            .apply(id, update, now)
            .await?
            .ok_or_else(|| FeedbackError::not_found(id))
    }

    pub async fn assign_for_review(
        &self,
        id: &str,
        assignee: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Feedback, FeedbackError> {
        let assignee = require_text(assignee, "assignee")?;
        let update = Update::new().set("reviewAssignedTo", assignee).push(
            "history",
            to_value(&HistoryEntry::new(
                now,
                "Assigned",
                actor.label(),
                format!("Assigned for review to {assignee}"),
            ))?,
        );
        self.store
            .apply(id, update, now)
            .await?
            .ok_or_else(|| FeedbackError::not_found(id))
    }

    /// Sets the review status here and, for a review, on its original too.
    pub async fn update_review_status(
        &self,
        id: &str,
        review_status: ReviewStatus,
        comment: Option<&str>,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Feedback, FeedbackError> {
        let (current, _pair) = self.load_for_pair_write(id).await?;
        let previous = review_status_label(current.review_status);
        let entries = decision_entries(
            now,
            actor,
            "Review Status Updated",
            format!("Review status changed from {previous} to {review_status}"),
            comment,
        );
        let decision = ReviewDecision {
            review_status,
            status: None,
            entries,
        };
        self.write_decision(&current, &decision, now).await
    }

    /// Approves or rejects a review, deriving the record status.
    pub async fn complete_review(
        &self,
        id: &str,
        decision: ReviewStatus,
        comment: Option<&str>,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Feedback, FeedbackError> {
        let status = match decision {
            ReviewStatus::Approved => FeedbackStatus::Completed,
            ReviewStatus::Rejected => FeedbackStatus::Rejected,
            ReviewStatus::Pending => {
                return Err(FeedbackError::invalid(
                    "review decision must be Approved or Rejected",
                ));
            }
        };
        let (current, _pair) = self.load_for_pair_write(id).await?;
        let entries = decision_entries(
            now,
            actor,
            "Review Completed",
            format!("Review {}; status set to {status}", decision.as_str().to_lowercase()),
            comment,
        );
        let decision = ReviewDecision {
            review_status: decision,
            status: Some(status),
            entries,
        };
        self.write_decision(&current, &decision, now).await
    }

    async fn write_decision(
        &self,
        current: &Feedback,
        decision: &ReviewDecision,
        now: DateTime<Utc>,
    ) -> Result<Feedback, FeedbackError> {
        let updated = self
            .store
            .apply(&current.id, decision.to_update()?, now)
            .await?
            .ok_or_else(|| FeedbackError::not_found(&current.id))?;

        if let Some(original_id) = &current.original_feedback_id {
            self.write_counterpart(&current.id, original_id, decision.to_update()?, now)
                .await;
        }
        Ok(updated)
    }

    /// The original of a review, or the review of an original.
    pub async fn get_linked(&self, id: &str) -> Result<Option<Feedback>, FeedbackError> {
        let current = self.store.get(id).await?;
        match &current.original_feedback_id {
            Some(original_id) => self.store.find_by_id(original_id).await,
            None => self.store.find_linked_review(id).await,
        }
    }

    async fn load_for_pair_write(
        &self,
        id: &str,
    ) -> Result<(Feedback, Option<OwnedMutexGuard<()>>), FeedbackError> {
        let current = self.store.get(id).await?;
        self.flag_divergence(&current);
        match self.mode {
            ConsistencyMode::BestEffort => Ok((current, None)),
            ConsistencyMode::SerializedPairs => {
                let pair_id = current
                    .original_feedback_id
                    .clone()
                    .unwrap_or_else(|| current.id.clone());
                let guard = self.pairs.acquire(self.store.tenant(), &pair_id).await;
                let current = self.store.get(id).await?;
                Ok((current, Some(guard)))
            }
        }
    }

    fn flag_divergence(&self, record: &Feedback) {
        match record.linkage_divergence() {
            Some(LinkageDivergence::LinkedWithType(feedback_type)) => warn!(
                tenant = self.store.tenant(),
                id = %record.id,
                %feedback_type,
                "feedback links to an original but is not typed feedbackToReview"
            ),
            Some(LinkageDivergence::ReviewTypeWithoutLink) => warn!(
                tenant = self.store.tenant(),
                id = %record.id,
                "feedbackToReview record has no originalFeedbackId"
            ),
            None => {}
        }
    }
}

struct ReviewDecision {
    review_status: ReviewStatus,
    status: Option<FeedbackStatus>,
    entries: Vec<HistoryEntry>,
}

impl ReviewDecision {
    fn to_update(&self) -> Result<Update, FeedbackError> {
        let mut update = Update::new().set("reviewStatus", self.review_status.as_str());
        if let Some(status) = self.status {
            update = update.set("status", status.as_str());
        }
        for entry in &self.entries {
            update = update.push("history", to_value(entry)?);
        }
        Ok(update)
    }
}

fn review_status_label(review_status: Option<ReviewStatus>) -> &'static str {
    review_status.map(|s| s.as_str()).unwrap_or("None")
}

fn decision_entries(
    now: DateTime<Utc>,
    actor: &Actor,
    action: &str,
    details: String,
    comment: Option<&str>,
) -> Vec<HistoryEntry> {
    let mut entries = vec![HistoryEntry::new(now, action, actor.label(), details)];
    if let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) {
        entries.push(HistoryEntry::new(now, "Comment Added", actor.label(), comment));
    }
    entries
}

fn review_for(input: &NewFeedback) -> NewFeedback {
    let mut review = NewFeedback::new(FeedbackType::FeedbackToReview);
    review.review_status = Some(ReviewStatus::Pending);
    review.title = input.title.clone();
    review.content = input.content.clone();
    review.employee_id = input.employee_id.clone();
    review.created_by = input.created_by.clone();
    review.manager = input.manager.clone();
    review.review_assigned_to = input
        .review_assigned_to
        .clone()
        .or_else(|| input.manager.as_ref().map(|m| m.id().to_string()));
    review.due_date = input.due_date;
    review.start_date = input.start_date;
    review.priority = input.priority;
    review.period = input.period.clone();
    review
}
