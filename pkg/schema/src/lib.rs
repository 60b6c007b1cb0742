use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dates;

pub use dates::parse_flexible_date;

// ---------------------------------------------------------------------------
// Core domain enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedbackType {
    SelfFeedback,
    RequestedFeedback,
    FeedbackToReview,
    AnonymousFeedback,
}

impl FeedbackType {
    pub const ALL: [Self; 4] = [
        Self::SelfFeedback,
        Self::RequestedFeedback,
        Self::FeedbackToReview,
        Self::AnonymousFeedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfFeedback => "selfFeedback",
            Self::RequestedFeedback => "requestedFeedback",
            Self::FeedbackToReview => "feedbackToReview",
            Self::AnonymousFeedback => "anonymousFeedback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FeedbackStatus {
    #[default]
    #[serde(rename = "Not Started")]
    NotStarted,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Pending,
    Rejected,
}

impl FeedbackStatus {
    pub const ALL: [Self; 5] = [
        Self::NotStarted,
        Self::InProgress,
        Self::Completed,
        Self::Pending,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "Not Started",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Pending => "Pending",
            Self::Rejected => "Rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub const ALL: [Self; 3] = [Self::Pending, Self::Approved, Self::Rejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

macro_rules! impl_str_enum {
    ($ty:ty, $field:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ValidationError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                let raw = raw.trim();
                <$ty>::ALL
                    .into_iter()
                    .find(|candidate| candidate.as_str().eq_ignore_ascii_case(raw))
                    .ok_or_else(|| ValidationError::InvalidValue {
                        field: $field,
                        value: raw.to_string(),
                    })
            }
        }
    };
}

impl_str_enum!(FeedbackType, "feedbackType");
impl_str_enum!(FeedbackStatus, "status");
impl_str_enum!(ReviewStatus, "reviewStatus");
impl_str_enum!(Priority, "priority");

// ---------------------------------------------------------------------------
// Actor references
// ---------------------------------------------------------------------------

/// A person referenced by a feedback record. Stored either as an embedded
/// `{id, name}` object or as a bare id string; both forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActorRef {
    Embedded {
        id: String,
        #[serde(default)]
        name: String,
    },
    Raw(String),
}

impl ActorRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Embedded { id, .. } => id,
            Self::Raw(id) => id,
        }
    }

    /// Falls back to the id when no display name was embedded.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Embedded { name, id } if name.trim().is_empty() => id,
            Self::Embedded { name, .. } => name,
            Self::Raw(id) => id,
        }
    }
}

// ---------------------------------------------------------------------------
// Feedback record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(with = "dates::required")]
    pub date: DateTime<Utc>,
    pub action: String,
    pub user: String,
    #[serde(default)]
    pub details: String,
}

impl HistoryEntry {
    pub fn new(
        date: DateTime<Utc>,
        action: impl Into<String>,
        user: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            date,
            action: action.into(),
            user: user.into(),
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    pub submitted_by: String,
    #[serde(with = "dates::required")]
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    /// Assigned by storage on insert; empty until then.
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub status: FeedbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_status: Option<ReviewStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ActorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_feedback_id: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<FeedbackResponse>,
    #[serde(default, with = "dates::optional", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, with = "dates::optional", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, with = "dates::optional", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "dates::optional", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Disagreement between the two signals that mark a record as a review:
/// `originalFeedbackId` presence (authoritative) and `feedbackType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkageDivergence {
    LinkedWithType(FeedbackType),
    ReviewTypeWithoutLink,
}

impl Feedback {
    pub fn is_review(&self) -> bool {
        self.original_feedback_id.is_some()
    }

    pub fn linkage_divergence(&self) -> Option<LinkageDivergence> {
        match (self.is_review(), self.feedback_type) {
            (true, FeedbackType::FeedbackToReview) => None,
            (true, other) => Some(LinkageDivergence::LinkedWithType(other)),
            (false, FeedbackType::FeedbackToReview) => {
                Some(LinkageDivergence::ReviewTypeWithoutLink)
            }
            (false, _) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == FeedbackStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Write-side inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeedback {
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub status: Option<FeedbackStatus>,
    #[serde(default)]
    pub review_status: Option<ReviewStatus>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub manager: Option<ActorRef>,
    #[serde(default)]
    pub review_assigned_to: Option<String>,
    /// Callers may link a record by hand; the type is not forced to match.
    #[serde(default)]
    pub original_feedback_id: Option<String>,
    #[serde(default, with = "dates::optional")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, with = "dates::optional")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub needs_review: bool,
}

impl NewFeedback {
    pub fn new(feedback_type: FeedbackType) -> Self {
        Self {
            feedback_type,
            status: None,
            review_status: None,
            title: None,
            content: None,
            employee_id: None,
            created_by: None,
            manager: None,
            review_assigned_to: None,
            original_feedback_id: None,
            due_date: None,
            start_date: None,
            priority: None,
            period: None,
            needs_review: false,
        }
    }

    pub fn splits_into_review(&self) -> bool {
        self.needs_review && self.feedback_type == FeedbackType::SelfFeedback
    }

    /// Materialise a record with no id and an empty history.
    pub fn into_feedback(self, status: FeedbackStatus, now: DateTime<Utc>) -> Feedback {
        Feedback {
            id: String::new(),
            feedback_type: self.feedback_type,
            status,
            review_status: self.review_status,
            title: self.title,
            content: self.content,
            employee_id: self.employee_id,
            created_by: self.created_by,
            manager: self.manager,
            review_assigned_to: self.review_assigned_to,
            original_feedback_id: self.original_feedback_id,
            history: Vec::new(),
            response: None,
            due_date: self.due_date,
            start_date: self.start_date,
            priority: self.priority,
            period: self.period,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}

/// Field-level patch. Only `Some` fields are written; structural fields
/// (`feedbackType`, `originalFeedbackId`, `history`) cannot be patched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeedbackPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FeedbackStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_status: Option<ReviewStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ActorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_assigned_to: Option<String>,
    #[serde(default, with = "dates::optional", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, with = "dates::optional", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

impl FeedbackPatch {
    pub fn status(status: FeedbackStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.field_names().is_empty()
    }

    /// Wire names of the fields this patch sets, in declaration order.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut push = |set: bool, name: &'static str| {
            if set {
                names.push(name);
            }
        };
        push(self.status.is_some(), "status");
        push(self.review_status.is_some(), "reviewStatus");
        push(self.title.is_some(), "title");
        push(self.content.is_some(), "content");
        push(self.employee_id.is_some(), "employeeId");
        push(self.manager.is_some(), "manager");
        push(self.review_assigned_to.is_some(), "reviewAssignedTo");
        push(self.due_date.is_some(), "dueDate");
        push(self.start_date.is_some(), "startDate");
        push(self.priority.is_some(), "priority");
        push(self.period.is_some(), "period");
        names
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("value out of range: {0}")]
    InvalidRange(&'static str),
    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

pub fn validate_new_feedback(input: &NewFeedback) -> Result<(), ValidationError> {
    if let Some(original_id) = &input.original_feedback_id
        && original_id.trim().is_empty()
    {
        return Err(ValidationError::MissingField("originalFeedbackId"));
    }
    validate_schedule(input.start_date, input.due_date)
}

pub fn validate_patch(patch: &FeedbackPatch) -> Result<(), ValidationError> {
    validate_schedule(patch.start_date, patch.due_date)
}

pub fn validate_rating(rating: Option<u8>) -> Result<(), ValidationError> {
    match rating {
        Some(value) if !(MIN_RATING..=MAX_RATING).contains(&value) => {
            Err(ValidationError::InvalidRange("rating"))
        }
        _ => Ok(()),
    }
}

/// Returns the trimmed text, rejecting blank input.
pub fn require_text<'a>(raw: &'a str, field: &'static str) -> Result<&'a str, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(trimmed)
}

fn validate_schedule(
    start: Option<DateTime<Utc>>,
    due: Option<DateTime<Utc>>,
) -> Result<(), ValidationError> {
    if let (Some(start), Some(due)) = (start, due)
        && start > due
    {
        return Err(ValidationError::InvalidRange("startDate/dueDate"));
    }
    Ok(())
}
