use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};
use schema::{FeedbackStatus, FeedbackType, Priority, dates::format_date};
use serde::Serialize;
use store::Filter;
use tokio::task::JoinSet;

use crate::{error::FeedbackError, repository::FeedbackStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsScope {
    Tenant,
    /// Records where the user is the employee, the creator or the reviewer.
    User(String),
}

impl AnalyticsScope {
    fn filter(&self) -> Filter {
        match self {
            Self::Tenant => Filter::All,
            Self::User(user) => involving(user),
        }
    }
}

pub(crate) fn involving(user: &str) -> Filter {
    Filter::or([
        Filter::eq("employeeId", user),
        Filter::eq("createdBy", user),
        Filter::eq("reviewAssignedTo", user),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCounts {
    pub self_feedback: u64,
    pub requested_feedback: u64,
    pub feedback_to_review: u64,
    pub anonymous_feedback: u64,
}

impl TypeCounts {
    pub fn sum(&self) -> u64 {
        self.self_feedback + self.requested_feedback + self.feedback_to_review + self.anonymous_feedback
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub not_started: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackAnalytics {
    pub total: u64,
    pub by_type: TypeCounts,
    pub by_status: StatusCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_priority: Option<PriorityCounts>,
    pub overdue: u64,
    pub due_this_week: u64,
}

const TYPE_ORDER: [FeedbackType; 4] = [
    FeedbackType::SelfFeedback,
    FeedbackType::RequestedFeedback,
    FeedbackType::FeedbackToReview,
    FeedbackType::AnonymousFeedback,
];

const STATUS_ORDER: [FeedbackStatus; 4] = [
    FeedbackStatus::NotStarted,
    FeedbackStatus::InProgress,
    FeedbackStatus::Completed,
    FeedbackStatus::Pending,
];

/// `dueDate < now` and not completed.
pub fn overdue_filter(now: DateTime<Utc>) -> Filter {
    Filter::and([
        Filter::lt("dueDate", format_date(&now)),
        Filter::ne("status", FeedbackStatus::Completed.as_str()),
    ])
}

/// From the start of today to the end of the week's Saturday, counting
/// weekdays from Sunday = 0.
pub fn due_this_week_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let start = today.and_time(NaiveTime::MIN).and_utc();
    let days_ahead = 7 - u64::from(now.weekday().num_days_from_sunday());
    let last_day = today.checked_add_days(Days::new(days_ahead)).unwrap_or(today);
    let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    (start, last_day.and_time(end_of_day).and_utc())
}

pub fn due_this_week_filter(now: DateTime<Utc>) -> Filter {
    let (start, end) = due_this_week_window(now);
    Filter::and([
        Filter::between(
            "dueDate",
            Some(format_date(&start).into()),
            Some(format_date(&end).into()),
        ),
        Filter::ne("status", FeedbackStatus::Completed.as_str()),
    ])
}

pub async fn aggregate(
    store: &FeedbackStore,
    scope: &AnalyticsScope,
    now: DateTime<Utc>,
) -> Result<FeedbackAnalytics, FeedbackError> {
    let base = scope.filter();
    let with_base = |extra: Filter| Filter::and([base.clone(), extra]);

    let mut filters = Vec::new();
    for feedback_type in TYPE_ORDER {
        filters.push(with_base(Filter::eq("feedbackType", feedback_type.as_str())));
    }
    for status in STATUS_ORDER {
        filters.push(with_base(Filter::eq("status", status.as_str())));
    }
    filters.push(with_base(overdue_filter(now)));
    filters.push(with_base(due_this_week_filter(now)));
    let include_priority = matches!(scope, AnalyticsScope::Tenant);
    if include_priority {
        for priority in Priority::ALL {
            filters.push(with_base(Filter::eq("priority", priority.as_str())));
        }
    }

    let counts = count_all(store, filters).await?;
    let by_type = TypeCounts {
        self_feedback: counts[0],
        requested_feedback: counts[1],
        feedback_to_review: counts[2],
        anonymous_feedback: counts[3],
    };
    let by_priority = include_priority.then(|| PriorityCounts {
        low: counts[10],
        medium: counts[11],
        high: counts[12],
        critical: counts[13],
    });
    Ok(FeedbackAnalytics {
        total: by_type.sum(),
        by_type,
        by_status: StatusCounts {
            not_started: counts[4],
            in_progress: counts[5],
            completed: counts[6],
            pending: counts[7],
        },
        by_priority,
        overdue: counts[8],
        due_this_week: counts[9],
    })
}

/// Runs every count concurrently; results follow input order.
async fn count_all(store: &FeedbackStore, filters: Vec<Filter>) -> Result<Vec<u64>, FeedbackError> {
    let mut counts = vec![0u64; filters.len()];
    let mut tasks = JoinSet::new();
    for (index, filter) in filters.into_iter().enumerate() {
        let store = store.clone();
        tasks.spawn(async move { (index, store.count_matching(&filter).await) });
    }
    while let Some(joined) = tasks.join_next().await {
        let (index, count) = joined
            .map_err(|err| FeedbackError::StorageUnavailable(format!("count task failed: {err}")))?;
        counts[index] = count?;
    }
    Ok(counts)
}
