//! Listing, grouping and the review queue.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use schema::{
    Feedback, FeedbackStatus, FeedbackType, Priority, ReviewStatus,
    dates::{format_date, parse_flexible_date},
};
use serde::Serialize;
use store::{Filter, FindOptions, SortDirection, SortSpec};

use crate::{analytics::involving, error::FeedbackError, repository::FeedbackStore};

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;
const DEFAULT_SORT_FIELD: &str = "createdAt";
const MAX_SORT_FIELD_LEN: usize = 64;

/// Fields searched by the free-text `search` parameter.
const SEARCH_FIELDS: [&str; 6] = [
    "title",
    "content",
    "employeeId",
    "manager.name",
    "manager.id",
    "manager",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filter: Filter,
    pub sort: SortSpec,
    pub page: usize,
    pub limit: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            sort: SortSpec::descending(DEFAULT_SORT_FIELD),
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl ListQuery {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, FeedbackError> {
        let param = |key: &str| {
            params
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let mut clauses = Vec::new();
        if let Some(raw) = param("feedbackType") {
            let kind: FeedbackType = raw.parse()?;
            clauses.push(Filter::eq("feedbackType", kind.as_str()));
        }
        if let Some(raw) = param("status") {
            let status: FeedbackStatus = raw.parse()?;
            clauses.push(Filter::eq("status", status.as_str()));
        }
        if let Some(raw) = param("priority") {
            let priority: Priority = raw.parse()?;
            clauses.push(Filter::eq("priority", priority.as_str()));
        }
        if let Some(raw) = param("reviewStatus") {
            let status: ReviewStatus = raw.parse()?;
            clauses.push(Filter::eq("reviewStatus", status.as_str()));
        }
        if let Some(employee) = param("employeeId") {
            clauses.push(Filter::eq("employeeId", employee));
        }
        if let Some(manager) = param("manager") {
            clauses.push(Filter::or([
                Filter::eq("manager.id", manager),
                Filter::eq("manager", manager),
            ]));
        }
        if let Some(term) = param("search") {
            clauses.push(Filter::or(
                SEARCH_FIELDS.map(|field| Filter::contains_ignore_case(field, term)),
            ));
        }
        if let Some(user) = param("involving") {
            clauses.push(involving(user));
        }
        let lower = param("startDate").map(|raw| parse_bound(raw, "startDate", false)).transpose()?;
        let upper = param("endDate").map(|raw| parse_bound(raw, "endDate", true)).transpose()?;
        if lower.is_some() || upper.is_some() {
            clauses.push(Filter::between("dueDate", lower.map(Into::into), upper.map(Into::into)));
        }

        let sort_field = match param("sortBy") {
            Some(field) => validate_sort_field(field)?,
            None => DEFAULT_SORT_FIELD.to_string(),
        };
        let direction = match param("sortOrder").map(str::to_ascii_lowercase).as_deref() {
            None | Some("desc") | Some("descending") | Some("-1") => SortDirection::Descending,
            Some("asc") | Some("ascending") | Some("1") => SortDirection::Ascending,
            Some(other) => {
                return Err(FeedbackError::invalid(format!(
                    "sortOrder must be asc or desc, got '{other}'"
                )));
            }
        };

        let page = parse_positive(param("page"), "page")?.unwrap_or(1).max(1);
        let limit = parse_positive(param("limit"), "limit")?
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);

        Ok(Self {
            filter: Filter::and(clauses),
            sort: SortSpec {
                field: sort_field,
                direction,
            },
            page,
            limit,
        })
    }

    pub fn skip(&self) -> usize {
        (self.page - 1).saturating_mul(self.limit)
    }
}

/// Date-only end bounds cover the whole day.
fn parse_bound(raw: &str, field: &'static str, end_of_day: bool) -> Result<String, FeedbackError> {
    let parsed = parse_flexible_date(raw)
        .ok_or_else(|| FeedbackError::invalid(format!("{field} must be a date")))?;
    let date_only = NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok();
    let bound = if end_of_day && date_only {
        parsed + Duration::days(1) - Duration::milliseconds(1)
    } else {
        parsed
    };
    Ok(format_date(&bound))
}

fn validate_sort_field(field: &str) -> Result<String, FeedbackError> {
    let valid = field.len() <= MAX_SORT_FIELD_LEN
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(field.to_string())
    } else {
        Err(FeedbackError::invalid(format!("sortBy '{field}' is not a field name")))
    }
}

fn parse_positive(raw: Option<&str>, key: &str) -> Result<Option<usize>, FeedbackError> {
    raw.map(|value| {
        value.parse::<usize>().map_err(|_| {
            FeedbackError::invalid(format!("query parameter '{key}' must be a positive integer"))
        })
    })
    .transpose()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedFeedback {
    pub self_feedback: Vec<Feedback>,
    pub requested_feedback: Vec<Feedback>,
    pub feedback_to_review: Vec<Feedback>,
    pub anonymous_feedback: Vec<Feedback>,
}

impl GroupedFeedback {
    pub fn from_records(records: Vec<Feedback>) -> Self {
        let mut grouped = Self::default();
        for record in records {
            match record.feedback_type {
                FeedbackType::SelfFeedback => grouped.self_feedback.push(record),
                FeedbackType::RequestedFeedback => grouped.requested_feedback.push(record),
                FeedbackType::FeedbackToReview => grouped.feedback_to_review.push(record),
                FeedbackType::AnonymousFeedback => grouped.anonymous_feedback.push(record),
            }
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.self_feedback.len()
            + self.requested_feedback.len()
            + self.feedback_to_review.len()
            + self.anonymous_feedback.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub page: usize,
    pub limit: usize,
    pub total_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackPage {
    pub feedback: GroupedFeedback,
    pub pagination: Pagination,
}

pub async fn list(store: &FeedbackStore, query: &ListQuery) -> Result<FeedbackPage, FeedbackError> {
    let options = FindOptions::default()
        .sorted_by(query.sort.clone())
        .page(query.skip(), query.limit);
    let (records, total) = tokio::try_join!(
        store.find_many(&query.filter, &options),
        store.count_matching(&query.filter),
    )?;
    let limit = query.limit as u64;
    Ok(FeedbackPage {
        feedback: GroupedFeedback::from_records(records),
        pagination: Pagination {
            total,
            page: query.page,
            limit: query.limit,
            total_pages: total.div_ceil(limit),
        },
    })
}

pub fn review_queue_filter(assignee: Option<&str>) -> Filter {
    let mut clauses = vec![
        Filter::eq("feedbackType", FeedbackType::FeedbackToReview.as_str()),
        Filter::eq("reviewStatus", ReviewStatus::Pending.as_str()),
    ];
    if let Some(assignee) = assignee.map(str::trim).filter(|a| !a.is_empty()) {
        clauses.push(Filter::eq("reviewAssignedTo", assignee));
    }
    Filter::and(clauses)
}

/// Pending reviews, soonest due first.
pub async fn review_queue(
    store: &FeedbackStore,
    assignee: Option<&str>,
) -> Result<Vec<Feedback>, FeedbackError> {
    let options = FindOptions::default()
        .sorted_by(SortSpec::ascending("dueDate"))
        .sorted_by(SortSpec::ascending("createdAt"));
    store.find_many(&review_queue_filter(assignee), &options).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use schema::{ActorRef, NewFeedback};
    use store::{InMemoryEngine, RegistryConfig, TenantRegistry};

    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, 9, 0, 0).unwrap()
    }

    async fn store() -> FeedbackStore {
        let registry = TenantRegistry::new(
            Arc::new(InMemoryEngine::new()),
            RegistryConfig::default(),
        );
        FeedbackStore::open(&registry, "acme").await.expect("open")
    }

    async fn seed(store: &FeedbackStore, input: NewFeedback, created: DateTime<Utc>) -> Feedback {
        let record = input.into_feedback(FeedbackStatus::NotStarted, created);
        store.insert(&record).await.expect("insert")
    }

    #[test]
    fn defaults_and_clamps_pagination() {
        let query = ListQuery::from_params(&params(&[])).expect("query");
        assert_eq!(query, ListQuery::default());

        let query = ListQuery::from_params(&params(&[("page", "0"), ("limit", "500")]))
            .expect("query");
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, MAX_PAGE_LIMIT);

        let query = ListQuery::from_params(&params(&[("page", "3"), ("limit", "10")]))
            .expect("query");
        assert_eq!(query.skip(), 20);
    }

    #[test]
    fn rejects_bad_parameters() {
        for bad in [
            ("status", "Done"),
            ("limit", "-1"),
            ("sortBy", "a;b"),
            ("sortOrder", "sideways"),
            ("startDate", "tomorrow"),
        ] {
            assert!(
                matches!(
                    ListQuery::from_params(&params(&[bad])),
                    Err(FeedbackError::InvalidRequest(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn date_only_end_bound_covers_the_day() {
        assert_eq!(
            parse_bound("2026-10-20", "endDate", true).expect("bound"),
            "2026-10-20T23:59:59.999Z"
        );
        assert_eq!(
            parse_bound("2026-10-20", "startDate", false).expect("bound"),
            "2026-10-20T00:00:00.000Z"
        );
    }

    #[tokio::test]
    async fn lists_grouped_page_with_totals() {
        let store = store().await;
        for day in 1..=5 {
            seed(&store, NewFeedback::new(FeedbackType::SelfFeedback), at(day)).await;
        }
        seed(&store, NewFeedback::new(FeedbackType::AnonymousFeedback), at(6)).await;

        let query = ListQuery::from_params(&params(&[("limit", "4")])).expect("query");
        let page = list(&store, &query).await.expect("list");
        assert_eq!(page.pagination.total, 6);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.feedback.len(), 4);
        assert_eq!(page.feedback.anonymous_feedback.len(), 1);
        assert_eq!(page.feedback.self_feedback[0].created_at, Some(at(5)));
    }

    #[tokio::test]
    async fn search_matches_embedded_and_raw_manager() {
        let store = store().await;
        let mut embedded = NewFeedback::new(FeedbackType::RequestedFeedback);
        embedded.manager = Some(ActorRef::Embedded {
            id: "m-7".into(),
            name: "Grace Hopper".into(),
        });
        seed(&store, embedded, at(1)).await;
        let mut raw = NewFeedback::new(FeedbackType::RequestedFeedback);
        raw.manager = Some(ActorRef::Raw("hopper-raw".into()));
        seed(&store, raw, at(2)).await;
        seed(&store, NewFeedback::new(FeedbackType::RequestedFeedback), at(3)).await;

        let query = ListQuery::from_params(&params(&[("search", "HOPPER")])).expect("query");
        assert_eq!(list(&store, &query).await.expect("list").pagination.total, 2);

        let query = ListQuery::from_params(&params(&[("manager", "m-7")])).expect("query");
        assert_eq!(list(&store, &query).await.expect("list").pagination.total, 1);
    }

    #[tokio::test]
    async fn review_queue_orders_by_due_date() {
        let store = store().await;
        for (day, assignee) in [(9, "r-1"), (4, "r-2"), (6, "r-1")] {
            let mut input = NewFeedback::new(FeedbackType::FeedbackToReview);
            input.review_status = Some(ReviewStatus::Pending);
            input.review_assigned_to = Some(assignee.into());
            input.due_date = Some(at(day));
            seed(&store, input, at(1)).await;
        }
        let mut approved = NewFeedback::new(FeedbackType::FeedbackToReview);
        approved.review_status = Some(ReviewStatus::Approved);
        seed(&store, approved, at(1)).await;

        let queue = review_queue(&store, None).await.expect("queue");
        let due: Vec<_> = queue.iter().map(|r| r.due_date).collect();
        assert_eq!(due, vec![Some(at(4)), Some(at(6)), Some(at(9))]);

        let mine = review_queue(&store, Some("r-1")).await.expect("queue");
        assert_eq!(mine.len(), 2);
    }
}
