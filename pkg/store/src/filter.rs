//! Query predicates, ordering and atomic update operations over [`Document`]s.
//!
//! Field names may be dotted paths (`response.submittedBy`) that walk nested
//! objects. Comparisons are type-aware: numbers compare numerically and
//! strings that both parse as RFC 3339 timestamps compare chronologically.

use std::cmp::Ordering;

use chrono::DateTime;
use serde_json::Value;

use crate::{
    StoreError,
    engine::{Document, ID_FIELD},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub value: Value,
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    #[default]
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    ContainsIgnoreCase(String, String),
    Range {
        field: String,
        lower: Option<Bound>,
        upper: Option<Bound>,
    },
    Exists(String, bool),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn one_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn ids<S: AsRef<str>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self::one_of(
            ID_FIELD,
            ids.into_iter().map(|id| Value::String(id.as_ref().to_string())),
        )
    }

    pub fn contains_ignore_case(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::ContainsIgnoreCase(field.into(), needle.into())
    }

    /// Inclusive on both ends.
    pub fn between(
        field: impl Into<String>,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            lower: lower.map(|value| Bound {
                value,
                inclusive: true,
            }),
            upper: upper.map(|value| Bound {
                value,
                inclusive: true,
            }),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Range {
            field: field.into(),
            lower: None,
            upper: Some(Bound {
                value: value.into(),
                inclusive: false,
            }),
        }
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let filters: Vec<Filter> = filters
            .into_iter()
            .filter(|f| !matches!(f, Filter::All))
            .collect();
        match filters.len() {
            0 => Self::All,
            1 => filters.into_iter().next().unwrap_or(Self::All),
            _ => Self::And(filters),
        }
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, expected) => {
                lookup(document, field).is_some_and(|actual| values_equal(actual, expected))
            }
            Self::Ne(field, expected) => {
                !lookup(document, field).is_some_and(|actual| values_equal(actual, expected))
            }
            Self::In(field, candidates) => lookup(document, field).is_some_and(|actual| {
                candidates
                    .iter()
                    .any(|candidate| values_equal(actual, candidate))
            }),
            Self::ContainsIgnoreCase(field, needle) => lookup(document, field)
                .and_then(Value::as_str)
                .is_some_and(|haystack| {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }),
            Self::Range {
                field,
                lower,
                upper,
            } => {
                let Some(actual) = lookup(document, field).filter(|v| !v.is_null()) else {
                    return false;
                };
                let lower_ok = lower.as_ref().is_none_or(|bound| {
                    match compare_values(actual, &bound.value) {
                        Some(Ordering::Greater) => true,
                        Some(Ordering::Equal) => bound.inclusive,
                        _ => false,
                    }
                });
                let upper_ok = upper.as_ref().is_none_or(|bound| {
                    match compare_values(actual, &bound.value) {
                        Some(Ordering::Less) => true,
                        Some(Ordering::Equal) => bound.inclusive,
                        _ => false,
                    }
                });
                lower_ok && upper_ok
            }
            Self::Exists(field, expected) => {
                lookup(document, field).is_some_and(|v| !v.is_null()) == *expected
            }
            Self::And(filters) => filters.iter().all(|f| f.matches(document)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(document)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindOptions {
    pub sort: Vec<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted_by(mut self, spec: SortSpec) -> Self {
        self.sort.push(spec);
        self
    }

    pub fn page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }
}

/// Orders two documents by `specs`; absent and null values sort lowest.
pub fn compare_documents(left: &Document, right: &Document, specs: &[SortSpec]) -> Ordering {
    for spec in specs {
        let l = lookup(left, &spec.field).filter(|v| !v.is_null());
        let r = lookup(right, &spec.field).filter(|v| !v.is_null());
        let ordering = match (l, r) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => {
                compare_values(l, r).unwrap_or_else(|| type_rank(l).cmp(&type_rank(r)))
            }
        };
        let ordering = match spec.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// A single-document mutation applied under the collection's write lock, so
/// `push` appends never lose concurrent entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    pub set: Document,
    pub push: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn set_all(mut self, fields: Document) -> Self {
        self.set.extend(fields);
        self
    }

    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.push.is_empty()
    }

    pub fn apply(&self, document: &mut Document) -> Result<(), StoreError> {
        for (field, value) in &self.set {
            if field == ID_FIELD {
                return Err(StoreError::SchemaViolation {
                    field: ID_FIELD.to_string(),
                    reason: "is immutable".to_string(),
                });
            }
            document.insert(field.clone(), value.clone());
        }
        for (field, value) in &self.push {
            let slot = document
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
            match slot {
                Value::Array(items) => items.push(value.clone()),
                _ => {
                    return Err(StoreError::SchemaViolation {
                        field: field.clone(),
                        reason: "is not an array".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => {
            match (
                DateTime::parse_from_rfc3339(l),
                DateTime::parse_from_rfc3339(r),
            ) {
                (Ok(l), Ok(r)) => Some(l.cmp(&r)),
                _ => Some(l.cmp(r)),
            }
        }
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    left == right || compare_values(left, right) == Some(Ordering::Equal)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
