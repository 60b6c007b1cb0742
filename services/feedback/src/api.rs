use schema::ReviewStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::lifecycle::ResponseInput;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommentRequest {
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResponseRequest {
    pub text: String,
    #[serde(default)]
    pub rating: Option<u8>,
}

impl From<ResponseRequest> for ResponseInput {
    fn from(value: ResponseRequest) -> Self {
        Self {
            text: value.text,
            rating: value.rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    #[serde(alias = "reviewAssignedTo")]
    pub assignee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStatusRequest {
    pub review_status: ReviewStatus,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteReviewRequest {
    #[serde(alias = "reviewStatus")]
    pub decision: ReviewStatus,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BulkUpdateRequest {
    pub ids: Vec<String>,
    pub updates: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
