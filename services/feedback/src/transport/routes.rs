use std::collections::HashMap;

use chrono::Utc;
use schema::{FeedbackPatch, NewFeedback};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    FeedbackRuntime, HttpRequest, HttpResponse,
    audit::{AuditEvent, emit_audit_event},
    authz::{AuthDecision, authenticate},
    map_feedback_error,
    request::{feedback_segments, split_target},
};
use crate::{
    Actor, FeedbackError,
    analytics::{self, AnalyticsScope},
    api::{
        AssignRequest, BulkDeleteRequest, BulkUpdateRequest, CommentRequest,
        CompleteReviewRequest, HealthResponse, ResponseRequest, ReviewStatusRequest,
    },
    bulk::split_actor,
    query::{self, ListQuery},
};

/// Fields a client may echo back on update that are never patchable.
const IGNORED_UPDATE_FIELDS: [&str; 3] = ["_id", "id", "updatedBy"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Create,
    List,
    ReviewQueue,
    Analytics,
    BulkUpdate,
    BulkDelete,
    Get(String),
    Update(String),
    Delete(String),
    Comment(String),
    Response(String),
    Assign(String),
    ReviewStatus(String),
    CompleteReview(String),
    Linked(String),
}

impl Route {
    fn action(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::List => "list",
            Self::ReviewQueue => "review_queue",
            Self::Analytics => "analytics",
            Self::BulkUpdate => "bulk_update",
            Self::BulkDelete => "bulk_delete",
            Self::Get(_) => "get",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::Comment(_) => "add_comment",
            Self::Response(_) => "submit_response",
            Self::Assign(_) => "assign_for_review",
            Self::ReviewStatus(_) => "update_review_status",
            Self::CompleteReview(_) => "complete_review",
            Self::Linked(_) => "get_linked",
        }
    }

    fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::List | Self::ReviewQueue | Self::Analytics | Self::Get(_) | Self::Linked(_)
        )
    }

    fn feedback_id(&self) -> Option<&str> {
        match self {
            Self::Get(id)
            | Self::Update(id)
            | Self::Delete(id)
            | Self::Comment(id)
            | Self::Response(id)
            | Self::Assign(id)
            | Self::ReviewStatus(id)
            | Self::CompleteReview(id)
            | Self::Linked(id) => Some(id),
            _ => None,
        }
    }
}

const RESERVED_SEGMENTS: [&str; 4] = ["review-queue", "analytics", "bulk-update", "bulk-delete"];

fn route(method: &str, segments: &[String]) -> Result<Route, HttpResponse> {
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    match (method, segments.as_slice()) {
        ("POST", []) => Ok(Route::Create),
        ("GET", []) => Ok(Route::List),
        (_, []) => Err(HttpResponse::method_not_allowed("only GET and POST are supported")),
        ("GET", ["review-queue"]) => Ok(Route::ReviewQueue),
        ("GET", ["analytics"]) => Ok(Route::Analytics),
        ("POST", ["bulk-update"]) => Ok(Route::BulkUpdate),
        ("POST", ["bulk-delete"]) => Ok(Route::BulkDelete),
        (_, ["review-queue" | "analytics"]) => {
            Err(HttpResponse::method_not_allowed("only GET is supported"))
        }
        (_, ["bulk-update" | "bulk-delete"]) => {
            Err(HttpResponse::method_not_allowed("only POST is supported"))
        }
        ("GET", [id]) => Ok(Route::Get(id.to_string())),
        ("PUT", [id]) => Ok(Route::Update(id.to_string())),
        ("DELETE", [id]) => Ok(Route::Delete(id.to_string())),
        (_, [_]) => Err(HttpResponse::method_not_allowed(
            "only GET, PUT and DELETE are supported",
        )),
        (_, [id, _]) if RESERVED_SEGMENTS.contains(id) => {
            Err(HttpResponse::not_found("unknown path"))
        }
        ("POST", [id, "comments"]) => Ok(Route::Comment(id.to_string())),
        ("POST", [id, "response"]) => Ok(Route::Response(id.to_string())),
        ("POST", [id, "assign"]) => Ok(Route::Assign(id.to_string())),
        ("PUT", [id, "review-status"]) => Ok(Route::ReviewStatus(id.to_string())),
        ("POST", [id, "complete-review"]) => Ok(Route::CompleteReview(id.to_string())),
        ("GET", [id, "linked"]) => Ok(Route::Linked(id.to_string())),
        (_, [_, "comments" | "response" | "assign" | "complete-review"]) => {
            Err(HttpResponse::method_not_allowed("only POST is supported"))
        }
        (_, [_, "review-status"]) => Err(HttpResponse::method_not_allowed("only PUT is supported")),
        (_, [_, "linked"]) => Err(HttpResponse::method_not_allowed("only GET is supported")),
        _ => Err(HttpResponse::not_found("unknown path")),
    }
}

pub(crate) async fn handle_request(runtime: &FeedbackRuntime, request: &HttpRequest) -> HttpResponse {
    runtime.metrics().observe_request();
    let (path, query) = split_target(&request.target);
    match (request.method.as_str(), path.as_str()) {
        ("GET", "/health") => return HttpResponse::json(200, &HealthResponse { status: "ok" }),
        ("GET", "/metrics") => return HttpResponse::ok_text(runtime.metrics_text()),
        (_, "/health") | (_, "/metrics") => {
            return HttpResponse::method_not_allowed("only GET is supported");
        }
        _ => {}
    }
    let Some(segments) = feedback_segments(&path) else {
        return HttpResponse::not_found("unknown path");
    };
    let route = match route(&request.method, &segments) {
        Ok(route) => route,
        Err(response) => return response,
    };

    let identity = match authenticate(request, &runtime.auth) {
        AuthDecision::Allowed(identity) => {
            runtime.metrics().observe_auth_success();
            identity
        }
        AuthDecision::Unauthorized(reason) => {
            runtime.metrics().observe_auth_failure();
            audit_denied(runtime, &route, 401, reason);
            return HttpResponse::unauthorized(reason);
        }
        AuthDecision::Forbidden(reason) => {
            runtime.metrics().observe_authz_denied();
            audit_denied(runtime, &route, 403, reason);
            return HttpResponse::forbidden(reason);
        }
    };
    let actor = Actor::new(identity.user_id.clone(), identity.user_name.clone());
    let company = identity.company_code.as_str();

    let outcome = match check_content_type(request, &route) {
        Ok(()) => execute(runtime, &route, company, &actor, &query, &request.body).await,
        Err(err) => Err(err),
    };
    let response = match &outcome {
        Ok(response) => response.clone(),
        Err(err) => {
            runtime.metrics().observe_failure(err);
            let (status, message) = map_feedback_error(err);
            if status >= 500 {
                warn!(company, action = route.action(), error = %err, "feedback request failed");
            }
            HttpResponse::error_with_status(status, &message)
        }
    };
    debug!(
        company,
        method = %request.method,
        path = %path,
        status = response.status,
        "handled feedback request"
    );

    if route.is_mutation() {
        let reason = match &outcome {
            Ok(_) => "ok".to_string(),
            Err(err) => map_feedback_error(err).1,
        };
        emit_audit_event(
            runtime,
            AuditEvent {
                action: route.action(),
                company: Some(company),
                feedback_id: route.feedback_id(),
                actor: Some(actor.id.as_str()),
                status: response.status,
                outcome: if outcome.is_ok() { "success" } else { "error" },
                reason: &reason,
            },
        );
    }
    response
}

fn audit_denied(runtime: &FeedbackRuntime, route: &Route, status: u16, reason: &str) {
    if route.is_mutation() {
        emit_audit_event(
            runtime,
            AuditEvent {
                action: route.action(),
                company: None,
                feedback_id: route.feedback_id(),
                actor: None,
                status,
                outcome: "denied",
                reason,
            },
        );
    }
}

fn check_content_type(request: &HttpRequest, route: &Route) -> Result<(), FeedbackError> {
    if !route.is_mutation() || matches!(route, Route::Delete(_)) {
        return Ok(());
    }
    match request.headers.get("content-type") {
        Some(content_type)
            if !content_type
                .to_ascii_lowercase()
                .contains("application/json") =>
        {
            Err(FeedbackError::invalid(
                "content-type must include application/json",
            ))
        }
        _ => Ok(()),
    }
}

async fn execute(
    runtime: &FeedbackRuntime,
    route: &Route,
    company: &str,
    actor: &Actor,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<HttpResponse, FeedbackError> {
    let service = runtime.service();
    let now = Utc::now();
    match route {
        Route::Create => {
            let input: NewFeedback = parse_body(body)?;
            let created = service.lifecycle(company).await?.create(input, actor, now).await?;
            Ok(HttpResponse::json(201, &created))
        }
        Route::List => {
            let list_query = ListQuery::from_params(query)?;
            let store = service.store(company).await?;
            Ok(HttpResponse::json(200, &query::list(&store, &list_query).await?))
        }
        Route::ReviewQueue => {
            let store = service.store(company).await?;
            let assignee = query.get("assignee").map(String::as_str);
            let records = query::review_queue(&store, assignee).await?;
            Ok(HttpResponse::json(
                200,
                &serde_json::json!({ "total": records.len(), "feedback": records }),
            ))
        }
        Route::Analytics => {
            let scope = match query.get("userId").map(|u| u.trim()).filter(|u| !u.is_empty()) {
                Some(user) => AnalyticsScope::User(user.to_string()),
                None => AnalyticsScope::Tenant,
            };
            let store = service.store(company).await?;
            Ok(HttpResponse::json(200, &analytics::aggregate(&store, &scope, now).await?))
        }
        Route::BulkUpdate => {
            let request: BulkUpdateRequest = parse_body(body)?;
            let (updated_by, patch) = split_actor(request.updates)?;
            let outcome = service
                .bulk(company)
                .await?
                .bulk_update(request.ids, patch, updated_by, actor, now)
                .await?;
            Ok(HttpResponse::json(200, &outcome))
        }
        Route::BulkDelete => {
            let request: BulkDeleteRequest = parse_body(body)?;
            let outcome = service.bulk(company).await?.bulk_delete(request.ids).await?;
            Ok(HttpResponse::json(200, &outcome))
        }
        Route::Get(id) => {
            let record = service.lifecycle(company).await?.get(id).await?;
            Ok(HttpResponse::json(200, &record))
        }
        Route::Update(id) => {
            let mut fields: Map<String, Value> = parse_body(body)?;
            for field in IGNORED_UPDATE_FIELDS {
                fields.remove(field);
            }
            let patch: FeedbackPatch = serde_json::from_value(Value::Object(fields))
                .map_err(|err| FeedbackError::invalid(format!("invalid update: {err}")))?;
            let record = service
                .lifecycle(company)
                .await?
                .update(id, patch, actor, now)
                .await?;
            Ok(HttpResponse::json(200, &record))
        }
        Route::Delete(id) => {
            let outcome = service.lifecycle(company).await?.delete(id).await?;
            Ok(HttpResponse::json(200, &outcome))
        }
        Route::Comment(id) => {
            let request: CommentRequest = parse_body(body)?;
            let record = service
                .lifecycle(company)
                .await?
                .add_comment(id, &request.comment, actor, now)
                .await?;
            Ok(HttpResponse::json(200, &record))
        }
        Route::Response(id) => {
            let request: ResponseRequest = parse_body(body)?;
            let record = service
                .lifecycle(company)
                .await?
                .submit_response(id, request.into(), actor, now)
                .await?;
            Ok(HttpResponse::json(200, &record))
        }
        Route::Assign(id) => {
            let request: AssignRequest = parse_body(body)?;
            let record = service
                .lifecycle(company)
                .await?
                .assign_for_review(id, &request.assignee, actor, now)
                .await?;
            Ok(HttpResponse::json(200, &record))
        }
        Route::ReviewStatus(id) => {
            let request: ReviewStatusRequest = parse_body(body)?;
            let record = service
                .lifecycle(company)
                .await?
                .update_review_status(
                    id,
                    request.review_status,
                    request.comment.as_deref(),
                    actor,
                    now,
                )
                .await?;
            Ok(HttpResponse::json(200, &record))
        }
        Route::CompleteReview(id) => {
            let request: CompleteReviewRequest = parse_body(body)?;
            let record = service
                .lifecycle(company)
                .await?
                .complete_review(id, request.decision, request.comment.as_deref(), actor, now)
                .await?;
            Ok(HttpResponse::json(200, &record))
        }
        Route::Linked(id) => {
            let linked = service.lifecycle(company).await?.get_linked(id).await?;
            Ok(HttpResponse::json(200, &linked))
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, FeedbackError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FeedbackError::invalid("request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|err| FeedbackError::invalid(format!("invalid JSON body: {err}")))
}
