use std::{
    collections::HashMap,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{Value, json};

use super::*;

static NEXT_PATH: AtomicU64 = AtomicU64::new(0);

fn temp_path(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "{prefix}-{}-{nanos}-{}",
        std::process::id(),
        NEXT_PATH.fetch_add(1, Ordering::Relaxed)
    ))
}

fn request(method: &str, target: &str, company: Option<&str>, body: Option<Value>) -> HttpRequest {
    let mut headers = HashMap::new();
    if let Some(company) = company {
        headers.insert("x-company-code".to_string(), company.to_string());
        headers.insert("x-user-id".to_string(), "u-hr".to_string());
        headers.insert("x-user-name".to_string(), "Hana".to_string());
    }
    if body.is_some() {
        headers.insert("content-type".to_string(), "application/json".to_string());
    }
    HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        headers,
        body: body.map(|b| b.to_string().into_bytes()).unwrap_or_default(),
    }
}

async fn call(
    runtime: &FeedbackRuntime,
    method: &str,
    target: &str,
    body: Option<Value>,
) -> (u16, Value) {
    let response = handle_request(runtime, &request(method, target, Some("acme"), body)).await;
    let value = serde_json::from_str(&response.body).unwrap_or(Value::Null);
    (response.status, value)
}

#[tokio::test]
async fn health_needs_no_company() {
    let runtime = FeedbackRuntime::in_memory();
    let response = handle_request(&runtime, &request("GET", "/health", None, None)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn feedback_routes_require_company_before_storage() {
    let runtime = FeedbackRuntime::in_memory();
    let response = handle_request(&runtime, &request("GET", "/v1/feedback", None, None)).await;
    assert_eq!(response.status, 401);
    assert!(response.body.contains("company code is required"));
    assert_eq!(runtime.service().registry().bind_count(), 0);
    assert!(runtime.metrics_text().contains("feedback_auth_failure_total 1"));
}

#[tokio::test]
async fn create_pair_and_propagate_status_over_routes() {
    let runtime = FeedbackRuntime::in_memory();
    let (status, created) = call(
        &runtime,
        "POST",
        "/v1/feedback",
        Some(json!({
            "feedbackType": "selfFeedback",
            "needsReview": true,
            "title": "Q3 self review",
            "manager": {"id": "m-1", "name": "Grace"}
        })),
    )
    .await;
    assert_eq!(status, 201);
    let original_id = created["feedback"]["_id"].as_str().expect("original id").to_string();
    let review_id = created["review"]["_id"].as_str().expect("review id").to_string();
    assert_eq!(created["feedback"]["createdBy"], "u-hr");
    assert_eq!(created["review"]["originalFeedbackId"], original_id.as_str());

    let (status, updated) = call(
        &runtime,
        "PUT",
        &format!("/v1/feedback/{review_id}"),
        Some(json!({"_id": review_id, "status": "Completed", "updatedBy": "ignored"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(updated["status"], "Completed");

    let (_, original) = call(&runtime, "GET", &format!("/v1/feedback/{original_id}"), None).await;
    assert_eq!(original["status"], "Completed");

    let (_, linked) = call(&runtime, "GET", &format!("/v1/feedback/{original_id}/linked"), None).await;
    assert_eq!(linked["_id"], review_id.as_str());
}

#[tokio::test]
async fn review_flow_routes_write_history() {
    let runtime = FeedbackRuntime::in_memory();
    let (_, created) = call(
        &runtime,
        "POST",
        "/v1/feedback",
        Some(json!({"feedbackType": "selfFeedback", "needsReview": true})),
    )
    .await;
    let review_id = created["review"]["_id"].as_str().expect("review id").to_string();

    let (status, _) = call(
        &runtime,
        "POST",
        &format!("/v1/feedback/{review_id}/assign"),
        Some(json!({"assignee": "r-9"})),
    )
    .await;
    assert_eq!(status, 200);
    let (status, _) = call(
        &runtime,
        "POST",
        &format!("/v1/feedback/{review_id}/comments"),
        Some(json!({"comment": "looks good"})),
    )
    .await;
    assert_eq!(status, 200);
    let (status, review) = call(
        &runtime,
        "POST",
        &format!("/v1/feedback/{review_id}/complete-review"),
        Some(json!({"decision": "Approved", "comment": "ship it"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(review["reviewStatus"], "Approved");
    assert_eq!(review["status"], "Completed");
    let actions: Vec<&str> = review["history"]
        .as_array()
        .expect("history")
        .iter()
        .filter_map(|h| h["action"].as_str())
        .collect();
    assert_eq!(
        actions,
        vec![
            "Submitted for review",
            "Assigned",
            "Comment Added",
            "Review Completed",
            "Comment Added"
        ]
    );

    let (status, body) = call(
        &runtime,
        "POST",
        &format!("/v1/feedback/{review_id}/complete-review"),
        Some(json!({"decision": "Pending"})),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap_or_default().contains("Approved or Rejected"));
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let runtime = FeedbackRuntime::in_memory();
    let (status, body) = call(&runtime, "GET", "/v1/feedback/missing", None).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "feedback not found: missing");

    let (status, _) = call(&runtime, "POST", "/v1/feedback", Some(json!({"feedbackType": "gossip"}))).await;
    assert_eq!(status, 400);

    let (status, _) = call(&runtime, "GET", "/v1/feedback?limit=abc", None).await;
    assert_eq!(status, 400);

    let (status, _) = call(&runtime, "PATCH", "/v1/feedback/x", None).await;
    assert_eq!(status, 405);

    let metrics = runtime.metrics_text();
    assert!(metrics.contains("feedback_request_failures_total{class=\"not_found\"} 1"));
    assert!(metrics.contains("feedback_request_failures_total{class=\"invalid_request\"} 2"));
}

#[tokio::test]
async fn storage_outage_is_service_unavailable() {
    let engine = std::sync::Arc::new(store::InMemoryEngine::new());
    engine.faults().set_unavailable(true);
    let service = crate::FeedbackService::with_engine(
        engine,
        store::RegistryConfig::default(),
        crate::ConsistencyMode::default(),
    );
    let runtime = FeedbackRuntime::new(service, &ServiceConfig::default());
    let (status, body) = call(&runtime, "GET", "/v1/feedback", None).await;
    assert_eq!(status, 503);
    assert!(body["error"].as_str().unwrap_or_default().starts_with("storage unavailable"));
}

#[tokio::test]
async fn list_bulk_and_analytics_round_through_routes() {
    let runtime = FeedbackRuntime::in_memory();
    let mut ids = Vec::new();
    for kind in ["requestedFeedback", "requestedFeedback", "anonymousFeedback"] {
        let (_, created) = call(
            &runtime,
            "POST",
            "/v1/feedback",
            Some(json!({"feedbackType": kind, "employeeId": "e-1", "priority": "High"})),
        )
        .await;
        ids.push(created["feedback"]["_id"].as_str().expect("id").to_string());
    }

    let (status, page) = call(&runtime, "GET", "/v1/feedback?feedbackType=requestedFeedback", None).await;
    assert_eq!(status, 200);
    assert_eq!(page["pagination"]["total"], 2);
    assert_eq!(page["feedback"]["requestedFeedback"].as_array().map(Vec::len), Some(2));

    let (status, outcome) = call(
        &runtime,
        "POST",
        "/v1/feedback/bulk-update",
        Some(json!({"ids": [ids[0], "missing", ids[1]], "updates": {"status": "Completed", "updatedBy": "hr-bot"}})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(outcome["updatedCount"], 2);

    let (_, analytics) = call(&runtime, "GET", "/v1/feedback/analytics", None).await;
    assert_eq!(analytics["total"], 3);
    assert_eq!(analytics["byStatus"]["completed"], 2);
    assert_eq!(analytics["byPriority"]["high"], 3);

    let (_, scoped) = call(&runtime, "GET", "/v1/feedback/analytics?userId=e-2", None).await;
    assert_eq!(scoped["total"], 0);
    assert!(scoped.get("byPriority").is_none());

    let (status, deleted) = call(
        &runtime,
        "POST",
        "/v1/feedback/bulk-delete",
        Some(json!({"ids": [ids[2], "missing"]})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(deleted["deletedCount"], 1);
}

#[tokio::test]
async fn allow_list_rejects_other_companies() {
    let config = ServiceConfig {
        allowed_companies: CompanyScope::parse(Some("acme")),
        ..ServiceConfig::default()
    };
    let runtime = FeedbackRuntime::new(crate::FeedbackService::in_memory(), &config);
    let response =
        handle_request(&runtime, &request("GET", "/v1/feedback", Some("globex"), None)).await;
    assert_eq!(response.status, 403);
    assert!(runtime.metrics_text().contains("feedback_authz_denied_total 1"));
}

#[tokio::test]
async fn mutations_are_audited_with_a_hash_chain() {
    let audit_path = temp_path("feedback-transport-audit");
    let config = ServiceConfig {
        audit_log_path: Some(audit_path.clone()),
        ..ServiceConfig::default()
    };
    let runtime = FeedbackRuntime::new(crate::FeedbackService::in_memory(), &config);
    let (_, created) = call(
        &runtime,
        "POST",
        "/v1/feedback",
        Some(json!({"feedbackType": "selfFeedback"})),
    )
    .await;
    let id = created["feedback"]["_id"].as_str().expect("id").to_string();
    let (status, _) = call(&runtime, "DELETE", &format!("/v1/feedback/{id}"), None).await;
    assert_eq!(status, 200);
    let _ = call(&runtime, "GET", "/v1/feedback", None).await;

    let contents = std::fs::read_to_string(&audit_path).expect("audit log");
    let lines: Vec<Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).expect("audit json"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["action"], "create");
    assert_eq!(lines[1]["action"], "delete");
    assert_eq!(lines[1]["feedback_id"], id.as_str());
    assert_eq!(lines[1]["prev_hash"], lines[0]["hash"]);
    assert!(runtime.metrics_text().contains("feedback_audit_events_total 2"));
    let _ = std::fs::remove_file(&audit_path);
}

#[tokio::test]
async fn raw_bytes_round_trip() {
    let runtime = FeedbackRuntime::in_memory();
    let body = r#"{"feedbackType":"anonymousFeedback","content":"more standups please"}"#;
    let raw = format!(
        "POST /v1/feedback HTTP/1.1\r\nHost: localhost\r\nX-Company-Code: acme\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = handle_http_request_bytes(&runtime, raw.as_bytes())
        .await
        .expect("parsed");
    let response = String::from_utf8(response).expect("utf8");
    assert!(response.starts_with("HTTP/1.1 201 Created"));
    assert!(response.contains("\"feedbackType\":\"anonymousFeedback\""));
}
