use std::{collections::HashMap, sync::Arc};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::any,
};
use tracing::info;

use crate::transport::{
    FeedbackRuntime, HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, SharedRuntime,
    handle_request,
};

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .fallback(any(dispatch))
        .with_state(AppState { runtime })
        .layer(axum::extract::DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

pub fn serve_http_with_axum(
    feedback_runtime: FeedbackRuntime,
    bind_addr: &str,
    worker_threads: usize,
) -> Result<(), String> {
    let worker_threads = worker_threads.max(1);
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;

    let bind_addr = bind_addr.to_string();
    tokio_runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
        info!(bind_addr = %bind_addr, worker_threads, "feedback service listening");

        axum::serve(listener, router(Arc::new(feedback_runtime)))
            .await
            .map_err(|e| format!("axum server failed: {e}"))
    })
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> impl IntoResponse {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let body = match to_bytes(request.into_body(), MAX_HTTP_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return response_from_transport(HttpResponse::error_with_status(
                413,
                &format!("request body error: {err}"),
            ));
        }
    };

    let request = HttpRequest {
        method,
        target,
        headers,
        body,
    };

    let response = handle_request(&state.runtime, &request).await;
    response_from_transport(response)
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        response
            .content_type
            .parse()
            .unwrap_or(axum::http::HeaderValue::from_static("application/json")),
    );
    out
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn sample_state() -> AppState {
        AppState {
            runtime: Arc::new(FeedbackRuntime::in_memory()),
        }
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), MAX_HTTP_BODY_BYTES)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn dispatch_health_returns_ok_json() {
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(sample_state()), request)
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn dispatch_create_then_get_through_router_state() {
        let state = sample_state();
        let create = Request::builder()
            .method("POST")
            .uri("/v1/feedback")
            .header(CONTENT_TYPE, "application/json")
            .header("x-company-code", "ACME")
            .header("x-user-id", "u-1")
            .body(Body::from(
                r#"{"feedbackType":"selfFeedback","needsReview":true,"title":"H2 goals"}"#,
            ))
            .unwrap();
        let response = dispatch(State(state.clone()), create)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let review_id = created["review"]["_id"].as_str().unwrap().to_string();

        let get = Request::builder()
            .method("GET")
            .uri(format!("/v1/feedback/{review_id}/linked"))
            .header("x-company-code", "acme")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(state.clone()), get).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let linked = body_json(response).await;
        assert_eq!(linked["_id"], created["feedback"]["_id"]);
        assert_eq!(state.runtime.service().registry().bind_count(), 1);
    }

    #[tokio::test]
    async fn dispatch_without_company_is_unauthorized() {
        let request = Request::builder()
            .method("GET")
            .uri("/v1/feedback/analytics")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(sample_state()), request)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
