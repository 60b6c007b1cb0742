use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) content_type: &'static str,
    pub(crate) body: String,
}

impl HttpResponse {
    pub(crate) fn json_with_status(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    /// Serializes `value`; a serialization failure becomes a 500.
    pub(crate) fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self::json_with_status(status, body),
            Err(err) => Self::internal_server_error(&format!("response encoding failed: {err}")),
        }
    }

    pub(crate) fn ok_text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; version=0.0.4; charset=utf-8",
            body,
        }
    }

    pub(crate) fn unauthorized(message: &str) -> Self {
        Self::error_with_status(401, message)
    }

    pub(crate) fn forbidden(message: &str) -> Self {
        Self::error_with_status(403, message)
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::error_with_status(404, message)
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::error_with_status(405, message)
    }

    pub(crate) fn internal_server_error(message: &str) -> Self {
        Self::error_with_status(500, message)
    }

    pub(crate) fn error_with_status(status: u16, message: &str) -> Self {
        Self::json_with_status(status, json!({ "error": message }).to_string())
    }
}

pub(crate) fn render_response_text(response: &HttpResponse) -> String {
    let status_text = match response.status {
        200 => "200 OK",
        201 => "201 Created",
        400 => "400 Bad Request",
        401 => "401 Unauthorized",
        403 => "403 Forbidden",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        413 => "413 Payload Too Large",
        503 => "503 Service Unavailable",
        _ => "500 Internal Server Error",
    };
    let body_len = response.body.len();
    format!(
        "HTTP/1.1 {status_text}\r\nContent-Type: {}\r\nContent-Length: {body_len}\r\nConnection: close\r\n\r\n{}",
        response.content_type, response.body
    )
}
