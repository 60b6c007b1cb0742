mod audit;
mod authz;
mod config;
mod http;
mod request;
mod routes;
#[cfg(test)]
mod tests;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use store::{InMemoryEngine, JournalPolicy, RegistryConfig, StorageEngine};

pub use authz::CompanyScope;
pub use config::ServiceConfig;
pub(crate) use http::{HttpRequest, HttpResponse, render_response_text};
pub(crate) use routes::handle_request;

use crate::{FeedbackError, FeedbackService};

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 1024 * 1024;

/// Request counters, lock-free so handlers never contend on them.
#[derive(Debug, Default)]
pub(crate) struct TransportMetrics {
    requests_total: AtomicU64,
    invalid_request_total: AtomicU64,
    not_found_total: AtomicU64,
    missing_tenant_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    auth_success_total: AtomicU64,
    auth_failure_total: AtomicU64,
    authz_denied_total: AtomicU64,
    audit_events_total: AtomicU64,
    audit_write_error_total: AtomicU64,
}

impl TransportMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub(crate) fn observe_request(&self) {
        Self::bump(&self.requests_total);
    }

    pub(crate) fn observe_failure(&self, error: &FeedbackError) {
        Self::bump(match error {
            FeedbackError::InvalidRequest(_) => &self.invalid_request_total,
            FeedbackError::NotFound(_) => &self.not_found_total,
            FeedbackError::MissingTenant => &self.missing_tenant_total,
            FeedbackError::StorageUnavailable(_) => &self.storage_unavailable_total,
        });
    }

    pub(crate) fn observe_auth_success(&self) {
        Self::bump(&self.auth_success_total);
    }

    pub(crate) fn observe_auth_failure(&self) {
        Self::bump(&self.auth_failure_total);
    }

    pub(crate) fn observe_authz_denied(&self) {
        Self::bump(&self.authz_denied_total);
    }

    pub(crate) fn observe_audit_event(&self) {
        Self::bump(&self.audit_events_total);
    }

    pub(crate) fn observe_audit_write_error(&self) {
        Self::bump(&self.audit_write_error_total);
    }
}

pub struct FeedbackRuntime {
    service: FeedbackService,
    auth: authz::AuthPolicy,
    audit_log_path: Option<PathBuf>,
    metrics: TransportMetrics,
    started_at: Instant,
}

pub type SharedRuntime = Arc<FeedbackRuntime>;

impl FeedbackRuntime {
    pub fn new(service: FeedbackService, config: &ServiceConfig) -> Self {
        Self {
            service,
            auth: authz::AuthPolicy::from_config(config),
            audit_log_path: config.audit_log_path.clone(),
            metrics: TransportMetrics::default(),
            started_at: Instant::now(),
        }
    }

    /// Builds the storage engine and service described by `config`.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let engine: Arc<dyn StorageEngine> = match config.data_dir.as_ref() {
            Some(root) => Arc::new(InMemoryEngine::with_journal(
                root.clone(),
                JournalPolicy {
                    sync_every_records: config.journal_sync_every_records,
                    ..JournalPolicy::default()
                },
            )),
            None => Arc::new(InMemoryEngine::new()),
        };
        let registry = RegistryConfig {
            call_timeout: config.storage_timeout,
        };
        let service = FeedbackService::with_engine(engine, registry, config.consistency);
        Self::new(service, config)
    }

    pub fn in_memory() -> Self {
        Self::new(FeedbackService::in_memory(), &ServiceConfig::default())
    }

    pub fn service(&self) -> &FeedbackService {
        &self.service
    }

    pub(crate) fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    pub fn metrics_text(&self) -> String {
        let m = &self.metrics;
        let registry = self.service.registry();
        format!(
            "# TYPE feedback_requests_total counter\n\
feedback_requests_total {}\n\
# TYPE feedback_request_failures_total counter\n\
feedback_request_failures_total{{class=\"invalid_request\"}} {}\n\
feedback_request_failures_total{{class=\"not_found\"}} {}\n\
feedback_request_failures_total{{class=\"missing_tenant\"}} {}\n\
feedback_request_failures_total{{class=\"storage_unavailable\"}} {}\n\
# TYPE feedback_auth_success_total counter\n\
feedback_auth_success_total {}\n\
# TYPE feedback_auth_failure_total counter\n\
feedback_auth_failure_total {}\n\
# TYPE feedback_authz_denied_total counter\n\
feedback_authz_denied_total {}\n\
# TYPE feedback_audit_events_total counter\n\
feedback_audit_events_total {}\n\
# TYPE feedback_audit_write_error_total counter\n\
feedback_audit_write_error_total {}\n\
# TYPE feedback_registry_binds_total counter\n\
feedback_registry_binds_total {}\n\
# TYPE feedback_registry_cached_bindings gauge\n\
feedback_registry_cached_bindings {}\n\
# TYPE feedback_uptime_seconds gauge\n\
feedback_uptime_seconds {:.4}\n",
            TransportMetrics::read(&m.requests_total),
            TransportMetrics::read(&m.invalid_request_total),
            TransportMetrics::read(&m.not_found_total),
            TransportMetrics::read(&m.missing_tenant_total),
            TransportMetrics::read(&m.storage_unavailable_total),
            TransportMetrics::read(&m.auth_success_total),
            TransportMetrics::read(&m.auth_failure_total),
            TransportMetrics::read(&m.authz_denied_total),
            TransportMetrics::read(&m.audit_events_total),
            TransportMetrics::read(&m.audit_write_error_total),
            registry.bind_count(),
            registry.cached_bindings(),
            self.started_at.elapsed().as_secs_f64()
        )
    }
}

/// Parses one raw HTTP request, runs it and renders the response bytes.
pub async fn handle_http_request_bytes(
    runtime: &FeedbackRuntime,
    raw_request: &[u8],
) -> Result<Vec<u8>, String> {
    let request = request::parse_http_request_bytes(raw_request)?;
    let response = handle_request(runtime, &request).await;
    Ok(render_response_text(&response).into_bytes())
}

pub(crate) fn map_feedback_error(error: &FeedbackError) -> (u16, String) {
    let message = match error {
        FeedbackError::MissingTenant => "company code is required".to_string(),
        FeedbackError::NotFound(id) => format!("feedback not found: {id}"),
        FeedbackError::InvalidRequest(message) => message.clone(),
        FeedbackError::StorageUnavailable(message) => format!("storage unavailable: {message}"),
    };
    (error.status_code(), message)
}
