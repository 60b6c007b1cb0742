use feedback::{
    transport::{FeedbackRuntime, ServiceConfig},
    transport_axum::serve_http_with_axum,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = ServiceConfig::from_env();
    if config.jwt.is_none() && config.trusted_headers {
        warn!("no JWT secret configured; trusting x-company-code headers from the upstream gateway");
    }
    match config.data_dir.as_ref() {
        Some(dir) => info!(data_dir = %dir.display(), "journaling tenant collections"),
        None => warn!("FEEDBACK_DATA_DIR not set; records are kept in memory only"),
    }
    info!(
        bind_addr = %config.bind_addr,
        http_workers = config.http_workers,
        consistency = %config.consistency,
        storage_timeout_ms = config.storage_timeout.map(|t| t.as_millis() as u64),
        "starting feedback service"
    );

    let runtime = FeedbackRuntime::from_config(&config);
    if let Err(err) = serve_http_with_axum(runtime, &config.bind_addr, config.http_workers) {
        error!(error = %err, "feedback service stopped");
        std::process::exit(1);
    }
}
