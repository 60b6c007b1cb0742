use std::{
    path::PathBuf,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use auth::JwtValidationConfig;
use tracing::warn;

use super::authz::CompanyScope;
use crate::ConsistencyMode;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8090";
pub const DEFAULT_HTTP_WORKERS: usize = 4;
pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_JOURNAL_SYNC_EVERY_RECORDS: usize = 1;
const DEFAULT_JWT_LEEWAY_SECS: u64 = 30;

/// Startup configuration, read once from `FEEDBACK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub http_workers: usize,
    /// Journal root; in-memory only when unset.
    pub data_dir: Option<PathBuf>,
    pub journal_sync_every_records: usize,
    /// `None` disables the per-call storage timeout.
    pub storage_timeout: Option<Duration>,
    pub consistency: ConsistencyMode,
    pub jwt: Option<JwtValidationConfig>,
    pub trusted_headers: bool,
    pub allowed_companies: CompanyScope,
    pub audit_log_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            http_workers: DEFAULT_HTTP_WORKERS,
            data_dir: None,
            journal_sync_every_records: DEFAULT_JOURNAL_SYNC_EVERY_RECORDS,
            storage_timeout: Some(Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MS)),
            consistency: ConsistencyMode::default(),
            jwt: None,
            trusted_headers: true,
            allowed_companies: CompanyScope::Any,
            audit_log_path: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Invalid values are logged and replaced by their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let jwt = get("FEEDBACK_JWT_HS256_SECRET").map(|secret| JwtValidationConfig {
            hs256_secret: secret,
            hs256_fallback_secrets: get("FEEDBACK_JWT_HS256_FALLBACK_SECRETS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            issuer: get("FEEDBACK_JWT_ISSUER"),
            audience: get("FEEDBACK_JWT_AUDIENCE"),
            leeway_secs: parse_or(get("FEEDBACK_JWT_LEEWAY_SECS"), "FEEDBACK_JWT_LEEWAY_SECS", DEFAULT_JWT_LEEWAY_SECS),
            require_exp: true,
        });
        // Header trust is on by default only when no token secret is configured.
        let trusted_headers = match get("FEEDBACK_TRUSTED_HEADERS") {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                warn!(key = "FEEDBACK_TRUSTED_HEADERS", value = %raw, "ignoring invalid boolean");
                jwt.is_none()
            }),
            None => jwt.is_none(),
        };
        let storage_timeout = match get("FEEDBACK_STORAGE_TIMEOUT_MS") {
            None => defaults.storage_timeout,
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => None,
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    warn!(key = "FEEDBACK_STORAGE_TIMEOUT_MS", value = %raw, "ignoring invalid value");
                    defaults.storage_timeout
                }
            },
        };

        Self {
            bind_addr: get("FEEDBACK_BIND").unwrap_or(defaults.bind_addr),
            http_workers: parse_or::<usize>(get("FEEDBACK_HTTP_WORKERS"), "FEEDBACK_HTTP_WORKERS", defaults.http_workers).max(1),
            data_dir: get("FEEDBACK_DATA_DIR").map(PathBuf::from),
            journal_sync_every_records: parse_or::<usize>(
                get("FEEDBACK_JOURNAL_SYNC_EVERY_RECORDS"),
                "FEEDBACK_JOURNAL_SYNC_EVERY_RECORDS",
                defaults.journal_sync_every_records,
            )
            .max(1),
            storage_timeout,
            consistency: parse_or(get("FEEDBACK_PAIR_CONSISTENCY"), "FEEDBACK_PAIR_CONSISTENCY", defaults.consistency),
            jwt,
            trusted_headers,
            allowed_companies: CompanyScope::parse(get("FEEDBACK_ALLOWED_COMPANIES").as_deref()),
            audit_log_path: get("FEEDBACK_AUDIT_LOG_PATH").map(PathBuf::from),
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring invalid value");
            default
        }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ServiceConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(config(&[]), ServiceConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let parsed = config(&[
            ("FEEDBACK_BIND", "0.0.0.0:9000"),
            ("FEEDBACK_HTTP_WORKERS", "8"),
            ("FEEDBACK_DATA_DIR", "/var/lib/feedback"),
            ("FEEDBACK_JOURNAL_SYNC_EVERY_RECORDS", "16"),
            ("FEEDBACK_STORAGE_TIMEOUT_MS", "0"),
            ("FEEDBACK_PAIR_CONSISTENCY", "serialized"),
            ("FEEDBACK_JWT_HS256_SECRET", "s1"),
            ("FEEDBACK_JWT_HS256_FALLBACK_SECRETS", "s0, ,old"),
            ("FEEDBACK_JWT_ISSUER", "hr-portal"),
            ("FEEDBACK_JWT_LEEWAY_SECS", "5"),
            ("FEEDBACK_ALLOWED_COMPANIES", "ACME,globex"),
            ("FEEDBACK_AUDIT_LOG_PATH", "/tmp/audit.jsonl"),
        ]);
        assert_eq!(parsed.bind_addr, "0.0.0.0:9000");
        assert_eq!(parsed.http_workers, 8);
        assert_eq!(parsed.data_dir, Some(PathBuf::from("/var/lib/feedback")));
        assert_eq!(parsed.journal_sync_every_records, 16);
        assert_eq!(parsed.storage_timeout, None);
        assert_eq!(parsed.consistency, ConsistencyMode::SerializedPairs);
        let jwt = parsed.jwt.expect("jwt config");
        assert_eq!(jwt.hs256_fallback_secrets, vec!["s0", "old"]);
        assert_eq!(jwt.issuer.as_deref(), Some("hr-portal"));
        assert_eq!(jwt.leeway_secs, 5);
        assert!(!parsed.trusted_headers);
        assert!(parsed.allowed_companies.allows("acme"));
        assert!(!parsed.allowed_companies.allows("initech"));
        assert_eq!(parsed.audit_log_path, Some(PathBuf::from("/tmp/audit.jsonl")));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let parsed = config(&[
            ("FEEDBACK_HTTP_WORKERS", "many"),
            ("FEEDBACK_STORAGE_TIMEOUT_MS", "soon"),
            ("FEEDBACK_PAIR_CONSISTENCY", "strict"),
            ("FEEDBACK_TRUSTED_HEADERS", "maybe"),
        ]);
        assert_eq!(parsed, ServiceConfig::default());
    }

    #[test]
    fn trusted_headers_can_be_forced_alongside_jwt() {
        let parsed = config(&[
            ("FEEDBACK_JWT_HS256_SECRET", "s1"),
            ("FEEDBACK_TRUSTED_HEADERS", "true"),
        ]);
        assert!(parsed.trusted_headers);
    }
}
