//! Append-only, hash-chained audit log for mutating requests.
//!
//! Each JSONL record carries `prev_hash` and `hash`, where `hash` is the
//! SHA-256 of the record serialized without the `hash` field. Chain heads are
//! cached per path and recovered from the file's last line on first use.

use std::{
    collections::HashMap,
    fs::{OpenOptions, create_dir_all},
    io::{BufRead, BufReader, Write},
    path::Path,
    sync::OnceLock,
};

use auth::sha256_hex;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{FeedbackRuntime, config::unix_timestamp_millis};

pub(crate) const AUDIT_CHAIN_GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AuditEvent<'a> {
    pub(crate) action: &'a str,
    pub(crate) company: Option<&'a str>,
    pub(crate) feedback_id: Option<&'a str>,
    pub(crate) actor: Option<&'a str>,
    pub(crate) status: u16,
    pub(crate) outcome: &'a str,
    pub(crate) reason: &'a str,
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    seq: u64,
    ts_unix_ms: u64,
    service: &'static str,
    action: &'a str,
    company: Option<&'a str>,
    feedback_id: Option<&'a str>,
    actor: Option<&'a str>,
    status: u16,
    outcome: &'a str,
    reason: &'a str,
    prev_hash: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChainHead {
    seq: u64,
    hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuditChainState {
    next_seq: u64,
    last_hash: String,
}

impl AuditChainState {
    fn genesis() -> Self {
        Self {
            next_seq: 1,
            last_hash: AUDIT_CHAIN_GENESIS_HASH.to_string(),
        }
    }
}

pub(crate) fn emit_audit_event(runtime: &FeedbackRuntime, event: AuditEvent<'_>) {
    runtime.metrics.observe_audit_event();
    let Some(path) = runtime.audit_log_path.as_deref() else {
        return;
    };
    if let Err(err) = append_audit_record(path, &event, unix_timestamp_millis()) {
        runtime.metrics.observe_audit_write_error();
        warn!(path = %path.display(), error = %err, "audit write failed");
    }
}

pub(crate) fn append_audit_record(
    path: &Path,
    event: &AuditEvent<'_>,
    timestamp_ms: u64,
) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).map_err(|e| format!("creating audit directory failed: {e}"))?;
    }
    let key = path.to_string_lossy().into_owned();
    let mut chain_states = audit_chain_states().lock();
    let state = match chain_states.get(&key) {
        Some(existing) => existing.clone(),
        None => load_audit_chain_state(path)?,
    };
    let (payload, next_state) = render_chained_audit_payload(event, timestamp_ms, &state)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("opening audit file failed: {e}"))?;
    writeln!(file, "{payload}").map_err(|e| format!("appending audit file failed: {e}"))?;
    chain_states.insert(key, next_state);
    Ok(())
}

fn render_chained_audit_payload(
    event: &AuditEvent<'_>,
    timestamp_ms: u64,
    state: &AuditChainState,
) -> Result<(String, AuditChainState), String> {
    let mut record = AuditRecord {
        seq: state.next_seq,
        ts_unix_ms: timestamp_ms,
        service: "feedback",
        action: event.action,
        company: event.company,
        feedback_id: event.feedback_id,
        actor: event.actor,
        status: event.status,
        outcome: event.outcome,
        reason: event.reason,
        prev_hash: &state.last_hash,
        hash: None,
    };
    let canonical = serde_json::to_string(&record)
        .map_err(|e| format!("encoding audit record failed: {e}"))?;
    let hash = sha256_hex(canonical.as_bytes());
    record.hash = Some(&hash);
    let payload = serde_json::to_string(&record)
        .map_err(|e| format!("encoding audit record failed: {e}"))?;
    let next = AuditChainState {
        next_seq: state.next_seq.saturating_add(1),
        last_hash: hash.clone(),
    };
    Ok((payload, next))
}

fn audit_chain_states() -> &'static Mutex<HashMap<String, AuditChainState>> {
    static STATES: OnceLock<Mutex<HashMap<String, AuditChainState>>> = OnceLock::new();
    STATES.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(test)]
pub(crate) fn clear_cached_audit_chain_state(path: &Path) {
    audit_chain_states()
        .lock()
        .remove(path.to_string_lossy().as_ref());
}

fn load_audit_chain_state(path: &Path) -> Result<AuditChainState, String> {
    if !path.exists() {
        return Ok(AuditChainState::genesis());
    }
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| format!("opening audit file failed: {e}"))?;
    let mut last_line: Option<String> = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| format!("reading audit file failed: {e}"))?;
        if !line.trim().is_empty() {
            last_line = Some(line);
        }
    }
    let Some(last_line) = last_line else {
        return Ok(AuditChainState::genesis());
    };
    let head: ChainHead = serde_json::from_str(&last_line)
        .map_err(|e| format!("audit chain head is unreadable: {e}"))?;
    if !is_sha256_hex(&head.hash) {
        return Err("audit hash is missing or invalid".to_string());
    }
    Ok(AuditChainState {
        next_seq: head.seq.saturating_add(1),
        last_hash: head.hash,
    })
}

pub(crate) fn is_sha256_hex(raw: &str) -> bool {
    raw.len() == 64 && raw.chars().all(|ch| ch.is_ascii_hexdigit())
}
