//! Field lookup over loosely-shaped JSON replies.
//!
//! The server has used several layouts for the same value over time, so each
//! value is described by an ordered list of JSON pointers. The first pointer
//! that resolves to a string or number wins.

use serde_json::Value;

pub const STATE_POINTERS: &[&str] = &[
    "/state",
    "/state/value",
    "/state/state",
    "/job/state",
    "/status",
    "/jobState",
];

pub const JOB_ID_POINTERS: &[&str] = &["/id", "/jobId", "/job/id"];

pub const UNKNOWN_STATE: &str = "UNKNOWN";

pub fn parse(body: &str) -> Option<Value> {
    serde_json::from_str(body).ok()
}

pub fn first_scalar(doc: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|p| match doc.pointer(p) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub fn job_id(doc: &Value) -> Option<String> {
    first_scalar(doc, JOB_ID_POINTERS)
}

/// Server-reported job state, or `None` when no known field carries one.
pub fn job_state(doc: &Value) -> Option<String> {
    first_scalar(doc, STATE_POINTERS)
}

/// True when a submission envelope carries an explicit `"status": "FAILED"`.
pub fn reports_failure(doc: &Value) -> bool {
    doc.get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("FAILED"))
}
