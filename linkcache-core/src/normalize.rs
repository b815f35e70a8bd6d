//! Caller-facing status documents
//!
//! Several generations of polling clients read the same document, each with
//! its own spelling of the QR fields. Every spelling is written from one source
//! value through the alias tables below, so they cannot drift apart.
//!
//! Nothing in here reads a clock: the record and the options fully determine
//! the output, except for [`not_found`], which takes `now` explicitly.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::models::SessionRecord;
use crate::policy;

/// Spellings of the base64 artifact payload.
pub const BASE64_ALIASES: [&str; 4] = ["base64", "qrBase64", "qr_base64", "qrCodeBase64"];

/// Spellings of the artifact content type.
pub const CONTENT_TYPE_ALIASES: [&str; 3] = ["contentType", "qrContentType", "qr_content_type"];

pub const NOT_FOUND_STATE: &str = "not_found";
pub const NOT_FOUND_MESSAGE: &str = "Session not found";

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Payload echoed as `raw` instead of the record's stored one.
    pub raw_payload: Option<Value>,
    /// Number of records in the store, reported as `stored` (defaults to 1).
    pub total_stored: Option<usize>,
    /// Additional `results` entries appended after the record's own.
    pub extra_entries: Vec<Value>,
}

/// Millisecond-precision UTC timestamp, e.g. `2026-03-01T12:00:00.000Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn timestamp_value(ts: Option<&DateTime<Utc>>) -> Value {
    ts.map_or(Value::Null, |t| Value::String(format_timestamp(t)))
}

fn opt_string(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |s| Value::String(s.clone()))
}

/// Data URL for the artifact, preferring a stored one over one built from base64.
fn qr_image(record: &SessionRecord) -> Value {
    if let Some(image) = &record.qr_image {
        return Value::String(image.clone());
    }
    match (&record.qr_base64, &record.qr_content_type) {
        (Some(b64), content_type) => Value::String(format!(
            "data:{};base64,{}",
            content_type
                .as_deref()
                .unwrap_or(crate::extract::DEFAULT_QR_CONTENT_TYPE),
            b64
        )),
        (None, _) => Value::Null,
    }
}

fn insert_artifact_fields(target: &mut Map<String, Value>, record: &SessionRecord) {
    let base64 = opt_string(record.qr_base64.as_ref());
    for alias in BASE64_ALIASES {
        target.insert(alias.to_string(), base64.clone());
    }
    let content_type = opt_string(record.qr_content_type.as_ref());
    for alias in CONTENT_TYPE_ALIASES {
        target.insert(alias.to_string(), content_type.clone());
    }
    target.insert("qrImage".to_string(), qr_image(record));
    target.insert("qrUrl".to_string(), opt_string(record.qr_url.as_ref()));
    target.insert(
        "qrUpdatedAt".to_string(),
        timestamp_value(record.qr_updated_at.as_ref()),
    );
    target.insert(
        "qrExpiresAt".to_string(),
        timestamp_value(record.qr_expires_at.as_ref()),
    );
    target.insert(
        "qrExpiresInSeconds".to_string(),
        record.qr_expires_in_seconds.map_or(Value::Null, Value::from),
    );
}

fn qr_group(record: &SessionRecord) -> Value {
    json!({
        "base64": opt_string(record.qr_base64.as_ref()),
        "contentType": opt_string(record.qr_content_type.as_ref()),
        "image": qr_image(record),
        "url": opt_string(record.qr_url.as_ref()),
        "updatedAt": timestamp_value(record.qr_updated_at.as_ref()),
        "expiresAt": timestamp_value(record.qr_expires_at.as_ref()),
    })
}

/// Per-record entry used in `results`.
pub fn summarize(record: &SessionRecord) -> (String, Value) {
    let state = policy::derive_state(record).to_string();

    let mut entry = Map::new();
    entry.insert("agentId".to_string(), Value::String(record.agent_id.clone()));
    entry.insert("status".to_string(), Value::String(state.clone()));
    entry.insert("isActive".to_string(), Value::Bool(record.is_active));
    insert_artifact_fields(&mut entry, record);
    entry.insert(
        "receivedAt".to_string(),
        Value::String(format_timestamp(&record.received_at)),
    );
    entry.insert("traceId".to_string(), opt_string(record.trace_id.as_ref()));
    entry.insert("qr".to_string(), qr_group(record));

    (state, Value::Object(entry))
}

/// Status document for a known record.
pub fn normalize(record: &SessionRecord, options: &NormalizeOptions) -> Value {
    let (state, entry) = summarize(record);
    let updated_at = record.qr_updated_at.as_ref().unwrap_or(&record.received_at);

    let mut doc = Map::new();
    doc.insert("success".to_string(), Value::Bool(true));
    doc.insert(
        "stored".to_string(),
        Value::from(options.total_stored.unwrap_or(1)),
    );
    doc.insert("agentId".to_string(), Value::String(record.agent_id.clone()));
    doc.insert(
        "status".to_string(),
        json!({
            "state": state,
            "updatedAt": format_timestamp(updated_at),
        }),
    );
    insert_artifact_fields(&mut doc, record);
    doc.insert("traceId".to_string(), opt_string(record.trace_id.as_ref()));
    doc.insert("isActive".to_string(), Value::Bool(record.is_active));
    doc.insert("qr".to_string(), qr_group(record));

    let mut results = Vec::with_capacity(1 + options.extra_entries.len());
    results.push(entry);
    results.extend(options.extra_entries.iter().cloned());
    doc.insert("results".to_string(), Value::Array(results));

    doc.insert(
        "data".to_string(),
        serde_json::to_value(record).unwrap_or(Value::Null),
    );
    doc.insert(
        "raw".to_string(),
        options
            .raw_payload
            .clone()
            .or_else(|| record.raw.clone())
            .unwrap_or(Value::Null),
    );

    Value::Object(doc)
}

/// Document returned while a session does not exist yet.
pub fn not_found(now: DateTime<Utc>) -> Value {
    json!({
        "success": false,
        "status": {
            "state": NOT_FOUND_STATE,
            "updatedAt": format_timestamp(&now),
        },
        "message": NOT_FOUND_MESSAGE,
    })
}

pub fn normalize_or_not_found(
    record: Option<&SessionRecord>,
    options: &NormalizeOptions,
    now: DateTime<Utc>,
) -> Value {
    match record {
        Some(record) => normalize(record, options),
        None => not_found(now),
    }
}
