//! Remote payload extraction
//!
//! The linking backend has answered with several generations of payload shapes:
//! snake_case and camelCase keys, QR data as a nested object or a bare string,
//! fields wrapped in a `data` envelope, timestamps as strings, epoch numbers or
//! `{seconds, nanos}` objects. Everything here folds those shapes into a single
//! [`SessionPatch`] so the store only ever sees one vocabulary.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::models::SessionPatch;

pub const DEFAULT_QR_CONTENT_TYPE: &str = "image/png";

const STATUS_KEYS: &[&str] = &["status", "session_status", "state", "sessionState"];
const ACTIVE_KEYS: &[&str] = &["isActive", "is_active"];
const TRACE_KEYS: &[&str] = &["traceId", "trace_id"];

const QR_CONTAINER_KEYS: &[&str] = &["qr", "qr_details", "qrDetails", "qr_code", "qrCode"];
const BASE64_KEYS: &[&str] = &["qr_base64", "qrBase64", "qrCodeBase64", "qr_code_base64"];
const NESTED_BASE64_KEYS: &[&str] = &["base64", "data", "qr", "qrCode", "qr_code"];
const CONTENT_TYPE_KEYS: &[&str] = &["qr_content_type", "qrContentType", "qrCodeContentType"];
const NESTED_CONTENT_TYPE_KEYS: &[&str] = &["contentType", "mime_type", "mimeType"];
const IMAGE_KEYS: &[&str] = &["qrImage", "qr_image"];
const URL_KEYS: &[&str] = &["qr_url", "qrUrl", "qrCodeUrl", "qr_code_url"];
const NESTED_URL_KEYS: &[&str] = &["url", "qrUrl", "deeplink"];
const EXPIRES_AT_KEYS: &[&str] = &["qr_expires_at", "qrExpiresAt"];
const NESTED_EXPIRES_AT_KEYS: &[&str] = &["expires_at", "expiresAt"];
const EXPIRES_IN_KEYS: &[&str] = &["qr_expires_in", "qrExpiresIn", "qrExpiresInSeconds"];
const NESTED_EXPIRES_IN_KEYS: &[&str] = &["expires_in", "expiresIn"];
const UPDATED_AT_KEYS: &[&str] = &["qrUpdatedAt", "qr_updated_at"];
const NESTED_UPDATED_AT_KEYS: &[&str] = &["updated_at", "updatedAt"];

const SECONDS_KEYS: &[&str] = &["seconds", "_seconds", "epochSeconds", "epoch_seconds"];
const NANOS_KEYS: &[&str] = &["nanoseconds", "nanos", "_nanoseconds", "nanoSeconds"];

/// Result of looking a field up under several spellings.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Found<'a> {
    Absent,
    Null,
    Value(&'a Value),
}

impl<'a> Found<'a> {
    fn or_else(self, next: impl FnOnce() -> Found<'a>) -> Found<'a> {
        match self {
            Found::Value(_) => self,
            Found::Null => match next() {
                Found::Value(v) => Found::Value(v),
                _ => Found::Null,
            },
            Found::Absent => next(),
        }
    }
}

fn find_in<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Found<'a> {
    let mut seen_null = false;
    for key in keys {
        match object.get(*key) {
            Some(Value::Null) => seen_null = true,
            Some(value) => return Found::Value(value),
            None => {}
        }
    }
    if seen_null {
        Found::Null
    } else {
        Found::Absent
    }
}

/// Collapse a decoded response body into the object the store merges.
///
/// Arrays are unwrapped to their first element; anything that is not an object
/// becomes `{}`.
pub fn unwrap_payload(value: Value) -> Value {
    let value = match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    match value {
        Value::Object(_) => value,
        _ => Value::Object(Map::new()),
    }
}

/// Correlation id from the top level or the `data` envelope.
pub fn extract_trace_id(payload: &Value) -> Option<String> {
    let scopes = Scopes::of(payload);
    match scopes.find(TRACE_KEYS) {
        Found::Value(v) => non_empty_string(v),
        _ => None,
    }
}

/// Build the partial record described by a remote payload.
///
/// `now` stamps `qrUpdatedAt` when a fresh artifact arrives without one.
pub fn patch_from_remote(payload: &Value, now: DateTime<Utc>) -> SessionPatch {
    let scopes = Scopes::of(payload);
    let mut patch = SessionPatch {
        raw: Some(Some(payload.clone())),
        ..Default::default()
    };

    if let Found::Value(v) = scopes.find(STATUS_KEYS) {
        patch.status = non_empty_string(v);
    }
    if let Found::Value(Value::Bool(active)) = scopes.find(ACTIVE_KEYS) {
        patch.is_active = Some(*active);
    }
    match scopes.find(TRACE_KEYS) {
        Found::Value(v) => {
            if let Some(trace) = non_empty_string(v) {
                patch.trace_id = Some(Some(trace));
            }
        }
        Found::Null => patch.trace_id = Some(None),
        Found::Absent => {}
    }

    let container = scopes.find(QR_CONTAINER_KEYS);
    let nested = match container {
        Found::Value(Value::Object(obj)) => Some(obj),
        _ => None,
    };
    let bare = match container {
        Found::Value(Value::String(s)) if !s.trim().is_empty() => Some(s.trim()),
        _ => None,
    };
    let nested_find = |keys: &[&str]| nested.map_or(Found::Absent, |obj| find_in(obj, keys));

    // Artifact representations, in precedence order: base64, data URL, link.
    let base64 = scopes
        .find(BASE64_KEYS)
        .or_else(|| nested_find(NESTED_BASE64_KEYS));
    let base64_value = match base64 {
        Found::Value(v) => v.as_str().and_then(sanitize_base64),
        _ => None,
    }
    .or_else(|| bare.filter(|s| is_bare_base64(s)).and_then(sanitize_base64));

    let image = scopes.find(IMAGE_KEYS);
    let image_value = match image {
        Found::Value(v) => non_empty_string(v),
        _ => None,
    }
    .or_else(|| bare.filter(|s| s.starts_with("data:")).map(str::to_string));

    let url = scopes.find(URL_KEYS).or_else(|| nested_find(NESTED_URL_KEYS));
    let url_value = match url {
        Found::Value(v) => non_empty_string(v),
        _ => None,
    }
    .or_else(|| bare.filter(|s| s.starts_with("http")).map(str::to_string));

    let fresh_artifact = if let Some(b64) = base64_value {
        patch.qr_base64 = Some(Some(b64));
        patch.qr_image = Some(None);
        patch.qr_url = Some(None);
        true
    } else if let Some(img) = image_value {
        patch.qr_base64 = Some(None);
        patch.qr_image = Some(Some(img));
        patch.qr_url = Some(None);
        true
    } else if let Some(link) = url_value {
        patch.qr_base64 = Some(None);
        patch.qr_image = Some(None);
        patch.qr_url = Some(Some(link));
        true
    } else {
        if base64 == Found::Null {
            patch.qr_base64 = Some(None);
        }
        if image == Found::Null {
            patch.qr_image = Some(None);
        }
        if url == Found::Null {
            patch.qr_url = Some(None);
        }
        false
    };

    match scopes
        .find(CONTENT_TYPE_KEYS)
        .or_else(|| nested_find(NESTED_CONTENT_TYPE_KEYS))
    {
        Found::Value(v) => {
            if let Some(ct) = non_empty_string(v) {
                patch.qr_content_type = Some(Some(ct));
            }
        }
        Found::Null => patch.qr_content_type = Some(None),
        Found::Absent => {}
    }
    if matches!(patch.qr_base64, Some(Some(_))) && patch.qr_content_type.is_none() {
        patch.qr_content_type = Some(Some(DEFAULT_QR_CONTENT_TYPE.to_string()));
    }

    patch.qr_expires_at = timestamp_field(
        scopes
            .find(EXPIRES_AT_KEYS)
            .or_else(|| nested_find(NESTED_EXPIRES_AT_KEYS)),
    );
    patch.qr_expires_in_seconds = match scopes
        .find(EXPIRES_IN_KEYS)
        .or_else(|| nested_find(NESTED_EXPIRES_IN_KEYS))
    {
        Found::Value(v) => v
            .as_i64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
            .map(Some),
        Found::Null => Some(None),
        Found::Absent => None,
    };
    patch.qr_updated_at = timestamp_field(
        scopes
            .find(UPDATED_AT_KEYS)
            .or_else(|| nested_find(NESTED_UPDATED_AT_KEYS)),
    );
    if fresh_artifact && !matches!(patch.qr_updated_at, Some(Some(_))) {
        patch.qr_updated_at = Some(Some(now));
    }

    patch
}

fn timestamp_field(found: Found<'_>) -> Option<Option<DateTime<Utc>>> {
    match found {
        Found::Value(v) => coerce_timestamp(v).map(Some),
        Found::Null => Some(None),
        Found::Absent => None,
    }
}

/// Lookup order: top-level keys, then the `data` envelope.
struct Scopes<'a> {
    top: Option<&'a Map<String, Value>>,
    data: Option<&'a Map<String, Value>>,
}

impl<'a> Scopes<'a> {
    fn of(payload: &'a Value) -> Self {
        let top = payload.as_object();
        let data = top.and_then(|t| t.get("data")).and_then(Value::as_object);
        Self { top, data }
    }

    fn find(&self, keys: &[&str]) -> Found<'a> {
        let top = self.top.map_or(Found::Absent, |t| find_in(t, keys));
        let data = self.data;
        top.or_else(|| data.map_or(Found::Absent, |d| find_in(d, keys)))
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_bare_base64(s: &str) -> bool {
    !s.starts_with("http") && !s.starts_with("data:")
}

/// Strip all whitespace; empty input yields `None`.
pub fn sanitize_base64(value: &str) -> Option<String> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        None
    } else {
        Some(compact)
    }
}

/// Parse the timestamp encodings the backend emits.
///
/// Numbers above 1e12 are epoch milliseconds, anything else epoch seconds.
pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_f64().filter(|f| f.is_finite())?;
            let millis = if raw > 1e12 { raw } else { raw * 1000.0 };
            DateTime::from_timestamp_millis(millis.round() as i64)
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(parsed.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
                .ok()
                .map(|naive| naive.and_utc())
        }
        Value::Object(obj) => {
            let seconds = match find_in(obj, SECONDS_KEYS) {
                Found::Value(v) => v.as_f64().filter(|f| f.is_finite())?,
                _ => return None,
            };
            let nanos = match find_in(obj, NANOS_KEYS) {
                Found::Value(v) => v.as_f64().unwrap_or(0.0),
                _ => 0.0,
            };
            let millis = seconds * 1000.0 + (nanos / 1e6).round();
            DateTime::from_timestamp_millis(millis as i64)
        }
        _ => None,
    }
}
