use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_ACTIVE: &str = "active";

/// Cached link state for one agent's channel session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub agent_id: String,
    pub status: String,
    pub is_active: bool,
    pub qr_base64: Option<String>,
    pub qr_content_type: Option<String>,
    pub qr_image: Option<String>,
    pub qr_url: Option<String>,
    pub qr_updated_at: Option<DateTime<Utc>>,
    pub qr_expires_at: Option<DateTime<Utc>>,
    pub qr_expires_in_seconds: Option<i64>,
    pub received_at: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub raw: Option<serde_json::Value>,
}

impl SessionRecord {
    pub fn new(agent_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: STATUS_PENDING.to_string(),
            is_active: false,
            qr_base64: None,
            qr_content_type: None,
            qr_image: None,
            qr_url: None,
            qr_updated_at: None,
            qr_expires_at: None,
            qr_expires_in_seconds: None,
            received_at: now,
            trace_id: None,
            raw: None,
        }
    }

    pub fn has_artifact(&self) -> bool {
        self.qr_base64.is_some() || self.qr_image.is_some() || self.qr_url.is_some()
    }

    /// An artifact without an expiry never goes stale on its own.
    pub fn artifact_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.qr_expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// Partial update merged into a [`SessionRecord`].
///
/// `None` leaves the stored value alone. For nullable fields `Some(None)`
/// clears the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<String>,
    pub is_active: Option<bool>,
    pub qr_base64: Option<Option<String>>,
    pub qr_content_type: Option<Option<String>>,
    pub qr_image: Option<Option<String>>,
    pub qr_url: Option<Option<String>>,
    pub qr_updated_at: Option<Option<DateTime<Utc>>>,
    pub qr_expires_at: Option<Option<DateTime<Utc>>>,
    pub qr_expires_in_seconds: Option<Option<i64>>,
    pub trace_id: Option<Option<String>>,
    pub raw: Option<Option<serde_json::Value>>,
}

impl SessionPatch {
    /// Layer `top` over `self`; every field present in `top` wins.
    pub fn overlay(self, top: SessionPatch) -> SessionPatch {
        SessionPatch {
            status: top.status.or(self.status),
            is_active: top.is_active.or(self.is_active),
            qr_base64: top.qr_base64.or(self.qr_base64),
            qr_content_type: top.qr_content_type.or(self.qr_content_type),
            qr_image: top.qr_image.or(self.qr_image),
            qr_url: top.qr_url.or(self.qr_url),
            qr_updated_at: top.qr_updated_at.or(self.qr_updated_at),
            qr_expires_at: top.qr_expires_at.or(self.qr_expires_at),
            qr_expires_in_seconds: top.qr_expires_in_seconds.or(self.qr_expires_in_seconds),
            trace_id: top.trace_id.or(self.trace_id),
            raw: top.raw.or(self.raw),
        }
    }

    pub fn apply_to(self, record: &mut SessionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(is_active) = self.is_active {
            record.is_active = is_active;
        }
        assign(&mut record.qr_base64, self.qr_base64);
        assign(&mut record.qr_content_type, self.qr_content_type);
        assign(&mut record.qr_image, self.qr_image);
        assign(&mut record.qr_url, self.qr_url);
        assign(&mut record.qr_updated_at, self.qr_updated_at);
        assign(&mut record.qr_expires_at, self.qr_expires_at);
        assign(&mut record.qr_expires_in_seconds, self.qr_expires_in_seconds);
        assign(&mut record.trace_id, self.trace_id);
        assign(&mut record.raw, self.raw);
    }
}

fn assign<T>(slot: &mut Option<T>, incoming: Option<Option<T>>) {
    if let Some(value) = incoming {
        *slot = value;
    }
}

/// Trimmed, non-empty agent id or `None`.
pub fn normalize_agent_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
