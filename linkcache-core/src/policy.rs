//! Link-state business rules applied by the store and the orchestrator.

use chrono::{DateTime, Utc};

use crate::models::session::{SessionPatch, SessionRecord, STATUS_ACTIVE, STATUS_PENDING};

/// Caller-visible state of a record.
///
/// A non-empty status string wins; otherwise `isActive` decides between
/// `active` and `pending`.
pub fn derive_state(record: &SessionRecord) -> &str {
    let status = record.status.trim();
    if !status.is_empty() {
        status
    } else if record.is_active {
        STATUS_ACTIVE
    } else {
        STATUS_PENDING
    }
}

/// Make `status` and `isActive` agree after a merge.
///
/// A status carried by this patch is taken verbatim and, when the patch has
/// no flag, decides the flag. The flag only outranks a status that this patch
/// did not carry:
/// - `isActive: true` upgrades an empty or `pending` status to `active`
/// - `isActive: false` demotes a stale `active` status to `pending`
pub fn reconcile_activity(record: &mut SessionRecord, patch: &SessionPatch) {
    let patch_status = patch
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match (patch_status, patch.is_active) {
        (Some(status), None) => record.is_active = status == STATUS_ACTIVE,
        (Some(_), Some(_)) => {}
        (None, Some(true)) => {
            let placeholder = record.status.trim().is_empty() || record.status == STATUS_PENDING;
            if placeholder {
                record.status = STATUS_ACTIVE.to_string();
            }
        }
        (None, Some(false)) => {
            if record.status == STATUS_ACTIVE {
                record.status = STATUS_PENDING.to_string();
            }
        }
        (None, None) => {}
    }
}

/// Baseline merged underneath every handshake-initiating payload.
pub fn pending_floor() -> SessionPatch {
    SessionPatch {
        status: Some(STATUS_PENDING.to_string()),
        is_active: Some(false),
        ..Default::default()
    }
}

/// Reset visible state to pending, then let the remote payload speak.
///
/// A remote that only reports `isActive: true` gets an `active` floor, so the
/// floor's own status never contradicts the flag.
pub fn with_pending_floor(remote: SessionPatch) -> SessionPatch {
    let mut floor = pending_floor();
    if remote.status.is_none() && remote.is_active == Some(true) {
        floor.status = Some(STATUS_ACTIVE.to_string());
    }
    floor.overlay(remote)
}

/// Copy of `record` with an expired artifact removed.
///
/// The stored record is left intact; only the caller-facing view drops it.
pub fn mask_expired_artifact(record: &SessionRecord, now: DateTime<Utc>) -> SessionRecord {
    let mut view = record.clone();
    if view.artifact_expired(now) {
        view.qr_base64 = None;
        view.qr_image = None;
        view.qr_url = None;
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: &str, is_active: bool) -> SessionRecord {
        let mut r = SessionRecord::new("a1", Utc::now());
        r.status = status.to_string();
        r.is_active = is_active;
        r
    }

    #[test]
    fn test_derive_state_prefers_status_string() {
        assert_eq!(derive_state(&record("qr_ready", false)), "qr_ready");
        assert_eq!(derive_state(&record("", true)), "active");
        assert_eq!(derive_state(&record("  ", false)), "pending");
    }

    #[test]
    fn test_active_flag_promotes_placeholder_status() {
        let mut r = record("pending", true);
        let patch = SessionPatch {
            is_active: Some(true),
            ..Default::default()
        };
        reconcile_activity(&mut r, &patch);
        assert_eq!(r.status, "active");
    }

    #[test]
    fn test_active_flag_keeps_opaque_remote_status() {
        let mut r = record("connected", true);
        let patch = SessionPatch {
            status: Some("connected".to_string()),
            is_active: Some(true),
            ..Default::default()
        };
        reconcile_activity(&mut r, &patch);
        assert_eq!(r.status, "connected");
        assert!(r.is_active);
    }

    #[test]
    fn test_explicit_active_status_sets_flag() {
        let mut r = record("active", false);
        let patch = SessionPatch {
            status: Some("active".to_string()),
            ..Default::default()
        };
        reconcile_activity(&mut r, &patch);
        assert!(r.is_active);
    }

    #[test]
    fn test_deactivation_demotes_stale_active_status() {
        let mut r = record("active", false);
        let patch = SessionPatch {
            is_active: Some(false),
            ..Default::default()
        };
        reconcile_activity(&mut r, &patch);
        assert_eq!(r.status, "pending");
    }

    #[test]
    fn test_explicit_status_outranks_retained_flag() {
        let mut r = record("pending", true);
        let patch = SessionPatch {
            status: Some("pending".to_string()),
            ..Default::default()
        };
        reconcile_activity(&mut r, &patch);
        assert_eq!(r.status, "pending");
        assert!(!r.is_active);
    }

    #[test]
    fn test_inactive_status_clears_flag() {
        let mut r = record("active", true);
        let patch = SessionPatch {
            status: Some("disconnected".to_string()),
            ..Default::default()
        };
        reconcile_activity(&mut r, &patch);
        assert_eq!(r.status, "disconnected");
        assert!(!r.is_active);
    }

    #[test]
    fn test_pending_floor_follows_bare_active_flag() {
        let remote = SessionPatch {
            is_active: Some(true),
            ..Default::default()
        };
        let merged = with_pending_floor(remote);
        assert_eq!(merged.status.as_deref(), Some("active"));
        assert_eq!(merged.is_active, Some(true));
    }

    #[test]
    fn test_pending_floor_yields_to_remote_fields() {
        let remote = SessionPatch {
            status: Some("qr_ready".to_string()),
            ..Default::default()
        };
        let merged = with_pending_floor(remote);
        assert_eq!(merged.status.as_deref(), Some("qr_ready"));
        assert_eq!(merged.is_active, Some(false));

        let merged = with_pending_floor(SessionPatch::default());
        assert_eq!(merged.status.as_deref(), Some("pending"));
    }

    #[test]
    fn test_mask_expired_artifact() {
        let now = Utc::now();
        let mut r = record("pending", false);
        r.qr_base64 = Some("QUJD".to_string());
        r.qr_expires_at = Some(now - chrono::Duration::seconds(5));

        let view = mask_expired_artifact(&r, now);
        assert!(!view.has_artifact());
        assert_eq!(r.qr_base64.as_deref(), Some("QUJD"));

        r.qr_expires_at = Some(now + chrono::Duration::seconds(5));
        assert!(mask_expired_artifact(&r, now).has_artifact());
    }
}
