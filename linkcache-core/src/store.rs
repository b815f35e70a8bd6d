//! In-memory session store
//!
//! One [`SessionRecord`] per agent id behind a single mutex. Every operation
//! takes the lock once, so a merge is applied in full before any other merge or
//! sweep can observe the record.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::models::{SessionPatch, SessionRecord};
use crate::policy;

/// Out-of-band data attached to an upsert.
#[derive(Debug, Clone, Default)]
pub struct UpsertMeta {
    /// Overrides any trace id carried by the patch.
    pub trace_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> Option<SessionRecord> {
        self.records.lock().get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn upsert(&self, agent_id: &str, patch: SessionPatch, meta: UpsertMeta) -> SessionRecord {
        self.upsert_at(agent_id, patch, meta, Utc::now())
    }

    /// Merge `patch` into the record for `agent_id`, creating it if needed.
    pub fn upsert_at(
        &self,
        agent_id: &str,
        patch: SessionPatch,
        meta: UpsertMeta,
        now: DateTime<Utc>,
    ) -> SessionRecord {
        let mut records = self.records.lock();
        let record = records
            .entry(agent_id.to_string())
            .or_insert_with(|| SessionRecord::new(agent_id, now));

        let applied = SessionPatch {
            status: patch.status.clone(),
            is_active: patch.is_active,
            ..Default::default()
        };
        patch.apply_to(record);
        policy::reconcile_activity(record, &applied);

        if let Some(trace_id) = meta.trace_id {
            record.trace_id = Some(trace_id);
        }
        if now > record.received_at {
            record.received_at = now;
        }

        tracing::debug!(
            agent_id = %record.agent_id,
            status = %record.status,
            is_active = record.is_active,
            "Session record merged"
        );
        record.clone()
    }

    pub fn prune(&self, max_age: Duration) {
        self.prune_at(max_age, Utc::now());
    }

    /// Drop every record whose age is at least `max_age`.
    ///
    /// A non-positive `max_age` disables pruning.
    pub fn prune_at(&self, max_age: Duration, now: DateTime<Utc>) {
        if max_age <= Duration::zero() {
            return;
        }
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| now - record.received_at < max_age);
        let removed = before - records.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = records.len(), "Pruned stale session records");
        }
    }
}
