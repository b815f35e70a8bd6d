//! Sync orchestrator
//!
//! Every caller-facing operation runs the same cycle:
//! prune store -> call remote backend -> merge payload -> normalize.
//!
//! The store is only written after the remote answered with a success status,
//! and then with a single upsert, so a failed call never leaves a partial merge.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use linkcache_core::config::DEFAULT_EXECUTE_URL_TEMPLATE;
use linkcache_core::extract::{extract_trace_id, patch_from_remote};
use linkcache_core::models::normalize_agent_id;
use linkcache_core::normalize::{normalize, normalize_or_not_found, NormalizeOptions};
use linkcache_core::{
    policy, BackendError, CreateSessionRequest, LinkBackend, LinkCacheConfig, RemoteReply,
    SessionRecord, SessionStore, UpsertMeta,
};
use serde_json::{json, Value};
use thiserror::Error;

const UNREACHABLE_MESSAGE: &str = "Failed to reach session service";

/// Failures reported to the immediate caller. None of them touch the store.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Validation(String),

    #[error("{message}")]
    RemoteUnavailable {
        message: String,
        #[source]
        source: BackendError,
    },

    #[error("{message}")]
    RemoteRejected {
        status: u16,
        message: String,
        raw: Value,
    },
}

impl SyncError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::RemoteUnavailable { .. } => StatusCode::BAD_GATEWAY,
            SyncError::RemoteRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// `{success: false, message, raw?}`
    pub fn to_document(&self) -> Value {
        let mut doc = json!({
            "success": false,
            "message": self.to_string(),
        });
        if let SyncError::RemoteRejected { raw, .. } = self {
            doc["raw"] = raw.clone();
        }
        doc
    }
}

/// Which remote operation a cycle runs; drives messages and the merge floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Status,
    Detail,
    Reconnect,
    Create,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Status => "status",
            Operation::Detail => "detail",
            Operation::Reconnect => "reconnect",
            Operation::Create => "create",
        }
    }

    fn failure_message(self, status: u16) -> String {
        match self {
            Operation::Status => "Failed to fetch session status".to_string(),
            Operation::Detail => format!("Failed to fetch session ({})", status),
            Operation::Reconnect => format!("Failed to reconnect session ({})", status),
            Operation::Create => "Failed to create session".to_string(),
        }
    }

    /// Handshake-initiating operations reset visible state to pending.
    fn applies_pending_floor(self) -> bool {
        matches!(self, Operation::Reconnect | Operation::Create)
    }
}

pub struct SyncOrchestrator {
    store: Arc<SessionStore>,
    backend: Arc<dyn LinkBackend>,
    max_entry_age: chrono::Duration,
    execute_url_template: String,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        backend: Arc<dyn LinkBackend>,
        max_entry_age: chrono::Duration,
    ) -> Self {
        Self {
            store,
            backend,
            max_entry_age,
            execute_url_template: DEFAULT_EXECUTE_URL_TEMPLATE.to_string(),
        }
    }

    pub fn from_config(
        store: Arc<SessionStore>,
        backend: Arc<dyn LinkBackend>,
        config: &LinkCacheConfig,
    ) -> Self {
        Self {
            execute_url_template: config.backend.execute_url_template.clone(),
            ..Self::new(store, backend, config.max_entry_age())
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn backend_url(&self) -> &str {
        self.backend.base_url()
    }

    /// Poll the remote status endpoint and merge the answer.
    pub async fn poll_status(&self, agent_id: Option<&str>) -> Result<Value, SyncError> {
        let agent_id = require_agent_id(agent_id, "agentId query parameter is required")?;
        self.prune();
        let reply = self
            .remote(Operation::Status, &agent_id, self.backend.session_status(&agent_id))
            .await?;
        self.absorb(Operation::Status, &agent_id, reply)
    }

    /// Poll the remote detail endpoint (QR artifact included) and merge the answer.
    pub async fn session_detail(&self, agent_id: Option<&str>) -> Result<Value, SyncError> {
        let agent_id = require_agent_id(agent_id, "agentId parameter is required")?;
        self.prune();
        let reply = self
            .remote(Operation::Detail, &agent_id, self.backend.session_detail(&agent_id))
            .await?;
        self.absorb(Operation::Detail, &agent_id, reply)
    }

    /// Ask the remote for a fresh handshake; the record drops back to pending.
    pub async fn reconnect(&self, agent_id: Option<&str>) -> Result<Value, SyncError> {
        let agent_id = require_agent_id(agent_id, "agentId parameter is required")?;
        self.prune();
        let reply = self
            .remote(Operation::Reconnect, &agent_id, self.backend.reconnect(&agent_id))
            .await?;
        self.absorb(Operation::Reconnect, &agent_id, reply)
    }

    /// Create a remote session from a caller body carrying `agentId` and `apiKey`.
    pub async fn create_session(&self, body: &Value) -> Result<Value, SyncError> {
        let agent_id = pick_string(body, &["agentId", "agent_id", "agent"]);
        let api_key = pick_string(body, &["apiKey", "api_key", "apikey", "Apikey", "ApiKey"]);
        let (agent_id, api_key) = match (agent_id, api_key) {
            (Some(agent_id), Some(api_key)) => (agent_id, api_key),
            _ => {
                return Err(SyncError::Validation(
                    "Session create requires agentId and apiKey.".to_string(),
                ))
            }
        };
        let agent_name =
            pick_string(body, &["agentName", "agent_name"]).unwrap_or_else(|| agent_id.clone());

        self.prune();

        let request = CreateSessionRequest {
            execute_url: self.execute_url_template.replace("{agentId}", &agent_id),
            agent_id: agent_id.clone(),
            agent_name,
            api_key,
        };
        let reply = self
            .remote(Operation::Create, &agent_id, self.backend.create_session(&request))
            .await?;
        self.absorb(Operation::Create, &agent_id, reply)
    }

    /// Cached view without a remote call; an unknown agent gets the `not_found`
    /// document rather than an error.
    pub fn cached(&self, agent_id: Option<&str>) -> Result<Value, SyncError> {
        let agent_id = require_agent_id(agent_id, "agentId parameter is required")?;
        self.prune();
        Ok(self.render(self.store.get(&agent_id).as_ref(), None))
    }

    pub fn prune(&self) {
        self.store.prune(self.max_entry_age);
    }

    async fn remote(
        &self,
        operation: Operation,
        agent_id: &str,
        call: impl std::future::Future<Output = Result<RemoteReply, BackendError>>,
    ) -> Result<RemoteReply, SyncError> {
        call.await.map_err(|source| {
            tracing::error!(
                agent_id,
                operation = operation.name(),
                backend = self.backend.base_url(),
                error = %source,
                "Session service call failed"
            );
            SyncError::RemoteUnavailable {
                message: UNREACHABLE_MESSAGE.to_string(),
                source,
            }
        })
    }

    fn absorb(
        &self,
        operation: Operation,
        agent_id: &str,
        reply: RemoteReply,
    ) -> Result<Value, SyncError> {
        if !reply.is_success() {
            let message = reply
                .detail()
                .unwrap_or_else(|| operation.failure_message(reply.status));
            tracing::warn!(
                agent_id,
                operation = operation.name(),
                status = reply.status,
                message = %message,
                "Session service rejected request"
            );
            return Err(SyncError::RemoteRejected {
                status: reply.status,
                message,
                raw: reply.payload,
            });
        }

        let now = Utc::now();
        let mut patch = patch_from_remote(&reply.payload, now);
        if operation.applies_pending_floor() {
            patch = policy::with_pending_floor(patch);
        }
        let meta = UpsertMeta {
            trace_id: extract_trace_id(&reply.payload),
        };
        let record = self.store.upsert_at(agent_id, patch, meta, now);

        Ok(self.render(Some(&record), Some(reply.payload)))
    }

    fn render(&self, record: Option<&SessionRecord>, raw_payload: Option<Value>) -> Value {
        let now = Utc::now();
        let options = NormalizeOptions {
            raw_payload,
            total_stored: Some(self.store.len()),
            extra_entries: Vec::new(),
        };
        match record {
            Some(record) => normalize(&policy::mask_expired_artifact(record, now), &options),
            None => normalize_or_not_found(None, &options, now),
        }
    }
}

fn require_agent_id(agent_id: Option<&str>, message: &str) -> Result<String, SyncError> {
    agent_id
        .and_then(normalize_agent_id)
        .ok_or_else(|| SyncError::Validation(message.to_string()))
}

/// First non-empty string (or number) under any of `keys`.
fn pick_string(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match body.get(key)? {
        Value::String(s) => normalize_agent_id(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Canned backend; records every call it receives.
    struct FakeBackend {
        reply: Mutex<Option<Result<RemoteReply, ()>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn replying(status: u16, payload: Value) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(Ok(RemoteReply::new(status, payload)))),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn raw_reply(reply: RemoteReply) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(Ok(reply))),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(Err(()))),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn answer(&self, call: String) -> Result<RemoteReply, BackendError> {
            self.calls.lock().unwrap().push(call);
            match self.reply.lock().unwrap().clone() {
                Some(Ok(reply)) => Ok(reply),
                _ => Err(BackendError::Timeout(std::time::Duration::from_secs(15))),
            }
        }
    }

    #[async_trait]
    impl LinkBackend for FakeBackend {
        async fn session_status(&self, agent_id: &str) -> Result<RemoteReply, BackendError> {
            self.answer(format!("status:{}", agent_id))
        }

        async fn session_detail(&self, agent_id: &str) -> Result<RemoteReply, BackendError> {
            self.answer(format!("detail:{}", agent_id))
        }

        async fn reconnect(&self, agent_id: &str) -> Result<RemoteReply, BackendError> {
            self.answer(format!("reconnect:{}", agent_id))
        }

        async fn create_session(
            &self,
            request: &CreateSessionRequest,
        ) -> Result<RemoteReply, BackendError> {
            self.answer(format!(
                "create:{}:{}:{}",
                request.agent_id,
                request.agent_name,
                request.execute_url
            ))
        }

        fn base_url(&self) -> &str {
            "http://fake"
        }
    }

    fn orchestrator(backend: Arc<FakeBackend>) -> (SyncOrchestrator, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new());
        let orch = SyncOrchestrator::new(store.clone(), backend, chrono::Duration::minutes(15));
        (orch, store)
    }

    #[tokio::test]
    async fn test_reconnect_floors_to_pending_and_keeps_trace() {
        let backend = FakeBackend::replying(200, json!({"traceId": "t1"}));
        let (orch, store) = orchestrator(backend.clone());

        let doc = orch.reconnect(Some("a1")).await.unwrap();

        let record = store.get("a1").unwrap();
        assert_eq!(record.agent_id, "a1");
        assert_eq!(record.status, "pending");
        assert_eq!(record.trace_id.as_deref(), Some("t1"));
        assert_eq!(doc["status"]["state"], "pending");
        assert_eq!(doc["traceId"], "t1");
        assert_eq!(backend.calls(), vec!["reconnect:a1"]);
    }

    #[tokio::test]
    async fn test_reconnect_resets_an_active_session() {
        let backend = FakeBackend::replying(200, json!({}));
        let (orch, store) = orchestrator(backend);
        store.upsert(
            "a1",
            linkcache_core::SessionPatch {
                status: Some("active".to_string()),
                is_active: Some(true),
                ..Default::default()
            },
            UpsertMeta::default(),
        );

        let doc = orch.reconnect(Some("a1")).await.unwrap();
        assert_eq!(doc["status"]["state"], "pending");
        assert_eq!(doc["isActive"], false);
    }

    #[tokio::test]
    async fn test_poll_active_flag_without_status() {
        let backend = FakeBackend::replying(200, json!({"isActive": true, "qrBase64": null}));
        let (orch, store) = orchestrator(backend);

        let doc = orch.poll_status(Some("a1")).await.unwrap();

        assert!(store.get("a1").unwrap().is_active);
        assert_eq!(doc["status"]["state"], "active");
        assert_eq!(doc["success"], true);
        assert_eq!(doc["raw"], json!({"isActive": true, "qrBase64": null}));
    }

    #[tokio::test]
    async fn test_poll_rejection_passes_detail_and_leaves_store() {
        let backend = FakeBackend::replying(404, json!({"detail": "channel not found"}));
        let (orch, store) = orchestrator(backend);
        let before = store.upsert(
            "a1",
            linkcache_core::SessionPatch {
                status: Some("qr_ready".to_string()),
                ..Default::default()
            },
            UpsertMeta::default(),
        );

        let err = orch.poll_status(Some("a1")).await.unwrap_err();

        assert_eq!(err.to_string(), "channel not found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        let doc = err.to_document();
        assert_eq!(doc["success"], false);
        assert_eq!(doc["message"], "channel not found");
        assert_eq!(doc["raw"], json!({"detail": "channel not found"}));
        assert_eq!(store.get("a1"), Some(before));
    }

    #[tokio::test]
    async fn test_rejection_without_detail_uses_generic_message() {
        let backend = FakeBackend::raw_reply(RemoteReply::from_body(503, ""));
        let (orch, store) = orchestrator(backend);

        let err = orch.reconnect(Some("a1")).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to reconnect session (503)");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(store.get("a1").is_none());
    }

    #[tokio::test]
    async fn test_missing_agent_id_never_calls_remote() {
        let backend = FakeBackend::replying(200, json!({}));
        let (orch, store) = orchestrator(backend.clone());

        for candidate in [None, Some(""), Some("   ")] {
            let err = orch.poll_status(candidate).await.unwrap_err();
            assert!(matches!(err, SyncError::Validation(_)));
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
            assert!(err.to_document().get("raw").is_none());
        }
        assert!(orch.reconnect(None).await.is_err());
        assert!(backend.calls().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_bad_gateway() {
        let backend = FakeBackend::unreachable();
        let (orch, store) = orchestrator(backend);

        let err = orch.poll_status(Some("a1")).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable { .. }));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_document()["message"], UNREACHABLE_MESSAGE);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_still_merges() {
        let backend = FakeBackend::raw_reply(RemoteReply::from_body(200, "not json"));
        let (orch, store) = orchestrator(backend);

        let doc = orch.poll_status(Some("a1")).await.unwrap();
        assert_eq!(doc["status"]["state"], "pending");
        assert_eq!(doc["raw"], json!({}));
        assert!(store.get("a1").is_some());
    }

    #[tokio::test]
    async fn test_empty_not_found_is_a_rejection() {
        let backend = FakeBackend::raw_reply(RemoteReply::from_body(404, ""));
        let (orch, store) = orchestrator(backend);

        let err = orch.poll_status(Some("ghost")).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteRejected { status: 404, .. }));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        let doc = err.to_document();
        assert_eq!(doc["message"], "Failed to fetch session status");
        assert_eq!(doc["raw"], json!({}));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_no_content_creates_record() {
        let backend = FakeBackend::raw_reply(RemoteReply::from_body(204, ""));
        let (orch, store) = orchestrator(backend);

        let doc = orch.poll_status(Some("a1")).await.unwrap();
        assert_eq!(doc["success"], true);
        assert_eq!(doc["status"]["state"], "pending");
        assert_eq!(doc["raw"], json!({}));
        assert!(store.get("a1").is_some());
    }

    #[tokio::test]
    async fn test_no_content_refreshes_existing_record() {
        let backend = FakeBackend::raw_reply(RemoteReply::from_body(204, ""));
        let (orch, store) = orchestrator(backend);
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        store.upsert_at(
            "a1",
            linkcache_core::SessionPatch {
                status: Some("qr_ready".to_string()),
                ..Default::default()
            },
            UpsertMeta::default(),
            earlier,
        );

        let doc = orch.session_detail(Some("a1")).await.unwrap();
        assert_eq!(doc["status"]["state"], "qr_ready");
        assert!(store.get("a1").unwrap().received_at > earlier);
    }

    #[tokio::test]
    async fn test_poll_prunes_stale_records_first() {
        let backend = FakeBackend::replying(200, json!({}));
        let (orch, store) = orchestrator(backend);
        store.upsert_at(
            "a1",
            linkcache_core::SessionPatch {
                status: Some("qr_ready".to_string()),
                ..Default::default()
            },
            UpsertMeta::default(),
            Utc::now() - chrono::Duration::minutes(20),
        );

        // The stale record is gone before the merge, so defaults apply.
        let doc = orch.poll_status(Some("a1")).await.unwrap();
        assert_eq!(doc["status"]["state"], "pending");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_cached_view_without_remote_call() {
        let backend = FakeBackend::replying(200, json!({"status": "qr_ready"}));
        let (orch, _store) = orchestrator(backend.clone());

        let doc = orch.cached(Some("a1")).unwrap();
        assert_eq!(doc["success"], false);
        assert_eq!(doc["status"]["state"], "not_found");
        assert_eq!(doc["message"], "Session not found");
        assert!(matches!(orch.cached(Some(" ")), Err(SyncError::Validation(_))));
        assert!(backend.calls().is_empty());

        orch.poll_status(Some("a1")).await.unwrap();
        assert_eq!(orch.cached(Some("a1")).unwrap()["status"]["state"], "qr_ready");
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_status_overrides_retained_active_flag() {
        let store = Arc::new(SessionStore::new());
        let replies = [
            (json!({"isActive": true}), "active", true),
            (json!({"status": "pending"}), "pending", false),
            (json!({"isActive": true}), "active", true),
            (json!({"status": "disconnected"}), "disconnected", false),
        ];
        for (payload, state, active) in replies {
            let orch = SyncOrchestrator::new(
                store.clone(),
                FakeBackend::replying(200, payload),
                chrono::Duration::minutes(15),
            );
            let doc = orch.poll_status(Some("a1")).await.unwrap();
            assert_eq!(doc["status"]["state"], state);
            assert_eq!(doc["isActive"], active);
        }
    }

    #[tokio::test]
    async fn test_expired_artifact_hidden_from_callers() {
        let expired = (Utc::now() - chrono::Duration::seconds(30)).to_rfc3339();
        let backend = FakeBackend::replying(
            200,
            json!({"qrBase64": "QUJD", "qrExpiresAt": expired}),
        );
        let (orch, store) = orchestrator(backend);

        let doc = orch.session_detail(Some("a1")).await.unwrap();
        assert_eq!(doc["qrBase64"], Value::Null);
        assert_eq!(doc["qrImage"], Value::Null);
        assert_eq!(store.get("a1").unwrap().qr_base64.as_deref(), Some("QUJD"));
    }

    #[tokio::test]
    async fn test_trace_id_from_data_envelope() {
        let backend = FakeBackend::replying(200, json!({"data": {"trace_id": "t9", "status": "qr_ready"}}));
        let (orch, store) = orchestrator(backend);

        orch.poll_status(Some("a1")).await.unwrap();
        let record = store.get("a1").unwrap();
        assert_eq!(record.trace_id.as_deref(), Some("t9"));
        assert_eq!(record.status, "qr_ready");
    }

    #[tokio::test]
    async fn test_create_requires_agent_and_key() {
        let backend = FakeBackend::replying(200, json!({}));
        let (orch, _store) = orchestrator(backend.clone());

        let err = orch.create_session(&json!({"agentId": "a1"})).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_accepts_snake_case_and_fills_execute_url() {
        let backend = FakeBackend::replying(200, json!({"data": {"qr": "QUJD"}}));
        let store = Arc::new(SessionStore::new());
        let mut orch =
            SyncOrchestrator::new(store.clone(), backend.clone(), chrono::Duration::minutes(15));
        orch.execute_url_template = "https://agents.example/{agentId}/execute".to_string();

        let doc = orch
            .create_session(&json!({"agent_id": 42, "api_key": "k"}))
            .await
            .unwrap();

        assert_eq!(
            backend.calls(),
            vec!["create:42:42:https://agents.example/42/execute"]
        );
        assert_eq!(doc["status"]["state"], "pending");
        assert_eq!(doc["qrBase64"], "QUJD");
        assert_eq!(doc["stored"], 1);
    }
}
