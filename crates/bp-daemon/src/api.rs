// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane API types: request/response envelopes and the
//! error-to-status mapping shared by every handler in [`crate::build_app`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bp_core::error::BackplaneError;
use bp_core::{Action, CodexJob, ContextMeta, ContextSnapshot, JobMode, ScriptEntry, SemanticIndex, Transaction, TreeNode};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Wraps [`BackplaneError`] so it can be returned directly from an axum
/// handler; the `error`/`detail` JSON shape is the enum's own serde
/// representation, matching the teacher's `ApiError` envelope convention.
#[derive(Debug)]
pub struct ApiError(pub BackplaneError);

impl From<BackplaneError> for ApiError {
    fn from(err: BackplaneError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Build a `MalformedRequest` error from a list of human-readable problems.
    pub fn malformed(reasons: Vec<String>) -> Self {
        Self(BackplaneError::MalformedRequest {
            reason: reasons.join("; "),
        })
    }

    fn status(&self) -> StatusCode {
        use BackplaneError::*;
        match &self.0 {
            FenceMismatch | ScopeMismatch | NoPrimary | PrimaryAlreadyRegistered => {
                StatusCode::CONFLICT
            }
            ProtocolVersionMismatch { .. } => StatusCode::BAD_REQUEST,
            QueueFull => StatusCode::TOO_MANY_REQUESTS,
            ClaimInvalidOrExpired => StatusCode::CONFLICT,
            NoContext | ScriptNotFound { .. } | NoMemory | EmptyMemory | JobNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            SourceOmitted | SourceTruncated | SourceMissing | JobExpired => StatusCode::GONE,
            InvalidActionsList | MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            ActionValidation { .. } | RiskTooHigh { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self.0)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared fragments
// ---------------------------------------------------------------------------

/// Scope identifying fields present on every lease-bound request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeIn {
    pub place_id: i64,
    pub session_id: String,
}

/// Optional scope fields on scope-auto GET endpoints; omitted fields fall
/// back to the current primary, per §9's scope-auto resolution rule.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScopeQuery {
    pub place_id: Option<i64>,
    pub session_id: Option<String>,
}

/// `projectKey` query fragment, defaulting to `"default"` when absent.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectKeyQuery {
    pub place_id: Option<i64>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub project_key: Option<String>,
}

/// Presented lease credentials; every lease-bound handler validates these
/// via [`bp_lease::LeaseManager::check`] before any side effect.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseIn {
    #[serde(flatten)]
    pub scope: ScopeIn,
    pub lease_token: String,
    pub fence: u64,
}

/// A generic `{"ok": true}` acknowledgement.
#[derive(Debug, Clone, Serialize)]
pub struct Ok {
    pub ok: bool,
}

impl Ok {
    pub fn yes() -> Self {
        Self { ok: true }
    }
}

// ---------------------------------------------------------------------------
// /register, /release, /heartbeat, /sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub client_id: String,
    pub session_id: String,
    pub place_id: i64,
    #[serde(default)]
    pub takeover: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub lease_token: String,
    pub fence: u64,
    pub server_seq: u64,
    pub reset: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    #[serde(flatten)]
    pub scope: ScopeIn,
    pub lease_token: String,
    pub fence: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(flatten)]
    pub lease: LeaseIn,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub server_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub ok: bool,
    pub contract_version: String,
    pub fence: u64,
}

// ---------------------------------------------------------------------------
// /wait, /receipt, /enqueue, /status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitRequest {
    #[serde(flatten)]
    pub lease: LeaseIn,
    pub since: u64,
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitResponse {
    pub empty: bool,
    pub seq: Option<u64>,
    pub fence: Option<u64>,
    pub claim_token: Option<String>,
    pub tx: Option<Transaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRequest {
    #[serde(flatten)]
    pub lease: LeaseIn,
    pub claim_token: String,
    pub transaction_id: String,
    #[serde(default)]
    pub applied: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResponse {
    pub ok: bool,
    pub removed_seq: u64,
    pub remaining: usize,
    pub applied_count: usize,
    pub errors_count: usize,
    pub notes_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(flatten)]
    pub lease: LeaseIn,
    pub tx: Transaction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub ok: bool,
    pub seq: u64,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub pending: usize,
    pub claimed: usize,
    pub max_queue: usize,
    pub last_receipt: Option<bp_queue::LastReceipt>,
    pub primary: Option<ScopeOut>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeOut {
    pub place_id: i64,
    pub session_id: String,
}

impl From<bp_core::Scope> for ScopeOut {
    fn from(scope: bp_core::Scope) -> Self {
        Self {
            place_id: scope.place_id,
            session_id: scope.session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// /diagnostics, /debug/state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsResponse {
    pub status: String,
    pub contract_version: String,
    pub uptime_seconds: u64,
    pub primary: Option<ScopeOut>,
    pub queue: StatusResponse,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugStateResponse {
    pub scope: Option<ScopeOut>,
    pub lease_alive: bool,
    pub queue: StatusResponse,
    pub context_version: Option<u64>,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextExportRequest {
    pub place_id: i64,
    pub session_id: String,
    #[serde(default)]
    pub project_key: Option<String>,
    #[serde(default)]
    pub meta: ContextMeta,
    #[serde(default)]
    pub tree: Vec<TreeNode>,
    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ContextExportResponse {
    Unchanged,
    Throttled,
    Accepted { snapshot: Box<ContextSnapshot> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRequestBody {
    pub place_id: i64,
    pub session_id: String,
    #[serde(default)]
    pub project_key: Option<String>,
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub include_sources: bool,
    #[serde(default)]
    pub mode: Option<bp_core::SnapshotMode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptQuery {
    pub place_id: Option<i64>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub project_key: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMemoryRequest {
    pub place_id: i64,
    pub session_id: String,
    #[serde(default)]
    pub project_key: Option<String>,
    pub memory: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMemoryResponse {
    pub memory: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Codex bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexJobRequest {
    pub place_id: i64,
    pub session_id: String,
    #[serde(default)]
    pub project_key: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl CodexJobRequest {
    pub fn mode(&self) -> JobMode {
        if self.auto_apply {
            JobMode::Auto
        } else {
            JobMode::Manual
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexJobResponse {
    pub ok: bool,
    pub job_id: String,
    pub context_id: String,
    pub context_version: u64,
}

impl From<CodexJob> for CodexJobResponse {
    fn from(job: CodexJob) -> Self {
        Self {
            ok: true,
            job_id: job.job_id,
            context_id: job.context_id,
            context_version: job.context_version,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexResponseRequest {
    pub job_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub actions: Option<serde_json::Value>,
    #[serde(default)]
    pub tx: Option<serde_json::Value>,
    #[serde(default)]
    pub plan: Option<serde_json::Value>,
    #[serde(default)]
    pub dsl: Option<serde_json::Value>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum CodexResponseOutcome {
    Enqueued { transaction_id: String, seq: u64 },
    Rejected { reasons: Vec<String> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexCompileRequest {
    pub place_id: i64,
    pub session_id: String,
    pub actions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum CodexCompileResponse {
    Valid { actions: Vec<Action> },
    Invalid { reasons: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexStatusResponse {
    pub pending_jobs: usize,
    pub last_enqueued: Option<(String, String, u64)>,
    pub last_rejected: Option<(String, Vec<String>)>,
}

// ---------------------------------------------------------------------------
// Audit / health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AuditLedgerResponse {
    pub records: Vec<bp_audit::AuditRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextEventsResponse {
    pub records: Vec<bp_audit::ContextEventRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticResponse {
    pub index: SemanticIndex,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingResponse {
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummaryResponse {
    pub context_version: u64,
    pub context_id: String,
    pub meta: ContextMeta,
    pub script_count: usize,
    pub tree_count: usize,
    pub last_export_at: chrono::DateTime<chrono::Utc>,
    pub memory: Option<String>,
}

impl From<bp_context::ContextSummary> for ContextSummaryResponse {
    fn from(s: bp_context::ContextSummary) -> Self {
        Self {
            context_version: s.context_version,
            context_id: s.context_id,
            meta: s.meta,
            script_count: s.script_count,
            tree_count: s.tree_count,
            last_export_at: s.last_export_at,
            memory: s.memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fencing_errors_map_to_conflict() {
        let err = ApiError(BackplaneError::FenceMismatch);
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_family_maps_to_404() {
        assert_eq!(
            ApiError(BackplaneError::NoContext).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(BackplaneError::JobNotFound {
                job_id: "j1".into()
            })
            .status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn action_validation_maps_to_unprocessable() {
        let err = ApiError(BackplaneError::ActionValidation {
            reasons: vec!["bad".into()],
        });
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn persistence_maps_to_internal_error() {
        let err = ApiError(BackplaneError::Persistence {
            reason: "disk full".into(),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn malformed_helper_joins_reasons() {
        let err = ApiError::malformed(vec!["a".into(), "b".into()]);
        match err.0 {
            BackplaneError::MalformedRequest { reason } => assert_eq!(reason, "a; b"),
            _ => panic!("wrong variant"),
        }
    }
}
