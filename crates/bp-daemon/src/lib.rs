// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-daemon
#![deny(unsafe_code)]
//!
//! The HTTP control-plane surface: wires every other crate in this
//! workspace into one [`AppState`], builds the axum [`Router`], and exposes
//! the two background loops (`run_codex_tick`, `run_reconcile_tick`) that
//! `main.rs` drives on a fixed cadence.

pub mod api;
pub mod middleware;
pub mod validation;

use api::*;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use bp_audit::AuditLog;
use bp_codexbridge::{BridgeConfig, CodexBridge, JobContext, JobRequest, TickDeps, TickOutcome};
use bp_config::BackplaneConfig;
use bp_context::{ContextKey, ContextRequest, ContextStore};
use bp_core::error::BackplaneError;
use bp_core::{Scope, CONTRACT_VERSION};
use bp_lease::LeaseManager;
use bp_policy::{PolicyEngine, PolicyProfile};
use bp_queue::TransactionQueue;
use bp_semantic::SemanticConfig;
use bp_store::{SqlStore, StatePaths};
use bp_validate::{validate_actions, NoCachedContext, ValidatorConfig};
use middleware::{request_id_middleware, CorsConfig, RateLimiter, RequestLogger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use validation::RequestValidator;

/// Everything a handler needs, built once at startup and shared behind an `Arc`.
pub struct AppState {
    config: BackplaneConfig,
    lease: LeaseManager,
    queue: TransactionQueue,
    context: ContextStore,
    policy: PolicyEngine,
    audit: AuditLog,
    sql: SqlStore,
    bridge: CodexBridge,
    state_paths: StatePaths,
    semantic_cache: Mutex<HashMap<(String, u64), bp_core::SemanticIndex>>,
    codex_status: Mutex<CodexStatusTracker>,
    started_at: Instant,
}

#[derive(Debug, Default, Clone)]
struct CodexStatusTracker {
    last_enqueued: Option<(String, String, u64)>,
    last_rejected: Option<(String, Vec<String>)>,
}

fn update_codex_status(tracker: &mut CodexStatusTracker, outcome: &TickOutcome) {
    if let Some((job_id, tx_id, seq)) = outcome.enqueued.last() {
        tracker.last_enqueued = Some((job_id.clone(), tx_id.clone(), *seq));
    }
    if let Some((job_id, reasons)) = outcome.rejected.last() {
        tracker.last_rejected = Some((job_id.clone(), reasons.clone()));
    }
}

impl AppState {
    /// Resolve a possibly-partial scope, falling back to the current primary
    /// when both fields are omitted — the scope-auto rule honored by
    /// `/status`, `/scope/current`, `/diagnostics`, and the `/debug/*` and
    /// `/context/*` GET helpers.
    async fn resolve_scope(&self, place_id: Option<i64>, session_id: Option<String>) -> Option<Scope> {
        match (place_id, session_id) {
            (Some(place_id), Some(session_id)) => Some(Scope::new(place_id, session_id)),
            _ => self.lease.primary_scope().await,
        }
    }

    fn project_key(raw: Option<String>) -> String {
        raw.filter(|s| !s.is_empty()).unwrap_or_else(|| "default".to_string())
    }

    fn validator_config(&self) -> ValidatorConfig<'_> {
        ValidatorConfig {
            policy: &self.policy,
            max_actions: self.config.max_actions,
            host_root_prefix: "game/",
        }
    }

    async fn semantic_for(&self, snapshot: &bp_core::ContextSnapshot) -> bp_core::SemanticIndex {
        let key = (snapshot.context_id.clone(), snapshot.context_version);
        if let Some(cached) = self.semantic_cache.lock().await.get(&key) {
            return cached.clone();
        }
        let index = bp_semantic::build_index(
            &snapshot.scripts,
            SemanticConfig {
                max_source_bytes: self.config.semantic_max_source_bytes,
                max_keywords: self.config.semantic_max_keywords,
                max_symbols: self.config.semantic_max_symbols,
            },
        );
        self.semantic_cache.lock().await.insert(key, index.clone());
        let _ = self
            .sql
            .upsert_context_semantic(snapshot.context_id.clone(), snapshot.context_version, index.clone())
            .await;
        index
    }

    async fn persist_context(&self, snapshot: &bp_core::ContextSnapshot) {
        let path = self.state_paths.context_snapshot(&snapshot.context_id);
        if let Err(e) = bp_store::atomic_write_json(&path, snapshot).await {
            tracing::warn!(error = %e, context_id = %snapshot.context_id, "failed to persist context snapshot to disk");
        }
        if let Err(e) = self.sql.upsert_context_snapshot(snapshot.clone()).await {
            tracing::warn!(error = %e, context_id = %snapshot.context_id, "failed to mirror context snapshot to sql");
        }
    }

    async fn persist_memory(&self, context_id: &str, memory: &str) {
        let path = self.state_paths.context_memory(context_id);
        if let Err(e) = tokio::fs::write(&path, memory.as_bytes()).await {
            tracing::warn!(error = %e, context_id, "failed to persist context memory to disk");
        }
        if let Err(e) = self
            .sql
            .upsert_context_memory(context_id.to_string(), memory.to_string())
            .await
        {
            tracing::warn!(error = %e, context_id, "failed to mirror context memory to sql");
        }
    }

    /// Mirror the current queue contents to disk/SQL. Best-effort: a missed
    /// persist only costs the in-flight items on an unclean restart, not
    /// correctness of the live process.
    async fn persist_queue_state(&self) {
        let (seq, items) = self.queue.snapshot().await;
        let path = self.state_paths.queue_state();
        if let Err(e) = bp_store::atomic_write_json(&path, &items).await {
            tracing::warn!(error = %e, "failed to persist queue state to disk");
        }
        if let Err(e) = self.sql.save_queue_state(seq, items).await {
            tracing::warn!(error = %e, "failed to mirror queue state to sql");
        }
    }

    fn bridge_response_path(&self, job_id: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.config.queue_dir)
            .join("responses")
            .join(format!("{job_id}.json"))
    }
}

/// Build the shared application state from a loaded configuration:
/// constructs every store/manager, opens the SQL mirror, and restores
/// persisted queue state from the last clean shutdown (if any).
pub async fn build_state(config: BackplaneConfig) -> anyhow::Result<Arc<AppState>> {
    let sql = SqlStore::new(&config.sqlite_path);
    sql.init_schema().await?;
    let state_paths = StatePaths::new(&config.state_dir);
    let audit = AuditLog::new(&config.state_dir, sql.clone(), config.audit_ledger_limit);

    let profile = PolicyProfile::parse(&config.policy_profile);
    let policy = PolicyEngine::new(
        profile,
        &config.protected_roots,
        &config.allowed_roots,
        config.safe_edit_bytes,
        config.max_source_bytes,
    )?;

    let queue = TransactionQueue::new(config.max_queue, config.claim_ttl_sec);
    if let Ok(Some((seq, items))) = sql.load_queue_state().await {
        tracing::info!(restored = items.len(), seq, "restored queue state from sql");
        queue.restore(seq, items).await;
    }

    let bridge = CodexBridge::new(
        &config.queue_dir,
        BridgeConfig {
            job_ttl_sec: config.job_ttl_sec,
            focus_max_scripts: config.focus_max_scripts,
            focus_max_bytes: config.focus_max_bytes,
            max_risk: config.max_risk,
            auto_repair: config.auto_repair,
            repair_max_attempts: config.repair_max_attempts,
            repair_cooldown_sec: config.repair_cooldown_sec,
            host_root_prefix: "game/".to_string(),
            max_actions: config.max_actions,
        },
    );

    Ok(Arc::new(AppState {
        lease: LeaseManager::new(config.heartbeat_ttl_sec),
        context: ContextStore::new(config.context_min_interval_sec, config.delta_max_items),
        policy,
        audit,
        sql,
        bridge,
        state_paths,
        semantic_cache: Mutex::new(HashMap::new()),
        codex_status: Mutex::new(CodexStatusTracker::default()),
        started_at: Instant::now(),
        queue,
        config,
    }))
}

/// Build the axum router: the rate-limited `/codex/job` and
/// `/context/export` endpoints sit on their own sub-router, merged with
/// everything else, both wrapped in the shared request-id/logging/CORS stack.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = CorsConfig {
        allowed_origins: vec!["http://127.0.0.1".to_string(), "http://localhost".to_string()],
        allowed_methods: vec!["GET".to_string(), "POST".to_string()],
        allowed_headers: vec!["content-type".to_string()],
    }
    .to_cors_layer();

    let limiter = RateLimiter::new(30, Duration::from_secs(60));
    let limited = Router::new()
        .route("/codex/job", post(codex_job))
        .route("/context/export", post(context_export))
        .layer(limiter.into_layer());

    let rest = Router::new()
        .route("/register", post(register))
        .route("/release", post(release))
        .route("/heartbeat", post(heartbeat))
        .route("/sync", get(sync))
        .route("/wait", post(wait))
        .route("/receipt", post(receipt))
        .route("/enqueue", post(enqueue))
        .route("/status", get(status))
        .route("/scope/current", get(scope_current))
        .route("/diagnostics", get(diagnostics))
        .route("/debug/state", get(debug_state))
        .route("/context/request", post(context_request))
        .route("/context/latest", get(context_latest))
        .route("/context/summary", get(context_summary))
        .route("/context/semantic", get(context_semantic))
        .route("/context/script", get(context_script))
        .route("/context/missing", get(context_missing))
        .route("/context/memory", get(context_memory_get).post(context_memory_post))
        .route("/context/reset", post(context_reset))
        .route("/context/events", get(context_events))
        .route("/codex/response", post(codex_response))
        .route("/codex/compile", post(codex_compile))
        .route("/codex/status", get(codex_status))
        .route("/audit/ledger", get(audit_ledger))
        .route("/health", get(health));

    Router::new()
        .merge(limited)
        .merge(rest)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(request_id_middleware))
                .layer(axum::middleware::from_fn(RequestLogger::layer))
                .layer(cors),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Lease handlers
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let scope = Scope::new(req.place_id, req.session_id.clone());
    let outcome = state
        .lease
        .register(scope.clone(), req.client_id.clone(), req.takeover)
        .await?;
    if outcome.reset {
        state.queue.clear_scope(&scope).await;
    }
    let _ = state
        .audit
        .record("lease.register", Some(scope.to_string()), format!("client={}", req.client_id))
        .await;
    Ok(Json(RegisterResponse {
        lease_token: outcome.lease.lease_token,
        fence: outcome.lease.fence,
        server_seq: outcome.server_seq,
        reset: outcome.reset,
    }))
}

async fn release(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<Ok>, ApiError> {
    let scope = Scope::new(req.scope.place_id, req.scope.session_id.clone());
    state.lease.release(&scope, &req.lease_token, req.fence).await?;
    state.queue.clear_scope(&scope).await;
    let _ = state.audit.record("lease.release", Some(scope.to_string()), "released").await;
    Ok(Json(Ok::yes()))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let scope = Scope::new(req.lease.scope.place_id, req.lease.scope.session_id.clone());
    let server_seq = state
        .lease
        .heartbeat(&scope, &req.lease.lease_token, req.lease.fence)
        .await?;
    Ok(Json(HeartbeatResponse { ok: true, server_seq }))
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseQuery {
    place_id: i64,
    session_id: String,
    lease_token: String,
    fence: u64,
}

async fn sync(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaseQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    let scope = Scope::new(q.place_id, q.session_id);
    state.lease.check(&scope, &q.lease_token, q.fence).await?;
    Ok(Json(SyncResponse {
        ok: true,
        contract_version: CONTRACT_VERSION.to_string(),
        fence: q.fence,
    }))
}

// ---------------------------------------------------------------------------
// Queue handlers
// ---------------------------------------------------------------------------

async fn wait(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WaitRequest>,
) -> Result<Json<WaitResponse>, ApiError> {
    let scope = Scope::new(req.lease.scope.place_id, req.lease.scope.session_id.clone());
    state
        .lease
        .check(&scope, &req.lease.lease_token, req.lease.fence)
        .await?;
    state.queue.sweep_expired_claims().await;
    let timeout = Duration::from_secs(req.timeout_sec.unwrap_or(state.config.default_wait_timeout_sec));
    match state.queue.wait(&scope, req.since, timeout).await {
        Some((claim, tx)) => Ok(Json(WaitResponse {
            empty: false,
            seq: Some(claim.seq),
            fence: Some(req.lease.fence),
            claim_token: Some(claim.claim_token),
            tx: Some(tx),
        })),
        None => Ok(Json(WaitResponse { empty: true, ..Default::default() })),
    }
}

async fn receipt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReceiptRequest>,
) -> Result<Json<ReceiptResponse>, ApiError> {
    let scope = Scope::new(req.lease.scope.place_id, req.lease.scope.session_id.clone());
    state
        .lease
        .check(&scope, &req.lease.lease_token, req.lease.fence)
        .await?;
    let outcome = state
        .queue
        .receipt(
            &scope,
            &req.claim_token,
            &req.transaction_id,
            req.applied.clone(),
            req.errors.clone(),
            req.notes.clone(),
        )
        .await?;
    let _ = state
        .audit
        .record(
            "queue.receipt",
            Some(scope.to_string()),
            format!("tx={} applied={} errors={}", req.transaction_id, req.applied.len(), req.errors.len()),
        )
        .await;

    if !req.errors.is_empty() {
        let receipt = bp_core::Receipt {
            transaction_id: req.transaction_id.clone(),
            claim_token: req.claim_token.clone(),
            applied: req.applied.clone(),
            errors: req.errors.clone(),
            notes: req.notes.clone(),
            meta: None,
        };
        let key = ContextKey::new(scope.clone(), "default".to_string());
        if let Ok(snapshot) = state.context.latest(&key).await {
            let missing = state.context.missing(&key).await.unwrap_or_default();
            let memory = state.context.memory(&key).await.ok();
            let rollback_events = state.audit.tail_context_events(Some(20)).await.unwrap_or_default();
            let last_receipt = state.queue.status(&scope).await.last_receipt;
            let jc = JobContext {
                snapshot: &snapshot,
                semantic: None,
                last_receipt: last_receipt.as_ref(),
                missing: &missing,
                memory: memory.as_deref(),
                rollback_events: &rollback_events,
            };
            if let Some(repair_req) = state.bridge.maybe_schedule_repair(&receipt, jc).await {
                let jc2 = JobContext {
                    snapshot: &snapshot,
                    semantic: None,
                    last_receipt: last_receipt.as_ref(),
                    missing: &missing,
                    memory: memory.as_deref(),
                    rollback_events: &rollback_events,
                };
                if let Ok(job) = state.bridge.create_job(repair_req, jc2).await {
                    let _ = state
                        .audit
                        .record("codex.repair_scheduled", Some(scope.to_string()), job.job_id)
                        .await;
                }
            }
        }
    }

    Ok(Json(ReceiptResponse {
        ok: true,
        removed_seq: outcome.removed_seq,
        remaining: outcome.remaining,
        applied_count: outcome.applied_count,
        errors_count: outcome.errors_count,
        notes_count: outcome.notes_count,
    }))
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let scope = Scope::new(req.lease.scope.place_id, req.lease.scope.session_id.clone());
    state
        .lease
        .check(&scope, &req.lease.lease_token, req.lease.fence)
        .await?;
    if req.tx.protocol_version != CONTRACT_VERSION {
        return Err(ApiError::from(BackplaneError::ProtocolVersionMismatch {
            got: req.tx.protocol_version.clone(),
        }));
    }
    let seq = state.queue.enqueue(scope.clone(), req.tx).await?;
    let status = state.queue.status(&scope).await;
    let _ = state.audit.record("queue.enqueue", Some(scope.to_string()), format!("seq={seq}")).await;
    Ok(Json(EnqueueResponse { ok: true, seq, pending: status.pending }))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ScopeQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let scope = state
        .resolve_scope(q.place_id, q.session_id)
        .await
        .ok_or(BackplaneError::NoPrimary)?;
    let queue_status = state.queue.status(&scope).await;
    Ok(Json(StatusResponse {
        pending: queue_status.pending,
        claimed: queue_status.claimed,
        max_queue: queue_status.max_queue,
        last_receipt: queue_status.last_receipt,
        primary: state.lease.current(&scope).await.map(|l| l.scope.into()),
    }))
}

async fn scope_current(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ScopeOut>, ApiError> {
    let scope = state.lease.primary_scope().await.ok_or(BackplaneError::NoPrimary)?;
    Ok(Json(scope.into()))
}

async fn diagnostics(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ScopeQuery>,
) -> Json<DiagnosticsResponse> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await;
    let queue = match &scope {
        Some(scope) => {
            let s = state.queue.status(scope).await;
            StatusResponse {
                pending: s.pending,
                claimed: s.claimed,
                max_queue: s.max_queue,
                last_receipt: s.last_receipt,
                primary: Some(scope.clone().into()),
            }
        }
        None => StatusResponse {
            pending: 0,
            claimed: 0,
            max_queue: state.config.max_queue,
            last_receipt: None,
            primary: None,
        },
    };
    Json(DiagnosticsResponse {
        status: "ok".to_string(),
        contract_version: CONTRACT_VERSION.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        primary: scope.map(ScopeOut::from),
        queue,
    })
}

async fn debug_state(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ScopeQuery>,
) -> Json<DebugStateResponse> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await;
    let (lease_alive, queue, context_version) = match &scope {
        Some(scope) => {
            let lease_alive = state.lease.current(scope).await.is_some();
            let s = state.queue.status(scope).await;
            let queue = StatusResponse {
                pending: s.pending,
                claimed: s.claimed,
                max_queue: s.max_queue,
                last_receipt: s.last_receipt,
                primary: Some(scope.clone().into()),
            };
            let key = ContextKey::new(scope.clone(), "default".to_string());
            let context_version = state.context.latest(&key).await.ok().map(|s| s.context_version);
            (lease_alive, queue, context_version)
        }
        None => (
            false,
            StatusResponse {
                pending: 0,
                claimed: 0,
                max_queue: state.config.max_queue,
                last_receipt: None,
                primary: None,
            },
            None,
        ),
    };
    Json(DebugStateResponse {
        scope: scope.map(ScopeOut::from),
        lease_alive,
        queue,
        context_version,
    })
}

// ---------------------------------------------------------------------------
// Context handlers
// ---------------------------------------------------------------------------

async fn context_export(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContextExportRequest>,
) -> Result<Json<ContextExportResponse>, ApiError> {
    let body = serde_json::to_value(&req).map_err(|e| ApiError::malformed(vec![e.to_string()]))?;
    RequestValidator::validate_body_shape(&body).map_err(ApiError::malformed)?;

    let scope = Scope::new(req.place_id, req.session_id.clone());
    let key = ContextKey::new(scope.clone(), AppState::project_key(req.project_key.clone()));
    let outcome = state.context.export(key.clone(), req.meta, req.tree, req.scripts).await;

    let response = match outcome {
        bp_context::ExportOutcome::Unchanged => ContextExportResponse::Unchanged,
        bp_context::ExportOutcome::Throttled => ContextExportResponse::Throttled,
        bp_context::ExportOutcome::Accepted(snapshot) => {
            state.persist_context(&snapshot).await;
            let _ = state
                .audit
                .record_context_event(
                    "context.export",
                    snapshot.context_id.clone(),
                    Some(snapshot.context_version),
                    "accepted",
                )
                .await;
            ContextExportResponse::Accepted { snapshot: Box::new(snapshot) }
        }
    };
    Ok(Json(response))
}

async fn context_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContextRequestBody>,
) -> Json<Ok> {
    let scope = Scope::new(req.place_id, req.session_id.clone());
    let key = ContextKey::new(scope, AppState::project_key(req.project_key));
    state
        .context
        .request(
            key,
            ContextRequest {
                roots: req.roots,
                paths: req.paths,
                include_sources: req.include_sources,
                mode: req.mode,
            },
        )
        .await;
    Json(Ok::yes())
}

async fn context_latest(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectKeyQuery>,
) -> Result<Json<bp_core::ContextSnapshot>, ApiError> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await.ok_or(BackplaneError::NoContext)?;
    let key = ContextKey::new(scope, AppState::project_key(q.project_key));
    Ok(Json(state.context.latest(&key).await?))
}

async fn context_summary(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectKeyQuery>,
) -> Result<Json<ContextSummaryResponse>, ApiError> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await.ok_or(BackplaneError::NoContext)?;
    let key = ContextKey::new(scope, AppState::project_key(q.project_key));
    Ok(Json(state.context.summary(&key).await?.into()))
}

async fn context_semantic(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectKeyQuery>,
) -> Result<Json<SemanticResponse>, ApiError> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await.ok_or(BackplaneError::NoContext)?;
    let key = ContextKey::new(scope, AppState::project_key(q.project_key));
    let snapshot = state.context.latest(&key).await?;
    let index = state.semantic_for(&snapshot).await;
    Ok(Json(SemanticResponse { index }))
}

async fn context_script(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ScriptQuery>,
) -> Result<Json<bp_core::ScriptEntry>, ApiError> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await.ok_or(BackplaneError::NoContext)?;
    let key = ContextKey::new(scope, AppState::project_key(q.project_key));
    Ok(Json(state.context.script(&key, &q.path).await?))
}

async fn context_missing(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectKeyQuery>,
) -> Result<Json<MissingResponse>, ApiError> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await.ok_or(BackplaneError::NoContext)?;
    let key = ContextKey::new(scope, AppState::project_key(q.project_key));
    Ok(Json(MissingResponse { missing: state.context.missing(&key).await? }))
}

async fn context_memory_get(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectKeyQuery>,
) -> Result<Json<ContextMemoryResponse>, ApiError> {
    let scope = state.resolve_scope(q.place_id, q.session_id).await.ok_or(BackplaneError::NoMemory)?;
    let key = ContextKey::new(scope, AppState::project_key(q.project_key));
    Ok(Json(ContextMemoryResponse { memory: state.context.memory(&key).await? }))
}

async fn context_memory_post(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContextMemoryRequest>,
) -> Json<Ok> {
    let scope = Scope::new(req.place_id, req.session_id.clone());
    let key = ContextKey::new(scope, AppState::project_key(req.project_key));
    let context_id = key.context_id();
    state.context.set_memory(key, req.memory.clone()).await;
    state.persist_memory(&context_id, &req.memory).await;
    Json(Ok::yes())
}

async fn context_reset(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContextMemoryRequest>,
) -> Json<Ok> {
    let scope = Scope::new(req.place_id, req.session_id.clone());
    let key = ContextKey::new(scope, AppState::project_key(req.project_key));
    let context_id = key.context_id();
    state.context.reset(&key).await;
    let _ = state.sql.purge_context(context_id.clone()).await;
    let _ = bp_store::remove_if_present(&state.state_paths.context_snapshot(&context_id)).await;
    let _ = bp_store::remove_if_present(&state.state_paths.context_memory(&context_id)).await;
    Json(Ok::yes())
}

async fn context_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<ContextEventsResponse>, ApiError> {
    let records = state
        .audit
        .tail_context_events(q.limit)
        .await
        .map_err(|e| BackplaneError::Persistence { reason: e.to_string() })?;
    Ok(Json(ContextEventsResponse { records }))
}

// ---------------------------------------------------------------------------
// Codex bridge handlers
// ---------------------------------------------------------------------------

async fn codex_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CodexJobRequest>,
) -> Result<Json<CodexJobResponse>, ApiError> {
    let scope = Scope::new(req.place_id, req.session_id.clone());
    let project_key = AppState::project_key(req.project_key.clone());
    let key = ContextKey::new(scope.clone(), project_key.clone());
    let snapshot = state.context.latest(&key).await?;
    let semantic = state.semantic_for(&snapshot).await;
    let missing = state.context.missing(&key).await.unwrap_or_default();
    let memory = state.context.memory(&key).await.ok();
    let last_receipt = state.queue.status(&scope).await.last_receipt;
    let rollback_events = state.audit.tail_context_events(Some(20)).await.unwrap_or_default();

    let job_req = JobRequest {
        scope: scope.clone(),
        project_key,
        prompt: req.prompt,
        system: req.system,
        intent: req.intent,
        mode: req.mode(),
        policy_profile: state.config.policy_profile.clone(),
        capabilities: req.capabilities,
        repair_of: None,
    };
    let jc = JobContext {
        snapshot: &snapshot,
        semantic: Some(&semantic),
        last_receipt: last_receipt.as_ref(),
        missing: &missing,
        memory: memory.as_deref(),
        rollback_events: &rollback_events,
    };
    let job = state.bridge.create_job(job_req, jc).await?;
    let _ = state.audit.record("codex.job_created", Some(scope.to_string()), job.job_id.clone()).await;
    Ok(Json(job.into()))
}

async fn codex_response(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CodexResponseRequest>,
) -> Json<CodexResponseOutcome> {
    let path = state.bridge_response_path(&req.job_id);
    let payload = serde_json::json!({
        "transactionId": req.transaction_id,
        "actions": req.actions,
        "tx": req.tx,
        "plan": req.plan,
        "dsl": req.dsl,
        "summary": req.summary,
        "riskScore": req.risk_score,
        "errors": req.errors,
    });
    if let Err(e) = bp_store::atomic_write_json(&path, &payload).await {
        return Json(CodexResponseOutcome::Rejected { reasons: vec![e.to_string()] });
    }
    let deps = TickDeps {
        queue: &state.queue,
        policy: &state.policy,
        lease: &state.lease,
        context: &state.context,
        audit: &state.audit,
    };
    let outcome = state.bridge.tick(deps).await;
    {
        let mut tracker = state.codex_status.lock().await;
        update_codex_status(&mut tracker, &outcome);
    }
    if let Some((_, tx_id, seq)) = outcome.enqueued.iter().find(|(job_id, _, _)| job_id == &req.job_id) {
        return Json(CodexResponseOutcome::Enqueued { transaction_id: tx_id.clone(), seq: *seq });
    }
    if let Some((_, reasons)) = outcome.rejected.iter().find(|(job_id, _)| job_id == &req.job_id) {
        return Json(CodexResponseOutcome::Rejected { reasons: reasons.clone() });
    }
    Json(CodexResponseOutcome::Rejected {
        reasons: vec!["response not yet processed; retry /codex/status".to_string()],
    })
}

async fn codex_compile(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CodexCompileRequest>,
) -> Json<CodexCompileResponse> {
    let config = state.validator_config();
    match validate_actions(&req.actions, &config, &NoCachedContext) {
        Ok(actions) => Json(CodexCompileResponse::Valid { actions }),
        Err(reasons) => Json(CodexCompileResponse::Invalid { reasons }),
    }
}

async fn codex_status(State(state): State<Arc<AppState>>) -> Json<CodexStatusResponse> {
    let tracker = state.codex_status.lock().await.clone();
    Json(CodexStatusResponse {
        pending_jobs: 0,
        last_enqueued: tracker.last_enqueued,
        last_rejected: tracker.last_rejected,
    })
}

// ---------------------------------------------------------------------------
// Audit / health
// ---------------------------------------------------------------------------

async fn audit_ledger(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<AuditLedgerResponse>, ApiError> {
    let records = state
        .audit
        .tail_audit(q.limit)
        .await
        .map_err(|e| BackplaneError::Persistence { reason: e.to_string() })?;
    Ok(Json(AuditLedgerResponse { records }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: CONTRACT_VERSION.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

// ---------------------------------------------------------------------------
// Background loops, driven by main.rs
// ---------------------------------------------------------------------------

/// One pass of the codex job bridge watcher: sweep stale jobs, validate and
/// enqueue pending worker responses. Called on a fixed ~1s cadence.
pub async fn run_codex_tick(state: &Arc<AppState>) {
    let deps = TickDeps {
        queue: &state.queue,
        policy: &state.policy,
        lease: &state.lease,
        context: &state.context,
        audit: &state.audit,
    };
    let outcome = state.bridge.tick(deps).await;
    if !outcome.enqueued.is_empty() || !outcome.rejected.is_empty() || !outcome.expired.is_empty() {
        tracing::info!(
            enqueued = outcome.enqueued.len(),
            rejected = outcome.rejected.len(),
            expired = outcome.expired.len(),
            "codex tick"
        );
    } else {
        tracing::debug!("codex tick: nothing to do");
    }
    {
        let mut tracker = state.codex_status.lock().await;
        update_codex_status(&mut tracker, &outcome);
    }
    state.persist_queue_state().await;
}

/// One pass of the context reconciler: re-read the on-disk/SQL queue state
/// mirror and adopt it if it is strictly ahead of the in-memory queue. Called
/// on the `RECONCILE_INTERVAL_SEC` cadence.
pub async fn run_reconcile_tick(state: &Arc<AppState>) {
    state.queue.sweep_expired_claims().await;
    if let Ok(Some((seq, items))) = state.sql.load_queue_state().await {
        let (current_seq, _) = state.queue.snapshot().await;
        if seq > current_seq {
            tracing::info!(seq, restored = items.len(), "reconciler adopting newer queue state from sql");
            state.queue.restore(seq, items).await;
        }
    }
    tracing::debug!("reconcile tick complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode as Status};
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BackplaneConfig::default();
        config.state_dir = dir.path().join("state").to_string_lossy().to_string();
        config.queue_dir = dir.path().join("queue").to_string_lossy().to_string();
        config.sqlite_path = dir.path().join("db.sqlite3").to_string_lossy().to_string();
        config.heartbeat_ttl_sec = 15;
        build_state(config).await.unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let state = test_state().await;
        let app = build_app(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), Status::OK);
    }

    #[tokio::test]
    async fn register_then_status_reports_primary() {
        let state = test_state().await;
        let app = build_app(state);
        let body = serde_json::json!({
            "clientId": "c1",
            "sessionId": "s1",
            "placeId": 10,
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), Status::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/status?placeId=10&sessionId=s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), Status::OK);
    }

    #[tokio::test]
    async fn status_without_scope_resolves_to_current_primary() {
        let state = test_state().await;
        state.lease.register(Scope::new(1, "s1".to_string()), "c1".to_string(), false).await.unwrap();
        let app = build_app(state);
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), Status::OK);
    }
}
