// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-codexbridge
#![deny(unsafe_code)]
//!
//! The filesystem-backed job queue mediating between an AI job producer and
//! the transaction queue: job creation with scenario classification and
//! context packs, a watcher pass that validates external worker responses
//! and enqueues them, and an auto-repair loop that re-submits failed
//! transactions as follow-up jobs.
//!
//! Control flow per job: the producer asks for a job, this crate writes
//! `jobs/job_<id>.json`; an external worker reads it and writes
//! `responses/<id>.json`; [`CodexBridge::tick`] validates that response and
//! either enqueues the resulting transaction (writing `acks/<id>`) or
//! rejects it (writing `errors/<id>`). A stale job with neither file after
//! `JOB_TTL` is expired the same way.

use bp_audit::AuditLog;
use bp_context::{ContextKey, ContextRequest, ContextStore};
use bp_core::error::BackplaneError;
use bp_core::{
    new_token, CodexJob, ContextDelta, ContextMeta, ContextSnapshot, JobMode, Receipt, RepairOf,
    Scenario, Scope, SemanticIndex, Transaction,
};
use bp_lease::LeaseManager;
use bp_policy::PolicyEngine;
use bp_queue::{LastReceipt, TransactionQueue};
use bp_validate::{validate_actions, FingerprintLookup, ValidatorConfig};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

fn persist_err(e: bp_store::StoreError) -> BackplaneError {
    BackplaneError::Persistence {
        reason: e.to_string(),
    }
}

/// The context-derived material a new job is built from, gathered by the
/// caller (the daemon crate) from whichever stores it already holds.
pub struct JobContext<'a> {
    /// Script/tree counts and export metadata for the active snapshot.
    pub snapshot: &'a ContextSnapshot,
    /// Derived semantic index for the active snapshot version, if built yet.
    pub semantic: Option<&'a SemanticIndex>,
    /// The scope's last recorded receipt, if any.
    pub last_receipt: Option<&'a LastReceipt>,
    /// Paths whose source is absent for a reason other than delta omission.
    pub missing: &'a [String],
    /// The scope's free-form memory string, if set.
    pub memory: Option<&'a str>,
    /// Context-event log rows for this `contextId`, newest last, pre-tailed
    /// by the caller; used to build the *rollback* scenario pack.
    pub rollback_events: &'a [bp_audit::ContextEventRecord],
}

/// Caller-supplied request fields for a new job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Scope this job is scoped to.
    pub scope: Scope,
    /// Project namespace within the scope.
    pub project_key: String,
    /// Prompt text from the AI producer.
    pub prompt: String,
    /// System prompt override, if any.
    pub system: Option<String>,
    /// High-level intent string, if any.
    pub intent: Option<String>,
    /// Auto-apply vs. manual re-entry.
    pub mode: JobMode,
    /// Active policy profile name at creation time.
    pub policy_profile: String,
    /// Capabilities advertised to the consumer.
    pub capabilities: Vec<String>,
    /// Set when this job is itself a repair attempt.
    pub repair_of: Option<RepairOf>,
}

/// Tunables this crate needs, mirroring the relevant slice of `BackplaneConfig`.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Orphan-job expiry, in seconds.
    pub job_ttl_sec: u64,
    /// Maximum scripts included in a job's focus pack.
    pub focus_max_scripts: usize,
    /// Maximum total bytes included in a job's focus pack.
    pub focus_max_bytes: u64,
    /// Risk score above which a bridge response is auto-rejected outside the `power` profile.
    pub max_risk: f64,
    /// Whether the auto-repair loop is enabled.
    pub auto_repair: bool,
    /// Maximum repair attempts per original job.
    pub repair_max_attempts: u32,
    /// Minimum seconds between repair attempts for the same job.
    pub repair_cooldown_sec: u64,
    /// Prefix every path-bearing action's path must begin with.
    pub host_root_prefix: String,
    /// Per-transaction action count cap.
    pub max_actions: usize,
}

struct RepairState {
    attempts: u32,
    last_attempt_at: DateTime<Utc>,
}

/// Outcome of one [`CodexBridge::tick`] pass.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Job ids expired for exceeding `JOB_TTL` with no ack/response.
    pub expired: Vec<String>,
    /// `(job_id, transaction_id, seq)` for responses successfully enqueued.
    pub enqueued: Vec<(String, String, u64)>,
    /// `(job_id, reasons)` for responses rejected.
    pub rejected: Vec<(String, Vec<String>)>,
}

/// Bundles the other stores a tick needs read/write access to. Borrowed, not
/// owned, so the daemon crate keeps holding the canonical `Arc`s.
pub struct TickDeps<'a> {
    /// The transaction queue responses are enqueued onto.
    pub queue: &'a TransactionQueue,
    /// Policy engine, for the risk/profile gate and action validation.
    pub policy: &'a PolicyEngine,
    /// Lease manager, to confirm the scope's primary still matches before enqueuing.
    pub lease: &'a LeaseManager,
    /// Context store, for fingerprint lookups and resync scheduling.
    pub context: &'a ContextStore,
    /// Audit log, for event recording.
    pub audit: &'a AuditLog,
}

struct PrefetchedFingerprints(HashMap<String, String>);

impl FingerprintLookup for PrefetchedFingerprints {
    fn fingerprint_for(&self, path: &str) -> Option<String> {
        self.0.get(path).cloned()
    }
}

/// The filesystem job queue: `jobs/`, `responses/`, `acks/`, `errors/`, `context/`.
pub struct CodexBridge {
    queue_root: PathBuf,
    jobs: Mutex<HashMap<String, CodexJob>>,
    tx_to_job: Mutex<HashMap<String, String>>,
    repair_state: Mutex<HashMap<String, RepairState>>,
    config: BridgeConfig,
}

impl CodexBridge {
    /// Point the bridge at `queue_root`; directories are created lazily on first write.
    pub fn new(queue_root: impl Into<PathBuf>, config: BridgeConfig) -> Self {
        Self {
            queue_root: queue_root.into(),
            jobs: Mutex::new(HashMap::new()),
            tx_to_job: Mutex::new(HashMap::new()),
            repair_state: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn jobs_dir(&self) -> PathBuf {
        self.queue_root.join("jobs")
    }
    fn responses_dir(&self) -> PathBuf {
        self.queue_root.join("responses")
    }
    fn acks_dir(&self) -> PathBuf {
        self.queue_root.join("acks")
    }
    fn errors_dir(&self) -> PathBuf {
        self.queue_root.join("errors")
    }
    fn worker_lock_path(&self) -> PathBuf {
        self.queue_root.join("worker.lock")
    }

    /// Write (or refresh) the single-instance worker lock, atomically.
    /// Staleness is judged by file age rather than OS-level process
    /// signaling, since this workspace carries no platform-specific
    /// process-liveness crate; a lock older than `stale_after_sec` is
    /// treated as abandoned and silently replaced.
    pub async fn acquire_worker_lock(&self, stale_after_sec: i64) -> Result<(), BackplaneError> {
        let path = self.worker_lock_path();
        if let Some(existing) = bp_store::read_json::<WorkerLock>(&path)
            .await
            .map_err(persist_err)?
        {
            let age = Utc::now() - existing.started_at;
            if age < chrono::Duration::seconds(stale_after_sec) && existing.pid != std::process::id() {
                return Err(BackplaneError::Persistence {
                    reason: format!("worker lock held by pid {}", existing.pid),
                });
            }
        }
        let lock = WorkerLock {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        bp_store::atomic_write_json(&path, &lock)
            .await
            .map_err(persist_err)
    }

    /// Classify a prompt into a scenario, per the fixed precedence order:
    /// rollback > refactor > review > continue, falling through to
    /// greenfield/general. Greenfield triggers solely on an empty context
    /// (`script_count == 0`), independent of keyword match.
    pub fn classify_scenario(prompt: &str, script_count: usize) -> Scenario {
        let mut text = prompt.to_ascii_lowercase();
        for ch in ['\n', '\r', '\t'] {
            text = text.replace(ch, " ");
        }
        let any = |words: &[&str]| words.iter().any(|w| text.contains(w));

        if !text.is_empty() {
            if any(&[
                "rollback",
                "revert",
                "restore",
                "old version",
                "previous version",
                "start over",
                "restart",
            ]) {
                return Scenario::Rollback;
            }
            if any(&["refactor", "rework", "rewrite", "overhaul", "architecture", "breaking change"]) {
                return Scenario::Refactor;
            }
            if any(&["review", "audit", "analyze", "assessment", "check", "feedback", "thoughts"]) {
                return Scenario::Review;
            }
            if any(&["continue", "finish", "next", "direction", "roadmap", "ideas"]) {
                return Scenario::Continue;
            }
        }
        if script_count == 0 {
            Scenario::Greenfield
        } else {
            Scenario::General
        }
    }

    /// Build a job from `req` and the context material in `jc`, write it
    /// atomically under `jobs/`, and index it in memory.
    pub async fn create_job(
        &self,
        req: JobRequest,
        jc: JobContext<'_>,
    ) -> Result<CodexJob, BackplaneError> {
        let context_id = jc.snapshot.context_id.clone();
        let context_version = jc.snapshot.context_version;
        let script_count = jc.snapshot.scripts.len();
        let scenario = Self::classify_scenario(&req.prompt, script_count);

        let focus = build_focus_pack(
            &jc.snapshot.scripts,
            jc.snapshot.delta.as_ref(),
            self.config.focus_max_scripts,
            self.config.focus_max_bytes,
        );
        let scenario_pack = build_scenario_pack(scenario, jc.semantic, jc.snapshot.delta.as_ref(), jc.rollback_events);

        let context_payload = serde_json::json!({
            "summary": {
                "scriptCount": script_count,
                "treeCount": jc.snapshot.tree.len(),
            },
            "meta": jc.snapshot.meta,
            "delta": jc.snapshot.delta,
            "missing": jc.missing,
            "lastReceipt": jc.last_receipt,
            "memory": jc.memory,
            "focus": focus,
            "semantic": jc.semantic.map(|s| &s.summary),
            "packs": { scenario_wire_name(scenario): scenario_pack },
        });

        let job = CodexJob {
            job_id: format!("job-{}", new_token()),
            created_at: Utc::now(),
            context_id,
            context_version,
            intent: req.intent,
            mode: req.mode,
            prompt: req.prompt,
            system: req.system,
            scope: req.scope,
            scenario,
            context: context_payload,
            policy: req.policy_profile,
            capabilities: req.capabilities,
            repair_of: req.repair_of,
        };

        let path = self.jobs_dir().join(format!("{}.json", job.job_id));
        bp_store::atomic_write_json(&path, &job)
            .await
            .map_err(persist_err)?;
        self.jobs
            .lock()
            .await
            .insert(job.job_id.clone(), job.clone());
        let _ = req.project_key;
        Ok(job)
    }

    /// One watcher-loop pass: sweep stale jobs, then validate and enqueue
    /// every unacknowledged response.
    pub async fn tick(&self, deps: TickDeps<'_>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        self.sweep_stale_jobs(&deps, &mut outcome).await;
        self.process_responses(&deps, &mut outcome).await;
        outcome
    }

    async fn sweep_stale_jobs(&self, deps: &TickDeps<'_>, outcome: &mut TickOutcome) {
        let mut entries = match tokio::fs::read_dir(self.jobs_dir()).await {
            Ok(e) => e,
            Err(_) => return,
        };
        let ttl = chrono::Duration::seconds(self.config.job_ttl_sec as i64);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(job): Option<CodexJob> = bp_store::read_json(&path).await.unwrap_or(None) else {
                continue;
            };
            if Utc::now() - job.created_at < ttl {
                continue;
            }
            let has_ack = tokio::fs::try_exists(self.acks_dir().join(format!("{}.json", job.job_id)))
                .await
                .unwrap_or(false);
            let has_response = tokio::fs::try_exists(
                self.responses_dir().join(format!("{}.json", job.job_id)),
            )
            .await
            .unwrap_or(false);
            if has_ack || has_response {
                continue;
            }
            let _ = bp_store::atomic_write_json(
                &self.errors_dir().join(format!("{}.json", job.job_id)),
                &serde_json::json!({ "error": "Codex job expired" }),
            )
            .await;
            let _ = bp_store::atomic_write_json(
                &self.acks_dir().join(format!("{}.json", job.job_id)),
                &serde_json::json!({ "error": "Codex job expired" }),
            )
            .await;
            let _ = bp_store::remove_if_present(&path).await;
            self.jobs.lock().await.remove(&job.job_id);
            let _ = deps
                .audit
                .record("codex.job_expired", Some(job.scope.to_string()), job.job_id.clone())
                .await;
            outcome.expired.push(job.job_id);
        }
    }

    async fn process_responses(&self, deps: &TickDeps<'_>, outcome: &mut TickOutcome) {
        let mut entries = match tokio::fs::read_dir(self.responses_dir()).await {
            Ok(e) => e,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(job_id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if tokio::fs::try_exists(self.acks_dir().join(format!("{job_id}.json")))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            match self.validate_and_enqueue_response(&job_id, &path, deps).await {
                Ok((transaction_id, seq)) => {
                    self.tx_to_job
                        .lock()
                        .await
                        .insert(transaction_id.clone(), job_id.clone());
                    let _ = bp_store::atomic_write_json(
                        &self.acks_dir().join(format!("{job_id}.json")),
                        &serde_json::json!({ "transactionId": transaction_id, "seq": seq }),
                    )
                    .await;
                    let _ = bp_store::remove_if_present(&path).await;
                    self.jobs.lock().await.remove(&job_id);
                    outcome.enqueued.push((job_id, transaction_id, seq));
                }
                Err(reasons) => {
                    let _ = bp_store::atomic_write_json(
                        &self.errors_dir().join(format!("{job_id}.json")),
                        &serde_json::json!({ "errors": reasons }),
                    )
                    .await;
                    let _ = deps
                        .audit
                        .record(
                            "codex.response_rejected",
                            None,
                            format!("job {job_id}: {reasons:?}"),
                        )
                        .await;
                    outcome.rejected.push((job_id, reasons));
                }
            }
        }
    }

    async fn validate_and_enqueue_response(
        &self,
        job_id: &str,
        response_path: &Path,
        deps: &TickDeps<'_>,
    ) -> Result<(String, u64), Vec<String>> {
        let job = self
            .jobs
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| vec!["job not found in memory index".to_string()])?;

        let response: serde_json::Value = bp_store::read_json(response_path)
            .await
            .map_err(|e| vec![e.to_string()])?
            .ok_or_else(|| vec!["response file vanished".to_string()])?;

        let transaction_id = response
            .get("transactionId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("tx-{}", new_token()));

        let raw_actions = response
            .get("actions")
            .or_else(|| response.get("tx").and_then(|v| v.get("actions")))
            .or_else(|| response.get("plan").and_then(|v| v.get("actions")))
            .or_else(|| response.get("dsl").and_then(|v| v.get("actions")))
            .and_then(|v| v.as_array())
            .ok_or_else(|| vec!["invalid actions list".to_string()])?;

        if let Some(risk) = response.get("riskScore").and_then(|v| v.as_f64()) {
            if risk > self.config.max_risk && deps.policy.profile() != bp_policy::PolicyProfile::Power {
                return Err(vec![format!("risk score {risk} exceeds the cap of {}", self.config.max_risk)]);
            }
        }

        let key = ContextKey::new(job.scope.clone(), job.context_id.split(':').last().unwrap_or("default"));
        let mut fingerprints = HashMap::new();
        for raw in raw_actions {
            if let Some(path) = raw.get("path").or_else(|| raw.get("target")).and_then(|v| v.as_str()) {
                if let Some(fp) = deps.context.fingerprint_for(&key, path).await {
                    fingerprints.insert(path.to_string(), fp);
                }
            }
        }
        let lookup = PrefetchedFingerprints(fingerprints);

        let validator_config = ValidatorConfig {
            policy: deps.policy,
            max_actions: self.config.max_actions,
            host_root_prefix: &self.config.host_root_prefix,
        };
        let actions = match validate_actions(raw_actions, &validator_config, &lookup) {
            Ok(actions) => actions,
            Err(reasons) => {
                if reasons.iter().any(|r| r.contains("expectedHash")) {
                    deps.context
                        .request(key, ContextRequest { include_sources: true, ..Default::default() })
                        .await;
                }
                return Err(reasons);
            }
        };

        if deps.lease.current(&job.scope).await.is_none() {
            return Err(vec!["no primary registered for this scope".to_string()]);
        }

        let tx = Transaction {
            protocol_version: bp_core::CONTRACT_VERSION.to_string(),
            transaction_id: transaction_id.clone(),
            actions,
        };
        let seq = deps
            .queue
            .enqueue(job.scope.clone(), tx)
            .await
            .map_err(|e| vec![e.to_string()])?;
        let _ = deps
            .audit
            .record("codex.enqueued", Some(job.scope.to_string()), transaction_id.clone())
            .await;
        Ok((transaction_id, seq))
    }

    /// Called after a receipt with non-empty `errors` is recorded for a
    /// bridge-originated transaction. Synthesizes a follow-up repair job if
    /// auto-repair is enabled, attempts remain, and the cooldown elapsed.
    pub async fn maybe_schedule_repair(
        &self,
        receipt: &Receipt,
        jc: JobContext<'_>,
    ) -> Option<JobRequest> {
        if !self.config.auto_repair || receipt.errors.is_empty() {
            return None;
        }
        let job_id = self
            .tx_to_job
            .lock()
            .await
            .get(&receipt.transaction_id)
            .cloned()?;
        let job = self.jobs.lock().await.get(&job_id).cloned();
        let job = job?;

        let mut repair_state = self.repair_state.lock().await;
        let state = repair_state.entry(job_id.clone()).or_insert(RepairState {
            attempts: 0,
            last_attempt_at: DateTime::<Utc>::MIN_UTC,
        });
        if state.attempts >= self.config.repair_max_attempts {
            return None;
        }
        let cooldown = chrono::Duration::seconds(self.config.repair_cooldown_sec as i64);
        if Utc::now() - state.last_attempt_at < cooldown {
            return None;
        }
        state.attempts += 1;
        state.last_attempt_at = Utc::now();
        let attempt = state.attempts;
        drop(repair_state);

        let _ = jc;
        Some(JobRequest {
            scope: job.scope.clone(),
            project_key: "default".to_string(),
            prompt: format!(
                "Repair transaction {} — previous attempt reported: {}",
                receipt.transaction_id,
                receipt.errors.join("; ")
            ),
            system: job.system.clone(),
            intent: job.intent.clone(),
            mode: job.mode,
            policy_profile: job.policy.clone(),
            capabilities: job.capabilities.clone(),
            repair_of: Some(RepairOf {
                job_id,
                transaction_id: receipt.transaction_id.clone(),
                errors: receipt.errors.clone(),
                attempt,
            }),
        })
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WorkerLock {
    pid: u32,
    started_at: DateTime<Utc>,
}

fn scenario_wire_name(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::Rollback => "rollback",
        Scenario::Refactor => "refactor",
        Scenario::Review => "review",
        Scenario::Continue => "continue",
        Scenario::Greenfield => "blueprint",
        Scenario::General => "analysis",
    }
}

fn build_focus_pack(
    scripts: &[bp_core::ScriptEntry],
    delta: Option<&ContextDelta>,
    max_scripts: usize,
    max_bytes: u64,
) -> serde_json::Value {
    let changed: std::collections::HashSet<&str> = delta
        .map(|d| {
            d.scripts_added
                .iter()
                .chain(d.scripts_changed.iter())
                .map(String::as_str)
                .collect()
        })
        .unwrap_or_default();

    let mut candidates: Vec<&bp_core::ScriptEntry> = if changed.is_empty() {
        scripts.iter().collect()
    } else {
        scripts.iter().filter(|s| changed.contains(s.path.as_str())).collect()
    };
    candidates.truncate(max_scripts);

    let mut total = 0u64;
    let mut out = Vec::new();
    for script in candidates {
        let Some(source) = &script.source else { continue };
        let remaining = max_bytes.saturating_sub(total);
        if remaining == 0 {
            break;
        }
        let preview: String = source.chars().take(remaining as usize).collect();
        total += preview.len() as u64;
        out.push(serde_json::json!({
            "path": script.path,
            "className": script.class_name,
            "preview": preview,
        }));
    }
    serde_json::Value::Array(out)
}

fn build_scenario_pack(
    scenario: Scenario,
    semantic: Option<&SemanticIndex>,
    delta: Option<&ContextDelta>,
    rollback_events: &[bp_audit::ContextEventRecord],
) -> serde_json::Value {
    match scenario {
        Scenario::Rollback => serde_json::json!({
            "recentSnapshots": rollback_events,
        }),
        Scenario::Greenfield => serde_json::json!({
            "checklist": [
                "Create a ServerScriptService entry point",
                "Add a ReplicatedStorage shared module folder",
                "Wire up a basic client UI screen",
            ],
        }),
        Scenario::Refactor => serde_json::json!({
            "guidance": [
                "Prefer extracting repeated logic into ReplicatedStorage modules",
                "Keep server-authoritative state out of LocalScripts",
                "Avoid renaming public API surfaces referenced elsewhere",
            ],
        }),
        Scenario::Review | Scenario::General | Scenario::Continue => serde_json::json!({
            "scriptIndex": semantic.map(|s| s.entries.keys().collect::<Vec<_>>()),
            "dependencyIndex": semantic.map(|s| {
                s.entries
                    .iter()
                    .map(|(path, entry)| (path.clone(), entry.requires.clone()))
                    .collect::<HashMap<_, _>>()
            }),
            "hotspots": semantic.map(|s| {
                let mut by_symbols: Vec<(&String, usize)> =
                    s.entries.iter().map(|(p, e)| (p, e.symbols.len())).collect();
                by_symbols.sort_by(|a, b| b.1.cmp(&a.1));
                by_symbols.into_iter().take(10).collect::<Vec<_>>()
            }),
            "delta": delta,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_core::{ContextMeta, ScriptEntry};

    fn config() -> BridgeConfig {
        BridgeConfig {
            job_ttl_sec: 600,
            focus_max_scripts: 12,
            focus_max_bytes: 60_000,
            max_risk: 0.7,
            auto_repair: true,
            repair_max_attempts: 3,
            repair_cooldown_sec: 30,
            host_root_prefix: "game/".to_string(),
            max_actions: 400,
        }
    }

    fn snapshot(scripts: Vec<ScriptEntry>) -> ContextSnapshot {
        ContextSnapshot {
            context_version: 1,
            context_id: "ctx:1:default".to_string(),
            meta: ContextMeta::default(),
            tree: vec![],
            scripts,
            server_received_at: Utc::now(),
            delta: None,
        }
    }

    fn script(path: &str, source: &str) -> ScriptEntry {
        ScriptEntry {
            path: path.to_string(),
            class_name: "Script".to_string(),
            sha1: None,
            bytes: None,
            source: Some(source.to_string()),
            source_truncated: None,
            source_omitted_reason: None,
        }
    }

    #[test]
    fn classifies_rollback_before_other_keywords() {
        assert_eq!(
            CodexBridge::classify_scenario("please rollback and review", 5),
            Scenario::Rollback
        );
    }

    #[test]
    fn classifies_greenfield_on_empty_script_count_regardless_of_keywords() {
        assert_eq!(CodexBridge::classify_scenario("add a shop", 0), Scenario::Greenfield);
    }

    #[test]
    fn classifies_general_as_fallback() {
        assert_eq!(CodexBridge::classify_scenario("add a coin counter", 5), Scenario::General);
    }

    #[tokio::test]
    async fn create_job_writes_file_and_indexes_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = CodexBridge::new(dir.path(), config());
        let snap = snapshot(vec![script("game/A", "print(1)")]);
        let req = JobRequest {
            scope: Scope::new(1, "s1"),
            project_key: "default".to_string(),
            prompt: "add a coin counter".to_string(),
            system: None,
            intent: None,
            mode: JobMode::Auto,
            policy_profile: "standard".to_string(),
            capabilities: vec![],
            repair_of: None,
        };
        let jc = JobContext {
            snapshot: &snap,
            semantic: None,
            last_receipt: None,
            missing: &[],
            memory: None,
            rollback_events: &[],
        };
        let job = bridge.create_job(req, jc).await.unwrap();
        assert!(dir.path().join("jobs").join(format!("{}.json", job.job_id)).exists());
        assert_eq!(bridge.jobs.lock().await.len(), 1);
    }

    #[test]
    fn focus_pack_prefers_changed_scripts_and_respects_byte_cap() {
        let scripts = vec![script("game/A", "x".repeat(100).as_str()), script("game/B", "y".repeat(100).as_str())];
        let delta = ContextDelta {
            scripts_changed: vec!["game/B".to_string()],
            ..Default::default()
        };
        let pack = build_focus_pack(&scripts, Some(&delta), 12, 20);
        let arr = pack.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["path"], "game/B");
        assert_eq!(arr[0]["preview"].as_str().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn worker_lock_rejects_concurrent_different_pid_while_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = CodexBridge::new(dir.path(), config());
        bridge.acquire_worker_lock(60).await.unwrap();
        let lock: WorkerLock = bp_store::read_json(&bridge.worker_lock_path()).await.unwrap().unwrap();
        assert_eq!(lock.pid, std::process::id());
        bridge.acquire_worker_lock(60).await.unwrap();
    }
}
