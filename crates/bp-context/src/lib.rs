// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-context
#![deny(unsafe_code)]
//!
//! Versioned per-`(scope, projectKey)` context snapshots: ingest with
//! fingerprint-based change detection and rate limiting, diff-mode source
//! carry-over, delta computation against the previous version, and script
//! lookups with the omission taxonomy (`SourceOmitted`/`Truncated`/`Missing`).
//!
//! Persistence is this crate's caller's job — `bp-store` mirrors whatever
//! [`ContextStore`] holds in memory, which remains the single source of truth
//! for a live process.

use bp_core::error::BackplaneError;
use bp_core::{ContextDelta, ContextMeta, ContextSnapshot, Scope, ScriptEntry, SnapshotMode, TreeNode};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

/// `(scope, projectKey)` — the namespace a context snapshot lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    /// Owning scope.
    pub scope: Scope,
    /// Project namespace within the scope; `"default"` when unspecified.
    pub project_key: String,
}

impl ContextKey {
    /// Build a key, defaulting an empty project key to `"default"`.
    pub fn new(scope: Scope, project_key: impl Into<String>) -> Self {
        let project_key = project_key.into();
        Self {
            scope,
            project_key: if project_key.is_empty() {
                "default".to_string()
            } else {
                project_key
            },
        }
    }

    /// The stable `contextId` derived from this key.
    pub fn context_id(&self) -> String {
        format!("ctx:{}:{}", self.scope, self.project_key)
    }
}

/// A pending export request recorded by `/context/request`, observed by the
/// host's next status poll.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ContextRequest {
    /// Root path prefixes to export.
    #[serde(default)]
    pub roots: Vec<String>,
    /// Specific paths to export.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Whether to include full script sources.
    #[serde(default)]
    pub include_sources: bool,
    /// Requested export mode.
    #[serde(default)]
    pub mode: Option<SnapshotMode>,
}

/// Outcome of a [`ContextStore::export`] call.
#[derive(Debug, Clone)]
pub enum ExportOutcome {
    /// `meta.fingerprint` matched the stored one; nothing changed.
    Unchanged,
    /// Rejected because the last export was within the configured interval.
    Throttled,
    /// A new version was stored.
    Accepted(ContextSnapshot),
}

/// Summary view returned by `/context/summary`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContextSummary {
    /// Current version.
    pub context_version: u64,
    /// Stable context id.
    pub context_id: String,
    /// Exporter metadata.
    pub meta: ContextMeta,
    /// Number of scripts in the latest snapshot.
    pub script_count: usize,
    /// Number of tree nodes in the latest snapshot.
    pub tree_count: usize,
    /// When the latest snapshot was received.
    pub last_export_at: DateTime<Utc>,
    /// Current memory string, if set.
    pub memory: Option<String>,
}

struct KeyState {
    snapshot: Option<ContextSnapshot>,
    memory: Option<String>,
    pending_request: Option<ContextRequest>,
    last_export_at: Option<DateTime<Utc>>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            snapshot: None,
            memory: None,
            pending_request: None,
            last_export_at: None,
        }
    }
}

/// Holds every `(scope, projectKey)`'s live context state.
pub struct ContextStore {
    keys: Mutex<HashMap<ContextKey, KeyState>>,
    min_export_interval: chrono::Duration,
    delta_max_items: usize,
}

impl ContextStore {
    /// Build a context store with the configured export rate limit and delta truncation.
    pub fn new(min_export_interval_sec: u64, delta_max_items: usize) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            min_export_interval: chrono::Duration::seconds(min_export_interval_sec as i64),
            delta_max_items,
        }
    }

    /// Ingest an export, bumping the version only when the fingerprint changed.
    pub async fn export(
        &self,
        key: ContextKey,
        meta: ContextMeta,
        tree: Vec<TreeNode>,
        mut scripts: Vec<ScriptEntry>,
    ) -> ExportOutcome {
        let now = Utc::now();
        let mut keys = self.keys.lock().await;
        let state = keys.entry(key.clone()).or_insert_with(KeyState::new);

        if let Some(existing) = &state.snapshot {
            if meta.fingerprint.is_some() && meta.fingerprint == existing.meta.fingerprint {
                return ExportOutcome::Unchanged;
            }
            if let Some(last) = state.last_export_at {
                if now - last < self.min_export_interval {
                    return ExportOutcome::Throttled;
                }
            }
        }

        let prior = state.snapshot.clone();

        if meta.mode == Some(SnapshotMode::Diff) {
            if let Some(prior) = &prior {
                carry_over_sources(&mut scripts, &prior.scripts);
            }
        }

        let context_version = prior.as_ref().map(|s| s.context_version + 1).unwrap_or(1);
        let delta = compute_delta(prior.as_ref(), &tree, &scripts, self.delta_max_items);

        let snapshot = ContextSnapshot {
            context_version,
            context_id: key.context_id(),
            meta,
            tree,
            scripts,
            server_received_at: now,
            delta: Some(delta),
        };

        state.snapshot = Some(snapshot.clone());
        state.last_export_at = Some(now);
        state.pending_request = None;

        tracing::info!(
            context_id = %snapshot.context_id,
            context_version,
            "context_event"
        );

        ExportOutcome::Accepted(snapshot)
    }

    /// Record a pending export request; the host's next status poll observes it.
    pub async fn request(&self, key: ContextKey, request: ContextRequest) {
        let mut keys = self.keys.lock().await;
        keys.entry(key).or_insert_with(KeyState::new).pending_request = Some(request);
    }

    /// Peek the pending request for `key`, without clearing it.
    pub async fn pending_request(&self, key: &ContextKey) -> Option<ContextRequest> {
        self.keys.lock().await.get(key).and_then(|s| s.pending_request.clone())
    }

    /// The latest snapshot for `key`, if one has been exported.
    pub async fn latest(&self, key: &ContextKey) -> Result<ContextSnapshot, BackplaneError> {
        self.keys
            .lock()
            .await
            .get(key)
            .and_then(|s| s.snapshot.clone())
            .ok_or(BackplaneError::NoContext)
    }

    /// A summary view over the latest snapshot.
    pub async fn summary(&self, key: &ContextKey) -> Result<ContextSummary, BackplaneError> {
        let keys = self.keys.lock().await;
        let state = keys.get(key).ok_or(BackplaneError::NoContext)?;
        let snapshot = state.snapshot.as_ref().ok_or(BackplaneError::NoContext)?;
        Ok(ContextSummary {
            context_version: snapshot.context_version,
            context_id: snapshot.context_id.clone(),
            meta: snapshot.meta.clone(),
            script_count: snapshot.scripts.len(),
            tree_count: snapshot.tree.len(),
            last_export_at: state.last_export_at.unwrap_or(snapshot.server_received_at),
            memory: state.memory.clone(),
        })
    }

    /// Look up a single script, surfacing the omission taxonomy when source is unavailable.
    pub async fn script(&self, key: &ContextKey, path: &str) -> Result<ScriptEntry, BackplaneError> {
        let keys = self.keys.lock().await;
        let state = keys.get(key).ok_or(BackplaneError::NoContext)?;
        let snapshot = state.snapshot.as_ref().ok_or(BackplaneError::NoContext)?;
        let entry = snapshot
            .scripts
            .iter()
            .find(|s| s.path == path)
            .ok_or_else(|| BackplaneError::ScriptNotFound { path: path.to_string() })?;
        if entry.source.is_some() {
            return Ok(entry.clone());
        }
        match entry.source_omitted_reason {
            Some(bp_core::SourceOmittedReason::Diff) => Err(BackplaneError::SourceOmitted),
            Some(bp_core::SourceOmittedReason::Truncated) => Err(BackplaneError::SourceTruncated),
            _ => Err(BackplaneError::SourceMissing),
        }
    }

    /// Paths whose source is absent for a reason other than delta omission.
    pub async fn missing(&self, key: &ContextKey) -> Result<Vec<String>, BackplaneError> {
        let keys = self.keys.lock().await;
        let state = keys.get(key).ok_or(BackplaneError::NoContext)?;
        let snapshot = state.snapshot.as_ref().ok_or(BackplaneError::NoContext)?;
        Ok(snapshot
            .scripts
            .iter()
            .filter(|s| {
                s.source.is_none() && s.source_omitted_reason != Some(bp_core::SourceOmittedReason::Diff)
            })
            .map(|s| s.path.clone())
            .collect())
    }

    /// The cached fingerprint for a single script path, used by the action
    /// validator's `expectedHash` precondition.
    pub async fn fingerprint_for(&self, key: &ContextKey, path: &str) -> Option<String> {
        let keys = self.keys.lock().await;
        let snapshot = keys.get(key)?.snapshot.as_ref()?;
        snapshot
            .scripts
            .iter()
            .find(|s| s.path == path)
            .map(|s| s.fingerprint().0)
    }

    /// Replace the memory string for `key`.
    pub async fn set_memory(&self, key: ContextKey, memory: String) {
        const MEMORY_MAX_CHARS: usize = 1200;
        let truncated: String = memory.chars().take(MEMORY_MAX_CHARS).collect();
        self.keys
            .lock()
            .await
            .entry(key)
            .or_insert_with(KeyState::new)
            .memory = Some(truncated);
    }

    /// Read the memory string for `key`.
    pub async fn memory(&self, key: &ContextKey) -> Result<String, BackplaneError> {
        let keys = self.keys.lock().await;
        let memory = keys
            .get(key)
            .and_then(|s| s.memory.clone())
            .ok_or(BackplaneError::NoMemory)?;
        if memory.is_empty() {
            Err(BackplaneError::EmptyMemory)
        } else {
            Ok(memory)
        }
    }

    /// Replace the in-memory snapshot for `key` with `candidate` if its
    /// version is strictly newer than whatever is cached (or nothing is
    /// cached yet). Used by the reconciler to pick up snapshots written to
    /// disk/SQL by another process. Returns whether a replacement happened.
    pub async fn adopt_if_newer(&self, key: ContextKey, candidate: ContextSnapshot) -> bool {
        let mut keys = self.keys.lock().await;
        let state = keys.entry(key).or_insert_with(KeyState::new);
        let is_newer = match &state.snapshot {
            Some(existing) => candidate.context_version > existing.context_version,
            None => true,
        };
        if is_newer {
            state.last_export_at = Some(candidate.server_received_at);
            state.snapshot = Some(candidate);
        }
        is_newer
    }

    /// Replace the in-memory memory string for `key` unconditionally, used
    /// by the reconciler when the on-disk memory file's mtime is newer than
    /// the cached copy.
    pub async fn adopt_memory(&self, key: ContextKey, memory: String) {
        self.keys
            .lock()
            .await
            .entry(key)
            .or_insert_with(KeyState::new)
            .memory = Some(memory);
    }

    /// Drop all in-memory state for `key`. Callers are responsible for the
    /// matching on-disk/SQL cleanup via `bp-store`.
    pub async fn reset(&self, key: &ContextKey) {
        self.keys.lock().await.remove(key);
        tracing::info!(context_id = %key.context_id(), "context_reset");
    }
}

fn carry_over_sources(scripts: &mut [ScriptEntry], prior: &[ScriptEntry]) {
    for script in scripts.iter_mut() {
        if script.source.is_some() {
            continue;
        }
        let Some(prior_entry) = prior.iter().find(|p| p.path == script.path) else {
            continue;
        };
        let matches = match (&script.sha1, &prior_entry.sha1) {
            (Some(a), Some(b)) => a == b,
            _ => match (script.bytes, prior_entry.bytes) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        };
        if matches && prior_entry.source.is_some() {
            script.source = prior_entry.source.clone();
            script.source_truncated = Some(false);
            script.source_omitted_reason = None;
        }
    }
}

fn compute_delta(
    prior: Option<&ContextSnapshot>,
    tree: &[TreeNode],
    scripts: &[ScriptEntry],
    max_items: usize,
) -> ContextDelta {
    let empty_tree: Vec<TreeNode> = Vec::new();
    let empty_scripts: Vec<ScriptEntry> = Vec::new();
    let prior_tree = prior.map(|s| &s.tree).unwrap_or(&empty_tree);
    let prior_scripts = prior.map(|s| &s.scripts).unwrap_or(&empty_scripts);

    let prior_tree_paths: BTreeSet<&str> = prior_tree.iter().map(|n| n.path.as_str()).collect();
    let new_tree_paths: BTreeSet<&str> = tree.iter().map(|n| n.path.as_str()).collect();
    let tree_added: Vec<String> = new_tree_paths
        .difference(&prior_tree_paths)
        .map(|p| p.to_string())
        .collect();
    let tree_removed: Vec<String> = prior_tree_paths
        .difference(&new_tree_paths)
        .map(|p| p.to_string())
        .collect();

    let prior_fp: HashMap<&str, String> = prior_scripts
        .iter()
        .map(|s| (s.path.as_str(), s.fingerprint().0))
        .collect();
    let new_fp: HashMap<&str, String> = scripts
        .iter()
        .map(|s| (s.path.as_str(), s.fingerprint().0))
        .collect();
    let prior_paths: BTreeSet<&str> = prior_fp.keys().copied().collect();
    let new_paths: BTreeSet<&str> = new_fp.keys().copied().collect();

    let scripts_added: Vec<String> = new_paths
        .difference(&prior_paths)
        .map(|p| p.to_string())
        .collect();
    let scripts_removed: Vec<String> = prior_paths
        .difference(&new_paths)
        .map(|p| p.to_string())
        .collect();
    let scripts_changed: Vec<String> = new_paths
        .intersection(&prior_paths)
        .filter(|p| new_fp.get(*p) != prior_fp.get(*p))
        .map(|p| p.to_string())
        .collect();

    ContextDelta {
        tree_added_count: tree_added.len(),
        tree_removed_count: tree_removed.len(),
        tree_added: tree_added.into_iter().take(max_items).collect(),
        tree_removed: tree_removed.into_iter().take(max_items).collect(),
        scripts_added_count: scripts_added.len(),
        scripts_removed_count: scripts_removed.len(),
        scripts_changed_count: scripts_changed.len(),
        scripts_added: scripts_added.into_iter().take(max_items).collect(),
        scripts_removed: scripts_removed.into_iter().take(max_items).collect(),
        scripts_changed: scripts_changed.into_iter().take(max_items).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ContextKey {
        ContextKey::new(Scope::new(1, "s1"), "")
    }

    fn script(path: &str, sha1: &str, source: Option<&str>) -> ScriptEntry {
        ScriptEntry {
            path: path.to_string(),
            class_name: "Script".to_string(),
            sha1: Some(sha1.to_string()),
            bytes: None,
            source: source.map(str::to_string),
            source_truncated: None,
            source_omitted_reason: None,
        }
    }

    #[tokio::test]
    fn defaults_empty_project_key_to_default() {
        let key = ContextKey::new(Scope::new(1, "s1"), "");
        assert_eq!(key.project_key, "default");
    }

    #[tokio::test]
    async fn first_export_bumps_version_to_one() {
        let store = ContextStore::new(0, 50);
        let outcome = store
            .export(key(), ContextMeta::default(), vec![], vec![script("game/S", "H1", Some("a"))])
            .await;
        match outcome {
            ExportOutcome::Accepted(snap) => assert_eq!(snap.context_version, 1),
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_fingerprint_does_not_bump_version() {
        let store = ContextStore::new(0, 50);
        let meta = ContextMeta {
            fingerprint: Some("F1".to_string()),
            ..Default::default()
        };
        store
            .export(key(), meta.clone(), vec![], vec![script("game/S", "H1", Some("a"))])
            .await;
        let outcome = store.export(key(), meta, vec![], vec![]).await;
        assert!(matches!(outcome, ExportOutcome::Unchanged));
    }

    #[tokio::test]
    async fn throttled_export_within_interval() {
        let store = ContextStore::new(3600, 50);
        store
            .export(key(), ContextMeta::default(), vec![], vec![])
            .await;
        let outcome = store.export(key(), ContextMeta::default(), vec![], vec![]).await;
        assert!(matches!(outcome, ExportOutcome::Throttled));
    }

    #[tokio::test]
    async fn delta_tracks_added_and_changed_scripts() {
        let store = ContextStore::new(0, 50);
        store
            .export(key(), ContextMeta::default(), vec![], vec![script("game/S", "H1", Some("a"))])
            .await;
        let outcome = store
            .export(
                key(),
                ContextMeta::default(),
                vec![],
                vec![script("game/S", "H2", Some("b")), script("game/T", "H3", Some("c"))],
            )
            .await;
        let ExportOutcome::Accepted(snap) = outcome else {
            panic!("expected Accepted");
        };
        let delta = snap.delta.unwrap();
        assert_eq!(delta.scripts_added_count, 1);
        assert_eq!(delta.scripts_changed_count, 1);
        assert_eq!(delta.scripts_removed_count, 0);
    }

    #[tokio::test]
    async fn diff_mode_carries_over_matching_source() {
        let store = ContextStore::new(0, 50);
        store
            .export(key(), ContextMeta::default(), vec![], vec![script("game/S", "H1", Some("full source"))])
            .await;
        let mut without_source = script("game/S", "H1", None);
        without_source.source_omitted_reason = Some(bp_core::SourceOmittedReason::Diff);
        let diff_meta = ContextMeta {
            mode: Some(SnapshotMode::Diff),
            ..Default::default()
        };
        let outcome = store.export(key(), diff_meta, vec![], vec![without_source]).await;
        let ExportOutcome::Accepted(snap) = outcome else {
            panic!("expected Accepted");
        };
        assert_eq!(snap.scripts[0].source.as_deref(), Some("full source"));
        assert_eq!(snap.scripts[0].source_truncated, Some(false));
    }

    #[tokio::test]
    async fn script_lookup_surfaces_omission_reason() {
        let store = ContextStore::new(0, 50);
        let mut omitted = script("game/S", "H1", None);
        omitted.source_omitted_reason = Some(bp_core::SourceOmittedReason::Truncated);
        store.export(key(), ContextMeta::default(), vec![], vec![omitted]).await;
        let err = store.script(&key(), "game/S").await.unwrap_err();
        assert!(matches!(err, BackplaneError::SourceTruncated));
    }

    #[tokio::test]
    async fn memory_round_trips_and_rejects_when_unset() {
        let store = ContextStore::new(0, 50);
        let err = store.memory(&key()).await.unwrap_err();
        assert!(matches!(err, BackplaneError::NoMemory));
        store.set_memory(key(), "remember this".to_string()).await;
        assert_eq!(store.memory(&key()).await.unwrap(), "remember this");
    }

    #[tokio::test]
    async fn reset_clears_all_state() {
        let store = ContextStore::new(0, 50);
        store.export(key(), ContextMeta::default(), vec![], vec![]).await;
        store.reset(&key()).await;
        let err = store.latest(&key()).await.unwrap_err();
        assert!(matches!(err, BackplaneError::NoContext));
    }
}
