// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the authoring backplane: scopes, leases,
//! transactions, context snapshots, semantic indexes, codex jobs and
//! receipts. Every other crate in this workspace depends on this one.
//!
//! If you only take one dependency, take this one.

/// Comprehensive error catalog for the authoring backplane.
pub mod error;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha1::{Digest as Sha1Digest, Sha1};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Contract version advertised by `/health` and checked against `tx.protocolVersion`.
pub const CONTRACT_VERSION: &str = "backplane/v1";

/// `(placeId, sessionId)` tuple identifying one authoring session.
///
/// Most server-owned resources — the lease, the queue, context snapshots —
/// are keyed by scope. Two scopes with the same `place_id` but different
/// `session_id` are entirely independent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Scope {
    /// Numeric place identifier supplied by the host.
    pub place_id: i64,
    /// Session identifier supplied by the host; unique per authoring session.
    pub session_id: String,
}

impl Scope {
    /// Build a scope from its two parts.
    pub fn new(place_id: i64, session_id: impl Into<String>) -> Self {
        Self {
            place_id,
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.place_id, self.session_id)
    }
}

/// A lease held by the single admitted primary host for a scope.
///
/// At any instant at most one lease is "alive" for a given scope. The fence
/// strictly increases on every primary transition — new admit, takeover, or
/// expiry followed by re-admit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Lease {
    /// Opaque token returned to the primary; re-presented on every lease-bound call.
    pub lease_token: String,
    /// Monotonic fencing token for this lease generation.
    pub fence: u64,
    /// Caller-supplied client identifier.
    pub client_id: String,
    /// Scope this lease admits.
    pub scope: Scope,
    /// Timestamp of the most recent heartbeat.
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Lease {
    /// Whether this lease is still alive given `now` and a heartbeat TTL.
    pub fn is_alive(&self, now: DateTime<Utc>, heartbeat_ttl: chrono::Duration) -> bool {
        now - self.last_heartbeat_at <= heartbeat_ttl
    }
}

/// Canonical action types accepted by the transaction queue.
///
/// Incoming actions are expressed as duck-typed JSON objects with many
/// synonym `type` strings and field aliases (see `bp-validate`); by the
/// time an [`Action`] value exists, normalization has already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    /// Create a new instance under a parent.
    CreateInstance,
    /// Insert a catalog asset under a parent.
    InsertAsset,
    /// Set a single property on an instance.
    SetProperty,
    /// Set multiple properties on an instance.
    SetProperties,
    /// Clone an existing instance.
    CloneInstance,
    /// Remove all children of an instance.
    ClearChildren,
    /// Replace the tag list on an instance.
    SetTags,
    /// Delete an instance.
    DeleteInstance,
    /// Rename an instance in place.
    Rename,
    /// Move an instance to a new parent.
    Move,
    /// Set a single attribute on an instance.
    SetAttribute,
    /// Set multiple attributes on an instance.
    SetAttributes,
    /// Edit a script's source.
    EditScript,
    /// Create or update a tween.
    Tween,
    /// Emit a particle burst.
    EmitParticles,
    /// Play a sound.
    PlaySound,
    /// Create an animation.
    AnimationCreate,
    /// Add a keyframe to an animation.
    AnimationAddKeyframe,
    /// Preview an animation sequence.
    AnimationPreview,
    /// Stop a running animation preview.
    AnimationStop,
}

/// Mode for an `editScript` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum EditScriptMode {
    /// Replace the entire source.
    Replace,
    /// Append to the end of the source.
    Append,
    /// Prepend to the start of the source.
    Prepend,
    /// Replace a byte range of the source.
    ReplaceRange,
    /// Insert before a marker.
    InsertBefore,
    /// Insert after a marker.
    InsertAfter,
}

/// A single normalized action within a transaction.
///
/// Fields are a superset across all [`ActionType`] variants; which ones are
/// meaningful (and required) depends on `action_type`. This mirrors the
/// original duck-typed payload rather than splitting into twenty distinct
/// structs, matching the normalizer's job of canonicalizing shape, not
/// schema-per-variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Canonical action type.
    pub action_type: Option<ActionType>,
    /// Target instance path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Parent path, required for `createInstance`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    /// Class name, required for `createInstance`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Display name for newly created instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Script source for `editScript`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Source chunks for `editScript`, concatenated with `source`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
    /// Edit mode for `editScript`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<EditScriptMode>,
    /// Property/attribute bag for `setProperty(ies)`/`setAttribute(s)`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Expected fingerprint the caller believes `path` currently has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// Animation sequence path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_path: Option<String>,
    /// Inline animation sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<serde_json::Value>,
    /// Rig path for animation stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rig_path: Option<String>,
    /// Any extra fields the normalizer did not recognize, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A caller-supplied batch of actions to apply atomically on the host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Protocol version the caller is speaking; must match [`CONTRACT_VERSION`]'s major line.
    pub protocol_version: String,
    /// Caller-supplied identifier, unique per queue lifetime.
    pub transaction_id: String,
    /// Normalized actions to apply.
    pub actions: Vec<Action>,
}

/// An item sitting in the per-scope transaction queue.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueueItem {
    /// Global monotonic sequence number (not per-scope; see design notes on this choice).
    pub seq: u64,
    /// Scope this item belongs to.
    pub scope: Scope,
    /// The transaction payload.
    pub tx: Transaction,
    /// Current claim token, if claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
    /// Whether the item is currently claimed.
    pub claimed: bool,
}

/// A one-shot reservation on a queue item, issued by `/wait` and consumed by `/receipt`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Claim {
    /// Token identifying this claim.
    pub claim_token: String,
    /// When this claim expires and the item is returned to the pool.
    pub expires_at: DateTime<Utc>,
    /// Sequence number of the claimed item.
    pub seq: u64,
    /// Transaction id of the claimed item.
    pub transaction_id: String,
    /// Scope of the claimed item.
    pub scope: Scope,
}

/// Mode of a context snapshot export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// A complete tree + source description.
    Full,
    /// A partial description relying on carry-over from the prior snapshot.
    Diff,
}

/// One node in a context snapshot's instance tree.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TreeNode {
    /// Instance path.
    pub path: String,
    /// Instance class name.
    pub class_name: String,
    /// Child paths, if the exporter included them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
}

/// Reason a script's source is absent from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceOmittedReason {
    /// Omitted because this is a diff export and the source is unchanged.
    Diff,
    /// Omitted because the source exceeded a size cap.
    Truncated,
    /// Source genuinely does not exist (e.g. non-script instance) or was never captured.
    Missing,
}

/// One script entry within a context snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScriptEntry {
    /// Instance path of the script.
    pub path: String,
    /// Script class name (`Script`, `LocalScript`, `ModuleScript`, ...).
    pub class_name: String,
    /// SHA-1 hex digest of the source, if the exporter computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    /// Byte length of the source, if known without the source itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Full source text, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Whether `source` (when present) was truncated by the exporter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_truncated: Option<bool>,
    /// Why `source` is absent, when it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_omitted_reason: Option<SourceOmittedReason>,
}

impl ScriptEntry {
    /// Compute this script's fingerprint per the precedence in §4.4:
    /// prefer a stored `sha1`, else hash the source if present, else fall
    /// back to a byte-count tag, else `"unknown"`.
    ///
    /// Returns the fingerprint and whether it used the lossy byte-count
    /// fallback (callers should log a warning when `true`, per the Open
    /// Questions note on `bytes:<n>` collisions).
    pub fn fingerprint(&self) -> (String, bool) {
        if let Some(sha1) = &self.sha1 {
            return (sha1.clone(), false);
        }
        if let Some(source) = &self.source {
            return (format!("sha1:{}", sha1_hex(source.as_bytes())), false);
        }
        if let Some(bytes) = self.bytes {
            return (format!("bytes:{bytes}"), true);
        }
        ("unknown".to_string(), false)
    }
}

/// Hex-encode the SHA-1 digest of `bytes`.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Counts and truncated path lists describing the change between two snapshot versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContextDelta {
    /// Number of tree paths added.
    pub tree_added_count: usize,
    /// Number of tree paths removed.
    pub tree_removed_count: usize,
    /// Truncated list of added tree paths.
    pub tree_added: Vec<String>,
    /// Truncated list of removed tree paths.
    pub tree_removed: Vec<String>,
    /// Number of scripts added.
    pub scripts_added_count: usize,
    /// Number of scripts removed.
    pub scripts_removed_count: usize,
    /// Number of scripts whose fingerprint changed.
    pub scripts_changed_count: usize,
    /// Truncated list of added script paths.
    pub scripts_added: Vec<String>,
    /// Truncated list of removed script paths.
    pub scripts_removed: Vec<String>,
    /// Truncated list of changed script paths.
    pub scripts_changed: Vec<String>,
}

/// Metadata attached to a context snapshot by the exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContextMeta {
    /// Exporter-computed fingerprint for the whole snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Export mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SnapshotMode>,
    /// Game identifier as reported by the exporter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    /// Any additional exporter-supplied metadata, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A versioned snapshot of a host project for one `(scope, project_key)`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContextSnapshot {
    /// Monotonic version number, starts at 1.
    pub context_version: u64,
    /// Stable identifier derived from the scope and project key.
    pub context_id: String,
    /// Exporter-supplied metadata.
    pub meta: ContextMeta,
    /// Instance tree.
    pub tree: Vec<TreeNode>,
    /// Scripts.
    pub scripts: Vec<ScriptEntry>,
    /// When the server accepted this export.
    pub server_received_at: DateTime<Utc>,
    /// Delta against the previous version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ContextDelta>,
}

/// Per-script derived semantic information.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SemanticEntry {
    /// Script path this entry describes.
    pub path: String,
    /// Coarse tags (`server`, `client`, `datastore`, `commerce`, ...).
    pub tags: Vec<String>,
    /// Roblox services referenced via `GetService(...)`.
    pub services: Vec<String>,
    /// Module paths referenced via `require(...)`.
    pub requires: Vec<String>,
    /// Frequency-ranked identifier keywords.
    pub keywords: Vec<String>,
    /// Top-level function names, in source order.
    pub symbols: Vec<String>,
    /// Source line number for each entry in `symbols`.
    pub symbol_lines: Vec<u32>,
    /// Total line count of the analyzed source.
    pub line_count: u32,
    /// Fingerprint of the script this entry was derived from.
    pub fingerprint: String,
}

/// Aggregated counts across a semantic index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SemanticSummary {
    /// Number of scripts analyzed.
    pub script_count: usize,
    /// Occurrence counts per tag.
    pub tag_counts: BTreeMap<String, usize>,
    /// Occurrence counts per service.
    pub service_counts: BTreeMap<String, usize>,
    /// Total `require(...)` references across all scripts.
    pub total_requires: usize,
    /// Total top-level symbols across all scripts.
    pub total_symbols: usize,
}

/// The full semantic index for one `(context_id, context_version)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SemanticIndex {
    /// Per-script entries, keyed by path.
    pub entries: BTreeMap<String, SemanticEntry>,
    /// Aggregated summary.
    pub summary: SemanticSummary,
}

/// Mode a codex job was created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Apply the resulting transaction automatically once validated.
    Auto,
    /// Require an explicit `/codex/response` re-entry (or equivalent) before applying.
    Manual,
}

/// Scenario the prompt was classified into, used to select which packs accompany a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Prompt asks to undo or restore prior state.
    Rollback,
    /// Prompt asks to reorganize existing code without behavior change.
    Refactor,
    /// Prompt asks for a read-only review or audit.
    Review,
    /// Prompt continues a prior session.
    Continue,
    /// Empty or near-empty project; starting from scratch.
    Greenfield,
    /// No more specific scenario matched.
    General,
}

/// A job that originated as a repair attempt for a failed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RepairOf {
    /// Original job id being repaired.
    pub job_id: String,
    /// Transaction id that failed.
    pub transaction_id: String,
    /// Errors reported on the failed receipt.
    pub errors: Vec<String>,
    /// Which repair attempt this is, starting at 1.
    pub attempt: u32,
}

/// A codex job: an AI-producible change request living as a file under the job queue root.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CodexJob {
    /// Unique job identifier.
    pub job_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Context this job was built against.
    pub context_id: String,
    /// Context version this job was built against.
    pub context_version: u64,
    /// High-level intent string supplied by the producer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Auto-apply vs. manual re-entry.
    pub mode: JobMode,
    /// Prompt text.
    pub prompt: String,
    /// System prompt override, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Scope this job is scoped to.
    pub scope: Scope,
    /// Classified scenario.
    pub scenario: Scenario,
    /// Arbitrary context/packs payload attached for the consumer.
    pub context: serde_json::Value,
    /// Active policy profile name at creation time.
    pub policy: String,
    /// Capabilities advertised to the consumer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Set when this job is a repair attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_of: Option<RepairOf>,
}

/// The host's report of applying a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Receipt {
    /// Transaction id this receipt reports on.
    pub transaction_id: String,
    /// Claim token that was consumed.
    pub claim_token: String,
    /// Paths/ids successfully applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied: Vec<String>,
    /// Per-action error strings, empty on full success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Free-form notes from the host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// Additional metadata supplied by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// A pending interface for a completion backend, used only by the codex job
/// bridge's optional auto-apply path. Concrete network-calling adapters are
/// out of scope for this core; [`EchoBackend`] exists purely as a test double.
pub trait CompletionBackend: Send + Sync {
    /// Whether this backend is currently usable.
    fn is_available(&self) -> bool;
    /// Produce a single completion for `prompt`/`system`.
    fn complete(&self, prompt: &str, system: Option<&str>) -> Result<String, String>;
    /// Stream a completion as a finite, non-restartable sequence of chunks.
    fn stream(&self, prompt: &str, system: Option<&str>) -> Vec<String>;
    /// List model identifiers this backend can serve.
    fn list_models(&self) -> Vec<String>;
    /// Capability flags this backend supports.
    fn capabilities(&self) -> Vec<String>;
}

/// An in-memory [`CompletionBackend`] that echoes the prompt back, used in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoBackend;

impl CompletionBackend for EchoBackend {
    fn is_available(&self) -> bool {
        true
    }

    fn complete(&self, prompt: &str, _system: Option<&str>) -> Result<String, String> {
        Ok(prompt.to_string())
    }

    fn stream(&self, prompt: &str, _system: Option<&str>) -> Vec<String> {
        prompt.split_whitespace().map(str::to_string).collect()
    }

    fn list_models(&self) -> Vec<String> {
        vec!["echo-1".to_string()]
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }
}

/// Generate a fresh random token suitable for lease/claim tokens.
pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_display_matches_place_and_session() {
        let scope = Scope::new(10, "s1");
        assert_eq!(scope.to_string(), "10:s1");
    }

    #[test]
    fn fingerprint_prefers_sha1_field() {
        let entry = ScriptEntry {
            path: "game/S".into(),
            class_name: "Script".into(),
            sha1: Some("H".into()),
            bytes: None,
            source: Some("print(1)".into()),
            source_truncated: None,
            source_omitted_reason: None,
        };
        let (fp, lossy) = entry.fingerprint();
        assert_eq!(fp, "H");
        assert!(!lossy);
    }

    #[test]
    fn fingerprint_hashes_source_when_no_sha1() {
        let entry = ScriptEntry {
            path: "game/S".into(),
            class_name: "Script".into(),
            sha1: None,
            bytes: None,
            source: Some("print(1)".into()),
            source_truncated: None,
            source_omitted_reason: None,
        };
        let (fp, lossy) = entry.fingerprint();
        assert!(fp.starts_with("sha1:"));
        assert!(!lossy);
    }

    #[test]
    fn fingerprint_falls_back_to_byte_count_and_flags_lossy() {
        let entry = ScriptEntry {
            path: "game/S".into(),
            class_name: "Script".into(),
            sha1: None,
            bytes: Some(42),
            source: None,
            source_truncated: None,
            source_omitted_reason: None,
        };
        let (fp, lossy) = entry.fingerprint();
        assert_eq!(fp, "bytes:42");
        assert!(lossy);
    }

    #[test]
    fn fingerprint_is_unknown_with_no_information() {
        let entry = ScriptEntry {
            path: "game/S".into(),
            class_name: "Script".into(),
            sha1: None,
            bytes: None,
            source: None,
            source_truncated: None,
            source_omitted_reason: None,
        };
        let (fp, lossy) = entry.fingerprint();
        assert_eq!(fp, "unknown");
        assert!(!lossy);
    }

    #[test]
    fn transaction_round_trips_through_json() {
        let tx = Transaction {
            protocol_version: "backplane/v1".into(),
            transaction_id: "tx1".into(),
            actions: vec![Action {
                action_type: Some(ActionType::CreateInstance),
                parent_path: Some("game/Workspace".into()),
                class_name: Some("Folder".into()),
                name: Some("A".into()),
                ..Default::default()
            }],
        };
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transaction_id, "tx1");
        assert_eq!(back.actions.len(), 1);
    }

    #[test]
    fn echo_backend_streams_words() {
        let backend = EchoBackend;
        assert_eq!(backend.stream("a b c", None), vec!["a", "b", "c"]);
    }
}
