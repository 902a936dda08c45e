// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and environment overlay for the
//! authoring backplane.
//!
//! This crate provides [`BackplaneConfig`] — the top-level runtime settings
//! named in §6 of the design — together with helpers for loading from TOML
//! files and applying environment variable overrides, matching the
//! defaults/file/env layering convention used across this workspace.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use bp_json_guard::{validate_json_object, JsonGuardLimits};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the authoring backplane daemon.
///
/// Every field here corresponds to one tunable from the environment
/// variable table in §6 (plus the supplemental variables resolved from
/// `original_source/app.py`'s tuning-constant block). Defaults below match
/// the literal constants read from that source.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BackplaneConfig {
    /// Loopback bind address for the HTTP surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Root directory for the filesystem job queue (`jobs/`, `responses/`, `acks/`, `errors/`).
    #[serde(default = "default_queue_dir")]
    pub queue_dir: String,
    /// Root directory for atomic JSON persistence (snapshots, queue state, logs).
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Orphan-job expiry, in seconds.
    #[serde(default = "default_job_ttl_sec")]
    pub job_ttl_sec: u64,
    /// Per-transaction action count cap.
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
    /// Per-`editScript` byte cap.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,
    /// Tighter `editScript` byte cap enforced additionally under the `safe` policy profile.
    #[serde(default = "default_safe_edit_bytes")]
    pub safe_edit_bytes: u64,
    /// Queue length cap, per scope.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Active policy profile name (`safe | standard | power`).
    #[serde(default = "default_policy_profile")]
    pub policy_profile: String,
    /// Path-prefix globs that always reject, regardless of `allowed_roots`.
    #[serde(default)]
    pub protected_roots: Vec<String>,
    /// Path-prefix globs that form the allowlist; empty means "no constraint".
    #[serde(default = "default_allowed_roots")]
    pub allowed_roots: Vec<String>,

    /// Whether the auto-repair loop is enabled.
    #[serde(default)]
    pub auto_repair: bool,
    /// Maximum repair attempts per original transaction.
    #[serde(default = "default_repair_max_attempts")]
    pub repair_max_attempts: u32,
    /// Minimum seconds between repair attempts for the same transaction.
    #[serde(default = "default_repair_cooldown_sec")]
    pub repair_cooldown_sec: u64,

    /// Minimum seconds between accepted context exports per `(scope, projectKey)`.
    #[serde(default = "default_context_min_interval_sec")]
    pub context_min_interval_sec: u64,
    /// Maximum items kept in a truncated delta list.
    #[serde(default = "default_delta_max_items")]
    pub delta_max_items: usize,

    /// Reconciler cadence, in seconds.
    #[serde(default = "default_reconcile_interval_sec")]
    pub reconcile_interval_sec: u64,

    /// Source byte cap above which semantic analysis is skipped for a script.
    #[serde(default = "default_semantic_max_source_bytes")]
    pub semantic_max_source_bytes: u64,
    /// Maximum ranked keywords kept per script.
    #[serde(default = "default_semantic_max_keywords")]
    pub semantic_max_keywords: usize,
    /// Maximum symbols kept per script.
    #[serde(default = "default_semantic_max_symbols")]
    pub semantic_max_symbols: usize,

    /// Maximum scripts included in a job's focus pack.
    #[serde(default = "default_focus_max_scripts")]
    pub focus_max_scripts: usize,
    /// Maximum total bytes included in a job's focus pack.
    #[serde(default = "default_focus_max_bytes")]
    pub focus_max_bytes: u64,
    /// Risk score above which a bridge response is auto-rejected outside the `power` profile.
    #[serde(default = "default_max_risk")]
    pub max_risk: f64,
    /// Default page size for `/audit/ledger` and `/context/events`.
    #[serde(default = "default_audit_ledger_limit")]
    pub audit_ledger_limit: usize,

    /// Whether the embedded SQL persistence mirror is enabled.
    #[serde(default = "default_true")]
    pub sqlite_enabled: bool,
    /// Path to the embedded SQL database file.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Heartbeat TTL, in seconds: after this long without a heartbeat the lease is dead.
    #[serde(default = "default_heartbeat_ttl_sec")]
    pub heartbeat_ttl_sec: u64,
    /// Claim TTL, in seconds: how long a claimed item is reserved before re-offer.
    #[serde(default = "default_claim_ttl_sec")]
    pub claim_ttl_sec: u64,
    /// Default `/wait` timeout, in seconds, when the caller does not specify one.
    #[serde(default = "default_wait_timeout_sec")]
    pub default_wait_timeout_sec: u64,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            queue_dir: default_queue_dir(),
            state_dir: default_state_dir(),
            job_ttl_sec: default_job_ttl_sec(),
            max_actions: default_max_actions(),
            max_source_bytes: default_max_source_bytes(),
            safe_edit_bytes: default_safe_edit_bytes(),
            max_queue: default_max_queue(),
            policy_profile: default_policy_profile(),
            protected_roots: Vec::new(),
            allowed_roots: default_allowed_roots(),
            auto_repair: false,
            repair_max_attempts: default_repair_max_attempts(),
            repair_cooldown_sec: default_repair_cooldown_sec(),
            context_min_interval_sec: default_context_min_interval_sec(),
            delta_max_items: default_delta_max_items(),
            reconcile_interval_sec: default_reconcile_interval_sec(),
            semantic_max_source_bytes: default_semantic_max_source_bytes(),
            semantic_max_keywords: default_semantic_max_keywords(),
            semantic_max_symbols: default_semantic_max_symbols(),
            focus_max_scripts: default_focus_max_scripts(),
            focus_max_bytes: default_focus_max_bytes(),
            max_risk: default_max_risk(),
            audit_ledger_limit: default_audit_ledger_limit(),
            sqlite_enabled: true,
            sqlite_path: default_sqlite_path(),
            heartbeat_ttl_sec: default_heartbeat_ttl_sec(),
            claim_ttl_sec: default_claim_ttl_sec(),
            default_wait_timeout_sec: default_wait_timeout_sec(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:3030".to_string()
}
fn default_queue_dir() -> String {
    ".backplane/queue".to_string()
}
fn default_state_dir() -> String {
    ".backplane/state".to_string()
}
fn default_job_ttl_sec() -> u64 {
    600
}
fn default_max_actions() -> usize {
    400
}
fn default_max_source_bytes() -> u64 {
    256_000
}
fn default_safe_edit_bytes() -> u64 {
    32_000
}
fn default_max_queue() -> usize {
    500
}
fn default_policy_profile() -> String {
    "standard".to_string()
}
fn default_allowed_roots() -> Vec<String> {
    vec!["game/**".to_string()]
}
fn default_repair_max_attempts() -> u32 {
    3
}
fn default_repair_cooldown_sec() -> u64 {
    30
}
fn default_context_min_interval_sec() -> u64 {
    2
}
fn default_delta_max_items() -> usize {
    50
}
fn default_reconcile_interval_sec() -> u64 {
    15
}
fn default_semantic_max_source_bytes() -> u64 {
    200_000
}
fn default_semantic_max_keywords() -> usize {
    20
}
fn default_semantic_max_symbols() -> usize {
    40
}
fn default_focus_max_scripts() -> usize {
    12
}
fn default_focus_max_bytes() -> u64 {
    60_000
}
fn default_max_risk() -> f64 {
    0.7
}
fn default_audit_ledger_limit() -> usize {
    200
}
fn default_sqlite_path() -> String {
    ".backplane/state/backplane.sqlite3".to_string()
}
fn default_heartbeat_ttl_sec() -> u64 {
    15
}
fn default_claim_ttl_sec() -> u64 {
    30
}
fn default_wait_timeout_sec() -> u64 {
    25
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`BackplaneConfig`] from an optional TOML file path, then apply
/// environment variable overrides on top.
pub fn load_config(path: Option<&Path>) -> Result<BackplaneConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => BackplaneConfig::default(),
    };
    apply_env_overrides(&mut config);
    validate(&config).map_err(|reasons| ConfigError::ValidationError { reasons })?;
    Ok(config)
}

/// Parse a TOML string into a [`BackplaneConfig`].
pub fn parse_toml(content: &str) -> Result<BackplaneConfig, ConfigError> {
    toml::from_str::<BackplaneConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

macro_rules! env_override {
    ($config:expr, $field:ident, $var:literal, str) => {
        if let Ok(val) = std::env::var($var) {
            $config.$field = val;
        }
    };
    ($config:expr, $field:ident, $var:literal, bool) => {
        if let Ok(val) = std::env::var($var) {
            $config.$field = val == "1" || val.eq_ignore_ascii_case("true");
        }
    };
    ($config:expr, $field:ident, $var:literal, num) => {
        if let Ok(val) = std::env::var($var) {
            if let Ok(parsed) = val.parse() {
                $config.$field = parsed;
            }
        }
    };
}

/// Apply environment variable overrides for every tunable named in §6.
pub fn apply_env_overrides(config: &mut BackplaneConfig) {
    env_override!(config, queue_dir, "QUEUE_DIR", str);
    env_override!(config, job_ttl_sec, "JOB_TTL_SEC", num);
    env_override!(config, max_actions, "MAX_ACTIONS", num);
    env_override!(config, max_source_bytes, "MAX_SOURCE_BYTES", num);
    env_override!(config, max_queue, "MAX_QUEUE", num);
    env_override!(config, policy_profile, "POLICY_PROFILE", str);
    env_override!(config, auto_repair, "AUTO_REPAIR", bool);
    env_override!(config, repair_max_attempts, "REPAIR_MAX_ATTEMPTS", num);
    env_override!(config, repair_cooldown_sec, "REPAIR_COOLDOWN_SEC", num);
    env_override!(
        config,
        context_min_interval_sec,
        "CONTEXT_MIN_INTERVAL_SEC",
        num
    );
    env_override!(
        config,
        reconcile_interval_sec,
        "RECONCILE_INTERVAL_SEC",
        num
    );
    env_override!(config, sqlite_enabled, "SQLITE_ENABLED", bool);
    env_override!(config, sqlite_path, "SQLITE_PATH", str);
    env_override!(config, heartbeat_ttl_sec, "HEARTBEAT_TTL_SEC", num);
    env_override!(config, claim_ttl_sec, "CLAIM_TTL_SEC", num);
    env_override!(
        config,
        default_wait_timeout_sec,
        "DEFAULT_WAIT_TIMEOUT_SEC",
        num
    );
    env_override!(config, safe_edit_bytes, "SAFE_EDIT_BYTES", num);
    env_override!(config, delta_max_items, "DELTA_MAX_ITEMS", num);
    env_override!(
        config,
        semantic_max_source_bytes,
        "SEMANTIC_MAX_SOURCE_BYTES",
        num
    );
    env_override!(
        config,
        semantic_max_keywords,
        "SEMANTIC_MAX_KEYWORDS",
        num
    );
    env_override!(config, semantic_max_symbols, "SEMANTIC_MAX_SYMBOLS", num);
    env_override!(config, focus_max_scripts, "FOCUS_MAX_SCRIPTS", num);
    env_override!(config, focus_max_bytes, "FOCUS_MAX_BYTES", num);
    env_override!(config, max_risk, "MAX_RISK", num);
    env_override!(config, audit_ledger_limit, "AUDIT_LEDGER_LIMIT", num);
    env_override!(config, bind_addr, "BIND_ADDR", str);

    if let Ok(roots) = std::env::var("PROTECTED_ROOTS") {
        config.protected_roots = split_roots(&roots);
    }
    if let Ok(roots) = std::env::var("ALLOWED_ROOTS") {
        config.allowed_roots = split_roots(&roots);
    }
}

fn split_roots(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a loaded configuration, accumulating every problem found rather
/// than stopping at the first (matching the validator convention used
/// throughout this workspace).
pub fn validate(config: &BackplaneConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if !matches!(
        config.policy_profile.as_str(),
        "safe" | "standard" | "power"
    ) {
        errors.push(format!(
            "policy_profile must be one of safe|standard|power, got '{}'",
            config.policy_profile
        ));
    }
    if config.max_actions == 0 {
        errors.push("max_actions must be greater than zero".to_string());
    }
    if config.heartbeat_ttl_sec == 0 {
        errors.push("heartbeat_ttl_sec must be greater than zero".to_string());
    }
    if config.claim_ttl_sec == 0 {
        errors.push("claim_ttl_sec must be greater than zero".to_string());
    }
    if !(0.0..=1.0).contains(&config.max_risk) {
        errors.push("max_risk must be between 0.0 and 1.0".to_string());
    }
    if config.safe_edit_bytes > config.max_source_bytes {
        errors.push("safe_edit_bytes should not exceed max_source_bytes".to_string());
    }

    let as_value = serde_json::to_value(config).expect("config always serializes");
    let guard_errors = validate_json_object(&as_value, JsonGuardLimits::new(8, 1_000_000));
    errors.extend(guard_errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate(&BackplaneConfig::default()).is_ok());
    }

    #[test]
    fn rejects_unknown_policy_profile() {
        let mut config = BackplaneConfig::default();
        config.policy_profile = "bogus".to_string();
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("policy_profile")));
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        // SAFETY: tests run single-threaded within this process for env vars via serial access.
        std::env::set_var("MAX_ACTIONS", "999");
        std::env::set_var("AUTO_REPAIR", "1");
        let mut config = BackplaneConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.max_actions, 999);
        assert!(config.auto_repair);
        std::env::remove_var("MAX_ACTIONS");
        std::env::remove_var("AUTO_REPAIR");
    }

    #[test]
    fn parses_comma_separated_roots() {
        assert_eq!(
            split_roots("game/ServerStorage/**, game/Secrets/**"),
            vec!["game/ServerStorage/**", "game/Secrets/**"]
        );
    }

    #[test]
    fn parse_toml_round_trips_overrides() {
        let config = parse_toml("policy_profile = \"power\"\nmax_actions = 10\n").unwrap();
        assert_eq!(config.policy_profile, "power");
        assert_eq!(config.max_actions, 10);
    }
}
