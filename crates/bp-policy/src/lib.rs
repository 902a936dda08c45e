// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-policy
#![deny(unsafe_code)]
//!
//! Coarse policy profiles (`safe | standard | power`) that gate which
//! action types and sizes the normalizer/validator (`bp-validate`) allows,
//! plus path ACL checks built on [`bp_glob`].

use bp_core::ActionType;
use bp_glob::{IncludeExcludeGlobs, MatchDecision};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coarse permission level gating action types and sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyProfile {
    /// Smallest edits only, no structural changes, no deletes.
    Safe,
    /// Structural changes allowed, deletes still blocked.
    Standard,
    /// Everything allowed, including deletes and the largest edit sizes.
    Power,
}

impl PolicyProfile {
    /// Parse a profile name, defaulting to [`PolicyProfile::Standard`] on anything unrecognized.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" => Self::Safe,
            "power" => Self::Power,
            _ => Self::Standard,
        }
    }
}

impl Default for PolicyProfile {
    fn default() -> Self {
        Self::Standard
    }
}

/// Outcome of a policy check, including a human-readable reason when denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the action/path is permitted.
    pub allowed: bool,
    /// Reason for denial; absent when `allowed`.
    pub reason: Option<String>,
}

impl Decision {
    /// Construct an allowing decision.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Construct a denying decision with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Structural action types blocked under the `safe` policy profile.
const SAFE_BLOCKED_STRUCTURAL: &[ActionType] = &[
    ActionType::CreateInstance,
    ActionType::Rename,
    ActionType::Move,
];

/// Evaluates policy-profile gates and path ACLs for the action validator.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    profile: PolicyProfile,
    /// Protected roots always reject, regardless of `allowed_roots`.
    protected: IncludeExcludeGlobs,
    /// When non-empty, only paths matching one of these roots are allowed.
    allowed: IncludeExcludeGlobs,
    safe_edit_bytes: u64,
    max_source_bytes: u64,
}

impl PolicyEngine {
    /// Build a policy engine from a profile and the configured root ACLs.
    pub fn new(
        profile: PolicyProfile,
        protected_roots: &[String],
        allowed_roots: &[String],
        safe_edit_bytes: u64,
        max_source_bytes: u64,
    ) -> anyhow::Result<Self> {
        let no_include: &[String] = &[];
        Ok(Self {
            profile,
            protected: IncludeExcludeGlobs::new(no_include, protected_roots)?,
            allowed: IncludeExcludeGlobs::new(allowed_roots, no_include)?,
            safe_edit_bytes,
            max_source_bytes,
        })
    }

    /// Active profile.
    pub fn profile(&self) -> PolicyProfile {
        self.profile
    }

    /// Check a path against protected/allowed root ACLs.
    pub fn check_path(&self, path: &Path) -> Decision {
        let s = path.to_string_lossy();
        if self.protected.decide_path(path) == MatchDecision::DeniedByExclude {
            return Decision::deny(format!("protected path {s}"));
        }
        if self.allowed.decide_path(path) == MatchDecision::DeniedByMissingInclude {
            return Decision::deny(format!("path {s} not under an allowed root"));
        }
        Decision::allow()
    }

    /// Whether `action_type` is permitted at all under the active profile.
    pub fn check_action_type(&self, action_type: ActionType) -> Decision {
        if self.profile == PolicyProfile::Safe && SAFE_BLOCKED_STRUCTURAL.contains(&action_type) {
            return Decision::deny(format!("{action_type:?} blocked by safe policy"));
        }
        if self.profile != PolicyProfile::Power && action_type == ActionType::DeleteInstance {
            return Decision::deny("deleteInstance blocked by policy".to_string());
        }
        Decision::allow()
    }

    /// The effective byte cap for `editScript` source under the active profile.
    pub fn effective_edit_byte_cap(&self) -> u64 {
        if self.profile == PolicyProfile::Safe {
            self.safe_edit_bytes.min(self.max_source_bytes)
        } else {
            self.max_source_bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(profile: PolicyProfile) -> PolicyEngine {
        PolicyEngine::new(
            profile,
            &["game/ServerStorage/Secrets/**".to_string()],
            &["game/**".to_string()],
            1_000,
            10_000,
        )
        .unwrap()
    }

    #[test]
    fn parses_known_profile_names_case_insensitively() {
        assert_eq!(PolicyProfile::parse("SAFE"), PolicyProfile::Safe);
        assert_eq!(PolicyProfile::parse("power"), PolicyProfile::Power);
        assert_eq!(PolicyProfile::parse("bogus"), PolicyProfile::Standard);
    }

    #[test]
    fn protected_root_is_denied_even_when_under_allowed_root() {
        let eng = engine(PolicyProfile::Power);
        let decision = eng.check_path(Path::new("game/ServerStorage/Secrets/Key"));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("protected path"));
    }

    #[test]
    fn path_outside_allowed_roots_is_denied() {
        let eng = engine(PolicyProfile::Standard);
        let decision = eng.check_path(Path::new("other/Thing"));
        assert!(!decision.allowed);
    }

    #[test]
    fn safe_profile_blocks_structural_actions() {
        let eng = engine(PolicyProfile::Safe);
        assert!(!eng.check_action_type(ActionType::CreateInstance).allowed);
        assert!(!eng.check_action_type(ActionType::Move).allowed);
        assert!(eng.check_action_type(ActionType::SetProperty).allowed);
    }

    #[test]
    fn delete_blocked_outside_power_profile() {
        assert!(!engine(PolicyProfile::Safe).check_action_type(ActionType::DeleteInstance).allowed);
        assert!(!engine(PolicyProfile::Standard).check_action_type(ActionType::DeleteInstance).allowed);
        assert!(engine(PolicyProfile::Power).check_action_type(ActionType::DeleteInstance).allowed);
    }

    #[test]
    fn safe_profile_uses_the_smaller_of_the_two_byte_caps() {
        let eng = engine(PolicyProfile::Safe);
        assert_eq!(eng.effective_edit_byte_cap(), 1_000);
    }
}
