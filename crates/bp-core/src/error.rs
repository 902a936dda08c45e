// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! The error catalog for the authoring backplane.
//!
//! Every variant maps to one observable error string on the HTTP boundary,
//! grouped by category:
//!
//! - **Fencing/scope** — lease admission and fence discipline.
//! - **Queue/claim** — transaction queue and claim/receipt protocol.
//! - **Context** — context store lookups.
//! - **Job bridge** — codex job bridge validation and lifecycle.
//! - **System** — persistence, filesystem, and startup failures.

use serde::{Deserialize, Serialize};

/// All errors the backplane can surface, one per §7 error kind plus a
/// system catch-all for I/O and persistence failures.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail")]
pub enum BackplaneError {
    // ── Fencing / scope ──────────────────────────────────────────────
    /// Presented `(leaseToken, fence)` does not match the current primary's.
    #[error("fence mismatch")]
    FenceMismatch,
    /// Presented scope does not match the current primary's scope.
    #[error("scope mismatch")]
    ScopeMismatch,
    /// No primary is currently admitted for this scope.
    #[error("no primary registered")]
    NoPrimary,
    /// A different identity already holds the primary lease and `takeover` was not set.
    #[error("primary already registered")]
    PrimaryAlreadyRegistered,

    // ── Queue / claim ────────────────────────────────────────────────
    /// `tx.protocolVersion` does not match the server's contract version.
    #[error("protocol version mismatch: {got}")]
    ProtocolVersionMismatch {
        /// The version the caller sent.
        got: String,
    },
    /// The queue already holds `MAX_QUEUE_SIZE` items for this scope.
    #[error("queue full")]
    QueueFull,
    /// The claim token is unknown, already consumed, or expired.
    #[error("claim invalid or expired")]
    ClaimInvalidOrExpired,

    // ── Context ──────────────────────────────────────────────────────
    /// No context snapshot exists yet for this `(scope, projectKey)`.
    #[error("no context")]
    NoContext,
    /// The requested script's source was omitted because this was a diff export.
    #[error("source omitted")]
    SourceOmitted,
    /// The requested script's source was truncated by the exporter.
    #[error("source truncated")]
    SourceTruncated,
    /// The requested script's source was never captured.
    #[error("source missing")]
    SourceMissing,
    /// No script with the requested path exists in the latest snapshot.
    #[error("script not found: {path}")]
    ScriptNotFound {
        /// Path that was requested.
        path: String,
    },
    /// No memory string has ever been set for this `(scope, projectKey)`.
    #[error("no memory")]
    NoMemory,
    /// A memory string exists but is empty.
    #[error("empty memory")]
    EmptyMemory,

    // ── Job bridge ───────────────────────────────────────────────────
    /// No job with the requested id exists.
    #[error("job not found: {job_id}")]
    JobNotFound {
        /// Job id that was requested.
        job_id: String,
    },
    /// A response envelope had none of `actions`, `tx.actions`, `plan.actions`, `dsl.actions`.
    #[error("invalid actions list")]
    InvalidActionsList,
    /// One or more actions failed normalization/validation.
    #[error("action validation failed: {reasons:?}")]
    ActionValidation {
        /// One human-readable reason per problem found.
        reasons: Vec<String>,
    },
    /// The response's `riskScore` exceeded `MAX_RISK` under the active policy profile.
    #[error("risk too high: {risk_score}")]
    RiskTooHigh {
        /// The risk score that was reported.
        risk_score: f64,
    },
    /// The job's age exceeded `JOB_TTL` with neither an ack nor a response on disk.
    #[error("codex job expired")]
    JobExpired,

    // ── System ───────────────────────────────────────────────────────
    /// A filesystem or SQL persistence operation failed.
    #[error("persistence error: {reason}")]
    Persistence {
        /// Underlying failure description.
        reason: String,
    },
    /// The request body failed to parse or deserialize.
    #[error("malformed request: {reason}")]
    MalformedRequest {
        /// Parse failure description.
        reason: String,
    },
}

impl BackplaneError {
    /// The stable, machine-readable name of this error kind (used as the `error` field
    /// on the HTTP boundary, matching this enum's `#[serde(tag = "error")]` discriminant).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FenceMismatch => "FenceMismatch",
            Self::ScopeMismatch => "ScopeMismatch",
            Self::NoPrimary => "NoPrimary",
            Self::PrimaryAlreadyRegistered => "PrimaryAlreadyRegistered",
            Self::ProtocolVersionMismatch { .. } => "ProtocolVersionMismatch",
            Self::QueueFull => "QueueFull",
            Self::ClaimInvalidOrExpired => "ClaimInvalidOrExpired",
            Self::NoContext => "NoContext",
            Self::SourceOmitted => "SourceOmitted",
            Self::SourceTruncated => "SourceTruncated",
            Self::SourceMissing => "SourceMissing",
            Self::ScriptNotFound { .. } => "ScriptNotFound",
            Self::NoMemory => "NoMemory",
            Self::EmptyMemory => "EmptyMemory",
            Self::JobNotFound { .. } => "JobNotFound",
            Self::InvalidActionsList => "InvalidActionsList",
            Self::ActionValidation { .. } => "ActionValidation",
            Self::RiskTooHigh { .. } => "RiskTooHigh",
            Self::JobExpired => "JobExpired",
            Self::Persistence { .. } => "Persistence",
            Self::MalformedRequest { .. } => "MalformedRequest",
        }
    }

    /// Whether this error should prompt the caller to `/register` again.
    pub fn requires_reregister(&self) -> bool {
        matches!(
            self,
            Self::FenceMismatch | Self::ScopeMismatch | Self::NoPrimary
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_spec_error_strings() {
        assert_eq!(BackplaneError::FenceMismatch.kind(), "FenceMismatch");
        assert_eq!(
            BackplaneError::PrimaryAlreadyRegistered.kind(),
            "PrimaryAlreadyRegistered"
        );
        assert_eq!(
            BackplaneError::ActionValidation {
                reasons: vec!["x".into()]
            }
            .kind(),
            "ActionValidation"
        );
    }

    #[test]
    fn only_fencing_errors_require_reregister() {
        assert!(BackplaneError::FenceMismatch.requires_reregister());
        assert!(BackplaneError::ScopeMismatch.requires_reregister());
        assert!(BackplaneError::NoPrimary.requires_reregister());
        assert!(!BackplaneError::QueueFull.requires_reregister());
        assert!(!BackplaneError::JobExpired.requires_reregister());
    }

    #[test]
    fn serializes_as_tagged_json() {
        let err = BackplaneError::ScriptNotFound {
            path: "game/S".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "ScriptNotFound");
    }
}
