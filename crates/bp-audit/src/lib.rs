// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-audit
#![deny(unsafe_code)]
//!
//! Append-only event streams per §4.6/§4.9: every lease transition, queue
//! mutation, and context export is recorded as one JSON-lines row in
//! `audit.log` or `context_events.log`, tailable via `/audit/ledger?limit=N`
//! and `/context/events?limit=N`. Rows are also mirrored into the `audit_log`
//! / `context_events` SQL tables through [`bp_store::SqlStore`] so the two
//! persistence layers never drift apart.

use bp_store::{SqlStore, StatePaths, StoreError};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of the `audit.log` JSON-lines stream.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditRecord {
    /// When the event was recorded.
    pub ts: DateTime<Utc>,
    /// Short event kind, e.g. `"lease.register"`, `"queue.enqueue"`, `"error"`.
    pub kind: String,
    /// Scope the event pertains to, if any (lease/queue events always carry one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Free-form human-readable detail.
    pub detail: String,
}

/// One row of the `context_events.log` JSON-lines stream.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContextEventRecord {
    /// When the event was recorded.
    pub ts: DateTime<Utc>,
    /// Short event kind, e.g. `"context.export"`, `"context.throttled"`.
    pub kind: String,
    /// Context identifier this event pertains to.
    pub context_id: String,
    /// Context version at the time of the event, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_version: Option<u64>,
    /// Free-form human-readable detail.
    pub detail: String,
}

/// The two append-only streams, plus their SQL mirror.
pub struct AuditLog {
    paths: StatePaths,
    sql: SqlStore,
    default_limit: usize,
}

impl AuditLog {
    /// Build a log writer rooted at `state_dir`, mirroring into `sql` and
    /// defaulting `/audit/ledger`'s page size to `default_limit` (the
    /// `AUDIT_LEDGER_LIMIT` env var's resolved value).
    pub fn new(state_dir: impl Into<std::path::PathBuf>, sql: SqlStore, default_limit: usize) -> Self {
        Self {
            paths: StatePaths::new(state_dir),
            sql,
            default_limit,
        }
    }

    /// The page size `/audit/ledger` and `/context/events` use when the
    /// caller omits `limit`.
    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Append one audit row to the JSONL stream and its SQL mirror.
    pub async fn record(
        &self,
        kind: impl Into<String>,
        scope: Option<String>,
        detail: impl Into<String>,
    ) -> Result<(), StoreError> {
        let record = AuditRecord {
            ts: Utc::now(),
            kind: kind.into(),
            scope: scope.clone(),
            detail: detail.into(),
        };
        bp_store::append_jsonl(&self.paths.audit_log(), &record).await?;
        tracing::info!(kind = %record.kind, scope = ?scope, "audit event");
        self.sql
            .insert_audit_log(record.ts, record.kind, record.scope, record.detail)
            .await
    }

    /// Append one context-event row to the JSONL stream and its SQL mirror.
    pub async fn record_context_event(
        &self,
        kind: impl Into<String>,
        context_id: impl Into<String>,
        context_version: Option<u64>,
        detail: impl Into<String>,
    ) -> Result<(), StoreError> {
        let record = ContextEventRecord {
            ts: Utc::now(),
            kind: kind.into(),
            context_id: context_id.into(),
            context_version,
            detail: detail.into(),
        };
        bp_store::append_jsonl(&self.paths.context_events_log(), &record).await?;
        tracing::info!(kind = %record.kind, context_id = %record.context_id, "context event");
        self.sql
            .insert_context_event(
                record.ts,
                record.kind,
                record.context_id,
                record.context_version,
                record.detail,
            )
            .await
    }

    /// Return the last `limit` audit rows, oldest first. `limit` of `None`
    /// falls back to [`Self::default_limit`].
    pub async fn tail_audit(&self, limit: Option<usize>) -> Result<Vec<AuditRecord>, StoreError> {
        bp_store::tail_jsonl(&self.paths.audit_log(), limit.unwrap_or(self.default_limit)).await
    }

    /// Return the last `limit` context-event rows, oldest first. `limit` of
    /// `None` falls back to [`Self::default_limit`].
    pub async fn tail_context_events(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ContextEventRecord>, StoreError> {
        bp_store::tail_jsonl(
            &self.paths.context_events_log(),
            limit.unwrap_or(self.default_limit),
        )
        .await
    }

    /// Record the fingerprint-fallback warning named in §9's Open Questions:
    /// a script whose fingerprint degraded to the lossy `"bytes:<n>"` form,
    /// which can spuriously collide with unrelated scripts of equal size
    /// during diff-mode carry-over.
    pub async fn record_lossy_fingerprint_warning(
        &self,
        scope: Option<String>,
        script_path: &str,
    ) -> Result<(), StoreError> {
        tracing::warn!(path = %script_path, "script fingerprint fell back to byte-count; may spuriously collide");
        self.record(
            "fingerprint.lossy",
            scope,
            format!("script '{script_path}' has no sha1/source; fingerprint degraded to byte count"),
        )
        .await
    }
}

/// A count of events grouped by `kind`, used for lightweight diagnostics.
pub fn count_by_kind<'a, I, T>(records: I, kind_of: impl Fn(&T) -> &str) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a T>,
    T: 'a,
{
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(kind_of(record).to_string()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_and_tail_audit_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        let log = AuditLog::new(dir.path(), sql, 50);
        log.record("lease.register", Some("10:s1".into()), "admitted c1")
            .await
            .unwrap();
        log.record("queue.enqueue", Some("10:s1".into()), "seq=1")
            .await
            .unwrap();
        let tailed = log.tail_audit(None).await.unwrap();
        assert_eq!(tailed.len(), 2);
        assert_eq!(tailed[0].kind, "lease.register");
        assert_eq!(tailed[1].kind, "queue.enqueue");
    }

    #[tokio::test]
    async fn tail_audit_respects_explicit_limit_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        let log = AuditLog::new(dir.path(), sql, 50);
        for i in 0..5 {
            log.record("x", None, format!("{i}")).await.unwrap();
        }
        let tailed = log.tail_audit(Some(2)).await.unwrap();
        assert_eq!(tailed.len(), 2);
        assert_eq!(tailed[0].detail, "3");
        assert_eq!(tailed[1].detail, "4");
    }

    #[tokio::test]
    async fn record_and_tail_context_events_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        let log = AuditLog::new(dir.path(), sql, 50);
        log.record_context_event("context.export", "ctx:1:s1", Some(1), "accepted")
            .await
            .unwrap();
        let tailed = log.tail_context_events(None).await.unwrap();
        assert_eq!(tailed.len(), 1);
        assert_eq!(tailed[0].context_id, "ctx:1:s1");
        assert_eq!(tailed[0].context_version, Some(1));
    }

    #[tokio::test]
    async fn lossy_fingerprint_warning_is_audit_logged() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        let log = AuditLog::new(dir.path(), sql, 50);
        log.record_lossy_fingerprint_warning(Some("10:s1".into()), "game/A")
            .await
            .unwrap();
        let tailed = log.tail_audit(None).await.unwrap();
        assert_eq!(tailed.len(), 1);
        assert_eq!(tailed[0].kind, "fingerprint.lossy");
    }

    #[test]
    fn count_by_kind_groups_correctly() {
        let records = vec![
            AuditRecord { ts: Utc::now(), kind: "a".into(), scope: None, detail: "".into() },
            AuditRecord { ts: Utc::now(), kind: "a".into(), scope: None, detail: "".into() },
            AuditRecord { ts: Utc::now(), kind: "b".into(), scope: None, detail: "".into() },
        ];
        let counts = count_by_kind(&records, |r| r.kind.as_str());
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
    }
}
