// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-store
#![deny(unsafe_code)]
//!
//! Persistence primitives for the authoring backplane, kept in lockstep
//! across two layers per §4.6:
//!
//! - **Atomic JSON files** under a working directory — write-temp-then-rename
//!   so a crash never leaves a torn snapshot, memory, or queue-state file.
//! - **An embedded SQL database** (single file, WAL journaling,
//!   `synchronous=NORMAL`) mirroring the same data into queryable tables:
//!   `audit_log`, `context_events`, `context_snapshots`, `context_memory`,
//!   `context_semantic`, `queue_state`.
//!
//! The SQL connection is short-lived per operation (open, do the work,
//! close) rather than held across threads — every [`SqlStore`] method opens
//! its own [`rusqlite::Connection`] inside [`tokio::task::spawn_blocking`].
//! JSON files remain the source of truth callers reconstruct from on
//! startup; the SQL mirror exists for queryability and as a second line of
//! defense for restart recovery.

use bp_core::{ContextSnapshot, QueueItem, SemanticIndex};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Errors this crate can surface. Callers typically fold these into
/// `BackplaneError::Persistence` at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path the operation was performed against.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// A SQL operation failed.
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    /// The background blocking task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Atomic JSON files
// ---------------------------------------------------------------------------

/// Serialize `value` to `path` via write-temp-then-rename, so a concurrent
/// reader (or a crash mid-write) never observes a torn file.
pub async fn atomic_write_json<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = tmp_sibling(path);
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| io_err(&tmp_path, e))?;
    file.write_all(&bytes)
        .await
        .map_err(|e| io_err(&tmp_path, e))?;
    file.sync_all().await.map_err(|e| io_err(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| io_err(path, e))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read and deserialize `path`, returning `Ok(None)` when it does not exist.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Delete `path`, tolerating "already gone".
pub async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Append one JSON-encoded line to `path`, creating it (and its parent
/// directory) if necessary. Small single `write` calls are atomic at the OS
/// level for concurrent appenders, which is all the audit/event logs need.
pub async fn append_jsonl<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_err(path, e))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Return the last `limit` JSON-decodable lines of `path`, oldest first.
/// Lines that fail to parse are skipped rather than failing the whole read,
/// since a log is a best-effort diagnostic stream, not a transactional one.
pub async fn tail_jsonl<T: serde::de::DeserializeOwned>(
    path: &Path,
    limit: usize,
) -> Result<Vec<T>, StoreError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path, e)),
    };
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(limit);
    Ok(lines[start..]
        .iter()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

// ---------------------------------------------------------------------------
// Embedded SQL mirror
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    kind TEXT NOT NULL,
    scope TEXT,
    detail TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS context_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    kind TEXT NOT NULL,
    context_id TEXT NOT NULL,
    context_version INTEGER,
    detail TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS context_snapshots (
    context_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (context_id, version)
);
CREATE TABLE IF NOT EXISTS context_memory (
    context_id TEXT PRIMARY KEY,
    memory TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS context_semantic (
    context_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (context_id, version)
);
CREATE TABLE IF NOT EXISTS queue_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// A handle to the embedded SQL database file. Cheap to clone (it is just a
/// path); every method opens its own short-lived connection.
#[derive(Debug, Clone)]
pub struct SqlStore {
    path: PathBuf,
}

impl SqlStore {
    /// Point at a database file, creating its parent directory if needed.
    /// Does not open a connection or touch the file until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Create the schema eagerly (used at startup to fail fast on a bad path).
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.open().map(|_| ())).await?
    }

    /// Append one row to `audit_log`.
    pub async fn insert_audit_log(
        &self,
        ts: DateTime<Utc>,
        kind: String,
        scope: Option<String>,
        detail: String,
    ) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            conn.execute(
                "INSERT INTO audit_log (ts, kind, scope, detail) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![ts.to_rfc3339(), kind, scope, detail],
            )?;
            Ok(())
        })
        .await?
    }

    /// Append one row to `context_events`.
    pub async fn insert_context_event(
        &self,
        ts: DateTime<Utc>,
        kind: String,
        context_id: String,
        context_version: Option<u64>,
        detail: String,
    ) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            conn.execute(
                "INSERT INTO context_events (ts, kind, context_id, context_version, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    ts.to_rfc3339(),
                    kind,
                    context_id,
                    context_version.map(|v| v as i64),
                    detail
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Upsert a context snapshot row, mirroring the in-memory/JSON-file copy.
    pub async fn upsert_context_snapshot(&self, snapshot: ContextSnapshot) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let payload = serde_json::to_string(&snapshot)?;
            conn.execute(
                "INSERT INTO context_snapshots (context_id, version, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(context_id, version) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                rusqlite::params![
                    snapshot.context_id,
                    snapshot.context_version as i64,
                    payload,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Load the highest-`version` snapshot stored for `context_id`, if any.
    pub async fn load_latest_context_snapshot(
        &self,
        context_id: String,
    ) -> Result<Option<ContextSnapshot>, StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM context_snapshots WHERE context_id = ?1 ORDER BY version DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(rusqlite::params![context_id])?;
            if let Some(row) = rows.next()? {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            } else {
                Ok(None)
            }
        })
        .await?
    }

    /// Upsert the memory string for `context_id`.
    pub async fn upsert_context_memory(
        &self,
        context_id: String,
        memory: String,
    ) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            conn.execute(
                "INSERT INTO context_memory (context_id, memory, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(context_id) DO UPDATE SET memory = excluded.memory, updated_at = excluded.updated_at",
                rusqlite::params![context_id, memory, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await?
    }

    /// Load the memory string for `context_id`, if one has been set.
    pub async fn load_context_memory(&self, context_id: String) -> Result<Option<String>, StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let mut stmt = conn.prepare("SELECT memory FROM context_memory WHERE context_id = ?1")?;
            let mut rows = stmt.query(rusqlite::params![context_id])?;
            Ok(match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            })
        })
        .await?
    }

    /// Upsert a semantic index row for `(context_id, version)`.
    pub async fn upsert_context_semantic(
        &self,
        context_id: String,
        version: u64,
        index: SemanticIndex,
    ) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let payload = serde_json::to_string(&index)?;
            conn.execute(
                "INSERT INTO context_semantic (context_id, version, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(context_id, version) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                rusqlite::params![context_id, version as i64, payload, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await?
    }

    /// Load the semantic index stored for `(context_id, version)`, if any.
    pub async fn load_context_semantic(
        &self,
        context_id: String,
        version: u64,
    ) -> Result<Option<SemanticIndex>, StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM context_semantic WHERE context_id = ?1 AND version = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![context_id, version as i64])?;
            if let Some(row) = rows.next()? {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            } else {
                Ok(None)
            }
        })
        .await?
    }

    /// Persist the queue's `seq` high-water mark and item list.
    pub async fn save_queue_state(&self, seq: u64, items: Vec<QueueItem>) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let payload = serde_json::to_string(&items)?;
            conn.execute(
                "INSERT INTO queue_state (id, seq, payload, updated_at) VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET seq = excluded.seq, payload = excluded.payload, updated_at = excluded.updated_at",
                rusqlite::params![seq as i64, payload, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await?
    }

    /// Load the persisted queue state, if any row has ever been written.
    pub async fn load_queue_state(&self) -> Result<Option<(u64, Vec<QueueItem>)>, StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let mut stmt = conn.prepare("SELECT seq, payload FROM queue_state WHERE id = 1")?;
            let mut rows = stmt.query([])?;
            if let Some(row) = rows.next()? {
                let seq: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                let items: Vec<QueueItem> = serde_json::from_str(&payload)?;
                Ok(Some((seq as u64, items)))
            } else {
                Ok(None)
            }
        })
        .await?
    }

    /// Purge every row for `context_id` across the context-shaped tables,
    /// used by `/context/reset`.
    pub async fn purge_context(&self, context_id: String) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            conn.execute(
                "DELETE FROM context_snapshots WHERE context_id = ?1",
                rusqlite::params![context_id],
            )?;
            conn.execute(
                "DELETE FROM context_memory WHERE context_id = ?1",
                rusqlite::params![context_id],
            )?;
            conn.execute(
                "DELETE FROM context_semantic WHERE context_id = ?1",
                rusqlite::params![context_id],
            )?;
            Ok(())
        })
        .await?
    }
}

/// File paths this crate's atomic-JSON helpers write under a given state
/// directory root, matching the layout named in §6.
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Anchor every path helper under `root` (typically `BackplaneConfig::state_dir`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `context_<contextId>.json`, with `:` replaced since it is not
    /// filesystem-safe on every target.
    pub fn context_snapshot(&self, context_id: &str) -> PathBuf {
        self.root.join(format!("context_{}.json", sanitize(context_id)))
    }

    /// `context_<contextId>.memory.txt`.
    pub fn context_memory(&self, context_id: &str) -> PathBuf {
        self.root
            .join(format!("context_{}.memory.txt", sanitize(context_id)))
    }

    /// `queue_state.json`.
    pub fn queue_state(&self) -> PathBuf {
        self.root.join("queue_state.json")
    }

    /// `audit.log` (JSONL).
    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    /// `context_events.log` (JSONL).
    pub fn context_events_log(&self) -> PathBuf {
        self.root.join("context_events.log")
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_core::{ContextMeta, Scope};

    fn snapshot(context_id: &str, version: u64) -> ContextSnapshot {
        ContextSnapshot {
            context_version: version,
            context_id: context_id.to_string(),
            meta: ContextMeta::default(),
            tree: vec![],
            scripts: vec![],
            server_received_at: Utc::now(),
            delta: None,
        }
    }

    #[tokio::test]
    async fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/context_x.json");
        let snap = snapshot("ctx:1:s1", 3);
        atomic_write_json(&path, &snap).await.unwrap();
        let back: ContextSnapshot = read_json(&path).await.unwrap().unwrap();
        assert_eq!(back.context_version, 3);
    }

    #[tokio::test]
    async fn read_json_returns_none_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let out: Option<ContextSnapshot> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn append_and_tail_jsonl_returns_last_n_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        for i in 0..5 {
            append_jsonl(&path, &serde_json::json!({ "i": i })).await.unwrap();
        }
        let tailed: Vec<serde_json::Value> = tail_jsonl(&path, 2).await.unwrap();
        assert_eq!(tailed.len(), 2);
        assert_eq!(tailed[0]["i"], 3);
        assert_eq!(tailed[1]["i"], 4);
    }

    #[tokio::test]
    async fn sql_store_round_trips_context_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        sql.upsert_context_snapshot(snapshot("ctx:1:s1", 1)).await.unwrap();
        sql.upsert_context_snapshot(snapshot("ctx:1:s1", 2)).await.unwrap();
        let latest = sql
            .load_latest_context_snapshot("ctx:1:s1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.context_version, 2);
    }

    #[tokio::test]
    async fn sql_store_round_trips_memory() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        assert!(sql.load_context_memory("ctx:1:s1".to_string()).await.unwrap().is_none());
        sql.upsert_context_memory("ctx:1:s1".to_string(), "remember".to_string())
            .await
            .unwrap();
        assert_eq!(
            sql.load_context_memory("ctx:1:s1".to_string()).await.unwrap(),
            Some("remember".to_string())
        );
    }

    #[tokio::test]
    async fn sql_store_round_trips_queue_state() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        let item = QueueItem {
            seq: 1,
            scope: Scope::new(1, "s1"),
            tx: bp_core::Transaction {
                protocol_version: "backplane/v1".into(),
                transaction_id: "tx1".into(),
                actions: vec![],
            },
            claim_token: None,
            claimed: false,
        };
        sql.save_queue_state(1, vec![item]).await.unwrap();
        let (seq, items) = sql.load_queue_state().await.unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn purge_context_removes_every_shaped_row() {
        let dir = tempfile::tempdir().unwrap();
        let sql = SqlStore::new(dir.path().join("backplane.sqlite3"));
        sql.init_schema().await.unwrap();
        sql.upsert_context_snapshot(snapshot("ctx:1:s1", 1)).await.unwrap();
        sql.upsert_context_memory("ctx:1:s1".to_string(), "m".to_string())
            .await
            .unwrap();
        sql.purge_context("ctx:1:s1".to_string()).await.unwrap();
        assert!(sql
            .load_latest_context_snapshot("ctx:1:s1".to_string())
            .await
            .unwrap()
            .is_none());
        assert!(sql.load_context_memory("ctx:1:s1".to_string()).await.unwrap().is_none());
    }

    #[test]
    fn state_paths_sanitizes_context_id() {
        let paths = StatePaths::new("/tmp/state");
        assert_eq!(
            paths.context_snapshot("ctx:10:s1"),
            PathBuf::from("/tmp/state/context_ctx_10_s1.json")
        );
    }
}
