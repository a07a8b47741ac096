// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SQLite-backed session store.
//!
//! Shared with the approval UI process through the database file alone, so
//! every mutating write forces a WAL checkpoint and reads that must observe
//! another process's writes run on fresh short-lived connections. The
//! long-lived write connection is serialized behind a mutex; the proxy loop
//! and background pruning may touch it concurrently.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine_core::blocker::{PendingRequest, PendingStatus};
use crate::engine_core::constants::retention::PRUNE_EVERY_STEPS;
use crate::engine_core::errors::StoreError;
use crate::engine_core::models::{
    ObservedStep, RequestId, SchemaColumn, Session, SessionContext, SessionId, StepCategory,
    StepId, TableCast,
};
use crate::store::retention::prune_sessions;
use crate::store::{SessionStore, StepUpdate};

const STEP_CHANNEL_CAPACITY: usize = 256;

fn connect(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(30))?;
    // synchronous=FULL + checkpoint-after-write keep cross-process pollers
    // within one poll interval of any decision.
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA wal_autocheckpoint = 1000;",
    )?;
    Ok(conn)
}

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    step_channels: Mutex<HashMap<SessionId, broadcast::Sender<ObservedStep>>>,
    retention_days: i64,
    max_db_bytes: u64,
    step_count: AtomicU64,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_retention(
            path,
            crate::engine_core::constants::retention::DEFAULT_RETENTION_DAYS,
            0,
        )
    }

    pub fn open_with_retention(
        path: &Path,
        retention_days: i64,
        max_db_bytes: u64,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = connect(path)?;
        let store = Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            step_channels: Mutex::new(HashMap::new()),
            retention_days,
            max_db_bytes,
            step_count: AtomicU64::new(0),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().expect("store lock poisoned");
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    title TEXT,
                    created_at TEXT NOT NULL,
                    repo_root TEXT,
                    repo_name TEXT,
                    branch_name TEXT,
                    commit_sha TEXT,
                    is_dirty INTEGER,
                    tag TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at);

                CREATE TABLE IF NOT EXISTS steps (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    duration_ms INTEGER,
                    summary_text TEXT,
                    risk_level TEXT,
                    warnings_json TEXT,
                    target_type TEXT,
                    tool_category TEXT,
                    sql_text TEXT,
                    sql_truncated INTEGER,
                    sql_classification TEXT,
                    policy_rule_ids_json TEXT,
                    decision TEXT,
                    result_rows_shown INTEGER,
                    result_rows_total INTEGER,
                    captured_bytes INTEGER,
                    error_message TEXT,
                    tables_touched_json TEXT,
                    args_json TEXT,
                    result_json TEXT,
                    preview_text TEXT,
                    preview_truncated INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_steps_session_created_at
                ON steps(session_id, created_at);

                CREATE TABLE IF NOT EXISTS casts (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    origin_step_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    sql TEXT NOT NULL,
                    rows_json TEXT NOT NULL,
                    columns_json TEXT,
                    total_rows INTEGER NOT NULL,
                    truncated INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_casts_session_created_at
                ON casts(session_id, created_at);

                CREATE TABLE IF NOT EXISTS pending_requests (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    arguments_json TEXT,
                    classification TEXT,
                    risk_level TEXT,
                    reason TEXT,
                    blocker_step_id TEXT,
                    status TEXT NOT NULL,
                    decided_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_pending_session_created_at
                ON pending_requests(session_id, created_at);",
            )?;

            // Lightweight migration for DBs created before tables_touched landed
            let mut stmt = conn.prepare("PRAGMA table_info(steps)")?;
            let columns: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<_, _>>()?;
            if !columns.iter().any(|c| c == "tables_touched_json") {
                conn.execute("ALTER TABLE steps ADD COLUMN tables_touched_json TEXT", [])?;
            }
        }
        self.checkpoint();
        Ok(())
    }

    /// Force a WAL checkpoint so the write is visible to the UI process.
    fn checkpoint(&self) {
        let conn = self.conn.lock().expect("store lock poisoned");
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            debug!("wal checkpoint failed: {}", e);
        }
    }

    fn notify_step(&self, step: &ObservedStep) {
        let channels = self.step_channels.lock().expect("store lock poisoned");
        if let Some(tx) = channels.get(&step.session_id) {
            let _ = tx.send(step.clone());
        }
    }

    /// Kick off retention pruning without making the triggering write wait.
    fn schedule_prune(&self) {
        if self.retention_days <= 0 && self.max_db_bytes == 0 {
            return;
        }

        let path = self.path.clone();
        let retention_days = self.retention_days;
        let max_db_bytes = self.max_db_bytes;
        let prune = move || {
            if let Err(e) = prune_sessions(&path, retention_days, max_db_bytes) {
                warn!("session pruning failed: {}", e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(prune);
            }
            Err(_) => prune(),
        }
    }

    fn session_exists_on(conn: &Connection, session_id: SessionId) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

// Raw row images; converted into models outside the rusqlite closures so
// decode failures surface as StoreError::Corrupt instead of panics.

struct SessionRow {
    id: String,
    title: Option<String>,
    created_at: String,
    repo_root: Option<String>,
    repo_name: Option<String>,
    branch_name: Option<String>,
    commit_sha: Option<String>,
    is_dirty: Option<bool>,
    tag: Option<String>,
}

const SESSION_COLUMNS: &str =
    "id, title, created_at, repo_root, repo_name, branch_name, commit_sha, is_dirty, tag";

fn read_session_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        repo_root: row.get(3)?,
        repo_name: row.get(4)?,
        branch_name: row.get(5)?,
        commit_sha: row.get(6)?,
        is_dirty: row.get(7)?,
        tag: row.get(8)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_json_column(raw: Option<String>) -> Result<Option<serde_json::Value>, StoreError> {
    match raw {
        None => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let has_context = row.repo_root.is_some()
            || row.repo_name.is_some()
            || row.branch_name.is_some()
            || row.commit_sha.is_some()
            || row.is_dirty.is_some()
            || row.tag.is_some();
        let context = has_context.then(|| SessionContext {
            repo_root: row.repo_root,
            repo_name: row.repo_name,
            branch: row.branch_name,
            commit: row.commit_sha,
            dirty: row.is_dirty,
            tag: row.tag,
        });

        Ok(Session {
            id: SessionId::from_str(&row.id)
                .map_err(|e| StoreError::Corrupt(format!("bad session id: {e}")))?,
            title: row.title,
            created_at: parse_timestamp(&row.created_at)?,
            context,
        })
    }
}

struct StepRow {
    id: String,
    session_id: String,
    created_at: String,
    kind: String,
    name: String,
    status: String,
    duration_ms: Option<i64>,
    summary_text: Option<String>,
    risk_level: Option<String>,
    warnings_json: Option<String>,
    target_type: Option<String>,
    tool_category: Option<String>,
    sql_text: Option<String>,
    sql_truncated: Option<bool>,
    sql_classification: Option<String>,
    policy_rule_ids_json: Option<String>,
    decision: Option<String>,
    result_rows_shown: Option<i64>,
    result_rows_total: Option<i64>,
    captured_bytes: Option<i64>,
    error_message: Option<String>,
    tables_touched_json: Option<String>,
    args_json: Option<String>,
    result_json: Option<String>,
    preview_text: Option<String>,
    preview_truncated: Option<bool>,
}

const STEP_COLUMNS: &str = "id, session_id, created_at, kind, name, status, duration_ms, \
     summary_text, risk_level, warnings_json, target_type, tool_category, \
     sql_text, sql_truncated, sql_classification, policy_rule_ids_json, decision, \
     result_rows_shown, result_rows_total, captured_bytes, error_message, \
     tables_touched_json, args_json, result_json, preview_text, preview_truncated";

fn read_step_row(row: &Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        created_at: row.get(2)?,
        kind: row.get(3)?,
        name: row.get(4)?,
        status: row.get(5)?,
        duration_ms: row.get(6)?,
        summary_text: row.get(7)?,
        risk_level: row.get(8)?,
        warnings_json: row.get(9)?,
        target_type: row.get(10)?,
        tool_category: row.get(11)?,
        sql_text: row.get(12)?,
        sql_truncated: row.get(13)?,
        sql_classification: row.get(14)?,
        policy_rule_ids_json: row.get(15)?,
        decision: row.get(16)?,
        result_rows_shown: row.get(17)?,
        result_rows_total: row.get(18)?,
        captured_bytes: row.get(19)?,
        error_message: row.get(20)?,
        tables_touched_json: row.get(21)?,
        args_json: row.get(22)?,
        result_json: row.get(23)?,
        preview_text: row.get(24)?,
        preview_truncated: row.get(25)?,
    })
}

fn parse_string_list(raw: Option<String>) -> Result<Option<Vec<String>>, StoreError> {
    match raw {
        None => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
    }
}

impl TryFrom<StepRow> for ObservedStep {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(ObservedStep {
            id: StepId::from_str(&row.id)
                .map_err(|e| StoreError::Corrupt(format!("bad step id: {e}")))?,
            session_id: SessionId::from_str(&row.session_id)
                .map_err(|e| StoreError::Corrupt(format!("bad session id: {e}")))?,
            created_at: parse_timestamp(&row.created_at)?,
            kind: row
                .kind
                .parse()
                .map_err(StoreError::Corrupt)?,
            name: row.name,
            status: row
                .status
                .parse()
                .map_err(StoreError::Corrupt)?,
            duration_ms: row.duration_ms,
            summary: row.summary_text,
            risk_level: row.risk_level,
            warnings: parse_string_list(row.warnings_json)?,
            tables_touched: parse_string_list(row.tables_touched_json)?,
            target_type: row.target_type,
            tool_category: row
                .tool_category
                .map(|c| c.parse::<StepCategory>().map_err(StoreError::Corrupt))
                .transpose()?,
            sql: row.sql_text.map(|text| {
                crate::engine_core::models::TruncatedText {
                    text,
                    truncated: row.sql_truncated.unwrap_or(false),
                }
            }),
            sql_classification: row.sql_classification,
            policy_rule_ids: parse_string_list(row.policy_rule_ids_json)?,
            decision: row.decision,
            result_rows_shown: row.result_rows_shown,
            result_rows_total: row.result_rows_total,
            captured_bytes: row.captured_bytes,
            error_message: row.error_message,
            args: parse_json_column(row.args_json)?,
            result: parse_json_column(row.result_json)?,
            preview: row.preview_text.map(|text| {
                crate::engine_core::models::TruncatedText {
                    text,
                    truncated: row.preview_truncated.unwrap_or(false),
                }
            }),
        })
    }
}

struct PendingRow {
    id: String,
    session_id: String,
    created_at: String,
    tool_name: String,
    arguments_json: Option<String>,
    classification: Option<String>,
    risk_level: Option<String>,
    reason: Option<String>,
    blocker_step_id: Option<String>,
    status: String,
    decided_at: Option<String>,
}

const PENDING_COLUMNS: &str = "id, session_id, created_at, tool_name, arguments_json, \
     classification, risk_level, reason, blocker_step_id, status, decided_at";

fn read_pending_row(row: &Row<'_>) -> rusqlite::Result<PendingRow> {
    Ok(PendingRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        created_at: row.get(2)?,
        tool_name: row.get(3)?,
        arguments_json: row.get(4)?,
        classification: row.get(5)?,
        risk_level: row.get(6)?,
        reason: row.get(7)?,
        blocker_step_id: row.get(8)?,
        status: row.get(9)?,
        decided_at: row.get(10)?,
    })
}

impl TryFrom<PendingRow> for PendingRequest {
    type Error = StoreError;

    fn try_from(row: PendingRow) -> Result<Self, Self::Error> {
        Ok(PendingRequest {
            id: RequestId::from_str(&row.id)
                .map_err(|e| StoreError::Corrupt(format!("bad request id: {e}")))?,
            session_id: SessionId::from_str(&row.session_id)
                .map_err(|e| StoreError::Corrupt(format!("bad session id: {e}")))?,
            created_at: parse_timestamp(&row.created_at)?,
            tool_name: row.tool_name,
            arguments: parse_json_column(row.arguments_json)?,
            classification: row.classification,
            risk_level: row.risk_level,
            reason: row.reason,
            blocker_step_id: row
                .blocker_step_id
                .map(|s| {
                    StepId::from_str(&s)
                        .map_err(|e| StoreError::Corrupt(format!("bad step id: {e}")))
                })
                .transpose()?,
            status: row
                .status
                .parse()
                .map_err(StoreError::Corrupt)?,
            decided_at: row.decided_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

struct CastRow {
    id: String,
    session_id: String,
    created_at: String,
    origin_step_id: String,
    title: String,
    sql: String,
    rows_json: String,
    columns_json: Option<String>,
    total_rows: i64,
    truncated: bool,
}

const CAST_COLUMNS: &str =
    "id, session_id, created_at, origin_step_id, title, sql, rows_json, columns_json, \
     total_rows, truncated";

fn read_cast_row(row: &Row<'_>) -> rusqlite::Result<CastRow> {
    Ok(CastRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        created_at: row.get(2)?,
        origin_step_id: row.get(3)?,
        title: row.get(4)?,
        sql: row.get(5)?,
        rows_json: row.get(6)?,
        columns_json: row.get(7)?,
        total_rows: row.get(8)?,
        truncated: row.get(9)?,
    })
}

impl TryFrom<CastRow> for TableCast {
    type Error = StoreError;

    fn try_from(row: CastRow) -> Result<Self, Self::Error> {
        let columns: Option<Vec<SchemaColumn>> = row
            .columns_json
            .map(|text| serde_json::from_str(&text))
            .transpose()?;
        Ok(TableCast {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| StoreError::Corrupt(format!("bad cast id: {e}")))?,
            session_id: SessionId::from_str(&row.session_id)
                .map_err(|e| StoreError::Corrupt(format!("bad session id: {e}")))?,
            created_at: parse_timestamp(&row.created_at)?,
            origin_step_id: StepId::from_str(&row.origin_step_id)
                .map_err(|e| StoreError::Corrupt(format!("bad step id: {e}")))?,
            title: row.title,
            sql: row.sql,
            rows: serde_json::from_str(&row.rows_json)?,
            columns,
            total_rows: row.total_rows.max(0) as usize,
            truncated: row.truncated,
        })
    }
}

fn json_or_null(value: Option<&serde_json::Value>) -> Result<Option<String>, StoreError> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn list_or_null(value: Option<&Vec<String>>) -> Result<Option<String>, StoreError> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

impl SessionStore for SqliteStore {
    fn create_session(
        &self,
        title: Option<&str>,
        context: Option<&SessionContext>,
    ) -> Result<Session, StoreError> {
        let session = Session {
            id: SessionId::generate(),
            title: title.map(str::to_string),
            created_at: Utc::now(),
            context: context.cloned(),
        };

        {
            let conn = self.conn.lock().expect("store lock poisoned");
            conn.execute(
                "INSERT INTO sessions (
                    id, title, created_at,
                    repo_root, repo_name, branch_name, commit_sha, is_dirty, tag
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.id.to_string(),
                    session.title,
                    session.created_at.to_rfc3339(),
                    context.and_then(|c| c.repo_root.clone()),
                    context.and_then(|c| c.repo_name.clone()),
                    context.and_then(|c| c.branch.clone()),
                    context.and_then(|c| c.commit.clone()),
                    context.and_then(|c| c.dirty),
                    context.and_then(|c| c.tag.clone()),
                ],
            )?;
        }
        self.checkpoint();

        let (tx, _) = broadcast::channel(STEP_CHANNEL_CAPACITY);
        self.step_channels
            .lock()
            .expect("store lock poisoned")
            .insert(session.id, tx);

        Ok(session)
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        // Fresh connection so WAL writes from the UI process are visible
        let conn = connect(&self.path)?;
        let row = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id.to_string()],
                read_session_row,
            )
            .optional()?;
        row.map(Session::try_from).transpose()
    }

    fn session_exists(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let conn = connect(&self.path)?;
        SqliteStore::session_exists_on(&conn, session_id)
    }

    fn get_last_active_at(
        &self,
        session_id: SessionId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = connect(&self.path)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM steps WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        raw.as_deref().map(parse_timestamp).transpose()
    }

    fn delete_session(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let deleted = {
            let conn = self.conn.lock().expect("store lock poisoned");
            conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
            )?
        };
        self.checkpoint();
        self.step_channels
            .lock()
            .expect("store lock poisoned")
            .remove(&session_id);
        Ok(deleted > 0)
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = connect(&self.path)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC"
        ))?;
        let rows: Vec<SessionRow> = stmt
            .query_map([], read_session_row)?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(Session::try_from).collect()
    }

    fn add_step(&self, step: &ObservedStep) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().expect("store lock poisoned");
            if !SqliteStore::session_exists_on(&conn, step.session_id)? {
                return Err(StoreError::SessionNotFound(*step.session_id.as_uuid()));
            }

            conn.execute(
                "INSERT INTO steps (
                    id, session_id, created_at, kind, name, status, duration_ms,
                    summary_text, risk_level, warnings_json, target_type, tool_category,
                    sql_text, sql_truncated, sql_classification, policy_rule_ids_json, decision,
                    result_rows_shown, result_rows_total, captured_bytes, error_message,
                    tables_touched_json, args_json, result_json, preview_text, preview_truncated
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
                 )",
                params![
                    step.id.to_string(),
                    step.session_id.to_string(),
                    step.created_at.to_rfc3339(),
                    step.kind.as_str(),
                    step.name,
                    step.status.as_str(),
                    step.duration_ms,
                    step.summary,
                    step.risk_level,
                    list_or_null(step.warnings.as_ref())?,
                    step.target_type,
                    step.tool_category.map(|c| c.as_str()),
                    step.sql.as_ref().map(|s| s.text.clone()),
                    step.sql.as_ref().map(|s| s.truncated),
                    step.sql_classification,
                    list_or_null(step.policy_rule_ids.as_ref())?,
                    step.decision,
                    step.result_rows_shown,
                    step.result_rows_total,
                    step.captured_bytes,
                    step.error_message,
                    list_or_null(step.tables_touched.as_ref())?,
                    json_or_null(step.args.as_ref())?,
                    json_or_null(step.result.as_ref())?,
                    step.preview.as_ref().map(|p| p.text.clone()),
                    step.preview.as_ref().map(|p| p.truncated),
                ],
            )?;
        }
        self.checkpoint();
        self.notify_step(step);

        let count = self.step_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PRUNE_EVERY_STEPS == 0 {
            self.schedule_prune();
        }
        Ok(())
    }

    fn update_step(&self, step_id: StepId, update: &StepUpdate) -> Result<bool, StoreError> {
        let updated_row = {
            let conn = self.conn.lock().expect("store lock poisoned");
            let existing = conn
                .query_row(
                    "SELECT summary_text, status, args_json FROM steps WHERE id = ?1",
                    params![step_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((summary, status, args_json)) = existing else {
                return Ok(false);
            };

            let new_summary = update.summary.clone().or(summary);
            let new_status = update
                .status
                .map(|s| s.as_str().to_string())
                .unwrap_or(status);
            let new_args = if let Some(merge) = &update.args {
                let mut base = match parse_json_column(args_json)? {
                    Some(serde_json::Value::Object(map)) => map,
                    _ => serde_json::Map::new(),
                };
                for (key, value) in merge {
                    base.insert(key.clone(), value.clone());
                }
                Some(serde_json::to_string(&serde_json::Value::Object(base))?)
            } else {
                args_json
            };

            conn.execute(
                "UPDATE steps SET summary_text = ?1, status = ?2, args_json = ?3 WHERE id = ?4",
                params![new_summary, new_status, new_args, step_id.to_string()],
            )?;

            conn.query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
                params![step_id.to_string()],
                read_step_row,
            )
            .optional()?
        };
        self.checkpoint();

        if let Some(row) = updated_row {
            let step = ObservedStep::try_from(row)?;
            self.notify_step(&step);
        }
        Ok(true)
    }

    fn list_steps(&self, session_id: SessionId) -> Result<Vec<ObservedStep>, StoreError> {
        let conn = connect(&self.path)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE session_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows: Vec<StepRow> = stmt
            .query_map(params![session_id.to_string()], read_step_row)?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(ObservedStep::try_from).collect()
    }

    fn subscribe_steps(&self, session_id: SessionId) -> Option<broadcast::Receiver<ObservedStep>> {
        let mut channels = self.step_channels.lock().expect("store lock poisoned");
        Some(
            channels
                .entry(session_id)
                .or_insert_with(|| broadcast::channel(STEP_CHANNEL_CAPACITY).0)
                .subscribe(),
        )
    }

    fn add_cast(&self, cast: &TableCast) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().expect("store lock poisoned");
            if !SqliteStore::session_exists_on(&conn, cast.session_id)? {
                return Err(StoreError::SessionNotFound(*cast.session_id.as_uuid()));
            }
            conn.execute(
                "INSERT INTO casts (
                    id, session_id, created_at, origin_step_id, title, sql,
                    rows_json, columns_json, total_rows, truncated
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    cast.id.to_string(),
                    cast.session_id.to_string(),
                    cast.created_at.to_rfc3339(),
                    cast.origin_step_id.to_string(),
                    cast.title,
                    cast.sql,
                    serde_json::to_string(&cast.rows)?,
                    cast.columns
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    cast.total_rows as i64,
                    cast.truncated,
                ],
            )?;
        }
        self.checkpoint();
        Ok(())
    }

    fn get_cast(&self, cast_id: Uuid) -> Result<Option<TableCast>, StoreError> {
        let conn = connect(&self.path)?;
        let row = conn
            .query_row(
                &format!("SELECT {CAST_COLUMNS} FROM casts WHERE id = ?1"),
                params![cast_id.to_string()],
                read_cast_row,
            )
            .optional()?;
        row.map(TableCast::try_from).transpose()
    }

    fn list_casts(&self, session_id: SessionId) -> Result<Vec<TableCast>, StoreError> {
        let conn = connect(&self.path)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAST_COLUMNS} FROM casts WHERE session_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows: Vec<CastRow> = stmt
            .query_map(params![session_id.to_string()], read_cast_row)?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(TableCast::try_from).collect()
    }

    fn create_pending_request(&self, request: &PendingRequest) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().expect("store lock poisoned");
            if !SqliteStore::session_exists_on(&conn, request.session_id)? {
                return Err(StoreError::SessionNotFound(*request.session_id.as_uuid()));
            }
            conn.execute(
                "INSERT INTO pending_requests (
                    id, session_id, created_at, tool_name, arguments_json,
                    classification, risk_level, reason, blocker_step_id, status, decided_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    request.id.to_string(),
                    request.session_id.to_string(),
                    request.created_at.to_rfc3339(),
                    request.tool_name,
                    json_or_null(request.arguments.as_ref())?,
                    request.classification,
                    request.risk_level,
                    request.reason,
                    request.blocker_step_id.map(|s| s.to_string()),
                    request.status.as_str(),
                    request.decided_at.map(|t| t.to_rfc3339()),
                ],
            )?;
        }
        self.checkpoint();
        Ok(())
    }

    fn get_pending_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<PendingRequest>, StoreError> {
        // Fresh connection: the decision may have been written by the UI process
        let conn = connect(&self.path)?;
        let row = conn
            .query_row(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_requests WHERE id = ?1"),
                params![request_id.to_string()],
                read_pending_row,
            )
            .optional()?;
        row.map(PendingRequest::try_from).transpose()
    }

    fn list_pending_requests(
        &self,
        session_id: SessionId,
        status: Option<PendingStatus>,
    ) -> Result<Vec<PendingRequest>, StoreError> {
        let conn = connect(&self.path)?;
        let rows: Vec<PendingRow> = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_requests \
                     WHERE session_id = ?1 AND status = ?2 ORDER BY created_at ASC"
                ))?;
                let rows = stmt
                    .query_map(
                        params![session_id.to_string(), status.as_str()],
                        read_pending_row,
                    )?
                    .collect::<Result<_, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_requests \
                     WHERE session_id = ?1 ORDER BY created_at ASC"
                ))?;
                let rows = stmt
                    .query_map(params![session_id.to_string()], read_pending_row)?
                    .collect::<Result<_, _>>()?;
                rows
            }
        };
        rows.into_iter().map(PendingRequest::try_from).collect()
    }

    fn decide_pending_request(
        &self,
        request_id: RequestId,
        status: PendingStatus,
    ) -> Result<Option<PendingRequest>, StoreError> {
        if !status.is_terminal() {
            return self.get_pending_request(request_id);
        }

        {
            let conn = self.conn.lock().expect("store lock poisoned");
            let row = conn
                .query_row(
                    &format!("SELECT {PENDING_COLUMNS} FROM pending_requests WHERE id = ?1"),
                    params![request_id.to_string()],
                    read_pending_row,
                )
                .optional()?;

            let Some(row) = row else {
                return Ok(None);
            };

            // Idempotent: if already decided, keep existing status/decided_at.
            let existing = PendingRequest::try_from(row)?;
            if existing.status.is_terminal() {
                return Ok(Some(existing));
            }

            conn.execute(
                "UPDATE pending_requests SET status = ?1, decided_at = ?2 WHERE id = ?3",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    request_id.to_string()
                ],
            )?;
        }
        self.checkpoint();
        self.get_pending_request(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_core::models::{StepKind, StepStatus, TruncatedText};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("sessions.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn session_roundtrip_with_context() {
        let (_dir, store) = open_temp();
        let context = SessionContext {
            repo_name: Some("acme".to_string()),
            branch: Some("main".to_string()),
            dirty: Some(true),
            ..SessionContext::default()
        };
        let session = store.create_session(Some("title"), Some(&context)).unwrap();

        let loaded = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("title"));
        let loaded_context = loaded.context.unwrap();
        assert_eq!(loaded_context.repo_name.as_deref(), Some("acme"));
        assert_eq!(loaded_context.dirty, Some(true));
    }

    #[test]
    fn step_roundtrip_preserves_all_fields() {
        let (_dir, store) = open_temp();
        let session = store.create_session(None, None).unwrap();

        let mut step = ObservedStep::new(session.id, StepKind::ToolCall, "query");
        step.status = StepStatus::Error;
        step.duration_ms = Some(42);
        step.risk_level = Some("CRITICAL".to_string());
        step.warnings = Some(vec!["DML".to_string(), "DELETE_NO_WHERE".to_string()]);
        step.sql = Some(TruncatedText {
            text: "DELETE FROM t".to_string(),
            truncated: false,
        });
        step.sql_classification = Some("destructive".to_string());
        step.policy_rule_ids = Some(vec!["block_dml".to_string()]);
        step.decision = Some("pending".to_string());
        step.args = Some(serde_json::json!({"sql": "DELETE FROM t"}));
        step.preview = Some(TruncatedText {
            text: "[]".to_string(),
            truncated: true,
        });
        store.add_step(&step).unwrap();

        let steps = store.list_steps(session.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0], step);
    }

    #[test]
    fn last_active_tracks_latest_step() {
        let (_dir, store) = open_temp();
        let session = store.create_session(None, None).unwrap();
        assert!(store.get_last_active_at(session.id).unwrap().is_none());

        let step = ObservedStep::new(session.id, StepKind::ToolCall, "query");
        store.add_step(&step).unwrap();
        let last = store.get_last_active_at(session.id).unwrap().unwrap();
        // RFC3339 roundtrip keeps sub-second precision
        assert_eq!(last.timestamp(), step.created_at.timestamp());
    }

    #[test]
    fn decide_is_idempotent_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        let store_a = SqliteStore::open(&path).unwrap();
        let session = store_a.create_session(None, None).unwrap();
        let request = PendingRequest::new(session.id, "query", None, None, None, None, None);
        store_a.create_pending_request(&request).unwrap();

        // A second handle simulates the approval UI process
        let store_b = SqliteStore::open(&path).unwrap();
        let decided = store_b
            .decide_pending_request(request.id, PendingStatus::Denied)
            .unwrap()
            .unwrap();
        assert_eq!(decided.status, PendingStatus::Denied);
        let decided_at = decided.decided_at.unwrap();

        // The first handle observes the decision and cannot overwrite it
        let seen = store_a.get_pending_request(request.id).unwrap().unwrap();
        assert_eq!(seen.status, PendingStatus::Denied);
        let again = store_a
            .decide_pending_request(request.id, PendingStatus::Allowed)
            .unwrap()
            .unwrap();
        assert_eq!(again.status, PendingStatus::Denied);
        assert_eq!(
            again.decided_at.unwrap().timestamp_millis(),
            decided_at.timestamp_millis()
        );
    }

    #[test]
    fn delete_session_cascades() {
        let (_dir, store) = open_temp();
        let session = store.create_session(None, None).unwrap();
        let step = ObservedStep::new(session.id, StepKind::ToolCall, "query");
        store.add_step(&step).unwrap();
        let request = PendingRequest::new(session.id, "query", None, None, None, None, None);
        store.create_pending_request(&request).unwrap();

        assert!(store.delete_session(session.id).unwrap());
        assert!(!store.session_exists(session.id).unwrap());
        assert!(store.list_steps(session.id).unwrap().is_empty());
        assert!(store.get_pending_request(request.id).unwrap().is_none());
    }

    #[test]
    fn add_step_without_session_is_session_not_found() {
        let (_dir, store) = open_temp();
        let step = ObservedStep::new(SessionId::generate(), StepKind::ToolCall, "query");
        assert!(matches!(
            store.add_step(&step),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn cast_roundtrip() {
        let (_dir, store) = open_temp();
        let session = store.create_session(None, None).unwrap();
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), serde_json::json!(1));
        let cast = TableCast {
            id: Uuid::new_v4(),
            session_id: session.id,
            created_at: Utc::now(),
            origin_step_id: StepId::generate(),
            title: "orders".to_string(),
            sql: "SELECT * FROM orders".to_string(),
            rows: vec![row],
            columns: Some(vec![SchemaColumn {
                name: "id".to_string(),
                column_type: Some("integer".to_string()),
            }]),
            total_rows: 1,
            truncated: false,
        };
        store.add_cast(&cast).unwrap();

        let loaded = store.get_cast(cast.id).unwrap().unwrap();
        assert_eq!(loaded.title, "orders");
        assert_eq!(loaded.rows.len(), 1);
        assert_eq!(store.list_casts(session.id).unwrap().len(), 1);
    }
}
