//! SQLite-backed persistence kernel.
//!
//! The kernel is the sole coordination point between independently invoked
//! workers: every claim is a single conditional UPDATE and every lock is a
//! unique-constraint insert, so no caller ever needs shared memory or a
//! separate lock service. Expected contention (a held lock, an already
//! claimed row) is reported in return values, never as errors.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed lifetime of a human approval token.
pub const APPROVAL_TTL_SECS: u64 = 48 * 3600;
/// Default lock lifetime when callers have no better idea.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_i64(self) -> i64 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 1,
            TaskPriority::High => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => TaskPriority::High,
            1 => TaskPriority::Medium,
            _ => TaskPriority::Low,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TaskRow {
    pub id: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub priority: TaskPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub available_at: String,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IntentRow {
    pub id: String,
    pub decision_id: String,
    pub intent_type: String,
    pub status: String,
    pub payload: serde_json::Value,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub created: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn rfc3339_in(delta: Duration) -> String {
    let dt = chrono::Utc::now()
        + chrono::Duration::from_std(delta).unwrap_or_else(|_| chrono::Duration::seconds(0));
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn decision_key(decision_id: &str) -> String {
    let mut h = sha2::Sha256::new();
    h.update(decision_id.as_bytes());
    format!("{:x}", h.finalize())
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        let db_path = dir.join("steward.sqlite");
        let need_init = !db_path.exists();
        let conn = Connection::open(&db_path)?;
        // Pragmas tuned for independently invoked workers sharing one file
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let busy_ms: u64 = std::env::var("STEWARD_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(Duration::from_millis(busy_ms))?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        if need_init {
            Self::init_schema(&conn)?;
        }
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id TEXT PRIMARY KEY,
              action TEXT NOT NULL,
              payload TEXT NOT NULL,
              dedup_key TEXT,
              status TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              max_attempts INTEGER NOT NULL,
              priority INTEGER NOT NULL DEFAULT 1,
              last_error TEXT,
              available_at TEXT NOT NULL,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, available_at);
            -- At most one active task per dedup key; the insert itself is the guard.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_dedup_active ON tasks(dedup_key)
              WHERE dedup_key IS NOT NULL AND status IN ('pending','reserved');

            CREATE TABLE IF NOT EXISTS execution_intents (
              id TEXT PRIMARY KEY,
              decision_id TEXT NOT NULL,
              intent_type TEXT NOT NULL,
              status TEXT NOT NULL,
              payload TEXT NOT NULL,
              claimed_by TEXT,
              claimed_at TEXT,
              completed_at TEXT,
              error TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_intents_claim ON execution_intents(status, intent_type);

            CREATE TABLE IF NOT EXISTS locks (
              lock_name TEXT PRIMARY KEY,
              created TEXT NOT NULL,
              expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approvals (
              decision_key TEXT PRIMARY KEY,
              approved_by TEXT NOT NULL,
              approved_at TEXT NOT NULL,
              expires_at TEXT NOT NULL
            );

            -- Append-only; rows leave only through prune_snapshots.
            CREATE TABLE IF NOT EXISTS snapshots (
              id TEXT PRIMARY KEY,
              entity_type TEXT NOT NULL,
              entity_id TEXT NOT NULL,
              data TEXT NOT NULL,
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_entity ON snapshots(entity_type, entity_id);

            CREATE TABLE IF NOT EXISTS state_kv (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analysis_signals (
              intent_id TEXT PRIMARY KEY,
              signals TEXT NOT NULL,
              created TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        let busy_ms: u64 = std::env::var("STEWARD_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(Duration::from_millis(busy_ms))?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------- Tasks ----------

    /// Enqueue a task. When an active (pending/reserved) task already exists
    /// for the dedup key, returns its id with `deduped = true` and creates
    /// no second row.
    pub fn enqueue_task(
        &self,
        action: &str,
        payload: &serde_json::Value,
        dedup_key: Option<&str>,
        priority: TaskPriority,
        max_attempts: u32,
    ) -> Result<(String, bool)> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        let payload_s = serde_json::to_string(payload).unwrap_or("{}".to_string());
        let res = conn.execute(
            "INSERT INTO tasks(id,action,payload,dedup_key,status,attempts,max_attempts,priority,available_at,created,updated) \
             VALUES(?,?,?,?,'pending',0,?,?,?,?,?)",
            params![
                id,
                action,
                payload_s,
                dedup_key,
                max_attempts as i64,
                priority.as_i64(),
                now,
                now,
                now
            ],
        );
        match res {
            Ok(_) => Ok((id, false)),
            Err(err) if is_unique_violation(&err) && dedup_key.is_some() => {
                let key = dedup_key.unwrap_or_default();
                let existing: Option<String> = conn
                    .prepare(
                        "SELECT id FROM tasks WHERE dedup_key=? AND status IN ('pending','reserved') LIMIT 1",
                    )?
                    .query_row([key], |row| row.get(0))
                    .optional()?;
                existing
                    .map(|eid| (eid, true))
                    .ok_or_else(|| anyhow!("dedup conflict without an active task row"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reserve the next due task: one atomic conditional update, highest
    /// priority first, FIFO within a priority. No two callers can reserve
    /// the same row.
    pub fn reserve_next_task(&self) -> Result<Option<TaskRow>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let mut stmt = conn.prepare(
            "UPDATE tasks SET status='reserved', updated=?1 WHERE id = (
                 SELECT id FROM tasks WHERE status='pending' AND available_at <= ?1
                 ORDER BY priority DESC, created ASC, rowid ASC LIMIT 1
             ) RETURNING id,action,payload,dedup_key,status,attempts,max_attempts,priority,last_error,available_at,created,updated",
        )?;
        let mut rows = stmt.query(params![now])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(Self::task_from_row(row)?));
        }
        Ok(None)
    }

    /// Terminal success; only valid from the reserved state.
    pub fn complete_task(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute(
            "UPDATE tasks SET status='completed', updated=? WHERE id=? AND status='reserved'",
            params![now, id],
        )?;
        Ok(n > 0)
    }

    /// Record a failed attempt. Reschedules to pending after `retry_delay`
    /// while attempts remain, otherwise marks the task terminally failed.
    /// Returns the resulting status, or None when the task was not reserved.
    pub fn fail_task(
        &self,
        id: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let retry_at = rfc3339_in(retry_delay);
        let mut stmt = conn.prepare(
            "UPDATE tasks SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                 available_at = CASE WHEN attempts + 1 >= max_attempts THEN available_at ELSE ?2 END,
                 last_error = ?3, updated = ?1
             WHERE id = ?4 AND status='reserved'
             RETURNING status",
        )?;
        let status: Option<String> = stmt
            .query_row(params![now, retry_at, error, id], |row| row.get(0))
            .optional()?;
        Ok(status)
    }

    /// Administrative override: make a stuck or failed task runnable now.
    pub fn retry_task_now(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute(
            "UPDATE tasks SET status='pending', available_at=?1, updated=?1 \
             WHERE id=?2 AND status IN ('pending','reserved','failed')",
            params![now, id],
        )?;
        Ok(n > 0)
    }

    pub fn list_tasks(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRow>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let sql_filtered = "SELECT id,action,payload,dedup_key,status,attempts,max_attempts,priority,last_error,available_at,created,updated \
             FROM tasks WHERE status=? ORDER BY created DESC LIMIT ? OFFSET ?";
        let sql_all = "SELECT id,action,payload,dedup_key,status,attempts,max_attempts,priority,last_error,available_at,created,updated \
             FROM tasks ORDER BY created DESC LIMIT ? OFFSET ?";
        let mut stmt_filtered;
        let mut stmt_all;
        let mut rows = if let Some(st) = status {
            stmt_filtered = conn.prepare(sql_filtered)?;
            stmt_filtered.query(params![st, limit, offset])?
        } else {
            stmt_all = conn.prepare(sql_all)?;
            stmt_all.query(params![limit, offset])?
        };
        while let Some(row) = rows.next()? {
            out.push(Self::task_from_row(row)?);
        }
        Ok(out)
    }

    pub fn count_tasks_by_state(&self, state: &str) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .prepare("SELECT COUNT(1) FROM tasks WHERE status=?")?
            .query_row([state], |row| row.get(0))?;
        Ok(n)
    }

    fn task_from_row(row: &rusqlite::Row<'_>) -> Result<TaskRow> {
        let payload_s: String = row.get(2)?;
        let payload = serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({}));
        Ok(TaskRow {
            id: row.get(0)?,
            action: row.get(1)?,
            payload,
            dedup_key: row.get(3)?,
            status: row.get(4)?,
            attempts: row.get(5)?,
            max_attempts: row.get(6)?,
            priority: TaskPriority::from_i64(row.get(7)?),
            last_error: row.get(8)?,
            available_at: row.get(9)?,
            created: row.get(10)?,
            updated: row.get(11)?,
        })
    }

    // ---------- Execution intents ----------

    pub fn insert_intent(
        &self,
        decision_id: &str,
        intent_type: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        let payload_s = serde_json::to_string(payload).unwrap_or("{}".to_string());
        conn.execute(
            "INSERT INTO execution_intents(id,decision_id,intent_type,status,payload,created,updated) \
             VALUES(?,?,?,'pending',?,?,?)",
            params![
                id,
                decision_id,
                intent_type.to_ascii_lowercase(),
                payload_s,
                now,
                now
            ],
        )?;
        Ok(id)
    }

    /// Claim one pending intent of the given type for `worker_id`: a single
    /// conditional update, so two workers can never claim the same intent.
    pub fn claim_next_intent(
        &self,
        intent_type: &str,
        worker_id: &str,
    ) -> Result<Option<IntentRow>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let mut stmt = conn.prepare(
            "UPDATE execution_intents SET status='running', claimed_by=?2, claimed_at=?1, updated=?1 \
             WHERE id = (
                 SELECT id FROM execution_intents WHERE status='pending' AND intent_type=?3 \
                 ORDER BY created ASC, rowid ASC LIMIT 1
             ) RETURNING id,decision_id,intent_type,status,payload,claimed_by,claimed_at,completed_at,error,created,updated",
        )?;
        let mut rows = stmt.query(params![now, worker_id, intent_type.to_ascii_lowercase()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(Self::intent_from_row(row)?));
        }
        Ok(None)
    }

    pub fn get_intent(&self, id: &str) -> Result<Option<IntentRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,decision_id,intent_type,status,payload,claimed_by,claimed_at,completed_at,error,created,updated \
             FROM execution_intents WHERE id=? LIMIT 1",
        )?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(Self::intent_from_row(row)?));
        }
        Ok(None)
    }

    /// Succeeds only while `worker_id` still holds the running claim.
    pub fn mark_intent_completed(&self, id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute(
            "UPDATE execution_intents SET status='completed', completed_at=?1, updated=?1 \
             WHERE id=?2 AND status='running' AND claimed_by=?3",
            params![now, id, worker_id],
        )?;
        Ok(n > 0)
    }

    /// Same ownership rule as [`Kernel::mark_intent_completed`].
    pub fn mark_intent_failed(&self, id: &str, worker_id: &str, message: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute(
            "UPDATE execution_intents SET status='failed', error=?4, completed_at=?1, updated=?1 \
             WHERE id=?2 AND status='running' AND claimed_by=?3",
            params![now, id, worker_id, message],
        )?;
        Ok(n > 0)
    }

    pub fn list_intents(&self, status: Option<&str>, limit: i64) -> Result<Vec<IntentRow>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let sql_filtered = "SELECT id,decision_id,intent_type,status,payload,claimed_by,claimed_at,completed_at,error,created,updated \
             FROM execution_intents WHERE status=? ORDER BY created DESC LIMIT ?";
        let sql_all = "SELECT id,decision_id,intent_type,status,payload,claimed_by,claimed_at,completed_at,error,created,updated \
             FROM execution_intents ORDER BY created DESC LIMIT ?";
        let mut stmt_filtered;
        let mut stmt_all;
        let mut rows = if let Some(st) = status {
            stmt_filtered = conn.prepare(sql_filtered)?;
            stmt_filtered.query(params![st, limit])?
        } else {
            stmt_all = conn.prepare(sql_all)?;
            stmt_all.query(params![limit])?
        };
        while let Some(row) = rows.next()? {
            out.push(Self::intent_from_row(row)?);
        }
        Ok(out)
    }

    pub fn count_intents_by_state(&self, state: &str) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .prepare("SELECT COUNT(1) FROM execution_intents WHERE status=?")?
            .query_row([state], |row| row.get(0))?;
        Ok(n)
    }

    fn intent_from_row(row: &rusqlite::Row<'_>) -> Result<IntentRow> {
        let payload_s: String = row.get(4)?;
        let payload = serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({}));
        Ok(IntentRow {
            id: row.get(0)?,
            decision_id: row.get(1)?,
            intent_type: row.get(2)?,
            status: row.get(3)?,
            payload,
            claimed_by: row.get(5)?,
            claimed_at: row.get(6)?,
            completed_at: row.get(7)?,
            error: row.get(8)?,
            created: row.get(9)?,
            updated: row.get(10)?,
        })
    }

    // ---------- Locks ----------

    /// Named TTL mutex over the store. Expired rows are reaped first; the
    /// primary-key insert is the exclusivity guard, and a constraint
    /// violation is the busy signal rather than an error. Refuses to acquire
    /// while the emergency stop is active.
    pub fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<bool> {
        if steward_core::emergency::active() {
            return Ok(false);
        }
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute("DELETE FROM locks WHERE expires_at <= ?", [now.as_str()])?;
        let expires = rfc3339_in(ttl);
        match conn.execute(
            "INSERT INTO locks(lock_name,created,expires_at) VALUES(?,?,?)",
            params![name, now, expires],
        ) {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Idempotent; releasing an unheld lock is fine.
    pub fn release_lock(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM locks WHERE lock_name=?", [name])?;
        Ok(())
    }

    pub fn is_locked(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let hit: Option<String> = conn
            .prepare("SELECT lock_name FROM locks WHERE lock_name=? AND expires_at > ? LIMIT 1")?
            .query_row(params![name, now], |row| row.get(0))
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn cleanup_expired_locks(&self) -> Result<usize> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute("DELETE FROM locks WHERE expires_at <= ?", [now.as_str()])?;
        Ok(n)
    }

    // ---------- Approvals ----------

    pub fn insert_approval(&self, decision_id: &str, approved_by: &str) -> Result<()> {
        self.insert_approval_with_ttl(decision_id, approved_by, APPROVAL_TTL_SECS)
    }

    fn insert_approval_with_ttl(
        &self,
        decision_id: &str,
        approved_by: &str,
        ttl_secs: u64,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let expires = rfc3339_in(Duration::from_secs(ttl_secs));
        conn.execute(
            "INSERT OR REPLACE INTO approvals(decision_key,approved_by,approved_at,expires_at) VALUES(?,?,?,?)",
            params![decision_key(decision_id), approved_by, now, expires],
        )?;
        Ok(())
    }

    /// `(approved_by, approved_at)` when a live token exists.
    pub fn find_valid_approval(&self, decision_id: &str) -> Result<Option<(String, String)>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let hit = conn
            .prepare(
                "SELECT approved_by,approved_at FROM approvals WHERE decision_key=? AND expires_at > ? LIMIT 1",
            )?
            .query_row(params![decision_key(decision_id), now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;
        Ok(hit)
    }

    pub fn delete_approval(&self, decision_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM approvals WHERE decision_key=?",
            [decision_key(decision_id)],
        )?;
        Ok(n > 0)
    }

    pub fn purge_expired_approvals(&self) -> Result<usize> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute(
            "DELETE FROM approvals WHERE expires_at <= ?",
            [now.as_str()],
        )?;
        Ok(n)
    }

    // ---------- Snapshots ----------

    pub fn insert_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: &serde_json::Value,
    ) -> Result<String> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        let data_s = serde_json::to_string(data).unwrap_or("{}".to_string());
        conn.execute(
            "INSERT INTO snapshots(id,entity_type,entity_id,data,created) VALUES(?,?,?,?,?)",
            params![id, entity_type, entity_id, data_s, now],
        )?;
        Ok(id)
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,entity_type,entity_id,data,created FROM snapshots WHERE id=? LIMIT 1",
        )?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(Self::snapshot_from_row(row)?));
        }
        Ok(None)
    }

    pub fn latest_snapshot(&self, entity_type: &str, entity_id: &str) -> Result<Option<SnapshotRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,entity_type,entity_id,data,created FROM snapshots \
             WHERE entity_type=? AND entity_id=? ORDER BY created DESC, rowid DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![entity_type, entity_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(Self::snapshot_from_row(row)?));
        }
        Ok(None)
    }

    pub fn list_snapshots(
        &self,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let sql_entity = "SELECT id,entity_type,entity_id,data,created FROM snapshots \
             WHERE entity_type=? AND entity_id=? ORDER BY created DESC, rowid DESC LIMIT ?";
        let sql_type = "SELECT id,entity_type,entity_id,data,created FROM snapshots \
             WHERE entity_type=? ORDER BY created DESC, rowid DESC LIMIT ?";
        let sql_all = "SELECT id,entity_type,entity_id,data,created FROM snapshots \
             ORDER BY created DESC, rowid DESC LIMIT ?";
        let mut stmt_entity;
        let mut stmt_type;
        let mut stmt_all;
        let mut rows = match (entity_type, entity_id) {
            (Some(t), Some(e)) => {
                stmt_entity = conn.prepare(sql_entity)?;
                stmt_entity.query(params![t, e, limit])?
            }
            (Some(t), None) => {
                stmt_type = conn.prepare(sql_type)?;
                stmt_type.query(params![t, limit])?
            }
            _ => {
                stmt_all = conn.prepare(sql_all)?;
                stmt_all.query(params![limit])?
            }
        };
        while let Some(row) = rows.next()? {
            out.push(Self::snapshot_from_row(row)?);
        }
        Ok(out)
    }

    /// Retention cleanup, the only path that deletes snapshot rows.
    pub fn prune_snapshots(&self, older_than: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM snapshots WHERE created < ?", [older_than])?;
        Ok(n)
    }

    fn snapshot_from_row(row: &rusqlite::Row<'_>) -> Result<SnapshotRow> {
        let data_s: String = row.get(3)?;
        let data = serde_json::from_str(&data_s).unwrap_or(serde_json::json!({}));
        Ok(SnapshotRow {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            data,
            created: row.get(4)?,
        })
    }

    // ---------- Typed state flags ----------

    pub fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .prepare("SELECT value FROM state_kv WHERE key=? LIMIT 1")?
            .query_row([key], |row| row.get(0))
            .optional()?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub fn set_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let value_s = serde_json::to_string(value).unwrap_or("null".to_string());
        conn.execute(
            "INSERT OR REPLACE INTO state_kv(key,value,updated) VALUES(?,?,?)",
            params![key, value_s, now],
        )?;
        Ok(())
    }

    // ---------- Analysis signals ----------

    /// Store signals for an intent once; a second store for the same intent
    /// id is a silent success (returns false, no overwrite).
    pub fn insert_analysis_signals(
        &self,
        intent_id: &str,
        signals: &serde_json::Value,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let signals_s = serde_json::to_string(signals).unwrap_or("{}".to_string());
        let n = conn.execute(
            "INSERT OR IGNORE INTO analysis_signals(intent_id,signals,created) VALUES(?,?,?)",
            params![intent_id, signals_s, now],
        )?;
        Ok(n > 0)
    }

    pub fn get_analysis_signals(&self, intent_id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .prepare("SELECT signals FROM analysis_signals WHERE intent_id=? LIMIT 1")?
            .query_row([intent_id], |row| row.get(0))
            .optional()?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    pub async fn reserve_next_task_async(&self) -> Result<Option<TaskRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.reserve_next_task())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn enqueue_task_async(
        &self,
        action: &str,
        payload: &serde_json::Value,
        dedup_key: Option<&str>,
        priority: TaskPriority,
        max_attempts: u32,
    ) -> Result<(String, bool)> {
        let k = self.clone();
        let action = action.to_string();
        let payload = payload.clone();
        let dedup = dedup_key.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || {
            k.enqueue_task(&action, &payload, dedup.as_deref(), priority, max_attempts)
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn complete_task_async(&self, id: &str) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.complete_task(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn fail_task_async(
        &self,
        id: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<Option<String>> {
        let k = self.clone();
        let id = id.to_string();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || k.fail_task(&id, &error, retry_delay))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn claim_next_intent_async(
        &self,
        intent_type: &str,
        worker_id: &str,
    ) -> Result<Option<IntentRow>> {
        let k = self.clone();
        let t = intent_type.to_string();
        let w = worker_id.to_string();
        tokio::task::spawn_blocking(move || k.claim_next_intent(&t, &w))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_intent_async(&self, id: &str) -> Result<Option<IntentRow>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.get_intent(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn mark_intent_completed_async(&self, id: &str, worker_id: &str) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        let w = worker_id.to_string();
        tokio::task::spawn_blocking(move || k.mark_intent_completed(&id, &w))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn mark_intent_failed_async(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
    ) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        let w = worker_id.to_string();
        let m = message.to_string();
        tokio::task::spawn_blocking(move || k.mark_intent_failed(&id, &w, &m))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_state_async(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let k = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || k.get_state(&key))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn set_state_async(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let k = self.clone();
        let key = key.to_string();
        let value = value.clone();
        tokio::task::spawn_blocking(move || k.set_state(&key, &value))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn insert_analysis_signals_async(
        &self,
        intent_id: &str,
        signals: &serde_json::Value,
    ) -> Result<bool> {
        let k = self.clone();
        let id = intent_id.to_string();
        let signals = signals.clone();
        tokio::task::spawn_blocking(move || k.insert_analysis_signals(&id, &signals))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn insert_intent_async(
        &self,
        decision_id: &str,
        intent_type: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let k = self.clone();
        let d = decision_id.to_string();
        let t = intent_type.to_string();
        let payload = payload.clone();
        tokio::task::spawn_blocking(move || k.insert_intent(&d, &t, &payload))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn retry_task_now_async(&self, id: &str) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.retry_task_now(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn acquire_lock_async(&self, name: &str, ttl: Duration) -> Result<bool> {
        let k = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || k.acquire_lock(&name, ttl))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn release_lock_async(&self, name: &str) -> Result<()> {
        let k = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || k.release_lock(&name))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn insert_approval_async(&self, decision_id: &str, approved_by: &str) -> Result<()> {
        let k = self.clone();
        let d = decision_id.to_string();
        let by = approved_by.to_string();
        tokio::task::spawn_blocking(move || k.insert_approval(&d, &by))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn find_valid_approval_async(
        &self,
        decision_id: &str,
    ) -> Result<Option<(String, String)>> {
        let k = self.clone();
        let d = decision_id.to_string();
        tokio::task::spawn_blocking(move || k.find_valid_approval(&d))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn delete_approval_async(&self, decision_id: &str) -> Result<bool> {
        let k = self.clone();
        let d = decision_id.to_string();
        tokio::task::spawn_blocking(move || k.delete_approval(&d))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn insert_snapshot_async(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: &serde_json::Value,
    ) -> Result<String> {
        let k = self.clone();
        let t = entity_type.to_string();
        let e = entity_id.to_string();
        let data = data.clone();
        tokio::task::spawn_blocking(move || k.insert_snapshot(&t, &e, &data))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_snapshot_async(&self, id: &str) -> Result<Option<SnapshotRow>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.get_snapshot(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn latest_snapshot_async(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<SnapshotRow>> {
        let k = self.clone();
        let t = entity_type.to_string();
        let e = entity_id.to_string();
        tokio::task::spawn_blocking(move || k.latest_snapshot(&t, &e))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn cleanup_expired_locks_async(&self) -> Result<usize> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.cleanup_expired_locks())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn purge_expired_approvals_async(&self) -> Result<usize> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.purge_expired_approvals())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn prune_snapshots_async(&self, older_than: &str) -> Result<usize> {
        let k = self.clone();
        let cutoff = older_than.to_string();
        tokio::task::spawn_blocking(move || k.prune_snapshots(&cutoff))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}
