//! Async SQLite-backed state store: the system of record for processes,
//! tasks, QA attempts, and the audit log.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use vq_core::domain::{
    AnalysisType, AuditEvent, AuditSeverity, Process, ProcessStatus, QaAttempt, QaOutcome, QaTier,
    Task, TaskStatus, TaskTotals,
};

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).expect("valid date").with_timezone(&Utc)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("process {0} not found")]
    ProcessNotFound(Uuid),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("transition rejected: task {task} is in status {from:?}, expected {expected:?}")]
    TransitionConflict { task: Uuid, from: TaskStatus, expected: TaskStatus },
    #[error("lease conflict: task {0} is held by another owner")]
    LeaseConflict(Uuid),
}

#[derive(Debug, Clone)]
pub struct ProcessTaskSummary {
    pub distinct_media: u32,
    pub completed_analysis_types: Vec<String>,
}

/// The State Store — async SQLite behind a single serialized connection,
/// matching spec §4.D's "single-writer, serialized transactions" model.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA cache_size=-64000;
                    PRAGMA mmap_size=268435456;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS processes (
                        id                      TEXT PRIMARY KEY,
                        external_client_id      TEXT NOT NULL,
                        external_project_id     TEXT NOT NULL,
                        status                  TEXT NOT NULL,
                        total                   INTEGER NOT NULL,
                        completed               INTEGER NOT NULL,
                        failed                  INTEGER NOT NULL,
                        manual_review           INTEGER NOT NULL,
                        created_at              TEXT NOT NULL,
                        completed_at            TEXT,
                        config_snapshot         TEXT NOT NULL,
                        media_refs              TEXT NOT NULL DEFAULT '[]',
                        processing_status_sent  INTEGER NOT NULL,
                        completed_status_sent   INTEGER NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_processes_status ON processes(status);

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                 TEXT PRIMARY KEY,
                        process_id         TEXT NOT NULL,
                        media_id           TEXT NOT NULL,
                        analysis_type      TEXT NOT NULL,
                        status             TEXT NOT NULL,
                        qa_attempts_t0     INTEGER NOT NULL,
                        qa_attempts_t1     INTEGER NOT NULL,
                        qa_attempts_t2     INTEGER NOT NULL,
                        confidence         REAL,
                        last_error         TEXT,
                        created_at         TEXT NOT NULL,
                        updated_at         TEXT NOT NULL,
                        raw_output_path    TEXT,
                        result             TEXT,
                        profile_version    INTEGER,
                        lease_owner        TEXT,
                        lease_deadline     TEXT,
                        submission_sent    INTEGER NOT NULL,
                        attempt_count      INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_process ON tasks(process_id);
                    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_lease_deadline ON tasks(lease_deadline);

                    CREATE TABLE IF NOT EXISTS qa_attempts (
                        id                    TEXT PRIMARY KEY,
                        task_id               TEXT NOT NULL,
                        tier                  TEXT NOT NULL,
                        attempt_index         INTEGER NOT NULL,
                        outcome               TEXT NOT NULL,
                        failure_categories    TEXT NOT NULL,
                        corrective_prompt_id  TEXT,
                        confidence            REAL,
                        duration_ms           INTEGER NOT NULL,
                        created_at            TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_qa_attempts_task ON qa_attempts(task_id);

                    CREATE TABLE IF NOT EXISTS audit_events (
                        id              TEXT PRIMARY KEY,
                        process_id      TEXT NOT NULL,
                        task_id         TEXT,
                        kind            TEXT NOT NULL,
                        severity        TEXT NOT NULL,
                        payload         TEXT NOT NULL,
                        timestamp       TEXT NOT NULL,
                        sequence        INTEGER NOT NULL,
                        correlation_id  TEXT NOT NULL
                    );

                    CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_process_sequence
                        ON audit_events(process_id, sequence);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Process
    // -----------------------------------------------------------------------

    pub async fn create_process(&self, process: &Process) -> Result<(), StoreError> {
        let id = process.id.to_string();
        let external_client_id = process.external_client_id.clone();
        let external_project_id = process.external_project_id.clone();
        let status = enum_to_sql(&process.status);
        let total = process.totals.total;
        let completed = process.totals.completed;
        let failed = process.totals.failed;
        let manual_review = process.totals.manual_review;
        let created_at = process.created_at.to_rfc3339();
        let completed_at = process.completed_at.map(|d| d.to_rfc3339());
        let config_snapshot = process.config_snapshot.clone();
        let media_refs = process.media_refs.clone();
        let processing_status_sent = process.processing_status_sent;
        let completed_status_sent = process.completed_status_sent;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO processes (id, external_client_id, external_project_id, status,
                        total, completed, failed, manual_review, created_at, completed_at,
                        config_snapshot, media_refs, processing_status_sent, completed_status_sent)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                    rusqlite::params![
                        id, external_client_id, external_project_id, status, total, completed,
                        failed, manual_review, created_at, completed_at, config_snapshot,
                        media_refs, processing_status_sent, completed_status_sent,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_process(&self, id: Uuid) -> Result<Option<Process>, StoreError> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, external_client_id, external_project_id, status, total, completed,
                            failed, manual_review, created_at, completed_at, config_snapshot,
                            media_refs, processing_status_sent, completed_status_sent
                     FROM processes WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_process(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    /// Applies the per-task-outcome counter bump atomically; the caller
    /// supplies which bucket to increment (completed/failed/manual_review).
    pub async fn update_process_counters(
        &self,
        process_id: Uuid,
        completed_delta: u32,
        failed_delta: u32,
        manual_review_delta: u32,
    ) -> Result<Process, StoreError> {
        let id_str = process_id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE processes SET completed = completed + ?2, failed = failed + ?3,
                        manual_review = manual_review + ?4 WHERE id = ?1",
                    rusqlite::params![id_str, completed_delta, failed_delta, manual_review_delta],
                )?;
                let mut stmt = conn.prepare(
                    "SELECT id, external_client_id, external_project_id, status, total, completed,
                            failed, manual_review, created_at, completed_at, config_snapshot,
                            media_refs, processing_status_sent, completed_status_sent
                     FROM processes WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(row_to_process(row)?),
                    None => Err(rusqlite::Error::QueryReturnedNoRows),
                }
            })
            .await
            .map_err(|e| match e {
                tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows) => {
                    StoreError::ProcessNotFound(process_id)
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(updated)
    }

    pub async fn mark_process_status(
        &self,
        process_id: Uuid,
        status: ProcessStatus,
        sent_processing: bool,
        sent_completed: bool,
    ) -> Result<(), StoreError> {
        let id_str = process_id.to_string();
        let status_str = enum_to_sql(&status);
        let completed_at = if status.is_terminal() { Some(Utc::now().to_rfc3339()) } else { None };
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE processes SET status = ?2, completed_at = COALESCE(?3, completed_at),
                        processing_status_sent = processing_status_sent OR ?4,
                        completed_status_sent = completed_status_sent OR ?5
                     WHERE id = ?1",
                    rusqlite::params![id_str, status_str, completed_at, sent_processing, sent_completed],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    pub async fn create_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let rows: Vec<_> = tasks.iter().map(task_to_params).collect();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO tasks (id, process_id, media_id, analysis_type, status,
                            qa_attempts_t0, qa_attempts_t1, qa_attempts_t2, confidence, last_error,
                            created_at, updated_at, raw_output_path, result, profile_version, lease_owner,
                            lease_deadline, submission_sent, attempt_count)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                    )?;
                    for p in &rows {
                        stmt.execute(rusqlite::params_from_iter(p.iter()))?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&task_select_sql("WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    /// Compare-and-swap transition: rejects (without side effect) if the
    /// task's current status does not match `from`, enforcing the State
    /// Store's CAS invariant for concurrent worker/QA/reaper access.
    pub async fn transition_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<Task, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::TransitionConflict { task: task_id, from, expected: from });
        }
        let id_str = task_id.to_string();
        let from_str = enum_to_sql(&from);
        let to_str = enum_to_sql(&to);
        let now = Utc::now().to_rfc3339();

        let result = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                    rusqlite::params![id_str, from_str, to_str, now],
                )?;
                if changed == 0 {
                    let mut stmt = conn.prepare("SELECT status FROM tasks WHERE id = ?1")?;
                    let current: Option<String> = stmt
                        .query_row(rusqlite::params![id_str], |r| r.get(0))
                        .optional()?;
                    return Ok(TransitionOutcome::Conflict(current));
                }
                let mut stmt = conn.prepare(&task_select_sql("WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(TransitionOutcome::Applied(row_to_task(row)?)),
                    None => Ok(TransitionOutcome::Conflict(None)),
                }
            })
            .await?;

        match result {
            TransitionOutcome::Applied(task) => Ok(task),
            TransitionOutcome::Conflict(None) => Err(StoreError::TaskNotFound(task_id)),
            TransitionOutcome::Conflict(Some(current)) => {
                Err(StoreError::TransitionConflict { task: task_id, from: enum_from_sql(&current), expected: from })
            }
        }
    }

    /// Persists a task's structured output, overwriting any prior value.
    /// Called by the QA pipeline on corrective replacement and on final
    /// tier pass, so the Job Orchestrator can later submit it as
    /// `analysisResult`.
    pub async fn set_task_result(&self, task_id: Uuid, result: serde_json::Value) -> Result<Task, StoreError> {
        let id_str = task_id.to_string();
        let result_str = result.to_string();
        let now = Utc::now().to_rfc3339();

        let row = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET result = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id_str, result_str, now],
                )?;
                let mut stmt = conn.prepare(&task_select_sql("WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        row.ok_or(StoreError::TaskNotFound(task_id))
    }

    /// Attempts to lease a `Pending` task for `owner`, moving it to
    /// `Running` and setting a deadline `ttl` in the future.
    pub async fn lease_task(
        &self,
        task_id: Uuid,
        owner: &str,
        ttl: chrono::Duration,
    ) -> Result<Task, StoreError> {
        let id_str = task_id.to_string();
        let owner = owner.to_string();
        let deadline = (Utc::now() + ttl).to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let running = enum_to_sql(&TaskStatus::Running);
        let pending = enum_to_sql(&TaskStatus::Pending);

        let result = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = ?3, lease_owner = ?4, lease_deadline = ?5, updated_at = ?6
                     WHERE id = ?1 AND status = ?2",
                    rusqlite::params![id_str, pending, running, owner, deadline, now],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                let mut stmt = conn.prepare(&task_select_sql("WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await?;

        result.ok_or(StoreError::LeaseConflict(task_id))
    }

    pub async fn renew_lease(&self, task_id: Uuid, owner: &str, ttl: chrono::Duration) -> Result<(), StoreError> {
        let id_str = task_id.to_string();
        let owner = owner.to_string();
        let deadline = (Utc::now() + ttl).to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET lease_deadline = ?3 WHERE id = ?1 AND lease_owner = ?2",
                    rusqlite::params![id_str, owner, deadline],
                )
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::LeaseConflict(task_id));
        }
        Ok(())
    }

    pub async fn release_lease(&self, task_id: Uuid, owner: &str) -> Result<(), StoreError> {
        let id_str = task_id.to_string();
        let owner = owner.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET lease_owner = NULL, lease_deadline = NULL
                     WHERE id = ?1 AND lease_owner = ?2",
                    rusqlite::params![id_str, owner],
                )
            })
            .await?;
        Ok(())
    }

    /// Reclaims up to `limit` tasks whose lease deadline has elapsed,
    /// transitioning them back to `Pending` — grounds spec §4.D's reaper
    /// sweep (equivalent to the teacher's stale-lease patrol pattern).
    /// Returns stale leased tasks to `pending`, bumping each one's
    /// `attempt_count` and emitting a `task_lease_reclaimed` audit event per
    /// row so a task stuck in a reclaim loop is visible in the audit log.
    pub async fn reclaim_expired(&self, limit: usize) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let running = enum_to_sql(&TaskStatus::Running);
        let awaiting_qa = enum_to_sql(&TaskStatus::AwaitingQa);
        let pending = enum_to_sql(&TaskStatus::Pending);
        let limit = limit as i64;

        let reclaimed: Vec<(String, String)> = self
            .conn
            .call(move |conn| {
                let ids: Vec<(String, String)> = {
                    let mut stmt = conn.prepare(
                        "SELECT id, process_id FROM tasks
                         WHERE status IN (?1, ?2) AND lease_deadline IS NOT NULL AND lease_deadline < ?3
                         LIMIT ?4",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![running, awaiting_qa, now, limit])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
                    }
                    out
                };
                let tx = conn.unchecked_transaction();
                for (id, _) in &ids {
                    tx.execute(
                        "UPDATE tasks SET status = ?2, lease_owner = NULL, lease_deadline = NULL,
                            attempt_count = attempt_count + 1 WHERE id = ?1",
                        rusqlite::params![id, pending],
                    )?;
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;

        for (task_id, process_id) in &reclaimed {
            let task_id = Uuid::parse_str(task_id).expect("valid uuid");
            let process_id = Uuid::parse_str(process_id).expect("valid uuid");
            self.emit_audit(
                process_id,
                Some(task_id),
                "task_lease_reclaimed",
                AuditSeverity::Warning,
                serde_json::json!({ "task_id": task_id }),
                Uuid::new_v4(),
            )
            .await?;
        }
        Ok(reclaimed.len() as u64)
    }

    /// Marks a task's result as submitted to the job registry. Idempotent:
    /// returns `true` only the first time, so the Job Orchestrator can treat
    /// `false` as "already handled" and skip a duplicate submission.
    pub async fn mark_task_submission_sent(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let id_str = task_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET submission_sent = 1 WHERE id = ?1 AND submission_sent = 0",
                    rusqlite::params![id_str],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Aggregates per-process figures the Job Orchestrator needs for the
    /// final quality report: how many distinct media items saw at least one
    /// task, and which analysis types completed at least once.
    pub async fn summarize_process_tasks(&self, process_id: Uuid) -> Result<ProcessTaskSummary, StoreError> {
        let id_str = process_id.to_string();
        let completed = enum_to_sql(&TaskStatus::Completed);
        let (distinct_media, completed_analysis_types) = self
            .conn
            .call(move |conn| {
                let distinct_media: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT media_id) FROM tasks WHERE process_id = ?1",
                    rusqlite::params![id_str],
                    |r| r.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT analysis_type FROM tasks WHERE process_id = ?1 AND status = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str, completed])?;
                let mut types = Vec::new();
                while let Some(row) = rows.next()? {
                    types.push(row.get::<_, String>(0)?);
                }
                Ok((distinct_media, types))
            })
            .await?;
        Ok(ProcessTaskSummary {
            distinct_media: distinct_media as u32,
            completed_analysis_types,
        })
    }

    // -----------------------------------------------------------------------
    // QA attempts
    // -----------------------------------------------------------------------

    pub async fn record_qa_attempt(&self, attempt: &QaAttempt) -> Result<(), StoreError> {
        let id = attempt.id.to_string();
        let task_id = attempt.task_id.to_string();
        let tier = enum_to_sql(&attempt.tier);
        let attempt_index = attempt.attempt_index;
        let outcome = enum_to_sql(&attempt.outcome);
        let failure_categories = serde_json::to_string(&attempt.failure_categories).unwrap();
        let corrective_prompt_id = attempt.corrective_prompt_id.clone();
        let confidence = attempt.confidence;
        let duration_ms = attempt.duration_ms as i64;
        let created_at = attempt.created_at.to_rfc3339();
        let tier_index = QaTier::ORDER.iter().position(|t| *t == attempt.tier).unwrap();
        let task_id_for_bump = attempt.task_id.to_string();

        self.conn
            .call(move |conn| {
                let tx = conn.unchecked_transaction();
                tx.execute(
                    "INSERT INTO qa_attempts (id, task_id, tier, attempt_index, outcome,
                        failure_categories, corrective_prompt_id, confidence, duration_ms, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    rusqlite::params![
                        id, task_id, tier, attempt_index, outcome, failure_categories,
                        corrective_prompt_id, confidence, duration_ms, created_at,
                    ],
                )?;
                let column = match tier_index {
                    0 => "qa_attempts_t0",
                    1 => "qa_attempts_t1",
                    _ => "qa_attempts_t2",
                };
                tx.execute(
                    &format!("UPDATE tasks SET {column} = {column} + 1, updated_at = ?2 WHERE id = ?1"),
                    rusqlite::params![task_id_for_bump, Utc::now().to_rfc3339()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_qa_attempts(&self, task_id: Uuid) -> Result<Vec<QaAttempt>, StoreError> {
        let id_str = task_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, tier, attempt_index, outcome, failure_categories,
                            corrective_prompt_id, confidence, duration_ms, created_at
                     FROM qa_attempts WHERE task_id = ?1 ORDER BY created_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_qa_attempt(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    /// Appends an audit event with a monotonically increasing per-process
    /// sequence number (invariant #6's total ordering).
    pub async fn emit_audit(
        &self,
        process_id: Uuid,
        task_id: Option<Uuid>,
        kind: &str,
        severity: AuditSeverity,
        payload: serde_json::Value,
        correlation_id: Uuid,
    ) -> Result<AuditEvent, StoreError> {
        let process_id_str = process_id.to_string();
        let task_id_str = task_id.map(|t| t.to_string());
        let kind = kind.to_string();
        let kind_for_event = kind.clone();
        let severity_str = enum_to_sql(&severity);
        let payload_str = payload.to_string();
        let timestamp = Utc::now();
        let timestamp_str = timestamp.to_rfc3339();
        let correlation_id_str = correlation_id.to_string();
        let id = Uuid::new_v4();
        let id_str = id.to_string();

        let sequence = self
            .conn
            .call(move |conn| {
                let tx = conn.unchecked_transaction();
                let next_seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(sequence), 0) + 1 FROM audit_events WHERE process_id = ?1",
                    rusqlite::params![process_id_str],
                    |r| r.get(0),
                )?;
                tx.execute(
                    "INSERT INTO audit_events (id, process_id, task_id, kind, severity, payload,
                        timestamp, sequence, correlation_id) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        id_str, process_id_str, task_id_str, kind, severity_str, payload_str,
                        timestamp_str, next_seq, correlation_id_str,
                    ],
                )?;
                tx.commit()?;
                Ok(next_seq as u64)
            })
            .await?;

        Ok(AuditEvent {
            id,
            process_id,
            task_id,
            kind: kind_for_event,
            severity,
            payload,
            timestamp,
            sequence,
            correlation_id,
        })
    }
}

enum TransitionOutcome {
    Applied(Task),
    Conflict(Option<String>),
}

use rusqlite::OptionalExtension;

fn task_select_sql(where_clause: &str) -> String {
    format!(
        "SELECT id, process_id, media_id, analysis_type, status, qa_attempts_t0, qa_attempts_t1,
                qa_attempts_t2, confidence, last_error, created_at, updated_at, raw_output_path,
                result, profile_version, lease_owner, lease_deadline, submission_sent, attempt_count
         FROM tasks {where_clause}"
    )
}

fn task_to_params(task: &Task) -> Vec<Box<dyn rusqlite::ToSql>> {
    vec![
        Box::new(task.id.to_string()),
        Box::new(task.process_id.to_string()),
        Box::new(task.media_id.clone()),
        Box::new(enum_to_sql(&task.analysis_type)),
        Box::new(enum_to_sql(&task.status)),
        Box::new(task.qa_attempts_by_tier[0]),
        Box::new(task.qa_attempts_by_tier[1]),
        Box::new(task.qa_attempts_by_tier[2]),
        Box::new(task.confidence),
        Box::new(task.last_error.clone()),
        Box::new(task.created_at.to_rfc3339()),
        Box::new(task.updated_at.to_rfc3339()),
        Box::new(task.raw_output_path.clone()),
        Box::new(task.result.as_ref().map(|v| v.to_string())),
        Box::new(task.profile_version.map(|v| v as i64)),
        Box::new(task.lease_owner.clone()),
        Box::new(task.lease_deadline.map(|d| d.to_rfc3339())),
        Box::new(task.submission_sent),
        Box::new(task.attempt_count),
    ]
}

fn row_to_process(row: &rusqlite::Row<'_>) -> rusqlite::Result<Process> {
    let status_str: String = row.get(3)?;
    let completed_at_str: Option<String> = row.get(9)?;
    Ok(Process {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).expect("valid uuid"),
        external_client_id: row.get(1)?,
        external_project_id: row.get(2)?,
        status: enum_from_sql(&status_str),
        totals: TaskTotals {
            total: row.get(4)?,
            completed: row.get(5)?,
            failed: row.get(6)?,
            manual_review: row.get(7)?,
        },
        created_at: parse_rfc3339(&row.get::<_, String>(8)?),
        completed_at: completed_at_str.map(|s| parse_rfc3339(&s)),
        config_snapshot: row.get(10)?,
        media_refs: row.get(11)?,
        processing_status_sent: row.get(12)?,
        completed_status_sent: row.get(13)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let analysis_type_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let result_str: Option<String> = row.get(13)?;
    let lease_deadline_str: Option<String> = row.get(16)?;
    Ok(Task {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).expect("valid uuid"),
        process_id: Uuid::parse_str(&row.get::<_, String>(1)?).expect("valid uuid"),
        media_id: row.get(2)?,
        analysis_type: enum_from_sql(&analysis_type_str),
        status: enum_from_sql(&status_str),
        qa_attempts_by_tier: [row.get(5)?, row.get(6)?, row.get(7)?],
        confidence: row.get(8)?,
        last_error: row.get(9)?,
        created_at: parse_rfc3339(&row.get::<_, String>(10)?),
        updated_at: parse_rfc3339(&row.get::<_, String>(11)?),
        raw_output_path: row.get(12)?,
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        profile_version: row.get::<_, Option<i64>>(14)?.map(|v| v as u64),
        lease_owner: row.get(15)?,
        lease_deadline: lease_deadline_str.map(|s| parse_rfc3339(&s)),
        submission_sent: row.get(17)?,
        attempt_count: row.get(18)?,
    })
}

fn row_to_qa_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<QaAttempt> {
    let tier_str: String = row.get(2)?;
    let outcome_str: String = row.get(4)?;
    let failure_categories_str: String = row.get(5)?;
    Ok(QaAttempt {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).expect("valid uuid"),
        task_id: Uuid::parse_str(&row.get::<_, String>(1)?).expect("valid uuid"),
        tier: enum_from_sql(&tier_str),
        attempt_index: row.get(3)?,
        outcome: enum_from_sql(&outcome_str),
        failure_categories: serde_json::from_str(&failure_categories_str).unwrap_or_default(),
        corrective_prompt_id: row.get(6)?,
        confidence: row.get(7)?,
        duration_ms: row.get::<_, i64>(8)? as u64,
        created_at: parse_rfc3339(&row.get::<_, String>(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vq_core::domain::AnalysisType;

    async fn store_with_process() -> (StateStore, Process) {
        let store = StateStore::new_in_memory().await.unwrap();
        let process = Process::new("client-1".into(), "project-1".into(), 2, "{}".into(), "[]".into());
        store.create_process(&process).await.unwrap();
        (store, process)
    }

    #[tokio::test]
    async fn create_and_get_process_roundtrips() {
        let (store, process) = store_with_process().await;
        let fetched = store.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(fetched.external_project_id, "project-1");
        assert_eq!(fetched.totals.total, 2);
    }

    #[tokio::test]
    async fn lease_task_moves_pending_to_running() {
        let (store, process) = store_with_process().await;
        let task = Task::new(process.id, "media-1".into(), AnalysisType::ObjectDetection);
        store.create_tasks(&[task.clone()]).await.unwrap();

        let leased = store.lease_task(task.id, "worker-1", ChronoDuration::seconds(30)).await.unwrap();
        assert_eq!(leased.status, TaskStatus::Running);
        assert_eq!(leased.lease_owner.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn lease_task_rejects_non_pending() {
        let (store, process) = store_with_process().await;
        let task = Task::new(process.id, "media-1".into(), AnalysisType::ObjectDetection);
        store.create_tasks(&[task.clone()]).await.unwrap();
        store.lease_task(task.id, "worker-1", ChronoDuration::seconds(30)).await.unwrap();

        let second = store.lease_task(task.id, "worker-2", ChronoDuration::seconds(30)).await;
        assert!(matches!(second, Err(StoreError::LeaseConflict(_))));
    }

    #[tokio::test]
    async fn transition_task_cas_rejects_stale_from() {
        let (store, process) = store_with_process().await;
        let task = Task::new(process.id, "media-1".into(), AnalysisType::ObjectDetection);
        store.create_tasks(&[task.clone()]).await.unwrap();
        store.lease_task(task.id, "worker-1", ChronoDuration::seconds(30)).await.unwrap();

        let result = store.transition_task(task.id, TaskStatus::Pending, TaskStatus::Running).await;
        assert!(matches!(result, Err(StoreError::TransitionConflict { .. })));
    }

    #[tokio::test]
    async fn transition_task_applies_legal_move() {
        let (store, process) = store_with_process().await;
        let task = Task::new(process.id, "media-1".into(), AnalysisType::ObjectDetection);
        store.create_tasks(&[task.clone()]).await.unwrap();
        store.lease_task(task.id, "worker-1", ChronoDuration::seconds(30)).await.unwrap();

        let updated = store.transition_task(task.id, TaskStatus::Running, TaskStatus::AwaitingQa).await.unwrap();
        assert_eq!(updated.status, TaskStatus::AwaitingQa);
    }

    #[tokio::test]
    async fn reclaim_expired_returns_stale_lease_to_pending() {
        let (store, process) = store_with_process().await;
        let task = Task::new(process.id, "media-1".into(), AnalysisType::ObjectDetection);
        store.create_tasks(&[task.clone()]).await.unwrap();
        store.lease_task(task.id, "worker-1", ChronoDuration::milliseconds(-1)).await.unwrap();

        let reclaimed = store.reclaim_expired(10).await.unwrap();
        assert_eq!(reclaimed, 1);
        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert!(fetched.lease_owner.is_none());
        assert_eq!(fetched.attempt_count, 1);

        let events = store
            .emit_audit(process.id, None, "probe", AuditSeverity::Info, serde_json::json!({}), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(events.sequence, 2, "lease reclaim should have emitted sequence 1 already");
    }

    #[tokio::test]
    async fn record_qa_attempt_bumps_tier_counter() {
        let (store, process) = store_with_process().await;
        let task = Task::new(process.id, "media-1".into(), AnalysisType::ObjectDetection);
        store.create_tasks(&[task.clone()]).await.unwrap();

        let attempt = QaAttempt::new(task.id, QaTier::Structural, 1, QaOutcome::Fail);
        store.record_qa_attempt(&attempt).await.unwrap();

        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.attempts_for(QaTier::Structural), 1);

        let attempts = store.list_qa_attempts(task.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, QaOutcome::Fail);
    }

    #[tokio::test]
    async fn emit_audit_assigns_monotonic_sequence_per_process() {
        let (store, process) = store_with_process().await;
        let e1 = store
            .emit_audit(process.id, None, "process_created", AuditSeverity::Info, serde_json::json!({}), Uuid::new_v4())
            .await
            .unwrap();
        let e2 = store
            .emit_audit(process.id, None, "task_enqueued", AuditSeverity::Info, serde_json::json!({}), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
    }

    #[tokio::test]
    async fn update_process_counters_accumulates() {
        let (store, process) = store_with_process().await;
        let updated = store.update_process_counters(process.id, 1, 0, 0).await.unwrap();
        assert_eq!(updated.totals.completed, 1);
        let updated = store.update_process_counters(process.id, 0, 1, 0).await.unwrap();
        assert_eq!(updated.totals.completed, 1);
        assert_eq!(updated.totals.failed, 1);
    }
}
