//! Task queue operations.
//!
//! Every status change is a compare-and-swap on the current status
//! (`WHERE id = ? AND status = ?`). The returned `bool` tells the caller
//! whether it won; `false` means another process moved the task first.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use libsql::params;
use licitai_shared::{
    AnalysisResult, Contact, LicitaiError, Result, Stage, StageOutput, Task, TaskId, TaskStatus,
};
use tracing::warn;

use crate::{Storage, format_timestamp, parse_timestamp};

/// Existing `(record_id, owner_id)` pairs.
pub type PairSet = HashSet<(String, String)>;

/// A listed task row: its stored id and the decoded task, or the reason the
/// row failed validation.
#[derive(Debug)]
pub struct TaskRow {
    pub id: String,
    pub task: Result<Task>,
}

/// One row of the per-status distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub status: TaskStatus,
    pub count: u64,
}

const TASK_COLUMNS: &str = "id, record_id, owner_id, search_def_id, status, created_at, \
     analysis_started_at, analysis_finished_at, result_json, enrichment_started_at, \
     enrichment_finished_at, contacts_json, error_log, updated_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Task creation
    // -----------------------------------------------------------------------

    /// Load every `(record_id, owner_id)` pair already queued.
    pub async fn existing_task_pairs(&self) -> Result<PairSet> {
        let mut rows = self
            .conn
            .query("SELECT record_id, owner_id FROM tasks", params![])
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        let mut pairs = PairSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?
        {
            pairs.insert((
                row.get::<String>(0)
                    .map_err(|e| LicitaiError::Storage(e.to_string()))?,
                row.get::<String>(1)
                    .map_err(|e| LicitaiError::Storage(e.to_string()))?,
            ));
        }
        Ok(pairs)
    }

    /// Insert a batch of tasks in one transaction. Pairs that already exist
    /// are skipped. Returns the number of rows written.
    pub async fn insert_tasks(&self, tasks: &[Task]) -> Result<u64> {
        self.check_writable()?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        let mut inserted = 0u64;
        for task in tasks {
            let result_json = task
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| LicitaiError::parse(e.to_string()))?;
            let contacts_json = serde_json::to_string(&task.contacts)
                .map_err(|e| LicitaiError::parse(e.to_string()))?;

            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO tasks
                       (id, record_id, owner_id, search_def_id, status, created_at,
                        result_json, contacts_json, error_log, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        task.id.to_string(),
                        task.record_id.as_str(),
                        task.owner_id.as_str(),
                        task.search_def_id.as_str(),
                        task.status.as_str(),
                        format_timestamp(&task.created_at),
                        result_json,
                        contacts_json,
                        task.error_log.as_deref(),
                        format_timestamp(&task.updated_at),
                    ],
                )
                .await
                .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Task queries
    // -----------------------------------------------------------------------

    /// Get a task by id.
    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LicitaiError::Storage(e.to_string())),
        }
    }

    /// Rows in `status`, oldest first, at most `limit` of them. A row that
    /// fails validation is returned with its error instead of failing the
    /// whole listing.
    pub async fn list_task_rows_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<TaskRow>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                     ORDER BY created_at, id LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        collect_task_rows(rows).await
    }

    /// Rows whose `updated_at` is strictly later than `after` (every row when
    /// `None`), earliest update first.
    pub async fn list_task_rows_updated_after(
        &self,
        after: Option<&DateTime<Utc>>,
    ) -> Result<Vec<TaskRow>> {
        let after = after.map(format_timestamp).unwrap_or_default();
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE updated_at > ?1
                     ORDER BY updated_at, id"
                ),
                params![after],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        collect_task_rows(rows).await
    }

    /// Every decodable task whose status is one of `statuses`, oldest first.
    /// Rows that fail validation are skipped with a warning.
    pub async fn list_tasks_in(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let mut results = Vec::new();
        for status in statuses {
            for row in self
                .list_task_rows_by_status(*status, i64::MAX as usize)
                .await?
            {
                match row.task {
                    Ok(task) => results.push(task),
                    Err(e) => warn!(task_id = %row.id, error = %e, "skipping unreadable task"),
                }
            }
        }
        results.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.0.cmp(&b.id.0))
        });
        Ok(results)
    }

    /// Total tasks.
    pub async fn count_tasks(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM tasks").await
    }

    /// Tasks currently in `status`.
    pub async fn count_tasks_with_status(&self, status: TaskStatus) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<i64>(0)
                .map_err(|e| LicitaiError::Storage(e.to_string()))? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(LicitaiError::Storage(e.to_string())),
        }
    }

    /// Per-status distribution, most populated first.
    pub async fn count_tasks_by_status(&self) -> Result<Vec<StatusCount>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY COUNT(*) DESC, status",
                params![],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| LicitaiError::Storage(e.to_string()))?;
            results.push(StatusCount {
                status: status.parse()?,
                count: row
                    .get::<i64>(1)
                    .map_err(|e| LicitaiError::Storage(e.to_string()))? as u64,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// Move `from` → `to` and stamp the stage start time.
    pub async fn claim_task(
        &self,
        id: &TaskId,
        stage: Stage,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool> {
        self.check_writable()?;
        let sql = match stage {
            Stage::Analysis => {
                "UPDATE tasks SET status = ?3, analysis_started_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND status = ?2"
            }
            Stage::Enrichment => {
                "UPDATE tasks SET status = ?3, enrichment_started_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND status = ?2"
            }
        };
        let now = format_timestamp(&Utc::now());
        let affected = self
            .conn
            .execute(sql, params![id.to_string(), from.as_str(), to.as_str(), now])
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    /// Move `from` → `to` without touching anything else.
    pub async fn reset_status(&self, id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        self.check_writable()?;
        let now = format_timestamp(&Utc::now());
        let affected = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                params![id.to_string(), from.as_str(), to.as_str(), now],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    /// Write a stage's success payload and move `from` → `to`.
    pub async fn complete_task(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
        output: &StageOutput,
    ) -> Result<bool> {
        self.check_writable()?;
        let now = format_timestamp(&Utc::now());
        let (sql, payload) = match output {
            StageOutput::Analysis(result) => (
                "UPDATE tasks SET status = ?3, result_json = ?4, analysis_finished_at = ?5,
                        error_log = NULL, updated_at = ?5
                 WHERE id = ?1 AND status = ?2",
                serde_json::to_string(result),
            ),
            StageOutput::Enrichment(contacts) => (
                "UPDATE tasks SET status = ?3, contacts_json = ?4, enrichment_finished_at = ?5,
                        error_log = NULL, updated_at = ?5
                 WHERE id = ?1 AND status = ?2",
                serde_json::to_string(contacts),
            ),
        };
        let payload = payload.map_err(|e| LicitaiError::parse(e.to_string()))?;

        let affected = self
            .conn
            .execute(
                sql,
                params![id.to_string(), from.as_str(), to.as_str(), payload, now],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    /// Record the error text and move `from` → `to`.
    pub async fn fail_task(
        &self,
        id: &TaskId,
        stage: Stage,
        from: TaskStatus,
        to: TaskStatus,
        error: &str,
    ) -> Result<bool> {
        self.fail_task_by_key(&id.to_string(), stage, from, to, error)
            .await
    }

    /// Move a row that failed validation from `from` to `insufficient-data`.
    /// Only plain columns are written, so the undecodable fields are left as
    /// they are.
    pub async fn park_invalid_task(
        &self,
        id: &str,
        stage: Stage,
        from: TaskStatus,
        error: &str,
    ) -> Result<bool> {
        self.fail_task_by_key(id, stage, from, TaskStatus::InsufficientData, error)
            .await
    }

    async fn fail_task_by_key(
        &self,
        id: &str,
        stage: Stage,
        from: TaskStatus,
        to: TaskStatus,
        error: &str,
    ) -> Result<bool> {
        self.check_writable()?;
        let sql = match stage {
            Stage::Analysis => {
                "UPDATE tasks SET status = ?3, error_log = ?4, analysis_finished_at = ?5,
                        updated_at = ?5
                 WHERE id = ?1 AND status = ?2"
            }
            Stage::Enrichment => {
                "UPDATE tasks SET status = ?3, error_log = ?4, enrichment_finished_at = ?5,
                        updated_at = ?5
                 WHERE id = ?1 AND status = ?2"
            }
        };
        let now = format_timestamp(&Utc::now());
        let affected = self
            .conn
            .execute(sql, params![id, from.as_str(), to.as_str(), error, now])
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Administrative operations
    // -----------------------------------------------------------------------

    /// Delete up to `chunk` tasks. Returns how many were removed.
    pub async fn purge_tasks_chunk(&self, chunk: usize) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM tasks WHERE id IN (SELECT id FROM tasks LIMIT ?1)",
                params![chunk as i64],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))
    }

    /// Send a stage's failed tasks back to the stage's source status.
    ///
    /// `insufficient-data` tasks are attributed to the enrichment stage when
    /// enrichment had started, otherwise to analysis.
    pub async fn requeue_failed(&self, stage: Stage) -> Result<u64> {
        self.check_writable()?;
        let now = format_timestamp(&Utc::now());
        let (failed, source, started_filter) = match stage {
            Stage::Analysis => (
                TaskStatus::AnalysisFailed,
                TaskStatus::Pending,
                "enrichment_started_at IS NULL",
            ),
            Stage::Enrichment => (
                TaskStatus::EnrichmentFailed,
                TaskStatus::AnalysisDone,
                "enrichment_started_at IS NOT NULL",
            ),
        };

        let sql = format!(
            "UPDATE tasks SET status = ?1, error_log = NULL, updated_at = ?2
             WHERE status = ?3 OR (status = ?4 AND {started_filter})"
        );
        self.conn
            .execute(
                &sql,
                params![
                    source.as_str(),
                    now,
                    failed.as_str(),
                    TaskStatus::InsufficientData.as_str(),
                ],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))
    }
}

async fn collect_task_rows(mut rows: libsql::Rows) -> Result<Vec<TaskRow>> {
    let mut results = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| LicitaiError::Storage(e.to_string()))?
    {
        let id: String = row
            .get(0)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        let task = row_to_task(&row).map_err(|e| match e {
            LicitaiError::DataIntegrity { .. } => e,
            other => LicitaiError::data_integrity(format!("task {id}: {other}")),
        });
        results.push(TaskRow { id, task });
    }
    Ok(results)
}

fn optional_timestamp(row: &libsql::Row, idx: i32) -> Result<Option<chrono::DateTime<Utc>>> {
    match row.get::<String>(idx).ok() {
        Some(s) => Ok(Some(parse_timestamp(&s)?)),
        None => Ok(None),
    }
}

fn row_to_task(row: &libsql::Row) -> Result<Task> {
    let id: String = row
        .get(0)
        .map_err(|e| LicitaiError::Storage(e.to_string()))?;
    let status: String = row
        .get(4)
        .map_err(|e| LicitaiError::Storage(e.to_string()))?;
    let created_at: String = row
        .get(5)
        .map_err(|e| LicitaiError::Storage(e.to_string()))?;
    let result: Option<AnalysisResult> = match row.get::<String>(8).ok() {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| LicitaiError::data_integrity(format!("task {id}: bad result: {e}")))?,
        ),
        None => None,
    };
    let contacts: Vec<Contact> = match row.get::<String>(11).ok() {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| LicitaiError::data_integrity(format!("task {id}: bad contacts: {e}")))?,
        None => Vec::new(),
    };
    let updated_at: String = row
        .get(13)
        .map_err(|e| LicitaiError::Storage(e.to_string()))?;

    Ok(Task {
        id: id
            .parse()
            .map_err(|e| LicitaiError::data_integrity(format!("invalid task id '{id}': {e}")))?,
        record_id: row
            .get::<String>(1)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?,
        owner_id: row
            .get::<String>(2)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?,
        search_def_id: row
            .get::<String>(3)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?,
        status: status.parse()?,
        created_at: parse_timestamp(&created_at)?,
        analysis_started_at: optional_timestamp(row, 6)?,
        analysis_finished_at: optional_timestamp(row, 7)?,
        result,
        enrichment_started_at: optional_timestamp(row, 9)?,
        enrichment_finished_at: optional_timestamp(row, 10)?,
        contacts,
        error_log: row.get::<String>(12).ok(),
        updated_at: parse_timestamp(&updated_at)?,
    })
}
