//! Task row operations: insert, lookup, state transitions, boot recovery.

use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::Row;

use super::db::{unix_millis, Library};
use super::types::{TaskParams, TaskRecord, TaskStatus};
use crate::sources::SourceKind;

/// Length of generated task ids; 24 alphanumeric chars is ≥18 bytes of
/// URL-safe entropy.
const TASK_ID_LEN: usize = 24;

/// Random URL-safe task id.
pub fn new_task_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TASK_ID_LEN)
        .map(char::from)
        .collect()
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let source_str: String = row.get("source");
    let source = SourceKind::from_str(&source_str)
        .ok_or_else(|| anyhow::anyhow!("unknown source in task row: {source_str}"))?;
    let params_json: String = row.get("params_json");
    let params: TaskParams =
        serde_json::from_str(&params_json).context("parse task params_json")?;
    let status_str: String = row.get("status");
    Ok(TaskRecord {
        id: row.get("id"),
        task_type: row.get("task_type"),
        source,
        target: row.get("target"),
        params,
        status: TaskStatus::from_str(&status_str),
        progress: row.get("progress"),
        total: row.get("total"),
        message: row.get("message"),
        comic_id: row.get("comic_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl Library {
    /// Insert a fresh queued download task row and return its id.
    pub async fn insert_task(
        &self,
        source: SourceKind,
        target: &str,
        params: &TaskParams,
    ) -> Result<String> {
        let id = new_task_id();
        let now = unix_millis();
        let params_json = serde_json::to_string(params)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, source, target, params_json,
                status, progress, total, message, comic_id,
                created_at, updated_at
            ) VALUES (?1, 'download', ?2, ?3, ?4, ?5, 0, 0, NULL, NULL, ?6, ?7)
            "#,
        )
        .bind(&id)
        .bind(source.as_str())
        .bind(target)
        .bind(params_json)
        .bind(TaskStatus::Queued.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(r#"SELECT * FROM tasks WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Newest-first task listing for the control plane.
    pub async fn list_tasks(&self, limit: u32) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Id of any task for the same (source, target) still in
    /// queued/running/paused, if one exists.
    pub async fn find_active_task(
        &self,
        source: SourceKind,
        target: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM tasks
            WHERE source = ?1 AND target = ?2
              AND status IN ('queued', 'running', 'paused')
            LIMIT 1
            "#,
        )
        .bind(source.as_str())
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3
            "#,
        )
        .bind(status.as_str())
        .bind(unix_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Status plus message in one write; `None` clears the message.
    pub async fn set_task_outcome(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks SET status = ?1, message = ?2, updated_at = ?3 WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(message)
        .bind(unix_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal success: status, comic id, and progress pinned to total.
    pub async fn mark_task_succeeded(
        &self,
        id: &str,
        comic_id: &str,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'succeeded',
                comic_id = ?1,
                message = ?2,
                progress = total,
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(comic_id)
        .bind(message)
        .bind(unix_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Durable progress write-through from the progress reporter.
    pub async fn update_task_progress(&self, id: &str, progress: i64, total: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks SET progress = ?1, total = ?2, updated_at = ?3 WHERE id = ?4
            "#,
        )
        .bind(progress)
        .bind(total)
        .bind(unix_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_message(&self, id: &str, message: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks SET message = ?1, updated_at = ?2 WHERE id = ?3
            "#,
        )
        .bind(message)
        .bind(unix_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Permanently remove a task row. Staging cleanup is the caller's job.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM tasks WHERE id = ?1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Boot recovery, run once before accepting traffic: every row stranded
    /// in `running` becomes `failed` with a fixed message, and the queued
    /// rows are returned oldest-first for re-enqueue.
    pub async fn recover_on_boot(&self) -> Result<Vec<String>> {
        let now = unix_millis();
        let reset = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', message = 'server restarted', updated_at = ?1
            WHERE status = 'running'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        if reset.rows_affected() > 0 {
            tracing::info!(
                "boot recovery: failed {} stranded running task(s)",
                reset.rows_affected()
            );
        }

        let rows = sqlx::query(
            r#"
            SELECT id FROM tasks WHERE status = 'queued' ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}
