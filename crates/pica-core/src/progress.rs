//! In-memory progress for one running task, rate-limited to the task row.
//!
//! Progress writes are the dominant database traffic, so `advance` holds
//! them to one durable write per 500 ms per task. Total and message changes
//! bypass the limit: both are rare and both matter to a watching client.

use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::store::Library;

/// Minimum spacing between durable progress writes for one task.
pub const WRITE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct ProgressState {
    progress: i64,
    total: i64,
    last_write: Option<Instant>,
    dirty: bool,
}

/// Serialized progress/total/message view of one running task.
///
/// Concurrent fan-out jobs funnel their `advance` calls through one
/// reporter, so at most one writer ever touches the task row.
pub struct ProgressReporter {
    db: Library,
    task_id: String,
    write_interval: Duration,
    state: Mutex<ProgressState>,
}

impl ProgressReporter {
    pub fn new(db: Library, task_id: impl Into<String>) -> Self {
        Self::with_interval(db, task_id, WRITE_INTERVAL)
    }

    pub fn with_interval(
        db: Library,
        task_id: impl Into<String>,
        write_interval: Duration,
    ) -> Self {
        Self {
            db,
            task_id: task_id.into(),
            write_interval,
            state: Mutex::new(ProgressState {
                progress: 0,
                total: 0,
                last_write: None,
                dirty: false,
            }),
        }
    }

    /// Set the work-unit total. Forces an immediate row write.
    pub async fn set_total(&self, total: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.total = total.max(0);
        if state.total > 0 {
            state.progress = state.progress.min(state.total);
        }
        self.write_locked(&mut state).await
    }

    /// Add completed work units. Rate-limited write-through.
    pub async fn advance(&self, delta: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.progress = (state.progress + delta.max(0)).max(0);
        if state.total > 0 {
            state.progress = state.progress.min(state.total);
        }
        state.dirty = true;
        let due = match state.last_write {
            Some(at) => at.elapsed() >= self.write_interval,
            None => true,
        };
        if due {
            self.write_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Monotonically raise progress to at least `floor` (resume path:
    /// staged files left by a previous run count as done). Forces a write.
    pub async fn ensure_progress_at_least(&self, floor: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.progress >= floor {
            return Ok(());
        }
        state.progress = floor;
        if state.total > 0 {
            state.progress = state.progress.min(state.total);
        }
        self.write_locked(&mut state).await
    }

    /// Set the short human-readable message. Forces an immediate write.
    pub async fn set_message(&self, message: &str) -> Result<()> {
        self.db
            .set_task_message(&self.task_id, Some(message))
            .await
    }

    /// Write any pending progress. Call before a terminal transition so the
    /// row reflects the last completed unit.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.dirty {
            self.write_locked(&mut state).await?;
        }
        Ok(())
    }

    async fn write_locked(&self, state: &mut ProgressState) -> Result<()> {
        self.db
            .update_task_progress(&self.task_id, state.progress, state.total)
            .await?;
        state.last_write = Some(Instant::now());
        state.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use crate::store::{open_memory, TaskParams};

    async fn setup() -> (Library, String) {
        let db = open_memory().await.unwrap();
        let id = db
            .insert_task(SourceKind::Nhentai, "1", &TaskParams::default())
            .await
            .unwrap();
        (db, id)
    }

    async fn row(db: &Library, id: &str) -> (i64, i64) {
        let task = db.get_task(id).await.unwrap().unwrap();
        (task.progress, task.total)
    }

    #[tokio::test]
    async fn set_total_writes_immediately() {
        let (db, id) = setup().await;
        let reporter = ProgressReporter::new(db.clone(), &id);
        reporter.set_total(12).await.unwrap();
        assert_eq!(row(&db, &id).await, (0, 12));
    }

    #[tokio::test]
    async fn advance_is_rate_limited() {
        let (db, id) = setup().await;
        let reporter =
            ProgressReporter::with_interval(db.clone(), &id, Duration::from_secs(3600));
        reporter.set_total(10).await.unwrap();
        reporter.advance(1).await.unwrap();
        reporter.advance(1).await.unwrap();
        // Both advances landed inside the window opened by set_total.
        assert_eq!(row(&db, &id).await, (0, 10));
        reporter.flush().await.unwrap();
        assert_eq!(row(&db, &id).await, (2, 10));
    }

    #[tokio::test]
    async fn advance_writes_once_interval_elapses() {
        let (db, id) = setup().await;
        let reporter =
            ProgressReporter::with_interval(db.clone(), &id, Duration::from_millis(5));
        reporter.set_total(10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        reporter.advance(3).await.unwrap();
        assert_eq!(row(&db, &id).await, (3, 10));
    }

    #[tokio::test]
    async fn progress_never_exceeds_total() {
        let (db, id) = setup().await;
        let reporter = ProgressReporter::new(db.clone(), &id);
        reporter.set_total(2).await.unwrap();
        reporter.advance(5).await.unwrap();
        reporter.flush().await.unwrap();
        assert_eq!(row(&db, &id).await, (2, 2));
    }

    #[tokio::test]
    async fn resume_floor_is_monotonic() {
        let (db, id) = setup().await;
        let reporter = ProgressReporter::new(db.clone(), &id);
        reporter.set_total(10).await.unwrap();
        reporter.ensure_progress_at_least(4).await.unwrap();
        assert_eq!(row(&db, &id).await, (4, 10));
        reporter.ensure_progress_at_least(2).await.unwrap();
        assert_eq!(row(&db, &id).await, (4, 10));
    }

    #[tokio::test]
    async fn message_write_is_immediate() {
        let (db, id) = setup().await;
        let reporter = ProgressReporter::new(db.clone(), &id);
        reporter.set_message("walking gallery pages").await.unwrap();
        let task = db.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.message.as_deref(), Some("walking gallery pages"));
    }
}
