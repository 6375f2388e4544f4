//! Live view of tasks as they settle.
//!
//! [`ResultsMonitor`] polls the store for tasks whose `updated_at` moved past
//! the last one it reported, keeps the ones that are no longer waiting or in
//! progress, and hands them to a callback. It never writes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use licitai_shared::{Result, Task, TaskStatus};
use licitai_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Whether a task has left the queue and the in-progress statuses.
pub fn is_settled(status: TaskStatus) -> bool {
    !matches!(
        status,
        TaskStatus::Pending | TaskStatus::Analyzing | TaskStatus::Enriching
    )
}

pub struct ResultsMonitor {
    storage: Arc<Storage>,
    poll_interval: Duration,
    cursor: Option<DateTime<Utc>>,
    reported_unreadable: HashSet<String>,
}

impl ResultsMonitor {
    pub fn new(storage: Arc<Storage>, poll_interval: Duration) -> Self {
        Self {
            storage,
            poll_interval,
            cursor: None,
            reported_unreadable: HashSet::new(),
        }
    }

    /// Settled tasks updated since the previous poll, earliest update
    /// first. The first poll returns every settled task.
    pub async fn poll(&mut self) -> Result<Vec<Task>> {
        let rows = self
            .storage
            .list_task_rows_updated_after(self.cursor.as_ref())
            .await?;

        let mut settled = Vec::new();
        for row in rows {
            let task = match row.task {
                Ok(task) => task,
                Err(e) => {
                    if self.reported_unreadable.insert(row.id.clone()) {
                        warn!(task_id = %row.id, error = %e, "skipping unreadable task");
                    }
                    continue;
                }
            };
            if self.cursor.is_none_or(|c| task.updated_at > c) {
                self.cursor = Some(task.updated_at);
            }
            if is_settled(task.status) {
                settled.push(task);
            }
        }
        Ok(settled)
    }

    /// Poll until `cancel` fires, passing each settled task to `on_change`.
    #[instrument(skip_all, fields(poll_secs = self.poll_interval.as_secs()))]
    pub async fn run<F>(&mut self, cancel: CancellationToken, mut on_change: F) -> Result<()>
    where
        F: FnMut(&Task),
    {
        info!("results monitor started");
        while !cancel.is_cancelled() {
            match self.poll().await {
                Ok(tasks) => {
                    debug!(changed = tasks.len(), "poll finished");
                    for task in &tasks {
                        on_change(task);
                    }
                }
                Err(e) => error!(error = %e, "poll failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("results monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use licitai_shared::{AnalysisResult, SearchDefinition, Stage, StageOutput};
    use uuid::Uuid;

    async fn seeded(n: usize) -> (Arc<Storage>, Vec<Task>) {
        let tmp = std::env::temp_dir().join(format!("licitai_monitor_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open"));
        let def = SearchDefinition::new("TI", "owner-1", &["servidor"]);
        let tasks: Vec<Task> = (0..n)
            .map(|i| Task::pending(&format!("rec-{i}"), &def))
            .collect();
        storage.insert_tasks(&tasks).await.expect("tasks");
        (storage, tasks)
    }

    async fn finish_analysis(storage: &Storage, task: &Task) {
        storage
            .claim_task(&task.id, Stage::Analysis, TaskStatus::Pending, TaskStatus::Analyzing)
            .await
            .expect("claim");
        storage
            .complete_task(
                &task.id,
                TaskStatus::Analyzing,
                TaskStatus::AnalysisDone,
                &StageOutput::Analysis(AnalysisResult {
                    keywords: vec!["servidor".into()],
                    sales_trigger: "Compra de Hardware".into(),
                }),
            )
            .await
            .expect("complete");
    }

    #[test]
    fn waiting_and_in_progress_are_not_settled() {
        assert!(!is_settled(TaskStatus::Pending));
        assert!(!is_settled(TaskStatus::Analyzing));
        assert!(!is_settled(TaskStatus::Enriching));
        assert!(is_settled(TaskStatus::AnalysisDone));
        assert!(is_settled(TaskStatus::InsufficientData));
    }

    #[tokio::test]
    async fn reports_each_change_once() {
        let (storage, tasks) = seeded(3).await;
        let mut monitor = ResultsMonitor::new(storage.clone(), Duration::from_millis(1));

        assert!(monitor.poll().await.expect("first poll").is_empty());

        finish_analysis(&storage, &tasks[1]).await;
        let changed = monitor.poll().await.expect("second poll");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, tasks[1].id);
        assert_eq!(changed[0].status, TaskStatus::AnalysisDone);

        assert!(monitor.poll().await.expect("third poll").is_empty());

        storage
            .claim_task(
                &tasks[1].id,
                Stage::Enrichment,
                TaskStatus::AnalysisDone,
                TaskStatus::Enriching,
            )
            .await
            .expect("enrich claim");
        assert!(monitor.poll().await.expect("in progress hidden").is_empty());

        storage
            .fail_task(
                &tasks[1].id,
                Stage::Enrichment,
                TaskStatus::Enriching,
                TaskStatus::EnrichmentFailed,
                "Enrichment: every query failed",
            )
            .await
            .expect("fail");
        let changed = monitor.poll().await.expect("fourth poll");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, TaskStatus::EnrichmentFailed);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (storage, tasks) = seeded(1).await;
        finish_analysis(&storage, &tasks[0]).await;

        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let mut monitor = ResultsMonitor::new(storage, Duration::from_secs(3600));

        let stopper = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        monitor
            .run(cancel, |task| seen.push(task.id.clone()))
            .await
            .expect("run");
        handle.await.expect("stopper");

        assert_eq!(seen, vec![tasks[0].id.clone()]);
    }
}
