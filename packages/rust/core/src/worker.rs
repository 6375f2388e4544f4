//! Generic polling stage worker.
//!
//! A [`StageWorker`] owns one transition of the task state machine, described
//! by a [`StageSpec`], and delegates the actual work to a [`StageProcessor`].
//! Each cycle:
//!
//! 1. resets up to `reclaim_limit` tasks stuck in the stage's in-progress
//!    status back to its source status,
//! 2. lists up to `batch_size` tasks in the source status,
//! 3. moves each one to in-progress with a conditional update, dropping the
//!    ones another process took first,
//! 4. processes the claimed tasks concurrently (at most `batch_size` at once),
//! 5. writes either the success payload or the error text.
//!
//! A listed row that fails validation is parked in `insufficient-data` and
//! the rest of the batch carries on.
//!
//! Reclaim is not owner-aware: running two workers for the same stage
//! against one store lets each reset the other's in-flight tasks. Run one
//! worker per stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use licitai_shared::{
    LicitaiError, ProcurementRecord, Result, Stage, StageOutput, Task, TaskStatus, WorkersConfig,
};
use licitai_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// ---------------------------------------------------------------------------
// Stage description
// ---------------------------------------------------------------------------

/// The four statuses one stage moves tasks between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub stage: Stage,
    pub source: TaskStatus,
    pub in_progress: TaskStatus,
    pub success: TaskStatus,
    pub failure: TaskStatus,
}

impl StageSpec {
    pub const ANALYSIS: StageSpec = StageSpec {
        stage: Stage::Analysis,
        source: TaskStatus::Pending,
        in_progress: TaskStatus::Analyzing,
        success: TaskStatus::AnalysisDone,
        failure: TaskStatus::AnalysisFailed,
    };

    pub const ENRICHMENT: StageSpec = StageSpec {
        stage: Stage::Enrichment,
        source: TaskStatus::AnalysisDone,
        in_progress: TaskStatus::Enriching,
        success: TaskStatus::EnrichmentDone,
        failure: TaskStatus::EnrichmentFailed,
    };

    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Analysis => Self::ANALYSIS,
            Stage::Enrichment => Self::ENRICHMENT,
        }
    }

    /// Status a failed task lands in.
    pub fn failure_status(&self, error: &LicitaiError) -> TaskStatus {
        if error.is_data_integrity() {
            TaskStatus::InsufficientData
        } else {
            self.failure
        }
    }
}

/// Work performed on one claimed task.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(&self, task: &Task, record: &ProcurementRecord) -> Result<StageOutput>;
}

// ---------------------------------------------------------------------------
// Worker config
// ---------------------------------------------------------------------------

/// Runtime worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub reclaim_limit: usize,
    pub idle_interval: Duration,
    pub cycle_interval: Duration,
    pub error_backoff: Duration,
}

impl From<&WorkersConfig> for WorkerConfig {
    fn from(config: &WorkersConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            reclaim_limit: config.reclaim_limit,
            idle_interval: Duration::from_secs(config.idle_secs),
            cycle_interval: Duration::from_secs(config.cycle_secs),
            error_backoff: Duration::from_secs(config.error_backoff_secs),
        }
    }
}

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub reclaimed: usize,
    /// Tasks found in the source status.
    pub found: usize,
    /// Found tasks another process moved before we could claim them.
    pub lost: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Unreadable rows moved to `insufficient-data`.
    pub parked: usize,
}

impl CycleOutcome {
    pub fn is_idle(&self) -> bool {
        self.found == 0
    }
}

enum TaskOutcome {
    Succeeded,
    Failed,
}

// ---------------------------------------------------------------------------
// StageWorker
// ---------------------------------------------------------------------------

pub struct StageWorker<P> {
    storage: Arc<Storage>,
    processor: P,
    spec: StageSpec,
    config: WorkerConfig,
}

impl<P: StageProcessor> StageWorker<P> {
    pub fn new(storage: Arc<Storage>, processor: P, spec: StageSpec, config: WorkerConfig) -> Self {
        Self {
            storage,
            processor,
            spec,
            config,
        }
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// Poll until `cancel` fires. Tasks in flight when it fires are left
    /// in-progress and picked up by the next start's reclaim.
    #[instrument(skip_all, fields(stage = %self.spec.stage))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            source = %self.spec.source,
            batch_size = self.config.batch_size,
            "stage worker started"
        );

        while !cancel.is_cancelled() {
            let pause = match self.run_cycle().await {
                Ok(outcome) if outcome.is_idle() => {
                    debug!(
                        idle_secs = self.config.idle_interval.as_secs(),
                        "no tasks waiting"
                    );
                    self.config.idle_interval
                }
                Ok(outcome) => {
                    info!(
                        reclaimed = outcome.reclaimed,
                        found = outcome.found,
                        lost = outcome.lost,
                        succeeded = outcome.succeeded,
                        failed = outcome.failed,
                        parked = outcome.parked,
                        "cycle finished"
                    );
                    self.config.cycle_interval
                }
                Err(e) => {
                    error!(error = %e, "cycle failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("stage worker stopped");
        Ok(())
    }

    /// One reclaim → claim → process → finalize pass.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        self.reclaim(&mut outcome).await?;

        let candidates = self
            .storage
            .list_task_rows_by_status(self.spec.source, self.config.batch_size)
            .await?;
        outcome.found = candidates.len();
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let task = match row.task {
                Ok(task) => task,
                Err(e) => {
                    if self.park(&row.id, self.spec.source, &e).await {
                        outcome.parked += 1;
                    }
                    continue;
                }
            };
            let won = self
                .storage
                .claim_task(&task.id, self.spec.stage, self.spec.source, self.spec.in_progress)
                .await?;
            if won {
                claimed.push(task);
            } else {
                debug!(task_id = %task.id, "task claimed elsewhere, skipping");
                outcome.lost += 1;
            }
        }

        let results: Vec<TaskOutcome> = stream::iter(claimed)
            .map(|task| async move { self.handle(task).await })
            .buffer_unordered(self.config.batch_size)
            .collect()
            .await;

        for result in results {
            match result {
                TaskOutcome::Succeeded => outcome.succeeded += 1,
                TaskOutcome::Failed => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }

    async fn reclaim(&self, outcome: &mut CycleOutcome) -> Result<()> {
        if self.config.reclaim_limit == 0 {
            return Ok(());
        }

        let stuck = self
            .storage
            .list_task_rows_by_status(self.spec.in_progress, self.config.reclaim_limit)
            .await?;

        for row in stuck {
            let task = match row.task {
                Ok(task) => task,
                Err(e) => {
                    if self.park(&row.id, self.spec.in_progress, &e).await {
                        outcome.parked += 1;
                    }
                    continue;
                }
            };
            if self
                .storage
                .reset_status(&task.id, self.spec.in_progress, self.spec.source)
                .await?
            {
                warn!(
                    task_id = %task.id,
                    from = %self.spec.in_progress,
                    to = %self.spec.source,
                    "reclaimed orphaned task"
                );
                outcome.reclaimed += 1;
            }
        }
        Ok(())
    }

    /// Move a row that failed validation to `insufficient-data`. Returns
    /// whether this worker moved it.
    async fn park(&self, id: &str, from: TaskStatus, error: &LicitaiError) -> bool {
        let text = format!("{}: {error}", error.kind());
        warn!(task_id = id, %from, error = %error, "unreadable task moved to insufficient-data");
        match self
            .storage
            .park_invalid_task(id, self.spec.stage, from, &text)
            .await
        {
            Ok(moved) => moved,
            Err(write_err) => {
                error!(task_id = id, error = %write_err, "could not park unreadable task");
                false
            }
        }
    }

    /// Process one claimed task and write its final status.
    async fn handle(&self, task: Task) -> TaskOutcome {
        let result = match self.storage.get_record(&task.record_id).await {
            Ok(Some(record)) => self.processor.process(&task, &record).await,
            Ok(None) => Err(LicitaiError::data_integrity(format!(
                "record {} not found",
                task.record_id
            ))),
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                match self
                    .storage
                    .complete_task(&task.id, self.spec.in_progress, self.spec.success, &output)
                    .await
                {
                    Ok(true) => debug!(task_id = %task.id, "task completed"),
                    Ok(false) => warn!(task_id = %task.id, "task left in-progress state before completion"),
                    Err(e) => error!(task_id = %task.id, error = %e, "could not record success"),
                }
                TaskOutcome::Succeeded
            }
            Err(e) => {
                let status = self.spec.failure_status(&e);
                let text = format!("{}: {e}", e.kind());
                warn!(task_id = %task.id, %status, error = %e, "task failed");

                if let Err(write_err) = self
                    .storage
                    .fail_task(&task.id, self.spec.stage, self.spec.in_progress, status, &text)
                    .await
                {
                    error!(task_id = %task.id, error = %write_err, "could not record failure");
                }
                TaskOutcome::Failed
            }
        }
    }
}
