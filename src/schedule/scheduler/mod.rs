mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

pub use worker::{Tick, TickWorker};

use crate::ingest::SourceIngester;
use crate::lock::{SchedulerLock, SCHEDULER_LOCK};
use crate::schedule::history::HistoryRecorder;
use crate::schedule::readiness::is_ready;
use crate::schedule::types::{FileStatus, HistoryPayload, SourceType, Task, TaskStatus};
use crate::storage::{BlobStore, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// tasks whose new cycle started
    pub admitted: usize,
    /// remote tasks whose ingestion failed
    pub failed: usize,
    pub promoted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerTick {
    /// another scheduler holds the lock
    Skipped,
    Ran(CycleReport),
}

/// Drives the task cycle: admits ready tasks and promotes finished ones.
pub struct TaskScheduler {
    store: Arc<dyn Store>,
    lock: Arc<dyn SchedulerLock>,
    ingester: Arc<dyn SourceIngester>,
    history: Arc<dyn HistoryRecorder>,
    blobs: BlobStore,
    lock_ttl: Duration,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        lock: Arc<dyn SchedulerLock>,
        ingester: Arc<dyn SourceIngester>,
        history: Arc<dyn HistoryRecorder>,
        blobs: BlobStore,
    ) -> Self {
        Self {
            store,
            lock,
            ingester,
            history,
            blobs,
            lock_ttl: Duration::from_secs(20 * 60),
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// One scheduler tick. Does nothing when another tick holds the scheduler lock.
    pub async fn run_ready_tasks(&self) -> Result<SchedulerTick> {
        if !self.lock.acquire(SCHEDULER_LOCK, self.lock_ttl).await? {
            debug!("Scheduler lock is held elsewhere, skipping tick");
            return Ok(SchedulerTick::Skipped);
        }

        let result = self.run_locked(Utc::now().trunc_subsecs(6)).await;
        let released = self.lock.release(SCHEDULER_LOCK).await;
        let report = result?;
        released?;

        if report != CycleReport::default() {
            info!(
                "Scheduler tick: admitted={}, failed={}, promoted={}",
                report.admitted, report.failed, report.promoted
            );
        }
        Ok(SchedulerTick::Ran(report))
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for task in self.store.schedulable_tasks().await? {
            if !is_ready(&task, now) {
                debug!("Task {} is not ready", task.id);
                continue;
            }

            let span = info_span!("task_cycle", task_id = %task.id);
            if self.admit(&task).instrument(span).await? {
                report.admitted += 1;
            } else {
                report.failed += 1;
            }
        }

        report.promoted = self.promote_finished(now).await?;
        Ok(report)
    }

    /// Start a new cycle for `task`. Returns false when remote ingestion failed.
    async fn admit(&self, task: &Task) -> Result<bool> {
        let staged = match task.source_type {
            SourceType::Local => Vec::new(),
            SourceType::Remote => {
                self.store.mark_ingesting(&task.id).await?;
                info!("Ingesting remote files from {}", task.remote_path);

                match self.ingester.ingest(task).await {
                    Ok(staged) => staged,
                    Err(e) => {
                        let message = e.to_string();
                        warn!("Ingestion failed: {}", message);
                        let purged = self.store.abort_cycle(&task.id, &message).await?;
                        debug!("Dropped {} files of the previous cycle", purged);
                        self.history
                            .record(
                                &task.id,
                                &HistoryPayload {
                                    status: TaskStatus::Error,
                                    last_error: message,
                                    files_processed_count: 0,
                                    result_reference: None,
                                },
                            )
                            .await?;
                        return Ok(false);
                    }
                }
            }
        };

        let payloads: Vec<_> = staged.iter().map(|f| f.path.clone()).collect();
        match self.store.begin_cycle(&task.id, staged).await {
            Ok(reset) => {
                info!(
                    "Cycle started: purged={}, attached={}, files={}",
                    reset.purged, reset.attached, reset.materialized
                );
                Ok(true)
            }
            Err(e) => {
                for path in &payloads {
                    self.blobs.remove(path).await;
                }
                Err(e.context(format!("failed to start cycle of task {}", task.id)))
            }
        }
    }

    /// Promote every PROCESSING task that has no unfinished files left.
    async fn promote_finished(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut promoted = 0;

        for task in self.store.tasks_with_status(TaskStatus::Processing).await? {
            let unfinished = self.store.unfinished_file_count(&task.id).await?;
            if unfinished > 0 {
                debug!("Task {} still has {} unfinished files", task.id, unfinished);
                continue;
            }
            if !self.store.promote_task(&task.id, now).await? {
                continue;
            }

            let span = info_span!("task_cycle", task_id = %task.id);
            self.finish_cycle(&task).instrument(span).await?;
            promoted += 1;
        }

        Ok(promoted)
    }

    async fn finish_cycle(&self, task: &Task) -> Result<()> {
        let files = self.store.task_files(&task.id).await?;
        let transcript = files
            .iter()
            .filter(|f| f.status == FileStatus::Done)
            .filter_map(|f| f.result_text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n");

        let path = self
            .blobs
            .write_result(&task.id, &transcript)
            .await
            .context("failed to write combined transcript")?;
        if let Some(previous) = self.store.set_result_file(&task.id, &path).await? {
            self.blobs.remove(&previous).await;
        }

        let reference = path
            .strip_prefix(self.blobs.root())
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        info!("Task done with {} files, transcript at {}", files.len(), reference);

        self.history
            .record(
                &task.id,
                &HistoryPayload {
                    status: TaskStatus::Done,
                    last_error: String::new(),
                    files_processed_count: files.len(),
                    result_reference: Some(reference),
                },
            )
            .await
    }
}

#[async_trait]
impl Tick for TaskScheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn tick(&self) -> Result<bool> {
        // admitted files are picked up by the processor; the scheduler keeps its cadence
        self.run_ready_tasks().await.map(|_| false)
    }
}
