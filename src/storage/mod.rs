use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::schedule::types::{CycleReset, StagedFile, StoredFile, Task, TaskFile, TaskStatus};

pub mod blob;
pub mod mapping;
pub mod memory;
pub mod sqlite;

pub use blob::BlobStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persisted task, folder and task-file state.
///
/// Every method is a single row update or a single transaction; the scheduler
/// and the processor rely on writes being visible to the next query.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Tasks the scheduler should evaluate: NEW ones and finished periodic ones.
    async fn schedulable_tasks(&self) -> Result<Vec<Task>>;
    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Park a remote task while its files are being downloaded.
    async fn mark_ingesting(&self, task_id: &str) -> Result<()>;

    /// In one transaction: set PROCESSING, purge the previous cycle, attach
    /// `staged` to the task folder and materialize task files for the folder.
    async fn begin_cycle(&self, task_id: &str, staged: Vec<StagedFile>) -> Result<CycleReset>;

    /// In one transaction: purge the previous cycle and set ERROR with `error`.
    /// Returns the number of purged files.
    async fn abort_cycle(&self, task_id: &str, error: &str) -> Result<usize>;

    /// get-or-create a NEW task file for every stored file in the task folder.
    /// Returns how many were created.
    async fn materialize_task_files(&self, task_id: &str) -> Result<usize>;

    /// DONE + `last_run = now`, only while PROCESSING with no unfinished task files.
    async fn promote_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Returns the previous result file, if any.
    async fn set_result_file(&self, task_id: &str, path: &Path) -> Result<Option<PathBuf>>;

    async fn add_stored_file(&self, task_id: &str, staged: StagedFile) -> Result<StoredFile>;
    async fn stored_file(&self, file_id: &str) -> Result<Option<StoredFile>>;

    /// Task files of the current cycle in claim order.
    async fn task_files(&self, task_id: &str) -> Result<Vec<TaskFile>>;
    async fn unfinished_file_count(&self, task_id: &str) -> Result<usize>;

    /// Atomically pick the oldest NEW file of a PROCESSING task and mark it PROCESSING.
    async fn claim_next_file(&self) -> Result<Option<TaskFile>>;
    async fn complete_file(&self, task_file_id: &str, text: &str) -> Result<()>;
    async fn fail_file(&self, task_file_id: &str, error: &str) -> Result<()>;

    /// Drop the payload of a stored file but keep its record.
    async fn release_payload(&self, file_id: &str) -> Result<()>;
}
