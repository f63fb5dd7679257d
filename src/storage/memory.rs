//! Arena + index store: tasks own the id sets of their folder and current
//! cycle, task files only point back at their task by id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use uuid::Uuid;

use super::{BlobStore, Store};
use crate::schedule::history::HistoryRecorder;
use crate::schedule::types::{
    CycleReset, FileStatus, HistoryEntry, HistoryPayload, StagedFile, StoredFile, Task, TaskFile,
    TaskStatus, TaskType,
};

struct TaskEntry {
    task: Task,
    /// stored file ids in upload order
    folder: Vec<String>,
    /// task file ids of the current cycle in claim order
    cycle: Vec<String>,
}

#[derive(Default)]
struct Tables {
    tasks: HashMap<String, TaskEntry>,
    stored_files: HashMap<String, StoredFile>,
    task_files: HashMap<String, TaskFile>,
    history: Vec<HistoryEntry>,
}

impl Tables {
    fn entry(&mut self, task_id: &str) -> Result<&mut TaskEntry> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("task {} not found", task_id))
    }

    fn set_status(&mut self, task_id: &str, status: TaskStatus, last_error: &str) -> Result<()> {
        let entry = self.entry(task_id)?;
        entry.task.status = status;
        entry.task.last_error = last_error.to_string();
        entry.task.updated_at = Utc::now();
        Ok(())
    }

    fn attach(&mut self, task_id: &str, staged: StagedFile, now: DateTime<Utc>) -> Result<StoredFile> {
        let file = StoredFile {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            original_name: staged.original_name,
            path: Some(staged.path),
            size: staged.size,
            created_at: now,
        };
        self.entry(task_id)?.folder.push(file.id.clone());
        self.stored_files.insert(file.id.clone(), file.clone());
        Ok(file)
    }

    fn purge(&mut self, task_id: &str) -> Result<(usize, Vec<PathBuf>)> {
        let entry = self.entry(task_id)?;
        let cycle = std::mem::take(&mut entry.cycle);

        let mut purged_files = Vec::new();
        for task_file_id in cycle {
            if let Some(task_file) = self.task_files.remove(&task_file_id) {
                purged_files.push(task_file.file_id);
            }
        }

        let entry = self.entry(task_id)?;
        entry.folder.retain(|id| !purged_files.contains(id));

        let mut payloads = Vec::new();
        for file_id in &purged_files {
            if let Some(path) = self.stored_files.remove(file_id).and_then(|f| f.path) {
                payloads.push(path);
            }
        }
        Ok((purged_files.len(), payloads))
    }

    fn materialize(&mut self, task_id: &str) -> Result<usize> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("task {} not found", task_id))?;

        let now = Utc::now();
        let mut created = 0;
        for (i, file_id) in entry.folder.iter().enumerate() {
            let exists = entry
                .cycle
                .iter()
                .any(|id| self.task_files.get(id).is_some_and(|tf| &tf.file_id == file_id));
            if exists {
                continue;
            }

            let created_at = now + Duration::microseconds(i as i64);
            let task_file = TaskFile {
                id: Uuid::new_v4().to_string(),
                task_id: task_id.to_string(),
                file_id: file_id.clone(),
                status: FileStatus::New,
                result_text: None,
                error: String::new(),
                created_at,
                updated_at: created_at,
            };
            entry.cycle.push(task_file.id.clone());
            self.task_files.insert(task_file.id.clone(), task_file);
            created += 1;
        }
        Ok(created)
    }

    fn finish(
        &mut self,
        task_file_id: &str,
        status: FileStatus,
        text: Option<&str>,
        error: &str,
    ) -> Result<()> {
        let task_file = self
            .task_files
            .get_mut(task_file_id)
            .filter(|tf| tf.status == FileStatus::Processing)
            .ok_or_else(|| anyhow::anyhow!("task file {} is not being processed", task_file_id))?;

        task_file.status = status;
        task_file.result_text = text.map(str::to_string);
        task_file.error = error.to_string();
        task_file.updated_at = Utc::now();
        Ok(())
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    blobs: BlobStore,
}

impl MemoryStore {
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            blobs,
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| anyhow::anyhow!("store poisoned: {}", e))
    }

    pub fn history(&self, task_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .tables()?
            .history
            .iter()
            .filter(|h| h.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn remove_payloads(&self, payloads: Vec<PathBuf>) {
        for path in &payloads {
            self.blobs.remove(path).await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables()?;
        if tables.tasks.contains_key(&task.id) {
            anyhow::bail!("task {} already exists", task.id);
        }
        tables.tasks.insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                folder: Vec::new(),
                cycle: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tables()?.tasks.get(task_id).map(|e| e.task.clone()))
    }

    async fn schedulable_tasks(&self) -> Result<Vec<Task>> {
        let tables = self.tables()?;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .map(|e| &e.task)
            .filter(|t| {
                t.status == TaskStatus::New
                    || (t.task_type == TaskType::Periodic && t.status == TaskStatus::Done)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let tables = self.tables()?;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .map(|e| &e.task)
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn mark_ingesting(&self, task_id: &str) -> Result<()> {
        self.tables()?
            .set_status(task_id, TaskStatus::ProcessingFilledFiles, "")
    }

    async fn begin_cycle(&self, task_id: &str, staged: Vec<StagedFile>) -> Result<CycleReset> {
        let (reset, payloads) = {
            let mut tables = self.tables()?;
            if !tables.tasks.contains_key(task_id) {
                anyhow::bail!("task {} not found", task_id);
            }

            let now = Utc::now();
            tables.set_status(task_id, TaskStatus::Processing, "")?;
            let (purged, payloads) = tables.purge(task_id)?;
            let attached = staged.len();
            for file in staged {
                tables.attach(task_id, file, now)?;
            }
            let materialized = tables.materialize(task_id)?;
            (
                CycleReset {
                    purged,
                    attached,
                    materialized,
                },
                payloads,
            )
        };

        self.remove_payloads(payloads).await;
        Ok(reset)
    }

    async fn abort_cycle(&self, task_id: &str, error: &str) -> Result<usize> {
        let (purged, payloads) = {
            let mut tables = self.tables()?;
            tables.set_status(task_id, TaskStatus::Error, error)?;
            tables.purge(task_id)?
        };

        self.remove_payloads(payloads).await;
        Ok(purged)
    }

    async fn materialize_task_files(&self, task_id: &str) -> Result<usize> {
        self.tables()?.materialize(task_id)
    }

    async fn promote_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables()?;
        let tables = &mut *tables;
        let Some(entry) = tables.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if entry.task.status != TaskStatus::Processing {
            return Ok(false);
        }
        let unfinished = entry.cycle.iter().any(|id| {
            tables
                .task_files
                .get(id)
                .is_some_and(|tf| tf.status != FileStatus::Done)
        });
        if unfinished {
            return Ok(false);
        }

        // same precision as the sqlite columns
        let now = now.trunc_subsecs(6);
        entry.task.status = TaskStatus::Done;
        entry.task.last_run = Some(now);
        entry.task.last_error.clear();
        entry.task.updated_at = now;
        Ok(true)
    }

    async fn set_result_file(&self, task_id: &str, path: &Path) -> Result<Option<PathBuf>> {
        let mut tables = self.tables()?;
        let entry = tables.entry(task_id)?;
        let previous = entry.task.result_file.replace(path.to_path_buf());
        entry.task.updated_at = Utc::now();
        Ok(previous.filter(|old| old != path))
    }

    async fn add_stored_file(&self, task_id: &str, staged: StagedFile) -> Result<StoredFile> {
        self.tables()?.attach(task_id, staged, Utc::now())
    }

    async fn stored_file(&self, file_id: &str) -> Result<Option<StoredFile>> {
        Ok(self.tables()?.stored_files.get(file_id).cloned())
    }

    async fn task_files(&self, task_id: &str) -> Result<Vec<TaskFile>> {
        let tables = self.tables()?;
        let Some(entry) = tables.tasks.get(task_id) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .cycle
            .iter()
            .filter_map(|id| tables.task_files.get(id).cloned())
            .collect())
    }

    async fn unfinished_file_count(&self, task_id: &str) -> Result<usize> {
        let tables = self.tables()?;
        Ok(tables
            .task_files
            .values()
            .filter(|tf| tf.task_id == task_id && tf.status != FileStatus::Done)
            .count())
    }

    async fn claim_next_file(&self) -> Result<Option<TaskFile>> {
        let mut tables = self.tables()?;
        let tables = &mut *tables;

        let next = tables
            .task_files
            .values()
            .filter(|tf| tf.status == FileStatus::New)
            .filter(|tf| {
                tables
                    .tasks
                    .get(&tf.task_id)
                    .is_some_and(|e| e.task.status == TaskStatus::Processing)
            })
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .map(|tf| tf.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(task_file) = tables.task_files.get_mut(&id) else {
            return Ok(None);
        };
        task_file.status = FileStatus::Processing;
        task_file.updated_at = Utc::now();
        Ok(Some(task_file.clone()))
    }

    async fn complete_file(&self, task_file_id: &str, text: &str) -> Result<()> {
        self.tables()?
            .finish(task_file_id, FileStatus::Done, Some(text), "")
    }

    async fn fail_file(&self, task_file_id: &str, error: &str) -> Result<()> {
        self.tables()?
            .finish(task_file_id, FileStatus::Error, None, error)
    }

    async fn release_payload(&self, file_id: &str) -> Result<()> {
        let payload = self
            .tables()?
            .stored_files
            .get_mut(file_id)
            .and_then(|f| f.path.take());

        if let Some(path) = payload {
            self.blobs.remove(&path).await;
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryRecorder for MemoryStore {
    async fn record(&self, task_id: &str, payload: &HistoryPayload) -> Result<()> {
        self.tables()?.history.push(HistoryEntry {
            task_id: task_id.to_string(),
            created_at: Utc::now(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
