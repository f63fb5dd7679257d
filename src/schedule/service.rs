use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::schedule::types::{NewTask, SourceType, StoredFile, Task, TaskFile};
use crate::storage::{BlobStore, Store};

/// Entry point for creating tasks and feeding LOCAL tasks with files.
pub struct TaskService {
    store: Arc<dyn Store>,
    blobs: BlobStore,
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>, blobs: BlobStore) -> Self {
        Self { store, blobs }
    }

    /// Validate and persist a NEW task. Validation errors come back as
    /// [`crate::error::ValidationError`] inside the `anyhow::Error`.
    pub async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        new_task.validate()?;

        let task = new_task.into_task(Utc::now());
        self.store.create_task(&task).await?;
        info!(
            "Created {} {} task {} ({})",
            task.task_type, task.source_type, task.id, task.name
        );
        Ok(task)
    }

    /// Store a file in the folder of a LOCAL task. It joins the next cycle.
    pub async fn upload_file(&self, task_id: &str, name: &str, bytes: &[u8]) -> Result<StoredFile> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {} not found", task_id))?;
        if task.source_type != SourceType::Local {
            anyhow::bail!("task {} pulls its files from {}", task_id, task.remote_path);
        }

        let staged = self
            .blobs
            .stage(name, bytes)
            .await
            .with_context(|| format!("failed to store upload {}", name))?;
        let path = staged.path.clone();
        match self.store.add_stored_file(task_id, staged).await {
            Ok(file) => {
                info!("Uploaded {} ({} bytes) to task {}", name, file.size, task_id);
                Ok(file)
            }
            Err(e) => {
                self.blobs.remove(&path).await;
                Err(e)
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    /// Files of the task's current cycle in processing order.
    pub async fn task_files(&self, task_id: &str) -> Result<Vec<TaskFile>> {
        self.store.task_files(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::schedule::types::{IntervalUnit, TaskStatus};
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    async fn service() -> (TaskService, Arc<MemoryStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(dir.path()).await.unwrap();
        let store = Arc::new(MemoryStore::new(blobs.clone()));
        (TaskService::new(store.clone(), blobs), store, dir)
    }

    #[tokio::test]
    async fn test_create_task_persists_new_task() -> Result<()> {
        let (service, store, _dir) = service().await;
        let task = service
            .create_task(NewTask::periodic(
                "daily calls",
                SourceType::Local,
                1,
                IntervalUnit::Days,
                Utc::now(),
            ))
            .await?;

        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(store.get_task(&task.id).await?, Some(task));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_task_is_rejected() {
        let (service, _store, _dir) = service().await;
        let err = service
            .create_task(NewTask::periodic(
                "broken",
                SourceType::Local,
                0,
                IntervalUnit::Minutes,
                Utc::now(),
            ))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MissingInterval)
        );

        let err = service
            .create_task(NewTask::one_time("remote", SourceType::Remote, Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MissingRemotePath)
        );
    }

    #[tokio::test]
    async fn test_upload_to_local_task() -> Result<()> {
        let (service, store, _dir) = service().await;
        let task = service
            .create_task(NewTask::one_time("calls", SourceType::Local, Utc::now()))
            .await?;

        let file = service.upload_file(&task.id, "call.wav", b"RIFF").await?;
        assert_eq!(file.size, 4);
        assert!(file.path.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(store.stored_file(&file.id).await?, Some(file));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_to_remote_task_is_refused() -> Result<()> {
        let (service, _store, dir) = service().await;
        let task = service
            .create_task(
                NewTask::one_time("calls", SourceType::Remote, Utc::now())
                    .with_remote_path("https://disk.yandex.ru/d/calls"),
            )
            .await?;

        assert!(service.upload_file(&task.id, "call.wav", b"RIFF").await.is_err());
        assert!(service.upload_file("missing", "call.wav", b"RIFF").await.is_err());
        assert_eq!(std::fs::read_dir(dir.path().join("files"))?.count(), 0);
        Ok(())
    }
}
