use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use crate::asr::{TranscribeSegment, TranscriptionEngine};
use crate::audio::{AudioChunker, AudioChunks};
use crate::error::IngestError;
use crate::ingest::SourceIngester;
use crate::lock::{MemoryLock, SchedulerLock, SqliteLock, FILE_PROCESSOR_LOCK, SCHEDULER_LOCK};
use crate::schedule::processors::{FileProcessor, FileTick};
use crate::schedule::scheduler::{CycleReport, SchedulerTick, TaskScheduler};
use crate::schedule::service::TaskService;
use crate::schedule::types::*;
use crate::storage::sqlite::memory_pool;
use crate::storage::{BlobStore, MemoryStore, SqliteStore, Store};

/// Serves a fixed listing, or fails with the configured message.
struct FakeIngester {
    blobs: BlobStore,
    outcome: Mutex<Result<Vec<(String, String)>, String>>,
}

impl FakeIngester {
    fn set_files(&self, files: &[(&str, &str)]) {
        *self.outcome.lock().unwrap() = Ok(files
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect());
    }

    fn set_failure(&self, message: &str) {
        *self.outcome.lock().unwrap() = Err(message.to_string());
    }
}

#[async_trait]
impl SourceIngester for FakeIngester {
    async fn ingest(&self, _task: &Task) -> Result<Vec<StagedFile>, IngestError> {
        let outcome = self.outcome.lock().unwrap().clone();
        let files = outcome.map_err(IngestError::SourceUnavailable)?;

        let mut staged = Vec::new();
        for (name, body) in files {
            let file = self
                .blobs
                .stage(&name, body.as_bytes())
                .await
                .map_err(|source| IngestError::Stage {
                    name: name.clone(),
                    source,
                })?;
            staged.push(file);
        }
        Ok(staged)
    }
}

/// Writes `<source text>#<i>` into each chunk. Sources reading "corrupt" cannot be split.
struct FakeChunker {
    chunks: usize,
}

#[async_trait]
impl AudioChunker for FakeChunker {
    async fn split(&self, path: &Path, _chunk_length: Duration) -> Result<AudioChunks> {
        let source = tokio::fs::read_to_string(path).await?;
        if source == "corrupt" {
            anyhow::bail!("no audio stream in {}", path.display());
        }

        let dir = TempDir::new()?;
        let mut paths = Vec::new();
        for i in 0..self.chunks {
            let chunk = dir.path().join(format!("chunk_{i}.wav"));
            tokio::fs::write(&chunk, format!("{source}#{i}")).await?;
            paths.push(chunk);
        }
        Ok(AudioChunks::new(dir, paths))
    }
}

/// Echoes the chunk content back as one segment. Chunk "bad#1" is undecodable.
#[derive(Default)]
struct FakeEngine {
    seen: Mutex<Vec<PathBuf>>,
}

impl FakeEngine {
    fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscriptionEngine for FakeEngine {
    async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<Vec<TranscribeSegment>> {
        self.seen.lock().unwrap().push(audio_path.to_path_buf());
        assert_eq!(language, Some("ru"));

        let text = tokio::fs::read_to_string(audio_path).await?;
        if text == "bad#1" {
            anyhow::bail!("decoder error");
        }
        Ok(vec![TranscribeSegment {
            start: 0.0,
            end: 1.0,
            text: format!(" {text}"),
        }])
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    locks: MemoryLock,
    ingester: Arc<FakeIngester>,
    engine: Arc<FakeEngine>,
    scheduler: TaskScheduler,
    processor: FileProcessor,
    service: TaskService,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let blobs = BlobStore::open(dir.path()).await?;
        let store = Arc::new(MemoryStore::new(blobs.clone()));
        let locks = MemoryLock::new();
        let ingester = Arc::new(FakeIngester {
            blobs: blobs.clone(),
            outcome: Mutex::new(Ok(Vec::new())),
        });
        let engine = Arc::new(FakeEngine::default());

        let scheduler = TaskScheduler::new(
            store.clone(),
            Arc::new(locks.handle()),
            ingester.clone(),
            store.clone(),
            blobs.clone(),
        );
        let processor = FileProcessor::new(
            store.clone(),
            Arc::new(locks.handle()),
            Arc::new(FakeChunker { chunks: 2 }),
            engine.clone(),
        )
        .with_language(Some("ru".to_string()));
        let service = TaskService::new(store.clone(), blobs);

        Ok(Self {
            store,
            locks,
            ingester,
            engine,
            scheduler,
            processor,
            service,
            _dir: dir,
        })
    }

    async fn local_task(&self, uploads: &[(&str, &str)]) -> Result<Task> {
        let task = self
            .service
            .create_task(NewTask::one_time(
                "calls",
                SourceType::Local,
                Utc::now() - chrono::Duration::minutes(1),
            ))
            .await?;
        for (name, body) in uploads {
            self.service.upload_file(&task.id, name, body.as_bytes()).await?;
        }
        Ok(task)
    }

    /// A periodic REMOTE task that finished a cycle long ago and still owns one file.
    async fn remote_task_with_previous_cycle(&self) -> Result<(Task, PathBuf)> {
        let now = Utc::now();
        let mut task = NewTask::periodic("disk", SourceType::Remote, 1, IntervalUnit::Hours, now)
            .with_remote_path("https://disk.yandex.ru/d/calls")
            .into_task(now);
        task.status = TaskStatus::Done;
        task.last_run = Some(now - chrono::Duration::hours(2));
        self.store.create_task(&task).await?;

        let old = self.ingester.blobs.stage("old.mp3", b"old").await?;
        let old_path = old.path.clone();
        self.store.add_stored_file(&task.id, old).await?;
        self.store.materialize_task_files(&task.id).await?;
        Ok((task, old_path))
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.store.get_task(task_id).await?.expect("task exists").status)
    }

    async fn drain(&self) -> Result<Vec<FileTick>> {
        let mut ticks = Vec::new();
        loop {
            match self.processor.process_next_file().await? {
                FileTick::Idle => return Ok(ticks),
                tick => ticks.push(tick),
            }
        }
    }
}

fn ran(tick: SchedulerTick) -> CycleReport {
    match tick {
        SchedulerTick::Ran(report) => report,
        SchedulerTick::Skipped => panic!("Expected a scheduler run, got Skipped"),
    }
}

#[tokio::test]
async fn test_local_task_lifecycle() -> Result<()> {
    let h = Harness::new().await?;
    let task = h.local_task(&[("a.wav", "hello"), ("b.wav", "world")]).await?;

    let report = ran(h.scheduler.run_ready_tasks().await?);
    assert_eq!(report.admitted, 1);
    assert_eq!(report.promoted, 0);
    assert_eq!(h.status(&task.id).await?, TaskStatus::Processing);
    assert_eq!(h.service.task_files(&task.id).await?.len(), 2);

    let ticks = h.drain().await?;
    assert_eq!(ticks.len(), 2);
    assert!(ticks.iter().all(|t| matches!(t, FileTick::Done(_))));

    let files = h.service.task_files(&task.id).await?;
    assert_eq!(files[0].result_text.as_deref(), Some("hello#0 hello#1"));
    assert_eq!(files[1].result_text.as_deref(), Some("world#0 world#1"));
    for file in &files {
        let stored = h.store.stored_file(&file.file_id).await?.expect("record kept");
        assert!(stored.path.is_none(), "payload released after transcription");
    }

    let report = ran(h.scheduler.run_ready_tasks().await?);
    assert_eq!(report.promoted, 1);

    let done = h.service.get_task(&task.id).await?.expect("task exists");
    assert_eq!(done.status, TaskStatus::Done);
    assert!(done.last_run.is_some());
    let transcript = std::fs::read_to_string(done.result_file.as_ref().expect("result file"))?;
    assert_eq!(transcript, "hello#0 hello#1\n\nworld#0 world#1");

    let history = h.store.history(&task.id)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload.status, TaskStatus::Done);
    assert_eq!(history[0].payload.files_processed_count, 2);

    // one-time tasks run once
    let report = ran(h.scheduler.run_ready_tasks().await?);
    assert_eq!(report, CycleReport::default());
    Ok(())
}

#[tokio::test]
async fn test_held_scheduler_lock_changes_nothing() -> Result<()> {
    let h = Harness::new().await?;
    let task = h.local_task(&[("a.wav", "hello")]).await?;

    let other = h.locks.handle();
    assert!(other.acquire(SCHEDULER_LOCK, Duration::from_secs(60)).await?);

    assert_eq!(h.scheduler.run_ready_tasks().await?, SchedulerTick::Skipped);
    assert_eq!(h.status(&task.id).await?, TaskStatus::New);
    assert!(h.service.task_files(&task.id).await?.is_empty());

    other.release(SCHEDULER_LOCK).await?;
    assert_eq!(ran(h.scheduler.run_ready_tasks().await?).admitted, 1);
    Ok(())
}

#[tokio::test]
async fn test_held_processor_lock_skips_tick() -> Result<()> {
    let h = Harness::new().await?;
    let task = h.local_task(&[("a.wav", "hello")]).await?;
    h.scheduler.run_ready_tasks().await?;

    let other = h.locks.handle();
    assert!(other.acquire(FILE_PROCESSOR_LOCK, Duration::from_secs(60)).await?);
    assert_eq!(h.processor.process_next_file().await?, FileTick::Skipped);
    assert_eq!(h.service.task_files(&task.id).await?[0].status, FileStatus::New);

    // the scheduler lock is a different name
    assert!(matches!(h.scheduler.run_ready_tasks().await?, SchedulerTick::Ran(_)));
    Ok(())
}

#[tokio::test]
async fn test_failed_file_keeps_task_processing() -> Result<()> {
    let h = Harness::new().await?;
    let task = h.local_task(&[("good.wav", "fine"), ("bad.wav", "bad")]).await?;
    h.scheduler.run_ready_tasks().await?;

    let ticks = h.drain().await?;
    assert!(matches!(ticks[0], FileTick::Done(_)));
    assert!(matches!(ticks[1], FileTick::Failed(_)));

    let files = h.service.task_files(&task.id).await?;
    assert_eq!(files[1].status, FileStatus::Error);
    assert!(files[1].result_text.is_none());
    assert_eq!(files[1].error, "failed to transcribe chunk 1 of bad.wav: decoder error");

    for _ in 0..3 {
        assert_eq!(ran(h.scheduler.run_ready_tasks().await?).promoted, 0);
        assert_eq!(h.status(&task.id).await?, TaskStatus::Processing);
    }
    Ok(())
}

#[tokio::test]
async fn test_pending_file_blocks_promotion() -> Result<()> {
    let h = Harness::new().await?;
    let task = h
        .local_task(&[("a.wav", "one"), ("b.wav", "two"), ("c.wav", "three")])
        .await?;
    h.scheduler.run_ready_tasks().await?;

    for _ in 0..2 {
        assert!(matches!(h.processor.process_next_file().await?, FileTick::Done(_)));
    }
    let statuses: Vec<_> = h
        .service
        .task_files(&task.id)
        .await?
        .iter()
        .map(|f| f.status)
        .collect();
    assert_eq!(statuses, vec![FileStatus::Done, FileStatus::Done, FileStatus::New]);

    for _ in 0..3 {
        assert_eq!(ran(h.scheduler.run_ready_tasks().await?).promoted, 0);
        assert_eq!(h.status(&task.id).await?, TaskStatus::Processing);
    }

    assert!(matches!(h.processor.process_next_file().await?, FileTick::Done(_)));
    assert_eq!(ran(h.scheduler.run_ready_tasks().await?).promoted, 1);
    assert_eq!(h.status(&task.id).await?, TaskStatus::Done);
    Ok(())
}

#[tokio::test]
async fn test_unsplittable_file_fails_alone() -> Result<()> {
    let h = Harness::new().await?;
    let task = h.local_task(&[("broken.wav", "corrupt"), ("ok.wav", "fine")]).await?;
    h.scheduler.run_ready_tasks().await?;

    let ticks = h.drain().await?;
    assert_eq!(ticks.len(), 2);

    let files = h.service.task_files(&task.id).await?;
    assert_eq!(files[0].status, FileStatus::Error);
    assert!(files[0].error.starts_with("failed to split broken.wav: no audio stream"));
    assert_eq!(files[1].status, FileStatus::Done);
    Ok(())
}

#[tokio::test]
async fn test_chunks_are_discarded_after_use() -> Result<()> {
    let h = Harness::new().await?;
    h.local_task(&[("a.wav", "hello"), ("bad.wav", "bad")]).await?;
    h.scheduler.run_ready_tasks().await?;
    h.drain().await?;

    let seen = h.engine.seen();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|chunk| !chunk.exists()));
    assert!(seen.iter().all(|chunk| chunk.parent().is_some_and(|dir| !dir.exists())));
    Ok(())
}

#[tokio::test]
async fn test_claimed_file_is_never_reclaimed() -> Result<()> {
    let h = Harness::new().await?;
    let task = h.local_task(&[("a.wav", "first"), ("b.wav", "second")]).await?;
    h.scheduler.run_ready_tasks().await?;

    // a processor that claimed the first file and died
    let stuck = h.store.claim_next_file().await?.expect("claim");

    let ticks = h.drain().await?;
    assert_eq!(ticks.len(), 1);
    assert_ne!(ticks[0], FileTick::Done(stuck.id.clone()));

    let files = h.service.task_files(&task.id).await?;
    assert_eq!(files[0].status, FileStatus::Processing);
    assert_eq!(ran(h.scheduler.run_ready_tasks().await?).promoted, 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_task_is_promoted_in_the_same_tick() -> Result<()> {
    let h = Harness::new().await?;
    let task = h.local_task(&[]).await?;

    let report = ran(h.scheduler.run_ready_tasks().await?);
    assert_eq!(report.admitted, 1);
    assert_eq!(report.promoted, 1);
    assert_eq!(h.status(&task.id).await?, TaskStatus::Done);
    Ok(())
}

#[tokio::test]
async fn test_future_tasks_wait() -> Result<()> {
    let h = Harness::new().await?;
    let task = h
        .service
        .create_task(NewTask::periodic(
            "later",
            SourceType::Local,
            5,
            IntervalUnit::Minutes,
            Utc::now() + chrono::Duration::hours(1),
        ))
        .await?;

    assert_eq!(ran(h.scheduler.run_ready_tasks().await?).admitted, 0);
    assert_eq!(h.status(&task.id).await?, TaskStatus::New);
    Ok(())
}

#[tokio::test]
async fn test_remote_ingestion_failure_marks_error() -> Result<()> {
    let h = Harness::new().await?;
    let (task, old_path) = h.remote_task_with_previous_cycle().await?;
    h.ingester.set_failure("https://disk.yandex.ru/d/calls returned 404 Not Found");

    let report = ran(h.scheduler.run_ready_tasks().await?);
    assert_eq!(report.failed, 1);
    assert_eq!(report.admitted, 0);

    let failed = h.service.get_task(&task.id).await?.expect("task exists");
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.last_error.contains("404 Not Found"));
    assert!(h.service.task_files(&task.id).await?.is_empty());
    assert!(!old_path.exists());

    let history = h.store.history(&task.id)?;
    assert_eq!(history[0].payload.status, TaskStatus::Error);

    // ERROR tasks are left alone
    h.ingester.set_files(&[("new.mp3", "fresh")]);
    assert_eq!(ran(h.scheduler.run_ready_tasks().await?), CycleReport::default());
    Ok(())
}

#[tokio::test]
async fn test_remote_ingestion_replaces_previous_cycle() -> Result<()> {
    let h = Harness::new().await?;
    let (task, old_path) = h.remote_task_with_previous_cycle().await?;
    h.ingester.set_files(&[("new.mp3", "fresh")]);

    assert_eq!(ran(h.scheduler.run_ready_tasks().await?).admitted, 1);
    assert_eq!(h.status(&task.id).await?, TaskStatus::Processing);
    assert!(!old_path.exists());

    let files = h.service.task_files(&task.id).await?;
    assert_eq!(files.len(), 1);
    let stored = h.store.stored_file(&files[0].file_id).await?.expect("stored");
    assert_eq!(stored.original_name, "new.mp3");

    h.drain().await?;
    assert_eq!(ran(h.scheduler.run_ready_tasks().await?).promoted, 1);
    let done = h.service.get_task(&task.id).await?.expect("task exists");
    assert_eq!(done.status, TaskStatus::Done);
    assert!(done.last_run > task.last_run);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_backed_cycle() -> Result<()> {
    let dir = TempDir::new()?;
    let blobs = BlobStore::open(dir.path()).await?;
    let pool = memory_pool().await?;
    let store = Arc::new(SqliteStore::with_pool(pool.clone(), blobs.clone()).await?);
    let scheduler_lock: Arc<dyn SchedulerLock> = Arc::new(SqliteLock::new(pool.clone()).await?);
    let processor_lock: Arc<dyn SchedulerLock> = Arc::new(SqliteLock::new(pool).await?);

    let scheduler = TaskScheduler::new(
        store.clone(),
        scheduler_lock,
        Arc::new(FakeIngester {
            blobs: blobs.clone(),
            outcome: Mutex::new(Ok(Vec::new())),
        }),
        store.clone(),
        blobs.clone(),
    );
    let processor = FileProcessor::new(
        store.clone(),
        processor_lock,
        Arc::new(FakeChunker { chunks: 1 }),
        Arc::new(FakeEngine::default()),
    );
    let service = TaskService::new(store.clone(), blobs);

    let task = service
        .create_task(NewTask::one_time("calls", SourceType::Local, Utc::now()))
        .await?;
    service.upload_file(&task.id, "a.wav", b"hello").await?;

    assert_eq!(ran(scheduler.run_ready_tasks().await?).admitted, 1);
    assert!(matches!(processor.process_next_file().await?, FileTick::Done(_)));
    assert_eq!(processor.process_next_file().await?, FileTick::Idle);
    assert_eq!(ran(scheduler.run_ready_tasks().await?).promoted, 1);

    let done = service.get_task(&task.id).await?.expect("task exists");
    assert_eq!(done.status, TaskStatus::Done);
    let history = store.history(&task.id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].payload.result_reference.as_deref(),
        Some(format!("results/task_{}_transcript.txt", task.id).as_str())
    );
    Ok(())
}
