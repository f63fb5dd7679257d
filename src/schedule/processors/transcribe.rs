use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::asr::{join_segments, TranscriptionEngine};
use crate::audio::AudioChunker;
use crate::lock::{SchedulerLock, FILE_PROCESSOR_LOCK};
use crate::schedule::scheduler::Tick;
use crate::schedule::types::TaskFile;
use crate::storage::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTick {
    /// another processor holds the lock
    Skipped,
    /// nothing to claim
    Idle,
    Done(String),
    Failed(String),
}

/// Claims one pending file per tick and turns it into text.
pub struct FileProcessor {
    store: Arc<dyn Store>,
    lock: Arc<dyn SchedulerLock>,
    chunker: Arc<dyn AudioChunker>,
    engine: Arc<dyn TranscriptionEngine>,
    chunk_length: Duration,
    language: Option<String>,
    lock_ttl: Duration,
}

impl FileProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        lock: Arc<dyn SchedulerLock>,
        chunker: Arc<dyn AudioChunker>,
        engine: Arc<dyn TranscriptionEngine>,
    ) -> Self {
        Self {
            store,
            lock,
            chunker,
            engine,
            chunk_length: Duration::from_secs(30),
            language: Some("ru".to_string()),
            lock_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_chunk_length(mut self, chunk_length: Duration) -> Self {
        self.chunk_length = chunk_length;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language.filter(|l| !l.is_empty());
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// One processor tick: transcribe at most one file.
    pub async fn process_next_file(&self) -> Result<FileTick> {
        if !self.lock.acquire(FILE_PROCESSOR_LOCK, self.lock_ttl).await? {
            debug!("File processor lock is held elsewhere, skipping tick");
            return Ok(FileTick::Skipped);
        }

        let result = self.process_locked().await;
        let released = self.lock.release(FILE_PROCESSOR_LOCK).await;
        let tick = result?;
        released?;
        Ok(tick)
    }

    async fn process_locked(&self) -> Result<FileTick> {
        let Some(task_file) = self.store.claim_next_file().await? else {
            return Ok(FileTick::Idle);
        };

        let span = info_span!("file", task_id = %task_file.task_id, file_id = %task_file.id);
        async {
            match self.transcribe_file(&task_file).await {
                Ok(text) => {
                    self.store.complete_file(&task_file.id, &text).await?;
                    self.store.release_payload(&task_file.file_id).await?;
                    info!("File transcribed ({} chars)", text.chars().count());
                    Ok::<_, anyhow::Error>(FileTick::Done(task_file.id.clone()))
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!("File failed: {}", message);
                    self.store.fail_file(&task_file.id, &message).await?;
                    Ok(FileTick::Failed(task_file.id.clone()))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn transcribe_file(&self, task_file: &TaskFile) -> Result<String> {
        let file = self
            .store
            .stored_file(&task_file.file_id)
            .await?
            .with_context(|| format!("stored file {} is gone", task_file.file_id))?;
        let path = file
            .path
            .with_context(|| format!("payload of {} was already released", file.original_name))?;

        let chunks = self
            .chunker
            .split(&path, self.chunk_length)
            .await
            .with_context(|| format!("failed to split {}", file.original_name))?;
        info!("Transcribing {} in {} chunks", file.original_name, chunks.len());

        let mut texts = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.paths().iter().enumerate() {
            let result = self.engine.transcribe(chunk, self.language.as_deref()).await;
            discard_chunk(chunk).await;

            let segments = result.with_context(|| {
                format!("failed to transcribe chunk {} of {}", i, file.original_name)
            })?;
            let text = join_segments(&segments);
            if !text.is_empty() {
                texts.push(text);
            }
        }

        Ok(texts.join(" "))
    }
}

async fn discard_chunk(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove chunk {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl Tick for FileProcessor {
    fn name(&self) -> &'static str {
        "file-processor"
    }

    async fn tick(&self) -> Result<bool> {
        let tick = self.process_next_file().await?;
        Ok(matches!(tick, FileTick::Done(_) | FileTick::Failed(_)))
    }
}
