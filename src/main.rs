#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use asr_pipeline::asr::{AsrParams, WhisperAsr, WhisperModel};
use asr_pipeline::audio::FfmpegChunker;
use asr_pipeline::ingest::YaDiskIngester;
use asr_pipeline::lock::SqliteLock;
use asr_pipeline::schedule::{FileProcessor, TaskScheduler, TickWorker};
use asr_pipeline::storage::{BlobStore, SqliteStore};
use asr_pipeline::{init_env, utils::logger, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    let settings = Settings::from_env()?;
    let _guard = logger::init(&settings.log_path)?;
    settings.ensure_dirs()?;

    info!("Starting asr-pipeline {}", env!("GIT_HASH"));

    info!("Initializing storage...");
    let blobs = BlobStore::open(&settings.storage_path).await?;
    let store = Arc::new(SqliteStore::connect(&settings.sqlite_path, blobs.clone()).await?);

    // both locks share the database; each handle is its own holder
    let scheduler_lock = Arc::new(SqliteLock::new(store.pool().clone()).await?);
    let processor_lock = Arc::new(SqliteLock::new(store.pool().clone()).await?);

    let model = Arc::new(WhisperModel::new(&settings.model_path));
    info!("Whisper model: {}", model.model_path().display());
    let mut asr_params = AsrParams::new();
    asr_params
        .set_threads(settings.threads)
        .set_temperature(settings.temperature)
        .set_no_context(settings.no_context);
    let engine = Arc::new(WhisperAsr::new(model.clone(), asr_params));

    let ingester = Arc::new(YaDiskIngester::new(
        &settings.yadisk_api,
        settings.yadisk_token.clone(),
        blobs.clone(),
    )?);

    let scheduler = TaskScheduler::new(
        store.clone(),
        scheduler_lock,
        ingester,
        store.clone(),
        blobs,
    )
    .with_lock_ttl(settings.scheduler_lock_ttl());

    let processor = FileProcessor::new(
        store,
        processor_lock,
        Arc::new(FfmpegChunker::new(&settings.ffmpeg, &settings.ffprobe)),
        engine,
    )
    .with_chunk_length(settings.chunk_length)
    .with_language(settings.language_hint())
    .with_lock_ttl(settings.processor_lock_ttl());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = vec![
        tokio::spawn(
            TickWorker::new(Arc::new(scheduler), shutdown_rx.clone())
                .with_interval(settings.tick_interval)
                .run(),
        ),
        tokio::spawn(
            TickWorker::new(Arc::new(processor), shutdown_rx)
                .with_interval(settings.processor_tick_interval)
                .run(),
        ),
    ];

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown_tx.send(true)?;

    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker panicked: {}", e);
        }
    }

    model.shutdown().await;
    info!("Stopped");
    Ok(())
}
