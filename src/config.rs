use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

const ASR_SQLITE_PATH: &str = "sqlite://./asr_data/database/storage.db?mode=rwc";
const ASR_STORAGE_PATH: &str = "./asr_data/files";
const ASR_LOG_PATH: &str = "./logs";
const ASR_MODEL_PATH: &str = "./models/ggml-large-v3.bin";
const ASR_YADISK_API: &str = "https://cloud-api.yandex.net";

/// Process configuration. Every key is read from the environment first, then
/// from `.env`, then falls back to its default.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sqlite_path: String,
    pub storage_path: PathBuf,
    pub log_path: PathBuf,
    pub model_path: PathBuf,
    /// whisper language hint, empty means autodetect
    pub language: String,
    pub threads: usize,
    pub temperature: f32,
    /// do not feed previous text back as a prompt
    pub no_context: bool,
    pub chunk_length: Duration,
    pub tick_interval: Duration,
    pub processor_tick_interval: Duration,
    pub processing_budget: Duration,
    pub yadisk_api: String,
    pub yadisk_token: Option<String>,
    pub ffmpeg: String,
    pub ffprobe: String,
}

fn var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(key).ok(),
    }
}

fn string_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

fn parsed_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, value)),
        None => Ok(default),
    }
}

fn seconds_or(key: &str, default: u64) -> Result<Duration> {
    let seconds: u64 = parsed_or(key, default)?;
    if seconds == 0 {
        anyhow::bail!("{} must be positive", key);
    }
    Ok(Duration::from_secs(seconds))
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            sqlite_path: string_or("ASR_SQLITE_PATH", ASR_SQLITE_PATH),
            storage_path: string_or("ASR_STORAGE_PATH", ASR_STORAGE_PATH).into(),
            log_path: string_or("ASR_LOG_PATH", ASR_LOG_PATH).into(),
            model_path: string_or("ASR_MODEL_PATH", ASR_MODEL_PATH).into(),
            language: string_or("ASR_LANGUAGE", "ru"),
            threads: parsed_or("ASR_THREADS", 8)?,
            temperature: parsed_or("ASR_TEMPERATURE", 0.0)?,
            no_context: parsed_or("ASR_NO_CONTEXT", false)?,
            chunk_length: seconds_or("ASR_CHUNK_SECONDS", 30)?,
            tick_interval: seconds_or("ASR_TICK_SECONDS", 60)?,
            processor_tick_interval: seconds_or("ASR_PROCESSOR_TICK_SECONDS", 5)?,
            processing_budget: seconds_or("ASR_PROCESSING_BUDGET_SECONDS", 3600)?,
            yadisk_api: string_or("ASR_YADISK_API", ASR_YADISK_API),
            yadisk_token: var("ASR_YADISK_TOKEN").filter(|t| !t.is_empty()),
            ffmpeg: string_or("ASR_FFMPEG", "ffmpeg"),
            ffprobe: string_or("ASR_FFPROBE", "ffprobe"),
        })
    }

    /// A scheduler tick that outlives twenty cadences is considered dead.
    pub fn scheduler_lock_ttl(&self) -> Duration {
        self.tick_interval.saturating_mul(20)
    }

    pub fn processor_lock_ttl(&self) -> Duration {
        self.processing_budget
    }

    pub fn language_hint(&self) -> Option<String> {
        Some(self.language.trim().to_string()).filter(|l| !l.is_empty())
    }

    /// Create the parent directory of a file-backed SQLite database.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(db_path) = self.sqlite_path.strip_prefix("sqlite://") {
            let db_path = db_path.split('?').next().unwrap_or(db_path);
            if let Some(dir) = std::path::Path::new(db_path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir).with_context(|| {
                        format!("Failed to create database directory {}", dir.display())
                    })?;
                }
            }
        }
        std::fs::create_dir_all(&self.storage_path).with_context(|| {
            format!("Failed to create storage directory {}", self.storage_path.display())
        })?;
        Ok(())
    }
}
