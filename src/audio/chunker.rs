use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use super::TARGET_SAMPLE_RATE;

/// A contiguous slice of the source, in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start_ms: u64,
    pub duration_ms: u64,
}

/// Split `[0, total_ms)` into `ceil(total_ms / chunk_ms)` back-to-back spans.
/// Every span is `chunk_ms` long except the last, which takes the remainder.
pub fn chunk_spans(total_ms: u64, chunk_ms: u64) -> Vec<ChunkSpan> {
    if chunk_ms == 0 {
        return Vec::new();
    }
    (0..total_ms.div_ceil(chunk_ms))
        .map(|i| {
            let start_ms = i * chunk_ms;
            ChunkSpan {
                start_ms,
                duration_ms: chunk_ms.min(total_ms - start_ms),
            }
        })
        .collect()
}

/// Ordered chunk files living in a private temporary directory.
/// Dropping the set removes whatever chunk files are still on disk.
#[derive(Debug)]
pub struct AudioChunks {
    paths: Vec<PathBuf>,
    _dir: TempDir,
}

impl AudioChunks {
    pub fn new(dir: TempDir, paths: Vec<PathBuf>) -> Self {
        Self { paths, _dir: dir }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[async_trait]
pub trait AudioChunker: Send + Sync {
    /// Cut `path` into 16 kHz mono WAV chunks of `chunk_length`.
    async fn split(&self, path: &Path, chunk_length: Duration) -> Result<AudioChunks>;
}

/// Chunker backed by the ffprobe and ffmpeg binaries.
pub struct FfmpegChunker {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegChunker {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Total duration in whole milliseconds.
    pub async fn probe_duration(&self, path: &Path) -> Result<u64> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.ffprobe))?;

        if !output.status.success() {
            anyhow::bail!(
                "ffprobe failed with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let seconds: f64 = text
            .trim()
            .parse()
            .with_context(|| format!("ffprobe reported no duration for {}", path.display()))?;
        if !seconds.is_finite() || seconds <= 0.0 {
            anyhow::bail!("{} has no positive duration ({})", path.display(), seconds);
        }

        let millis = (seconds * 1000.0).round() as u64;
        if millis == 0 {
            anyhow::bail!("{} is shorter than a millisecond", path.display());
        }
        Ok(millis)
    }

    async fn extract(&self, source: &Path, span: ChunkSpan, target: &Path) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(["-nostdin", "-v", "error", "-y"])
            .arg("-ss")
            .arg(format_seconds(span.start_ms))
            .arg("-t")
            .arg(format_seconds(span.duration_ms))
            .arg("-i")
            .arg(source)
            .args(["-ac", "1", "-ar"])
            .arg(TARGET_SAMPLE_RATE.to_string())
            .args(["-c:a", "pcm_s16le"])
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.ffmpeg))?;

        if !output.status.success() {
            anyhow::bail!(
                "ffmpeg failed with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if !target.exists() {
            anyhow::bail!("ffmpeg produced no chunk at {}", target.display());
        }
        Ok(())
    }
}

#[async_trait]
impl AudioChunker for FfmpegChunker {
    async fn split(&self, path: &Path, chunk_length: Duration) -> Result<AudioChunks> {
        let chunk_ms = u64::try_from(chunk_length.as_millis())?;
        if chunk_ms == 0 {
            anyhow::bail!("chunk length must be positive");
        }

        let total_ms = self.probe_duration(path).await?;
        let spans = chunk_spans(total_ms, chunk_ms);
        info!(
            "Splitting {} ({} ms) into {} chunks of {} ms",
            path.display(),
            total_ms,
            spans.len(),
            chunk_ms
        );

        let dir = tempfile::Builder::new().prefix("asr-chunks-").tempdir()?;
        let mut paths = Vec::with_capacity(spans.len());
        for (i, span) in spans.iter().enumerate() {
            let target = dir.path().join(format!("chunk_{:04}.wav", i));
            self.extract(path, *span, &target)
                .await
                .with_context(|| format!("Failed to extract chunk {} of {}", i, path.display()))?;
            debug!("Extracted chunk {} at {} ms", i, span.start_ms);
            paths.push(target);
        }

        Ok(AudioChunks::new(dir, paths))
    }
}

fn format_seconds(millis: u64) -> String {
    format!("{}.{:03}", millis / 1000, millis % 1000)
}
