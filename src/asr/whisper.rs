use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::{AsrParams, TranscribeSegment, TranscriptionEngine};
use crate::audio::read_samples;

/// Lazily loaded whisper model shared by every transcription.
///
/// The ggml file is only read on the first [`WhisperModel::acquire`], on the
/// blocking pool. [`WhisperModel::shutdown`] drops the handle; contexts already
/// handed out stay valid until their last user lets go.
pub struct WhisperModel {
    model_path: PathBuf,
    ctx: Mutex<Option<Arc<WhisperContext>>>,
}

impl WhisperModel {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ctx: Mutex::new(None),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub async fn acquire(&self) -> Result<Arc<WhisperContext>> {
        let mut guard = self.ctx.lock().await;
        if let Some(ctx) = guard.as_ref() {
            return Ok(ctx.clone());
        }

        if !self.model_path.exists() {
            anyhow::bail!("whisper model not found at {}", self.model_path.display());
        }

        info!("Loading whisper model from {}", self.model_path.display());
        let path = self.model_path.to_string_lossy().into_owned();
        let ctx = tokio::task::spawn_blocking(move || {
            WhisperContext::new_with_params(&path, WhisperContextParameters::default())
                .map_err(|e| anyhow::anyhow!("failed to open whisper model {}: {}", path, e))
        })
        .await??;

        let ctx = Arc::new(ctx);
        *guard = Some(ctx.clone());
        info!("Whisper model loaded");
        Ok(ctx)
    }

    pub async fn shutdown(&self) {
        if self.ctx.lock().await.take().is_some() {
            info!("Whisper model released");
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.ctx.lock().await.is_some()
    }
}

pub struct WhisperAsr {
    model: Arc<WhisperModel>,
    params: AsrParams,
}

impl WhisperAsr {
    pub fn new(model: Arc<WhisperModel>, params: AsrParams) -> Self {
        Self { model, params }
    }

    fn build_params<'a>(params: &AsrParams, language: Option<&'a str>) -> FullParams<'a, 'a> {
        let mut full = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        full.set_n_threads(i32::try_from(params.threads).unwrap_or(i32::MAX));
        full.set_language(language);
        full.set_translate(false);
        full.set_temperature(params.temperature);
        // keep context across segments for long recordings
        full.set_no_context(params.no_context);
        full.set_single_segment(false);
        full.set_suppress_blank(true);
        full.set_suppress_non_speech_tokens(true);
        full.set_duration_ms(0);
        full.set_max_initial_ts(1.0);

        full.set_print_special(false);
        full.set_print_progress(false);
        full.set_print_realtime(false);
        full.set_print_timestamps(false);

        full
    }
}

#[async_trait]
impl TranscriptionEngine for WhisperAsr {
    async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<Vec<TranscribeSegment>> {
        let ctx = self.model.acquire().await?;
        let params = self.params.clone();
        let language = language.map(str::to_string);
        let audio_path = audio_path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let audio = read_samples(&audio_path)?;
            debug!("Transcribing {} ({} samples)", audio_path.display(), audio.len());

            let mut state = ctx.create_state().context("failed to create whisper state")?;
            let full = Self::build_params(&params, language.as_deref());
            state
                .full(full, &audio)
                .with_context(|| format!("whisper failed on {}", audio_path.display()))?;

            let num_segments = state.full_n_segments()?;
            let mut segments = Vec::with_capacity(usize::try_from(num_segments).unwrap_or(0));
            for i in 0..num_segments {
                // timestamps come back in centiseconds
                segments.push(TranscribeSegment {
                    start: state.full_get_segment_t0(i)? as f64 / 100.0,
                    end: state.full_get_segment_t1(i)? as f64 / 100.0,
                    text: state.full_get_segment_text(i)?,
                });
            }
            Ok(segments)
        })
        .await?
    }
}
