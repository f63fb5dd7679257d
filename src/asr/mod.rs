use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod whisper;

pub use whisper::{WhisperAsr, WhisperModel};

/// Decoding knobs for the whisper engine.
#[derive(Debug, Clone)]
pub struct AsrParams {
    pub threads: usize,
    pub temperature: f32,
    pub no_context: bool,
}

impl Default for AsrParams {
    fn default() -> Self {
        Self {
            threads: 8,
            temperature: 0.0,
            no_context: false,
        }
    }
}

impl AsrParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_threads(&mut self, threads: usize) -> &mut Self {
        self.threads = threads.max(1);
        self
    }

    pub fn set_temperature(&mut self, temperature: f32) -> &mut Self {
        self.temperature = temperature;
        self
    }

    pub fn set_no_context(&mut self, no_context: bool) -> &mut Self {
        self.no_context = no_context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeSegment {
    /// seconds from the start of the transcribed file
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Join segment texts with single spaces, dropping blank segments.
pub fn join_segments(segments: &[TranscribeSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribe one audio file. Fails on unreadable audio or an engine error.
    async fn transcribe(&self, audio_path: &Path, language: Option<&str>)
        -> Result<Vec<TranscribeSegment>>;
}
