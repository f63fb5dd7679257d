pub mod chunker;
pub mod decode;

pub use chunker::{chunk_spans, AudioChunker, AudioChunks, ChunkSpan, FfmpegChunker};
pub use decode::{read_samples, TARGET_SAMPLE_RATE};
