pub mod transcribe;

pub use transcribe::{FileProcessor, FileTick};
