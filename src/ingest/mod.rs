use async_trait::async_trait;

use crate::error::IngestError;
use crate::schedule::types::{StagedFile, Task};

pub mod yadisk;

pub use yadisk::YaDiskIngester;

/// Pulls the files of a REMOTE task into the blob store.
///
/// Returned payloads are staged only; the scheduler attaches them to the task
/// folder when the cycle starts. An error leaves nothing staged behind.
#[async_trait]
pub trait SourceIngester: Send + Sync {
    async fn ingest(&self, task: &Task) -> Result<Vec<StagedFile>, IngestError>;
}
