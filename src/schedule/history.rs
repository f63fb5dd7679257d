use anyhow::Result;
use async_trait::async_trait;

use crate::schedule::types::HistoryPayload;

/// Append-only audit trail of finished and failed cycles. The scheduler only writes to it.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record(&self, task_id: &str, payload: &HistoryPayload) -> Result<()>;
}
