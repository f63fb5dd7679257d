//! Named, TTL-bound locks that keep scheduler and processor ticks from overlapping.
//!
//! Acquisition never waits: a `false` from [`SchedulerLock::acquire`] means
//! another tick is in flight and the caller should skip this one. A holder that
//! crashes loses its lock once the TTL elapses.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLock;
pub use sqlite::SqliteLock;

pub const SCHEDULER_LOCK: &str = "scheduler";
pub const FILE_PROCESSOR_LOCK: &str = "file-processor";

#[async_trait]
pub trait SchedulerLock: Send + Sync {
    /// Take `name` for at most `ttl`. Returns false when someone else holds a live lock.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool>;

    /// Give `name` back. Does nothing when the lock expired or belongs to another holder.
    async fn release(&self, name: &str) -> Result<()>;
}
