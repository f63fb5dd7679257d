use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::SchedulerLock;

#[derive(Debug)]
struct Lease {
    holder: String,
    /// `None` when the deadline is past what an `Instant` can hold
    expires_at: Option<Instant>,
}

/// In-process lock table. Handles created with [`MemoryLock::handle`] share the
/// table but act as distinct holders.
#[derive(Clone)]
pub struct MemoryLock {
    holder: String,
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self {
            holder: Uuid::new_v4().to_string(),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn handle(&self) -> Self {
        Self {
            holder: Uuid::new_v4().to_string(),
            leases: self.leases.clone(),
        }
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulerLock for MemoryLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| anyhow::anyhow!("lock table poisoned: {}", e))?;
        let now = Instant::now();

        if let Some(lease) = leases.get(name) {
            if lease.expires_at.map_or(true, |at| at > now) {
                return Ok(false);
            }
        }

        leases.insert(
            name.to_string(),
            Lease {
                holder: self.holder.clone(),
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str) -> Result<()> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| anyhow::anyhow!("lock table poisoned: {}", e))?;

        if leases.get(name).is_some_and(|lease| lease.holder == self.holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_refused_while_lock_is_live() -> Result<()> {
        let first = MemoryLock::new();
        let second = first.handle();

        assert!(first.acquire("scheduler", Duration::from_secs(60)).await?);
        assert!(!second.acquire("scheduler", Duration::from_secs(60)).await?);
        // a holder cannot re-enter its own live lock either
        assert!(!first.acquire("scheduler", Duration::from_secs(60)).await?);

        first.release("scheduler").await?;
        assert!(second.acquire("scheduler", Duration::from_secs(60)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn names_are_independent() -> Result<()> {
        let lock = MemoryLock::new();
        assert!(lock.acquire("scheduler", Duration::from_secs(60)).await?);
        assert!(lock.handle().acquire("file-processor", Duration::from_secs(60)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn lock_expires_after_ttl() -> Result<()> {
        let first = MemoryLock::new();
        let second = first.handle();

        assert!(first.acquire("scheduler", Duration::from_millis(30)).await?);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(second.acquire("scheduler", Duration::from_secs(60)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn huge_ttl_holds_the_lock() -> Result<()> {
        let first = MemoryLock::new();
        assert!(first.acquire("scheduler", Duration::MAX).await?);
        assert!(!first.handle().acquire("scheduler", Duration::from_secs(60)).await?);

        first.release("scheduler").await?;
        assert!(first.handle().acquire("scheduler", Duration::from_secs(60)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn stale_release_keeps_new_holder() -> Result<()> {
        let first = MemoryLock::new();
        let second = first.handle();

        assert!(first.acquire("scheduler", Duration::from_millis(30)).await?);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(second.acquire("scheduler", Duration::from_secs(60)).await?);

        first.release("scheduler").await?;
        assert!(!first.handle().acquire("scheduler", Duration::from_secs(60)).await?);
        Ok(())
    }
}
