use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use super::SchedulerLock;

/// Lock table shared by every process that opens the same database.
pub struct SqliteLock {
    pool: SqlitePool,
    holder: String,
}

impl SqliteLock {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduler_locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            holder: Uuid::new_v4().to_string(),
        })
    }
}

#[async_trait]
impl SchedulerLock for SqliteLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);

        // only an expired row may be taken over
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_locks (name, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE
                SET holder = excluded.holder,
                    expires_at = excluded.expires_at
                WHERE scheduler_locks.expires_at <= ?
            "#,
        )
        .bind(name)
        .bind(&self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!("Lock {} acquire by {}: {}", name, self.holder, acquired);
        Ok(acquired)
    }

    async fn release(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
