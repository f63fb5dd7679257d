use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::mapping::{
    history_from_row, stored_file_from_row, task_file_from_row, task_from_row, to_db_time,
};
use super::{BlobStore, Store};
use crate::schedule::history::HistoryRecorder;
use crate::schedule::types::{
    CycleReset, FileStatus, HistoryEntry, HistoryPayload, StagedFile, StoredFile, Task, TaskFile,
    TaskStatus,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        source_type TEXT NOT NULL,
        remote_path TEXT NOT NULL DEFAULT '',
        task_type TEXT NOT NULL,
        status TEXT NOT NULL,
        run_interval INTEGER NOT NULL DEFAULT 0,
        interval_unit TEXT NOT NULL,
        scheduled_at TEXT NOT NULL,
        last_run TEXT,
        last_error TEXT NOT NULL DEFAULT '',
        meta TEXT NOT NULL DEFAULT '{}',
        result_file TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    r#"
    CREATE TABLE IF NOT EXISTS stored_files (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        original_name TEXT NOT NULL,
        path TEXT,
        size INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_stored_files_task ON stored_files(task_id)",
    r#"
    CREATE TABLE IF NOT EXISTS task_files (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        file_id TEXT NOT NULL REFERENCES stored_files(id) ON DELETE CASCADE,
        status TEXT NOT NULL,
        result_text TEXT,
        error TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(task_id, file_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_files_claim ON task_files(status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS task_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        payload TEXT NOT NULL
    )
    "#,
];

pub struct SqliteStore {
    pool: SqlitePool,
    blobs: BlobStore,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, blobs: BlobStore) -> Result<Self> {
        info!("Initializing SQLite task storage at {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, blobs).await
    }

    pub async fn with_pool(pool: SqlitePool, blobs: BlobStore) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, blobs })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn history(&self, task_id: &str) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query("SELECT * FROM task_history WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn fetch_tasks(&self, sql: &str, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut query = sqlx::query(sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn finish_file(
        &self,
        task_file_id: &str,
        status: FileStatus,
        text: Option<&str>,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_files
            SET status = ?, result_text = ?, error = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(text)
        .bind(error)
        .bind(to_db_time(&Utc::now()))
        .bind(task_file_id)
        .bind(FileStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("task file {} is not being processed", task_file_id);
        }
        Ok(())
    }
}

async fn insert_stored_file(
    conn: &mut SqliteConnection,
    task_id: &str,
    staged: StagedFile,
    now: DateTime<Utc>,
) -> Result<StoredFile> {
    let file = StoredFile {
        id: Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        original_name: staged.original_name,
        path: Some(staged.path),
        size: staged.size,
        created_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO stored_files (id, task_id, original_name, path, size, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&file.id)
    .bind(&file.task_id)
    .bind(&file.original_name)
    .bind(file.path.as_ref().map(|p| p.to_string_lossy().into_owned()))
    .bind(i64::try_from(file.size)?)
    .bind(to_db_time(&file.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(file)
}

/// Delete the task files of `task_id` and the stored files they point at.
/// Returns the payload paths of the deleted stored files.
async fn purge_cycle(conn: &mut SqliteConnection, task_id: &str) -> Result<(usize, Vec<PathBuf>)> {
    let rows = sqlx::query(
        r#"
        SELECT sf.id, sf.path
        FROM stored_files sf
        JOIN task_files tf ON tf.file_id = sf.id
        WHERE tf.task_id = ?
        "#,
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM task_files WHERE task_id = ?")
        .bind(task_id)
        .execute(&mut *conn)
        .await?;

    let mut payloads = Vec::new();
    for row in &rows {
        let id: String = row.try_get("id")?;
        sqlx::query("DELETE FROM stored_files WHERE id = ?")
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        if let Some(path) = row.try_get::<Option<String>, _>("path")? {
            payloads.push(PathBuf::from(path));
        }
    }

    Ok((rows.len(), payloads))
}

async fn materialize(conn: &mut SqliteConnection, task_id: &str) -> Result<usize> {
    let rows = sqlx::query(
        "SELECT id FROM stored_files WHERE task_id = ? ORDER BY created_at, original_name, id",
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?;

    let now = Utc::now();
    let mut created = 0;
    for (i, row) in rows.iter().enumerate() {
        let file_id: String = row.try_get("id")?;
        // keep claim order equal to folder order
        let created_at = to_db_time(&(now + chrono::Duration::microseconds(i as i64)));
        let result = sqlx::query(
            r#"
            INSERT INTO task_files (id, task_id, file_id, status, result_text, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, '', ?, ?)
            ON CONFLICT(task_id, file_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(task_id)
        .bind(&file_id)
        .bind(FileStatus::New.as_str())
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *conn)
        .await?;
        created += result.rows_affected() as usize;
    }

    Ok(created)
}

async fn set_task_status(
    conn: &mut SqliteConnection,
    task_id: &str,
    status: TaskStatus,
    last_error: &str,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(last_error)
    .bind(to_db_time(&Utc::now()))
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {} not found", task_id);
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks
            (id, name, source_type, remote_path, task_type, status, run_interval, interval_unit,
             scheduled_at, last_run, last_error, meta, result_file, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(task.source_type.as_str())
        .bind(&task.remote_path)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(i64::from(task.interval))
        .bind(task.interval_unit.as_str())
        .bind(to_db_time(&task.scheduled_at))
        .bind(task.last_run.as_ref().map(to_db_time))
        .bind(&task.last_error)
        .bind(serde_json::to_string(&task.meta)?)
        .bind(task.result_file.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(to_db_time(&task.created_at))
        .bind(to_db_time(&task.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn schedulable_tasks(&self) -> Result<Vec<Task>> {
        self.fetch_tasks(
            r#"
            SELECT * FROM tasks
            WHERE status = 'NEW' OR (task_type = 'PERIODIC' AND status = 'DONE')
            ORDER BY created_at
            "#,
            None,
        )
        .await
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.fetch_tasks("SELECT * FROM tasks WHERE status = ? ORDER BY created_at", Some(status))
            .await
    }

    async fn mark_ingesting(&self, task_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        set_task_status(&mut conn, task_id, TaskStatus::ProcessingFilledFiles, "").await
    }

    async fn begin_cycle(&self, task_id: &str, staged: Vec<StagedFile>) -> Result<CycleReset> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // write first so the transaction holds the write lock from the start
        set_task_status(&mut tx, task_id, TaskStatus::Processing, "").await?;
        let (purged, payloads) = purge_cycle(&mut tx, task_id).await?;
        let attached = staged.len();
        for file in staged {
            insert_stored_file(&mut tx, task_id, file, now).await?;
        }
        let materialized = materialize(&mut tx, task_id).await?;
        tx.commit().await?;

        for path in &payloads {
            self.blobs.remove(path).await;
        }
        debug!(
            "Cycle reset for task {}: purged={}, attached={}, materialized={}",
            task_id, purged, attached, materialized
        );

        Ok(CycleReset {
            purged,
            attached,
            materialized,
        })
    }

    async fn abort_cycle(&self, task_id: &str, error: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        set_task_status(&mut tx, task_id, TaskStatus::Error, error).await?;
        let (purged, payloads) = purge_cycle(&mut tx, task_id).await?;
        tx.commit().await?;

        for path in &payloads {
            self.blobs.remove(path).await;
        }
        Ok(purged)
    }

    async fn materialize_task_files(&self, task_id: &str) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        materialize(&mut conn, task_id).await
    }

    async fn promote_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'DONE', last_run = ?, last_error = '', updated_at = ?
            WHERE id = ?
              AND status = 'PROCESSING'
              AND NOT EXISTS (
                  SELECT 1 FROM task_files
                  WHERE task_files.task_id = tasks.id AND task_files.status != 'DONE'
              )
            "#,
        )
        .bind(to_db_time(&now))
        .bind(to_db_time(&now))
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_result_file(&self, task_id: &str, path: &Path) -> Result<Option<PathBuf>> {
        let previous: Option<Option<String>> =
            sqlx::query_scalar("SELECT result_file FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(previous) = previous else {
            anyhow::bail!("task {} not found", task_id);
        };

        sqlx::query("UPDATE tasks SET result_file = ?, updated_at = ? WHERE id = ?")
            .bind(path.to_string_lossy().into_owned())
            .bind(to_db_time(&Utc::now()))
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(previous.map(PathBuf::from).filter(|old| old != path))
    }

    async fn add_stored_file(&self, task_id: &str, staged: StagedFile) -> Result<StoredFile> {
        let mut conn = self.pool.acquire().await?;
        insert_stored_file(&mut conn, task_id, staged, Utc::now()).await
    }

    async fn stored_file(&self, file_id: &str) -> Result<Option<StoredFile>> {
        let row = sqlx::query("SELECT * FROM stored_files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stored_file_from_row).transpose()
    }

    async fn task_files(&self, task_id: &str) -> Result<Vec<TaskFile>> {
        let rows = sqlx::query("SELECT * FROM task_files WHERE task_id = ? ORDER BY created_at, id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_file_from_row).collect()
    }

    async fn unfinished_file_count(&self, task_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_files WHERE task_id = ? AND status != 'DONE'",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn claim_next_file(&self) -> Result<Option<TaskFile>> {
        let row = sqlx::query(
            r#"
            UPDATE task_files
            SET status = 'PROCESSING', updated_at = ?
            WHERE status = 'NEW'
              AND id = (
                  SELECT tf.id
                  FROM task_files tf
                  JOIN tasks t ON t.id = tf.task_id
                  WHERE tf.status = 'NEW' AND t.status = 'PROCESSING'
                  ORDER BY tf.created_at, tf.id
                  LIMIT 1
              )
            RETURNING *
            "#,
        )
        .bind(to_db_time(&Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_file_from_row).transpose()
    }

    async fn complete_file(&self, task_file_id: &str, text: &str) -> Result<()> {
        self.finish_file(task_file_id, FileStatus::Done, Some(text), "").await
    }

    async fn fail_file(&self, task_file_id: &str, error: &str) -> Result<()> {
        self.finish_file(task_file_id, FileStatus::Error, None, error).await
    }

    async fn release_payload(&self, file_id: &str) -> Result<()> {
        let path: Option<Option<String>> =
            sqlx::query_scalar("SELECT path FROM stored_files WHERE id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;

        sqlx::query("UPDATE stored_files SET path = NULL WHERE id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;

        if let Some(path) = path.flatten() {
            self.blobs.remove(Path::new(&path)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryRecorder for SqliteStore {
    async fn record(&self, task_id: &str, payload: &HistoryPayload) -> Result<()> {
        sqlx::query("INSERT INTO task_history (task_id, created_at, payload) VALUES (?, ?, ?)")
            .bind(task_id)
            .bind(to_db_time(&Utc::now()))
            .bind(serde_json::to_string(payload)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Single-connection in-memory database; the pool must never drop its only connection.
#[cfg(test)]
pub(crate) async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}
