use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::schedule::types::{HistoryEntry, StoredFile, Task, TaskFile};

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
/// Precision is one microsecond.
pub fn to_db_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

fn opt_time(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(from_db_time).transpose()
}

pub fn task_from_row(row: &SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_type: row.try_get::<String, _>("source_type")?.parse()?,
        remote_path: row.try_get("remote_path")?,
        task_type: row.try_get::<String, _>("task_type")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        interval: u32::try_from(row.try_get::<i64, _>("run_interval")?)?,
        interval_unit: row.try_get::<String, _>("interval_unit")?.parse()?,
        scheduled_at: from_db_time(&row.try_get::<String, _>("scheduled_at")?)?,
        last_run: opt_time(row.try_get("last_run")?)?,
        last_error: row.try_get("last_error")?,
        meta: serde_json::from_str(&row.try_get::<String, _>("meta")?)?,
        result_file: row.try_get::<Option<String>, _>("result_file")?.map(PathBuf::from),
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_db_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

pub fn stored_file_from_row(row: &SqliteRow) -> Result<StoredFile> {
    Ok(StoredFile {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        original_name: row.try_get("original_name")?,
        path: row.try_get::<Option<String>, _>("path")?.map(PathBuf::from),
        size: u64::try_from(row.try_get::<i64, _>("size")?)?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
    })
}

pub fn task_file_from_row(row: &SqliteRow) -> Result<TaskFile> {
    Ok(TaskFile {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        file_id: row.try_get("file_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        result_text: row.try_get("result_text")?,
        error: row.try_get("error")?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_db_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

pub fn history_from_row(row: &SqliteRow) -> Result<HistoryEntry> {
    Ok(HistoryEntry {
        task_id: row.try_get("task_id")?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        payload: serde_json::from_str(&row.try_get::<String, _>("payload")?)?,
    })
}
