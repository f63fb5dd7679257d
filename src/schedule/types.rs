use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParseEnumError, ValidationError};

/// Closed string enums persisted as their SCREAMING_SNAKE name.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseEnumError::new($kind, s)),
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    /// files are uploaded into the task folder by hand
    Local,
    /// files are pulled from a remote public folder before each cycle
    Remote,
}

string_enum!(SourceType, "source type", {
    Local => "LOCAL",
    Remote => "REMOTE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    OneTime,
    Periodic,
}

string_enum!(TaskType, "task type", {
    OneTime => "ONE_TIME",
    Periodic => "PERIODIC",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Processing,
    /// remote files are being pulled into the task folder
    ProcessingFilledFiles,
    Done,
    Error,
}

string_enum!(TaskStatus, "task status", {
    New => "NEW",
    Processing => "PROCESSING",
    ProcessingFilledFiles => "PROCESSING_FILLED_FILES",
    Done => "DONE",
    Error => "ERROR",
});

impl TaskStatus {
    /// A cycle currently owns the task.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::ProcessingFilledFiles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

string_enum!(IntervalUnit, "interval unit", {
    Minutes => "MINUTES",
    Hours => "HOURS",
    Days => "DAYS",
});

/// Longest accepted period of a PERIODIC task.
pub const MAX_INTERVAL_DAYS: i64 = 3660;

impl IntervalUnit {
    pub fn delta(&self, interval: u32) -> Duration {
        let interval = i64::from(interval);
        match self {
            Self::Minutes => Duration::minutes(interval),
            Self::Hours => Duration::hours(interval),
            Self::Days => Duration::days(interval),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    New,
    Processing,
    Done,
    Error,
}

string_enum!(FileStatus, "file status", {
    New => "NEW",
    Processing => "PROCESSING",
    Done => "DONE",
    Error => "ERROR",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    /// public link or path of the remote folder, empty for local tasks
    pub remote_path: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub interval: u32,
    pub interval_unit: IntervalUnit,
    /// single execution time for one-time tasks, first execution time for periodic ones
    pub scheduled_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: String,
    pub meta: serde_json::Value,
    /// combined transcript of the last finished cycle
    pub result_file: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub remote_path: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub interval: u32,
    pub interval_unit: IntervalUnit,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default = "empty_meta")]
    pub meta: serde_json::Value,
}

fn empty_meta() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl NewTask {
    pub fn one_time(name: &str, source_type: SourceType, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            source_type,
            remote_path: String::new(),
            task_type: TaskType::OneTime,
            interval: 0,
            interval_unit: IntervalUnit::Days,
            scheduled_at,
            meta: empty_meta(),
        }
    }

    pub fn periodic(
        name: &str,
        source_type: SourceType,
        interval: u32,
        interval_unit: IntervalUnit,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_type: TaskType::Periodic,
            interval,
            interval_unit,
            ..Self::one_time(name, source_type, scheduled_at)
        }
    }

    pub fn with_remote_path(mut self, remote_path: &str) -> Self {
        self.remote_path = remote_path.to_string();
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.task_type == TaskType::Periodic && self.interval == 0 {
            return Err(ValidationError::MissingInterval);
        }
        if self.task_type == TaskType::Periodic
            && self.interval_unit.delta(self.interval) > Duration::days(MAX_INTERVAL_DAYS)
        {
            return Err(ValidationError::IntervalTooLong {
                max_days: MAX_INTERVAL_DAYS,
            });
        }
        if self.source_type == SourceType::Remote && self.remote_path.trim().is_empty() {
            return Err(ValidationError::MissingRemotePath);
        }
        Ok(())
    }

    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            source_type: self.source_type,
            remote_path: self.remote_path.trim().to_string(),
            task_type: self.task_type,
            status: TaskStatus::New,
            interval: self.interval,
            interval_unit: self.interval_unit,
            scheduled_at: self.scheduled_at,
            last_run: None,
            last_error: String::new(),
            meta: self.meta,
            result_file: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An entry of a task's folder. The payload is dropped once its transcript is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: String,
    pub task_id: String,
    pub original_name: String,
    pub path: Option<PathBuf>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// A payload written to the blob store that is not yet attached to a task.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub original_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    pub id: String,
    pub task_id: String,
    pub file_id: String,
    pub status: FileStatus,
    pub result_text: Option<String>,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a cycle reset did to one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReset {
    pub purged: usize,
    pub attached: usize,
    pub materialized: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPayload {
    pub status: TaskStatus,
    pub last_error: String,
    pub files_processed_count: usize,
    pub result_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: HistoryPayload,
}
