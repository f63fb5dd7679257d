use thiserror::Error;

/// Rejected task configuration. Raised when a task is created, never by a tick.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("task name must not be empty")]
    EmptyName,

    #[error("periodic task requires a positive interval")]
    MissingInterval,

    #[error("interval must not exceed {max_days} days")]
    IntervalTooLong { max_days: i64 },

    #[error("remote task requires a remote path")]
    MissingRemotePath,
}

/// Failure of a remote ingestion. Task-level: the cycle is abandoned and the task goes to ERROR.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to download {name}: {source}")]
    Download {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid listing for {path}: {source}")]
    InvalidListing {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to stage {name}: {source}")]
    Stage {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
