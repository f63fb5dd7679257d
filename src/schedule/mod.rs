pub mod history;
pub mod processors;
pub mod readiness;
pub mod scheduler;
pub mod service;
pub mod types;

pub use history::HistoryRecorder;
pub use processors::{FileProcessor, FileTick};
pub use readiness::{is_ready, next_run_time};
pub use scheduler::{CycleReport, SchedulerTick, TaskScheduler, Tick, TickWorker};
pub use service::TaskService;
pub use types::{
    FileStatus, IntervalUnit, NewTask, SourceType, Task, TaskFile, TaskStatus, TaskType,
};

#[cfg(test)]
mod tests;
