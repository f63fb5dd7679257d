//! When does a task run next, and is that now.

use chrono::{DateTime, Utc};

use crate::schedule::types::{Task, TaskType};

pub fn next_run_time(task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
    if task.task_type == TaskType::OneTime || task.interval == 0 {
        return task.scheduled_at;
    }

    let delta = task.interval_unit.delta(task.interval);
    match task.last_run {
        // a period past the calendar range never comes due
        Some(last_run) => last_run
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
        // the first periodic run waits for scheduled_at but never lies in the past
        None => task.scheduled_at.max(now),
    }
}

pub fn is_ready(task: &Task, now: DateTime<Utc>) -> bool {
    if task.status.is_active() {
        return false;
    }

    match task.task_type {
        TaskType::OneTime => task.last_run.is_none() && task.scheduled_at <= now,
        TaskType::Periodic => now >= next_run_time(task, now),
    }
}
