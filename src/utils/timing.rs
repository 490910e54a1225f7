use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Runs `task` and logs its wall-clock duration at debug level.
pub fn measure_execution<T, F>(task_name: &str, context: Option<&str>, logger: &Logger, task: F) -> T
where
    F: FnOnce() -> T,
{
    let started_at = Instant::now();
    let result = task();
    let elapsed = started_at.elapsed();

    logger.log(
        LogLevel::Debug,
        context,
        &format!("task '{task_name}' finished in {}", format_duration_human_friendly(elapsed)),
        Some(json!({ "elapsed_ms": elapsed.as_millis() as u64 })),
    );
    result
}

pub fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_seconds:.2} s");
    }

    let minutes = (total_seconds / 60.0).floor();
    let seconds = total_seconds - minutes * 60.0;
    format!("{minutes:.0} min {seconds:.2} s")
}
