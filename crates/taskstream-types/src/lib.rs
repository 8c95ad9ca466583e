mod task;
mod update;

pub use task::*;
pub use update::*;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Deterministic orchestrator instance id for a task.
pub fn workflow_id_for(task_id: &str) -> String {
    format!("task-{task_id}")
}
