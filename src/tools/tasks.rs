//! Heartbeat task completion: checks off a line in the task file.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::Tool;
use crate::heartbeat::mark_task_done;

/// Marks a heartbeat task done by its 1-based line number, replacing the
/// first `[ ]` on that line with `[x]`.
pub struct CompleteTaskTool {
    tasks_path: PathBuf,
}

impl CompleteTaskTool {
    pub fn new(tasks_path: impl Into<PathBuf>) -> Self {
        Self {
            tasks_path: tasks_path.into(),
        }
    }
}

#[async_trait]
impl Tool for CompleteTaskTool {
    fn name(&self) -> &str {
        "complete_task"
    }

    fn description(&self) -> &str {
        "Mark a heartbeat task as done by its line number (from the pending task list)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "line": {"type": "integer", "description": "1-based line number of the task"}
            },
            "required": ["line"]
        })
    }

    async fn call(&self, args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        let line = args
            .get("line")
            .and_then(|v| v.as_u64())
            .filter(|n| *n > 0)
            .ok_or_else(|| anyhow::anyhow!("missing required argument: line"))?
            as usize;

        let content = fs::read_to_string(&self.tasks_path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", self.tasks_path.display()))?;
        let updated = mark_task_done(&content, line)
            .ok_or_else(|| anyhow::anyhow!("line {line} has no open checkbox"))?;
        fs::write(&self.tasks_path, updated)?;
        Ok(format!("marked task on line {line} as done"))
    }
}
