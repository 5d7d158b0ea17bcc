//! Shell execution tool. The command runs through `sh -c` in the workspace;
//! cancellation and the timeout both kill the child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{require_str, Tool};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

pub struct ExecTool {
    workdir: PathBuf,
    timeout: Duration,
}

impl ExecTool {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[allow(dead_code)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its output. Arguments: command."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command line"}
            },
            "required": ["command"]
        })
    }

    async fn call(&self, args: &Value, cancel: &CancellationToken) -> anyhow::Result<String> {
        let command = require_str(args, "command")?;
        debug!(command, "Executing shell command");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn command: {e}"))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| anyhow::anyhow!("command failed: {e}"))?
            }
            _ = cancel.cancelled() => {
                anyhow::bail!("command cancelled");
            }
            _ = tokio::time::sleep(self.timeout) => {
                anyhow::bail!("command timed out after {}s", self.timeout.as_secs());
            }
        };

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("stderr:\n");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("exit status: {}", output.status));
        }
        if text.len() > MAX_OUTPUT_BYTES {
            let mut end = MAX_OUTPUT_BYTES;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
            text.push_str("\n...[output truncated]");
        }
        if text.is_empty() {
            text.push_str("(no output)");
        }
        Ok(text)
    }
}
