//! Filesystem tools: read, write, list. All paths are workspace-relative.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{require_str, resolve_within, Tool};

const MAX_READ_BYTES: usize = 256 * 1024;

pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Arguments: path (relative)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"}
            },
            "required": ["path"]
        })
    }

    async fn call(&self, args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        let rel = require_str(args, "path")?;
        let path = resolve_within(&self.root, rel)?;
        let content = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("cannot read {rel}: {e}"))?;
        if content.len() > MAX_READ_BYTES {
            let mut end = MAX_READ_BYTES;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            return Ok(format!(
                "{}\n...\n[truncated {} of {} bytes]",
                &content[..end],
                end,
                content.len()
            ));
        }
        Ok(content)
    }
}

pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a text file in the workspace, creating parent directories. Arguments: path, content."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"},
                "content": {"type": "string", "description": "Full file content"}
            },
            "required": ["path", "content"]
        })
    }

    async fn call(&self, args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        let rel = require_str(args, "path")?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: content"))?;
        let path = resolve_within(&self.root, rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content).map_err(|e| anyhow::anyhow!("cannot write {rel}: {e}"))?;
        Ok(format!("wrote {} bytes to {rel}", content.len()))
    }
}

pub struct ListDirTool {
    root: PathBuf,
}

impl ListDirTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory entries. Arguments: path (relative, defaults to the workspace root)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative directory path"}
            }
        })
    }

    async fn call(&self, args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = resolve_within(&self.root, rel)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&path).map_err(|e| anyhow::anyhow!("cannot list {rel}: {e}"))? {
            let entry = entry?;
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names.join("\n"))
    }
}
