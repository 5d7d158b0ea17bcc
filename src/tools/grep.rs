//! Substring search across the workspace file tree.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{require_str, resolve_within, Tool};

const MAX_MATCHES: usize = 200;
const SKIP_DIRS: &[&str] = &["node_modules", "target", ".git"];

pub struct GrepTool {
    root: PathBuf,
}

impl GrepTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn walk(&self, dir: &Path, pattern: &str, matches: &mut Vec<String>) {
        if matches.len() >= MAX_MATCHES {
            return;
        }
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            if matches.len() >= MAX_MATCHES {
                return;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            if path.is_dir() {
                self.walk(&path, pattern, matches);
            } else if let Ok(content) = fs::read_to_string(&path) {
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .display()
                    .to_string();
                for (idx, line) in content.lines().enumerate() {
                    if line.contains(pattern) {
                        matches.push(format!("{rel}:{}:{}", idx + 1, line.trim()));
                        if matches.len() >= MAX_MATCHES {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search workspace files for a literal string. Arguments: pattern, path (optional subdirectory)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Literal text to search for"},
                "path": {"type": "string", "description": "Workspace-relative subdirectory"}
            },
            "required": ["pattern"]
        })
    }

    async fn call(&self, args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        let pattern = require_str(args, "pattern")?;
        let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let start = resolve_within(&self.root, rel)?;
        let mut matches = Vec::new();
        self.walk(&start, pattern, &mut matches);
        if matches.is_empty() {
            return Ok(format!("no matches for: {pattern}"));
        }
        Ok(matches.join("\n"))
    }
}
