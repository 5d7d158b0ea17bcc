//! Tool trait and the policy-filtered registry handed to the agent loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::providers::ToolDescriptor;
use crate::tool_policy::{SandboxFlags, ToolPolicy};

mod exec;
mod fs;
mod grep;
mod tasks;

pub use exec::ExecTool;
pub use fs::{ListDirTool, ReadFileTool, WriteFileTool};
pub use grep::GrepTool;
pub use tasks::CompleteTaskTool;

/// A tool the model can invoke. Implementations honor the cancellation
/// token: a cancelled run must not leave child processes or writes behind.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the tool's parameters.
    fn schema(&self) -> Value;
    async fn call(&self, args: &Value, cancel: &CancellationToken) -> anyhow::Result<String>;
}

/// The tool set exposed to one agent, already filtered through the policy.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>, policy: &ToolPolicy) -> Self {
        let tools: Vec<Arc<dyn Tool>> = tools
            .into_iter()
            .filter(|t| {
                let allowed = policy.allows(t.name());
                if !allowed {
                    debug!(tool = t.name(), "Tool filtered out by policy");
                }
                allowed
            })
            .collect();
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

/// The built-in tool set, gated by the sandbox flags: write- and exec-class
/// tools are simply not constructed when their toggle is off.
pub fn builtin_tools(workspace: &Path, sandbox: SandboxFlags) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ReadFileTool::new(workspace)),
        Arc::new(ListDirTool::new(workspace)),
        Arc::new(GrepTool::new(workspace)),
    ];
    if sandbox.allow_write {
        tools.push(Arc::new(WriteFileTool::new(workspace)));
    }
    if sandbox.allow_exec {
        tools.push(Arc::new(ExecTool::new(workspace)));
    }
    tools
}

/// Resolve `rel` inside `root`, rejecting escapes via `..` or absolute paths.
pub(crate) fn resolve_within(root: &Path, rel: &str) -> anyhow::Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        anyhow::bail!("absolute paths are not allowed: {rel}");
    }
    if rel_path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("path escapes the workspace: {rel}");
    }
    Ok(root.join(rel_path))
}

/// Pull a required string argument out of the args object.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument: {key}"))
}
