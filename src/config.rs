//! `config.toml` deserialization with per-field defaults. Every section is
//! optional; a missing file yields a fully-defaulted config.

use std::path::Path;

use serde::Deserialize;

use crate::tool_policy::{SandboxFlags, ToolPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub sandbox: SandboxFlags,
    #[serde(default)]
    pub tools: ToolPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            model: default_model(),
            max_turns: default_max_turns(),
            max_concurrent_runs: default_max_concurrent_runs(),
            token_budget: default_token_budget(),
            max_tokens: default_max_tokens(),
            temperature: None,
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_max_turns() -> u32 {
    24
}
fn default_max_concurrent_runs() -> usize {
    2
}
fn default_token_budget() -> usize {
    120_000
}
fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
    /// `"HH:MM-HH:MM"` in local time; `end <= start` wraps past midnight.
    #[serde(default)]
    pub active_hours: Option<String>,
    #[serde(default = "default_duplicate_window_hours")]
    pub duplicate_window_hours: u64,
    #[serde(default = "default_tasks_file")]
    pub tasks_file: String,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            coalesce_ms: default_coalesce_ms(),
            active_hours: None,
            duplicate_window_hours: default_duplicate_window_hours(),
            tasks_file: default_tasks_file(),
        }
    }
}

fn default_interval_secs() -> u64 {
    1800
}
fn default_coalesce_ms() -> u64 {
    250
}
fn default_duplicate_window_hours() -> u64 {
    24
}
fn default_tasks_file() -> String {
    "HEARTBEAT.md".to_string()
}

/// Load config from `path`; a missing file is fine.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.agent.model, "claude-sonnet-4-5");
        assert_eq!(config.agent.max_concurrent_runs, 2);
        assert_eq!(config.agent.token_budget, 120_000);
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval_secs, 1800);
        assert_eq!(config.heartbeat.coalesce_ms, 250);
        assert!(config.sandbox.allow_write);
        assert!(config.tools.allow.is_empty());
    }

    #[test]
    fn test_partial_override() {
        let config: AppConfig = toml::from_str(
            r#"
[agent]
model = "claude-haiku-4-5"
max_turns = 8

[heartbeat]
enabled = true
active_hours = "08:00-22:00"

[sandbox]
allow_exec = false

[tools]
deny = ["exec"]
"#,
        )
        .unwrap();
        assert_eq!(config.agent.model, "claude-haiku-4-5");
        assert_eq!(config.agent.max_turns, 8);
        assert_eq!(config.agent.max_concurrent_runs, 2);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.active_hours.as_deref(), Some("08:00-22:00"));
        assert!(!config.sandbox.allow_exec);
        assert!(config.sandbox.allow_write);
        assert_eq!(config.tools.deny, vec!["exec"]);
    }

    #[test]
    fn test_missing_file_defaults() {
        let config = load_config(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.agent.max_turns, 24);
    }
}
