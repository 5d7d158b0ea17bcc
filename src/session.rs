//! Session keys and the append-only session log.
//!
//! Canonical key form is `agent:<agentId>:<tail>`. Everything that accepts a
//! bare session id or a full key funnels through [`resolve_session_key`] so
//! one conversation always maps to one key, one log file, and one lane.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;
use uuid::Uuid;

use crate::types::Message;

const MAX_AGENT_ID_LEN: usize = 64;

/// Normalize an agent id to `[a-z0-9][a-z0-9_-]{0,63}`. Non-conforming
/// characters become hyphens; leading/trailing hyphens are trimmed. Empty
/// results fall back to `"agent"`.
pub fn normalize_agent_id(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed: String = mapped
        .trim_matches('-')
        .chars()
        .take(MAX_AGENT_ID_LEN)
        .collect();
    let trimmed = trimmed.trim_matches('-').to_string();

    if trimmed.is_empty() || !trimmed.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        let stripped: String = trimmed
            .chars()
            .skip_while(|c| !c.is_ascii_alphanumeric())
            .collect();
        if stripped.is_empty() {
            return "agent".to_string();
        }
        return stripped;
    }
    trimmed
}

/// Produce the canonical session key for `(agent_id, session)`. Accepts a
/// bare session id or an already-canonical key; re-application is a no-op.
pub fn resolve_session_key(agent_id: &str, session: &str) -> String {
    let session = session.trim();
    if let Some(rest) = session.strip_prefix("agent:") {
        if let Some((id, tail)) = rest.split_once(':') {
            if !tail.is_empty() {
                return format!("agent:{}:{}", normalize_agent_id(id), tail);
            }
        }
    }
    let session = if session.is_empty() { "main" } else { session };
    format!("agent:{}:{}", normalize_agent_id(agent_id), session)
}

/// Child key for a spawned subagent.
pub fn subagent_key(agent_id: &str) -> String {
    format!(
        "agent:{}:subagent:{}",
        normalize_agent_id(agent_id),
        Uuid::new_v4()
    )
}

/// Whether a canonical key belongs to a subagent run.
pub fn is_subagent_key(key: &str) -> bool {
    key.strip_prefix("agent:")
        .and_then(|rest| rest.split_once(':'))
        .map(|(_, tail)| tail.starts_with("subagent:"))
        .unwrap_or(false)
}

/// Append-only JSONL history, one file per session key under
/// `<workspace>/.mini-agent/sessions/`. Writer serialization across tasks is
/// guaranteed by the session lane; the mutex here covers the heartbeat and
/// subagent continuations that write from outside a lane slot.
pub struct SessionLog {
    root: PathBuf,
    lock: Mutex<()>,
}

impl SessionLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(".mini-agent").join("sessions"))
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        // ':' is legal on unix filesystems; keep the key readable on disk.
        self.root.join(format!("{session_key}.jsonl"))
    }

    pub fn append(&self, session_key: &str, message: &Message) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.root)?;
        let line = serde_json::to_string(message)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_key))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn load(&self, session_key: &str) -> anyhow::Result<Vec<Message>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path_for(session_key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let mut messages = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(session_key, line = idx + 1, error = %e, "Skipping corrupt session log line");
                }
            }
        }
        Ok(messages)
    }

    pub fn clear(&self, session_key: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path_for(session_key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All known session keys with their entry counts.
    pub fn list(&self) -> anyhow::Result<Vec<(String, usize)>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let count = fs::read_to_string(&path)
                .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count())
                .unwrap_or(0);
            out.push((stem.to_string(), count));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
