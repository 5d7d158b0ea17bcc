//! Flat-journal memory store with keyword + recency scored retrieval.
//!
//! The journal is a JSON array at `.mini-agent/memory/index.json`, rewritten
//! atomically (temp file + rename) on every append. Retrieval is term
//! matching with a recency boost; no embeddings, by design.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    /// Who wrote it: "user", "agent", or "system".
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at_ms: i64,
}

/// Recency half-life used by the score boost.
const HALF_LIFE_MS: f64 = 7.0 * 24.0 * 3600.0 * 1000.0;
/// Weight of a query term hitting a tag vs. hitting content.
const TAG_WEIGHT: f64 = 2.0;

pub struct MemoryStore {
    path: PathBuf,
    entries: Mutex<Vec<MemoryEntry>>,
}

impl MemoryStore {
    /// Open (or initialize) the journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn in_workspace(workspace: &Path) -> anyhow::Result<Self> {
        Self::open(workspace.join(".mini-agent").join("memory").join("index.json"))
    }

    pub fn append(
        &self,
        content: &str,
        source: &str,
        tags: Vec<String>,
    ) -> anyhow::Result<MemoryEntry> {
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            source: source.to_string(),
            tags,
            created_at_ms: Utc::now().timestamp_millis(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry.clone());
        self.persist(&entries)?;
        Ok(entry)
    }

    fn persist(&self, entries: &[MemoryEntry]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Keyword+recency scored search, best first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<MemoryEntry> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 1)
            .map(str::to_string)
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let now = Utc::now().timestamp_millis();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(f64, MemoryEntry)> = entries
            .iter()
            .filter_map(|entry| {
                let score = score_entry(entry, &terms, now);
                (score > 0.0).then(|| (score, entry.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, e)| e).collect()
    }

    /// The `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<MemoryEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<MemoryEntry> = entries.clone();
        out.sort_by_key(|e| std::cmp::Reverse(e.created_at_ms));
        out.truncate(n);
        out
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Term-frequency score plus an additive recency boost. The boost decays
/// with a 7-day half-life, so an old exact match still beats a fresh
/// non-match.
fn score_entry(entry: &MemoryEntry, terms: &[String], now_ms: i64) -> f64 {
    let content = entry.content.to_lowercase();
    let mut score = 0.0;
    for term in terms {
        score += content.matches(term.as_str()).count() as f64;
        if entry.tags.iter().any(|t| t.to_lowercase() == *term) {
            score += TAG_WEIGHT;
        }
    }
    if score == 0.0 {
        return 0.0;
    }
    let age_ms = (now_ms - entry.created_at_ms).max(0) as f64;
    score + 0.5f64.powf(age_ms / HALF_LIFE_MS)
}
