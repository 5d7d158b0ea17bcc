//! Skills: named instruction packets discovered from layered directories,
//! advertised to the model as an XML fragment and to the user as
//! slash-commands.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

/// Where a skill was loaded from. Workspace wins name collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillTier {
    Managed,
    Workspace,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    /// Absolute path to the detail file, read on demand by the model.
    pub path: PathBuf,
    pub tier: SkillTier,
    pub user_invocable: bool,
    pub disable_model_invocation: bool,
}

/// A slash-command derived from a user-invocable skill.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillCommand {
    pub command: String,
    pub skill_name: String,
    pub description: String,
}

/// A resolved slash-command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillInvocation {
    pub skill_name: String,
    pub args: String,
}

#[derive(Debug, Clone, Default)]
pub struct SkillSet {
    pub entries: Vec<SkillEntry>,
    pub commands: Vec<SkillCommand>,
}

const MAX_COMMAND_LEN: usize = 32;
const MAX_COMMAND_DESCRIPTION_LEN: usize = 100;

/// Load both tiers: `<home>/.mini-agent/skills` (managed) then
/// `<workspace>/skills` (workspace).
pub fn load_skills(home: Option<&Path>, workspace: &Path) -> SkillSet {
    let mut by_name: BTreeMap<String, SkillEntry> = BTreeMap::new();
    if let Some(home) = home {
        load_tier(
            &home.join(".mini-agent").join("skills"),
            SkillTier::Managed,
            &mut by_name,
        );
    }
    load_tier(&workspace.join("skills"), SkillTier::Workspace, &mut by_name);

    let entries: Vec<SkillEntry> = by_name.into_values().collect();
    let commands = build_commands(&entries);
    SkillSet { entries, commands }
}

fn load_tier(dir: &Path, tier: SkillTier, out: &mut BTreeMap<String, SkillEntry>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            load_skill_dir(&path, tier, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            if name.as_ref() == "SKILL.md" {
                continue; // only meaningful inside a skill directory
            }
            // Top-level loose .md files are skills.
            if let Some(skill) = parse_skill_file(&path, tier) {
                debug!(name = %skill.name, tier = ?tier, "Loaded skill");
                out.insert(skill.name.clone(), skill);
            }
        }
    }
}

/// Below the top level only `SKILL.md` counts; other markdown is treated as
/// skill-private material.
fn load_skill_dir(dir: &Path, tier: SkillTier, out: &mut BTreeMap<String, SkillEntry>) {
    let skill_md = dir.join("SKILL.md");
    if skill_md.is_file() {
        if let Some(skill) = parse_skill_file(&skill_md, tier) {
            debug!(name = %skill.name, tier = ?tier, "Loaded skill");
            out.insert(skill.name.clone(), skill);
        }
    }
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            load_skill_dir(&path, tier, out);
        }
    }
}

/// Parse one skill file. The frontmatter sits between two `---` lines;
/// a missing description rejects the file.
fn parse_skill_file(path: &Path, tier: SkillTier) -> Option<SkillEntry> {
    let content = fs::read_to_string(path).ok()?;
    let fields = parse_frontmatter(&content);

    let default_name = if path.file_name().and_then(|n| n.to_str()) == Some("SKILL.md") {
        path.parent()?.file_name()?.to_string_lossy().to_string()
    } else {
        path.file_stem()?.to_string_lossy().to_string()
    };

    let name = fields
        .get("name")
        .cloned()
        .filter(|n| !n.is_empty())
        .unwrap_or(default_name);

    let description = match fields.get("description") {
        Some(d) if !d.is_empty() => d.clone(),
        _ => {
            warn!(path = %path.display(), "Skipping skill without description");
            return None;
        }
    };

    let abs = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());

    Some(SkillEntry {
        name,
        description,
        path: abs,
        tier,
        user_invocable: fields
            .get("user-invocable")
            .map(|v| v != "false")
            .unwrap_or(true),
        disable_model_invocation: fields
            .get("disable-model-invocation")
            .map(|v| v == "true")
            .unwrap_or(false),
    })
}

/// `key: value` pairs between the opening and closing `---`, quote-stripped.
fn parse_frontmatter(content: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return fields;
    };
    let Some(end) = rest.find("\n---") else {
        return fields;
    };
    for line in rest[..end].lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            fields.insert(key.trim().to_lowercase(), value.to_string());
        }
    }
    fields
}

/// Lowercase, collapse anything outside `[a-z0-9_]` to `_`, cap the length.
pub fn sanitize_command_name(name: &str) -> String {
    let mut out = String::new();
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_').to_string();
    let out: String = out.chars().take(MAX_COMMAND_LEN).collect();
    if out.is_empty() {
        "skill".to_string()
    } else {
        out
    }
}

fn build_commands(entries: &[SkillEntry]) -> Vec<SkillCommand> {
    let mut commands: Vec<SkillCommand> = Vec::new();
    for entry in entries.iter().filter(|e| e.user_invocable) {
        let base = sanitize_command_name(&entry.name);
        let mut candidate = base.clone();
        let mut n = 2;
        while commands.iter().any(|c| c.command == candidate) {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        let description = if entry.description.chars().count() > MAX_COMMAND_DESCRIPTION_LEN {
            let clipped: String = entry
                .description
                .chars()
                .take(MAX_COMMAND_DESCRIPTION_LEN)
                .collect();
            format!("{clipped}...")
        } else {
            entry.description.clone()
        };
        commands.push(SkillCommand {
            command: candidate,
            skill_name: entry.name.clone(),
            description,
        });
    }
    commands
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

impl SkillSet {
    /// Model-visible prompt fragment. Skills with model invocation disabled
    /// are omitted.
    pub fn render_prompt_fragment(&self) -> String {
        let visible: Vec<&SkillEntry> = self
            .entries
            .iter()
            .filter(|e| !e.disable_model_invocation)
            .collect();
        if visible.is_empty() {
            return String::new();
        }
        let mut out = String::from("<available_skills>\n");
        for entry in visible {
            out.push_str(&format!(
                "  <skill><name>{}</name><description>{}</description><location>{}</location></skill>\n",
                xml_escape(&entry.name),
                xml_escape(&entry.description),
                xml_escape(&entry.path.display().to_string()),
            ));
        }
        out.push_str("</available_skills>");
        out
    }

    fn lookup(&self, token: &str) -> Option<&SkillCommand> {
        let lower = token.to_lowercase();
        // Exact command name, then underlying skill name, then
        // hyphen-normalized match.
        self.commands
            .iter()
            .find(|c| c.command == lower)
            .or_else(|| {
                self.commands
                    .iter()
                    .find(|c| c.skill_name.to_lowercase() == lower)
            })
            .or_else(|| {
                let normalized = hyphen_normalize(&lower);
                self.commands
                    .iter()
                    .find(|c| hyphen_normalize(&c.skill_name.to_lowercase()) == normalized
                        || hyphen_normalize(&c.command) == normalized)
            })
    }

    /// Parse a `/`-prefixed input against the command table. Non-matching
    /// input returns `None` and passes through untouched.
    pub fn resolve_input(&self, input: &str) -> Option<SkillInvocation> {
        let trimmed = input.trim();
        let rest = trimmed.strip_prefix('/')?;
        let mut parts = rest.splitn(2, char::is_whitespace);
        let first = parts.next()?.trim();
        if first.is_empty() {
            return None;
        }
        let remainder = parts.next().unwrap_or("").trim();

        let (token, args) = if first.eq_ignore_ascii_case("skill") {
            let mut inner = remainder.splitn(2, char::is_whitespace);
            let name = inner.next()?.trim();
            if name.is_empty() {
                return None;
            }
            (name.to_string(), inner.next().unwrap_or("").trim().to_string())
        } else {
            (first.to_string(), remainder.to_string())
        };

        let command = self.lookup(&token)?;
        Some(SkillInvocation {
            skill_name: command.skill_name.clone(),
            args,
        })
    }
}

fn hyphen_normalize(s: &str) -> String {
    s.replace([' ', '_'], "-")
}

/// The user-message rewrite applied on a slash-command hit.
pub fn rewrite_input(invocation: &SkillInvocation) -> String {
    format!(
        "Use the \"{}\" skill for this request.\n\nUser input:\n{}",
        invocation.skill_name, invocation.args
    )
}
