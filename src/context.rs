//! Context-file discovery: named markdown files concatenated into the
//! system prompt's context section.
//!
//! Layers are consulted in order — user home first, then workspace root,
//! then the workspace-private `.mini-agent/` mirror — and every hit is
//! included, so workspace files extend rather than hide the home ones.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

pub const CONTEXT_FILE_NAMES: [&str; 3] = ["AGENT.md", "HEARTBEAT.md", "CONTEXT.md"];

/// A directory that may hold context files, with a label used in headers.
#[derive(Debug, Clone)]
pub struct ContextLayer {
    pub label: &'static str,
    pub dir: PathBuf,
}

/// Default layer stack for a workspace.
pub fn default_layers(workspace: &Path) -> Vec<ContextLayer> {
    let mut layers = Vec::new();
    if let Some(home) = dirs::home_dir() {
        layers.push(ContextLayer {
            label: "home",
            dir: home.join(".mini-agent"),
        });
    }
    layers.push(ContextLayer {
        label: "workspace",
        dir: workspace.to_path_buf(),
    });
    layers.push(ContextLayer {
        label: "workspace-private",
        dir: workspace.join(".mini-agent"),
    });
    layers
}

/// Concatenate every context file found across the layers. Returns an empty
/// string when nothing is found.
pub fn load_context_section(layers: &[ContextLayer]) -> String {
    let mut out = String::new();
    for layer in layers {
        for name in CONTEXT_FILE_NAMES {
            let path = layer.dir.join(name);
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            debug!(path = %path.display(), "Loaded context file");
            out.push_str(&format!("## {} ({})\n{}\n\n", name, layer.label, content));
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_and_labels_layers() {
        let home = tempfile::TempDir::new().unwrap();
        let workspace = tempfile::TempDir::new().unwrap();
        fs::write(home.path().join("AGENT.md"), "home identity").unwrap();
        fs::write(workspace.path().join("AGENT.md"), "workspace identity").unwrap();
        fs::write(workspace.path().join("CONTEXT.md"), "project notes").unwrap();

        let layers = vec![
            ContextLayer {
                label: "home",
                dir: home.path().to_path_buf(),
            },
            ContextLayer {
                label: "workspace",
                dir: workspace.path().to_path_buf(),
            },
        ];
        let section = load_context_section(&layers);

        let home_pos = section.find("## AGENT.md (home)").unwrap();
        let ws_pos = section.find("## AGENT.md (workspace)").unwrap();
        assert!(home_pos < ws_pos, "home layer must come first");
        assert!(section.contains("project notes"));
    }

    #[test]
    fn test_missing_files_yield_empty_section() {
        let workspace = tempfile::TempDir::new().unwrap();
        let layers = vec![ContextLayer {
            label: "workspace",
            dir: workspace.path().to_path_buf(),
        }];
        assert_eq!(load_context_section(&layers), "");
    }

    #[test]
    fn test_blank_files_skipped() {
        let workspace = tempfile::TempDir::new().unwrap();
        fs::write(workspace.path().join("HEARTBEAT.md"), "   \n").unwrap();
        let layers = vec![ContextLayer {
            label: "workspace",
            dir: workspace.path().to_path_buf(),
        }];
        assert_eq!(load_context_section(&layers), "");
    }
}
