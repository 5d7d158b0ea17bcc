//! Allow/deny filtering over tool names, plus the sandbox toggles that gate
//! write- and exec-class tools at registration time.

use serde::{Deserialize, Serialize};

/// Glob filter over tool names. Deny wins over allow; an empty allow list
/// means "allow everything not denied".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        if self.deny.iter().any(|p| glob_match(p, tool_name)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|p| glob_match(p, tool_name))
    }

    /// Combine two policies into one at most as permissive as either.
    /// Deny lists are unioned. For allow lists, patterns surviving the other
    /// policy's filter are kept, so a literal name passes only when both
    /// sides would pass it.
    #[allow(dead_code)]
    pub fn merge(a: &ToolPolicy, b: &ToolPolicy) -> ToolPolicy {
        let mut deny: Vec<String> = a.deny.clone();
        for p in &b.deny {
            if !deny.contains(p) {
                deny.push(p.clone());
            }
        }

        let allow = if a.allow.is_empty() {
            b.allow.clone()
        } else if b.allow.is_empty() {
            a.allow.clone()
        } else {
            let mut merged: Vec<String> = a
                .allow
                .iter()
                .filter(|p| b.allow.iter().any(|q| glob_match(q, p) || p == &q))
                .cloned()
                .collect();
            for p in &b.allow {
                if a.allow.iter().any(|q| glob_match(q, p)) && !merged.contains(p) {
                    merged.push(p.clone());
                }
            }
            // Nothing survives both sides: deny everything rather than
            // silently widening.
            if merged.is_empty() {
                merged.push(String::new());
            }
            merged
        };

        ToolPolicy { allow, deny }
    }
}

/// Boolean write/exec toggles. A tool registry consults these before
/// exposing filesystem-write or process-exec tools at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFlags {
    #[serde(default = "default_true")]
    pub allow_write: bool,
    #[serde(default = "default_true")]
    pub allow_exec: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SandboxFlags {
    fn default() -> Self {
        Self {
            allow_write: true,
            allow_exec: true,
        }
    }
}

/// Minimal `*` glob: wildcard matches any run of characters.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("read_*", "read_file"));
        assert!(glob_match("*_file", "read_file"));
        assert!(glob_match("exec", "exec"));
        assert!(!glob_match("exec", "exec_shell"));
        assert!(!glob_match("read_*", "write_file"));
    }

    #[test]
    fn test_empty_policy_allows_all() {
        let policy = ToolPolicy::allow_all();
        assert!(policy.allows("exec"));
        assert!(policy.allows("read_file"));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = ToolPolicy {
            allow: vec!["*".into()],
            deny: vec!["exec".into()],
        };
        assert!(policy.allows("read_file"));
        assert!(!policy.allows("exec"));
    }

    #[test]
    fn test_allow_list_restricts() {
        let policy = ToolPolicy {
            allow: vec!["read_*".into(), "grep".into()],
            deny: vec![],
        };
        assert!(policy.allows("read_file"));
        assert!(policy.allows("grep"));
        assert!(!policy.allows("write_file"));
    }

    #[test]
    fn test_merge_unions_deny() {
        let a = ToolPolicy {
            allow: vec![],
            deny: vec!["exec".into()],
        };
        let b = ToolPolicy {
            allow: vec![],
            deny: vec!["write_*".into()],
        };
        let merged = ToolPolicy::merge(&a, &b);
        assert!(!merged.allows("exec"));
        assert!(!merged.allows("write_file"));
        assert!(merged.allows("read_file"));
    }

    #[test]
    fn test_merge_allow_requires_both() {
        let a = ToolPolicy {
            allow: vec!["read_file".into(), "grep".into()],
            deny: vec![],
        };
        let b = ToolPolicy {
            allow: vec!["grep".into(), "exec".into()],
            deny: vec![],
        };
        let merged = ToolPolicy::merge(&a, &b);
        assert!(merged.allows("grep"));
        assert!(!merged.allows("read_file"));
        assert!(!merged.allows("exec"));
    }

    #[test]
    fn test_merge_empty_side_keeps_other() {
        let a = ToolPolicy::allow_all();
        let b = ToolPolicy {
            allow: vec!["grep".into()],
            deny: vec![],
        };
        let merged = ToolPolicy::merge(&a, &b);
        assert!(merged.allows("grep"));
        assert!(!merged.allows("exec"));
    }

    #[test]
    fn test_merge_disjoint_allows_deny_everything() {
        let a = ToolPolicy {
            allow: vec!["grep".into()],
            deny: vec![],
        };
        let b = ToolPolicy {
            allow: vec!["exec".into()],
            deny: vec![],
        };
        let merged = ToolPolicy::merge(&a, &b);
        assert!(!merged.allows("grep"));
        assert!(!merged.allows("exec"));
        assert!(!merged.allows("anything"));
    }
}
