//! System prompt assembly: identity, context files, skills, memory.

use crate::memory::MemoryEntry;

pub fn build_system_prompt(
    identity: &str,
    context_section: &str,
    skills_fragment: &str,
    memories: &[MemoryEntry],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(identity.trim());

    if !context_section.is_empty() {
        prompt.push_str("\n\n# Context\n\n");
        prompt.push_str(context_section);
    }

    if !skills_fragment.is_empty() {
        prompt.push_str("\n\n# Skills\n\nRead a skill's location file for its full instructions before using it.\n\n");
        prompt.push_str(skills_fragment);
    }

    if !memories.is_empty() {
        prompt.push_str("\n\n# Relevant memories\n\n");
        for entry in memories {
            prompt.push_str(&format!("- ({}) {}\n", entry.source, entry.content));
        }
    }

    prompt
}
