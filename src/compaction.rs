//! Context-window management: token estimation, oldest-first pruning that
//! preserves tool_use/tool_result pairing, and summarizer-backed compaction
//! of the dropped prefix.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::providers::{collect_stream, ChatRequest, ModelProvider};
use crate::types::{ContentBlock, Message};

/// Coarse token estimate: ~4 characters per token, summed over the string
/// forms of all content.
#[allow(dead_code)]
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut chars = 0usize;
    for block in &message.blocks {
        match block {
            ContentBlock::Text { text } => chars += text.len(),
            ContentBlock::ToolUse { id, name, input } => {
                chars += id.len() + name.len() + input.to_string().len();
            }
            ContentBlock::ToolResult {
                tool_use_id,
                name,
                content,
            } => {
                chars += tool_use_id.len() + name.len() + content.len();
            }
        }
    }
    chars / 4
}

pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Drop oldest messages until the remainder fits `budget` tokens.
/// Returns `(kept, dropped)`.
///
/// Pairing invariant: a tool_result never survives its matching tool_use.
/// When the cut would separate a pair, the result side drops with it.
pub fn prune_messages(messages: &[Message], budget: usize) -> (Vec<Message>, Vec<Message>) {
    let mut start = 0usize;
    while start < messages.len() && estimate_history_tokens(&messages[start..]) > budget {
        start += 1;
    }

    // Extend the cut over user messages whose tool_results lost their
    // partners. Interior pairs are chronological, so orphans only surface
    // at the head of the kept slice.
    loop {
        let kept = &messages[start..];
        let Some(first) = kept.first() else { break };
        let use_ids: HashSet<&str> = kept.iter().flat_map(|m| m.tool_use_ids()).collect();
        let orphaned = first.blocks.iter().any(|b| {
            matches!(b, ContentBlock::ToolResult { tool_use_id, .. }
                if !use_ids.contains(tool_use_id.as_str()))
        });
        if orphaned {
            start += 1;
        } else {
            break;
        }
    }

    (messages[start..].to_vec(), messages[..start].to_vec())
}

const SUMMARIZER_SYSTEM_PROMPT: &str = "You are a conversation summarizer. Produce a compact \
summary of the conversation you are given. Preserve: topics discussed, decisions made, \
important values and file paths, pending work. Output plain prose, 5 sentences max.";

/// Result of a compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// Summary message (when produced) followed by the retained tail.
    pub messages: Vec<Message>,
    pub summary: Option<String>,
    pub dropped: usize,
}

/// Prune to budget and, when anything was dropped, summarize the dropped
/// prefix into a synthetic user message prepended to the retained tail.
/// A summarizer failure degrades to plain pruning rather than failing the
/// run; callers treat `summary: None` with `dropped > 0` as "compaction had
/// nothing to offer".
pub async fn compact_history(
    provider: &Arc<dyn ModelProvider>,
    model: &str,
    messages: &[Message],
    budget: usize,
    cancel: &CancellationToken,
) -> CompactionOutcome {
    let (kept, dropped) = prune_messages(messages, budget);
    if dropped.is_empty() {
        return CompactionOutcome {
            messages: kept,
            summary: None,
            dropped: 0,
        };
    }

    let mut transcript = String::new();
    for msg in &dropped {
        let role = match msg.role {
            crate::types::Role::User => "user",
            crate::types::Role::Assistant => "assistant",
        };
        let text = msg.text();
        if !text.is_empty() {
            transcript.push_str(&format!("{role}: {text}\n"));
        }
        for block in &msg.blocks {
            if let ContentBlock::ToolResult { name, content, .. } = block {
                let clipped: String = content.chars().take(400).collect();
                transcript.push_str(&format!("tool {name}: {clipped}\n"));
            }
        }
    }

    let request = ChatRequest {
        system: SUMMARIZER_SYSTEM_PROMPT.to_string(),
        messages: vec![Message::user_text(transcript)],
        tools: Vec::new(),
        model: model.to_string(),
        max_tokens: 1024,
        temperature: Some(0.0),
        cancel: cancel.clone(),
    };

    let summary = match provider.stream_chat(request).await {
        Ok(stream) => match collect_stream(stream).await {
            Ok((text, _)) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Summarizer stream failed; compaction degrades to pruning");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "Summarizer call failed; compaction degrades to pruning");
            None
        }
    };

    let mut result = Vec::with_capacity(kept.len() + 1);
    if let Some(ref text) = summary {
        result.push(Message::user_text(format!(
            "[conversation summary]\n{text}"
        )));
    }
    result.extend(kept);

    info!(
        dropped = dropped.len(),
        retained = result.len(),
        summarized = summary.is_some(),
        "Compacted conversation history"
    );

    CompactionOutcome {
        messages: result,
        summary,
        dropped: dropped.len(),
    }
}
