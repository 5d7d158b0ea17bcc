//! The agent loop: prune → stream → tool dispatch → steering check, turn by
//! turn until the model stops calling tools.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SteeringQueues;
use crate::compaction::{compact_history, prune_messages};
use crate::errors::{
    classify_error, is_cancelled, is_context_overflow, retry_async, ErrorKind, RetryOptions,
};
use crate::events::{EventBus, EventStream};
use crate::providers::{ChatRequest, ModelProvider, StreamEvent};
use crate::session::SessionLog;
use crate::tools::ToolRegistry;
use crate::types::{ContentBlock, Message, Role, RunOutcome, ToolCall};

/// Everything one run of the loop needs, passed explicitly.
pub struct LoopDeps<'a> {
    pub provider: &'a Arc<dyn ModelProvider>,
    pub tools: &'a ToolRegistry,
    pub events: &'a Arc<EventBus>,
    pub log: &'a SessionLog,
    pub steering: &'a SteeringQueues,
    pub session_key: &'a str,
    pub agent_id: &'a str,
    pub run_id: &'a str,
    pub system_prompt: &'a str,
    pub model: &'a str,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_turns: u32,
    pub token_budget: usize,
    pub cancel: &'a CancellationToken,
}

struct TurnOutput {
    text: String,
    calls: Vec<ToolCall>,
}

/// Stream one model response, forwarding deltas to the event bus. The settle
/// result is the authoritative verdict; events are the real-time surface.
async fn stream_turn(deps: &LoopDeps<'_>, messages: &[Message]) -> anyhow::Result<TurnOutput> {
    let request = ChatRequest {
        system: deps.system_prompt.to_string(),
        messages: messages.to_vec(),
        tools: deps.tools.descriptors(),
        model: deps.model.to_string(),
        max_tokens: deps.max_tokens,
        temperature: deps.temperature,
        cancel: deps.cancel.clone(),
    };

    let mut stream = deps.provider.stream_chat(request).await?;
    let mut deltas = String::new();
    let mut final_text: Option<String> = None;
    let mut calls: Vec<ToolCall> = Vec::new();

    while let Some(event) = stream.events.recv().await {
        if deps.cancel.is_cancelled() {
            anyhow::bail!("run cancelled");
        }
        match event {
            StreamEvent::TextDelta { delta } => {
                deps.events.emit(
                    deps.run_id,
                    EventStream::Assistant,
                    Some(deps.session_key),
                    Some(deps.agent_id),
                    json!({"kind": "text_delta", "delta": delta}),
                );
                deltas.push_str(&delta);
            }
            StreamEvent::TextEnd { content } => final_text = Some(content),
            StreamEvent::ToolCallStart { id, name } => {
                debug!(id = %id, name = %name, "Model opened a tool call");
            }
            StreamEvent::ToolCallEnd { call } => calls.push(call),
        }
    }

    match stream.settle.await {
        Ok(Ok(())) => Ok(TurnOutput {
            text: final_text.unwrap_or(deltas),
            calls,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!("provider stream dropped without settling")),
    }
}

/// Run the loop to completion. `messages` is the working list, already
/// containing the user's (possibly rewritten) message; the session log holds
/// everything appended so far.
pub async fn run_agent_loop(
    deps: &LoopDeps<'_>,
    mut messages: Vec<Message>,
) -> anyhow::Result<RunOutcome> {
    let mut turns = 0u32;
    let mut total_tool_calls = 0u32;
    let mut last_text = String::new();
    // Reactive compaction fires at most once per run.
    let mut compacted = false;
    let retry_opts = RetryOptions::default();

    loop {
        if deps.cancel.is_cancelled() {
            anyhow::bail!("run cancelled");
        }
        if turns >= deps.max_turns {
            info!(
                session_key = deps.session_key,
                turns, "Turn limit reached; returning last text"
            );
            return Ok(RunOutcome {
                text: last_text,
                turns,
                tool_calls: total_tool_calls,
            });
        }

        // 1. Prune the working list against the budget.
        let (kept, dropped) = prune_messages(&messages, deps.token_budget);
        if !dropped.is_empty() {
            debug!(
                session_key = deps.session_key,
                dropped = dropped.len(),
                "Pruned working messages before turn"
            );
        }
        messages = kept;

        // 2. Stream, restarting the turn under backoff on rate limits.
        // Bound to a local first so the retry future's borrow of `messages`
        // ends before the error arm reassigns it.
        let streamed = retry_async(
            || stream_turn(deps, &messages),
            &retry_opts,
            |e, _| classify_error(&e.to_string()) == ErrorKind::RateLimit,
            deps.cancel,
            |attempt, delay, err| {
                deps.events.emit(
                    deps.run_id,
                    EventStream::Error,
                    Some(deps.session_key),
                    Some(deps.agent_id),
                    json!({
                        "kind": "retry",
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "error": err.to_string(),
                    }),
                );
            },
        )
        .await;
        let turn = match streamed {
            Ok(turn) => turn,
            Err(e) => {
                let message = e.to_string();
                if deps.cancel.is_cancelled() || is_cancelled(&message) {
                    return Err(e);
                }
                if is_context_overflow(&message) && !compacted {
                    compacted = true;
                    warn!(
                        session_key = deps.session_key,
                        "Context overflow; compacting and re-entering turn"
                    );
                    // The provider overflowed even though the coarse estimate
                    // fit, so target half the budget to actually shed tokens.
                    let outcome = compact_history(
                        deps.provider,
                        deps.model,
                        &messages,
                        deps.token_budget / 2,
                        deps.cancel,
                    )
                    .await;
                    if outcome.summary.is_none() {
                        anyhow::bail!("context overflow persisted after compaction: {message}");
                    }
                    info!(
                        session_key = deps.session_key,
                        dropped = outcome.dropped,
                        "Compaction summarized the dropped prefix; rewinding turn"
                    );
                    messages = outcome.messages;
                    continue; // rewound turn, not counted
                }
                return Err(e);
            }
        };
        turns += 1;
        last_text = turn.text.clone();

        // 3. Append the assistant message with accumulated blocks.
        let mut blocks: Vec<ContentBlock> = Vec::new();
        if !turn.text.is_empty() {
            blocks.push(ContentBlock::Text {
                text: turn.text.clone(),
            });
        }
        for call in &turn.calls {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }
        if !blocks.is_empty() {
            let assistant = Message::new(Role::Assistant, blocks);
            deps.log.append(deps.session_key, &assistant)?;
            messages.push(assistant);
        }

        // 4. No tool calls: the run is done.
        if turn.calls.is_empty() {
            return Ok(RunOutcome {
                text: turn.text,
                turns,
                tool_calls: total_tool_calls,
            });
        }

        // 5. Execute the turn's tool calls sequentially, checking the
        // steering queue between calls.
        let mut results: Vec<ContentBlock> = Vec::new();
        let mut steered = false;
        for (index, call) in turn.calls.iter().enumerate() {
            if deps.cancel.is_cancelled() {
                if !results.is_empty() {
                    let partial = Message::new(Role::User, results);
                    deps.log.append(deps.session_key, &partial)?;
                }
                anyhow::bail!("run cancelled");
            }
            if index > 0 && deps.steering.has_pending(deps.session_key) {
                info!(
                    session_key = deps.session_key,
                    skipped = turn.calls.len() - index,
                    "Steering message arrived; abandoning remaining tool calls"
                );
                steered = true;
                break;
            }

            deps.events.emit(
                deps.run_id,
                EventStream::Tool,
                Some(deps.session_key),
                Some(deps.agent_id),
                json!({"phase": "start", "id": call.id, "name": call.name}),
            );

            let (content, ok) = match deps.tools.get(&call.name) {
                None => (format!("未知工具: {}", call.name), false),
                Some(tool) => match tool.call(&call.input, deps.cancel).await {
                    Ok(output) => (output, true),
                    Err(e) => (format!("执行错误: {e}"), false),
                },
            };

            deps.events.emit(
                deps.run_id,
                EventStream::Tool,
                Some(deps.session_key),
                Some(deps.agent_id),
                json!({
                    "phase": "end",
                    "id": call.id,
                    "name": call.name,
                    "ok": ok,
                    "chars": content.len(),
                }),
            );

            total_tool_calls += 1;
            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                name: call.name.clone(),
                content,
            });
        }

        // 6. One user message carries every result of the turn, even when
        // steering truncated it. Unexecuted calls are never retried.
        let results_msg = Message::new(Role::User, results);
        deps.log.append(deps.session_key, &results_msg)?;
        messages.push(results_msg);

        // 7. Steering messages coalesce into one user message.
        if steered {
            let texts = deps.steering.drain(deps.session_key);
            if !texts.is_empty() {
                let steer_msg = Message::user_text(texts.join("\n"));
                deps.log.append(deps.session_key, &steer_msg)?;
                messages.push(steer_msg);
            }
        }
    }
}
