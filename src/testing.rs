//! Test infrastructure: a scripted MockProvider speaking the streaming
//! contract, a configurable MockTool, and a workspace harness.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::providers::{ChatRequest, ChatStream, ModelProvider, StreamEvent};
use crate::tools::Tool;
use crate::types::ToolCall;

/// One scripted provider turn.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Stream the text as two deltas, then TextEnd.
    Text(String),
    /// Stream text (may be empty) plus tool calls.
    TextWithCalls(String, Vec<ToolCall>),
    /// Fail the call before any streaming happens.
    Error(String),
    /// Stream nothing and fail at settle time.
    SettleError(String),
}

/// A recorded call to `stream_chat`.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MockChatCall {
    pub model: String,
    pub system: String,
    pub message_count: usize,
    pub tool_names: Vec<String>,
}

/// Mock LLM provider with a FIFO queue of scripted turns. An exhausted
/// queue yields a default text turn.
pub struct MockProvider {
    turns: Mutex<Vec<MockTurn>>,
    pub call_log: Mutex<Vec<MockChatCall>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_turns(Vec::new())
    }

    pub fn with_turns(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// Helper: a tool call with a fresh id.
    pub fn tool_call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: format!("tu_{}", Uuid::new_v4()),
            name: name.to_string(),
            input,
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls(&self) -> Vec<MockChatCall> {
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn stream_chat(&self, request: ChatRequest) -> anyhow::Result<ChatStream> {
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockChatCall {
                model: request.model.clone(),
                system: request.system.clone(),
                message_count: request.messages.len(),
                tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            });

        let turn = {
            let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            if turns.is_empty() {
                MockTurn::Text("Mock response".to_string())
            } else {
                turns.remove(0)
            }
        };

        if let MockTurn::Error(message) = &turn {
            anyhow::bail!("{message}");
        }

        let (event_tx, event_rx) = mpsc::channel(16);
        let (settle_tx, settle_rx) = oneshot::channel();
        tokio::spawn(async move {
            match turn {
                MockTurn::Text(text) => {
                    stream_text(&event_tx, &text).await;
                    let _ = settle_tx.send(Ok(()));
                }
                MockTurn::TextWithCalls(text, calls) => {
                    stream_text(&event_tx, &text).await;
                    for call in calls {
                        let _ = event_tx
                            .send(StreamEvent::ToolCallStart {
                                id: call.id.clone(),
                                name: call.name.clone(),
                            })
                            .await;
                        let _ = event_tx.send(StreamEvent::ToolCallEnd { call }).await;
                    }
                    let _ = settle_tx.send(Ok(()));
                }
                MockTurn::SettleError(message) => {
                    let _ = settle_tx.send(Err(anyhow::anyhow!("{message}")));
                }
                MockTurn::Error(_) => unreachable!(),
            }
        });

        Ok(ChatStream {
            events: event_rx,
            settle: settle_rx,
        })
    }
}

async fn stream_text(tx: &mpsc::Sender<StreamEvent>, text: &str) {
    if !text.is_empty() {
        let mut mid = text.len() / 2;
        while !text.is_char_boundary(mid) {
            mid -= 1;
        }
        let (a, b) = text.split_at(mid);
        for part in [a, b] {
            if !part.is_empty() {
                let _ = tx
                    .send(StreamEvent::TextDelta {
                        delta: part.to_string(),
                    })
                    .await;
            }
        }
    }
    let _ = tx
        .send(StreamEvent::TextEnd {
            content: text.to_string(),
        })
        .await;
}

/// A configurable fake tool.
pub struct MockTool {
    tool_name: String,
    tool_description: String,
    return_value: String,
    pub calls: Mutex<Vec<Value>>,
}

impl MockTool {
    pub fn new(name: &str, description: &str, return_value: &str) -> Self {
        Self {
            tool_name: name.to_string(),
            tool_description: description.to_string(),
            return_value: return_value.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.tool_description
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": true
        })
    }

    async fn call(&self, args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(args.clone());
        Ok(self.return_value.clone())
    }
}

/// A tool that fails every call.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        anyhow::bail!("deliberate failure")
    }
}

/// A tool that parks at a rendezvous so tests can interleave steering or
/// cancellation between tool calls deterministically.
pub struct GateTool {
    pub entered: Arc<tokio::sync::Notify>,
    pub release: Arc<tokio::sync::Notify>,
}

impl GateTool {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(tokio::sync::Notify::new()),
            release: Arc::new(tokio::sync::Notify::new()),
        }
    }
}

impl Default for GateTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for GateTool {
    fn name(&self) -> &str {
        "gate"
    }

    fn description(&self) -> &str {
        "Blocks until released (test only)"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: &Value, _cancel: &CancellationToken) -> anyhow::Result<String> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok("gate passed".to_string())
    }
}
